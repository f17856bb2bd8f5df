//! Incremental HTTP and CGI message parsing.
//!
//! All parsers read from a buffered stream and stop at the end of the header
//! block, leaving the body (if any) unread for the handler. Header limits
//! are enforced while parsing so an oversized message fails before it is
//! buffered whole.

use crate::error::{Error, Result};
use crate::http::header::{HeaderMap, MAX_HEADER_KEY_LENGTH, MAX_HEADER_VALUE_LENGTH};
use crate::http::request::{Method, Request, RequestTarget};
use crate::http::response::{Response, StatusCode};
use crate::io::{AsyncBufRead, AsyncWrite};

/// Cap on the request/status line, generous compared to header limits.
const MAX_START_LINE: usize = 8192;

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn valid_value(value: &str) -> bool {
    value
        .bytes()
        .all(|b| b == b'\t' || (b >= 0x20 && b != 0x7f))
}

/// Reads one line, stripping the terminator. `Ok(None)` means the stream
/// ended before any byte of a line arrived.
async fn read_line<R: AsyncBufRead>(
    reader: &mut R,
    max: usize,
    overflow: fn() -> Error,
    strict_crlf: bool,
) -> Result<Option<String>> {
    let mut line: Vec<u8> = Vec::new();
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            return Err(Error::BadRequest("stream ended inside a header block"));
        }
        match chunk.iter().position(|&b| b == b'\n') {
            Some(at) => {
                line.extend_from_slice(&chunk[..at]);
                reader.consume(at + 1);
                break;
            }
            None => {
                line.extend_from_slice(chunk);
                let n = chunk.len();
                reader.consume(n);
            }
        }
        if line.len() > max {
            return Err(overflow());
        }
    }
    if line.len() > max {
        return Err(overflow());
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    } else if strict_crlf {
        return Err(Error::BadRequest("line not terminated by CRLF"));
    }

    String::from_utf8(line).map(Some).map_err(|_| Error::BadRequest("non-utf8 header data"))
}

/// Parses a header block up to and including the empty terminator line.
/// Continuation lines (obs-fold) are folded into the previous value with a
/// single space.
async fn parse_header_block<R: AsyncBufRead>(reader: &mut R, strict_crlf: bool) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let mut pending: Option<(String, String)> = None;

    // Line cap leaves room for the separator and the CR before it is
    // stripped; the per-key and per-value limits are enforced after the
    // split.
    const MAX_HEADER_LINE: usize = MAX_HEADER_KEY_LENGTH + MAX_HEADER_VALUE_LENGTH + 8;

    loop {
        let line = read_line(reader, MAX_HEADER_LINE, || Error::HeaderTooLarge, strict_crlf)
            .await?
            .ok_or(Error::BadRequest("stream ended inside a header block"))?;

        if line.is_empty() {
            if let Some((key, value)) = pending.take() {
                headers.append(&key, &value)?;
            }
            return Ok(headers);
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            let Some((_, value)) = pending.as_mut() else {
                return Err(Error::BadRequest("continuation line without a header"));
            };
            let folded = line.trim();
            if !folded.is_empty() {
                if !value.is_empty() {
                    value.push(' ');
                }
                value.push_str(folded);
                if value.len() > MAX_HEADER_VALUE_LENGTH {
                    return Err(Error::HeaderTooLarge);
                }
            }
            continue;
        }

        if let Some((key, value)) = pending.take() {
            headers.append(&key, &value)?;
        }

        let (key, value) = line
            .split_once(':')
            .ok_or(Error::BadRequest("header line without a colon"))?;
        if key.is_empty() || !key.bytes().all(is_tchar) {
            return Err(Error::BadRequest("malformed header name"));
        }
        if key.len() > MAX_HEADER_KEY_LENGTH {
            return Err(Error::HeaderTooLarge);
        }
        let value = value.trim();
        if !valid_value(value) {
            return Err(Error::BadRequest("control character in header value"));
        }
        if value.len() > MAX_HEADER_VALUE_LENGTH {
            return Err(Error::HeaderTooLarge);
        }
        pending = Some((key.to_string(), value.to_string()));
    }
}

/// Parses a request head; the body is left on the stream.
pub async fn parse_request<R: AsyncBufRead>(reader: &mut R) -> Result<Request> {
    let line = read_line(reader, MAX_START_LINE, || Error::BadRequest("request line too long"), true)
        .await?
        .ok_or(Error::BadRequest("connection closed before a request"))?;

    let mut parts = line.split(' ');
    let method = parts.next().ok_or(Error::BadRequest("malformed request line"))?;
    let target = parts.next().ok_or(Error::BadRequest("malformed request line"))?;
    let version = parts.next().ok_or(Error::BadRequest("malformed request line"))?;
    if parts.next().is_some() {
        return Err(Error::BadRequest("malformed request line"));
    }

    let method = Method::from_str(method).ok_or(Error::BadRequest("unrecognized method"))?;
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(Error::BadRequest("unsupported http version"));
    }

    let headers = parse_header_block(reader, true).await?;

    Ok(Request {
        method,
        target: RequestTarget::parse(target),
        version: version.to_string(),
        headers,
    })
}

/// Parses a response head, as received from a proxied upstream.
pub async fn parse_response<R: AsyncBufRead>(reader: &mut R) -> Result<Response> {
    let line = read_line(reader, MAX_START_LINE, || Error::BadRequest("status line too long"), true)
        .await?
        .ok_or(Error::BadRequest("connection closed before a response"))?;

    let mut parts = line.splitn(3, ' ');
    let version = parts.next().ok_or(Error::BadRequest("malformed status line"))?;
    if !version.starts_with("HTTP/") {
        return Err(Error::BadRequest("malformed status line"));
    }
    let code: u16 = parts
        .next()
        .ok_or(Error::BadRequest("malformed status line"))?
        .parse()
        .map_err(|_| Error::BadRequest("malformed status code"))?;
    // The reason phrase is optional and ignored.

    let headers = parse_header_block(reader, true).await?;

    Ok(Response {
        status: StatusCode(code),
        headers,
    })
}

/// Parses a CGI-style header block: same shape as HTTP headers but commonly
/// emitted with bare LF line endings, which are tolerated here. Parse errors
/// are the backend's fault, not the client's, and map accordingly.
pub async fn parse_cgi<R: AsyncBufRead>(reader: &mut R) -> Result<HeaderMap> {
    parse_header_block(reader, false).await.map_err(|err| match err {
        Error::BadRequest(msg) => Error::unknown(format!("malformed cgi response: {msg}")),
        other => other,
    })
}

/// Serializes a request head, CRLF-terminated, ready for an upstream.
pub async fn write_request_head<W: AsyncWrite>(writer: &mut W, request: &Request) -> Result<()> {
    let mut head = format!("{} {} {}\r\n", request.method, request.target, request.version);
    for (key, value) in request.headers.iter() {
        head.push_str(key);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    writer.write_all(head.as_bytes()).await
}

/// Serializes a response head.
pub async fn write_response_head<W: AsyncWrite>(writer: &mut W, response: &Response) -> Result<()> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status.as_u16(),
        response.status.reason_phrase()
    );
    for (key, value) in response.headers.iter() {
        head.push_str(key);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    writer.write_all(head.as_bytes()).await
}
