//! FastCGI 1.0 client.
//!
//! One request per connection, role RESPONDER. The write side carries the
//! BEGIN_REQUEST record, the PARAMS name-value stream and the STDIN stream;
//! the read side demultiplexes STDOUT (handed to the response parser as a
//! plain byte stream), STDERR (forwarded to the log) and END_REQUEST.

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::io::{pipe, read_exact, AsyncRead, AsyncWrite, BufReader};
use crate::net::{TcpReadHalf, TcpStream, TcpWriteHalf};
use crate::runtime::Handle;

use super::cgi::{respond_cgi, tolerate_closed_backend};
use super::{ClientBody, ClientWriter};

const FCGI_VERSION_1: u8 = 1;

const FCGI_BEGIN_REQUEST: u8 = 1;
const FCGI_END_REQUEST: u8 = 3;
const FCGI_PARAMS: u8 = 4;
const FCGI_STDIN: u8 = 5;
const FCGI_STDOUT: u8 = 6;
const FCGI_STDERR: u8 = 7;

const FCGI_RESPONDER: u16 = 1;

/// Largest payload carried in one record; kept 8-byte aligned under the
/// u16 framing limit.
const MAX_RECORD_PAYLOAD: usize = 0xFFF8;

/// One record header on the wire, 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub rtype: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    pub fn encode(&self) -> [u8; 8] {
        [
            FCGI_VERSION_1,
            self.rtype,
            (self.request_id >> 8) as u8,
            self.request_id as u8,
            (self.content_length >> 8) as u8,
            self.content_length as u8,
            self.padding_length,
            0,
        ]
    }

    pub fn decode(bytes: [u8; 8]) -> Result<RecordHeader> {
        if bytes[0] != FCGI_VERSION_1 {
            return Err(Error::unknown(format!(
                "unsupported fastcgi version {}",
                bytes[0]
            )));
        }
        Ok(RecordHeader {
            rtype: bytes[1],
            request_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            content_length: u16::from_be_bytes([bytes[4], bytes[5]]),
            padding_length: bytes[6],
        })
    }
}

/// Appends one PARAMS name-value pair: lengths below 128 take a single
/// byte, anything larger a four-byte big-endian length with the high bit
/// set.
pub fn encode_name_value(out: &mut BytesMut, name: &str, value: &str) {
    for len in [name.len(), value.len()] {
        if len < 128 {
            out.put_u8(len as u8);
        } else {
            out.put_u32(len as u32 | 0x8000_0000);
        }
    }
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(value.as_bytes());
}

async fn write_record<W: AsyncWrite>(
    writer: &mut W,
    request_id: u16,
    rtype: u8,
    data: &[u8],
) -> Result<()> {
    debug_assert!(data.len() <= u16::MAX as usize);
    let header = RecordHeader {
        rtype,
        request_id,
        content_length: data.len() as u16,
        padding_length: 0,
    };
    writer.write_all(&header.encode()).await?;
    writer.write_all(data).await
}

/// A connected FastCGI backend with BEGIN_REQUEST already sent.
pub struct FcgiClient {
    reader: BufReader<TcpReadHalf>,
    writer: TcpWriteHalf,
    request_id: u16,
}

impl FcgiClient {
    pub async fn connect(handle: &Handle, address: &str) -> Result<FcgiClient> {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or(Error::InvalidArgument("fastcgi address must be host:port"))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidArgument("invalid fastcgi port"))?;

        let stream = TcpStream::connect(handle.event_loop(), host, port, None).await?;
        let (read_half, write_half) = stream.split();
        let mut client = FcgiClient {
            reader: BufReader::new(read_half, 8192),
            writer: write_half,
            request_id: 1,
        };

        // role + flags + 5 reserved bytes
        let mut body = [0u8; 8];
        body[..2].copy_from_slice(&FCGI_RESPONDER.to_be_bytes());
        write_record(&mut client.writer, client.request_id, FCGI_BEGIN_REQUEST, &body).await?;

        Ok(client)
    }

    /// Sends the whole PARAMS stream, terminator record included.
    pub async fn send_params(&mut self, params: &[(String, String)]) -> Result<()> {
        let mut encoded = BytesMut::new();
        for (name, value) in params {
            encode_name_value(&mut encoded, name, value);
        }
        for chunk in encoded.chunks(MAX_RECORD_PAYLOAD) {
            write_record(&mut self.writer, self.request_id, FCGI_PARAMS, chunk).await?;
        }
        write_record(&mut self.writer, self.request_id, FCGI_PARAMS, &[]).await
    }

    /// Splits into the STDIN sink and the demultiplexed STDOUT source.
    pub fn split(self) -> (FcgiStdin, FcgiStdout) {
        (
            FcgiStdin {
                writer: self.writer,
                request_id: self.request_id,
            },
            FcgiStdout {
                reader: self.reader,
                request_id: self.request_id,
                remaining: 0,
                padding: 0,
                stdout_closed: false,
                ended: false,
            },
        )
    }
}

/// STDIN stream sink; every write becomes one record. Call
/// [`FcgiStdin::finish`] to send the empty terminator record.
pub struct FcgiStdin {
    writer: TcpWriteHalf,
    request_id: u16,
}

impl FcgiStdin {
    pub async fn finish(mut self) -> Result<()> {
        write_record(&mut self.writer, self.request_id, FCGI_STDIN, &[]).await
    }
}

impl AsyncWrite for FcgiStdin {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let chunk = &buf[..buf.len().min(MAX_RECORD_PAYLOAD)];
        write_record(&mut self.writer, self.request_id, FCGI_STDIN, chunk).await?;
        Ok(chunk.len())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The backend's STDOUT as a plain byte stream.
///
/// STDERR records encountered along the way go to the log; END_REQUEST (or
/// a zero-length STDOUT record) is end of stream.
pub struct FcgiStdout {
    reader: BufReader<TcpReadHalf>,
    request_id: u16,
    remaining: usize,
    padding: usize,
    stdout_closed: bool,
    ended: bool,
}

impl FcgiStdout {
    async fn next_record(&mut self) -> Result<()> {
        let mut head = [0u8; 8];
        read_exact(&mut self.reader, &mut head).await?;
        let header = RecordHeader::decode(head)?;
        if header.request_id != 0 && header.request_id != self.request_id {
            return Err(Error::unknown("fastcgi response for an unknown request id"));
        }

        let length = header.content_length as usize;
        match header.rtype {
            FCGI_STDOUT if length == 0 => {
                self.stdout_closed = true;
                self.skip(header.padding_length as usize).await?;
            }
            FCGI_STDOUT => {
                self.remaining = length;
                self.padding = header.padding_length as usize;
            }
            FCGI_STDERR => {
                let mut data = vec![0u8; length];
                read_exact(&mut self.reader, &mut data).await?;
                self.skip(header.padding_length as usize).await?;
                if !data.is_empty() {
                    tracing::warn!(stderr = %String::from_utf8_lossy(&data), "fastcgi backend stderr");
                }
            }
            FCGI_END_REQUEST => {
                self.skip(length + header.padding_length as usize).await?;
                self.ended = true;
            }
            other => {
                tracing::trace!(rtype = other, "skipping unexpected fastcgi record");
                self.skip(length + header.padding_length as usize).await?;
            }
        }
        Ok(())
    }

    async fn skip(&mut self, mut n: usize) -> Result<()> {
        let mut scratch = [0u8; 256];
        while n > 0 {
            let take = n.min(scratch.len());
            read_exact(&mut self.reader, &mut scratch[..take]).await?;
            n -= take;
        }
        Ok(())
    }

    /// Consumes remaining records through END_REQUEST, leaving the
    /// connection fully drained.
    pub async fn drain(&mut self) -> Result<()> {
        while !self.ended {
            if self.remaining > 0 {
                let pending = self.remaining + self.padding;
                self.remaining = 0;
                self.padding = 0;
                self.skip(pending).await?;
            } else {
                self.next_record().await?;
            }
        }
        Ok(())
    }
}

impl AsyncRead for FcgiStdout {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if self.remaining > 0 {
                let take = buf.len().min(self.remaining);
                let got = self.reader.read(&mut buf[..take]).await?;
                if got == 0 {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "fastcgi stream ended mid-record",
                    )));
                }
                self.remaining -= got;
                if self.remaining == 0 {
                    let padding = self.padding;
                    self.padding = 0;
                    self.skip(padding).await?;
                }
                return Ok(got);
            }
            if self.stdout_closed || self.ended {
                return Ok(0);
            }
            self.next_record().await?;
        }
    }
}

/// One FastCGI pass of the try-files loop: params, concurrent body pump and
/// response parse, then a full drain of the record stream.
pub async fn run_fastcgi(
    handle: &Handle,
    address: &str,
    params: Vec<(String, String)>,
    body: Option<ClientBody>,
    writer: ClientWriter,
    is_last: bool,
) -> Result<Option<ClientWriter>> {
    let mut client = FcgiClient::connect(handle, address).await?;
    client.send_params(&params).await?;
    let (mut stdin, stdout) = client.split();

    let pump = handle.spawn(async move {
        if let Some(mut body) = body {
            pipe(&mut body, &mut stdin).await?;
        }
        stdin.finish().await
    });
    let respond = handle.spawn(async move {
        let mut reader = BufReader::new(stdout, 8192);
        let outcome = respond_cgi(&mut reader, writer, is_last).await?;
        reader.into_inner().drain().await?;
        Ok::<_, Error>(outcome)
    });

    let pump_result = pump.await;
    let outcome = respond.await?;
    tolerate_closed_backend(pump_result)?;

    Ok(outcome)
}
