//! The per-connection driver.
//!
//! Each accepted connection runs the pipeline once: parse the request head,
//! normalize and route the path, cap the body at its `Content-Length`, and
//! dispatch to the matched handler. Errors map to an error response while
//! nothing has been sent; once the response head is on the wire the only
//! remaining option is to abort the connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::filter::normalize_path;
use crate::handlers::cgi::CgiBackend;
use crate::handlers::{self, build_try_files, ClientBody, ClientWriter, HandleContext};
use crate::http::parser::parse_request;
use crate::http::response::{Response, StatusCode};
use crate::http::writer::ResponseWriter;
use crate::io::{AsyncWrite, BufReader, BufWriter, LimitedReader};
use crate::net::Stream;
use crate::runtime::Handle;
use crate::server::Server;
use crate::config::HandlerConfig;

const BUFFER_SIZE: usize = 8192;

/// Runs one request/response exchange on an accepted connection, then
/// closes it.
pub async fn handle(server: Arc<Server>, handle: Handle, stream: Stream) -> Result<()> {
    let server_name = stream.server_name().map(str::to_string);
    let (read_half, write_half) = stream.split();
    let reader = BufReader::new(read_half, BUFFER_SIZE);
    let sent = Arc::new(AtomicBool::new(false));
    let writer = ResponseWriter::new(BufWriter::new(write_half.clone(), BUFFER_SIZE), sent.clone());

    match drive(&server, &handle, reader, writer, server_name.as_deref()).await {
        Ok(()) => Ok(()),
        Err(err) => {
            if sent.load(Ordering::Acquire) {
                tracing::warn!(error = %err, "aborting connection after response started");
                return Err(err);
            }
            let status = match &err {
                Error::BadRequest(_) => StatusCode::BAD_REQUEST,
                Error::HeaderTooLarge => StatusCode::HEADER_FIELDS_TOO_LARGE,
                Error::NotFound => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            tracing::warn!(error = %err, status = status.as_u16(), "request failed");

            let body = format!("{} {}\n", status.as_u16(), status.reason_phrase());
            let response = Response::new(status)
                .with_header("Content-Type", "text/plain")
                .with_header("Content-Length", body.len().to_string());
            let emergency = ResponseWriter::new(BufWriter::new(write_half, 512), sent);
            let mut out = emergency.send(response).await?;
            out.write_all(body.as_bytes()).await?;
            out.flush().await
        }
    }
}

async fn drive(
    server: &Arc<Server>,
    handle: &Handle,
    mut reader: BufReader<crate::net::ReadHalf>,
    mut writer: ClientWriter,
    server_name: Option<&str>,
) -> Result<()> {
    let request = parse_request(&mut reader).await?;
    tracing::debug!(method = %request.method, target = %request.target, "received request");
    writer.set_request(request.method, request.target.to_string());

    let path = request
        .target
        .path()
        .ok_or(Error::BadRequest("request target is not origin-form"))?;
    let trailing_slash = path.ends_with('/');
    let normalized = normalize_path(path)?;

    let filter = server
        .find_filter(server_name, &request, &normalized)
        .ok_or(Error::NotFound)?;
    let handler = filter.handler().ok_or(Error::NotFound)?.clone();
    let residual = normalized[filter.match_count().min(normalized.len())..].to_vec();

    let content_length = match request.header("Content-Length") {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map_err(|_| Error::BadRequest("invalid content-length"))?,
        None => 0,
    };
    let body = LimitedReader::new(reader, content_length);

    let path_info = path.to_string();
    let query = request.target.query().map(str::to_string);
    let ctx = HandleContext {
        handle: handle.clone(),
        request,
        residual,
        trailing_slash,
        path_info,
        query,
    };

    dispatch(writer, ctx, handler, body).await
}

async fn dispatch(
    writer: ClientWriter,
    ctx: HandleContext,
    handler: HandlerConfig,
    body: ClientBody,
) -> Result<()> {
    match handler {
        HandlerConfig::Static {
            root,
            index,
            try_files,
        } => {
            let candidates = build_try_files(&root, index.as_deref(), &try_files, &ctx);
            handlers::static_files::handle_static(writer, &ctx, &candidates).await
        }
        HandlerConfig::Cgi {
            command,
            root,
            index,
            try_files,
        } => {
            let candidates = build_try_files(&root, index.as_deref(), &try_files, &ctx);
            handlers::cgi::handle_cgi(writer, ctx, CgiBackend::Command(command), candidates, body)
                .await
        }
        HandlerConfig::Fastcgi {
            address,
            root,
            index,
            try_files,
        } => {
            let candidates = build_try_files(&root, index.as_deref(), &try_files, &ctx);
            handlers::cgi::handle_cgi(writer, ctx, CgiBackend::FastCgi(address), candidates, body)
                .await
        }
        HandlerConfig::Proxy { upstream } => {
            handlers::proxy::handle_proxy(writer, ctx, &upstream, body).await
        }
        HandlerConfig::Redirect { code, target } => {
            handlers::redirect::handle_redirect(writer, &ctx, code, &target).await
        }
    }
}
