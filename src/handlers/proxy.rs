//! HTTP reverse-proxy handler.

use crate::error::{Error, Result};
use crate::http::parser::{parse_response, write_request_head};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::io::{pipe, AsyncWrite, BufReader, BufWriter};
use crate::net::TcpStream;

use super::cgi::tolerate_closed_backend;
use super::{ClientBody, ClientWriter, HandleContext};

/// Headers that describe the connection rather than the message and must
/// not be forwarded in either direction.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "Connection" | "Keep-Alive" | "Proxy-Connection" | "Transfer-Encoding" | "Upgrade"
    )
}

/// Forwards the request to the configured upstream. The client body is
/// pumped upstream (then the write side shut down) while the upstream
/// response head and body relay back to the client in parallel.
pub async fn handle_proxy(
    writer: ClientWriter,
    ctx: HandleContext,
    upstream: &str,
    body: ClientBody,
) -> Result<()> {
    let url = url::Url::parse(upstream)
        .map_err(|_| Error::InvalidArgument("invalid proxy upstream url"))?;
    let host = url
        .host_str()
        .ok_or(Error::InvalidArgument("proxy upstream has no host"))?
        .to_string();
    let port = url.port().unwrap_or(match url.scheme() {
        "https" => 443,
        _ => 80,
    });

    tracing::debug!(%host, port, "connecting to upstream");
    let stream = TcpStream::connect(ctx.handle.event_loop(), &host, port, None).await?;
    let (read_half, write_half) = stream.split();

    let mut outbound = Request::new(ctx.request.method, ctx.request.target.clone());
    outbound.headers = ctx.request.headers.clone();
    let host_header = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.clone(),
    };
    outbound.headers.insert("Host", host_header);
    let hop_by_hop: Vec<String> = outbound
        .headers
        .iter()
        .filter(|(name, _)| is_hop_by_hop(name))
        .map(|(name, _)| name.to_string())
        .collect();
    for name in hop_by_hop {
        outbound.headers.remove(&name);
    }
    outbound.headers.insert("Connection", "close");

    let mut upstream_writer = BufWriter::new(write_half.clone(), 8192);
    write_request_head(&mut upstream_writer, &outbound).await?;
    upstream_writer.flush().await?;

    let pump = ctx.handle.spawn(async move {
        let mut body = body;
        pipe(&mut body, &mut upstream_writer).await?;
        write_half.shutdown_write()?;
        Ok::<(), Error>(())
    });
    let relay = ctx.handle.spawn(async move {
        let mut upstream_reader = BufReader::new(read_half, 8192);
        let head = parse_response(&mut upstream_reader).await?;

        let mut response = Response::new(head.status);
        for (name, value) in head.headers.iter() {
            if !is_hop_by_hop(name) {
                response.headers.insert(name, value);
            }
        }
        let mut out = writer.send(response).await?;
        pipe(&mut upstream_reader, &mut out).await?;
        Ok::<(), Error>(())
    });

    let pump_result = pump.await;
    relay.await?;
    tolerate_closed_backend(pump_result)
}
