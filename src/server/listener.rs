//! The accept loop: one task per listening address, one spawned task per
//! accepted connection.

use std::sync::Arc;

use crate::error::Result;
use crate::http::connection;
use crate::net::{Stream, TcpListener};
use crate::runtime::Handle;
use crate::server::Server;

pub async fn run(server: Arc<Server>, handle: Handle) -> Result<()> {
    let listener = TcpListener::bind(server.addr, handle.event_loop().clone())?;
    tracing::info!(addr = %server.addr, tls = server.tls().is_some(), "listening");

    loop {
        let (socket, peer) = listener.accept(server.io_timeout()).await?;
        tracing::debug!(%peer, "accepted connection");

        let server = server.clone();
        let task_handle = handle.clone();
        handle.spawn(async move {
            let stream = match server.tls() {
                Some(acceptor) => match acceptor.accept(socket).await {
                    Ok(tls) => Stream::Tls(tls),
                    Err(err) => {
                        tracing::warn!(%peer, error = %err, "tls handshake failed");
                        return;
                    }
                },
                None => Stream::Tcp(socket),
            };
            if let Err(err) = connection::handle(server, task_handle, stream).await {
                tracing::warn!(%peer, error = %err, "connection error");
            }
        });
    }
}
