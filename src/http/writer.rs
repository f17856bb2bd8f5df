//! Response emission.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::Result;
use crate::http::parser::write_response_head;
use crate::http::request::Method;
use crate::http::response::Response;
use crate::io::AsyncWrite;

struct RequestInfo {
    method: Method,
    path: String,
    start: Instant,
}

/// Single-use response emitter.
///
/// `send` consumes the writer, so a response head can only ever be written
/// once per request; what comes back is a plain byte sink for the body. The
/// shared `sent` flag lets the connection driver distinguish "nothing on the
/// wire yet, an error page is still possible" from "head already sent, the
/// connection must be aborted".
pub struct ResponseWriter<W: AsyncWrite> {
    sink: W,
    sent: Arc<AtomicBool>,
    request: Option<RequestInfo>,
}

impl<W: AsyncWrite> ResponseWriter<W> {
    pub fn new(sink: W, sent: Arc<AtomicBool>) -> Self {
        ResponseWriter {
            sink,
            sent,
            request: None,
        }
    }

    /// Records the request this writer answers, for the completion log line.
    pub fn set_request(&mut self, method: Method, path: impl Into<String>) {
        self.request = Some(RequestInfo {
            method,
            path: path.into(),
            start: Instant::now(),
        });
    }

    /// Writes the response head and hands back the body sink. The head is
    /// flushed so header-only responses hit the wire without further writes.
    pub async fn send(mut self, response: Response) -> Result<BodyWriter<W>> {
        self.sent.store(true, Ordering::Release);
        write_response_head(&mut self.sink, &response).await?;
        self.sink.flush().await?;

        if let Some(info) = &self.request {
            tracing::info!(
                method = %info.method,
                path = %info.path,
                status = response.status.as_u16(),
                duration_ms = info.start.elapsed().as_millis() as u64,
                "request completed"
            );
        }

        Ok(BodyWriter { sink: self.sink })
    }
}

/// Body sink returned by [`ResponseWriter::send`].
pub struct BodyWriter<W: AsyncWrite> {
    sink: W,
}

impl<W: AsyncWrite> AsyncWrite for BodyWriter<W> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.sink.write(buf).await
    }

    async fn flush(&mut self) -> Result<()> {
        self.sink.flush().await
    }
}
