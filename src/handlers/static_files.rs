//! Static file serving.

use std::path::PathBuf;

use crate::error::Result;
use crate::http::mime;
use crate::http::response::{Response, StatusCode};
use crate::io::{pipe, AsyncRead, AsyncWrite, BufReader};

use super::{ClientWriter, HandleContext};

const NOT_FOUND_PAGE: &[u8] = b"<!DOCTYPE html>\n<html>\n<head><title>404 Not Found</title></head>\n<body>\n<h1>404 Not Found</h1>\n<p>The requested resource could not be found.</p>\n</body>\n</html>\n";

/// A regular file exposed through the async read trait. File reads are
/// short blocking operations and run directly on the executor, the same
/// trade the rest of the request path makes for filesystem work.
struct FileReader(std::fs::File);

impl AsyncRead for FileReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(std::io::Read::read(&mut self.0, buf)?)
    }
}

/// Serves the first try-files candidate that is an openable regular file,
/// or a local 404 page when none is.
pub async fn handle_static(
    writer: ClientWriter,
    _ctx: &HandleContext,
    try_files: &[PathBuf],
) -> Result<()> {
    for path in try_files {
        if !path.is_file() {
            continue;
        }
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "candidate not readable");
                continue;
            }
        };

        tracing::debug!(path = %path.display(), "serving static file");
        let response = Response::new(StatusCode::OK)
            .with_header("Content-Type", mime::content_type(&path.to_string_lossy()));
        let mut body = writer.send(response).await?;
        let mut reader = BufReader::new(FileReader(file), 8192);
        pipe(&mut reader, &mut body).await?;
        return Ok(());
    }

    let response = Response::new(StatusCode::NOT_FOUND)
        .with_header("Content-Type", "text/html")
        .with_header("Content-Length", NOT_FOUND_PAGE.len().to_string());
    let mut body = writer.send(response).await?;
    body.write_all(NOT_FOUND_PAGE).await?;
    body.flush().await
}
