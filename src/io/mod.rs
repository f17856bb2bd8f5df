//! Asynchronous byte-stream primitives.
//!
//! Streams are single-owner: a stream is never used by two tasks at once.
//! Handlers that need duplex behavior split a connection into read and write
//! halves and hand each half to its own task.

pub mod buffered;
pub mod limited;

pub use buffered::{BufReader, BufWriter};
pub use limited::LimitedReader;

use crate::error::Result;

/// An asynchronous byte source. `Ok(0)` means end of stream.
pub trait AsyncRead {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// An asynchronous byte sink.
pub trait AsyncWrite {
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;

    async fn flush(&mut self) -> Result<()>;

    async fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(crate::error::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "stream closed while writing",
                )));
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}

/// A source with an internal buffer exposed for zero-copy consumption.
///
/// `fill_buf` returns the buffered bytes, reading more only when the buffer
/// is empty; an empty slice signals end of stream. `consume(n)` marks `n`
/// bytes as read.
pub trait AsyncBufRead: AsyncRead {
    async fn fill_buf(&mut self) -> Result<&[u8]>;

    fn consume(&mut self, n: usize);
}

// In-memory endpoints, mostly useful in tests and as pipe sources/sinks.

impl AsyncRead for &[u8] {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let this = *self;
        let n = this.len().min(buf.len());
        buf[..n].copy_from_slice(&this[..n]);
        *self = &this[n..];
        Ok(n)
    }
}

impl AsyncBufRead for &[u8] {
    async fn fill_buf(&mut self) -> Result<&[u8]> {
        Ok(*self)
    }

    fn consume(&mut self, n: usize) {
        let this = *self;
        *self = &this[n.min(this.len())..];
    }
}

impl AsyncWrite for Vec<u8> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Fills `buf` completely or fails with an unexpected-EOF error.
pub async fn read_exact<R: AsyncRead>(reader: &mut R, mut buf: &mut [u8]) -> Result<()> {
    while !buf.is_empty() {
        let n = reader.read(buf).await?;
        if n == 0 {
            return Err(crate::error::Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended mid-read",
            )));
        }
        let rest = buf;
        buf = &mut rest[n..];
    }
    Ok(())
}

/// Copies `reader` into `writer` until end of stream, then flushes.
/// Returns the number of bytes copied.
pub async fn pipe<R, W>(reader: &mut R, writer: &mut W) -> Result<u64>
where
    R: AsyncBufRead,
    W: AsyncWrite,
{
    let mut total = 0u64;
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            break;
        }
        let n = chunk.len();
        writer.write_all(chunk).await?;
        reader.consume(n);
        total += n as u64;
    }
    writer.flush().await?;
    Ok(total)
}
