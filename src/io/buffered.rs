//! Buffered stream adapters with user-sized buffers.

use bytes::BytesMut;

use super::{AsyncBufRead, AsyncRead, AsyncWrite};
use crate::error::Result;

/// Buffers an upstream reader.
pub struct BufReader<R> {
    inner: R,
    buf: Box<[u8]>,
    pos: usize,
    filled: usize,
}

impl<R: AsyncRead> BufReader<R> {
    pub fn new(inner: R, capacity: usize) -> Self {
        BufReader {
            inner,
            buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
            pos: 0,
            filled: 0,
        }
    }

    /// Unwraps the reader, discarding any buffered bytes.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead> AsyncRead for BufReader<R> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        // Large reads bypass the buffer once it is empty.
        if self.pos >= self.filled && buf.len() >= self.buf.len() {
            return self.inner.read(buf).await;
        }
        let available = self.fill_buf().await?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl<R: AsyncRead> AsyncBufRead for BufReader<R> {
    async fn fill_buf(&mut self) -> Result<&[u8]> {
        if self.pos >= self.filled {
            self.pos = 0;
            self.filled = self.inner.read(&mut self.buf).await?;
        }
        Ok(&self.buf[self.pos..self.filled])
    }

    fn consume(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.filled);
    }
}

/// Buffers writes to a downstream sink, flushing whenever the buffer fills.
pub struct BufWriter<W> {
    inner: W,
    buf: BytesMut,
    capacity: usize,
}

impl<W: AsyncWrite> BufWriter<W> {
    pub fn new(inner: W, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        BufWriter {
            inner,
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    async fn flush_buf(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            let buf = self.buf.split();
            self.inner.write_all(&buf).await?;
        }
        Ok(())
    }

    /// Flushes and unwraps the sink.
    pub async fn into_inner(mut self) -> Result<W> {
        self.flush_buf().await?;
        Ok(self.inner)
    }
}

impl<W: AsyncWrite> AsyncWrite for BufWriter<W> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.buf.len() + buf.len() > self.capacity {
            self.flush_buf().await?;
        }
        if buf.len() >= self.capacity {
            self.inner.write_all(buf).await?;
        } else {
            self.buf.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<()> {
        self.flush_buf().await?;
        self.inner.flush().await
    }
}
