//! Byte-budgeted input stream.

use super::{AsyncBufRead, AsyncRead};
use crate::error::Result;

/// Wraps an upstream reader and reports end of stream once `limit` bytes
/// have been delivered. A budget of zero is immediate end of stream.
///
/// Used to cap a request body at its `Content-Length` so a handler can
/// never read into the next message.
pub struct LimitedReader<R> {
    inner: R,
    remaining: u64,
}

impl<R> LimitedReader<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        LimitedReader {
            inner,
            remaining: limit,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead> AsyncRead for LimitedReader<R> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let cap = (buf.len() as u64).min(self.remaining) as usize;
        let n = self.inner.read(&mut buf[..cap]).await?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

impl<R: AsyncBufRead> AsyncBufRead for LimitedReader<R> {
    async fn fill_buf(&mut self) -> Result<&[u8]> {
        if self.remaining == 0 {
            return Ok(&[]);
        }
        let remaining = self.remaining;
        let chunk = self.inner.fill_buf().await?;
        let cap = (chunk.len() as u64).min(remaining) as usize;
        Ok(&chunk[..cap])
    }

    fn consume(&mut self, n: usize) {
        let n = (n as u64).min(self.remaining) as usize;
        self.remaining -= n as u64;
        self.inner.consume(n);
    }
}
