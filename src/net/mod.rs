//! Nonblocking sockets and pipes driven by the event loop.
//!
//! Every type here follows the same shape: attempt the syscall, and on
//! `EWOULDBLOCK` park on the reactor until the fd is ready again. Streams
//! split into independently owned read and write halves so duplex pumps can
//! run as separate tasks without sharing a stream.

pub mod tls;

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::io::{AsyncRead, AsyncWrite};
use crate::runtime::EventLoop;

pub use tls::{TlsAcceptor, TlsReadHalf, TlsStream, TlsWriteHalf};

/// An owned nonblocking fd bound to the event loop.
///
/// Reads and writes take `&self`: the fd itself is thread-safe, and the
/// one-waiter-per-direction rule in the loop keeps concurrent users of the
/// two directions from colliding.
pub struct AsyncFd {
    fd: OwnedFd,
    event_loop: Arc<EventLoop>,
    timeout: Option<Duration>,
}

impl AsyncFd {
    pub fn new(fd: OwnedFd, event_loop: Arc<EventLoop>, timeout: Option<Duration>) -> Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(AsyncFd {
            fd,
            event_loop,
            timeout,
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub async fn readable(&self) -> Result<()> {
        self.event_loop
            .wait_read(self.fd.as_raw_fd(), self.timeout)
            .await
    }

    pub async fn writable(&self) -> Result<()> {
        self.event_loop
            .wait_write(self.fd.as_raw_fd(), self.timeout)
            .await
    }

    /// Single nonblocking read attempt; `WouldBlock` surfaces to the caller.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let rc = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if rc >= 0 {
            Ok(rc as usize)
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Single nonblocking write attempt; `WouldBlock` surfaces to the caller.
    pub fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        let rc = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if rc >= 0 {
            Ok(rc as usize)
        } else {
            Err(io::Error::last_os_error())
        }
    }

    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.try_read(buf) {
                Ok(n) => return Ok(n),
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => self.readable().await?,
                    io::ErrorKind::Interrupted => {}
                    _ => return Err(err.into()),
                },
            }
        }
    }

    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        loop {
            match self.try_write(buf) {
                Ok(n) => return Ok(n),
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => self.writable().await?,
                    io::ErrorKind::Interrupted => {}
                    _ => return Err(err.into()),
                },
            }
        }
    }

    pub fn shutdown_write(&self) -> Result<()> {
        let rc = unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_WR) };
        if rc == -1 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error().into());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc == -1 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// A connected TCP stream on the event loop.
pub struct TcpStream {
    inner: Arc<AsyncFd>,
}

impl TcpStream {
    pub fn from_std(
        stream: std::net::TcpStream,
        event_loop: Arc<EventLoop>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        Ok(TcpStream {
            inner: Arc::new(AsyncFd::new(OwnedFd::from(stream), event_loop, timeout)?),
        })
    }

    /// Opens a connection to `host:port`. Name resolution uses the standard
    /// library resolver; the connect itself is nonblocking.
    pub async fn connect(
        event_loop: &Arc<EventLoop>,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<TcpStream> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::unknown(format!("no address found for {host}:{port}")))?;

        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let raw = unsafe {
            libc::socket(
                family,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if raw == -1 {
            return Err(io::Error::last_os_error().into());
        }
        let fd = unsafe { <OwnedFd as std::os::fd::FromRawFd>::from_raw_fd(raw) };

        let (storage, len) = sockaddr_from(&addr);
        let rc = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(err.into());
            }
            event_loop.wait_write(fd.as_raw_fd(), timeout).await?;

            let mut so_error: libc::c_int = 0;
            let mut so_len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            let rc = unsafe {
                libc::getsockopt(
                    fd.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    &mut so_error as *mut libc::c_int as *mut libc::c_void,
                    &mut so_len,
                )
            };
            if rc == -1 {
                return Err(io::Error::last_os_error().into());
            }
            if so_error != 0 {
                return Err(io::Error::from_raw_os_error(so_error).into());
            }
        }

        Ok(TcpStream {
            inner: Arc::new(AsyncFd {
                fd,
                event_loop: event_loop.clone(),
                timeout,
            }),
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.inner.raw_fd()
    }

    pub fn split(self) -> (TcpReadHalf, TcpWriteHalf) {
        (
            TcpReadHalf {
                inner: self.inner.clone(),
            },
            TcpWriteHalf { inner: self.inner },
        )
    }
}

impl AsyncRead for TcpStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf).await
    }
}

impl AsyncWrite for TcpStream {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.write(buf).await
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct TcpReadHalf {
    inner: Arc<AsyncFd>,
}

#[derive(Clone)]
pub struct TcpWriteHalf {
    inner: Arc<AsyncFd>,
}

impl TcpWriteHalf {
    pub fn shutdown_write(&self) -> Result<()> {
        self.inner.shutdown_write()
    }
}

impl AsyncRead for TcpReadHalf {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf).await
    }
}

impl AsyncWrite for TcpWriteHalf {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.write(buf).await
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in, sin)
            };
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6, sin6)
            };
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// A listening socket; `accept` parks on the reactor when no connection is
/// pending.
pub struct TcpListener {
    inner: std::net::TcpListener,
    event_loop: Arc<EventLoop>,
}

impl TcpListener {
    pub fn bind(addr: SocketAddr, event_loop: Arc<EventLoop>) -> Result<Self> {
        let inner = std::net::TcpListener::bind(addr)?;
        inner.set_nonblocking(true)?;
        Ok(TcpListener { inner, event_loop })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    pub async fn accept(&self, timeout: Option<Duration>) -> Result<(TcpStream, SocketAddr)> {
        loop {
            match self.inner.accept() {
                Ok((stream, peer)) => {
                    let stream = TcpStream::from_std(stream, self.event_loop.clone(), timeout)?;
                    return Ok((stream, peer));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.event_loop
                        .wait_read(self.inner.as_raw_fd(), None)
                        .await?;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Read end of a child process pipe.
pub struct PipeReader {
    inner: AsyncFd,
}

impl PipeReader {
    pub fn new(fd: OwnedFd, event_loop: Arc<EventLoop>, timeout: Option<Duration>) -> Result<Self> {
        Ok(PipeReader {
            inner: AsyncFd::new(fd, event_loop, timeout)?,
        })
    }
}

impl AsyncRead for PipeReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf).await
    }
}

/// Write end of a child process pipe; dropping it closes the fd, which is
/// how a CGI child learns its stdin is done.
pub struct PipeWriter {
    inner: AsyncFd,
}

impl PipeWriter {
    pub fn new(fd: OwnedFd, event_loop: Arc<EventLoop>, timeout: Option<Duration>) -> Result<Self> {
        Ok(PipeWriter {
            inner: AsyncFd::new(fd, event_loop, timeout)?,
        })
    }
}

impl AsyncWrite for PipeWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.write(buf).await
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A client connection, plain or TLS, as handed to the connection driver.
pub enum Stream {
    Tcp(TcpStream),
    Tls(TlsStream),
}

impl Stream {
    /// The server name from the TLS SNI extension, when there is one.
    pub fn server_name(&self) -> Option<&str> {
        match self {
            Stream::Tcp(_) => None,
            Stream::Tls(tls) => tls.server_name(),
        }
    }

    pub fn split(self) -> (ReadHalf, WriteHalf) {
        match self {
            Stream::Tcp(tcp) => {
                let (r, w) = tcp.split();
                (ReadHalf::Tcp(r), WriteHalf::Tcp(w))
            }
            Stream::Tls(tls) => {
                let (r, w) = tls.split();
                (ReadHalf::Tls(r), WriteHalf::Tls(w))
            }
        }
    }
}

pub enum ReadHalf {
    Tcp(TcpReadHalf),
    Tls(TlsReadHalf),
}

impl AsyncRead for ReadHalf {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            ReadHalf::Tcp(inner) => inner.read(buf).await,
            ReadHalf::Tls(inner) => inner.read(buf).await,
        }
    }
}

#[derive(Clone)]
pub enum WriteHalf {
    Tcp(TcpWriteHalf),
    Tls(TlsWriteHalf),
}

impl AsyncWrite for WriteHalf {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self {
            WriteHalf::Tcp(inner) => inner.write(buf).await,
            WriteHalf::Tls(inner) => inner.write(buf).await,
        }
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            WriteHalf::Tcp(inner) => inner.flush().await,
            WriteHalf::Tls(inner) => inner.flush().await,
        }
    }
}
