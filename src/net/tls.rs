//! TLS termination.
//!
//! rustls does the record layer; this module only moves ciphertext between
//! the nonblocking socket and the `ServerConnection`, parking on the reactor
//! whenever the socket would block. SNI dispatch is a certificate resolver:
//! one certificate per configured server name, picked during the hello.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ResolvesServerCertUsingSni;
use rustls::sign::CertifiedKey;
use rustls::{ServerConfig, ServerConnection};

use super::{AsyncFd, TcpStream};
use crate::config::SslConfig;
use crate::error::{Error, Result};
use crate::io::{AsyncRead, AsyncWrite};

fn tls_err(err: rustls::Error) -> Error {
    Error::unknown(format!("tls: {err}"))
}

/// Builds TLS server state from the configured certificate contexts.
///
/// One context under the empty server-name key means TLS without SNI;
/// several named contexts mean SNI dispatch.
pub struct TlsAcceptor {
    config: Arc<ServerConfig>,
}

impl TlsAcceptor {
    pub fn new(contexts: &HashMap<String, SslConfig>) -> Result<TlsAcceptor> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(tls_err)?
            .with_no_client_auth();

        let config = if contexts.len() == 1 && contexts.contains_key("") {
            let ssl = &contexts[""];
            let (certs, key) = load_pem(ssl)?;
            builder.with_single_cert(certs, key).map_err(tls_err)?
        } else {
            let mut resolver = ResolvesServerCertUsingSni::new();
            for (name, ssl) in contexts {
                let (certs, key) = load_pem(ssl)?;
                let signing_key =
                    rustls::crypto::ring::sign::any_supported_type(&key).map_err(tls_err)?;
                resolver
                    .add(name, CertifiedKey::new(certs, signing_key))
                    .map_err(tls_err)?;
            }
            builder.with_cert_resolver(Arc::new(resolver))
        };

        Ok(TlsAcceptor {
            config: Arc::new(config),
        })
    }

    /// Runs the handshake and returns the wrapped stream.
    pub async fn accept(&self, stream: TcpStream) -> Result<TlsStream> {
        let conn = ServerConnection::new(self.config.clone()).map_err(tls_err)?;
        let shared = Arc::new(TlsShared {
            conn: Mutex::new(conn),
            sock: stream.inner,
        });
        shared.handshake().await?;
        let server_name = {
            let conn = shared.conn.lock().unwrap();
            conn.server_name().map(str::to_string)
        };
        tracing::debug!(server_name = ?server_name, "tls handshake complete");
        Ok(TlsStream {
            shared,
            server_name,
        })
    }
}

fn load_pem(ssl: &SslConfig) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut cert_reader = io::BufReader::new(std::fs::File::open(&ssl.cert)?);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<io::Result<Vec<_>>>()?;

    let mut key_reader = io::BufReader::new(std::fs::File::open(&ssl.key)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| Error::unknown(format!("no private key in {}", ssl.key.display())))?;

    Ok((certs, key))
}

struct TlsShared {
    conn: Mutex<ServerConnection>,
    sock: Arc<AsyncFd>,
}

/// Adapts the nonblocking fd to the blocking-style `io` traits rustls
/// expects; `EWOULDBLOCK` surfaces as `ErrorKind::WouldBlock` and is handled
/// by the async wrappers.
struct FdIo<'a>(&'a AsyncFd);

impl io::Read for FdIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl io::Write for FdIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl TlsShared {
    /// Drives the handshake to completion. The lock is never held across a
    /// reactor await.
    async fn handshake(&self) -> Result<()> {
        loop {
            let action = {
                let conn = self.conn.lock().unwrap();
                if conn.wants_write() {
                    Action::Write
                } else if !conn.is_handshaking() {
                    return Ok(());
                } else if conn.wants_read() {
                    Action::Read
                } else {
                    return Ok(());
                }
            };
            match action {
                Action::Write => self.flush_tls().await?,
                Action::Read => {
                    if self.pump_ciphertext().await? == 0 {
                        return Err(Error::unknown("connection closed during tls handshake"));
                    }
                }
            }
        }
    }

    /// Reads one round of ciphertext into the connection, awaiting socket
    /// readability as needed. Returns the number of ciphertext bytes read.
    async fn pump_ciphertext(&self) -> Result<usize> {
        loop {
            {
                let mut conn = self.conn.lock().unwrap();
                match conn.read_tls(&mut FdIo(&self.sock)) {
                    Ok(n) => {
                        conn.process_new_packets().map_err(tls_err)?;
                        // Opportunistically push out any alerts or tickets.
                        while conn.wants_write() {
                            match conn.write_tls(&mut FdIo(&self.sock)) {
                                Ok(0) | Err(_) => break,
                                Ok(_) => {}
                            }
                        }
                        return Ok(n);
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => return Err(err.into()),
                }
            }
            self.sock.readable().await?;
        }
    }

    async fn read_plain(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            {
                let mut conn = self.conn.lock().unwrap();
                match io::Read::read(&mut conn.reader(), buf) {
                    Ok(n) => return Ok(n),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    // Peer closed without close_notify; treat as end of stream.
                    Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                    Err(err) => return Err(err.into()),
                }
            }
            if self.pump_ciphertext().await? == 0 {
                return Ok(0);
            }
        }
    }

    async fn write_plain(&self, buf: &[u8]) -> Result<usize> {
        let n = {
            let mut conn = self.conn.lock().unwrap();
            io::Write::write(&mut conn.writer(), buf)?
        };
        self.flush_tls().await?;
        Ok(n)
    }

    async fn flush_tls(&self) -> Result<()> {
        loop {
            let blocked = {
                let mut conn = self.conn.lock().unwrap();
                if !conn.wants_write() {
                    return Ok(());
                }
                match conn.write_tls(&mut FdIo(&self.sock)) {
                    Ok(_) => false,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => true,
                    Err(err) => return Err(err.into()),
                }
            };
            if blocked {
                self.sock.writable().await?;
            }
        }
    }
}

enum Action {
    Read,
    Write,
}

/// A TLS-wrapped client connection.
pub struct TlsStream {
    shared: Arc<TlsShared>,
    server_name: Option<String>,
}

impl TlsStream {
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn split(self) -> (TlsReadHalf, TlsWriteHalf) {
        (
            TlsReadHalf {
                shared: self.shared.clone(),
            },
            TlsWriteHalf {
                shared: self.shared,
            },
        )
    }
}

impl AsyncRead for TlsStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.shared.read_plain(buf).await
    }
}

impl AsyncWrite for TlsStream {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.shared.write_plain(buf).await
    }

    async fn flush(&mut self) -> Result<()> {
        self.shared.flush_tls().await
    }
}

pub struct TlsReadHalf {
    shared: Arc<TlsShared>,
}

#[derive(Clone)]
pub struct TlsWriteHalf {
    shared: Arc<TlsShared>,
}

impl AsyncRead for TlsReadHalf {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.shared.read_plain(buf).await
    }
}

impl AsyncWrite for TlsWriteHalf {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.shared.write_plain(buf).await
    }

    async fn flush(&mut self) -> Result<()> {
        self.shared.flush_tls().await
    }
}
