//! Per-address servers assembled from the configuration tree.
//!
//! Server blocks sharing a listen address merge into one [`Server`]: each
//! block contributes a top-level filter (carrying its server names) and,
//! when TLS is configured, a certificate context keyed by server name.

pub mod listener;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, SslConfig};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::http::request::Request;
use crate::net::TlsAcceptor;

/// One listening address with its routing tree and optional TLS contexts.
pub struct Server {
    pub addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    filters: Vec<Filter>,
    io_timeout: Option<Duration>,
}

impl Server {
    /// Builds one server per distinct listen address in the configuration.
    pub fn build_all(config: &Config) -> Result<Vec<Arc<Server>>> {
        struct Pending {
            filters: Vec<Filter>,
            contexts: HashMap<String, SslConfig>,
        }

        let io_timeout = config.io_timeout_ms.map(Duration::from_millis);
        let mut by_addr: Vec<(SocketAddr, Pending)> = Vec::new();

        for server_config in &config.servers {
            for address in &server_config.listen {
                let addr: SocketAddr = address
                    .parse()
                    .map_err(|_| Error::unknown(format!("unparseable listen address {address:?}")))?;

                let index = match by_addr.iter().position(|(existing, _)| *existing == addr) {
                    Some(index) => index,
                    None => {
                        by_addr.push((
                            addr,
                            Pending {
                                filters: Vec::new(),
                                contexts: HashMap::new(),
                            },
                        ));
                        by_addr.len() - 1
                    }
                };
                let pending = &mut by_addr[index].1;

                pending.filters.push(Filter::from_server(server_config)?);
                if let Some(ssl) = &server_config.ssl {
                    if server_config.server_names.is_empty() {
                        // The empty key is the no-SNI context.
                        pending.contexts.insert(String::new(), ssl.clone());
                    } else {
                        for name in &server_config.server_names {
                            pending.contexts.insert(name.clone(), ssl.clone());
                        }
                    }
                }
            }
        }

        by_addr
            .into_iter()
            .map(|(addr, pending)| {
                let tls = if pending.contexts.is_empty() {
                    None
                } else {
                    Some(TlsAcceptor::new(&pending.contexts)?)
                };
                Ok(Arc::new(Server {
                    addr,
                    tls,
                    filters: pending.filters,
                    io_timeout,
                }))
            })
            .collect()
    }

    pub fn tls(&self) -> Option<&TlsAcceptor> {
        self.tls.as_ref()
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout
    }

    /// Finds the deepest matching filter across this address's server
    /// blocks, in declaration order.
    pub fn find_filter(
        &self,
        server_name: Option<&str>,
        request: &Request,
        normalized: &[String],
    ) -> Option<&Filter> {
        self.filters
            .iter()
            .find_map(|filter| filter.find(server_name, request, normalized))
    }
}
