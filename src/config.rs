//! Configuration loading.
//!
//! The configuration is a TOML tree: server blocks carry listen addresses
//! and optional TLS material, and nest location blocks that mirror the
//! routing filter tree. Loading validates everything that would otherwise
//! fail at request time.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Error type for configuration loading. These are startup failures; the
/// process exits non-zero on any of them.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "server", default)]
    pub servers: Vec<ServerConfig>,

    /// Worker threads for the executor; 0 or absent selects the sequential
    /// executor.
    #[serde(default)]
    pub workers: usize,

    /// Per-operation socket timeout applied to client connections, in
    /// milliseconds. Absent means no timeout.
    #[serde(default)]
    pub io_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Addresses to bind, e.g. `"127.0.0.1:8080"`.
    pub listen: Vec<String>,

    #[serde(default)]
    pub server_names: Vec<String>,

    /// Enables TLS on this block's bindings.
    pub ssl: Option<SslConfig>,

    #[serde(rename = "location", default)]
    pub locations: Vec<LocationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SslConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    /// Path segments this location adds to the inherited prefix.
    #[serde(default)]
    pub path: String,

    /// Methods this location accepts; empty accepts all.
    #[serde(default)]
    pub methods: Vec<String>,

    pub handler: Option<HandlerConfig>,

    #[serde(rename = "location", default)]
    pub locations: Vec<LocationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HandlerConfig {
    /// Serve files from `root`.
    Static {
        root: PathBuf,
        index: Option<String>,
        #[serde(default)]
        try_files: Vec<String>,
    },
    /// Run `command` with the candidate file as its argument.
    Cgi {
        command: PathBuf,
        root: PathBuf,
        index: Option<String>,
        #[serde(default)]
        try_files: Vec<String>,
    },
    /// Talk FastCGI to `address` (`host:port`).
    Fastcgi {
        address: String,
        root: PathBuf,
        index: Option<String>,
        #[serde(default)]
        try_files: Vec<String>,
    },
    /// Forward to an HTTP upstream, e.g. `"http://127.0.0.1:3000"`.
    Proxy { upstream: String },
    /// Answer with `code` and a Location of `target` plus the residual path.
    Redirect { code: u16, target: String },
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_str(content: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::Validation("no server blocks".into()));
        }
        for server in &self.servers {
            if server.listen.is_empty() {
                return Err(ConfigError::Validation(
                    "server block without a listen address".into(),
                ));
            }
            for address in &server.listen {
                address.parse::<SocketAddr>().map_err(|_| {
                    ConfigError::Validation(format!("unparseable listen address {address:?}"))
                })?;
            }
            for location in &server.locations {
                validate_location(location)?;
            }
        }
        Ok(())
    }
}

fn validate_location(location: &LocationConfig) -> Result<(), ConfigError> {
    for method in &location.methods {
        if crate::http::request::Method::from_str(method).is_none() {
            return Err(ConfigError::Validation(format!("unknown method {method:?}")));
        }
    }
    match &location.handler {
        Some(HandlerConfig::Redirect { code, .. }) => {
            if !(300..400).contains(code) {
                return Err(ConfigError::Validation(format!(
                    "redirect code {code} is not a 3xx status"
                )));
            }
        }
        Some(HandlerConfig::Proxy { upstream }) => {
            let parsed = url::Url::parse(upstream).map_err(|err| {
                ConfigError::Validation(format!("invalid proxy upstream {upstream:?}: {err}"))
            })?;
            if parsed.host_str().is_none() {
                return Err(ConfigError::Validation(format!(
                    "proxy upstream {upstream:?} has no host"
                )));
            }
        }
        Some(HandlerConfig::Fastcgi { address, .. }) => {
            if !address.contains(':') {
                return Err(ConfigError::Validation(format!(
                    "fastcgi address {address:?} must be host:port"
                )));
            }
        }
        _ => {}
    }
    for child in &location.locations {
        validate_location(child)?;
    }
    Ok(())
}
