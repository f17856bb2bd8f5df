//! Error kinds shared across the gateway.
//!
//! Errors surface freely; they are recovered in exactly two places: the
//! connection driver (to emit an error response) and the try-files loop
//! inside the CGI handlers (to move on to the next candidate).

/// Errors that can occur while serving a request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An event waiter's deadline expired before the fd became ready.
    #[error("operation timed out")]
    Timeout,

    /// An underlying syscall, TLS or stream error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The request could not be parsed, or carried no origin-form target.
    #[error("bad request: {0}")]
    BadRequest(&'static str),

    /// A header exceeded the configured key/value/count limits.
    #[error("request header fields too large")]
    HeaderTooLarge,

    /// No filter matched, no handler was configured, or no candidate file
    /// could be opened.
    #[error("not found")]
    NotFound,

    /// Precondition violation, e.g. registering two waiters for the same
    /// (fd, direction) pair.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Anything else that escaped.
    #[error("{0}")]
    Unknown(String),
}

impl Error {
    pub fn unknown(msg: impl Into<String>) -> Self {
        Error::Unknown(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
