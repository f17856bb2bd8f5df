use crate::http::header::HeaderMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    OPTIONS,
    PATCH,
}

impl Method {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The request-target from the request line.
///
/// Only the origin form (`/path?query`) is routable; anything else is kept
/// verbatim so the driver can reject it with a 400.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    Origin { path: String, query: Option<String> },
    Other(String),
}

impl RequestTarget {
    pub fn parse(raw: &str) -> RequestTarget {
        if !raw.starts_with('/') {
            return RequestTarget::Other(raw.to_string());
        }
        match raw.split_once('?') {
            Some((path, query)) => RequestTarget::Origin {
                path: path.to_string(),
                query: Some(query.to_string()),
            },
            None => RequestTarget::Origin {
                path: raw.to_string(),
                query: None,
            },
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            RequestTarget::Origin { path, .. } => Some(path),
            RequestTarget::Other(_) => None,
        }
    }

    pub fn query(&self) -> Option<&str> {
        match self {
            RequestTarget::Origin { query, .. } => query.as_deref(),
            RequestTarget::Other(_) => None,
        }
    }
}

impl std::fmt::Display for RequestTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestTarget::Origin { path, query } => {
                f.write_str(path)?;
                if let Some(query) = query {
                    write!(f, "?{query}")?;
                }
                Ok(())
            }
            RequestTarget::Other(raw) => f.write_str(raw),
        }
    }
}

/// A parsed request head. The body stays on the connection stream and is
/// consumed by whichever handler the request is dispatched to.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub target: RequestTarget,
    pub version: String,
    pub headers: HeaderMap,
}

impl Request {
    pub fn new(method: Method, target: RequestTarget) -> Self {
        Request {
            method,
            target,
            version: "HTTP/1.1".to_string(),
            headers: HeaderMap::new(),
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    pub fn content_length(&self) -> u64 {
        self.header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}
