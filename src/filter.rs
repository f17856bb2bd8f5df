//! The hierarchical routing tree.
//!
//! Each filter node mirrors one location block of the configuration: a set
//! of match predicates plus an optional handler. Matching walks the tree
//! depth-first and returns the deepest node whose predicates all hold, with
//! ties between siblings broken by declaration order.

use std::collections::HashSet;

use crate::config::{HandlerConfig, LocationConfig, ServerConfig};
use crate::error::{Error, Result};
use crate::http::request::{Method, Request};

/// Splits a request path into normalized segments: empty and `.` segments
/// collapse, `..` pops. Escaping above the root is a client error.
pub fn normalize_path(path: &str) -> Result<Vec<String>> {
    let mut segments: Vec<String> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(Error::BadRequest("path escapes the root"));
                }
            }
            other => segments.push(other.to_string()),
        }
    }
    Ok(segments)
}

/// One node of the routing tree.
#[derive(Debug)]
pub struct Filter {
    server_names: HashSet<String>,
    segments: Vec<String>,
    methods: HashSet<Method>,
    handler: Option<HandlerConfig>,
    children: Vec<Filter>,
    /// Total path segments consumed from the root through this node.
    match_count: usize,
}

impl Filter {
    /// Builds the root filter for one server block. The root carries the
    /// block's server names and matches every path; locations nest below it.
    pub fn from_server(config: &ServerConfig) -> Result<Filter> {
        let children = config
            .locations
            .iter()
            .map(|location| Filter::from_location(location, 0))
            .collect::<Result<Vec<_>>>()?;
        Ok(Filter {
            server_names: config.server_names.iter().cloned().collect(),
            segments: Vec::new(),
            methods: HashSet::new(),
            handler: None,
            children,
            match_count: 0,
        })
    }

    fn from_location(config: &LocationConfig, inherited: usize) -> Result<Filter> {
        let segments = normalize_path(&config.path)
            .map_err(|_| Error::unknown(format!("invalid location path {:?}", config.path)))?;
        let match_count = inherited + segments.len();
        let methods = config
            .methods
            .iter()
            .map(|name| {
                Method::from_str(name)
                    .ok_or_else(|| Error::unknown(format!("unknown method {name:?} in location")))
            })
            .collect::<Result<HashSet<_>>>()?;
        let children = config
            .locations
            .iter()
            .map(|child| Filter::from_location(child, match_count))
            .collect::<Result<Vec<_>>>()?;
        Ok(Filter {
            server_names: HashSet::new(),
            segments,
            methods,
            handler: config.handler.clone(),
            children,
            match_count,
        })
    }

    pub fn handler(&self) -> Option<&HandlerConfig> {
        self.handler.as_ref()
    }

    pub fn match_count(&self) -> usize {
        self.match_count
    }

    /// Returns the deepest matching descendant, or `None` when this node
    /// itself does not match. Children matching at the same depth tie-break
    /// by declaration order.
    pub fn find(
        &self,
        server_name: Option<&str>,
        request: &Request,
        normalized: &[String],
    ) -> Option<&Filter> {
        if !self.eval(server_name, request, normalized) {
            return None;
        }
        let mut best: Option<&Filter> = None;
        for child in &self.children {
            if let Some(found) = child.find(server_name, request, normalized) {
                if best.is_none_or(|current| found.match_count > current.match_count) {
                    best = Some(found);
                }
            }
        }
        best.or(Some(self))
    }

    fn eval(&self, server_name: Option<&str>, request: &Request, normalized: &[String]) -> bool {
        if !self.server_names.is_empty() {
            // SNI wins when present; otherwise fall back to the Host header.
            match server_name {
                Some(name) => {
                    if !self.server_names.contains(name) {
                        return false;
                    }
                }
                None => {
                    let Some(host) = request.header("Host") else {
                        return false;
                    };
                    let host = host.split(':').next().unwrap_or(host);
                    if !self.server_names.contains(host) {
                        return false;
                    }
                }
            }
        }

        if !self.segments.is_empty() {
            let already_matched = self.match_count - self.segments.len();
            if normalized.len() < already_matched + self.segments.len() {
                return false;
            }
            let window = &normalized[already_matched..already_matched + self.segments.len()];
            if window != self.segments.as_slice() {
                return false;
            }
        }

        if !self.methods.is_empty() && !self.methods.contains(&request.method) {
            return false;
        }

        true
    }
}
