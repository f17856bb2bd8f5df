//! Request handlers: the backends a matched filter can dispatch to.
//!
//! Every handler receives a [`HandleContext`] describing the routed request,
//! a single-use response writer, and (where it needs one) the
//! `Content-Length`-limited client body stream.

pub mod cgi;
pub mod fastcgi;
pub mod proxy;
pub mod redirect;
pub mod static_files;

use std::path::{Path, PathBuf};

use crate::http::request::Request;
use crate::http::writer::ResponseWriter;
use crate::io::{BufReader, BufWriter, LimitedReader};
use crate::net::{ReadHalf, WriteHalf};
use crate::runtime::Handle;

/// The response writer as handed to a handler.
pub type ClientWriter = ResponseWriter<BufWriter<WriteHalf>>;
/// The request body stream, capped at its `Content-Length`.
pub type ClientBody = LimitedReader<BufReader<ReadHalf>>;

/// Everything a handler needs to know about the routed request.
pub struct HandleContext {
    pub handle: Handle,
    pub request: Request,
    /// Path segments left after the matched filter's prefix.
    pub residual: Vec<String>,
    /// Whether the request path ended in a slash, which makes the index
    /// file the try-files candidate.
    pub trailing_slash: bool,
    /// The full normalized request path, for `PATH_INFO`.
    pub path_info: String,
    pub query: Option<String>,
}

impl HandleContext {
    /// The residual path as a rooted string: `/x/y`, or `/` when empty.
    pub fn residual_path(&self) -> String {
        if self.residual.is_empty() {
            return "/".to_string();
        }
        let mut out = String::new();
        for segment in &self.residual {
            out.push('/');
            out.push_str(segment);
        }
        out
    }
}

/// Computes the ordered candidate list for static and CGI handlers.
///
/// An explicit `try_files` list (relative to `root`) wins. Otherwise the
/// candidate is the residual path under `root`, with `index` substituted
/// when the request points at the location root or ends in a slash.
pub fn build_try_files(
    root: &Path,
    index: Option<&str>,
    explicit: &[String],
    ctx: &HandleContext,
) -> Vec<PathBuf> {
    if !explicit.is_empty() {
        return explicit.iter().map(|file| root.join(file)).collect();
    }

    let mut base = root.to_path_buf();
    for segment in &ctx.residual {
        base.push(segment);
    }
    if ctx.residual.is_empty() || ctx.trailing_slash {
        if let Some(index) = index {
            return vec![base.join(index)];
        }
    }
    vec![base]
}
