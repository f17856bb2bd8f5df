//! The CGI handler: forked subprocess backends and the shared try-files
//! fallback machinery also used by FastCGI.
//!
//! Each try-files pass runs two concurrent tasks against the backend: one
//! pumps the client body into the backend's stdin and closes it, the other
//! parses the CGI header block off the backend's stdout and decides between
//! forwarding the response and falling back to the next candidate. Both
//! tasks are awaited and the child reaped before the pass ends.

use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::error::{Error, Result};
use crate::http::parser::parse_cgi;
use crate::http::response::{Response, StatusCode};
use crate::io::{pipe, AsyncBufRead, BufReader};
use crate::net::{PipeReader, PipeWriter};
use crate::runtime::Handle;

use super::{fastcgi, ClientBody, ClientWriter, HandleContext};

/// How a CGI location reaches its backend.
pub enum CgiBackend {
    /// Spawn this interpreter with the candidate path as its argument.
    Command(PathBuf),
    /// Speak FastCGI to this `host:port`.
    FastCgi(String),
}

/// Builds the CGI environment for one candidate script.
pub fn cgi_params(ctx: &HandleContext, script: &Path) -> Vec<(String, String)> {
    let mut params = vec![
        ("REQUEST_METHOD".to_string(), ctx.request.method.to_string()),
        (
            "SCRIPT_FILENAME".to_string(),
            script.to_string_lossy().into_owned(),
        ),
        ("PATH_INFO".to_string(), ctx.path_info.clone()),
        ("REDIRECT_STATUS".to_string(), "200".to_string()),
    ];
    if let Some(query) = &ctx.query {
        params.push(("QUERY_STRING".to_string(), query.clone()));
    }
    if let Some(length) = ctx.request.header("Content-Length") {
        params.push(("CONTENT_LENGTH".to_string(), length.to_string()));
    }
    if let Some(content_type) = ctx.request.header("Content-Type") {
        params.push(("CONTENT_TYPE".to_string(), content_type.to_string()));
    }
    for (key, value) in ctx.request.headers.iter() {
        let mut name = String::with_capacity(key.len() + 5);
        name.push_str("HTTP_");
        for ch in key.chars() {
            name.push(if ch == '-' { '_' } else { ch.to_ascii_uppercase() });
        }
        params.push((name, value.to_string()));
    }
    params
}

/// Runs the try-files loop against the configured backend.
///
/// The client body is consumed by the first candidate's pump; later
/// candidates (reached only on 404 fallback) see an already-drained body,
/// which is what a fallback chain wants.
pub async fn handle_cgi(
    mut writer: ClientWriter,
    ctx: HandleContext,
    backend: CgiBackend,
    try_files: Vec<PathBuf>,
    body: ClientBody,
) -> Result<()> {
    if try_files.is_empty() {
        return Err(Error::NotFound);
    }

    let mut body = Some(body);
    let count = try_files.len();
    for (index, path) in try_files.iter().enumerate() {
        let is_last = index + 1 == count;
        let params = cgi_params(&ctx, path);

        let outcome = match &backend {
            CgiBackend::Command(command) => {
                run_command(&ctx.handle, command, path, params, body.take(), writer, is_last)
                    .await?
            }
            CgiBackend::FastCgi(address) => {
                fastcgi::run_fastcgi(&ctx.handle, address, params, body.take(), writer, is_last)
                    .await?
            }
        };

        match outcome {
            // The candidate answered 404 and there are more to try; the
            // writer survives for the next pass.
            Some(returned) => writer = returned,
            None => return Ok(()),
        }
    }
    Ok(())
}

async fn run_command(
    handle: &Handle,
    command: &Path,
    script: &Path,
    params: Vec<(String, String)>,
    body: Option<ClientBody>,
    writer: ClientWriter,
    is_last: bool,
) -> Result<Option<ClientWriter>> {
    let mut child = std::process::Command::new(command)
        .arg(script)
        .envs(params)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;
    let pid = child.id() as i32;
    tracing::debug!(pid, command = %command.display(), script = %script.display(), "spawned cgi process");

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::unknown("cgi child has no stdin pipe"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::unknown("cgi child has no stdout pipe"))?;
    let event_loop = handle.event_loop().clone();
    let mut stdin = PipeWriter::new(OwnedFd::from(stdin), event_loop.clone(), None)?;
    let stdout = PipeReader::new(OwnedFd::from(stdout), event_loop, None)?;

    let pump = handle.spawn(async move {
        if let Some(mut body) = body {
            pipe(&mut body, &mut stdin).await?;
        }
        // Dropping the writer closes the pipe; the child sees EOF on stdin.
        drop(stdin);
        Ok::<(), Error>(())
    });
    let respond = handle.spawn(async move {
        let mut reader = BufReader::new(stdout, 8192);
        respond_cgi(&mut reader, writer, is_last).await
    });

    // Await both sides before reaping, and reap even when one failed so no
    // zombie outlives the request.
    let pump_result = pump.await;
    let respond_result = respond.await;
    let status = handle.wait_pid(pid, None).await?;
    tracing::debug!(pid, status, "cgi process exited");
    let outcome = respond_result?;
    tolerate_closed_backend(pump_result)?;

    Ok(outcome)
}

/// Parses a CGI response off the backend stream and either forwards it or
/// hands the writer back for a fallback attempt.
///
/// Forwarding happens when the derived status is not 404, or when this was
/// the last candidate anyway.
pub(crate) async fn respond_cgi<R: AsyncBufRead>(
    backend: &mut R,
    writer: ClientWriter,
    is_last: bool,
) -> Result<Option<ClientWriter>> {
    let headers = parse_cgi(backend).await?;

    let status = match headers.get("Status") {
        Some(value) => {
            let code = value
                .get(..3)
                .and_then(|digits| digits.parse::<u16>().ok())
                .ok_or_else(|| Error::unknown("malformed cgi Status header"))?;
            StatusCode(code)
        }
        None => StatusCode::OK,
    };

    let mut response = Response::new(status);
    if let Some(location) = headers.get("Location") {
        response.headers.insert("Location", location);
    }
    if let Some(content_type) = headers.get("Content-Type") {
        response.headers.insert("Content-Type", content_type);
    }

    if status.as_u16() != 404 || is_last {
        let mut body = writer.send(response).await?;
        pipe(backend, &mut body).await?;
        Ok(None)
    } else {
        Ok(Some(writer))
    }
}

/// A backend that exits without draining its stdin produces a broken-pipe
/// failure in the pump; that is not an error as long as the response side
/// succeeded.
pub(crate) fn tolerate_closed_backend(result: Result<()>) -> Result<()> {
    match result {
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::BrokenPipe => {
            tracing::debug!("backend closed stdin before the body ended");
            Ok(())
        }
        other => other,
    }
}
