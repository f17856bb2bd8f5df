//! Redirect handler.

use crate::error::Result;
use crate::http::response::{Response, StatusCode};

use super::{ClientWriter, HandleContext};

/// Answers with the configured code and a `Location` of the configured
/// target plus the residual path, so a redirect of a whole subtree keeps
/// the per-request tail intact.
pub async fn handle_redirect(
    writer: ClientWriter,
    ctx: &HandleContext,
    code: u16,
    target: &str,
) -> Result<()> {
    let location = format!("{}{}", target, ctx.residual_path());
    let response = Response::new(StatusCode(code)).with_header("Location", location);
    writer.send(response).await?;
    Ok(())
}
