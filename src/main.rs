use std::path::Path;

use anyhow::Context;

use palisade::config::Config;
use palisade::runtime::Runtime;
use palisade::server::{listener, Server};
use palisade::signal;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(tracing::Level::DEBUG)
        .init();

    // A backend closing its pipe must surface as EPIPE, not kill the process.
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "palisade.toml".to_string());
    let config =
        Config::load(Path::new(&path)).with_context(|| format!("failed to load {path}"))?;

    let runtime = if config.workers > 0 {
        Runtime::thread_pool(config.workers)
    } else {
        Runtime::sequential()
    }
    .context("failed to start runtime")?;

    let servers = Server::build_all(&config).context("failed to build servers")?;
    let handle = runtime.handle().clone();

    runtime.block_on(async move {
        for server in servers {
            let task_handle = handle.clone();
            handle.spawn(async move {
                let addr = server.addr;
                if let Err(err) = listener::run(server, task_handle).await {
                    tracing::error!(%addr, error = %err, "listener failed");
                }
            });
        }

        if let Err(err) = signal::shutdown(&handle).await {
            tracing::error!(error = %err, "shutdown waiter failed");
        }
        tracing::info!("shutdown signal received");
    });

    Ok(())
}
