//! `rlm-worker` – isolated script worker.
//!
//! Reads one request per line on stdin and answers on stdout. Logs go to
//! stderr so they never interleave with the protocol.

use anyhow::Context;
use rlm::worker::WorkerService;
use std::io;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let worker_key = std::env::var("RLM_WORKER_KEY").unwrap_or_default();
    tracing::debug!(worker_key, version = rlm::VERSION, "worker starting");

    let stdin = io::stdin();
    let stdout = io::stdout();
    WorkerService::new()
        .handle(stdin.lock(), stdout.lock())
        .context("worker transport failed")?;

    tracing::debug!(worker_key, "stdin closed, worker exiting");
    Ok(())
}
