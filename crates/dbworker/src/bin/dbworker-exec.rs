//! Executor program for the exec launch strategy.
//!
//! Standard input is the worker end of the channel. Requests are served with
//! the SQLite backend until the parent closes its end.

use std::io::stdin;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use anyhow::Context;
use dbworker::logging::init_tracing;
use dbworker::{SqliteConnector, WorkerConfig, run_executor};

fn main() -> anyhow::Result<()> {
    init_tracing();

    let channel = stdin()
        .as_fd()
        .try_clone_to_owned()
        .context("standard input is not usable as a channel")?;
    let stream = UnixStream::from(channel);

    tracing::debug!(pid = std::process::id(), "Executor started");
    run_executor(stream, WorkerConfig::new(Arc::new(SqliteConnector))).context("executor failed")?;
    tracing::debug!("Channel closed, executor exiting");
    Ok(())
}
