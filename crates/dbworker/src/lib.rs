//! dbworker: run blocking database drivers in worker processes.
//!
//! A [`Connection`] owns one worker process and talks to it over a private
//! socket with length-prefixed frames. Requests are answered strictly in
//! order, so the parent never blocks on the database and never needs
//! request ids.

pub mod bridge;
mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod process;
mod queue;
#[cfg(feature = "sqlite")]
pub mod sqlite;
mod timeout;
pub mod worker;

pub use bridge::protocol::{ArgSpec, ExecResult, OpenParams, Request, Response};
pub use config::{ConnectConfig, ErrorEvent};
pub use connection::{ConnState, Connection, Reply};
pub use error::{BackendError, DbError, ExecutorError, SpawnError};
pub use process::LaunchStrategy;
pub use queue::Origin;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteConnector;
pub use worker::{ArgBuilders, Backend, Connector, WorkerConfig, run_executor};
