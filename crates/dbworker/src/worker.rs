//! Worker executor - runs inside the worker process.
//!
//! This module provides the child side of the protocol. The parent side
//! (spawning, correlation) lives in process.rs and connection.rs.
//!
//! The executor owns the live backend for the lifetime of the process, reads
//! one request at a time from the channel with blocking I/O, and writes back
//! exactly one response per request, in order. It never initiates
//! communication.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::{ArgSpec, ExecResult, OpenParams, Request, Response};
use crate::error::{BackendError, ExecutorError};

const READ_CHUNK: usize = 64 * 1024;

/// A live database handle, owned by the executor.
///
/// All calls are blocking; the executor serializes them.
pub trait Backend {
    /// Run a statement with positional arguments and collect every row.
    fn execute(&mut self, sql: &str, args: &[Value]) -> Result<ExecResult, BackendError>;

    fn attr(&mut self, name: &str) -> Result<Value, BackendError>;

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), BackendError>;

    fn begin(&mut self) -> Result<(), BackendError>;

    fn commit(&mut self) -> Result<(), BackendError>;

    fn rollback(&mut self) -> Result<(), BackendError>;

    /// Invoke a driver-private extension point.
    fn call(&mut self, name: &str, args: Vec<Value>) -> Result<Value, BackendError> {
        let _ = args;
        Err(BackendError::new(format!("unknown driver function: {name}")))
    }
}

/// Establishes the backend when the open request arrives.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, params: &OpenParams) -> Result<Box<dyn Backend>, BackendError>;
}

impl<F> Connector for F
where
    F: Fn(&OpenParams) -> Result<Box<dyn Backend>, BackendError> + Send + Sync + 'static,
{
    fn connect(&self, params: &OpenParams) -> Result<Box<dyn Backend>, BackendError> {
        self(params)
    }
}

type ArgBuilder = Box<dyn Fn(Value) -> Result<Vec<Value>, BackendError> + Send + Sync>;

/// Named argument-construction strategies available to [`ArgSpec::Builder`].
///
/// Only builders registered here can run; the parent names one and supplies
/// its input.
pub struct ArgBuilders {
    builders: HashMap<String, ArgBuilder>,
}

impl Default for ArgBuilders {
    fn default() -> Self {
        let mut builders = Self::empty();
        // Arrays become the argument list, scalars a single argument.
        builders.register("spread", |input| {
            Ok(match input {
                Value::Array(values) => values,
                Value::Null => Vec::new(),
                other => vec![other],
            })
        });
        builders
    }
}

impl ArgBuilders {
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, builder: F) -> &mut Self
    where
        F: Fn(Value) -> Result<Vec<Value>, BackendError> + Send + Sync + 'static,
    {
        self.builders.insert(name.into(), Box::new(builder));
        self
    }

    pub fn with<F>(mut self, name: impl Into<String>, builder: F) -> Self
    where
        F: Fn(Value) -> Result<Vec<Value>, BackendError> + Send + Sync + 'static,
    {
        self.register(name, builder);
        self
    }

    pub fn materialize(&self, spec: ArgSpec) -> Result<Vec<Value>, BackendError> {
        match spec {
            ArgSpec::Values(values) => Ok(values),
            ArgSpec::Builder { name, input } => match self.builders.get(&name) {
                Some(builder) => builder(input),
                None => Err(BackendError::new(format!(
                    "unknown argument builder: {name}"
                ))),
            },
        }
    }
}

/// Everything the executor needs besides the channel.
#[derive(Clone)]
pub struct WorkerConfig {
    pub connector: Arc<dyn Connector>,
    pub arg_builders: Arc<ArgBuilders>,
}

impl WorkerConfig {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            arg_builders: Arc::new(ArgBuilders::default()),
        }
    }

    pub fn with_arg_builders(mut self, builders: ArgBuilders) -> Self {
        self.arg_builders = Arc::new(builders);
        self
    }
}

/// Request dispatcher owning the backend resource.
pub struct Executor {
    config: WorkerConfig,
    backend: Option<Box<dyn Backend>>,
}

impl Executor {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            backend: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_some()
    }

    /// Run one request. Never fails: handler errors and panics become
    /// failure responses so the one-response-per-request rule holds.
    pub fn handle(&mut self, request: Request) -> Response {
        let op = request.tag();
        match panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(request))) {
            Ok(Ok(results)) => Response::Ok(results),
            Ok(Err(e)) => {
                tracing::debug!(op, error = %e, "Request failed");
                Response::Err(e.to_string())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(op, %message, "Backend panicked");
                Response::Err(format!("{op} panicked: {message}"))
            }
        }
    }

    fn dispatch(&mut self, request: Request) -> Result<Vec<Value>, BackendError> {
        match request {
            Request::Open(params) => {
                // Drop any previous handle before reconnecting.
                self.backend = None;
                tracing::debug!(dsn = %params.dsn, "Opening backend");
                self.backend = Some(self.config.connector.connect(&params)?);
                Ok(Vec::new())
            }
            Request::Exec { sql, args } => Ok(self.backend()?.execute(&sql, &args)?.into_values()),
            Request::Attr { name } => Ok(vec![self.backend()?.attr(&name)?]),
            Request::SetAttr { name, value } => {
                self.backend()?.set_attr(&name, value)?;
                Ok(Vec::new())
            }
            Request::Begin => {
                self.backend()?.begin()?;
                Ok(Vec::new())
            }
            Request::Commit => {
                self.backend()?.commit()?;
                Ok(Vec::new())
            }
            Request::Rollback => {
                self.backend()?.rollback()?;
                Ok(Vec::new())
            }
            Request::Func { args, name } => {
                let args = self.config.arg_builders.materialize(args)?;
                Ok(vec![self.backend()?.call(&name, args)?])
            }
        }
    }

    fn backend(&mut self) -> Result<&mut Box<dyn Backend>, BackendError> {
        self.backend.as_mut().ok_or_else(BackendError::not_connected)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run the executor loop until the parent closes its end of the channel.
///
/// Returns `Err` only for unrecoverable faults (I/O failure or a frame that
/// cannot be decoded as a request); the caller should exit the process.
pub fn run_executor<S: Read + Write>(mut stream: S, config: WorkerConfig) -> Result<(), ExecutorError> {
    let mut executor = Executor::new(config);
    let mut codec = FrameCodec::new();
    let mut inbuf = BytesMut::with_capacity(READ_CHUNK);
    let mut outbuf = BytesMut::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut handled: u64 = 0;

    tracing::debug!(pid = std::process::id(), "Executor started");

    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) => {
                tracing::debug!(handled, "Parent closed channel, executor exiting");
                return Ok(());
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        inbuf.extend_from_slice(&chunk[..n]);

        loop {
            let payload = match codec.decode(&mut inbuf) {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => return Err(ExecutorError::Protocol(e.to_string())),
            };
            let request = Request::from_payload(payload)
                .map_err(|e| ExecutorError::Protocol(e.to_string()))?;
            tracing::trace!(op = request.tag(), "Request received");

            let response = executor.handle(request);
            codec.encode(response.into_payload().as_slice(), &mut outbuf)?;
            // write_all retries partial writes; nothing is read until the
            // whole response is out.
            stream.write_all(&outbuf)?;
            stream.flush()?;
            outbuf.clear();
            handled += 1;
        }
    }
}
