//! Parent-side connection: a cheap, cloneable handle and the driver task
//! that owns the channel.
//!
//! Every submission is serialized and queued synchronously at the call site;
//! the returned [`Reply`] only waits for the outcome. The driver is the single
//! owner of the I/O buffers, the request queue and the inactivity timer, and
//! reacts to four events: a new command, socket readability, socket
//! writability (only while output is pending) and timer expiry.
//!
//! Failures split in two:
//! - recoverable: the worker reported an error for one request; the caller
//!   gets it and the connection stays open
//! - fatal: timeout, end-of-stream, a corrupt frame, or a failed open; the
//!   connection closes, the worker is torn down, and every outstanding
//!   request fails with the same error

use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::bridge::protocol::{ArgSpec, ExecResult, Request};
use crate::channel::{Channel, ReadOutcome};
use crate::config::{ConnectConfig, ConnectHook, ErrorEvent, ErrorHook};
use crate::error::DbError;
use crate::process::{WorkerProcess, spawn_worker};
use crate::queue::{Origin, PendingRequest, RequestQueue};
use crate::timeout::InactivityTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// The open request is in flight.
    Connecting,
    Open,
    /// Terminal. Nothing reopens a closed connection.
    Closed,
}

#[derive(Debug, Clone)]
struct Status {
    state: ConnState,
    /// Set when the connection closed because of a fatal error.
    error: Option<DbError>,
}

enum Command {
    Submit {
        request: Request,
        pending: PendingRequest,
    },
    Close(oneshot::Sender<()>),
}

struct Shared {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<Status>,
    pid: Option<u32>,
}

/// Handle to a database worker.
///
/// Clones share the same worker. The connection closes when [`close`] is
/// called, on a fatal error, or once the last clone is dropped.
///
/// [`close`]: Connection::close
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Launch a worker and start opening the database.
    ///
    /// Returns immediately in [`ConnState::Connecting`]; requests submitted
    /// now queue behind the open. Must be called from within a tokio runtime.
    #[track_caller]
    pub fn spawn(config: ConnectConfig) -> Result<Self, DbError> {
        let origin = Location::caller();
        let (stream, worker) = spawn_worker(&config.launch, &config.worker)?;
        let channel = Channel::from_std(stream)?;
        let (connection, _driver) = Self::attach(channel, Some(worker), config, origin);
        Ok(connection)
    }

    /// Launch a worker and wait until the database is open.
    #[track_caller]
    pub fn connect(config: ConnectConfig) -> impl Future<Output = Result<Self, DbError>> + Send {
        let spawned = Self::spawn(config);
        async move {
            let connection = spawned?;
            connection.ready().await?;
            Ok(connection)
        }
    }

    fn attach(
        channel: Channel,
        worker: Option<WorkerProcess>,
        config: ConnectConfig,
        origin: Origin,
    ) -> (Self, JoinHandle<()>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(Status {
            state: ConnState::Connecting,
            error: None,
        });
        let pid = worker.as_ref().map(WorkerProcess::pid);

        // The open goes in first so it is the head of the queue.
        let open = Request::Open(config.open);
        let pending = PendingRequest::new(&open, origin, None);
        let _ = commands.send(Command::Submit {
            request: open,
            pending,
        });

        let driver = Driver {
            channel,
            queue: RequestQueue::new(),
            timer: InactivityTimer::new(config.timeout),
            commands: command_rx,
            status: status_tx,
            worker,
            on_error: config.on_error,
            on_connect: config.on_connect,
            origin,
            state: ConnState::Connecting,
            pid,
        };
        let handle = tokio::spawn(driver.run());

        let connection = Self {
            shared: Arc::new(Shared {
                commands,
                status,
                pid,
            }),
        };
        (connection, handle)
    }

    pub fn state(&self) -> ConnState {
        self.shared.status.borrow().state
    }

    /// Process id of the worker, if this connection launched one.
    pub fn pid(&self) -> Option<u32> {
        self.shared.pid
    }

    /// The fatal error that closed the connection, if any.
    pub fn last_error(&self) -> Option<DbError> {
        self.shared.status.borrow().error.clone()
    }

    /// Wait for the outcome of the initial open.
    pub async fn ready(&self) -> Result<(), DbError> {
        let mut status = self.shared.status.clone();
        let status = status
            .wait_for(|s| s.state != ConnState::Connecting)
            .await
            .map_err(|_| DbError::Closed)?;
        match status.state {
            ConnState::Open => Ok(()),
            _ => Err(status.error.clone().unwrap_or(DbError::Closed)),
        }
    }

    /// Close the connection and tear the worker down.
    ///
    /// Outstanding requests fail with [`DbError::Closed`]. Resolves once the
    /// worker has been signalled.
    pub async fn close(&self) {
        let (done, wait) = oneshot::channel();
        if self.shared.commands.send(Command::Close(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Run a statement with positional arguments.
    #[track_caller]
    pub fn exec(&self, sql: impl Into<String>, args: &[Value]) -> Reply<ExecResult> {
        let request = Request::Exec {
            sql: sql.into(),
            args: args.to_vec(),
        };
        self.submit_at(request, Location::caller(), exec_result)
    }

    /// Read a driver attribute.
    #[track_caller]
    pub fn attr(&self, name: impl Into<String>) -> Reply<Value> {
        let request = Request::Attr { name: name.into() };
        self.submit_at(request, Location::caller(), first_value)
    }

    #[track_caller]
    pub fn set_attr(&self, name: impl Into<String>, value: impl Into<Value>) -> Reply<()> {
        let request = Request::SetAttr {
            name: name.into(),
            value: value.into(),
        };
        self.submit_at(request, Location::caller(), unit)
    }

    #[track_caller]
    pub fn begin_work(&self) -> Reply<()> {
        self.submit_at(Request::Begin, Location::caller(), unit)
    }

    #[track_caller]
    pub fn commit(&self) -> Reply<()> {
        self.submit_at(Request::Commit, Location::caller(), unit)
    }

    #[track_caller]
    pub fn rollback(&self) -> Reply<()> {
        self.submit_at(Request::Rollback, Location::caller(), unit)
    }

    /// Invoke a driver-private function.
    #[track_caller]
    pub fn func(&self, args: ArgSpec, name: impl Into<String>) -> Reply<Value> {
        let request = Request::Func {
            args,
            name: name.into(),
        };
        self.submit_at(request, Location::caller(), first_value)
    }

    /// Submit a raw request; resolves with the worker's result values.
    #[track_caller]
    pub fn submit(&self, request: Request) -> Reply<Vec<Value>> {
        self.submit_at(request, Location::caller(), Ok)
    }

    fn submit_at<T>(
        &self,
        request: Request,
        origin: Origin,
        map: fn(Vec<Value>) -> Result<T, DbError>,
    ) -> Reply<T> {
        let (completion, rx) = oneshot::channel();
        let reply = Reply { rx, map };

        if let Some(error) = self.terminal_error() {
            let _ = completion.send(Err(error));
            return reply;
        }

        let pending = PendingRequest::new(&request, origin, Some(completion));
        if let Err(mpsc::error::SendError(command)) =
            self.shared.commands.send(Command::Submit { request, pending })
            && let Command::Submit { pending, .. } = command
        {
            // The driver finished between the state check and the send.
            pending.complete(Err(self.terminal_error().unwrap_or(DbError::Closed)));
        }
        reply
    }

    fn terminal_error(&self) -> Option<DbError> {
        let status = self.shared.status.borrow();
        match status.state {
            ConnState::Closed => Some(status.error.clone().unwrap_or(DbError::Closed)),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("pid", &self.shared.pid)
            .field("state", &self.state())
            .finish()
    }
}

fn exec_result(values: Vec<Value>) -> Result<ExecResult, DbError> {
    ExecResult::from_values(values).map_err(|e| DbError::Protocol(e.to_string()))
}

fn first_value(values: Vec<Value>) -> Result<Value, DbError> {
    Ok(values.into_iter().next().unwrap_or(Value::Null))
}

fn unit(_: Vec<Value>) -> Result<(), DbError> {
    Ok(())
}

/// Outcome of a submitted request.
///
/// The request is already queued when this is returned; dropping the reply
/// discards the result but does not cancel the request.
#[must_use = "the request runs regardless; dropping the reply discards its result"]
pub struct Reply<T> {
    rx: oneshot::Receiver<Result<Vec<Value>, DbError>>,
    map: fn(Vec<Value>) -> Result<T, DbError>,
}

impl<T> Future for Reply<T> {
    type Output = Result<T, DbError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let map = self.map;
        self.rx.poll_unpin(cx).map(|received| match received {
            Ok(result) => result.and_then(map),
            Err(_) => Err(DbError::Closed),
        })
    }
}

enum Exit {
    Fatal(ErrorEvent),
    /// Explicit close, or every handle dropped.
    Closed(Option<oneshot::Sender<()>>),
}

struct Driver {
    channel: Channel,
    queue: RequestQueue,
    timer: InactivityTimer,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<Status>,
    worker: Option<WorkerProcess>,
    on_error: Option<ErrorHook>,
    on_connect: Option<ConnectHook>,
    /// Where the connection was created; blamed for failures with no
    /// request outstanding.
    origin: Origin,
    state: ConnState,
    pid: Option<u32>,
}

impl Driver {
    async fn run(mut self) {
        tracing::debug!(pid = ?self.pid, timeout = ?self.timer.period(), "Connection driver started");
        let exit = self.drive().await;
        self.finish(exit);
    }

    async fn drive(&mut self) -> Exit {
        loop {
            tokio::select! {
                biased;

                ready = self.channel.readable() => {
                    if let Err(e) = ready {
                        return self.fatal(e.into());
                    }
                    if let Some(exit) = self.on_readable() {
                        return exit;
                    }
                }

                ready = self.channel.writable(), if self.channel.wants_write() => {
                    if let Err(e) = ready.and_then(|()| self.channel.on_writable()) {
                        return self.fatal(e.into());
                    }
                }

                command = self.commands.recv() => match command {
                    Some(Command::Submit { request, pending }) => {
                        if let Some(exit) = self.submit(request, pending) {
                            return exit;
                        }
                    }
                    Some(Command::Close(done)) => return Exit::Closed(Some(done)),
                    None => {
                        tracing::debug!(pid = ?self.pid, "All connection handles dropped");
                        return Exit::Closed(None);
                    }
                },

                () = self.timer.expired() => {
                    tracing::warn!(
                        pid = ?self.pid,
                        pending = self.queue.len(),
                        "Worker made no progress within timeout"
                    );
                    return self.fatal(DbError::Timeout);
                }
            }
        }
    }

    /// Fatal error blamed on the oldest outstanding request.
    fn fatal(&self, error: DbError) -> Exit {
        Exit::Fatal(ErrorEvent {
            error,
            origin: self.queue.head_origin().unwrap_or(self.origin),
            fatal: true,
        })
    }

    fn submit(&mut self, request: Request, pending: PendingRequest) -> Option<Exit> {
        let op = request.tag();
        let framed = request
            .into_payload()
            .map_err(|e| e.to_string())
            .and_then(|payload| self.channel.push_frame(&payload).map_err(|e| e.to_string()));
        if let Err(e) = framed {
            let event = ErrorEvent {
                error: DbError::Protocol(format!("cannot encode {op} request: {e}")),
                origin: pending.origin(),
                fatal: pending.is_fatal(),
            };
            pending.complete(Err(event.error.clone()));
            if event.fatal {
                return Some(Exit::Fatal(event));
            }
            self.report(&event);
            return None;
        }

        tracing::trace!(op, queued = self.queue.len() + 1, "Request submitted");
        self.queue.push(pending);
        self.timer.arm();

        if let Err(e) = self.channel.kick() {
            return Some(self.fatal(e.into()));
        }
        None
    }

    fn on_readable(&mut self) -> Option<Exit> {
        match self.channel.on_readable() {
            Ok(ReadOutcome::WouldBlock) => None,
            Ok(ReadOutcome::Eof) => Some(self.fatal(DbError::Disconnected)),
            Err(e) => {
                tracing::debug!(pid = ?self.pid, error = %e, "Read from worker failed");
                Some(self.fatal(DbError::Disconnected))
            }
            Ok(ReadOutcome::Data(n)) => {
                tracing::trace!(bytes = n, "Received from worker");
                self.timer.touch();
                loop {
                    match self.channel.next_frame() {
                        Ok(Some(payload)) => {
                            if let Some(exit) = self.on_frame(payload) {
                                return Some(exit);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => return Some(self.fatal(DbError::Protocol(e.to_string()))),
                    }
                }
                if self.queue.is_empty() && self.timer.is_armed() {
                    tracing::trace!("Queue drained, timer disarmed");
                    self.timer.disarm();
                }
                None
            }
        }
    }

    fn on_frame(&mut self, payload: Vec<Value>) -> Option<Exit> {
        let correlation = match self.queue.on_frame(payload) {
            Ok(correlation) => correlation,
            Err(error) => return Some(self.fatal(error)),
        };

        let Some(error) = correlation.failure else {
            if correlation.opens {
                self.set_state(ConnState::Open);
                if let Some(hook) = &self.on_connect {
                    hook(true);
                }
            }
            return None;
        };

        let event = ErrorEvent {
            error,
            origin: correlation.origin,
            fatal: correlation.fatal,
        };
        if event.fatal {
            return Some(Exit::Fatal(event));
        }
        self.report(&event);
        None
    }

    fn report(&self, event: &ErrorEvent) {
        if let Some(hook) = &self.on_error {
            hook(event);
        }
    }

    fn set_state(&mut self, state: ConnState) {
        tracing::debug!(pid = ?self.pid, from = ?self.state, to = ?state, "Connection state changed");
        self.state = state;
        self.status.send_replace(Status { state, error: None });
    }

    /// Close for good: publish the terminal state, tear the worker down, fail
    /// everything outstanding, then report.
    ///
    /// A fatal error with neither hook to receive it aborts the process once
    /// all of that is done.
    fn finish(self, exit: Exit) {
        let Driver {
            channel,
            mut queue,
            mut commands,
            status,
            mut worker,
            on_error,
            on_connect,
            state,
            pid,
            ..
        } = self;

        let (event, done) = match exit {
            Exit::Fatal(event) => (Some(event), None),
            Exit::Closed(done) => (None, done),
        };
        let terminal = event.as_ref().map_or(DbError::Closed, |e| e.error.clone());

        match &event {
            Some(event) => tracing::warn!(
                ?pid,
                error = %event.error,
                origin = %event.origin,
                "Connection failed"
            ),
            None => tracing::debug!(?pid, "Connection closed"),
        }
        status.send_replace(Status {
            state: ConnState::Closed,
            error: event.as_ref().map(|e| e.error.clone()),
        });

        // Signal before closing our end, so the worker never mistakes a
        // teardown for a normal end of work.
        if let Some(worker) = worker.as_mut() {
            worker.terminate();
        }
        drop(channel);
        drop(worker);

        let failed = queue.fail_all(&terminal);
        commands.close();
        let mut closers = Vec::new();
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Submit { pending, .. } => pending.complete(Err(terminal.clone())),
                Command::Close(done) => closers.push(done),
            }
        }
        if failed > 0 {
            tracing::debug!(?pid, failed, "Failed outstanding requests");
        }

        if let Some(event) = event {
            if state == ConnState::Connecting
                && let Some(hook) = &on_connect
            {
                hook(false);
            } else if let Some(hook) = &on_error {
                hook(&event);
            } else {
                tracing::error!(
                    ?pid,
                    error = %event.error,
                    origin = %event.origin,
                    "Unhandled fatal database worker error, aborting"
                );
                eprintln!("unhandled database worker error: {event}");
                std::process::abort();
            }
        }

        for done in done.into_iter().chain(closers) {
            let _ = done.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;
    use tokio_util::bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    use crate::bridge::codec::FrameCodec;
    use crate::bridge::protocol::Response;

    /// The far end of the channel, scripted by each test.
    struct FakeWorker {
        stream: UnixStream,
        codec: FrameCodec,
        buf: BytesMut,
    }

    impl FakeWorker {
        async fn recv(&mut self) -> Option<Request> {
            loop {
                if let Some(payload) = self.codec.decode(&mut self.buf).unwrap() {
                    return Some(Request::from_payload(payload).unwrap());
                }
                match self.stream.read_buf(&mut self.buf).await {
                    Ok(0) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
        }

        fn frames(&mut self, responses: Vec<Response>) -> Vec<u8> {
            let mut out = BytesMut::new();
            for response in responses {
                self.codec
                    .encode(response.into_payload().as_slice(), &mut out)
                    .unwrap();
            }
            out.to_vec()
        }

        async fn send(&mut self, response: Response) {
            let bytes = self.frames(vec![response]);
            self.stream.write_all(&bytes).await.unwrap();
        }

        async fn send_chunked(&mut self, responses: Vec<Response>, chunk: usize, pause: Duration) {
            let bytes = self.frames(responses);
            for piece in bytes.chunks(chunk) {
                self.stream.write_all(piece).await.unwrap();
                if pause.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }

    #[track_caller]
    fn fake(config: ConnectConfig) -> (Connection, JoinHandle<()>, FakeWorker) {
        let (local, peer) = UnixStream::pair().unwrap();
        let (connection, driver) =
            Connection::attach(Channel::new(local), None, config, Location::caller());
        let worker = FakeWorker {
            stream: peer,
            codec: FrameCodec::new(),
            buf: BytesMut::new(),
        };
        (connection, driver, worker)
    }

    fn recording() -> (ConnectConfig, Arc<Mutex<Vec<ErrorEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let config = ConnectConfig::new("memory")
            .with_on_error(move |event| sink.lock().unwrap().push(event.clone()));
        (config, events)
    }

    fn opened() -> Response {
        Response::Ok(vec![])
    }

    #[tokio::test]
    async fn replies_follow_submission_order_with_byte_delivery() {
        let (conn, _driver, mut worker) = fake(ConnectConfig::new("memory"));
        assert_eq!(conn.state(), ConnState::Connecting);

        let a = conn.attr("a");
        let b = conn.attr("b");
        let c = conn.attr("c");

        assert!(matches!(worker.recv().await, Some(Request::Open(_))));
        let mut responses = vec![opened()];
        for expected in ["a", "b", "c"] {
            let Some(Request::Attr { name }) = worker.recv().await else {
                panic!("expected attr request");
            };
            assert_eq!(name, expected);
            responses.push(Response::Ok(vec![json!(format!("value of {name}"))]));
        }
        worker.send_chunked(responses, 1, Duration::ZERO).await;

        let values = futures::future::join_all([a, b, c]).await;
        assert_eq!(
            values,
            vec![
                Ok(json!("value of a")),
                Ok(json!("value of b")),
                Ok(json!("value of c"))
            ]
        );
        assert_eq!(conn.state(), ConnState::Open);
        conn.ready().await.unwrap();
    }

    #[tokio::test]
    async fn statement_error_leaves_connection_open() {
        let (config, events) = recording();
        let (conn, _driver, mut worker) = fake(config);

        let line = line!() + 1;
        let bad = conn.exec("selec", &[]);
        let good = conn.exec("select", &[json!(1)]);

        for _ in 0..3 {
            worker.recv().await.unwrap();
        }
        worker.send(opened()).await;
        worker.send(Response::Err("syntax error".into())).await;
        let rows = ExecResult {
            columns: vec!["n".into()],
            rows: vec![vec![json!(1)]],
            status: -1,
        };
        worker.send(Response::Ok(rows.clone().into_values())).await;

        assert_eq!(bad.await, Err(DbError::Backend("syntax error".into())));
        assert_eq!(good.await.unwrap(), rows);
        assert_eq!(conn.state(), ConnState::Open);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].fatal);
        assert_eq!(events[0].file(), file!());
        assert_eq!(events[0].line(), line);
    }

    #[tokio::test]
    async fn worker_exit_fails_everything_once() {
        let (config, events) = recording();
        let (conn, driver, mut worker) = fake(config);

        let line = line!() + 1;
        let first = conn.exec("select", &[]);
        let second = conn.commit();

        for _ in 0..3 {
            worker.recv().await.unwrap();
        }
        worker.send(opened()).await;
        drop(worker);

        assert_eq!(first.await, Err(DbError::Disconnected));
        assert_eq!(second.await, Err(DbError::Disconnected));
        driver.await.unwrap();

        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(conn.last_error(), Some(DbError::Disconnected));
        assert_eq!(conn.begin_work().await, Err(DbError::Disconnected));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].fatal);
        assert_eq!(events[0].error, DbError::Disconnected);
        assert_eq!(events[0].line(), line);
    }

    #[tokio::test]
    async fn inactivity_timeout_is_fatal() {
        let (config, events) = recording();
        let (conn, driver, mut worker) = fake(config.with_timeout(Duration::from_millis(200)));

        let line = line!() + 1;
        let slow = conn.exec("slow", &[]);
        let queued = conn.exec("select", &[]);

        for _ in 0..3 {
            worker.recv().await.unwrap();
        }
        let started = Instant::now();
        worker.send(opened()).await;

        assert_eq!(slow.await, Err(DbError::Timeout));
        assert_eq!(queued.await, Err(DbError::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(150));
        driver.await.unwrap();

        // The driver closed its end.
        assert!(worker.recv().await.is_none());

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error, DbError::Timeout);
        assert_eq!(events[0].line(), line);
    }

    #[tokio::test]
    async fn trickling_response_outlives_the_timeout() {
        let (config, events) = recording();
        let (conn, _driver, mut worker) = fake(config.with_timeout(Duration::from_millis(200)));

        let reply = conn.attr("big");
        worker.recv().await.unwrap();
        worker.recv().await.unwrap();

        let big = "x".repeat(300);
        let responses = vec![opened(), Response::Ok(vec![json!(big)])];
        // About a second in total, never idle for more than 50ms.
        worker
            .send_chunked(responses, 16, Duration::from_millis(50))
            .await;

        assert_eq!(reply.await.unwrap(), json!(big));
        assert_eq!(conn.state(), ConnState::Open);
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_failure_goes_to_the_connect_hook() {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        let config = ConnectConfig::new("fail").with_on_connect(move |ok| sink.lock().unwrap().push(ok));
        let (conn, driver, mut worker) = fake(config);

        worker.recv().await.unwrap();
        worker
            .send(Response::Err("unable to open database file".into()))
            .await;

        assert_eq!(
            conn.ready().await,
            Err(DbError::Backend("unable to open database file".into()))
        );
        driver.await.unwrap();
        assert_eq!(*outcomes.lock().unwrap(), vec![false]);
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn successful_open_notifies_once() {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        let config = ConnectConfig::new("memory").with_on_connect(move |ok| sink.lock().unwrap().push(ok));
        let (conn, _driver, mut worker) = fake(config);

        worker.recv().await.unwrap();
        worker.send(opened()).await;
        conn.ready().await.unwrap();

        let reply = conn.rollback();
        worker.recv().await.unwrap();
        worker.send(Response::Ok(vec![])).await;
        reply.await.unwrap();

        assert_eq!(*outcomes.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn close_fails_outstanding_requests() {
        let (conn, driver, mut worker) = fake(ConnectConfig::new("memory"));
        let pending = conn.exec("select", &[]);
        worker.recv().await.unwrap();
        worker.recv().await.unwrap();

        conn.close().await;
        assert_eq!(pending.await, Err(DbError::Closed));
        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(conn.last_error(), None);
        assert!(worker.recv().await.is_none());
        assert_eq!(conn.attr("x").await, Err(DbError::Closed));

        // Closing twice is harmless.
        conn.close().await;
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn stray_response_is_a_protocol_error() {
        let (config, events) = recording();
        let (conn, driver, mut worker) = fake(config);

        worker.recv().await.unwrap();
        worker.send(opened()).await;
        worker.send(Response::Ok(vec![json!("stray")])).await;

        driver.await.unwrap();
        assert_eq!(conn.state(), ConnState::Closed);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].error, DbError::Protocol(_)));
    }

    #[tokio::test]
    async fn dropping_every_handle_closes_the_channel() {
        let (conn, driver, mut worker) = fake(ConnectConfig::new("memory"));
        let clone = conn.clone();
        worker.recv().await.unwrap();
        worker.send(opened()).await;
        clone.ready().await.unwrap();

        drop(conn);
        drop(clone);
        assert!(worker.recv().await.is_none());
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn large_requests_are_written_in_pieces() {
        let (conn, _driver, mut worker) = fake(ConnectConfig::new("memory"));
        let blob = "z".repeat(4 * 1024 * 1024);
        let reply = conn.exec("echo", &[json!(blob)]);

        worker.recv().await.unwrap();
        let Some(Request::Exec { sql, args }) = worker.recv().await else {
            panic!("expected exec request");
        };
        assert_eq!(sql, "echo");
        assert_eq!(args[0].as_str().map(str::len), Some(blob.len()));

        worker.send(opened()).await;
        worker
            .send(Response::Ok(ExecResult::default().into_values()))
            .await;
        assert_eq!(reply.await.unwrap(), ExecResult::default());
    }
}
