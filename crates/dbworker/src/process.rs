//! Worker process lifecycle: channel creation, launch, and teardown.
//!
//! Flow:
//! 1. Create a connected socket pair
//! 2. Launch the worker on one end (fork, or exec of `dbworker-exec`)
//! 3. Hand the other end to the connection
//! 4. On drop: SIGTERM the worker, then reap it without blocking the caller

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use nix::errno::Errno;
use nix::sys::signal::{SigHandler, SigSet, SigmaskHow, Signal, kill, signal, sigprocmask};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use tracing::Dispatch;

use crate::error::SpawnError;
use crate::worker::{WorkerConfig, run_executor};

/// Name of the standalone executor program.
pub const EXEC_PROGRAM: &str = "dbworker-exec";

/// Environment variable overriding the executor program path.
pub const EXEC_PROGRAM_ENV: &str = "DBWORKER_EXEC";

/// How the worker process is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LaunchStrategy {
    /// Duplicate the current process and run the executor in the child.
    ///
    /// The child inherits the configured connector and argument builders, so
    /// any backend works. Right after the fork the child restores default
    /// signal dispositions and keeps only stdio and its end of the channel.
    /// It never logs. The connector runs in that child and must not wait on
    /// locks another parent thread may have held at fork time.
    #[default]
    Fork,
    /// Start a fresh executor program with the channel as its standard input.
    ///
    /// Nothing but the channel is inherited. The program decides the backend
    /// (`dbworker-exec` ships SQLite); the configured connector is not used.
    Exec { program: Option<PathBuf> },
}

impl LaunchStrategy {
    pub fn exec() -> Self {
        Self::Exec { program: None }
    }

    pub fn exec_program(program: impl Into<PathBuf>) -> Self {
        Self::Exec {
            program: Some(program.into()),
        }
    }
}

/// Handle to a running worker. Dropping it terminates and reaps the worker.
#[derive(Debug)]
pub struct WorkerProcess {
    pid: Pid,
    signalled: bool,
}

impl WorkerProcess {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            signalled: false,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Ask the worker to exit with SIGTERM.
    ///
    /// Never SIGKILL: a worker killed mid-transaction may leave the
    /// backend's on-disk state inconsistent.
    pub fn terminate(&mut self) {
        if self.signalled {
            return;
        }
        self.signalled = true;
        match kill(self.pid, Signal::SIGTERM) {
            Ok(()) => tracing::debug!(pid = %self.pid, "Sent SIGTERM to worker"),
            Err(Errno::ESRCH) => tracing::trace!(pid = %self.pid, "Worker already gone"),
            Err(e) => tracing::warn!(pid = %self.pid, error = %e, "Failed to signal worker"),
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.terminate();
        reap(self.pid);
    }
}

/// Collect the worker's exit status so no zombie remains.
///
/// A worker that has not exited yet is waited for on a short-lived thread,
/// so this never blocks the event loop.
fn reap(pid: Pid) {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => {
            let spawned = thread::Builder::new()
                .name("dbworker-reaper".to_string())
                .spawn(move || match waitpid(pid, None) {
                    Ok(status) => tracing::debug!(%pid, ?status, "Worker reaped"),
                    Err(e) => tracing::warn!(%pid, error = %e, "Failed to reap worker"),
                });
            if let Err(e) = spawned {
                tracing::warn!(%pid, error = %e, "Failed to start reaper thread");
            }
        }
        Ok(status) => tracing::debug!(%pid, ?status, "Worker reaped"),
        Err(Errno::ECHILD) => tracing::trace!(%pid, "Worker already reaped"),
        Err(e) => tracing::warn!(%pid, error = %e, "Failed to reap worker"),
    }
}

/// Create the channel and launch a worker on its far end.
///
/// Returns the parent's end of the channel (blocking mode) and the process
/// handle.
pub fn spawn_worker(
    strategy: &LaunchStrategy,
    config: &WorkerConfig,
) -> Result<(UnixStream, WorkerProcess), SpawnError> {
    let (parent_end, child_end) = UnixStream::pair().map_err(SpawnError::Channel)?;

    let (parent_end, process) = match strategy {
        LaunchStrategy::Fork => fork_worker(parent_end, child_end, config)?,
        LaunchStrategy::Exec { program } => {
            let program = resolve_exec_program(program.as_deref())?;
            (parent_end, exec_worker(&program, child_end)?)
        }
    };

    tracing::debug!(pid = process.pid(), ?strategy, "Spawned database worker");
    Ok((parent_end, process))
}

fn fork_worker(
    parent_end: UnixStream,
    child_end: UnixStream,
    config: &WorkerConfig,
) -> Result<(UnixStream, WorkerProcess), SpawnError> {
    // SAFETY: the child never returns into the caller. It runs the blocking
    // executor on values it owns and leaves through `_exit`, so the parent's
    // runtime, destructors and atexit handlers never run twice.
    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            drop(child_end);
            Ok((parent_end, WorkerProcess::new(child)))
        }
        ForkResult::Child => {
            // Another parent thread may have held the subscriber's writer at
            // fork time.
            let _quiet = tracing::dispatcher::set_default(&Dispatch::none());
            // The worker must not hold the parent's end, or it would never
            // see end-of-stream.
            drop(parent_end);
            reset_signals();
            close_inherited_fds(child_end.as_raw_fd());
            let config = config.clone();
            let code = panic::catch_unwind(AssertUnwindSafe(move || {
                run_executor(child_end, config).map_or(1, |()| 0)
            }))
            .unwrap_or(2);
            // SAFETY: terminates the child immediately without unwinding.
            unsafe { libc::_exit(code) }
        }
    }
}

/// Undo signal handling inherited from the parent.
///
/// A handler installed by the host (a tokio shutdown listener, say) would
/// otherwise swallow the SIGTERM used for teardown.
fn reset_signals() {
    for sig in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP, Signal::SIGQUIT] {
        // SAFETY: restores a default disposition; no handler code is installed.
        let _ = unsafe { signal(sig, SigHandler::SigDfl) };
    }
    // Writes to a vanished parent surface as EPIPE rather than a signal.
    // SAFETY: as above.
    let _ = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) };
    let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
}

/// Close every descriptor except stdio and `keep`.
///
/// Sibling workers must not hold the parent ends of other connections, or
/// those workers would never see end-of-stream.
fn close_inherited_fds(keep: RawFd) {
    let open: Vec<RawFd> = match std::fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
            .collect(),
        Err(_) => {
            // SAFETY: sysconf only reads a limit.
            let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
            let max = if max < 3 { 1024 } else { max.min(65_536) as RawFd };
            (3..max).collect()
        }
    };
    for fd in open {
        if fd > 2 && fd != keep {
            // SAFETY: nothing in the child owns these descriptors; the
            // directory handle used for listing is already closed.
            unsafe { libc::close(fd) };
        }
    }
}

fn exec_worker(program: &Path, child_end: UnixStream) -> Result<WorkerProcess, SpawnError> {
    tracing::trace!(program = %program.display(), "Launching executor program");
    let child = Command::new(program)
        .stdin(Stdio::from(OwnedFd::from(child_end)))
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()?;

    // std's Child neither kills nor waits on drop; WorkerProcess owns both.
    let pid = Pid::from_raw(child.id() as i32);
    drop(child);
    Ok(WorkerProcess::new(pid))
}

/// Locate the executor program: explicit path, then `DBWORKER_EXEC`, then
/// next to the current executable (or its parent directory), then `PATH`.
pub fn resolve_exec_program(explicit: Option<&Path>) -> Result<PathBuf, SpawnError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    if let Some(path) = std::env::var_os(EXEC_PROGRAM_ENV) {
        return Ok(PathBuf::from(path));
    }

    // Test binaries live in target/<profile>/deps, the program one level up.
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        for candidate in [Some(dir), dir.parent()].into_iter().flatten() {
            let path = candidate.join(EXEC_PROGRAM);
            if path.is_file() {
                return Ok(path);
            }
        }
    }

    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let path = dir.join(EXEC_PROGRAM);
            if path.is_file() {
                return Ok(path);
            }
        }
    }

    Err(SpawnError::ProgramNotFound(format!(
        "{EXEC_PROGRAM} (set {EXEC_PROGRAM_ENV} to its path)"
    )))
}
