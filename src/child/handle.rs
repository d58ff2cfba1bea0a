//! Handle to the running wrapped tool.

use super::env::ChildEnvironment;
use super::error::ChildError;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How the child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// Exited normally with this code.
    Exited(i32),
    /// Killed by this signal number.
    Signaled(i32),
    /// Neither a code nor a signal was reported.
    Unknown,
}

impl ChildExit {
    /// Classify an exit status.
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            ChildExit::Exited(code)
        } else if let Some(signal) = status.signal() {
            ChildExit::Signaled(signal)
        } else {
            ChildExit::Unknown
        }
    }

    /// The child's own exit code, or `abnormal` when it was killed by a
    /// signal or reported nothing.
    ///
    /// `abnormal` must be a code the wrapper reserves: a child that exits
    /// with, say, 143 on its own would otherwise look like one killed by
    /// `SIGTERM`.
    pub fn code_or(self, abnormal: i32) -> i32 {
        match self {
            ChildExit::Exited(code) => code,
            ChildExit::Signaled(_) | ChildExit::Unknown => abnormal,
        }
    }
}

/// Resolve the tool to an executable path.
///
/// Absolute paths and paths containing a separator are used as given;
/// bare names are looked up on `PATH`.
pub fn resolve_program(program: &str) -> Result<PathBuf, ChildError> {
    let not_found = |reason: String| ChildError::NotFound {
        program: program.to_string(),
        reason,
    };

    if program.contains('/') {
        let path = PathBuf::from(program);
        if path.is_file() {
            Ok(path)
        } else {
            Err(not_found("no such file".to_string()))
        }
    } else {
        which::which(program).map_err(|e| not_found(e.to_string()))
    }
}

/// A spawned child process with inherited standard streams.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    /// PID of the child.
    pub pid: u32,
}

impl ChildProcess {
    /// Launch `program` with `args` and exactly the variables in `env`.
    pub fn spawn(
        program: &Path,
        args: &[String],
        env: &ChildEnvironment,
    ) -> Result<Self, ChildError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        env.apply(&mut cmd);

        let child = cmd.spawn().map_err(|source| ChildError::Spawn {
            program: program.to_path_buf(),
            source,
        })?;
        let pid = child.id();
        debug!("Spawned {:?} with PID {}", program, pid);

        Ok(Self { child, pid })
    }

    /// Block until the child exits.
    pub fn wait(&mut self) -> Result<ChildExit, ChildError> {
        self.child
            .wait()
            .map(ChildExit::from_status)
            .map_err(ChildError::Wait)
    }

    /// Send a signal to the child.
    pub fn signal(&self, signal: Signal) -> Result<(), ChildError> {
        send_signal(self.pid, signal)
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), ChildError> {
    kill(Pid::from_raw(pid as i32), signal).map_err(ChildError::Signal)
}

/// Keeps the wrapper alive through terminal and service-manager signals.
///
/// `SIGINT` is swallowed (the terminal already delivers it to the child's
/// process group); `SIGTERM` and `SIGHUP` are forwarded to the child. The
/// handlers are installed before the child exists: a signal arriving before
/// [`attach`](Self::attach) is held and delivered once the child is known.
/// Forwarding stops when this value is dropped.
pub struct SignalForwarder {
    target: Arc<Mutex<ForwardTarget>>,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct ForwardTarget {
    pid: Option<u32>,
    pending: Option<Signal>,
}

impl SignalForwarder {
    /// Install the handlers on `runtime`.
    pub fn install(runtime: &Handle) -> Result<Self, ChildError> {
        let _guard = runtime.enter();
        let mut interrupt = signal(SignalKind::interrupt()).map_err(ChildError::SignalSetup)?;
        let mut terminate = signal(SignalKind::terminate()).map_err(ChildError::SignalSetup)?;
        let mut hangup = signal(SignalKind::hangup()).map_err(ChildError::SignalSetup)?;

        let target = Arc::new(Mutex::new(ForwardTarget::default()));
        let task_target = target.clone();

        let task = runtime.spawn(async move {
            loop {
                let forward = tokio::select! {
                    Some(()) = interrupt.recv() => {
                        debug!("SIGINT received, leaving it to the child");
                        continue;
                    }
                    Some(()) = terminate.recv() => Signal::SIGTERM,
                    Some(()) = hangup.recv() => Signal::SIGHUP,
                    else => break,
                };

                let mut target = task_target.lock().unwrap_or_else(PoisonError::into_inner);
                match target.pid {
                    Some(pid) => deliver(pid, forward),
                    None => {
                        debug!("{} received before the child started, holding it", forward);
                        target.pending = Some(forward);
                    }
                }
            }
        });

        Ok(Self { target, task })
    }

    /// Start forwarding to the child with `pid`, delivering any held signal.
    pub fn attach(&self, pid: u32) {
        let mut target = self.target.lock().unwrap_or_else(PoisonError::into_inner);
        target.pid = Some(pid);
        if let Some(held) = target.pending.take() {
            deliver(pid, held);
        }
    }
}

fn deliver(pid: u32, signal: Signal) {
    debug!("Forwarding {} to child {}", signal, pid);
    if let Err(e) = send_signal(pid, signal) {
        warn!("{}", e);
    }
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        self.task.abort();
    }
}
