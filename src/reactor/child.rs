//! Child process bookkeeping on the default reactor.
//!
//! Processes spawned through [`spawn_tracked`] are recorded in a
//! process-wide map keyed by pid. Their exit is forwarded to the reactor
//! owning the default loop, which resolves the matching [`ChildProcess`].

use std::{
    process::{Command, ExitStatus},
    sync::OnceLock,
    time::{Duration, Instant},
};

use chashmap::CHashMap;
use futures::channel::oneshot;
use tracing::{error, info, warn};

use super::ReactorHandle;
use crate::error::EngineError;

/// How a tracked child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildProcessStatus {
    status: ExitStatus,
    execution_time: Duration,
}

impl ChildProcessStatus {
    pub fn exit_status(&self) -> ExitStatus {
        self.status
    }

    pub fn is_exited(&self) -> bool {
        self.status.code().is_some()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    #[cfg(unix)]
    pub fn is_signaled(&self) -> bool {
        use std::os::unix::process::ExitStatusExt;
        self.status.signal().is_some()
    }

    #[cfg(unix)]
    pub fn term_signal(&self) -> Option<i32> {
        use std::os::unix::process::ExitStatusExt;
        self.status.signal()
    }

    pub fn execution_time(&self) -> Duration {
        self.execution_time
    }
}

struct ChildProcessInfo {
    start_time: Instant,
    status_sender: oneshot::Sender<ChildProcessStatus>,
}

fn child_map() -> &'static CHashMap<u32, ChildProcessInfo> {
    static CHILDREN: OnceLock<CHashMap<u32, ChildProcessInfo>> = OnceLock::new();
    CHILDREN.get_or_init(CHashMap::new)
}

/// A running child process spawned through [`spawn_tracked`].
pub struct ChildProcess {
    pid: u32,
    status: oneshot::Receiver<ChildProcessStatus>,
}

impl ChildProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Resolves once the default reactor has observed the exit.
    ///
    /// Returns `None` if the reactor stopped before the exit was delivered.
    pub async fn wait(self) -> Option<ChildProcessStatus> {
        self.status.await.ok()
    }
}

/// Spawn `command` and track its exit through `reactor`, which must own
/// the default loop.
pub fn spawn_tracked(
    reactor: &ReactorHandle,
    command: &mut Command,
) -> Result<ChildProcess, EngineError> {
    if !reactor.uses_default_loop() {
        return Err(EngineError::NotDefaultLoop);
    }

    let start_time = Instant::now();
    let mut child = command.spawn()?;
    let pid = child.id();
    let (status_sender, status) = oneshot::channel();
    child_map().insert(
        pid,
        ChildProcessInfo {
            start_time,
            status_sender,
        },
    );

    let reactor = reactor.clone();
    std::thread::Builder::new()
        .name(format!("child-wait-{pid}"))
        .spawn(move || match child.wait() {
            Ok(status) => {
                if let Err(e) = reactor.notify_child_exit(pid, status) {
                    error!(pid, "failed to deliver child exit: {e}");
                    child_map().remove(&pid);
                }
            }
            Err(e) => {
                error!(pid, "failed to wait for child process: {e}");
                child_map().remove(&pid);
            }
        })?;

    Ok(ChildProcess { pid, status })
}

/// Whether `pid` is still awaiting its exit notification.
pub fn is_tracked(pid: u32) -> bool {
    child_map().contains_key(&pid)
}

// runs on the default reactor
pub(crate) fn handle_exit(pid: u32, status: ExitStatus) {
    let Some(info) = child_map().remove(&pid) else {
        error!(
            pid,
            "got exit notification for an untracked child process, \
             probably spawned without spawn_tracked"
        );
        return;
    };

    let execution_time = info.start_time.elapsed();
    match status.code() {
        Some(code) => info!(pid, code, ?execution_time, "child process exited"),
        None => info!(pid, %status, ?execution_time, "child process terminated by signal"),
    }

    let status = ChildProcessStatus {
        status,
        execution_time,
    };
    if info.status_sender.send(status).is_err() {
        warn!(pid, "nobody is waiting for the child process status");
    }
}
