//! Process watchdog.
//!
//! The watchdog task owns the hypervisor `Child`. It reports a natural exit
//! through a callback and, on request, terminates the process: graceful
//! signal first, forced kill once the grace period runs out.

use std::fmt;
use std::future::Future;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::ProcessHandle;

/// How the process came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// Exited on its own.
    Exited,
    /// Exited within the grace period after the terminate signal.
    Terminated,
    /// Had to be killed.
    Killed,
}

impl fmt::Display for ExitCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Exited => "exited on its own",
            Self::Terminated => "terminated gracefully",
            Self::Killed => "killed after the grace period",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub status: Option<ExitStatus>,
    pub cause: ExitCause,
}

impl ExitReport {
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }
}

/// Handle to the task supervising one hypervisor process.
#[derive(Debug)]
pub struct Watchdog {
    pid: Option<u32>,
    shutdown: Option<oneshot::Sender<Duration>>,
    task: JoinHandle<ExitReport>,
}

impl Watchdog {
    /// Start supervising `process`.
    ///
    /// `on_exit` runs only when the process exits without having been asked
    /// to, and runs on the watchdog task.
    pub fn spawn<F, Fut>(process: ProcessHandle, on_exit: F) -> Self
    where
        F: FnOnce(ExitReport) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let pid = process.pid;
        let mut child = process.child;
        let (tx, rx) = oneshot::channel::<Duration>();

        let task = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let report = ExitReport { status: status.ok(), cause: ExitCause::Exited };
                    tracing::debug!(?pid, code = ?report.code(), "hypervisor exited");
                    on_exit(report).await;
                    report
                }
                Ok(grace) = rx => terminate(&mut child, pid, grace).await,
            }
        });

        Self { pid, shutdown: Some(tx), task }
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Terminate the process and wait until it has been reaped.
    ///
    /// If it already exited on its own, returns that exit instead.
    pub async fn shutdown(mut self, grace: Duration) -> ExitReport {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(grace);
        }
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(pid = ?self.pid, "watchdog task failed: {e}");
                ExitReport { status: None, cause: ExitCause::Killed }
            }
        }
    }
}

async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) -> ExitReport {
    if let Ok(Some(status)) = child.try_wait() {
        return ExitReport { status: Some(status), cause: ExitCause::Exited };
    }

    send_terminate(child);

    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        tracing::info!(?pid, "hypervisor terminated gracefully");
        return ExitReport { status: status.ok(), cause: ExitCause::Terminated };
    }

    tracing::warn!(?pid, grace_secs = grace.as_secs(), "hypervisor ignored terminate; killing");
    if let Err(e) = child.kill().await {
        tracing::error!(?pid, "kill failed: {e}");
    }
    ExitReport { status: child.try_wait().ok().flatten(), cause: ExitCause::Killed }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(raw) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        tracing::debug!(pid = raw, "SIGTERM failed: {e}");
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!("terminate failed: {e}");
    }
}
