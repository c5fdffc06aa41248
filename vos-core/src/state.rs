//! VM lifecycle states and the notifications published on each transition.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::RunId;

/// Lifecycle state of the single managed VM.
///
/// `Stopped → Starting → Ready → Stopping → Stopped`. A boot attempt that
/// fails or times out goes straight from `Starting` back to `Stopped`; the
/// [`TransitionReason`] attached to that change says which.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    /// No run is in progress.
    Stopped,
    /// The hypervisor is running and the engine is not reachable yet.
    Starting,
    /// The engine answered an authenticated ping.
    Ready,
    /// Teardown is in progress.
    Stopping,
}

impl VmState {
    /// `true` for `Starting` and `Ready`, the states in which `Start` is a no-op.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Ready)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Why a transition happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[non_exhaustive]
pub enum TransitionReason {
    /// `Start` spawned the hypervisor.
    StartRequested,
    /// The readiness monitor obtained an engine handle.
    BootFinished,
    /// The hypervisor exited without being asked to.
    UnexpectedExit {
        /// Exit code, `None` when terminated by a signal.
        code: Option<i32>,
    },
    /// The engine did not become reachable within the readiness budget.
    ReadinessTimeout {
        /// Time spent polling, in whole seconds.
        elapsed_secs: u64,
    },
    /// `Stop` was called.
    StopRequested,
}

impl TransitionReason {
    /// `true` for the outcomes that end a boot attempt unsuccessfully.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::UnexpectedExit { .. } | Self::ReadinessTimeout { .. })
    }
}

/// Published once per transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct StateChange {
    /// The run the transition belongs to.
    pub run_id: RunId,
    /// State entered.
    pub state: VmState,
    /// Cause of the transition.
    pub reason: TransitionReason,
    /// When the transition was applied.
    pub at: DateTime<Utc>,
}

impl StateChange {
    /// Creates a change stamped with the current time.
    #[must_use]
    pub fn now(run_id: RunId, state: VmState, reason: TransitionReason) -> Self {
        Self { run_id, state, reason, at: Utc::now() }
    }
}
