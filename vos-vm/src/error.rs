//! Error types for the VM crate.

use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur during VM lifecycle operations.
///
/// Only fatal outcomes live here. A console that never connects and a
/// handshake that fails while the guest is still booting are reported as
/// log lines, not errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum VmError {
    /// A file the launch depends on is absent.
    #[error("{what} not found at {path}")]
    PreconditionMissing { what: &'static str, path: PathBuf },

    /// The OS could not find the hypervisor executable at spawn time.
    #[error("hypervisor binary not found at {path}")]
    BinaryNotFound { path: PathBuf },

    /// The OS refused to execute the hypervisor.
    #[error("permission denied executing {path}")]
    PermissionDenied { path: PathBuf },

    /// Spawning failed for any other reason.
    #[error("VM spawn failed: {0}")]
    SpawnFailed(String),

    /// The engine did not become reachable within the readiness budget.
    #[error("engine not ready after {}s", elapsed.as_secs())]
    ReadinessTimeout { elapsed: Duration },

    /// The hypervisor exited before the engine became ready.
    #[error(
        "VM exited unexpectedly (exit code {})",
        code.map_or_else(|| "unknown".to_owned(), |c| c.to_string())
    )]
    UnexpectedExit { code: Option<i32> },

    /// The controller has been shut down and accepts no further starts.
    #[error("VM is shutting down")]
    ShuttingDown,

    /// TLS configuration or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Engine API request failed.
    #[error("engine API error: {0}")]
    Engine(String),

    /// The engine handle was closed by the controller.
    #[error("engine connection closed")]
    EngineClosed,

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
