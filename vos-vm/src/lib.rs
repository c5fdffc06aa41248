//! Lifecycle controller for the single vos guest VM.
//!
//! Launches the hypervisor, streams the guest's serial console, waits for the
//! guest's container engine to answer over mutual TLS and tears everything
//! down again, publishing state changes and log lines on broadcast channels.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod backoff;
pub mod config;
pub mod console;
pub mod controller;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod events;
pub mod handle;
pub mod host;
pub mod launcher;
pub mod liveness;
pub mod qemu;
pub mod readiness;
pub mod watchdog;

pub use backoff::Backoff;
pub use config::{ConsoleSettings, ControllerConfig, ReadinessSettings};
pub use console::{console_stream, CloseReason, ConsoleEvent, LineBuffer};
pub use controller::VmController;
pub use engine::EngineHandle;
pub use error::VmError;
pub use events::{EventBus, LogSink};
pub use handle::{ProcessHandle, VmInstance};
pub use launcher::{LaunchRequest, VmLauncher};
pub use liveness::Liveness;
pub use qemu::QemuLauncher;
pub use readiness::{ReadinessMonitor, ReadinessOutcome};
pub use watchdog::{ExitCause, ExitReport, Watchdog};
