//! Core types for vos, a host for one local VM running a container engine.
//!
//! Defines the resource planner, port and certificate layout shared with the
//! guest, lifecycle states and the notifications published on transitions,
//! and the file-backed configuration.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod certs;
pub mod config;
pub mod error;
pub mod id;
pub mod log;
pub mod ports;
pub mod resources;
pub mod state;

pub use certs::CertificateBundle;
pub use config::VosConfig;
pub use error::CoreError;
pub use id::RunId;
pub use log::{LogLevel, LogLine, LogSource};
pub use ports::Ports;
pub use resources::{plan, HostCapacity, ResourceSpec};
pub use state::{StateChange, TransitionReason, VmState};
