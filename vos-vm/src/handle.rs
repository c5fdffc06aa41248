//! Handles describing a launched hypervisor process.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use vos_core::{Ports, ResourceSpec, RunId};

use crate::launcher::LaunchRequest;

/// The spawned hypervisor process.
///
/// Dropping this handle does NOT terminate the VM. Ownership passes to the
/// watchdog, which is the only thing allowed to signal or reap the process.
#[derive(Debug)]
#[non_exhaustive]
pub struct ProcessHandle {
    /// OS process id, if the process had not been reaped at spawn time.
    pub pid: Option<u32>,

    pub child: tokio::process::Child,

    pub started_at: DateTime<Utc>,
}

impl ProcessHandle {
    #[must_use]
    pub fn new(child: tokio::process::Child) -> Self {
        Self {
            pid: child.id(),
            child,
            started_at: Utc::now(),
        }
    }
}

/// Identity of the VM a controller is currently responsible for.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct VmInstance {
    pub run_id: RunId,
    pub image: PathBuf,
    pub shared_dir: PathBuf,
    pub ports: Ports,
    pub resources: ResourceSpec,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

impl VmInstance {
    #[must_use]
    pub fn new(request: &LaunchRequest, process: &ProcessHandle) -> Self {
        Self {
            run_id: request.run_id,
            image: request.image.clone(),
            shared_dir: request.shared_dir.clone(),
            ports: request.ports,
            resources: request.resources,
            pid: process.pid,
            started_at: process.started_at,
        }
    }
}
