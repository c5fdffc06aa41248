//! Hypervisor launcher abstraction.
//!
//! Allows swapping QEMU for a stand-in process in tests without changing
//! the controller.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use vos_core::{CertificateBundle, Ports, ResourceSpec, RunId};

use crate::{ProcessHandle, VmError};

/// Everything needed to spawn one VM run.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct LaunchRequest {
    pub run_id: RunId,
    pub resources: ResourceSpec,
    pub image: PathBuf,
    pub shared_dir: PathBuf,
    pub ports: Ports,
}

impl LaunchRequest {
    #[must_use]
    pub fn new(resources: ResourceSpec, image: PathBuf, shared_dir: PathBuf, ports: Ports) -> Self {
        Self { run_id: RunId::new(), resources, image, shared_dir, ports }
    }

    /// The bundle the guest writes into the shared directory.
    #[must_use]
    pub fn certificates(&self) -> CertificateBundle {
        CertificateBundle::in_dir(&self.shared_dir)
    }
}

/// Spawns the hypervisor process for one run.
///
/// Implementations must be `Send + Sync` so the controller can share them
/// across tasks.
#[async_trait]
pub trait VmLauncher: Send + Sync + 'static {
    /// Validate preconditions and spawn the process.
    ///
    /// The returned process keeps running until the controller's watchdog
    /// terminates it; dropping the handle does not stop the VM.
    ///
    /// # Errors
    /// Returns [`VmError::PreconditionMissing`] before spawning if the image
    /// or binary is absent, [`VmError::BinaryNotFound`] or
    /// [`VmError::PermissionDenied`] if the OS refuses to execute the binary,
    /// and [`VmError::SpawnFailed`] for any other spawn failure.
    async fn launch(&self, request: &LaunchRequest) -> Result<ProcessHandle, VmError>;
}

/// Precondition work every launcher performs before spawning.
///
/// Checks that the image and binary exist, creates the shared directory and
/// deletes certificates left over from a previous run so their presence can
/// only mean the new guest wrote them.
///
/// # Errors
/// Returns [`VmError::PreconditionMissing`] for an absent image or binary and
/// [`VmError::Io`] if the shared directory cannot be prepared.
pub async fn prepare(binary: &Path, request: &LaunchRequest) -> Result<(), VmError> {
    if !request.image.is_file() {
        return Err(VmError::PreconditionMissing {
            what: "boot image",
            path: request.image.clone(),
        });
    }
    locate_binary(binary)?;

    tokio::fs::create_dir_all(&request.shared_dir).await?;

    let removed = request.certificates().remove_stale()?;
    if removed > 0 {
        tracing::debug!(
            removed,
            dir = %request.shared_dir.display(),
            "removed stale certificates"
        );
    }
    Ok(())
}

/// Resolve `binary` to an existing file, searching `PATH` for bare names.
///
/// # Errors
/// Returns [`VmError::PreconditionMissing`] if nothing is found.
pub fn locate_binary(binary: &Path) -> Result<PathBuf, VmError> {
    let missing = || VmError::PreconditionMissing {
        what: "hypervisor binary",
        path: binary.to_owned(),
    };

    if binary.components().count() > 1 {
        return if binary.is_file() { Ok(binary.to_owned()) } else { Err(missing()) };
    }

    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).map(|dir| dir.join(binary)).collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter()
        .find(|candidate| candidate.is_file())
        .ok_or_else(missing)
}

/// Map a spawn failure onto the launch error taxonomy.
#[must_use]
pub fn classify_spawn_error(binary: &Path, err: &io::Error) -> VmError {
    match err.kind() {
        io::ErrorKind::NotFound => VmError::BinaryNotFound { path: binary.to_owned() },
        io::ErrorKind::PermissionDenied => VmError::PermissionDenied { path: binary.to_owned() },
        _ => VmError::SpawnFailed(format!("exec {}: {err}", binary.display())),
    }
}
