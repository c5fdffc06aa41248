//! QEMU launcher.
//!
//! Builds the full hypervisor command line for one run and spawns it with
//! detached stdio. Hardware acceleration is probed once per launcher via
//! `-accel help` and cached.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::launcher::{classify_spawn_error, prepare, LaunchRequest, VmLauncher};
use crate::{ControllerConfig, ProcessHandle, VmError};

const ACCEL_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Hardware accelerators QEMU can use on the supported hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accelerator {
    Kvm,
    Hvf,
    Whpx,
}

impl Accelerator {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kvm => "kvm",
            Self::Hvf => "hvf",
            Self::Whpx => "whpx",
        }
    }

    /// The accelerator native to the build target, if any.
    #[must_use]
    pub fn native() -> Option<Self> {
        if cfg!(target_os = "linux") {
            Some(Self::Kvm)
        } else if cfg!(target_os = "macos") {
            Some(Self::Hvf)
        } else if cfg!(windows) {
            Some(Self::Whpx)
        } else {
            None
        }
    }

    /// Pick the native accelerator if the probe listed it.
    #[must_use]
    pub fn select(available: &[String]) -> Option<Self> {
        Self::native().filter(|accel| available.iter().any(|a| a == accel.as_str()))
    }

    /// CPU model to request alongside this accelerator.
    #[must_use]
    pub fn cpu_model(accel: Option<Self>) -> &'static str {
        match accel {
            Some(Self::Kvm | Self::Hvf) => "host",
            Some(Self::Whpx) | None => "qemu64",
        }
    }
}

/// Parse the output of `qemu-system-* -accel help` into lower-case names.
#[must_use]
pub fn parse_accel_help(stdout: &[u8]) -> Vec<String> {
    let mut names: Vec<String> = String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("Accelerators supported"))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_lowercase)
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Render a path with forward slashes, which QEMU accepts on every host.
#[must_use]
pub fn qemu_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// The complete argument list for one run, binary excluded.
#[must_use]
pub fn build_args(
    request: &LaunchRequest,
    firmware_dir: &Path,
    accel: Option<Accelerator>,
) -> Vec<String> {
    let ports = request.ports;
    let mut args = vec![
        "-L".to_owned(),
        qemu_path(firmware_dir),
        "-m".to_owned(),
        request.resources.memory_mb.to_string(),
        "-smp".to_owned(),
        format!("cores={}", request.resources.cpu_cores),
        "-cpu".to_owned(),
        Accelerator::cpu_model(accel).to_owned(),
    ];
    if let Some(accel) = accel {
        args.extend(["-accel".to_owned(), accel.as_str().to_owned()]);
    }
    args.extend([
        "-cdrom".to_owned(),
        qemu_path(&request.image),
        "-boot".to_owned(),
        "d".to_owned(),
        "-netdev".to_owned(),
        format!("user,id=n1,hostfwd=tcp:127.0.0.1:{}-:{}", ports.api, ports.guest_api),
        "-device".to_owned(),
        "virtio-net-pci,netdev=n1".to_owned(),
        "-drive".to_owned(),
        format!("file=fat:rw:{},format=raw,if=virtio", qemu_path(&request.shared_dir)),
        "-serial".to_owned(),
        format!("tcp:127.0.0.1:{},server,nowait", ports.console),
        "-device".to_owned(),
        "virtio-rng-pci".to_owned(),
        "-vga".to_owned(),
        "std".to_owned(),
        "-no-reboot".to_owned(),
    ]);
    args
}

/// Launches `qemu-system-*` for each run.
#[derive(Debug)]
pub struct QemuLauncher {
    binary: PathBuf,
    firmware_dir: PathBuf,
    work_dir: PathBuf,
    accel: OnceCell<Option<Accelerator>>,
}

impl QemuLauncher {
    /// # Arguments
    /// - `binary`: the QEMU system emulator
    /// - `firmware_dir`: directory passed as `-L` (BIOS and option ROMs)
    /// - `work_dir`: working directory of the spawned process
    #[must_use]
    pub fn new(binary: PathBuf, firmware_dir: PathBuf, work_dir: PathBuf) -> Self {
        Self { binary, firmware_dir, work_dir, accel: OnceCell::new() }
    }

    #[must_use]
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(
            config.hypervisor_binary.clone(),
            config.hypervisor_dir.clone(),
            config.work_dir.clone(),
        )
    }

    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Probed accelerator, computed on first use.
    pub async fn accelerator(&self) -> Option<Accelerator> {
        *self.accel.get_or_init(|| probe_accelerator(&self.binary)).await
    }
}

async fn probe_accelerator(binary: &Path) -> Option<Accelerator> {
    let output = Command::new(binary)
        .args(["-accel", "help"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    let stdout = match tokio::time::timeout(ACCEL_PROBE_TIMEOUT, output).await {
        Ok(Ok(out)) if out.status.success() => out.stdout,
        Ok(Ok(out)) => {
            tracing::debug!(status = %out.status, "accelerator probe failed");
            return None;
        }
        Ok(Err(e)) => {
            tracing::debug!("accelerator probe could not run: {e}");
            return None;
        }
        Err(_) => {
            tracing::debug!("accelerator probe timed out");
            return None;
        }
    };

    let available = parse_accel_help(&stdout);
    let accel = Accelerator::select(&available);
    tracing::info!(?available, selected = accel.map(Accelerator::as_str), "hypervisor acceleration probed");
    accel
}

#[async_trait]
impl VmLauncher for QemuLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<ProcessHandle, VmError> {
        prepare(&self.binary, request).await?;

        let accel = self.accelerator().await;
        let args = build_args(request, &self.firmware_dir, accel);

        tracing::info!(
            run_id = %request.run_id,
            binary = %self.binary.display(),
            image = %request.image.display(),
            resources = %request.resources,
            "spawning hypervisor"
        );
        tracing::debug!(args = ?args, "hypervisor command line");

        let child = Command::new(&self.binary)
            .args(&args)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| classify_spawn_error(&self.binary, &e))?;

        let handle = ProcessHandle::new(child);
        tracing::info!(run_id = %request.run_id, pid = ?handle.pid, "hypervisor started");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use vos_core::{HostCapacity, Ports};

    use super::*;

    fn request() -> LaunchRequest {
        LaunchRequest::new(
            vos_core::plan(HostCapacity::new(8, 16_384)),
            PathBuf::from("/vms/boot.iso"),
            PathBuf::from("/home/u/shared"),
            Ports::default(),
        )
    }

    fn arg_after<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn args_carry_resources_ports_and_paths() {
        let args = build_args(&request(), Path::new("/opt/v-core"), Some(Accelerator::Kvm));

        assert_eq!(arg_after(&args, "-L"), ["/opt/v-core"]);
        assert_eq!(arg_after(&args, "-m"), ["8192"]);
        assert_eq!(arg_after(&args, "-smp"), ["cores=4"]);
        assert_eq!(arg_after(&args, "-cpu"), ["host"]);
        assert_eq!(arg_after(&args, "-accel"), ["kvm"]);
        assert_eq!(arg_after(&args, "-cdrom"), ["/vms/boot.iso"]);
        assert_eq!(arg_after(&args, "-netdev"), ["user,id=n1,hostfwd=tcp:127.0.0.1:23760-:2376"]);
        assert_eq!(arg_after(&args, "-serial"), ["tcp:127.0.0.1:12345,server,nowait"]);
        assert_eq!(
            arg_after(&args, "-drive"),
            ["file=fat:rw:/home/u/shared,format=raw,if=virtio"]
        );
        assert_eq!(args.last().map(String::as_str), Some("-no-reboot"));
    }

    #[test]
    fn args_without_acceleration_use_generic_cpu() {
        let args = build_args(&request(), Path::new("/opt/v-core"), None);
        assert!(arg_after(&args, "-accel").is_empty(), "no -accel without a probe hit");
        assert_eq!(arg_after(&args, "-cpu"), ["qemu64"]);
    }

    #[test]
    fn qemu_path_uses_forward_slashes() {
        assert_eq!(qemu_path(Path::new(r"C:\vos\shared")), "C:/vos/shared");
    }

    #[test]
    fn parse_accel_help_skips_header_and_dedups() {
        let out = b"Accelerators supported in QEMU binary:\ntcg\nkvm\n\nKVM\n";
        assert_eq!(parse_accel_help(out), ["kvm", "tcg"]);
    }

    #[test]
    fn select_requires_native_accelerator_in_list() {
        assert_eq!(Accelerator::select(&["tcg".to_owned()]), None);
        if let Some(native) = Accelerator::native() {
            let listed = vec!["tcg".to_owned(), native.as_str().to_owned()];
            assert_eq!(Accelerator::select(&listed), Some(native));
        }
    }

    #[test]
    fn small_host_gets_floor_resources_on_the_command_line() {
        let mut req = request();
        req.resources = vos_core::plan(HostCapacity::new(2, 2048));
        let args = build_args(&req, Path::new("fw"), None);
        assert_eq!(arg_after(&args, "-m"), ["2048"]);
        assert_eq!(arg_after(&args, "-smp"), ["cores=2"]);
    }
}
