//! Controller configuration and monitor tunables.

use std::path::PathBuf;
use std::time::Duration;

use vos_core::{HostCapacity, Ports, VosConfig};

/// Tunables of the readiness monitor.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct ReadinessSettings {
    /// Overall budget before the run is declared timed out.
    pub timeout: Duration,

    /// First poll interval while the certificates are absent.
    pub initial_interval: Duration,

    /// Growth factor of the poll interval while certificates are absent.
    pub interval_factor: f64,

    /// Cap of the growing poll interval.
    pub max_interval: Duration,

    /// Fixed poll interval once the certificates exist.
    pub imminent_interval: Duration,

    /// Budget of the plain TCP reachability probe.
    pub connect_timeout: Duration,

    /// Budget of one TLS handshake plus ping.
    pub handshake_timeout: Duration,

    /// Diagnostics run on the first handshake failure and every N-th after.
    pub diagnostics_every: u32,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            initial_interval: Duration::from_millis(500),
            interval_factor: 1.2,
            max_interval: Duration::from_secs(2),
            imminent_interval: Duration::from_millis(300),
            connect_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(5),
            diagnostics_every: 10,
        }
    }
}

/// Tunables of the serial console stream.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct ConsoleSettings {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub connect_timeout: Duration,
    pub read_buffer: usize,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            max_attempts: 18,
            initial_delay: Duration::from_millis(500),
            backoff_factor: 1.3,
            max_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
            read_buffer: 4096,
        }
    }
}

/// Everything a [`crate::VmController`] needs, resolved to absolute values.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct ControllerConfig {
    pub hypervisor_binary: PathBuf,
    pub hypervisor_dir: PathBuf,

    /// Working directory of the hypervisor process.
    pub work_dir: PathBuf,

    /// Used when `start` is called without a shared directory.
    pub shared_dir: PathBuf,

    /// Used when `start` is called without an image.
    pub image_path: Option<PathBuf>,

    /// Host the engine API and serial console are reached on.
    pub api_host: String,

    pub ports: Ports,
    pub readiness: ReadinessSettings,
    pub console: ConsoleSettings,

    /// Time between graceful terminate and forced kill on stop.
    pub stop_grace: Duration,

    /// Skips host detection when set.
    pub host: Option<HostCapacity>,
}

impl From<&VosConfig> for ControllerConfig {
    fn from(config: &VosConfig) -> Self {
        Self {
            hypervisor_binary: config.hypervisor_binary_path(),
            hypervisor_dir: config.hypervisor_dir_path(),
            work_dir: config.base_dir.clone(),
            shared_dir: config.shared_dir_path(),
            image_path: config.image_path(),
            api_host: config.api_host.clone(),
            ports: config.ports,
            readiness: ReadinessSettings {
                timeout: config.readiness_timeout(),
                ..ReadinessSettings::default()
            },
            console: ConsoleSettings::default(),
            stop_grace: config.stop_grace(),
            host: None,
        }
    }
}
