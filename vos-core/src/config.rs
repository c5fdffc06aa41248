//! File-backed configuration.
//!
//! The file is JSON; every key is optional and overlays the defaults, so a
//! config written by an older release keeps loading.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ports::Ports;

/// Name of the hypervisor executable looked up inside `hypervisor_dir`.
#[cfg(windows)]
pub const DEFAULT_HYPERVISOR_BINARY: &str = "qemu-system-x86_64.exe";

/// Name of the hypervisor executable looked up inside `hypervisor_dir`.
#[cfg(not(windows))]
pub const DEFAULT_HYPERVISOR_BINARY: &str = "qemu-system-x86_64";

/// Top-level configuration for the VM host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct VosConfig {
    /// Directory every relative path below is resolved against. Also the
    /// hypervisor's working directory.
    pub base_dir: PathBuf,
    /// Directory holding the hypervisor binary, its firmware (`-L`) and
    /// bundled boot images.
    pub hypervisor_dir: PathBuf,
    /// Hypervisor executable, relative to `hypervisor_dir` unless absolute.
    pub hypervisor_binary: PathBuf,
    /// Default directory shared with the guest.
    pub shared_dir: PathBuf,
    /// Boot image used when `Start` is called without one.
    pub image_path: Option<PathBuf>,
    /// Start the VM as soon as the gateway comes up.
    pub autostart: bool,
    /// Address the gateway binds to.
    pub listen_addr: String,
    /// Host the engine API is reached on.
    pub api_host: String,
    /// Port assignment for the run.
    pub ports: Ports,
    /// Readiness budget in seconds.
    pub readiness_timeout_secs: u64,
    /// Grace period between terminate and kill, in seconds.
    pub stop_grace_secs: u64,
}

impl Default for VosConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            hypervisor_dir: PathBuf::from("v-core"),
            hypervisor_binary: PathBuf::from(DEFAULT_HYPERVISOR_BINARY),
            shared_dir: PathBuf::from("shared"),
            image_path: None,
            autostart: false,
            listen_addr: "127.0.0.1:3456".to_owned(),
            api_host: "127.0.0.1".to_owned(),
            ports: Ports::default(),
            readiness_timeout_secs: 300,
            stop_grace_secs: 10,
        }
    }
}

impl VosConfig {
    /// Load a config file, overlaying its keys on the defaults.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    /// Returns [`CoreError::ConfigRead`] if the file cannot be read,
    /// [`CoreError::ConfigParse`] if it is not valid JSON, and
    /// [`CoreError::InvalidConfig`] if validation fails.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(CoreError::ConfigRead { path: path.to_owned(), source });
            }
        };
        let config: Self = serde_json::from_str(&raw)
            .map_err(|source| CoreError::ConfigParse { path: path.to_owned(), source })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<(), CoreError> {
        let ports = [
            ("ports.api", self.ports.api),
            ("ports.guest_api", self.ports.guest_api),
            ("ports.console", self.ports.console),
        ];
        for (field, port) in ports {
            if port == 0 {
                return Err(invalid(field, "port must be non-zero"));
            }
        }
        if self.ports.api == self.ports.console {
            return Err(invalid("ports.console", "must differ from ports.api"));
        }
        if self.readiness_timeout_secs == 0 {
            return Err(invalid("readiness_timeout_secs", "must be at least 1"));
        }
        if self.api_host.trim().is_empty() {
            return Err(invalid("api_host", "must not be empty"));
        }
        Ok(())
    }

    /// Resolve `path` against `base_dir` unless it is absolute.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_owned()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Absolute-or-base-relative hypervisor directory.
    #[must_use]
    pub fn hypervisor_dir_path(&self) -> PathBuf {
        self.resolve(&self.hypervisor_dir)
    }

    /// Full path of the hypervisor executable.
    #[must_use]
    pub fn hypervisor_binary_path(&self) -> PathBuf {
        if self.hypervisor_binary.is_absolute() {
            self.hypervisor_binary.clone()
        } else {
            self.hypervisor_dir_path().join(&self.hypervisor_binary)
        }
    }

    /// Default shared directory.
    #[must_use]
    pub fn shared_dir_path(&self) -> PathBuf {
        self.resolve(&self.shared_dir)
    }

    /// Configured boot image, if any.
    #[must_use]
    pub fn image_path(&self) -> Option<PathBuf> {
        self.image_path.as_deref().map(|p| self.resolve(p))
    }

    #[must_use]
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

fn invalid(field: &str, reason: &str) -> CoreError {
    CoreError::InvalidConfig { field: field.to_owned(), reason: reason.to_owned() }
}
