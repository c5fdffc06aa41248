use serde::{Deserialize, Serialize};

/// Host API port forwarded into the guest.
pub const DEFAULT_API_PORT: u16 = 23760;

/// Port the container engine listens on inside the guest.
pub const DEFAULT_GUEST_API_PORT: u16 = 2376;

/// Host port of the TCP-backed serial console.
pub const DEFAULT_CONSOLE_PORT: u16 = 12345;

/// The three ports one VM run occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct Ports {
    /// Host side of the engine API forward.
    pub api: u16,
    /// Guest side of the engine API forward.
    pub guest_api: u16,
    /// Host port the hypervisor serves the serial console on.
    pub console: u16,
}

impl Ports {
    /// Creates a port set.
    #[must_use]
    pub fn new(api: u16, guest_api: u16, console: u16) -> Self {
        Self { api, guest_api, console }
    }
}

impl Default for Ports {
    fn default() -> Self {
        Self::new(DEFAULT_API_PORT, DEFAULT_GUEST_API_PORT, DEFAULT_CONSOLE_PORT)
    }
}
