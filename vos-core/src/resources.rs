//! CPU and memory allocation for the guest VM.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Minimum number of vCPUs handed to the guest.
pub const MIN_CPU_CORES: u32 = 2;

/// Memory floor on small hosts (below [`LARGE_HOST_THRESHOLD_MB`]).
pub const MIN_MEMORY_MB: u64 = 2048;

/// Memory floor once the host is considered large enough for a full engine.
pub const LARGE_HOST_MIN_MEMORY_MB: u64 = 4096;

/// Total host memory from which the generous allocation policy applies.
pub const LARGE_HOST_THRESHOLD_MB: u64 = 6144;

/// Raw host statistics supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct HostCapacity {
    /// Logical CPUs visible to the host OS.
    pub cpus: u32,
    /// Total physical memory in mebibytes.
    pub memory_mb: u64,
}

impl HostCapacity {
    /// Creates a `HostCapacity` from raw counts.
    #[must_use]
    pub fn new(cpus: u32, memory_mb: u64) -> Self {
        Self { cpus, memory_mb }
    }
}

/// Resources allocated to one VM run. Immutable once computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ResourceSpec {
    /// vCPU cores passed to `-smp cores=`.
    pub cpu_cores: u32,
    /// Guest memory in mebibytes.
    pub memory_mb: u64,
}

impl fmt::Display for ResourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpus={}, memory_mb={}", self.cpu_cores, self.memory_mb)
    }
}

/// Compute the guest allocation from host capacity.
///
/// Half of the host CPUs (at least [`MIN_CPU_CORES`]). Hosts with at least
/// [`LARGE_HOST_THRESHOLD_MB`] of memory give half of it to the guest, never
/// less than [`LARGE_HOST_MIN_MEMORY_MB`]; smaller hosts give 60%, never less
/// than [`MIN_MEMORY_MB`].
///
/// # Complexity
/// O(1).
#[must_use]
pub fn plan(host: HostCapacity) -> ResourceSpec {
    let cpu_cores = (host.cpus / 2).max(MIN_CPU_CORES);

    let memory_mb = if host.memory_mb >= LARGE_HOST_THRESHOLD_MB {
        (host.memory_mb / 2).max(LARGE_HOST_MIN_MEMORY_MB)
    } else {
        (host.memory_mb.saturating_mul(3) / 5).max(MIN_MEMORY_MB)
    };

    ResourceSpec { cpu_cores, memory_mb }
}
