//! Host introspection feeding the resource planner.

use sysinfo::System;
use vos_core::HostCapacity;

/// Logical CPUs and total physical memory of this machine.
///
/// Falls back to [`std::thread::available_parallelism`] when the CPU list
/// comes back empty, which happens in some restricted containers.
#[must_use]
pub fn detect() -> HostCapacity {
    let mut system = System::new();
    system.refresh_memory();
    system.refresh_cpu();

    let cpus = match system.cpus().len() {
        0 => std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
        n => n,
    };
    let memory_mb = system.total_memory() / (1024 * 1024);

    let capacity = HostCapacity::new(u32::try_from(cpus).unwrap_or(u32::MAX), memory_mb);
    tracing::debug!(cpus = capacity.cpus, memory_mb = capacity.memory_mb, "host capacity detected");
    capacity
}
