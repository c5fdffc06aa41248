//! Fuzz target: resource planning over arbitrary host capacities.

#![no_main]

use libfuzzer_sys::fuzz_target;
use vos_core::resources::{MIN_CPU_CORES, MIN_MEMORY_MB};
use vos_core::{plan, HostCapacity};

fuzz_target!(|input: (u32, u64)| {
    let (cpus, memory_mb) = input;
    let spec = plan(HostCapacity::new(cpus, memory_mb));

    assert!(spec.cpu_cores >= MIN_CPU_CORES);
    assert!(spec.memory_mb >= MIN_MEMORY_MB);
    if cpus >= 2 * MIN_CPU_CORES {
        assert!(spec.cpu_cores <= cpus, "never more cores than the host has");
    }
});
