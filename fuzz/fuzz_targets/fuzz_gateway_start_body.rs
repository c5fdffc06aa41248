//! Fuzz target: parsing of the `POST /v1/vm/start` body.
//!
//! Arbitrary bytes must never panic; accepted bodies never carry an empty path.

#![no_main]

use libfuzzer_sys::fuzz_target;
use vos_gateway::routes::parse_start_body;

fuzz_target!(|data: &[u8]| {
    if let Ok(body) = parse_start_body(data) {
        for path in [&body.image_path, &body.shared_dir].into_iter().flatten() {
            assert!(!path.as_os_str().is_empty());
        }
    }
});
