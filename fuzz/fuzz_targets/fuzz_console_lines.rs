//! Fuzz target: console line splitting.
//!
//! Feeds arbitrary bytes in arbitrary chunk sizes and checks that emitted
//! lines are trimmed, non-empty, newline-free, and that the pending buffer
//! stays bounded.

#![no_main]

use libfuzzer_sys::fuzz_target;
use vos_vm::console::MAX_LINE_BYTES;
use vos_vm::LineBuffer;

fuzz_target!(|data: &[u8]| {
    let Some((&chunk, rest)) = data.split_first() else {
        return;
    };
    let chunk = usize::from(chunk).max(1);

    let mut buffer = LineBuffer::new();
    for piece in rest.chunks(chunk) {
        for line in buffer.push(piece) {
            assert!(!line.is_empty(), "empty lines are dropped");
            assert!(!line.contains('\n'), "lines are split on newline");
            assert_eq!(line.trim(), line, "lines are trimmed");
        }
        assert!(buffer.pending().len() < MAX_LINE_BYTES, "partial line must be bounded");
    }
});
