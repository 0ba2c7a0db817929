#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(request) = iperf_mesh::fuzzing::normalize_client_start_input(data) {
        debug_assert!(request.port > 0);
        debug_assert!(!request.target.is_empty());
        debug_assert!(request.validate().is_ok());
    }
});
