#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(legs) = iperf_mesh::fuzzing::plan_legs_from_json(data) {
        debug_assert!(!legs.is_empty());
        for leg in &legs {
            debug_assert!(leg.request.port >= 1024);
        }
    }
});
