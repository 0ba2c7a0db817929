#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(line) = std::str::from_utf8(data) {
        for (reverse, parallel) in [(false, 1), (true, 1), (false, 4)] {
            if let Some(sample) = iperf_mesh::fuzzing::parse_metrics_line(line, reverse, parallel) {
                debug_assert!(sample.up_mbps.is_some() != sample.down_mbps.is_some());
            }
        }
    }
});
