#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(settings) = iperf_mesh::fuzzing::agent_settings_from_toml(text) {
            debug_assert!(settings.autostart.iter().all(|port| *port > 0));
            debug_assert!(!settings.stop_grace.is_zero());
        }
    }
});
