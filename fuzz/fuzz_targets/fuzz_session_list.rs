#![no_main]
use libfuzzer_sys::fuzz_target;
use muxherd::backend::{BackendKind, MultiplexerBackend};
use muxherd::exec::CommandOutput;

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary listing output to every backend's parsers
    if let Ok(s) = std::str::from_utf8(data) {
        for kind in BackendKind::all() {
            let backend = kind.backend();
            for exit_code in [0, 1] {
                let output = CommandOutput {
                    exit_code,
                    stdout: s.to_string(),
                    stderr: s.to_string(),
                };
                let _ = backend.parse_session_list(&output);
            }
            let _ = backend.parse_rendered(s);
        }
    }
});
