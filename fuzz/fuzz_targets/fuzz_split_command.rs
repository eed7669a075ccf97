#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Command splitting and pattern building must not panic on any input
    if let Ok(s) = std::str::from_utf8(data) {
        let (program, _args) = muxherd::shell::split_command(s);
        let _ = muxherd::shell::program_name(&program);
        let _ = muxherd::process::TabPattern::new(s, Some(std::path::Path::new("/home/fuzz")));
        let _ = muxherd::process::parse_ps_line(s);
    }
});
