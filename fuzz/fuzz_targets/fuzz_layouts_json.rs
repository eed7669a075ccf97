#![no_main]
use libfuzzer_sys::fuzz_target;
use muxherd::backend::BackendKind;
use muxherd::generator::LayoutGenerator;
use muxherd::layout::SessionLayouts;

fuzz_target!(|data: &[u8]| {
    // Try to parse fuzzed bytes as a layouts file and preview every session
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(layouts) = serde_json::from_str::<SessionLayouts>(s) {
            for kind in BackendKind::all() {
                let generator = LayoutGenerator::new(*kind, "/tmp/muxherd-fuzz", None);
                for layout in layouts.iter() {
                    let _ = generator.preview(layout);
                }
            }
        }
    }
});
