#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = canopy::format::IndexHeader::from_bytes(data) {
        let _ = header.file_size();
    }
});
