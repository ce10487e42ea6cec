#![no_main]
use libfuzzer_sys::fuzz_target;
use mmdb_reader::{DataDecoder, DecodeLimits};

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }

    // First two bytes pick the offset, the rest is the data section
    let offset = u16::from_le_bytes([data[0], data[1]]) as u32;
    let section = &data[2..];

    let _ = DataDecoder::new(section).decode(offset);

    // Tight limits must fail cleanly too
    let limits = DecodeLimits {
        max_pointer_chain: 2,
        max_depth: 3,
        max_values: 16,
    };
    let _ = DataDecoder::new(section).with_limits(limits).decode(offset);
});
