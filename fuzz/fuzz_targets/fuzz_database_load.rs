#![no_main]
use libfuzzer_sys::fuzz_target;
use mmdb_reader::Reader;
use std::net::IpAddr;

fuzz_target!(|data: &[u8]| {
    // Opening, looking up and verifying must never panic, even on garbage
    let Ok(reader) = Reader::from_bytes(data.to_vec()) else {
        return;
    };

    let probes: [IpAddr; 4] = [
        IpAddr::from([1, 2, 3, 4]),
        IpAddr::from([255, 255, 255, 255]),
        IpAddr::from([0u8; 16]),
        IpAddr::from([0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]),
    ];
    for ip in probes {
        let _ = reader.lookup_prefix(ip);
    }
    let _ = reader.metadata_value();
    let _ = reader.verify();
});
