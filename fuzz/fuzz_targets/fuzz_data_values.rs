#![no_main]
use libfuzzer_sys::fuzz_target;
use mmdb_reader::{DataDecoder, DataEncoder, DataValue, DatabaseBuilder, Reader};

fuzz_target!(|data: &[u8]| {
    if data.len() < 8 {
        return;
    }

    // Build a record of every type from the fuzzed input
    let mut fields = Vec::new();
    let word = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    fields.push(("uint32".to_string(), DataValue::Uint32(word)));
    fields.push(("int32".to_string(), DataValue::Int32(word as i32)));
    fields.push(("uint16".to_string(), DataValue::Uint16(word as u16)));

    let wide = u64::from_le_bytes(data[..8].try_into().unwrap());
    fields.push(("uint64".to_string(), DataValue::Uint64(wide)));
    fields.push(("uint128".to_string(), DataValue::Uint128((wide as u128) << 64 | word as u128)));

    let double = f64::from_bits(wide);
    if double.is_finite() {
        fields.push(("double".to_string(), DataValue::Double(double)));
    }
    fields.push(("bytes".to_string(), DataValue::Bytes(data.to_vec())));
    fields.push(("bool".to_string(), DataValue::Bool(data[0] & 1 == 0)));

    if let Ok(s) = std::str::from_utf8(data) {
        fields.push(("string".to_string(), DataValue::String(s.to_string())));
        fields.push((
            "array".to_string(),
            DataValue::Array(vec![DataValue::String(s.to_string()), DataValue::Uint32(42)]),
        ));
    }

    let record = DataValue::Map(fields.into_iter().collect());

    // Encoder and decoder must agree
    let mut encoder = DataEncoder::new();
    let offset = encoder.encode(&record).unwrap();
    let bytes = encoder.into_bytes();
    assert_eq!(DataDecoder::new(&bytes).decode(offset).unwrap(), record);

    // And a full database must return the record
    let mut builder = DatabaseBuilder::new();
    builder.add_ip("1.2.3.0/24", record.clone()).unwrap();
    let reader = Reader::from_bytes(builder.build().unwrap()).unwrap();
    assert_eq!(reader.lookup_str("1.2.3.4").unwrap(), Some(record));
});
