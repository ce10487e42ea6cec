//! Conversions between [`DataValue`] and other representations
//!
//! - `serde::Serialize`, so decoded records can be written as JSON or any
//!   other serde format. `Uint128` becomes a decimal string since most
//!   formats cannot carry it; `Bytes` becomes an array of numbers.
//! - [`DataValue::from_json`] for building records from JSON documents.
//! - [`DataValue::pretty`] and `Display` for human-readable output.

use crate::data_section::DataValue;
use crate::error::{MmdbError, Result};
use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::fmt;

impl Serialize for DataValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            DataValue::String(s) => serializer.serialize_str(s),
            DataValue::Double(d) => serializer.serialize_f64(*d),
            DataValue::Bytes(b) => {
                let mut seq = serializer.serialize_seq(Some(b.len()))?;
                for byte in b {
                    seq.serialize_element(byte)?;
                }
                seq.end()
            }
            DataValue::Uint16(u) => serializer.serialize_u16(*u),
            DataValue::Uint32(u) => serializer.serialize_u32(*u),
            DataValue::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            DataValue::Int32(i) => serializer.serialize_i32(*i),
            DataValue::Uint64(u) => serializer.serialize_u64(*u),
            DataValue::Uint128(u) => serializer.collect_str(u),
            DataValue::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            DataValue::Bool(b) => serializer.serialize_bool(*b),
            DataValue::Float(f) => serializer.serialize_f32(*f),
        }
    }
}

impl DataValue {
    /// Convert a JSON document into a value
    ///
    /// Numbers map to the narrowest natural type: non-negative integers to
    /// `Uint32` (or `Uint64` when larger), negative integers to `Int32`,
    /// everything else to `Double`. JSON `null` has no MMDB counterpart and
    /// is rejected.
    ///
    /// # Example
    /// ```
    /// use mmdb_reader::DataValue;
    ///
    /// let value = DataValue::from_json(&serde_json::json!({"asn": 64496}))?;
    /// assert_eq!(value.get("asn"), Some(&DataValue::Uint32(64496)));
    /// # Ok::<(), mmdb_reader::MmdbError>(())
    /// ```
    pub fn from_json(json: &serde_json::Value) -> Result<DataValue> {
        match json {
            serde_json::Value::Null => Err(MmdbError::Build(
                "JSON null cannot be stored in an MMDB data section".to_string(),
            )),
            serde_json::Value::Bool(b) => Ok(DataValue::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    Ok(match u32::try_from(u) {
                        Ok(u) => DataValue::Uint32(u),
                        Err(_) => DataValue::Uint64(u),
                    })
                } else if let Some(i) = n.as_i64() {
                    i32::try_from(i).map(DataValue::Int32).map_err(|_| {
                        MmdbError::Build(format!("Integer {} does not fit in int32", i))
                    })
                } else if let Some(f) = n.as_f64() {
                    Ok(DataValue::Double(f))
                } else {
                    Err(MmdbError::Build(format!("Unsupported JSON number {}", n)))
                }
            }
            serde_json::Value::String(s) => Ok(DataValue::String(s.clone())),
            serde_json::Value::Array(arr) => {
                let items = arr
                    .iter()
                    .map(DataValue::from_json)
                    .collect::<Result<Vec<_>>>()?;
                Ok(DataValue::Array(items))
            }
            serde_json::Value::Object(obj) => {
                let entries = obj
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), DataValue::from_json(v)?)))
                    .collect::<Result<IndexMap<_, _>>>()?;
                Ok(DataValue::Map(entries))
            }
        }
    }

    /// Render as an indented tree
    ///
    /// Maps and arrays put one entry per line, nested `indent` spaces deeper
    /// than their parent. Strings are quoted, everything else is printed
    /// bare.
    ///
    /// ```text
    /// {
    ///   country: {
    ///     iso_code: "US"
    ///   }
    /// }
    /// ```
    pub fn pretty(&self, indent: usize) -> String {
        let mut out = String::new();
        write_pretty(self, indent, 0, &mut out);
        out
    }
}

fn write_pretty(value: &DataValue, indent: usize, level: usize, out: &mut String) {
    let pad = |out: &mut String, level: usize| {
        out.push_str(&" ".repeat(indent * level));
    };

    match value {
        DataValue::Map(entries) if entries.is_empty() => out.push_str("{}"),
        DataValue::Map(entries) => {
            out.push_str("{\n");
            for (key, val) in entries {
                pad(out, level + 1);
                out.push_str(key);
                out.push_str(": ");
                write_pretty(val, indent, level + 1, out);
                out.push('\n');
            }
            pad(out, level);
            out.push('}');
        }
        DataValue::Array(items) if items.is_empty() => out.push_str("[]"),
        DataValue::Array(items) => {
            out.push_str("[\n");
            for item in items {
                pad(out, level + 1);
                write_pretty(item, indent, level + 1, out);
                out.push('\n');
            }
            pad(out, level);
            out.push(']');
        }
        DataValue::String(s) => {
            out.push('"');
            out.push_str(s);
            out.push('"');
        }
        DataValue::Bytes(b) => {
            out.push_str("0x");
            for byte in b {
                out.push_str(&format!("{:02x}", byte));
            }
        }
        DataValue::Double(d) => out.push_str(&d.to_string()),
        DataValue::Float(f) => out.push_str(&f.to_string()),
        DataValue::Uint16(u) => out.push_str(&u.to_string()),
        DataValue::Uint32(u) => out.push_str(&u.to_string()),
        DataValue::Uint64(u) => out.push_str(&u.to_string()),
        DataValue::Uint128(u) => out.push_str(&u.to_string()),
        DataValue::Int32(i) => out.push_str(&i.to_string()),
        DataValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
    }
}

/// Compact JSON
impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}
