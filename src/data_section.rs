//! Data section encoding and decoding
//!
//! Implements the MaxMind DB data section format: a compact, self-describing
//! binary encoding used both for the records the search tree points at and
//! for the metadata map at the end of the file.
//!
//! # Supported Types
//!
//! - **Pointer** (1): Reference to another value in the same section
//! - **String** (2): UTF-8 text, explicit length
//! - **Double** (3): 64-bit floating point (IEEE 754)
//! - **Bytes** (4): Raw byte arrays
//! - **Uint16** (5), **Uint32** (6): Unsigned integers, variable width
//! - **Map** (7): Key-value pairs (string keys, encounter order preserved)
//! - **Int32** (8): Signed 32-bit integer, variable width
//! - **Uint64** (9), **Uint128** (10): Unsigned integers, variable width
//! - **Array** (11): Ordered lists of values
//! - **Bool** (14): Value carried in the size field
//! - **Float** (15): 32-bit floating point (IEEE 754)
//!
//! # Format
//!
//! Every value starts with a control byte: 3 bits of type and 5 bits of
//! size. Type 0 means "extended": the real type is `7 + next byte`. Sizes of
//! 29, 30 and 31 pull 1, 2 or 3 more big-endian bytes and add 29, 285 and
//! 65821 respectively.
//!
//! Pointers are resolved transparently by [`DataDecoder`]; a decoded
//! [`DataValue`] never contains one. Resolution is bounded by
//! [`DecodeLimits`] so that cyclic or exponentially fanned-out pointer graphs
//! in a hostile file produce an error instead of exhausting the stack or
//! memory.
//!
//! See: https://maxmind.github.io/MaxMind-DB/

use crate::error::{MmdbError, Result};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;

const TYPE_EXTENDED: u8 = 0;
const TYPE_POINTER: u8 = 1;
const TYPE_STRING: u8 = 2;
const TYPE_DOUBLE: u8 = 3;
const TYPE_BYTES: u8 = 4;
const TYPE_UINT16: u8 = 5;
const TYPE_UINT32: u8 = 6;
const TYPE_MAP: u8 = 7;
const TYPE_INT32: u8 = 8;
const TYPE_UINT64: u8 = 9;
const TYPE_UINT128: u8 = 10;
const TYPE_ARRAY: u8 = 11;
const TYPE_DATA_CACHE: u8 = 12;
const TYPE_END_MARKER: u8 = 13;
const TYPE_BOOL: u8 = 14;
const TYPE_FLOAT: u8 = 15;

/// Largest payload length the size field can express (65821 + 0xFFFFFF)
pub const MAX_ENCODED_SIZE: usize = 65_821 + 0x00FF_FFFF;

/// A decoded value from the data section
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    /// UTF-8 string
    String(String),
    /// IEEE 754 double precision float
    Double(f64),
    /// Raw byte array
    Bytes(Vec<u8>),
    /// Unsigned 16-bit integer
    Uint16(u16),
    /// Unsigned 32-bit integer
    Uint32(u32),
    /// Key-value map, in the order the keys were encoded
    Map(IndexMap<String, DataValue>),
    /// Signed 32-bit integer
    Int32(i32),
    /// Unsigned 64-bit integer
    Uint64(u64),
    /// Unsigned 128-bit integer
    Uint128(u128),
    /// Array of values
    Array(Vec<DataValue>),
    /// Boolean value
    Bool(bool),
    /// IEEE 754 single precision float
    Float(f32),
}

/// One step of a path into a nested value
///
/// Negative indices count from the end of an array, so `Index(-1)` is the
/// last element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathElement<'a> {
    /// Map key
    Key(&'a str),
    /// Array index
    Index(i64),
}

impl<'a> From<&'a str> for PathElement<'a> {
    fn from(key: &'a str) -> Self {
        PathElement::Key(key)
    }
}

impl DataValue {
    /// Short type name, used in error messages and reports
    pub fn type_name(&self) -> &'static str {
        match self {
            DataValue::String(_) => "utf8_string",
            DataValue::Double(_) => "double",
            DataValue::Bytes(_) => "bytes",
            DataValue::Uint16(_) => "uint16",
            DataValue::Uint32(_) => "uint32",
            DataValue::Map(_) => "map",
            DataValue::Int32(_) => "int32",
            DataValue::Uint64(_) => "uint64",
            DataValue::Uint128(_) => "uint128",
            DataValue::Array(_) => "array",
            DataValue::Bool(_) => "boolean",
            DataValue::Float(_) => "float",
        }
    }

    /// Get the string contents, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get an unsigned integer value that fits in 64 bits
    ///
    /// Accepts every integer type, including non-negative `Int32` and
    /// `Uint128` values small enough to fit.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            DataValue::Uint16(n) => Some(*n as u64),
            DataValue::Uint32(n) => Some(*n as u64),
            DataValue::Uint64(n) => Some(*n),
            DataValue::Uint128(n) => u64::try_from(*n).ok(),
            DataValue::Int32(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }

    /// Get a signed integer value
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DataValue::Int32(n) => Some(*n as i64),
            other => other.as_u64().and_then(|n| i64::try_from(n).ok()),
        }
    }

    /// Get a floating point value (doubles and floats)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DataValue::Double(d) => Some(*d),
            DataValue::Float(f) => Some(*f as f64),
            _ => None,
        }
    }

    /// Get a boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get the map entries, if this is a map
    pub fn as_map(&self) -> Option<&IndexMap<String, DataValue>> {
        match self {
            DataValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Get the array elements, if this is an array
    pub fn as_array(&self) -> Option<&[DataValue]> {
        match self {
            DataValue::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Look up a key in a map value
    pub fn get(&self, key: &str) -> Option<&DataValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Follow a path of map keys and array indices
    ///
    /// ```
    /// use mmdb_reader::{DataValue, PathElement};
    ///
    /// let value = DataValue::from_json(&serde_json::json!({
    ///     "country": { "iso_code": "US" },
    ///     "subdivisions": [{ "iso_code": "CA" }, { "iso_code": "SF" }]
    /// }))?;
    ///
    /// let iso = value.path(&["country".into(), "iso_code".into()]);
    /// assert_eq!(iso.and_then(|v| v.as_str()), Some("US"));
    ///
    /// let last = value.path(&[
    ///     PathElement::Key("subdivisions"),
    ///     PathElement::Index(-1),
    ///     PathElement::Key("iso_code"),
    /// ]);
    /// assert_eq!(last.and_then(|v| v.as_str()), Some("SF"));
    /// # Ok::<(), mmdb_reader::MmdbError>(())
    /// ```
    pub fn path(&self, path: &[PathElement<'_>]) -> Option<&DataValue> {
        let mut current = self;
        for element in path {
            current = match (element, current) {
                (PathElement::Key(key), DataValue::Map(map)) => map.get(*key)?,
                (PathElement::Index(index), DataValue::Array(items)) => {
                    let len = items.len() as i64;
                    let resolved = if *index < 0 { len + index } else { *index };
                    if resolved < 0 || resolved >= len {
                        return None;
                    }
                    &items[resolved as usize]
                }
                _ => return None,
            };
        }
        Some(current)
    }

    /// Number of values in this tree, counting containers and their contents
    pub fn node_count(&self) -> usize {
        match self {
            DataValue::Map(m) => 1 + m.values().map(DataValue::node_count).sum::<usize>(),
            DataValue::Array(a) => 1 + a.iter().map(DataValue::node_count).sum::<usize>(),
            _ => 1,
        }
    }
}

/// Data section encoder
///
/// Builds a data section by encoding values and tracking offsets.
/// Identical top-level values share one offset, and repeated nested values
/// (map keys, sub-maps, strings) are written once and referenced with
/// pointers afterwards whenever the pointer is shorter than the value.
pub struct DataEncoder {
    /// Encoded data buffer
    buffer: Vec<u8>,
    /// Map from pointer-free encoding to the offset where it was written
    /// and the nesting depth decoding it descends below that offset
    dedup_map: FxHashMap<Vec<u8>, (u32, usize)>,
}

impl DataEncoder {
    /// Create a new encoder
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            dedup_map: FxHashMap::default(),
        }
    }

    /// Encode a value and return its offset
    ///
    /// If an identical value was previously encoded, returns the existing
    /// offset without writing anything.
    ///
    /// Fails with [`MmdbError::Build`] if the value nests deeper than a
    /// reader with default [`DecodeLimits`] decodes. Pointers count as a
    /// level, so repeated substructures are written inline instead when a
    /// pointer would cross the limit. On failure nothing is written.
    pub fn encode(&mut self, value: &DataValue) -> Result<u32> {
        let mut canonical = Vec::new();
        encode_plain(value, &mut canonical)?;

        if let Some(&(offset, _)) = self.dedup_map.get(&canonical) {
            return Ok(offset);
        }

        let offset = self.current_offset()?;
        match self.write_value(value, 0) {
            Ok(height) => {
                self.dedup_map.insert(canonical, (offset, height));
                Ok(offset)
            }
            Err(e) => {
                self.buffer.truncate(offset as usize);
                self.dedup_map.retain(|_, entry| entry.0 < offset);
                Err(e)
            }
        }
    }

    /// Get the final encoded data section
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Get current buffer size
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    fn current_offset(&self) -> Result<u32> {
        u32::try_from(self.buffer.len())
            .map_err(|_| MmdbError::Build("Data section exceeds 4 GiB".to_string()))
    }

    /// Write a value that a decoder reaches at `depth`
    ///
    /// Returns how many levels below `depth` decoding it descends.
    fn write_value(&mut self, value: &DataValue, depth: usize) -> Result<usize> {
        match value {
            DataValue::Map(map) => {
                push_header(&mut self.buffer, TYPE_MAP, map.len())?;
                let mut height = 0;
                for (key, child) in map {
                    let key = DataValue::String(key.clone());
                    height = height.max(self.write_child(&key, depth)?);
                    height = height.max(self.write_child(child, depth)?);
                }
                Ok(height)
            }
            DataValue::Array(items) => {
                push_header(&mut self.buffer, TYPE_ARRAY, items.len())?;
                let mut height = 0;
                for child in items {
                    height = height.max(self.write_child(child, depth)?);
                }
                Ok(height)
            }
            scalar => push_scalar(&mut self.buffer, scalar).map(|()| 0),
        }
    }

    /// Write a nested value, or a pointer to an earlier identical copy
    ///
    /// Returns how many levels below `parent_depth` decoding it descends.
    fn write_child(&mut self, value: &DataValue, parent_depth: usize) -> Result<usize> {
        let depth = parent_depth + 1;
        if depth > MAX_DECODE_DEPTH {
            return Err(MmdbError::Build(format!(
                "Value nests deeper than the {} levels a reader decodes",
                MAX_DECODE_DEPTH
            )));
        }

        let mut canonical = Vec::new();
        encode_plain(value, &mut canonical)?;

        if let Some(&(target, height)) = self.dedup_map.get(&canonical) {
            // The target is decoded one level below the pointer itself
            let reach = if height == 0 { 1 } else { 2 + height };
            let mut pointer = Vec::with_capacity(5);
            push_pointer(&mut pointer, target);
            if pointer.len() < canonical.len() && parent_depth + reach <= MAX_DECODE_DEPTH {
                self.buffer.extend_from_slice(&pointer);
                return Ok(reach);
            }
        }

        let offset = self.current_offset()?;
        let height = self.write_value(value, depth)?;
        self.dedup_map.entry(canonical).or_insert((offset, height));
        Ok(1 + height)
    }
}

impl Default for DataEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a value without any pointers
///
/// Used as the deduplication key and for standalone sections such as the
/// metadata map.
pub fn encode_plain(value: &DataValue, buffer: &mut Vec<u8>) -> Result<()> {
    match value {
        DataValue::Map(map) => {
            push_header(buffer, TYPE_MAP, map.len())?;
            for (key, child) in map {
                push_header(buffer, TYPE_STRING, key.len())?;
                buffer.extend_from_slice(key.as_bytes());
                encode_plain(child, buffer)?;
            }
            Ok(())
        }
        DataValue::Array(items) => {
            push_header(buffer, TYPE_ARRAY, items.len())?;
            for child in items {
                encode_plain(child, buffer)?;
            }
            Ok(())
        }
        scalar => push_scalar(buffer, scalar),
    }
}

fn push_scalar(buffer: &mut Vec<u8>, value: &DataValue) -> Result<()> {
    match value {
        DataValue::String(s) => {
            push_header(buffer, TYPE_STRING, s.len())?;
            buffer.extend_from_slice(s.as_bytes());
        }
        DataValue::Double(d) => {
            push_header(buffer, TYPE_DOUBLE, 8)?;
            buffer.extend_from_slice(&d.to_be_bytes());
        }
        DataValue::Bytes(b) => {
            push_header(buffer, TYPE_BYTES, b.len())?;
            buffer.extend_from_slice(b);
        }
        DataValue::Uint16(n) => push_uint(buffer, TYPE_UINT16, *n as u128)?,
        DataValue::Uint32(n) => push_uint(buffer, TYPE_UINT32, *n as u128)?,
        DataValue::Int32(n) => {
            if *n < 0 {
                // Negative values always use the full two's complement width
                push_header(buffer, TYPE_INT32, 4)?;
                buffer.extend_from_slice(&n.to_be_bytes());
            } else {
                push_uint(buffer, TYPE_INT32, *n as u128)?;
            }
        }
        DataValue::Uint64(n) => push_uint(buffer, TYPE_UINT64, *n as u128)?,
        DataValue::Uint128(n) => push_uint(buffer, TYPE_UINT128, *n)?,
        DataValue::Bool(b) => push_header(buffer, TYPE_BOOL, *b as usize)?,
        DataValue::Float(f) => {
            push_header(buffer, TYPE_FLOAT, 4)?;
            buffer.extend_from_slice(&f.to_be_bytes());
        }
        DataValue::Map(_) | DataValue::Array(_) => {
            return Err(MmdbError::Build(format!(
                "{} is not a scalar value",
                value.type_name()
            )))
        }
    }
    Ok(())
}

/// Write an unsigned integer using the fewest big-endian bytes
fn push_uint(buffer: &mut Vec<u8>, type_id: u8, n: u128) -> Result<()> {
    let width = (128 - n.leading_zeros() as usize).div_ceil(8);
    push_header(buffer, type_id, width)?;
    let bytes = n.to_be_bytes();
    buffer.extend_from_slice(&bytes[16 - width..]);
    Ok(())
}

/// Write the control byte(s) for a value of the given type and size
fn push_header(buffer: &mut Vec<u8>, type_id: u8, size: usize) -> Result<()> {
    if size > MAX_ENCODED_SIZE {
        return Err(MmdbError::Build(format!(
            "Value size {} exceeds the encodable maximum {}",
            size, MAX_ENCODED_SIZE
        )));
    }

    let size_bits: u8 = if size < 29 {
        size as u8
    } else if size < 285 {
        29
    } else if size < 65_821 {
        30
    } else {
        31
    };

    if type_id <= TYPE_MAP {
        buffer.push((type_id << 5) | size_bits);
    } else {
        buffer.push((TYPE_EXTENDED << 5) | size_bits);
        buffer.push(type_id - 7);
    }

    match size_bits {
        29 => buffer.push((size - 29) as u8),
        30 => buffer.extend_from_slice(&((size - 285) as u16).to_be_bytes()),
        31 => buffer.extend_from_slice(&((size - 65_821) as u32).to_be_bytes()[1..]),
        _ => {}
    }
    Ok(())
}

/// Write a pointer to `offset` using the smallest size class
pub fn push_pointer(buffer: &mut Vec<u8>, offset: u32) {
    let ctrl = TYPE_POINTER << 5;
    if offset < 2_048 {
        buffer.push(ctrl | ((offset >> 8) & 0x7) as u8);
        buffer.push(offset as u8);
    } else if offset < 526_336 {
        let v = offset - 2_048;
        buffer.push(ctrl | 0x08 | ((v >> 16) & 0x7) as u8);
        buffer.push((v >> 8) as u8);
        buffer.push(v as u8);
    } else if offset < 134_744_064 {
        let v = offset - 526_336;
        buffer.push(ctrl | 0x10 | ((v >> 24) & 0x7) as u8);
        buffer.push((v >> 16) as u8);
        buffer.push((v >> 8) as u8);
        buffer.push(v as u8);
    } else {
        buffer.push(ctrl | 0x18);
        buffer.extend_from_slice(&offset.to_be_bytes());
    }
}

/// Bounds applied while decoding untrusted data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    /// Maximum consecutive pointer hops before a value is reached
    pub max_pointer_chain: usize,
    /// Maximum nesting of maps, arrays and pointer targets
    pub max_depth: usize,
    /// Maximum number of values produced by a single decode call
    pub max_values: usize,
}

/// Default nesting limit, also enforced by [`DataEncoder`]
pub const MAX_DECODE_DEPTH: usize = 64;

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_pointer_chain: 32,
            max_depth: MAX_DECODE_DEPTH,
            max_values: 1 << 20,
        }
    }
}

/// Header of one encoded value
enum Control {
    Pointer(usize),
    Value { type_id: u8, size: usize },
}

/// Per-call decode bookkeeping
#[derive(Default)]
struct DecodeState {
    /// Values produced so far
    values: usize,
    /// Resolved pointer targets: offset -> (value, node count, depth)
    ///
    /// A hit only stands in for a decode at the same or a shallower depth.
    cache: FxHashMap<usize, (DataValue, usize, usize)>,
}

/// Data section decoder
///
/// Decodes values from an encoded section. Offsets, including pointer
/// targets, are relative to the start of `buffer`.
pub struct DataDecoder<'a> {
    buffer: &'a [u8],
    limits: DecodeLimits,
}

impl<'a> DataDecoder<'a> {
    /// Create a decoder for a data section
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            limits: DecodeLimits::default(),
        }
    }

    /// Replace the default decode limits
    pub fn with_limits(mut self, limits: DecodeLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Size of the section this decoder reads from
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True if the section is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Decode the value at the given offset
    pub fn decode(&self, offset: u32) -> Result<DataValue> {
        self.decode_with_end(offset).map(|(value, _)| value)
    }

    /// Decode the value at the given offset and return where it ends
    ///
    /// The end offset is the byte after the value itself; pointer targets
    /// elsewhere in the section do not move it.
    pub fn decode_with_end(&self, offset: u32) -> Result<(DataValue, usize)> {
        let mut state = DecodeState::default();
        let mut cursor = offset as usize;
        let value = self.decode_at(&mut cursor, 0, &mut state)?;
        Ok((value, cursor))
    }

    fn decode_at(
        &self,
        cursor: &mut usize,
        depth: usize,
        state: &mut DecodeState,
    ) -> Result<DataValue> {
        if depth > self.limits.max_depth {
            return Err(MmdbError::Format(format!(
                "Nesting depth exceeds limit of {}",
                self.limits.max_depth
            )));
        }

        match self.read_control(cursor)? {
            Control::Pointer(target) => self.resolve_pointer(target, depth, state),
            Control::Value { type_id, size } => {
                self.decode_typed(cursor, type_id, size, depth, state)
            }
        }
    }

    /// Follow a pointer (and any chain of pointers) to a value
    fn resolve_pointer(
        &self,
        first_target: usize,
        depth: usize,
        state: &mut DecodeState,
    ) -> Result<DataValue> {
        let mut target = first_target;
        let mut hops = 1;
        let target_depth = depth + 1;

        loop {
            let hit = state
                .cache
                .get(&target)
                .filter(|entry| entry.2 >= target_depth)
                .map(|(value, nodes, _)| (value.clone(), *nodes));
            if let Some((value, nodes)) = hit {
                state.values += nodes;
                if state.values > self.limits.max_values {
                    return Err(self.too_many_values());
                }
                if target != first_target {
                    state
                        .cache
                        .insert(first_target, (value.clone(), nodes, target_depth));
                }
                return Ok(value);
            }

            if target >= self.buffer.len() {
                return Err(MmdbError::Format(format!(
                    "Pointer target {} is outside the section ({} bytes)",
                    target,
                    self.buffer.len()
                )));
            }

            let mut cursor = target;
            match self.read_control(&mut cursor)? {
                Control::Pointer(next) => {
                    hops += 1;
                    if hops > self.limits.max_pointer_chain {
                        return Err(MmdbError::Format(format!(
                            "Pointer chain starting at {} exceeds {} hops",
                            first_target, self.limits.max_pointer_chain
                        )));
                    }
                    target = next;
                }
                Control::Value { type_id, size } => {
                    let before = state.values;
                    let value =
                        self.decode_typed(&mut cursor, type_id, size, target_depth, state)?;
                    let nodes = state.values - before;
                    state
                        .cache
                        .insert(target, (value.clone(), nodes, target_depth));
                    if target != first_target {
                        state
                            .cache
                            .insert(first_target, (value.clone(), nodes, target_depth));
                    }
                    return Ok(value);
                }
            }
        }
    }

    fn decode_typed(
        &self,
        cursor: &mut usize,
        type_id: u8,
        size: usize,
        depth: usize,
        state: &mut DecodeState,
    ) -> Result<DataValue> {
        state.values += 1;
        if state.values > self.limits.max_values {
            return Err(self.too_many_values());
        }

        match type_id {
            TYPE_STRING => {
                let bytes = self.take(cursor, size)?;
                let s = std::str::from_utf8(bytes).map_err(|e| {
                    MmdbError::Format(format!("Invalid UTF-8 in string: {}", e))
                })?;
                Ok(DataValue::String(s.to_string()))
            }
            TYPE_DOUBLE => {
                if size != 8 {
                    return Err(invalid_size("double", size));
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(self.take(cursor, 8)?);
                Ok(DataValue::Double(f64::from_be_bytes(bytes)))
            }
            TYPE_BYTES => Ok(DataValue::Bytes(self.take(cursor, size)?.to_vec())),
            TYPE_UINT16 => Ok(DataValue::Uint16(self.read_uint(cursor, size, 2, "uint16")? as u16)),
            TYPE_UINT32 => Ok(DataValue::Uint32(self.read_uint(cursor, size, 4, "uint32")? as u32)),
            TYPE_MAP => self.decode_map(cursor, size, depth, state),
            TYPE_INT32 => {
                // Four bytes carry a two's complement value; shorter
                // encodings are always non-negative.
                let raw = self.read_uint(cursor, size, 4, "int32")? as u32;
                Ok(DataValue::Int32(raw as i32))
            }
            TYPE_UINT64 => Ok(DataValue::Uint64(self.read_uint(cursor, size, 8, "uint64")? as u64)),
            TYPE_UINT128 => Ok(DataValue::Uint128(self.read_uint(cursor, size, 16, "uint128")?)),
            TYPE_ARRAY => self.decode_array(cursor, size, depth, state),
            TYPE_BOOL => match size {
                0 => Ok(DataValue::Bool(false)),
                1 => Ok(DataValue::Bool(true)),
                _ => Err(invalid_size("boolean", size)),
            },
            TYPE_FLOAT => {
                if size != 4 {
                    return Err(invalid_size("float", size));
                }
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(self.take(cursor, 4)?);
                Ok(DataValue::Float(f32::from_be_bytes(bytes)))
            }
            TYPE_DATA_CACHE | TYPE_END_MARKER => Err(MmdbError::Format(format!(
                "Type {} is not valid in a data section",
                type_id
            ))),
            _ => Err(MmdbError::Format(format!("Unknown data type {}", type_id))),
        }
    }

    fn decode_map(
        &self,
        cursor: &mut usize,
        count: usize,
        depth: usize,
        state: &mut DecodeState,
    ) -> Result<DataValue> {
        // Every entry needs at least a key byte and a value byte
        if count.saturating_mul(2) > self.remaining(*cursor) {
            return Err(MmdbError::Format(format!(
                "Map of {} entries at offset {} cannot fit in the remaining {} bytes",
                count,
                cursor,
                self.remaining(*cursor)
            )));
        }

        let mut map = IndexMap::with_capacity(count);
        for _ in 0..count {
            let key = match self.decode_at(cursor, depth + 1, state)? {
                DataValue::String(s) => s,
                other => {
                    return Err(MmdbError::Format(format!(
                        "Map key must be a string, found {}",
                        other.type_name()
                    )))
                }
            };
            let value = self.decode_at(cursor, depth + 1, state)?;
            if map.insert(key, value).is_some() {
                return Err(MmdbError::Format(format!(
                    "Duplicate map key before offset {}",
                    cursor
                )));
            }
        }

        Ok(DataValue::Map(map))
    }

    fn decode_array(
        &self,
        cursor: &mut usize,
        count: usize,
        depth: usize,
        state: &mut DecodeState,
    ) -> Result<DataValue> {
        if count > self.remaining(*cursor) {
            return Err(MmdbError::Format(format!(
                "Array of {} elements at offset {} cannot fit in the remaining {} bytes",
                count,
                cursor,
                self.remaining(*cursor)
            )));
        }

        let mut array = Vec::with_capacity(count);
        for _ in 0..count {
            array.push(self.decode_at(cursor, depth + 1, state)?);
        }

        Ok(DataValue::Array(array))
    }

    fn read_control(&self, cursor: &mut usize) -> Result<Control> {
        let ctrl = self.read_u8(cursor)?;
        let mut type_id = ctrl >> 5;
        let size_bits = ctrl & 0x1F;

        if type_id == TYPE_POINTER {
            return self.read_pointer(cursor, size_bits).map(Control::Pointer);
        }

        if type_id == TYPE_EXTENDED {
            let ext = self.read_u8(cursor)?;
            if ext == 0 || ext > TYPE_FLOAT - 7 {
                return Err(MmdbError::Format(format!(
                    "Invalid extended type byte {} at offset {}",
                    ext,
                    *cursor - 1
                )));
            }
            type_id = ext + 7;
        }

        let size = self.read_size(cursor, size_bits)?;
        Ok(Control::Value { type_id, size })
    }

    fn read_pointer(&self, cursor: &mut usize, size_bits: u8) -> Result<usize> {
        let class = (size_bits >> 3) & 0x3;
        let high = (size_bits & 0x7) as usize;

        let target = match class {
            0 => {
                let b = self.take(cursor, 1)?;
                (high << 8) | b[0] as usize
            }
            1 => {
                let b = self.take(cursor, 2)?;
                2_048 + ((high << 16) | (b[0] as usize) << 8 | b[1] as usize)
            }
            2 => {
                let b = self.take(cursor, 3)?;
                526_336
                    + ((high << 24) | (b[0] as usize) << 16 | (b[1] as usize) << 8 | b[2] as usize)
            }
            _ => {
                let b = self.take(cursor, 4)?;
                u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize
            }
        };

        Ok(target)
    }

    fn read_size(&self, cursor: &mut usize, size_bits: u8) -> Result<usize> {
        match size_bits {
            0..=28 => Ok(size_bits as usize),
            29 => Ok(29 + self.take(cursor, 1)?[0] as usize),
            30 => {
                let b = self.take(cursor, 2)?;
                Ok(285 + u16::from_be_bytes([b[0], b[1]]) as usize)
            }
            _ => {
                let b = self.take(cursor, 3)?;
                Ok(65_821 + ((b[0] as usize) << 16 | (b[1] as usize) << 8 | b[2] as usize))
            }
        }
    }

    fn read_uint(&self, cursor: &mut usize, size: usize, max: usize, name: &str) -> Result<u128> {
        if size > max {
            return Err(invalid_size(name, size));
        }
        Ok(self
            .take(cursor, size)?
            .iter()
            .fold(0u128, |acc, &b| (acc << 8) | b as u128))
    }

    fn read_u8(&self, cursor: &mut usize) -> Result<u8> {
        self.take(cursor, 1).map(|b| b[0])
    }

    /// Take `len` bytes at the cursor, failing if they run past the section
    fn take(&self, cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
        let start = *cursor;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.buffer.len())
            .ok_or_else(|| {
                MmdbError::Format(format!(
                    "{} bytes at offset {} run past the end of the section ({} bytes)",
                    len,
                    start,
                    self.buffer.len()
                ))
            })?;
        *cursor = end;
        Ok(&self.buffer[start..end])
    }

    fn remaining(&self, cursor: usize) -> usize {
        self.buffer.len().saturating_sub(cursor)
    }

    fn too_many_values(&self) -> MmdbError {
        MmdbError::Format(format!(
            "Decoded value exceeds limit of {} values",
            self.limits.max_values
        ))
    }
}

fn invalid_size(name: &str, size: usize) -> MmdbError {
    MmdbError::Format(format!("Invalid size {} for {}", size, name))
}
