//! AMF0 value codec
//!
//! Pure byte <-> [`Value`] mapping, no I/O:
//! - Decode reads from a borrowed buffer with a bounds-checked cursor
//! - Decode depth and node count are capped, references included, so hostile
//!   nesting or reference fan-out fails instead of blowing the stack or the heap
//! - Encode appends to a growable buffer; raw bytes only at top level
//!
//! All multi-byte fields are big-endian.

use super::value::{marker, Date, Map, Value};
use crate::error::{EncodeError, FormatError};

/// Default cap on container nesting while decoding.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Default cap on decoded values per body; a referenced value counts every time it is used.
pub const DEFAULT_MAX_NODES: usize = 1 << 20;

/// Only the first 65536 complex values can be addressed by a reference.
const MAX_REFERENCES: usize = u16::MAX as usize + 1;

/// Limits applied while decoding untrusted input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    pub max_depth: usize,
    pub max_nodes: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_nodes: DEFAULT_MAX_NODES,
        }
    }
}

/// A completed complex value a reference marker can point at.
struct Referent {
    value: Value,
    /// Container levels, counting the value itself.
    height: usize,
    nodes: usize,
}

/// Cursor-based decoder over a borrowed buffer.
///
/// Reference markers resolve against the complex values decoded so far by
/// this decoder, so use one decoder per message body.
pub struct Decoder<'a> {
    buffer: &'a [u8],
    read_pos: usize,
    limits: DecodeLimits,
    depth: usize,
    /// Deepest container level reached inside the innermost open container.
    deepest: usize,
    nodes: usize,
    references: Vec<Option<Referent>>,
}

impl<'a> Decoder<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self::with_limits(buffer, DecodeLimits::default())
    }

    pub fn with_limits(buffer: &'a [u8], limits: DecodeLimits) -> Self {
        Self {
            buffer,
            read_pos: 0,
            limits,
            depth: 0,
            deepest: 0,
            nodes: 0,
            references: Vec::new(),
        }
    }

    /// Current cursor offset into the buffer.
    #[inline(always)]
    pub fn position(&self) -> usize {
        self.read_pos
    }

    /// Remaining bytes
    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.read_pos)
    }

    /// Decode the next value and advance past it.
    pub fn decode(&mut self) -> Result<Value, FormatError> {
        let offset = self.read_pos;
        let type_marker = self.read_u8()?;
        self.charge(1)?;

        match type_marker {
            marker::NUMBER => Ok(Value::Number(self.read_f64()?)),
            marker::BOOLEAN => Ok(Value::Boolean(self.read_u8()? != 0)),
            marker::STRING => Ok(Value::String(self.read_str()?.to_owned())),
            marker::OBJECT => self.complex(|d| Ok(Value::Object(d.read_members()?))),
            marker::NULL => Ok(Value::Null),
            marker::UNDEFINED => Ok(Value::Undefined),
            marker::REFERENCE => {
                let index = self.read_u16()?;
                self.resolve_reference(index)
            }
            marker::ECMA_ARRAY => self.complex(|d| {
                // Count is only a hint; members run until the end marker.
                let _count_hint = d.read_u32()?;
                Ok(Value::EcmaArray(d.read_members()?))
            }),
            marker::STRICT_ARRAY => self.complex(|d| {
                let count = d.read_u32()?;
                d.check_count("array", u64::from(count))?;
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(d.decode()?);
                }
                Ok(Value::StrictArray(items))
            }),
            marker::DATE => {
                let millis = self.read_f64()?;
                let timezone = self.read_i16()?;
                Ok(Value::Date(Date { millis, timezone }))
            }
            marker::LONG_STRING => Ok(Value::String(self.read_long_str()?.to_owned())),
            marker::UNSUPPORTED => Ok(Value::Unsupported),
            marker::XML_DOCUMENT => Ok(Value::XmlDocument(self.read_long_str()?.to_owned())),
            marker::TYPED_OBJECT => self.complex(|d| {
                let class_name = d.read_str()?.to_owned();
                let members = d.read_members()?;
                Ok(Value::TypedObject {
                    class_name,
                    members,
                })
            }),
            marker::MOVIECLIP => Err(FormatError::Unsupported {
                marker: type_marker,
                name: "movieclip",
                offset,
            }),
            marker::RECORDSET => Err(FormatError::Unsupported {
                marker: type_marker,
                name: "recordset",
                offset,
            }),
            marker::AVMPLUS => Err(FormatError::Unsupported {
                marker: type_marker,
                name: "avmplus switch (AMF3)",
                offset,
            }),
            _ => Err(FormatError::UnknownMarker {
                marker: type_marker,
                offset,
            }),
        }
    }

    /// Decode a container, enforcing the depth limit and recording it for references.
    fn complex<F>(&mut self, body: F) -> Result<Value, FormatError>
    where
        F: FnOnce(&mut Self) -> Result<Value, FormatError>,
    {
        if self.depth >= self.limits.max_depth {
            return Err(FormatError::DepthExceeded {
                limit: self.limits.max_depth,
            });
        }

        // Slot is reserved before the members so indices follow opening order.
        let slot = self.references.len();
        if slot < MAX_REFERENCES {
            self.references.push(None);
        }

        // The marker of this container was charged just before we got here.
        let nodes_before = self.nodes - 1;
        let level = self.depth;
        let outer_deepest = self.deepest;
        self.depth += 1;
        self.deepest = self.depth;
        let result = body(self);
        let height = self.deepest - level;
        self.depth = level;
        self.deepest = outer_deepest.max(self.deepest);

        let value = result?;
        if slot < MAX_REFERENCES {
            self.references[slot] = Some(Referent {
                value: value.clone(),
                height,
                nodes: self.nodes - nodes_before,
            });
        }
        Ok(value)
    }

    /// Copy a completed value into the tree, charging its full depth and size.
    fn resolve_reference(&mut self, index: u16) -> Result<Value, FormatError> {
        let (height, nodes) = match self.references.get(usize::from(index)) {
            Some(Some(referent)) => (referent.height, referent.nodes),
            _ => return Err(FormatError::BadReference { index }),
        };

        if self.depth + height > self.limits.max_depth {
            return Err(FormatError::DepthExceeded {
                limit: self.limits.max_depth,
            });
        }
        self.deepest = self.deepest.max(self.depth + height);
        // The reference marker itself was already charged.
        self.charge(nodes.saturating_sub(1))?;

        match self.references.get(usize::from(index)) {
            Some(Some(referent)) => Ok(referent.value.clone()),
            _ => Err(FormatError::BadReference { index }),
        }
    }

    fn charge(&mut self, nodes: usize) -> Result<(), FormatError> {
        self.nodes = self.nodes.saturating_add(nodes);
        if self.nodes > self.limits.max_nodes {
            return Err(FormatError::TooManyNodes {
                limit: self.limits.max_nodes,
            });
        }
        Ok(())
    }

    /// Object members up to and including the empty-key end marker.
    fn read_members(&mut self) -> Result<Map, FormatError> {
        let mut members = Map::new();
        loop {
            let key = self.read_str()?;
            if key.is_empty() {
                let offset = self.read_pos;
                let end = self.read_u8()?;
                if end != marker::OBJECT_END {
                    return Err(FormatError::UnknownMarker {
                        marker: end,
                        offset,
                    });
                }
                return Ok(members);
            }
            if members.contains_key(key) {
                return Err(FormatError::DuplicateKey {
                    key: key.to_owned(),
                    offset: self.read_pos,
                });
            }
            let value = self.decode()?;
            members.insert(key.to_owned(), value);
        }
    }

    /// Every element takes at least one byte, so larger counts cannot be honest.
    fn check_count(&self, what: &'static str, declared: u64) -> Result<(), FormatError> {
        if declared > self.remaining() as u64 {
            return Err(FormatError::CountOverflow {
                what,
                declared,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    /// Borrow the next `len` bytes.
    #[inline(always)]
    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        let end = match self.read_pos.checked_add(len) {
            Some(end) if end <= self.buffer.len() => end,
            _ => {
                return Err(FormatError::Truncated {
                    offset: self.read_pos,
                    needed: len,
                    available: self.remaining(),
                })
            }
        };
        let buffer = self.buffer;
        let bytes = &buffer[self.read_pos..end];
        self.read_pos = end;
        Ok(bytes)
    }

    #[inline(always)]
    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], FormatError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    #[inline(always)]
    pub(crate) fn read_u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.take_array::<1>()?[0])
    }

    #[inline(always)]
    pub(crate) fn read_u16(&mut self) -> Result<u16, FormatError> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    #[inline(always)]
    fn read_i16(&mut self) -> Result<i16, FormatError> {
        Ok(i16::from_be_bytes(self.take_array()?))
    }

    #[inline(always)]
    pub(crate) fn read_u32(&mut self) -> Result<u32, FormatError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    #[inline(always)]
    fn read_f64(&mut self) -> Result<f64, FormatError> {
        Ok(f64::from_be_bytes(self.take_array()?))
    }

    /// 16-bit length-prefixed UTF-8, borrowed from the buffer.
    pub(crate) fn read_str(&mut self) -> Result<&'a str, FormatError> {
        let len = self.read_u16()?;
        self.read_utf8(usize::from(len))
    }

    fn read_long_str(&mut self) -> Result<&'a str, FormatError> {
        let len = self.read_u32()?;
        self.read_utf8(len as usize)
    }

    fn read_utf8(&mut self, len: usize) -> Result<&'a str, FormatError> {
        let offset = self.read_pos;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|_| FormatError::InvalidUtf8 { offset })
    }
}

/// Decode exactly one value spanning all of `bytes`.
pub fn decode_value(bytes: &[u8]) -> Result<Value, FormatError> {
    decode_value_with_limits(bytes, DecodeLimits::default())
}

pub fn decode_value_with_limits(bytes: &[u8], limits: DecodeLimits) -> Result<Value, FormatError> {
    let mut decoder = Decoder::with_limits(bytes, limits);
    let value = decoder.decode()?;
    match decoder.remaining() {
        0 => Ok(value),
        trailing => Err(FormatError::TrailingBytes { trailing }),
    }
}

/// Encoder appending to a growable buffer.
///
/// A failed [`Encoder::encode`] leaves the buffer as it was before the call.
#[derive(Debug, Default)]
pub struct Encoder {
    buffer: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Clear the buffer for reuse.
    #[inline(always)]
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Encode one top-level value.
    pub fn encode(&mut self, value: &Value) -> Result<(), EncodeError> {
        let start = self.buffer.len();
        let result = self.write_value(value, 0);
        if result.is_err() {
            self.buffer.truncate(start);
        }
        result
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn write_value(&mut self, value: &Value, depth: usize) -> Result<(), EncodeError> {
        match value {
            Value::Number(n) => {
                self.write_u8(marker::NUMBER);
                self.buffer.extend_from_slice(&n.to_be_bytes());
            }
            Value::Boolean(b) => {
                self.write_u8(marker::BOOLEAN);
                self.write_u8(u8::from(*b));
            }
            Value::String(s) => {
                if s.len() <= usize::from(u16::MAX) {
                    self.write_u8(marker::STRING);
                    self.write_str(s)?;
                } else {
                    self.write_u8(marker::LONG_STRING);
                    self.write_long_str("long string", s)?;
                }
            }
            Value::Null => self.write_u8(marker::NULL),
            Value::Undefined => self.write_u8(marker::UNDEFINED),
            Value::Unsupported => self.write_u8(marker::UNSUPPORTED),
            Value::Date(date) => {
                self.write_u8(marker::DATE);
                self.buffer.extend_from_slice(&date.millis.to_be_bytes());
                self.buffer.extend_from_slice(&date.timezone.to_be_bytes());
            }
            Value::StrictArray(items) => {
                self.write_u8(marker::STRICT_ARRAY);
                self.write_count("array", items.len())?;
                for item in items {
                    self.write_value(item, depth + 1)?;
                }
            }
            Value::Object(members) => {
                self.write_u8(marker::OBJECT);
                self.write_members(members, depth)?;
            }
            Value::EcmaArray(members) => {
                self.write_u8(marker::ECMA_ARRAY);
                self.write_count("ecma array", members.len())?;
                self.write_members(members, depth)?;
            }
            Value::TypedObject {
                class_name,
                members,
            } => {
                self.write_u8(marker::TYPED_OBJECT);
                self.write_str(class_name)?;
                self.write_members(members, depth)?;
            }
            Value::XmlDocument(xml) => {
                self.write_u8(marker::XML_DOCUMENT);
                self.write_long_str("xml document", xml)?;
            }
            Value::RawBytes(bytes) => {
                if depth > 0 {
                    return Err(EncodeError::NestedRawBytes);
                }
                self.buffer.extend_from_slice(bytes);
            }
        }
        Ok(())
    }

    fn write_members(&mut self, members: &Map, depth: usize) -> Result<(), EncodeError> {
        for (key, value) in members {
            if key.is_empty() {
                // Would read back as the end marker.
                return Err(EncodeError::EmptyKey);
            }
            self.write_str(key)?;
            self.write_value(value, depth + 1)?;
        }
        self.write_u16(0);
        self.write_u8(marker::OBJECT_END);
        Ok(())
    }

    fn write_count(&mut self, what: &'static str, len: usize) -> Result<(), EncodeError> {
        let count = u32::try_from(len).map_err(|_| EncodeError::TooLarge {
            what,
            len,
            limit: u32::MAX as usize,
        })?;
        self.write_u32(count);
        Ok(())
    }

    #[inline(always)]
    pub(crate) fn write_u8(&mut self, v: u8) {
        self.buffer.push(v);
    }

    #[inline(always)]
    pub(crate) fn write_u16(&mut self, v: u16) {
        self.buffer.extend_from_slice(&v.to_be_bytes());
    }

    #[inline(always)]
    pub(crate) fn write_u32(&mut self, v: u32) {
        self.buffer.extend_from_slice(&v.to_be_bytes());
    }

    /// 16-bit length-prefixed UTF-8 without a type marker.
    pub(crate) fn write_str(&mut self, s: &str) -> Result<(), EncodeError> {
        let len = u16::try_from(s.len()).map_err(|_| EncodeError::KeyTooLong { len: s.len() })?;
        self.write_u16(len);
        self.buffer.extend_from_slice(s.as_bytes());
        Ok(())
    }

    fn write_long_str(&mut self, what: &'static str, s: &str) -> Result<(), EncodeError> {
        self.write_count(what, s.len())?;
        self.buffer.extend_from_slice(s.as_bytes());
        Ok(())
    }

    /// Reserve a u32 length slot, returning its position for [`Encoder::patch_u32`].
    pub(crate) fn reserve_u32(&mut self) -> usize {
        let pos = self.buffer.len();
        self.write_u32(0);
        pos
    }

    pub(crate) fn patch_u32(&mut self, pos: usize, v: u32) {
        self.buffer[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }
}

/// Encode one value into a fresh buffer.
pub fn encode_value(value: &Value) -> Result<Vec<u8>, EncodeError> {
    let mut encoder = Encoder::new();
    encoder.encode(value)?;
    Ok(encoder.into_bytes())
}

/// Append one encoded value to `sink`.
pub fn encode_into(value: &Value, sink: &mut Vec<u8>) -> Result<(), EncodeError> {
    let mut encoder = Encoder {
        buffer: std::mem::take(sink),
    };
    let result = encoder.encode(value);
    *sink = encoder.buffer;
    result
}
