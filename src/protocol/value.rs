//! Tagged values carried by AMF0 packets.
//!
//! Containers keep member order: the client reads fields positionally in
//! places, so `{a, b}` and `{b, a}` are different replies on the wire.

use indexmap::IndexMap;

/// Ordered associative map with unique string keys.
pub type Map = IndexMap<String, Value>;

/// Type markers of the AMF0 value encoding.
pub mod marker {
    pub const NUMBER: u8 = 0x00;
    pub const BOOLEAN: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const OBJECT: u8 = 0x03;
    pub const MOVIECLIP: u8 = 0x04;
    pub const NULL: u8 = 0x05;
    pub const UNDEFINED: u8 = 0x06;
    pub const REFERENCE: u8 = 0x07;
    pub const ECMA_ARRAY: u8 = 0x08;
    pub const OBJECT_END: u8 = 0x09;
    pub const STRICT_ARRAY: u8 = 0x0A;
    pub const DATE: u8 = 0x0B;
    pub const LONG_STRING: u8 = 0x0C;
    pub const UNSUPPORTED: u8 = 0x0D;
    pub const RECORDSET: u8 = 0x0E;
    pub const XML_DOCUMENT: u8 = 0x0F;
    pub const TYPED_OBJECT: u8 = 0x10;
    pub const AVMPLUS: u8 = 0x11;
}

/// Date as sent by the client: epoch milliseconds plus a timezone field.
///
/// The timezone is reserved by the format and conventionally zero, but it is
/// kept verbatim so a decoded date re-encodes to the same bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Date {
    pub millis: f64,
    pub timezone: i16,
}

impl Date {
    pub fn from_millis(millis: f64) -> Self {
        Self {
            millis,
            timezone: 0,
        }
    }
}

/// A single AMF0 value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Undefined,
    Boolean(bool),
    Number(f64),
    String(String),
    Date(Date),
    StrictArray(Vec<Value>),
    /// Anonymous object (marker 0x03).
    Object(Map),
    /// Associative array with a count hint (marker 0x08).
    EcmaArray(Map),
    TypedObject { class_name: String, members: Map },
    XmlDocument(String),
    Unsupported,
    /// Already-encoded value bytes, written verbatim. Only legal at top level.
    RawBytes(Vec<u8>),
}

impl Value {
    /// Builds an anonymous object from `(key, value)` pairs, keeping their order.
    pub fn object<K, I>(members: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(members.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::XmlDocument(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::StrictArray(items) => Some(items),
            _ => None,
        }
    }

    /// Members of any map-shaped value.
    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Object(m) | Value::EcmaArray(m) => Some(m),
            Value::TypedObject { members, .. } => Some(members),
            _ => None,
        }
    }

    /// Looks up a member of a map-shaped value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    pub fn is_null_like(&self) -> bool {
        matches!(self, Value::Null | Value::Undefined)
    }

    /// Name used in diagnostics and argument errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Undefined => "undefined",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::StrictArray(_) => "array",
            Value::Object(_) => "object",
            Value::EcmaArray(_) => "ecma-array",
            Value::TypedObject { .. } => "typed-object",
            Value::XmlDocument(_) => "xml",
            Value::Unsupported => "unsupported",
            Value::RawBytes(_) => "raw-bytes",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(f64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Number(f64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Date> for Value {
    fn from(v: Date) -> Self {
        Value::Date(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::StrictArray(v)
    }
}

impl From<Map> for Value {
    fn from(v: Map) -> Self {
        Value::Object(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
