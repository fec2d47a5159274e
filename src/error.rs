//! Error taxonomy for the gateway.
//!
//! Every failure a request can hit ends up as a fault reply; these types
//! carry enough structure to pick the fault code and message.

use thiserror::Error;

/// Malformed or truncated binary input, at envelope or value level.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("truncated input: need {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unknown type marker 0x{marker:02x} at offset {offset}")]
    UnknownMarker { marker: u8, offset: usize },

    #[error("unsupported type marker 0x{marker:02x} ({name}) at offset {offset}")]
    Unsupported {
        marker: u8,
        name: &'static str,
        offset: usize,
    },

    #[error("nesting depth exceeds limit of {limit}")]
    DepthExceeded { limit: usize },

    #[error("value expands past the limit of {limit} nodes")]
    TooManyNodes { limit: usize },

    #[error("duplicate member key {key:?} at offset {offset}")]
    DuplicateKey { key: String, offset: usize },

    #[error("invalid utf-8 in string at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("reference {index} does not point at a completed value")]
    BadReference { index: u16 },

    #[error("declared {what} count {declared} exceeds remaining input of {remaining} bytes")]
    CountOverflow {
        what: &'static str,
        declared: u64,
        remaining: usize,
    },

    #[error("packet declares no messages")]
    NoMessages,

    #[error("{trailing} trailing bytes after value")]
    TrailingBytes { trailing: usize },
}

/// A value that cannot be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("raw bytes may only be a top-level value")]
    NestedRawBytes,

    #[error("a packet needs at least one message")]
    NoMessages,

    #[error("map keys must not be empty")]
    EmptyKey,

    #[error("map key of {len} bytes exceeds the 16-bit length field")]
    KeyTooLong { len: usize },

    #[error("{what} of {len} exceeds the {limit} limit of its length field")]
    TooLarge {
        what: &'static str,
        len: usize,
        limit: usize,
    },
}

/// Failure raised by the replay store backing the idempotency guard.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("replay store i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("replay store is full ({capacity} bytes)")]
    Full { capacity: usize },

    #[error("replay store is corrupt: {0}")]
    Corrupt(String),

    #[error("replay store unavailable: {0}")]
    Unavailable(String),

    #[error("reply cannot be cached: {0}")]
    Encode(#[from] EncodeError),
}

/// Business failure raised by a handler, e.g. insufficient inventory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ApplicationError {
    /// Fault code override; `None` uses the generic application code.
    pub code: Option<String>,
    pub message: String,
}

impl ApplicationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

/// Error a handler returns to the dispatcher.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Application(#[from] ApplicationError),

    #[error("malformed call body: {0}")]
    Format(#[from] FormatError),

    #[error("argument {index}: expected {expected}")]
    BadArgument {
        index: usize,
        expected: &'static str,
    },

    #[error("idempotency guard unavailable: {0}")]
    GuardUnavailable(#[source] StoreError),

    #[error("an identical call is still being processed")]
    ReplayInFlight,
}

impl HandlerError {
    /// Shorthand for an [`ApplicationError`] without a code.
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application(ApplicationError::new(message))
    }
}

/// Error at the dispatcher boundary, before it is turned into a fault.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("malformed packet: {0}")]
    Format(#[from] FormatError),

    #[error("batched calls are not supported ({count} messages in packet)")]
    UnsupportedBatch { count: usize },

    #[error("no handler registered for '{target_uri}'")]
    MethodNotFound { target_uri: String },

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("handler panicked: {0}")]
    Panic(String),

    #[error("reply could not be encoded: {0}")]
    Encode(#[from] EncodeError),
}

/// Invalid runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("invalid bind address '{0}'")]
    BindAddr(String),
}
