//! Protocol layer: AMF0 values and remoting packets
//!
//! Design principles:
//! - Pure functions over byte slices, no I/O
//! - Bodies stay borrowed slices until a handler decodes them
//! - Every read is bounds-checked; malformed input is a `FormatError`, never a panic

pub mod codec;
pub mod envelope;
pub mod value;

pub use codec::{
    decode_value, decode_value_with_limits, encode_into, encode_value, DecodeLimits, Decoder,
    Encoder, DEFAULT_MAX_DEPTH, DEFAULT_MAX_NODES,
};
pub use envelope::{
    build_response, build_response_versioned, encode_packet, extract_first_message_body_raw,
    parse_request, parse_request_with_limits, reply_target, Header, Message, MessageSummary,
    Packet, PacketSummary, AMF0_VERSION, AMF3_VERSION, RESULT_SUFFIX, STATUS_SUFFIX,
};
pub use value::{Date, Map, Value};
