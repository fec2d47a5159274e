//! Packet framing for AMF0 remoting
//!
//! Layout:
//! ┌─────────────────────────────────────────────────────┐
//! │ version (u16) | header count (u16)                  │
//! ├─────────────────────────────────────────────────────┤
//! │ Header*: name (u16 str) | must-understand (u8)      │
//! │          length (u32) | value                       │
//! ├─────────────────────────────────────────────────────┤
//! │ message count (u16)                                 │
//! ├─────────────────────────────────────────────────────┤
//! │ Message*: target (u16 str) | response (u16 str)     │
//! │           length (u32) | body                       │
//! └─────────────────────────────────────────────────────┘
//!
//! Message bodies are returned as byte ranges and only value-decoded when a
//! handler asks. A body whose first byte is the AVM+ marker (AMF3) frames
//! fine; only decoding it fails.

use std::ops::Range;

use super::codec::{decode_value_with_limits, DecodeLimits, Decoder, Encoder};
use super::value::Value;
use crate::error::{EncodeError, FormatError};

pub const AMF0_VERSION: u16 = 0;
pub const AMF3_VERSION: u16 = 3;

/// Length field value meaning "unknown, read the value to find its end".
pub const UNKNOWN_LENGTH: u32 = u32::MAX;

/// Reply target suffix that fires the client's success callback.
pub const RESULT_SUFFIX: &str = "/onResult";
/// Reply target suffix that fires the client's failure callback.
pub const STATUS_SUFFIX: &str = "/onStatus";
/// responseURI carried by replies.
pub const NULL_RESPONSE_URI: &str = "null";

/// name len + must-understand + length + one-byte value
const MIN_HEADER_SIZE: usize = 2 + 1 + 4 + 1;
/// target len + response len + length
const MIN_MESSAGE_SIZE: usize = 2 + 2 + 4;

/// Packet-level header. Passed through, never interpreted by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub name: String,
    pub must_understand: bool,
    pub value: Value,
}

/// One framed call whose body has not been decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSummary<'a> {
    pub target_uri: &'a str,
    pub response_uri: &'a str,
    /// Offsets of the body within the packet.
    pub body_range: Range<usize>,
    pub body: &'a [u8],
}

impl<'a> MessageSummary<'a> {
    pub fn decode_body(&self, limits: DecodeLimits) -> Result<Value, FormatError> {
        decode_value_with_limits(self.body, limits)
    }
}

/// Result of [`parse_request`]: headers decoded, bodies left raw.
#[derive(Debug, Clone)]
pub struct PacketSummary<'a> {
    pub version: u16,
    pub headers: Vec<Header>,
    /// Never empty.
    pub messages: Vec<MessageSummary<'a>>,
}

impl<'a> PacketSummary<'a> {
    pub fn first_message(&self) -> &MessageSummary<'a> {
        &self.messages[0]
    }
}

/// Owned message used when building packets.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub target_uri: String,
    pub response_uri: String,
    pub body: Value,
}

/// Owned packet used when building requests or replies.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub version: u16,
    pub headers: Vec<Header>,
    pub messages: Vec<Message>,
}

impl Packet {
    /// A single-call request, as the client sends it.
    pub fn request(target_uri: &str, response_uri: &str, params: Vec<Value>) -> Self {
        Self {
            version: AMF0_VERSION,
            headers: Vec::new(),
            messages: vec![Message {
                target_uri: target_uri.to_owned(),
                response_uri: response_uri.to_owned(),
                body: Value::StrictArray(params),
            }],
        }
    }
}

/// Frame a request packet without decoding message bodies.
pub fn parse_request(bytes: &[u8]) -> Result<PacketSummary<'_>, FormatError> {
    parse_request_with_limits(bytes, DecodeLimits::default())
}

pub fn parse_request_with_limits(
    bytes: &[u8],
    limits: DecodeLimits,
) -> Result<PacketSummary<'_>, FormatError> {
    let mut cursor = Decoder::with_limits(bytes, limits);

    let version = cursor.read_u16()?;

    let header_count = usize::from(cursor.read_u16()?);
    check_count(&cursor, "header", header_count, MIN_HEADER_SIZE)?;
    let mut headers = Vec::with_capacity(header_count);
    for _ in 0..header_count {
        let name = cursor.read_str()?.to_owned();
        let must_understand = cursor.read_u8()? != 0;
        let length = cursor.read_u32()?;
        let value = if length == UNKNOWN_LENGTH {
            let start = cursor.position();
            let mut sub = Decoder::with_limits(&bytes[start..], limits);
            let value = sub.decode()?;
            cursor.take(sub.position())?;
            value
        } else {
            decode_value_with_limits(cursor.take(length as usize)?, limits)?
        };
        headers.push(Header {
            name,
            must_understand,
            value,
        });
    }

    let message_count = usize::from(cursor.read_u16()?);
    if message_count == 0 {
        return Err(FormatError::NoMessages);
    }
    check_count(&cursor, "message", message_count, MIN_MESSAGE_SIZE)?;

    let mut messages = Vec::with_capacity(message_count);
    for index in 0..message_count {
        let target_uri = cursor.read_str()?;
        let response_uri = cursor.read_str()?;
        let length = cursor.read_u32()?;
        let start = cursor.position();

        let body_len = if length != UNKNOWN_LENGTH {
            length as usize
        } else if index + 1 == message_count {
            cursor.remaining()
        } else {
            // Unknown length mid-packet: the only way to the next message is through this body.
            let mut sub = Decoder::with_limits(&bytes[start..], limits);
            sub.decode()?;
            sub.position()
        };

        let body = cursor.take(body_len)?;
        messages.push(MessageSummary {
            target_uri,
            response_uri,
            body_range: start..start + body_len,
            body,
        });
    }

    Ok(PacketSummary {
        version,
        headers,
        messages,
    })
}

fn check_count(
    cursor: &Decoder<'_>,
    what: &'static str,
    count: usize,
    min_size: usize,
) -> Result<(), FormatError> {
    let needed = count.saturating_mul(min_size);
    if needed > cursor.remaining() {
        return Err(FormatError::CountOverflow {
            what,
            declared: count as u64,
            remaining: cursor.remaining(),
        });
    }
    Ok(())
}

/// Raw body bytes of the first message.
pub fn extract_first_message_body_raw(bytes: &[u8]) -> Result<&[u8], FormatError> {
    let packet = parse_request(bytes)?;
    Ok(packet.first_message().body)
}

/// Encode a packet; header and message counts come from the list lengths.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, EncodeError> {
    if packet.messages.is_empty() {
        return Err(EncodeError::NoMessages);
    }

    let mut encoder = Encoder::with_capacity(256);
    encoder.write_u16(packet.version);

    encoder.write_u16(count_u16("headers", packet.headers.len())?);
    for header in &packet.headers {
        encoder.write_str(&header.name)?;
        encoder.write_u8(u8::from(header.must_understand));
        write_framed_value(&mut encoder, &header.value)?;
    }

    encoder.write_u16(count_u16("messages", packet.messages.len())?);
    for message in &packet.messages {
        encoder.write_str(&message.target_uri)?;
        encoder.write_str(&message.response_uri)?;
        write_framed_value(&mut encoder, &message.body)?;
    }

    Ok(encoder.into_bytes())
}

/// u32 length slot followed by the value, with the slot patched afterwards.
fn write_framed_value(encoder: &mut Encoder, value: &Value) -> Result<(), EncodeError> {
    let slot = encoder.reserve_u32();
    let start = encoder.len();
    encoder.encode(value)?;
    let len = encoder.len() - start;
    let len = u32::try_from(len)
        .ok()
        .filter(|&l| l != UNKNOWN_LENGTH)
        .ok_or(EncodeError::TooLarge {
            what: "framed value",
            len,
            limit: UNKNOWN_LENGTH as usize - 1,
        })?;
    encoder.patch_u32(slot, len);
    Ok(())
}

fn count_u16(what: &'static str, len: usize) -> Result<u16, EncodeError> {
    u16::try_from(len).map_err(|_| EncodeError::TooLarge {
        what,
        len,
        limit: usize::from(u16::MAX),
    })
}

/// Reply target for a call's responseURI.
pub fn reply_target(response_uri: &str, is_fault: bool) -> String {
    let suffix = if is_fault { STATUS_SUFFIX } else { RESULT_SUFFIX };
    format!("{}{}", response_uri, suffix)
}

/// Single-message reply packet addressed to `response_uri`.
pub fn build_response(
    response_uri: &str,
    value: &Value,
    is_fault: bool,
) -> Result<Vec<u8>, EncodeError> {
    build_response_versioned(AMF0_VERSION, response_uri, value, is_fault)
}

/// [`build_response`] echoing the request's version tag.
pub fn build_response_versioned(
    version: u16,
    response_uri: &str,
    value: &Value,
    is_fault: bool,
) -> Result<Vec<u8>, EncodeError> {
    let mut encoder = Encoder::with_capacity(128);
    encoder.write_u16(version);
    encoder.write_u16(0);
    encoder.write_u16(1);
    encoder.write_str(&reply_target(response_uri, is_fault))?;
    encoder.write_str(NULL_RESPONSE_URI)?;
    write_framed_value(&mut encoder, value)?;
    Ok(encoder.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{decode_value, encode_value};

    fn call_bytes(target: &str, response: &str, params: Vec<Value>) -> Vec<u8> {
        encode_packet(&Packet::request(target, response, params)).unwrap()
    }

    #[test]
    fn test_parse_single_message() {
        let params = vec![Value::from(42), Value::from(2)];
        let bytes = call_bytes("api.x.y", "/1", params.clone());

        let packet = parse_request(&bytes).unwrap();
        assert_eq!(packet.version, AMF0_VERSION);
        assert!(packet.headers.is_empty());
        assert_eq!(packet.messages.len(), 1);

        let msg = packet.first_message();
        assert_eq!(msg.target_uri, "api.x.y");
        assert_eq!(msg.response_uri, "/1");
        assert_eq!(&bytes[msg.body_range.clone()], msg.body);
        assert_eq!(
            msg.decode_body(DecodeLimits::default()).unwrap(),
            Value::StrictArray(params)
        );
    }

    #[test]
    fn test_extract_body_decodes_like_in_place() {
        let params = vec![Value::object([("k", Value::from("v"))]), Value::Null];
        let bytes = call_bytes("api.x.y", "/7", params);

        let raw = extract_first_message_body_raw(&bytes).unwrap();
        let independent = decode_value(raw).unwrap();
        let in_place = parse_request(&bytes)
            .unwrap()
            .first_message()
            .decode_body(DecodeLimits::default())
            .unwrap();
        assert_eq!(independent, in_place);
        // Repeat decoding of the same slice is stable.
        assert_eq!(decode_value(raw).unwrap(), independent);
    }

    #[test]
    fn test_headers_roundtrip() {
        let packet = Packet {
            version: AMF3_VERSION,
            headers: vec![Header {
                name: "Credentials".into(),
                must_understand: true,
                value: Value::object([("userid", Value::from("u1"))]),
            }],
            messages: Packet::request("api.a", "/1", vec![]).messages,
        };
        let bytes = encode_packet(&packet).unwrap();
        let parsed = parse_request(&bytes).unwrap();
        assert_eq!(parsed.version, AMF3_VERSION);
        assert_eq!(parsed.headers, packet.headers);
    }

    #[test]
    fn test_malformed_body_does_not_hide_siblings() {
        let mut packet = Packet::request("api.first", "/1", vec![]);
        packet.messages.push(Message {
            target_uri: "api.second".into(),
            response_uri: "/2".into(),
            body: Value::from("ok"),
        });
        let mut bytes = encode_packet(&packet).unwrap();

        // Corrupt the first body's type marker.
        let first_body = parse_request(&bytes).unwrap().messages[0].body_range.clone();
        bytes[first_body.start] = 0x42;

        let parsed = parse_request(&bytes).unwrap();
        assert_eq!(parsed.messages[0].target_uri, "api.first");
        assert!(parsed.messages[0]
            .decode_body(DecodeLimits::default())
            .is_err());
        assert_eq!(parsed.messages[1].target_uri, "api.second");
        assert_eq!(parsed.messages[1].response_uri, "/2");
        assert_eq!(decode_value(parsed.messages[1].body).unwrap(), Value::from("ok"));
    }

    #[test]
    fn test_unknown_length_bodies() {
        let first = encode_value(&Value::from(1)).unwrap();
        let second = encode_value(&Value::from("two")).unwrap();

        let mut bytes = vec![0, 0, 0, 0, 0, 2];
        bytes.extend_from_slice(&[0, 1, b'a', 0, 2, b'/', b'1']);
        bytes.extend_from_slice(&UNKNOWN_LENGTH.to_be_bytes());
        bytes.extend_from_slice(&first);
        bytes.extend_from_slice(&[0, 1, b'b', 0, 2, b'/', b'2']);
        bytes.extend_from_slice(&UNKNOWN_LENGTH.to_be_bytes());
        bytes.extend_from_slice(&second);

        let parsed = parse_request(&bytes).unwrap();
        assert_eq!(parsed.messages[0].body, first.as_slice());
        assert_eq!(parsed.messages[1].body, second.as_slice());
    }

    #[test]
    fn test_truncated_fixed_fields() {
        let bytes = call_bytes("api.x.y", "/1", vec![Value::from(1)]);
        // Cut inside the envelope fields, before the body starts.
        let body_start = parse_request(&bytes).unwrap().first_message().body_range.start;
        for len in 0..body_start {
            assert!(parse_request(&bytes[..len]).is_err(), "len {}", len);
        }
        // Cut inside the body: declared length no longer fits.
        assert!(matches!(
            parse_request(&bytes[..bytes.len() - 1]),
            Err(FormatError::Truncated { .. })
        ));
    }

    #[test]
    fn test_counts_exceeding_input() {
        // 0xFFFF headers declared, nothing behind them.
        assert!(matches!(
            parse_request(&[0, 0, 0xFF, 0xFF]),
            Err(FormatError::CountOverflow { what: "header", .. })
        ));
        assert!(matches!(
            parse_request(&[0, 0, 0, 0, 0x00, 0x10, 0, 0]),
            Err(FormatError::CountOverflow { what: "message", .. })
        ));
        assert!(matches!(
            parse_request(&[0, 0, 0, 0, 0, 0]),
            Err(FormatError::NoMessages)
        ));
    }

    #[test]
    fn test_build_response_shape() {
        let reply = Value::object([("status", Value::from("success"))]);
        let bytes = build_response("/1", &reply, false).unwrap();
        let parsed = parse_request(&bytes).unwrap();
        assert_eq!(parsed.messages.len(), 1);
        assert!(parsed.headers.is_empty());
        assert_eq!(parsed.first_message().target_uri, "/1/onResult");
        assert_eq!(parsed.first_message().response_uri, "null");
        assert_eq!(decode_value(parsed.first_message().body).unwrap(), reply);

        let fault = build_response("/3", &Value::Null, true).unwrap();
        assert_eq!(
            parse_request(&fault).unwrap().first_message().target_uri,
            "/3/onStatus"
        );
    }

    #[test]
    fn test_build_response_with_raw_bytes_is_verbatim() {
        let cached = encode_value(&Value::from(800)).unwrap();
        let bytes = build_response("/1", &Value::RawBytes(cached.clone()), false).unwrap();
        assert_eq!(extract_first_message_body_raw(&bytes).unwrap(), cached.as_slice());
    }

    #[test]
    fn test_encode_packet_requires_message() {
        let packet = Packet {
            version: AMF0_VERSION,
            headers: vec![],
            messages: vec![],
        };
        assert_eq!(encode_packet(&packet), Err(EncodeError::NoMessages));
    }
}
