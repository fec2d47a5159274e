//! Per-call context handed to every handler.

use crate::error::{FormatError, HandlerError};
use crate::protocol::{decode_value_with_limits, DecodeLimits, Header, Value};

/// Who is calling, as resolved by the transport before dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    subject: String,
    is_guest: bool,
}

impl Identity {
    /// An authenticated caller.
    pub fn user(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            is_guest: false,
        }
    }

    /// An anonymous caller; `subject` should still tell guests apart (e.g. peer address).
    pub fn guest(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            is_guest: true,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn is_guest(&self) -> bool {
        self.is_guest
    }
}

/// One inbound call: method name, reply channel, undecoded body and caller.
///
/// The body is decoded on demand and may be decoded any number of times.
#[derive(Debug, Clone, Copy)]
pub struct Call<'a> {
    target_uri: &'a str,
    response_uri: &'a str,
    body: &'a [u8],
    identity: &'a Identity,
    headers: &'a [Header],
    limits: DecodeLimits,
}

impl<'a> Call<'a> {
    pub fn new(
        target_uri: &'a str,
        response_uri: &'a str,
        body: &'a [u8],
        identity: &'a Identity,
    ) -> Self {
        Self {
            target_uri,
            response_uri,
            body,
            identity,
            headers: &[],
            limits: DecodeLimits::default(),
        }
    }

    pub fn with_headers(mut self, headers: &'a [Header]) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_limits(mut self, limits: DecodeLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn target_uri(&self) -> &'a str {
        self.target_uri
    }

    pub fn response_uri(&self) -> &'a str {
        self.response_uri
    }

    pub fn raw_body(&self) -> &'a [u8] {
        self.body
    }

    pub fn identity(&self) -> &'a Identity {
        self.identity
    }

    /// Packet headers, passed through untouched.
    pub fn headers(&self) -> &'a [Header] {
        self.headers
    }

    pub fn header(&self, name: &str) -> Option<&'a Value> {
        self.headers
            .iter()
            .find(|h| h.name == name)
            .map(|h| &h.value)
    }

    pub fn decode_body(&self) -> Result<Value, FormatError> {
        decode_value_with_limits(self.body, self.limits)
    }

    /// Positional parameters. Remoting bodies are a strict array; anything else
    /// is treated as a single parameter, and null as none.
    pub fn params(&self) -> Result<Params, HandlerError> {
        let values = match self.decode_body()? {
            Value::StrictArray(values) => values,
            Value::Null | Value::Undefined => Vec::new(),
            other => vec![other],
        };
        Ok(Params { values })
    }
}

/// Decoded positional parameters with typed accessors.
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    values: Vec<Value>,
}

impl Params {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn value(&self, index: usize) -> Result<&Value, HandlerError> {
        self.get(index).ok_or(HandlerError::BadArgument {
            index,
            expected: "a value",
        })
    }

    pub fn number(&self, index: usize) -> Result<f64, HandlerError> {
        self.get(index)
            .and_then(Value::as_f64)
            .ok_or(HandlerError::BadArgument {
                index,
                expected: "number",
            })
    }

    pub fn string(&self, index: usize) -> Result<&str, HandlerError> {
        self.get(index)
            .and_then(Value::as_str)
            .ok_or(HandlerError::BadArgument {
                index,
                expected: "string",
            })
    }

    pub fn boolean(&self, index: usize) -> Result<bool, HandlerError> {
        self.get(index)
            .and_then(Value::as_bool)
            .ok_or(HandlerError::BadArgument {
                index,
                expected: "boolean",
            })
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_value;

    #[test]
    fn test_params_from_strict_array() {
        let body = encode_value(&Value::StrictArray(vec![Value::from(42), Value::from("x")])).unwrap();
        let identity = Identity::user("u1");
        let call = Call::new("api.x", "/1", &body, &identity);

        let params = call.params().unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params.number(0).unwrap(), 42.0);
        assert_eq!(params.string(1).unwrap(), "x");
        assert!(matches!(
            params.number(1),
            Err(HandlerError::BadArgument { index: 1, .. })
        ));
        assert!(params.value(5).is_err());
    }

    #[test]
    fn test_params_scalar_and_null_bodies() {
        let identity = Identity::guest("10.0.0.1");
        let scalar = encode_value(&Value::from(true)).unwrap();
        let params = Call::new("api.x", "/1", &scalar, &identity).params().unwrap();
        assert!(params.boolean(0).unwrap());

        let null = encode_value(&Value::Null).unwrap();
        assert!(Call::new("api.x", "/1", &null, &identity)
            .params()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_body_can_be_decoded_repeatedly() {
        let body = encode_value(&Value::from("again")).unwrap();
        let identity = Identity::user("u1");
        let call = Call::new("api.x", "/1", &body, &identity);
        assert_eq!(call.decode_body().unwrap(), call.decode_body().unwrap());
        assert_eq!(call.raw_body(), body.as_slice());
    }

    #[test]
    fn test_malformed_body_is_format_error() {
        let identity = Identity::user("u1");
        let call = Call::new("api.x", "/1", &[0x0A, 0, 0], &identity);
        assert!(matches!(call.params(), Err(HandlerError::Format(_))));
    }
}
