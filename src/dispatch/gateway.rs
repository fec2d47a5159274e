//! Request dispatcher: packet in, packet out.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{debug, error, info_span, warn};

use super::context::{Call, Identity};
use super::fault::{fault_code, fault_value};
use super::registry::Registry;
use crate::error::{GatewayError, HandlerError};
use crate::protocol::{
    build_response_versioned, parse_request_with_limits, DecodeLimits, Value, AMF0_VERSION,
};

pub const STATUS_OK: u16 = 200;
pub const STATUS_INTERNAL_ERROR: u16 = 500;

/// Outcome of a single call.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Success(Value),
    Fault(Value),
}

impl Reply {
    pub fn is_fault(&self) -> bool {
        matches!(self, Reply::Fault(_))
    }

    pub fn value(&self) -> &Value {
        match self {
            Reply::Success(v) | Reply::Fault(v) => v,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Reply::Success(v) | Reply::Fault(v) => v,
        }
    }
}

/// What the transport writes back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub is_fault: bool,
}

/// Routes decoded packets to registered handlers and encodes their replies.
pub struct Gateway<S> {
    registry: Registry<S>,
    state: S,
    limits: DecodeLimits,
}

impl<S> Gateway<S> {
    pub fn new(registry: Registry<S>, state: S) -> Self {
        Self {
            registry,
            state,
            limits: DecodeLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: DecodeLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn registry(&self) -> &Registry<S> {
        &self.registry
    }

    /// Handle one request packet. Always produces a reply packet; status 500
    /// only when not even a fault could be encoded.
    pub fn handle(&self, request: &[u8], identity: &Identity) -> GatewayResponse {
        let packet = match parse_request_with_limits(request, self.limits) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, bytes = request.len(), "malformed request packet");
                let err = GatewayError::Format(e);
                return self.respond(AMF0_VERSION, "", Reply::Fault(fault_value(&err, "")));
            }
        };

        let first = packet.first_message();
        if packet.messages.len() > 1 {
            let err = GatewayError::UnsupportedBatch {
                count: packet.messages.len(),
            };
            warn!(count = packet.messages.len(), "batched request rejected");
            let fault = fault_value(&err, first.target_uri);
            return self.respond(packet.version, first.response_uri, Reply::Fault(fault));
        }

        let call = Call::new(first.target_uri, first.response_uri, first.body, identity)
            .with_headers(&packet.headers)
            .with_limits(self.limits);
        let reply = self.dispatch_call(&call);
        self.respond(packet.version, first.response_uri, reply)
    }

    /// Invoke `target_uri` with an encoded body, bypassing the envelope.
    pub fn dispatch(&self, target_uri: &str, body: &[u8], identity: &Identity) -> Reply {
        let call = Call::new(target_uri, "", body, identity).with_limits(self.limits);
        self.dispatch_call(&call)
    }

    pub fn dispatch_call(&self, call: &Call<'_>) -> Reply {
        let span = info_span!(
            "call",
            target_uri = call.target_uri(),
            response_uri = call.response_uri(),
            subject = call.identity().subject()
        );
        let _enter = span.enter();

        match self.invoke(call) {
            Ok(value) => {
                debug!("call succeeded");
                Reply::Success(value)
            }
            Err(err) => {
                log_failure(&err);
                Reply::Fault(fault_value(&err, call.target_uri()))
            }
        }
    }

    fn invoke(&self, call: &Call<'_>) -> Result<Value, GatewayError> {
        let entry = self
            .registry
            .lookup(call.target_uri())
            .ok_or_else(|| GatewayError::MethodNotFound {
                target_uri: call.target_uri().to_owned(),
            })?;

        match catch_unwind(AssertUnwindSafe(|| entry.invoke(call, &self.state))) {
            Ok(result) => Ok(result?),
            Err(payload) => Err(GatewayError::Panic(panic_message(payload.as_ref()))),
        }
    }

    fn respond(&self, version: u16, response_uri: &str, reply: Reply) -> GatewayResponse {
        let is_fault = reply.is_fault();
        match build_response_versioned(version, response_uri, reply.value(), is_fault) {
            Ok(body) => GatewayResponse {
                status: STATUS_OK,
                body,
                is_fault,
            },
            Err(e) => {
                let err = GatewayError::Encode(e);
                error!(error = %err, response_uri, "reply encoding failed");
                let fault = fault_value(&err, response_uri);
                match build_response_versioned(version, response_uri, &fault, true) {
                    Ok(body) => GatewayResponse {
                        status: STATUS_OK,
                        body,
                        is_fault: true,
                    },
                    Err(e) => {
                        error!(error = %e, "fault encoding failed");
                        GatewayResponse {
                            status: STATUS_INTERNAL_ERROR,
                            body: Vec::new(),
                            is_fault: true,
                        }
                    }
                }
            }
        }
    }
}

fn log_failure(err: &GatewayError) {
    let code = fault_code(err);
    match err {
        GatewayError::Handler(HandlerError::Application(_)) => {
            debug!(code, error = %err, "call rejected")
        }
        GatewayError::Handler(HandlerError::GuardUnavailable(_)) | GatewayError::Panic(_) => {
            error!(code, error = %err, "call failed")
        }
        _ => warn!(code, error = %err, "call failed"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
