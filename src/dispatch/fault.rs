//! Fault bodies sent to `<responseURI>/onStatus`.

use crate::error::{GatewayError, HandlerError};
use crate::protocol::Value;

/// Fault codes understood by clients.
pub mod codes {
    pub const FORMAT: &str = "Gateway.Format";
    pub const UNSUPPORTED_BATCH: &str = "Gateway.UnsupportedBatch";
    pub const METHOD_NOT_FOUND: &str = "Gateway.MethodNotFound";
    pub const APPLICATION: &str = "Gateway.Application";
    pub const BAD_ARGUMENT: &str = "Gateway.BadArgument";
    pub const GUARD_UNAVAILABLE: &str = "Gateway.GuardUnavailable";
    pub const REPLAY_IN_FLIGHT: &str = "Gateway.ReplayInFlight";
    pub const INTERNAL: &str = "Gateway.Internal";
}

const INTERNAL_DESCRIPTION: &str = "internal server error";

pub fn fault_code(error: &GatewayError) -> &str {
    match error {
        GatewayError::Format(_) => codes::FORMAT,
        GatewayError::UnsupportedBatch { .. } => codes::UNSUPPORTED_BATCH,
        GatewayError::MethodNotFound { .. } => codes::METHOD_NOT_FOUND,
        GatewayError::Handler(handler) => match handler {
            HandlerError::Application(app) => app.code.as_deref().unwrap_or(codes::APPLICATION),
            HandlerError::Format(_) => codes::FORMAT,
            HandlerError::BadArgument { .. } => codes::BAD_ARGUMENT,
            HandlerError::GuardUnavailable(_) => codes::GUARD_UNAVAILABLE,
            HandlerError::ReplayInFlight => codes::REPLAY_IN_FLIGHT,
        },
        GatewayError::Panic(_) | GatewayError::Encode(_) => codes::INTERNAL,
    }
}

/// Client-facing text. Internal failures are not described beyond a generic line.
fn description(error: &GatewayError) -> String {
    match error {
        GatewayError::Panic(_) | GatewayError::Encode(_) => INTERNAL_DESCRIPTION.to_owned(),
        GatewayError::Handler(HandlerError::GuardUnavailable(_)) => {
            "idempotency guard unavailable, call was not executed".to_owned()
        }
        other => other.to_string(),
    }
}

/// `{level, code, description, details}`; `details` names the failed target.
pub fn fault_value(error: &GatewayError, details: &str) -> Value {
    Value::object([
        ("level", Value::from("error")),
        ("code", Value::from(fault_code(error))),
        ("description", Value::from(description(error))),
        ("details", Value::from(details)),
    ])
}

/// Whether `value` has the shape produced by [`fault_value`].
pub fn is_fault(value: &Value) -> bool {
    value.get("level").and_then(Value::as_str) == Some("error")
        && value.get("code").and_then(Value::as_str).is_some()
}
