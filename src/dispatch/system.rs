//! Built-in `system` module available to every deployment.

use std::time::{SystemTime, UNIX_EPOCH};

use super::context::Call;
use super::registry::ModuleHandlers;
use crate::error::HandlerError;
use crate::protocol::{Date, Value};

pub const MODULE_NAME: &str = "system";
pub const PING: &str = "api.system.ping";
pub const TIME: &str = "api.system.time";

/// `ping` echoes its parameters back; `time` returns the server clock as a date.
pub fn system_module<S: 'static>() -> ModuleHandlers<S> {
    ModuleHandlers::new()
        .route(PING, |call: &Call<'_>, _: &S| ping(call))
        .route(TIME, |_: &Call<'_>, _: &S| Ok(Value::Date(now())))
}

fn ping(call: &Call<'_>) -> Result<Value, HandlerError> {
    Ok(Value::StrictArray(call.params()?.into_vec()))
}

fn now() -> Date {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0);
    Date::from_millis(millis)
}
