//! amfgate: an AMF0 remoting gateway.
//!
//! Decodes AMF0 request packets arriving over HTTP, dispatches each call to a
//! handler registered by name, and encodes the reply. Mutating handlers can
//! wrap their work in a [`guard::ReplayGuard`] so a retried request replays
//! the stored reply instead of executing twice.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod guard;
pub mod housekeeping;
pub mod network;
pub mod protocol;

pub use config::GatewayConfig;
pub use dispatch::{Call, Gateway, GatewayResponse, Identity, ModuleHandlers, Registry, Reply};
pub use error::{
    ApplicationError, ConfigError, EncodeError, FormatError, GatewayError, HandlerError, StoreError,
};
pub use guard::{ReplayGuard, UnavailablePolicy};
pub use protocol::{Date, Map, Value};
