//! HTTP transport: mio event loop, request framing and identity resolution.

mod connection;
pub mod http;
mod server;
mod stats;

pub use connection::{Connection, ReadOutcome};
pub use http::{parse_head, write_response, HeaderIdentity, HttpError, IdentityResolver, RequestHead};
pub use server::{
    spawn_workers, Server, ServerOptions, Shared, DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_SOCKET_BUFFER_BYTES, MAX_WRITE_BACKLOG,
};
pub use stats::{GatewayStats, StatsSnapshot};
