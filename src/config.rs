//! Runtime configuration: command line flags, each with an `AMFGATE_*` env fallback.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;
use crate::network::{ServerOptions, DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_CONNECTIONS};
use crate::protocol::{DecodeLimits, DEFAULT_MAX_DEPTH, DEFAULT_MAX_NODES};

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_REPLAY_TTL_SECS: u64 = 30;
pub const DEFAULT_CLAIM_LEASE_SECS: u64 = 300;
pub const DEFAULT_REPLAY_STORE_MB: usize = 16;
pub const DEFAULT_SOCKET_BUFFER_KB: usize = 256;
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(name = "amfgate_server", version, about = "AMF0 remoting gateway over HTTP")]
pub struct GatewayConfig {
    /// Address to listen on.
    #[arg(short, long, env = "AMFGATE_BIND", default_value = DEFAULT_BIND)]
    pub bind: String,

    /// Event-loop worker threads.
    #[arg(short, long, env = "AMFGATE_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Largest accepted request body.
    #[arg(long, env = "AMFGATE_MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    /// Deepest accepted value nesting.
    #[arg(long, env = "AMFGATE_MAX_DEPTH", default_value_t = DEFAULT_MAX_DEPTH)]
    pub max_depth: usize,

    /// Most values one body may decode to, counting every use of a reference.
    #[arg(long, env = "AMFGATE_MAX_NODES", default_value_t = DEFAULT_MAX_NODES)]
    pub max_nodes: usize,

    /// How long a guarded reply is replayed.
    #[arg(long, env = "AMFGATE_REPLAY_TTL_SECS", default_value_t = DEFAULT_REPLAY_TTL_SECS)]
    pub replay_ttl_secs: u64,

    /// How long an unfinished guarded call blocks its duplicates; must
    /// outlast the slowest guarded handler.
    #[arg(long, env = "AMFGATE_CLAIM_LEASE_SECS", default_value_t = DEFAULT_CLAIM_LEASE_SECS)]
    pub claim_lease_secs: u64,

    /// Replay log file. Without it replies are kept in memory only.
    #[arg(long, env = "AMFGATE_REPLAY_STORE")]
    pub replay_store: Option<PathBuf>,

    /// Replay log size for a new file.
    #[arg(long, env = "AMFGATE_REPLAY_STORE_MB", default_value_t = DEFAULT_REPLAY_STORE_MB)]
    pub replay_store_mb: usize,

    /// Request header carrying the authenticated user.
    #[arg(long, env = "AMFGATE_IDENTITY_HEADER", default_value = crate::network::http::DEFAULT_IDENTITY_HEADER)]
    pub identity_header: String,

    #[arg(long, env = "AMFGATE_SOCKET_BUFFER_KB", default_value_t = DEFAULT_SOCKET_BUFFER_KB)]
    pub socket_buffer_kb: usize,

    /// Seconds between stats log lines; 0 disables them.
    #[arg(long, env = "AMFGATE_STATS_INTERVAL_SECS", default_value_t = DEFAULT_STATS_INTERVAL_SECS)]
    pub stats_interval_secs: u64,

    /// Log filter, e.g. `info` or `amfgate=debug`.
    #[arg(long, env = "AMFGATE_LOG", default_value = "info")]
    pub log: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_owned(),
            workers: DEFAULT_WORKERS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_depth: DEFAULT_MAX_DEPTH,
            max_nodes: DEFAULT_MAX_NODES,
            replay_ttl_secs: DEFAULT_REPLAY_TTL_SECS,
            claim_lease_secs: DEFAULT_CLAIM_LEASE_SECS,
            replay_store: None,
            replay_store_mb: DEFAULT_REPLAY_STORE_MB,
            identity_header: crate::network::http::DEFAULT_IDENTITY_HEADER.to_owned(),
            socket_buffer_kb: DEFAULT_SOCKET_BUFFER_KB,
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
            log: "info".to_owned(),
        }
    }
}

impl GatewayConfig {
    /// Check ranges and resolve the bind address.
    pub fn validate(&self) -> Result<SocketAddr, ConfigError> {
        let non_zero = [
            ("workers", self.workers),
            ("max_body_bytes", self.max_body_bytes),
            ("max_depth", self.max_depth),
            ("max_nodes", self.max_nodes),
            ("replay_store_mb", self.replay_store_mb),
        ];
        if let Some((field, _)) = non_zero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero { field: *field });
        }
        let non_zero_secs = [
            ("replay_ttl_secs", self.replay_ttl_secs),
            ("claim_lease_secs", self.claim_lease_secs),
        ];
        if let Some((field, _)) = non_zero_secs.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero { field: *field });
        }
        if self.identity_header.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "identity_header",
            });
        }

        self.bind
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::BindAddr(self.bind.clone()))
    }

    pub fn decode_limits(&self) -> DecodeLimits {
        DecodeLimits {
            max_depth: self.max_depth,
            max_nodes: self.max_nodes,
        }
    }

    pub fn replay_ttl(&self) -> Duration {
        Duration::from_secs(self.replay_ttl_secs)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    pub fn replay_store_bytes(&self) -> usize {
        self.replay_store_mb.saturating_mul(1024 * 1024)
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            max_body_bytes: self.max_body_bytes,
            socket_buffer_bytes: self.socket_buffer_kb.saturating_mul(1024),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}
