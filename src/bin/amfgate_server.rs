//! amfgate server binary.
//!
//! Usage:
//!   cargo run --release --bin amfgate_server -- [OPTIONS]

use std::net::TcpListener;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

use amfgate::dispatch::{system, Gateway, Registry};
use amfgate::guard::{MemoryReplayStore, MmapReplayStore, ReplayGuard, ReplayStore};
use amfgate::housekeeping::{spawn_housekeeping, Schedule};
use amfgate::network::{spawn_workers, GatewayStats, HeaderIdentity, Shared};
use amfgate::GatewayConfig;

/// State handed to every handler. Deployments add their own modules and
/// state alongside the guard.
pub struct ServerState {
    pub guard: ReplayGuard,
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn open_replay_store(config: &GatewayConfig) -> anyhow::Result<Arc<dyn ReplayStore>> {
    Ok(match &config.replay_store {
        Some(path) => Arc::new(
            MmapReplayStore::open(path, config.replay_store_bytes())
                .with_context(|| format!("opening replay store {}", path.display()))?,
        ),
        None => {
            warn!("no replay store path configured, replies are cached in memory only");
            Arc::new(MemoryReplayStore::new())
        }
    })
}

fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let addr = config.validate()?;

    let store = open_replay_store(&config)?;
    let guard = ReplayGuard::new(store)
        .with_default_ttl(config.replay_ttl())
        .with_claim_lease(config.claim_lease());

    let registry = Registry::builder()
        .register(system::MODULE_NAME, 0, system::system_module::<ServerState>)
        .build();
    let gateway = Arc::new(
        Gateway::new(registry, ServerState { guard }).with_limits(config.decode_limits()),
    );

    let listener = TcpListener::bind(addr).with_context(|| format!("binding {}", addr))?;
    let running = Arc::new(AtomicBool::new(true));
    let stats = Arc::new(GatewayStats::new());
    let shared = Shared {
        gateway: Arc::clone(&gateway),
        resolver: Arc::new(HeaderIdentity::new(config.identity_header.clone())),
        stats: Arc::clone(&stats),
        options: config.server_options(),
        running: Arc::clone(&running),
    };

    info!(
        %addr,
        workers = config.workers,
        max_body_bytes = config.max_body_bytes,
        replay_ttl_secs = config.replay_ttl_secs,
        "amfgate starting"
    );
    let workers = spawn_workers(listener, config.workers, shared)?;

    // Purging runs whether or not stats are logged.
    let housekeeping = Schedule {
        purge_interval: config.replay_ttl(),
        stats_interval: config.stats_interval(),
    };
    spawn_housekeeping(housekeeping, Arc::clone(&running), stats, move || {
        gateway.state().guard.purge_expired()
    })?;

    let mut failed = false;
    for worker in workers {
        match worker.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "worker exited with error");
                failed = true;
            }
            Err(_) => {
                error!("worker panicked");
                failed = true;
            }
        }
    }

    if failed {
        return Err(anyhow!("one or more workers failed"));
    }
    Ok(())
}

fn main() -> ExitCode {
    let config = GatewayConfig::parse();
    init_tracing(&config.log);

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("amfgate failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
