//! Gateway counters, shared by all workers and logged periodically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::info;

#[derive(Debug, Default)]
pub struct GatewayStats {
    pub requests: AtomicU64,
    pub faults: AtomicU64,
    pub http_errors: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
}

/// Point-in-time copy of [`GatewayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub faults: u64,
    pub http_errors: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub connections_total: u64,
    pub connections_active: u64,
}

impl GatewayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn request_served(&self, bytes_in: usize, bytes_out: usize, is_fault: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if is_fault {
            self.faults.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_received.fetch_add(bytes_in as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes_out as u64, Ordering::Relaxed);
    }

    pub(crate) fn http_error(&self) {
        self.http_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            http_errors: self.http_errors.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
        }
    }

    pub fn log_snapshot(&self, uptime: Duration) {
        let s = self.snapshot();
        let rate = s.requests as f64 / uptime.as_secs_f64().max(f64::EPSILON);
        info!(
            uptime_secs = uptime.as_secs(),
            requests = s.requests,
            requests_per_sec = (rate * 10.0).round() / 10.0,
            faults = s.faults,
            http_errors = s.http_errors,
            bytes_in = s.bytes_received,
            bytes_out = s.bytes_sent,
            connections = s.connections_active,
            connections_total = s.connections_total,
            "gateway stats"
        );
    }
}
