//! Replay store contract and the clock the guard reads expiry against.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::token::ReplayToken;
use crate::error::StoreError;

/// Identity + token + method. Calls only replay for the same caller and target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplayKey {
    pub identity: String,
    pub token: ReplayToken,
    pub target_uri: String,
}

impl ReplayKey {
    pub fn new(identity: impl Into<String>, token: ReplayToken, target_uri: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            token,
            target_uri: target_uri.into(),
        }
    }
}

/// Proof of holding a pending record. Only the holder may complete or release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimTicket(u64);

impl ClaimTicket {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

/// Result of trying to claim a key for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// No live record existed; a pending record now holds the key.
    Acquired(ClaimTicket),
    /// A completed reply is stored and unexpired.
    Completed(Vec<u8>),
    /// Another call holds an unexpired pending record.
    InFlight,
}

/// Keyed storage of encoded replies with per-entry expiry.
///
/// All times are epoch milliseconds supplied by the caller, so stores never
/// read a clock themselves.
pub trait ReplayStore: Send + Sync {
    /// Completed, unexpired reply for `key`.
    fn lookup(&self, key: &ReplayKey, now_ms: u64) -> Result<Option<Vec<u8>>, StoreError>;

    /// Atomically check for a live record and, if there is none, insert a
    /// pending one that expires at `lease_until_ms`.
    fn claim(&self, key: &ReplayKey, now_ms: u64, lease_until_ms: u64) -> Result<Claim, StoreError>;

    /// Store a completed reply, replacing whatever record `key` has.
    fn store(&self, key: &ReplayKey, reply: &[u8], expires_at_ms: u64) -> Result<(), StoreError>;

    /// Turn the pending record held by `ticket` into a completed reply.
    ///
    /// Also writes when `key` has no record at all. Returns `Ok(false)` and
    /// writes nothing when another claim or a completed reply holds the key.
    fn complete(
        &self,
        key: &ReplayKey,
        ticket: ClaimTicket,
        reply: &[u8],
        expires_at_ms: u64,
    ) -> Result<bool, StoreError>;

    /// Drop the pending record held by `ticket`. Records owned by anyone
    /// else are left alone.
    fn release(&self, key: &ReplayKey, ticket: ClaimTicket) -> Result<(), StoreError>;

    /// Remove expired records, returning how many were dropped.
    fn purge_expired(&self, now_ms: u64) -> Result<usize, StoreError>;
}

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Hand-driven clock for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(duration_ms(by), Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
