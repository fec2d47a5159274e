//! Idempotency guard for mutating calls.
//!
//! A handler wraps its side effects in [`ReplayGuard::run`]. The first call
//! for a key claims it, runs, and stores the encoded reply; identical calls
//! within the TTL get the stored bytes back without running again, and a
//! duplicate arriving while the first is still running is rejected instead of
//! executing twice.

mod memory;
mod mmap_store;
mod store;
mod token;

pub use memory::MemoryReplayStore;
pub use mmap_store::MmapReplayStore;
pub use store::{Claim, ClaimTicket, Clock, ManualClock, ReplayKey, ReplayStore, SystemClock};
pub use token::{BodyDigest, HeaderToken, ReplayToken, TokenStrategy, TOKEN_LEN};

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::dispatch::{Call, Identity};
use crate::error::{HandlerError, StoreError};
use crate::protocol::{encode_value, Value};
use store::duration_ms;

pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// How long a claim blocks duplicates while its body runs. Must outlast the
/// slowest guarded handler, or a duplicate may run it a second time.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(300);

/// What to do when the replay store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnavailablePolicy {
    /// Refuse the call; nothing is executed.
    #[default]
    FailClosed,
    /// Execute without protection against duplicates.
    ProceedUnguarded,
}

pub struct ReplayGuard {
    store: Arc<dyn ReplayStore>,
    strategy: Arc<dyn TokenStrategy>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    claim_lease: Duration,
}

impl ReplayGuard {
    /// Guard over `store` with body-digest tokens, the system clock, a 30s
    /// TTL and a five minute claim lease.
    pub fn new(store: Arc<dyn ReplayStore>) -> Self {
        Self {
            store,
            strategy: Arc::new(BodyDigest),
            clock: Arc::new(SystemClock),
            default_ttl: DEFAULT_TTL,
            claim_lease: DEFAULT_CLAIM_LEASE,
        }
    }

    pub fn with_strategy<T: TokenStrategy + 'static>(mut self, strategy: T) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn claim_lease(&self) -> Duration {
        self.claim_lease
    }

    pub fn key_for(&self, call: &Call<'_>) -> ReplayKey {
        ReplayKey::new(
            identity_scope(call.identity()),
            self.strategy.token(call),
            call.target_uri(),
        )
    }

    /// Stored reply for `key`, as raw bytes ready to be sent verbatim.
    pub fn lookup(&self, key: &ReplayKey) -> Result<Option<Value>, StoreError> {
        Ok(self
            .store
            .lookup(key, self.clock.now_ms())?
            .map(Value::RawBytes))
    }

    /// Encode `value` and store it under `key` for `ttl`.
    pub fn store(&self, key: &ReplayKey, value: &Value, ttl: Duration) -> Result<(), StoreError> {
        let bytes = encode_value(value)?;
        let expires_at_ms = self.clock.now_ms().saturating_add(duration_ms(ttl));
        self.store.store(key, &bytes, expires_at_ms)
    }

    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        self.store.purge_expired(self.clock.now_ms())
    }

    /// Run `body` at most once per key within the default TTL.
    pub fn run<F>(&self, call: &Call<'_>, policy: UnavailablePolicy, body: F) -> Result<Value, HandlerError>
    where
        F: FnOnce() -> Result<Value, HandlerError>,
    {
        self.run_with_ttl(call, policy, self.default_ttl, body)
    }

    pub fn run_with_ttl<F>(
        &self,
        call: &Call<'_>,
        policy: UnavailablePolicy,
        ttl: Duration,
        body: F,
    ) -> Result<Value, HandlerError>
    where
        F: FnOnce() -> Result<Value, HandlerError>,
    {
        let key = self.key_for(call);
        let now = self.clock.now_ms();

        let ticket = match self.store.claim(&key, now, now.saturating_add(duration_ms(self.claim_lease))) {
            Ok(Claim::Completed(reply)) => {
                debug!(token = %key.token, "replaying stored reply");
                return Ok(Value::RawBytes(reply));
            }
            Ok(Claim::InFlight) => {
                warn!(token = %key.token, "duplicate call while original is in flight");
                return Err(HandlerError::ReplayInFlight);
            }
            Ok(Claim::Acquired(ticket)) => ticket,
            Err(e) => {
                return match policy {
                    UnavailablePolicy::FailClosed => {
                        error!(error = %e, "replay store unavailable, refusing call");
                        Err(HandlerError::GuardUnavailable(e))
                    }
                    UnavailablePolicy::ProceedUnguarded => {
                        warn!(error = %e, "replay store unavailable, running unguarded");
                        body()
                    }
                };
            }
        };

        let mut claim = HeldClaim {
            store: self.store.as_ref(),
            key: &key,
            ticket,
            armed: true,
        };
        let value = body()?;
        // The side effects are committed; keep the claim even if caching fails
        // so a retry is refused rather than executed again.
        claim.armed = false;

        let expires_at_ms = self.clock.now_ms().saturating_add(duration_ms(ttl));
        let cached = encode_value(&value)
            .map_err(StoreError::from)
            .and_then(|bytes| self.store.complete(&key, ticket, &bytes, expires_at_ms));
        match cached {
            Ok(true) => {}
            Ok(false) => error!(
                token = %key.token,
                lease_ms = duration_ms(self.claim_lease),
                "claim lease ran out before the body finished; a duplicate may have run"
            ),
            Err(e) => warn!(token = %key.token, error = %e, "reply not cached"),
        }
        Ok(value)
    }
}

/// Users and guests never share replay keys, even with equal subjects.
fn identity_scope(identity: &Identity) -> String {
    let kind = if identity.is_guest() { "guest" } else { "user" };
    format!("{}:{}", kind, identity.subject())
}

/// Releases a claim when the guarded body fails or unwinds.
struct HeldClaim<'a> {
    store: &'a dyn ReplayStore,
    key: &'a ReplayKey,
    ticket: ClaimTicket,
    armed: bool,
}

impl Drop for HeldClaim<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.store.release(self.key, self.ticket) {
                warn!(token = %self.key.token, error = %e, "failed to release replay claim");
            }
        }
    }
}
