//! In-process replay store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::store::{Claim, ClaimTicket, ReplayKey, ReplayStore};
use crate::error::StoreError;

#[derive(Debug)]
enum Slot {
    Pending(ClaimTicket),
    Completed(Vec<u8>),
}

#[derive(Debug)]
struct Record {
    slot: Slot,
    expires_at_ms: u64,
}

/// Replay store held in a mutex-guarded map. Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryReplayStore {
    records: Mutex<HashMap<ReplayKey, Record>>,
    next_ticket: AtomicU64,
}

impl MemoryReplayStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl ReplayStore for MemoryReplayStore {
    fn lookup(&self, key: &ReplayKey, now_ms: u64) -> Result<Option<Vec<u8>>, StoreError> {
        let records = self.records.lock();
        Ok(match records.get(key) {
            Some(Record {
                slot: Slot::Completed(reply),
                expires_at_ms,
            }) if *expires_at_ms > now_ms => Some(reply.clone()),
            _ => None,
        })
    }

    fn claim(&self, key: &ReplayKey, now_ms: u64, lease_until_ms: u64) -> Result<Claim, StoreError> {
        let mut records = self.records.lock();
        if let Some(record) = records.get(key) {
            if record.expires_at_ms > now_ms {
                return Ok(match &record.slot {
                    Slot::Completed(reply) => Claim::Completed(reply.clone()),
                    Slot::Pending(_) => Claim::InFlight,
                });
            }
        }
        let ticket = ClaimTicket::new(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        records.insert(
            key.clone(),
            Record {
                slot: Slot::Pending(ticket),
                expires_at_ms: lease_until_ms,
            },
        );
        Ok(Claim::Acquired(ticket))
    }

    fn store(&self, key: &ReplayKey, reply: &[u8], expires_at_ms: u64) -> Result<(), StoreError> {
        self.records.lock().insert(
            key.clone(),
            Record {
                slot: Slot::Completed(reply.to_vec()),
                expires_at_ms,
            },
        );
        Ok(())
    }

    fn complete(
        &self,
        key: &ReplayKey,
        ticket: ClaimTicket,
        reply: &[u8],
        expires_at_ms: u64,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.lock();
        match records.get(key).map(|r| &r.slot) {
            None => {}
            Some(Slot::Pending(held)) if *held == ticket => {}
            Some(_) => return Ok(false),
        }
        records.insert(
            key.clone(),
            Record {
                slot: Slot::Completed(reply.to_vec()),
                expires_at_ms,
            },
        );
        Ok(true)
    }

    fn release(&self, key: &ReplayKey, ticket: ClaimTicket) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        if matches!(records.get(key), Some(Record { slot: Slot::Pending(held), .. }) if *held == ticket) {
            records.remove(key);
        }
        Ok(())
    }

    fn purge_expired(&self, now_ms: u64) -> Result<usize, StoreError> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| r.expires_at_ms > now_ms);
        Ok(before - records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::ReplayToken;

    fn key(identity: &str) -> ReplayKey {
        ReplayKey::new(identity, ReplayToken::digest(&[&b"body"[..]]), "api.shop.buy")
    }

    #[test]
    fn test_claim_lifecycle() {
        let store = MemoryReplayStore::new();
        let k = key("alice");

        let Claim::Acquired(ticket) = store.claim(&k, 1_000, 2_000).unwrap() else {
            panic!("fresh key must be claimable");
        };
        assert_eq!(store.claim(&k, 1_500, 2_500).unwrap(), Claim::InFlight);
        assert_eq!(store.lookup(&k, 1_500).unwrap(), None);

        assert!(store.complete(&k, ticket, b"reply", 31_000).unwrap());
        assert_eq!(
            store.claim(&k, 2_000, 3_000).unwrap(),
            Claim::Completed(b"reply".to_vec())
        );
        assert_eq!(store.lookup(&k, 30_999).unwrap(), Some(b"reply".to_vec()));
        assert_eq!(store.lookup(&k, 31_000).unwrap(), None);
    }

    #[test]
    fn test_expired_lease_can_be_reclaimed() {
        let store = MemoryReplayStore::new();
        let k = key("alice");
        assert!(matches!(store.claim(&k, 0, 100).unwrap(), Claim::Acquired(_)));
        assert!(matches!(store.claim(&k, 100, 200).unwrap(), Claim::Acquired(_)));
    }

    #[test]
    fn test_stale_ticket_cannot_touch_newer_claim() {
        let store = MemoryReplayStore::new();
        let k = key("alice");
        let Claim::Acquired(stale) = store.claim(&k, 0, 100).unwrap() else {
            panic!("fresh key must be claimable");
        };
        let Claim::Acquired(fresh) = store.claim(&k, 100, 200).unwrap() else {
            panic!("expired lease must be claimable");
        };
        assert_ne!(stale, fresh);

        // The slow first holder fails and releases; the newer claim survives.
        store.release(&k, stale).unwrap();
        assert_eq!(store.claim(&k, 150, 250).unwrap(), Claim::InFlight);

        assert!(!store.complete(&k, stale, b"stale", 1_000).unwrap());
        assert!(store.complete(&k, fresh, b"fresh", 1_000).unwrap());
        assert_eq!(store.lookup(&k, 150).unwrap(), Some(b"fresh".to_vec()));

        // Completed replies are not released by a late failure either.
        store.release(&k, fresh).unwrap();
        assert_eq!(store.lookup(&k, 150).unwrap(), Some(b"fresh".to_vec()));
    }

    #[test]
    fn test_identities_are_isolated() {
        let store = MemoryReplayStore::new();
        store.store(&key("alice"), b"a", 100).unwrap();
        assert_eq!(store.lookup(&key("bob"), 0).unwrap(), None);
    }

    #[test]
    fn test_release_and_purge() {
        let store = MemoryReplayStore::new();
        store.store(&key("a"), b"1", 100).unwrap();
        store.store(&key("b"), b"2", 300).unwrap();
        let Claim::Acquired(ticket) = store.claim(&key("c"), 0, 50).unwrap() else {
            panic!("fresh key must be claimable");
        };
        let Claim::Acquired(released) = store.claim(&key("d"), 0, 500).unwrap() else {
            panic!("fresh key must be claimable");
        };

        store.release(&key("d"), released).unwrap();
        // A ticket does not release a completed record.
        store.release(&key("b"), ticket).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.purge_expired(100).unwrap(), 2);
        assert_eq!(store.len(), 1);
    }
}
