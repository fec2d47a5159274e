//! Durable replay store on a memory-mapped append log.
//!
//! File layout:
//! - 64-byte header: magic, format version, data capacity, write position
//! - data region: records appended back to back
//!
//! Each record is `kind u8 | expires_at u64 | ticket u64 | identity_len u16 |
//! target_len u16 | reply_len u32 | token [32] | identity | target | reply`,
//! little endian. The in-memory index is rebuilt by replaying the log on
//! open; a later record for the same key supersedes earlier ones.
//!
//! When the log fills up, live records are copied into a staging file that
//! replaces the log by rename, so a crash mid-compaction leaves the old log
//! untouched.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::store::{Claim, ClaimTicket, ReplayKey, ReplayStore};
use super::token::{ReplayToken, TOKEN_LEN};
use crate::error::StoreError;

const MAGIC: u64 = 0x314C_5052_4746_4D41; // "AMFGRPL1" little endian
const VERSION: u32 = 2;
const HEADER_SIZE: usize = 64;

const MAGIC_AT: usize = 0;
const VERSION_AT: usize = 8;
const CAPACITY_AT: usize = 16;
const WRITE_POS_AT: usize = 24;

const RECORD_FIXED: usize = 1 + 8 + 8 + 2 + 2 + 4 + TOKEN_LEN;

const STAGING_SUFFIX: &str = "compact";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordKind {
    Pending = 1,
    Completed = 2,
    Tombstone = 3,
}

impl RecordKind {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Pending),
            2 => Some(Self::Completed),
            3 => Some(Self::Tombstone),
            _ => None,
        }
    }
}

/// Where a key's latest record lives.
#[derive(Debug, Clone, Copy)]
struct Slot {
    kind: RecordKind,
    expires_at_ms: u64,
    ticket: u64,
    reply_at: usize,
    reply_len: usize,
}

impl Slot {
    fn held_by(&self, ticket: ClaimTicket) -> bool {
        self.kind == RecordKind::Pending && self.ticket == ticket.id()
    }
}

struct Log {
    path: PathBuf,
    mmap: MmapMut,
    capacity: usize,
    write_pos: usize,
    index: HashMap<ReplayKey, Slot>,
    /// Latest time seen from a caller; compaction triggered by `release` uses it.
    last_now_ms: u64,
    next_ticket: u64,
}

/// Replay store that survives restarts.
pub struct MmapReplayStore {
    log: Mutex<Log>,
    path: PathBuf,
}

impl MmapReplayStore {
    /// Create or open the store at `path`.
    ///
    /// `capacity` is the data region size for a new file; an existing file
    /// keeps the capacity it was created with.
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if capacity == 0 {
            return Err(StoreError::Unavailable("capacity must be non-zero".into()));
        }

        // Left behind by a compaction that never reached its rename.
        let staging = staging_path(&path);
        if staging.exists() {
            warn!(path = %staging.display(), "discarding interrupted compaction");
            if let Err(e) = fs::remove_file(&staging) {
                warn!(error = %e, "could not remove staging file");
            }
        }

        let existing = match fs::metadata(&path) {
            Ok(meta) => meta.len() as usize,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let log = if existing == 0 {
            Log::create(&path, capacity)?
        } else {
            Log::load(&path, existing)?
        };

        info!(
            path = %path.display(),
            capacity = log.capacity,
            used = log.write_pos,
            keys = log.index.len(),
            "replay store opened"
        );

        Ok(Self {
            log: Mutex::new(log),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of the data region currently in use.
    pub fn used(&self) -> usize {
        self.log.lock().write_pos
    }

    pub fn capacity(&self) -> usize {
        self.log.lock().capacity
    }

    pub fn len(&self) -> usize {
        self.log.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().index.is_empty()
    }
}

impl ReplayStore for MmapReplayStore {
    fn lookup(&self, key: &ReplayKey, now_ms: u64) -> Result<Option<Vec<u8>>, StoreError> {
        let mut log = self.log.lock();
        log.observe(now_ms);
        Ok(match log.index.get(key) {
            Some(slot) if slot.kind == RecordKind::Completed && slot.expires_at_ms > now_ms => {
                Some(log.reply(slot).to_vec())
            }
            _ => None,
        })
    }

    fn claim(&self, key: &ReplayKey, now_ms: u64, lease_until_ms: u64) -> Result<Claim, StoreError> {
        let mut log = self.log.lock();
        log.observe(now_ms);
        if let Some(slot) = log.index.get(key).copied() {
            if slot.expires_at_ms > now_ms {
                return Ok(match slot.kind {
                    RecordKind::Completed => Claim::Completed(log.reply(&slot).to_vec()),
                    _ => Claim::InFlight,
                });
            }
        }
        let ticket = log.next_ticket;
        log.append(RecordKind::Pending, key, ticket, &[], lease_until_ms)?;
        log.next_ticket += 1;
        Ok(Claim::Acquired(ClaimTicket::new(ticket)))
    }

    fn store(&self, key: &ReplayKey, reply: &[u8], expires_at_ms: u64) -> Result<(), StoreError> {
        self.log
            .lock()
            .append(RecordKind::Completed, key, 0, reply, expires_at_ms)
    }

    fn complete(
        &self,
        key: &ReplayKey,
        ticket: ClaimTicket,
        reply: &[u8],
        expires_at_ms: u64,
    ) -> Result<bool, StoreError> {
        let mut log = self.log.lock();
        match log.index.get(key) {
            None => {}
            Some(slot) if slot.held_by(ticket) => {}
            Some(_) => return Ok(false),
        }
        log.append(RecordKind::Completed, key, 0, reply, expires_at_ms)?;
        Ok(true)
    }

    fn release(&self, key: &ReplayKey, ticket: ClaimTicket) -> Result<(), StoreError> {
        let mut log = self.log.lock();
        if log.index.get(key).is_some_and(|slot| slot.held_by(ticket)) {
            log.append(RecordKind::Tombstone, key, 0, &[], 0)?;
        }
        Ok(())
    }

    fn purge_expired(&self, now_ms: u64) -> Result<usize, StoreError> {
        let mut log = self.log.lock();
        log.observe(now_ms);
        let before = log.index.len();
        log.compact(now_ms)?;
        Ok(before - log.index.len())
    }
}

impl Log {
    /// New, empty log at `path`, replacing any file already there.
    fn create(path: &Path, capacity: usize) -> Result<Self, StoreError> {
        let total = HEADER_SIZE + capacity;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total as u64)?;

        let mut mmap = map(&file, total)?;
        put_u64(&mut mmap, MAGIC_AT, MAGIC);
        put_u32(&mut mmap, VERSION_AT, VERSION);
        put_u64(&mut mmap, CAPACITY_AT, capacity as u64);
        put_u64(&mut mmap, WRITE_POS_AT, 0);
        mmap.flush()?;

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            capacity,
            write_pos: 0,
            index: HashMap::new(),
            last_now_ms: 0,
            next_ticket: 1,
        })
    }

    /// Map an existing log of `total` bytes and replay it into the index.
    fn load(path: &Path, total: usize) -> Result<Self, StoreError> {
        if total < HEADER_SIZE {
            return Err(StoreError::Corrupt(format!("file of {} bytes has no header", total)));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = map(&file, total)?;
        let capacity = validate_header(&mmap, total)?;

        let mut log = Self {
            path: path.to_path_buf(),
            write_pos: get_u64(&mmap, WRITE_POS_AT) as usize,
            mmap,
            capacity,
            index: HashMap::new(),
            last_now_ms: 0,
            next_ticket: 1,
        };
        if log.write_pos > capacity {
            return Err(StoreError::Corrupt(format!(
                "write position {} beyond capacity {}",
                log.write_pos, capacity
            )));
        }
        log.rebuild_index()?;
        Ok(log)
    }

    fn observe(&mut self, now_ms: u64) {
        self.last_now_ms = self.last_now_ms.max(now_ms);
    }

    fn data(&self) -> &[u8] {
        &self.mmap[HEADER_SIZE..HEADER_SIZE + self.capacity]
    }

    fn reply(&self, slot: &Slot) -> &[u8] {
        &self.data()[slot.reply_at..slot.reply_at + slot.reply_len]
    }

    fn rebuild_index(&mut self) -> Result<(), StoreError> {
        let mut pos = 0;
        while pos < self.write_pos {
            match decode_record(&self.data()[..self.write_pos], pos) {
                Some((key, slot, len)) => {
                    self.next_ticket = self.next_ticket.max(slot.ticket.saturating_add(1));
                    if slot.kind == RecordKind::Tombstone {
                        self.index.remove(&key);
                    } else {
                        self.index.insert(key, slot);
                    }
                    pos += len;
                }
                None => {
                    warn!(
                        offset = pos,
                        dropped = self.write_pos - pos,
                        "replay log has a torn tail, truncating"
                    );
                    self.set_write_pos(pos);
                    break;
                }
            }
        }
        Ok(())
    }

    fn append(
        &mut self,
        kind: RecordKind,
        key: &ReplayKey,
        ticket: u64,
        reply: &[u8],
        expires_at_ms: u64,
    ) -> Result<(), StoreError> {
        let len = record_len(key, reply)?;
        if len > self.capacity {
            return Err(StoreError::Full {
                capacity: self.capacity,
            });
        }
        if self.write_pos + len > self.capacity {
            let now = self.last_now_ms;
            self.compact(now)?;
            if self.write_pos + len > self.capacity {
                return Err(StoreError::Full {
                    capacity: self.capacity,
                });
            }
        }
        self.write_record(kind, key, ticket, reply, expires_at_ms)?;
        self.sync_range(self.write_pos - len, len)
    }

    /// Writes without space checks or flushing. Caller guarantees room.
    fn write_record(
        &mut self,
        kind: RecordKind,
        key: &ReplayKey,
        ticket: u64,
        reply: &[u8],
        expires_at_ms: u64,
    ) -> Result<(), StoreError> {
        let len = record_len(key, reply)?;
        let start = HEADER_SIZE + self.write_pos;
        let buf = &mut self.mmap[start..start + len];

        buf[0] = kind as u8;
        buf[1..9].copy_from_slice(&expires_at_ms.to_le_bytes());
        buf[9..17].copy_from_slice(&ticket.to_le_bytes());
        buf[17..19].copy_from_slice(&(key.identity.len() as u16).to_le_bytes());
        buf[19..21].copy_from_slice(&(key.target_uri.len() as u16).to_le_bytes());
        buf[21..25].copy_from_slice(&(reply.len() as u32).to_le_bytes());
        buf[25..RECORD_FIXED].copy_from_slice(key.token.as_bytes());
        let mut at = RECORD_FIXED;
        for part in [key.identity.as_bytes(), key.target_uri.as_bytes(), reply] {
            buf[at..at + part.len()].copy_from_slice(part);
            at += part.len();
        }

        let slot = Slot {
            kind,
            expires_at_ms,
            ticket,
            reply_at: self.write_pos + len - reply.len(),
            reply_len: reply.len(),
        };
        if kind == RecordKind::Tombstone {
            self.index.remove(key);
        } else {
            self.index.insert(key.clone(), slot);
        }
        self.set_write_pos(self.write_pos + len);
        Ok(())
    }

    /// Copy unexpired records into a staging file and rename it over the log.
    ///
    /// Until the rename the original file is untouched; after it the new
    /// file is already flushed. On error `self` keeps serving the old log.
    fn compact(&mut self, now_ms: u64) -> Result<(), StoreError> {
        let staging = staging_path(&self.path);
        let result = self.compact_into(&staging, now_ms);
        if result.is_err() && staging.is_file() {
            if let Err(e) = fs::remove_file(&staging) {
                debug!(error = %e, "could not remove staging file");
            }
        }
        let mut next = result?;

        fs::rename(&staging, &self.path)?;
        sync_parent_dir(&self.path);
        next.path = self.path.clone();

        debug!(
            kept = next.index.len(),
            reclaimed = self.write_pos.saturating_sub(next.write_pos),
            "replay log compacted"
        );
        *self = next;
        Ok(())
    }

    fn compact_into(&self, staging: &Path, now_ms: u64) -> Result<Log, StoreError> {
        let mut next = Log::create(staging, self.capacity)?;
        next.last_now_ms = self.last_now_ms;
        next.next_ticket = self.next_ticket;
        for (key, slot) in self.index.iter().filter(|(_, slot)| slot.expires_at_ms > now_ms) {
            next.write_record(slot.kind, key, slot.ticket, self.reply(slot), slot.expires_at_ms)?;
        }
        next.mmap.flush()?;
        Ok(next)
    }

    fn set_write_pos(&mut self, pos: usize) {
        self.write_pos = pos;
        put_u64(&mut self.mmap, WRITE_POS_AT, pos as u64);
    }

    fn sync_range(&self, pos: usize, len: usize) -> Result<(), StoreError> {
        self.mmap.flush_async_range(HEADER_SIZE + pos, len)?;
        self.mmap.flush_async_range(0, HEADER_SIZE)?;
        Ok(())
    }
}

fn map(file: &File, total: usize) -> Result<MmapMut, StoreError> {
    // SAFETY: the file is opened read/write and sized to `total`. The store
    // assumes no other process resizes or writes it while mapped.
    Ok(unsafe { MmapOptions::new().len(total).map_mut(file)? })
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

/// Best effort: makes the rename itself durable where the platform allows it.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
            debug!(error = %e, "directory sync failed");
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}

fn validate_header(mmap: &[u8], total: usize) -> Result<usize, StoreError> {
    let magic = get_u64(mmap, MAGIC_AT);
    if magic != MAGIC {
        return Err(StoreError::Corrupt(format!("bad magic 0x{:016x}", magic)));
    }
    let version = get_u32(mmap, VERSION_AT);
    if version != VERSION {
        return Err(StoreError::Corrupt(format!("unsupported format version {}", version)));
    }
    let capacity = get_u64(mmap, CAPACITY_AT) as usize;
    if HEADER_SIZE.checked_add(capacity) != Some(total) {
        return Err(StoreError::Corrupt(format!(
            "capacity {} does not match file size {}",
            capacity, total
        )));
    }
    Ok(capacity)
}

fn record_len(key: &ReplayKey, reply: &[u8]) -> Result<usize, StoreError> {
    if key.identity.len() > usize::from(u16::MAX) || key.target_uri.len() > usize::from(u16::MAX) {
        return Err(StoreError::Unavailable("replay key too long".into()));
    }
    if reply.len() > u32::MAX as usize {
        return Err(StoreError::Unavailable("reply too large to store".into()));
    }
    Ok(RECORD_FIXED + key.identity.len() + key.target_uri.len() + reply.len())
}

/// Parses the record at `pos`; `None` for anything torn or invalid.
fn decode_record(data: &[u8], pos: usize) -> Option<(ReplayKey, Slot, usize)> {
    let fixed = data.get(pos..pos.checked_add(RECORD_FIXED)?)?;
    let kind = RecordKind::from_u8(fixed[0])?;
    let expires_at_ms = u64::from_le_bytes(fixed[1..9].try_into().ok()?);
    let ticket = u64::from_le_bytes(fixed[9..17].try_into().ok()?);
    let identity_len = usize::from(u16::from_le_bytes(fixed[17..19].try_into().ok()?));
    let target_len = usize::from(u16::from_le_bytes(fixed[19..21].try_into().ok()?));
    let reply_len = u32::from_le_bytes(fixed[21..25].try_into().ok()?) as usize;
    let token: [u8; TOKEN_LEN] = fixed[25..RECORD_FIXED].try_into().ok()?;

    let identity_at = pos + RECORD_FIXED;
    let target_at = identity_at + identity_len;
    let reply_at = target_at + target_len;
    let end = reply_at.checked_add(reply_len)?;
    if end > data.len() {
        return None;
    }

    let identity = std::str::from_utf8(&data[identity_at..target_at]).ok()?;
    let target_uri = std::str::from_utf8(&data[target_at..reply_at]).ok()?;
    let key = ReplayKey::new(identity, ReplayToken::from_bytes(token), target_uri);
    let slot = Slot {
        kind,
        expires_at_ms,
        ticket,
        reply_at,
        reply_len,
    };
    Some((key, slot, end - pos))
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(identity: &str, body: &[u8]) -> ReplayKey {
        ReplayKey::new(identity, ReplayToken::digest(&[body]), "api.shop.buy")
    }

    #[test]
    fn test_claim_store_lookup() {
        let dir = tempdir().unwrap();
        let store = MmapReplayStore::open(dir.path().join("replay.log"), 4096).unwrap();
        let k = key("alice", b"buy 7");

        let Claim::Acquired(ticket) = store.claim(&k, 1_000, 2_000).unwrap() else {
            panic!("fresh key must be claimable");
        };
        assert_eq!(store.claim(&k, 1_001, 2_001).unwrap(), Claim::InFlight);

        assert!(store.complete(&k, ticket, b"reply-bytes", 31_000).unwrap());
        assert_eq!(store.lookup(&k, 5_000).unwrap(), Some(b"reply-bytes".to_vec()));
        assert_eq!(
            store.claim(&k, 5_000, 6_000).unwrap(),
            Claim::Completed(b"reply-bytes".to_vec())
        );
        assert_eq!(store.lookup(&k, 31_000).unwrap(), None);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replay.log");
        let kept = key("alice", b"1");
        let released = key("bob", b"2");
        let pending = key("carol", b"3");

        let held = {
            let store = MmapReplayStore::open(&path, 4096).unwrap();
            store.store(&kept, b"first", 10_000).unwrap();
            store.store(&kept, b"second", 20_000).unwrap();
            let Claim::Acquired(ticket) = store.claim(&released, 0, 10_000).unwrap() else {
                panic!("fresh key must be claimable");
            };
            store.release(&released, ticket).unwrap();
            let Claim::Acquired(ticket) = store.claim(&pending, 0, 10_000).unwrap() else {
                panic!("fresh key must be claimable");
            };
            ticket
        };

        let store = MmapReplayStore::open(&path, 1).unwrap();
        assert_eq!(store.capacity(), 4096);
        assert_eq!(store.len(), 2);
        assert_eq!(store.lookup(&kept, 0).unwrap(), Some(b"second".to_vec()));
        assert!(matches!(store.claim(&released, 0, 10_000).unwrap(), Claim::Acquired(_)));

        // The pending claim outlives the restart, and new tickets never repeat it.
        assert_eq!(store.claim(&pending, 5_000, 15_000).unwrap(), Claim::InFlight);
        let Claim::Acquired(next) = store.claim(&pending, 10_000, 20_000).unwrap() else {
            panic!("expired lease must be claimable");
        };
        assert_ne!(next, held);
    }

    #[test]
    fn test_compaction_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replay.log");
        let live = key("alice", b"live");
        {
            let store = MmapReplayStore::open(&path, 4096).unwrap();
            store.store(&live, b"kept", u64::MAX).unwrap();
            for i in 0..5u64 {
                store.store(&key("bob", &i.to_le_bytes()), b"old", 100).unwrap();
            }
            assert_eq!(store.purge_expired(200).unwrap(), 5);
        }

        assert!(!staging_path(&path).exists());
        let store = MmapReplayStore::open(&path, 4096).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup(&live, 0).unwrap(), Some(b"kept".to_vec()));
    }

    #[test]
    fn test_interrupted_compaction_keeps_live_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replay.log");
        let completed = key("alice", b"1");
        let pending = key("bob", b"2");
        {
            let store = MmapReplayStore::open(&path, 4096).unwrap();
            store.store(&completed, b"done", u64::MAX).unwrap();
            store.claim(&pending, 0, u64::MAX).unwrap();
            store.store(&key("carol", b"3"), b"old", 100).unwrap();

            // A staging path that cannot be created makes compaction fail
            // halfway; the log keeps serving from the original file.
            fs::create_dir(staging_path(&path)).unwrap();
            assert!(store.purge_expired(200).is_err());
            assert_eq!(store.lookup(&completed, 300).unwrap(), Some(b"done".to_vec()));
            fs::remove_dir(staging_path(&path)).unwrap();
        }

        // A crash after writing part of the staging file.
        fs::write(staging_path(&path), [0xAB; 100]).unwrap();

        let store = MmapReplayStore::open(&path, 4096).unwrap();
        assert!(!staging_path(&path).exists());
        assert_eq!(store.lookup(&completed, 300).unwrap(), Some(b"done".to_vec()));
        assert_eq!(store.claim(&pending, 300, 400).unwrap(), Claim::InFlight);
    }

    #[test]
    fn test_full_log_compacts_expired_records() {
        let dir = tempdir().unwrap();
        let store = MmapReplayStore::open(dir.path().join("replay.log"), 512).unwrap();
        let reply = [0xAB; 64];

        // Each record is well over 100 bytes; only a few fit at once.
        for i in 0..50u64 {
            let k = key("alice", &i.to_le_bytes());
            let now = i * 1_000;
            let Claim::Acquired(ticket) = store.claim(&k, now, now + 500).unwrap() else {
                panic!("fresh key must be claimable");
            };
            assert!(store.complete(&k, ticket, &reply, now + 500).unwrap());
        }
        assert!(store.used() <= 512);
        assert_eq!(store.lookup(&key("alice", &49u64.to_le_bytes()), 49_000).unwrap(), Some(reply.to_vec()));
    }

    #[test]
    fn test_full_when_live_records_exceed_capacity() {
        let dir = tempdir().unwrap();
        let store = MmapReplayStore::open(dir.path().join("replay.log"), 256).unwrap();
        let reply = [0u8; 100];
        store.store(&key("a", b"1"), &reply, u64::MAX).unwrap();
        assert!(matches!(
            store.store(&key("a", b"2"), &reply, u64::MAX),
            Err(StoreError::Full { capacity: 256 })
        ));
    }

    #[test]
    fn test_purge_expired() {
        let dir = tempdir().unwrap();
        let store = MmapReplayStore::open(dir.path().join("replay.log"), 4096).unwrap();
        store.store(&key("a", b"1"), b"x", 100).unwrap();
        store.store(&key("b", b"2"), b"y", 900).unwrap();

        assert_eq!(store.purge_expired(500).unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup(&key("b", b"2"), 500).unwrap(), Some(b"y".to_vec()));
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("not-a-log");
        std::fs::write(&path, vec![0xFFu8; 128]).unwrap();
        assert!(matches!(
            MmapReplayStore::open(&path, 4096),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replay.log");
        {
            let store = MmapReplayStore::open(&path, 4096).unwrap();
            store.store(&key("a", b"1"), b"ok", u64::MAX).unwrap();
        }
        // Claim more written bytes than any record covers.
        {
            let mut bytes = std::fs::read(&path).unwrap();
            let used = get_u64(&bytes, WRITE_POS_AT);
            put_u64(&mut bytes, WRITE_POS_AT, used + 10);
            std::fs::write(&path, bytes).unwrap();
        }
        let store = MmapReplayStore::open(&path, 4096).unwrap();
        assert_eq!(store.lookup(&key("a", b"1"), 0).unwrap(), Some(b"ok".to_vec()));
    }
}
