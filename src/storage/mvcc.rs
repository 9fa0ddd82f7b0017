//! Multi-version concurrency control.
//!
//! Each DN owns a chain of versions, newest first. Uncommitted versions carry
//! `commit_ts == 0`; commit flips them to the transaction's commit timestamp,
//! both in memory and inside the backing page slot. Readers hold a snapshot
//! and walk the chain applying the visibility rule; on a cache miss the last
//! committed version is materialized through the injected disk loader.

use std::collections::{HashMap, HashSet};
use std::convert::TryInto;

use parking_lot::{Mutex, RwLock};

use crate::error::{DirError, Result};
use crate::model::EntryRef;
use crate::pager::{IoState, Lsn, Page, PageId, PageIo, PageType};
use crate::storage::heap;

/// Record flag: the version is a tombstone.
pub const VERSION_FLAG_TOMBSTONE: u8 = 0x01;
const VERSION_META_LEN: usize = 1 + 8 + 8 + 2;

/// One version of an entry, linked into its DN's chain.
#[derive(Debug, Clone)]
pub struct Version {
    pub tx_id: u64,
    /// Commit timestamp; 0 while the owning transaction is uncommitted.
    pub commit_ts: u64,
    pub is_deleted: bool,
    /// Serialized entry bytes; `None` for tombstones.
    pub payload: Option<Vec<u8>>,
    pub page_id: PageId,
    pub slot_id: u16,
    /// Older-in-time link; never ownership of live data beyond GC purposes.
    pub prev: Option<Box<Version>>,
}

/// An immutable snapshot taken at transaction begin.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub ts: u64,
    pub active_tx_ids: HashSet<u64>,
    pub creator_tx_id: u64,
}

impl Snapshot {
    /// The central MVCC visibility rule: a version is visible iff it is the
    /// snapshot creator's own uncommitted write, or it committed at or before
    /// the snapshot timestamp by a transaction that was not active at begin.
    pub fn is_visible(&self, version: &Version) -> bool {
        if version.commit_ts == 0 {
            return version.tx_id == self.creator_tx_id;
        }
        version.commit_ts <= self.ts && !self.active_tx_ids.contains(&version.tx_id)
    }
}

/// On-page encoding of a version record, stored as one heap record:
/// `flags(u8) | tx_id(u64) | commit_ts(u64) | dn_len(u16) | dn | entry bytes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    pub tombstone: bool,
    pub tx_id: u64,
    pub commit_ts: u64,
    pub dn: String,
    pub entry_bytes: Vec<u8>,
}

impl VersionRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let dn = self.dn.as_bytes();
        let dn_len = u16::try_from(dn.len())
            .map_err(|_| DirError::InvalidArgument("DN exceeds u16::MAX bytes".into()))?;
        let mut buf = Vec::with_capacity(VERSION_META_LEN + dn.len() + self.entry_bytes.len());
        buf.push(if self.tombstone { VERSION_FLAG_TOMBSTONE } else { 0 });
        buf.extend_from_slice(&self.tx_id.to_le_bytes());
        buf.extend_from_slice(&self.commit_ts.to_le_bytes());
        buf.extend_from_slice(&dn_len.to_le_bytes());
        buf.extend_from_slice(dn);
        buf.extend_from_slice(&self.entry_bytes);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < VERSION_META_LEN {
            return Err(DirError::Corrupted("version record truncated".into()));
        }
        let flags = bytes[0];
        let tx_id = u64::from_le_bytes(bytes[1..9].try_into().expect("slice is 8 bytes"));
        let commit_ts = u64::from_le_bytes(bytes[9..17].try_into().expect("slice is 8 bytes"));
        let dn_len =
            u16::from_le_bytes(bytes[17..19].try_into().expect("slice is 2 bytes")) as usize;
        if bytes.len() < VERSION_META_LEN + dn_len {
            return Err(DirError::Corrupted("version record DN truncated".into()));
        }
        let dn = String::from_utf8(bytes[VERSION_META_LEN..VERSION_META_LEN + dn_len].to_vec())
            .map_err(|_| DirError::Corrupted("version record DN is not UTF-8".into()))?;
        Ok(Self {
            tombstone: flags & VERSION_FLAG_TOMBSTONE != 0,
            tx_id,
            commit_ts,
            dn,
            entry_bytes: bytes[VERSION_META_LEN + dn_len..].to_vec(),
        })
    }
}

/// Resolves a DN to its last committed version on disk. Injected by the
/// storage engine; runs with the caller's I/O lock already held.
pub type DiskLoader = Box<dyn Fn(&mut IoState, &str) -> Result<Option<Version>> + Send + Sync>;

/// The version store: in-memory chains for hot DNs plus the disk loader.
pub struct VersionStore {
    chains: RwLock<HashMap<String, Version>>,
    loader: RwLock<Option<DiskLoader>>,
    fill_page: Mutex<PageId>,
}

impl std::fmt::Debug for VersionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionStore")
            .field("chains", &self.chains.read().len())
            .finish_non_exhaustive()
    }
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionStore {
    pub fn new() -> Self {
        Self {
            chains: RwLock::new(HashMap::new()),
            loader: RwLock::new(None),
            fill_page: Mutex::new(0),
        }
    }

    /// Injects the read-through loader (radix lookup + page read).
    pub fn set_disk_loader(&self, loader: DiskLoader) {
        *self.loader.write() = Some(loader);
    }

    /// Creates a new uncommitted version at the head of `dn`'s chain and
    /// persists its record into a data page (WAL-logged).
    pub fn create_version(
        &self,
        io: &mut IoState,
        tx_id: u64,
        dn: &str,
        entry_bytes: &[u8],
    ) -> Result<EntryRef> {
        self.install_version(io, tx_id, dn, Some(entry_bytes))
    }

    /// Links an uncommitted tombstone at the head of `dn`'s chain.
    pub fn delete_version(&self, io: &mut IoState, tx_id: u64, dn: &str) -> Result<EntryRef> {
        self.install_version(io, tx_id, dn, None)
    }

    fn install_version(
        &self,
        io: &mut IoState,
        tx_id: u64,
        dn: &str,
        entry_bytes: Option<&[u8]>,
    ) -> Result<EntryRef> {
        let prev = match self.take_head(dn) {
            Some(head) => Some(head),
            None => self.load_committed(io, dn)?,
        };
        let prev = match prev {
            Some(head) if head.commit_ts == 0 => {
                if head.tx_id != tx_id {
                    // Writers are serialized; a foreign uncommitted head means
                    // the chain was corrupted.
                    self.chains.write().insert(dn.to_string(), head);
                    return Err(DirError::Corrupted(format!(
                        "DN {dn} already has an uncommitted version"
                    )));
                }
                // Same transaction overwrote its own pending version; the old
                // record stays dead in its page until compaction.
                head.prev.map(|boxed| *boxed)
            }
            other => other,
        };

        let record = VersionRecord {
            tombstone: entry_bytes.is_none(),
            tx_id,
            commit_ts: 0,
            dn: dn.to_string(),
            entry_bytes: entry_bytes.unwrap_or_default().to_vec(),
        };
        let bytes = record.encode()?;
        let (page_id, slot_id) = self.place_record(io, tx_id, &bytes)?;

        let version = Version {
            tx_id,
            commit_ts: 0,
            is_deleted: record.tombstone,
            payload: entry_bytes.map(|b| b.to_vec()),
            page_id,
            slot_id,
            prev: prev.map(Box::new),
        };
        self.chains.write().insert(dn.to_string(), version);
        Ok(EntryRef::new(page_id, slot_id))
    }

    /// Stamps `commit_ts` into the page record of every uncommitted version
    /// created by `tx_id` on the listed DNs (WAL-logged). The in-memory
    /// chains are left untouched so readers cannot observe the commit before
    /// its WAL record is durable; call [`publish_versions`] after the sync.
    pub fn stamp_versions(
        &self,
        io: &mut IoState,
        tx_id: u64,
        commit_ts: u64,
        touched_dns: &[String],
    ) -> Result<()> {
        for dn in touched_dns {
            let (page_id, slot_id) = {
                let chains = self.chains.read();
                let head = chains.get(dn).ok_or_else(|| {
                    DirError::Corrupted(format!("commit of {dn} found no version chain"))
                })?;
                if head.commit_ts != 0 || head.tx_id != tx_id {
                    return Err(DirError::Corrupted(format!(
                        "commit of {dn} found a foreign chain head"
                    )));
                }
                (head.page_id, head.slot_id)
            };
            self.stamp_commit_ts(io, tx_id, page_id, slot_id, commit_ts)?;
        }
        Ok(())
    }

    /// Flips the in-memory chain heads created by `tx_id` to `commit_ts`,
    /// making the versions visible to qualifying snapshots. Runs only after
    /// the commit record has been fsynced.
    pub fn publish_versions(&self, tx_id: u64, commit_ts: u64, touched_dns: &[String]) {
        let mut chains = self.chains.write();
        for dn in touched_dns {
            if let Some(head) = chains.get_mut(dn) {
                if head.commit_ts == 0 && head.tx_id == tx_id {
                    head.commit_ts = commit_ts;
                }
            }
        }
    }

    /// Convenience for callers without a separate durability point.
    pub fn commit_versions(
        &self,
        io: &mut IoState,
        tx_id: u64,
        commit_ts: u64,
        touched_dns: &[String],
    ) -> Result<()> {
        self.stamp_versions(io, tx_id, commit_ts, touched_dns)?;
        io.sync_wal()?;
        self.publish_versions(tx_id, commit_ts, touched_dns);
        Ok(())
    }

    /// Unlinks the uncommitted versions created by `tx_id`. Page bytes are
    /// restored separately through the transaction's undo images.
    pub fn rollback_versions(&self, tx_id: u64, touched_dns: &[String]) {
        let mut chains = self.chains.write();
        for dn in touched_dns {
            if let Some(head) = chains.remove(dn) {
                if head.commit_ts == 0 && head.tx_id == tx_id {
                    if let Some(prev) = head.prev {
                        chains.insert(dn.clone(), *prev);
                    }
                } else {
                    chains.insert(dn.clone(), head);
                }
            }
        }
    }

    /// Snapshot-correct read. Walks the in-memory chain first; on a miss,
    /// materializes the last committed version through the disk loader (the
    /// caller holds the I/O lock). See [`Snapshot::is_visible`].
    pub fn get_visible_for_tx(
        &self,
        io: &mut IoState,
        dn: &str,
        snapshot: &Snapshot,
    ) -> Result<Version> {
        if let Some(outcome) = self.walk_cached(dn, snapshot) {
            return outcome;
        }
        match self.load_committed(io, dn)? {
            Some(loaded) => {
                let mut chains = self.chains.write();
                chains.entry(dn.to_string()).or_insert(loaded);
            }
            None => return Err(DirError::NotFound("entry")),
        }
        self.walk_cached(dn, snapshot)
            .unwrap_or(Err(DirError::NotFound("entry")))
    }

    /// In-memory-only variant of [`get_visible_for_tx`]; `None` means the DN
    /// has no cached chain.
    pub fn walk_cached(&self, dn: &str, snapshot: &Snapshot) -> Option<Result<Version>> {
        let chains = self.chains.read();
        let mut cursor = chains.get(dn)?;
        loop {
            if snapshot.is_visible(cursor) {
                if cursor.is_deleted {
                    return Some(Err(DirError::VersionDeleted));
                }
                let mut visible = cursor.clone();
                visible.prev = None;
                return Some(Ok(visible));
            }
            match cursor.prev.as_deref() {
                Some(prev) => cursor = prev,
                None => return Some(Err(DirError::NoVisibleVersion)),
            }
        }
    }

    /// Installs a committed head if the DN has no cached chain (recovery and
    /// compaction rebuilds).
    pub fn insert_committed(&self, dn: &str, version: Version) {
        let mut chains = self.chains.write();
        chains.entry(dn.to_string()).or_insert(version);
    }

    /// Prunes chain tails no snapshot at or after `oldest_ts` can observe.
    /// Returns the DNs whose chains became fully dead (committed tombstone
    /// heads older than `oldest_ts`).
    pub fn prune(&self, oldest_ts: u64) -> Vec<String> {
        let mut dead = Vec::new();
        let mut chains = self.chains.write();
        for (dn, head) in chains.iter_mut() {
            trim_chain(head, oldest_ts);
            if head_is_dead(head, oldest_ts) {
                dead.push(dn.clone());
            }
        }
        for dn in &dead {
            chains.remove(dn);
        }
        dead
    }

    /// Drops every cached chain (compaction rebuild).
    pub fn clear(&self) {
        self.chains.write().clear();
        *self.fill_page.lock() = 0;
    }

    pub fn cached_chain_count(&self) -> usize {
        self.chains.read().len()
    }

    fn take_head(&self, dn: &str) -> Option<Version> {
        self.chains.write().remove(dn)
    }

    fn load_committed(&self, io: &mut IoState, dn: &str) -> Result<Option<Version>> {
        let loader = self.loader.read();
        match loader.as_ref() {
            Some(load) => load(io, dn),
            None => Ok(None),
        }
    }

    fn place_record(&self, io: &mut IoState, tx_id: u64, bytes: &[u8]) -> Result<(PageId, u16)> {
        let mut fill = self.fill_page.lock();
        if *fill != 0 {
            let mut page = io.read_page(*fill)?;
            if heap::has_room(&page.payload, bytes.len()) {
                let slot = append_logged(io, &mut page, tx_id, bytes)?;
                return Ok((page.id, slot));
            }
        }
        let page_id = io.allocate_page(PageType::Data)?;
        let mut page = io.read_page(page_id)?;
        if !heap::has_room(&page.payload, bytes.len()) {
            return Err(DirError::InvalidArgument(format!(
                "version record of {} bytes exceeds page capacity",
                bytes.len()
            )));
        }
        let slot = append_logged(io, &mut page, tx_id, bytes)?;
        *fill = page_id;
        Ok((page_id, slot))
    }

    fn stamp_commit_ts(
        &self,
        io: &mut IoState,
        tx_id: u64,
        page_id: PageId,
        slot_id: u16,
        commit_ts: u64,
    ) -> Result<()> {
        let mut page = io.read_page(page_id)?;
        let range = heap::record_range(&page.payload, slot_id)?;
        // commit_ts sits after the flags byte and tx id inside the record.
        let ts_start = range.start + 9;
        let ts_end = ts_start + 8;
        if ts_end > range.end {
            return Err(DirError::Corrupted("version record too short to stamp".into()));
        }
        let before = page.payload[ts_start..ts_end].to_vec();
        page.payload[ts_start..ts_end].copy_from_slice(&commit_ts.to_le_bytes());
        let after = page.payload[ts_start..ts_end].to_vec();
        let lsn = io.log_page_update(tx_id, page_id, ts_start as u16, &before, &after)?;
        page.lsn = lsn;
        io.write_page(page)?;
        Ok(())
    }
}

fn head_is_dead(head: &Version, oldest_ts: u64) -> bool {
    head.is_deleted && head.commit_ts != 0 && head.commit_ts <= oldest_ts
}

/// The first committed version at or below `oldest_ts` shadows everything
/// behind it for every live and future snapshot.
fn trim_chain(version: &mut Version, oldest_ts: u64) {
    if version.commit_ts != 0 && version.commit_ts <= oldest_ts {
        version.prev = None;
        return;
    }
    if let Some(prev) = version.prev.as_deref_mut() {
        trim_chain(prev, oldest_ts);
    }
}

/// Logs one page-update record covering the differing span of two payload
/// images of the same page.
fn log_payload_update(
    io: &mut IoState,
    tx_id: u64,
    page_id: PageId,
    before: &[u8],
    after: &[u8],
) -> Result<Lsn> {
    debug_assert_eq!(before.len(), after.len());
    let first = before
        .iter()
        .zip(after.iter())
        .position(|(a, b)| a != b)
        .unwrap_or(0);
    let last = before
        .iter()
        .zip(after.iter())
        .rposition(|(a, b)| a != b)
        .map(|i| i + 1)
        .unwrap_or(before.len());
    let span = first..last.max(first);
    if span.len() > u16::MAX as usize || first > u16::MAX as usize {
        return Err(DirError::InvalidArgument(
            "page update span exceeds WAL image limits".into(),
        ));
    }
    io.log_page_update(tx_id, page_id, first as u16, &before[span.clone()], &after[span])
}

/// Appends a heap record to `page` with WAL before/after images covering the
/// record area and the slot directory entry, then writes the page back.
fn append_logged(io: &mut IoState, page: &mut Page, tx_id: u64, bytes: &[u8]) -> Result<u16> {
    let before_payload = page.payload.clone();
    let slot = heap::append_record(page, bytes)?
        .ok_or_else(|| DirError::Corrupted("heap append failed despite room check".into()))?;
    let lsn = log_payload_update(io, tx_id, page.id, &before_payload, &page.payload)?;
    page.lsn = lsn;
    io.write_page(page.clone())?;
    Ok(slot)
}
