//! The storage engine facade.
//!
//! [`DirectoryDB`] wires the page manager, WAL, buffer pool, MVCC store, DN
//! radix tree, attribute indexes, transaction manager, and checkpointing into
//! entry CRUD plus scoped and filtered search. Writers serialize on a single
//! writer lock from their first mutating call; readers run concurrently
//! against MVCC snapshots.
//!
//! Crash recovery on open replays the WAL (redo committed after-images, undo
//! uncommitted before-images) and, when anything was replayed, rebuilds the
//! DN index and attribute indexes from the live data pages.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{error, info, warn};

use crate::db::checkpoint::CheckpointManager;
use crate::db::config::Config;
use crate::db::gc::{run_gc, GcStats};
use crate::db::transaction::{Transaction, TxManager, TxState};
use crate::error::{DirError, Result};
use crate::index::manager::{IndexKind, IndexManager};
use crate::index::radix::{RadixCursor, RadixTree};
use crate::model::{
    deserialize_entry, normalize_dn, serialize_entry, Entry, EntryRef, FilterMatcher, Scope,
};
use crate::pager::{
    BufferPool, IoState, Lsn, Page, PageId, PageIo, PageManager, PagerOptions, PagerStats,
    PageType, Wal, WalRecord, WalRecordKind,
};
use crate::storage::heap;
use crate::storage::mvcc::{Version, VersionRecord, VersionStore};

const DATA_FILE_NAME: &str = "directory.oba";
/// Writer-lock owner id for maintenance operations (compaction, rotation).
const MAINTENANCE_WRITER: u64 = u64::MAX;

/// Engine-wide counters returned by [`DirectoryDB::stats`].
#[derive(Debug, Clone)]
pub struct DbStats {
    pub pager: PagerStats,
    pub wal_bytes: u64,
    pub buffer_pool_pages: usize,
    pub active_transactions: usize,
    pub entries: usize,
    pub cached_version_chains: usize,
    pub last_checkpoint_lsn: Lsn,
}

/// Result of an integrity sweep.
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    pub pages_checked: u64,
    pub checksum_failures: Vec<PageId>,
    pub index_errors: Vec<String>,
    pub entries: usize,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.checksum_failures.is_empty() && self.index_errors.is_empty()
    }
}

struct WriterLock {
    owner: Mutex<u64>,
    released: Condvar,
}

impl WriterLock {
    fn new() -> Self {
        Self {
            owner: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    /// Blocks until the writer slot is free (or already ours). Re-entrant
    /// per owner so a transaction's later writes do not self-deadlock.
    fn acquire(&self, owner_id: u64) {
        let mut owner = self.owner.lock();
        while *owner != 0 && *owner != owner_id {
            self.released.wait(&mut owner);
        }
        *owner = owner_id;
    }

    fn release(&self, owner_id: u64) {
        let mut owner = self.owner.lock();
        if *owner == owner_id {
            *owner = 0;
            self.released.notify_one();
        }
    }
}

pub(crate) struct DbInner {
    config: Config,
    data_path: PathBuf,
    io: Mutex<IoState>,
    mvcc: VersionStore,
    radix: RwLock<RadixTree>,
    indexes: RwLock<IndexManager>,
    txm: TxManager,
    ckpt: CheckpointManager,
    writer: WriterLock,
    closed: AtomicBool,
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// The embedded directory store.
pub struct DirectoryDB {
    inner: Arc<DbInner>,
}

#[derive(Debug, Default)]
struct RecoveryOutcome {
    replayed: bool,
    max_commit_ts: u64,
    max_tx_id: u64,
}

impl DirectoryDB {
    /// Opens (or creates) the store under `config.data_dir`, running WAL
    /// recovery first when the previous process died uncleanly.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let cipher = config.build_cipher()?;
        if !config.read_only {
            fs::create_dir_all(&config.data_dir)?;
        }
        let data_path = config.data_dir.join(DATA_FILE_NAME);
        let pager = PageManager::open(
            &data_path,
            PagerOptions {
                page_size: config.page_size,
                initial_pages: config.initial_pages,
                create_if_missing: !config.read_only,
                read_only: config.read_only,
                sync_on_write: config.sync_on_write,
            },
            cipher.clone(),
        )?;
        let wal = Wal::open(&data_path, config.read_only, cipher)?;
        let pool = BufferPool::new(config.buffer_pool_bytes, pager.page_size())?;
        let mut io = IoState::new(pager, pool, wal);

        let header = io.pager.header().clone();
        io.wal.ensure_lsn_at_least(header.last_lsn);

        let recovery = if config.read_only {
            RecoveryOutcome::default()
        } else {
            recover(&mut io)?
        };

        let needs_rebuild = recovery.replayed
            || (header.dn_index_root == 0 && io.pager.header().total_pages > 1);
        let (radix, indexes, scan_max_ts, scan_max_tx) = if needs_rebuild {
            rebuild_from_pages(
                &mut io,
                header.dn_index_root,
                header.index_catalog_root,
                config.read_only,
            )?
        } else {
            (
                RadixTree::load(&mut io, header.dn_index_root)?,
                IndexManager::load(&mut io, header.index_catalog_root)?,
                0,
                0,
            )
        };

        let next_ts = header
            .next_ts
            .max(recovery.max_commit_ts + 1)
            .max(scan_max_ts + 1);
        let next_tx_id = header
            .next_tx_id
            .max(recovery.max_tx_id + 1)
            .max(scan_max_tx + 1);

        let inner = Arc::new(DbInner {
            data_path,
            io: Mutex::new(io),
            mvcc: VersionStore::new(),
            radix: RwLock::new(radix),
            indexes: RwLock::new(indexes),
            txm: TxManager::new(next_tx_id, next_ts),
            ckpt: CheckpointManager::new(0),
            writer: WriterLock::new(),
            closed: AtomicBool::new(false),
            shutdown: Arc::new((Mutex::new(false), Condvar::new())),
            workers: Mutex::new(Vec::new()),
            config,
        });

        let weak = Arc::downgrade(&inner);
        inner.mvcc.set_disk_loader(Box::new(move |io, dn| {
            let inner = weak.upgrade().ok_or(DirError::Closed)?;
            load_committed_version(&inner, io, dn)
        }));

        if needs_rebuild && !inner.config.read_only {
            checkpoint_impl(&inner)?;
            info!("recovery checkpoint complete");
        }
        if !inner.config.read_only {
            spawn_workers(&inner);
        }
        Ok(Self { inner })
    }

    /// Begins a transaction with a fresh snapshot.
    pub fn begin(&self) -> Result<Transaction> {
        self.ensure_open()?;
        if self.inner.config.read_only {
            return Ok(self.inner.txm.begin_readonly());
        }
        let mut io = self.inner.io.lock();
        self.inner.txm.begin(&mut io)
    }

    /// Writes (inserts or replaces) an entry.
    pub fn put(&self, tx: &mut Transaction, entry: &Entry) -> Result<()> {
        self.ensure_open()?;
        tx.ensure_active()?;
        self.ensure_writable()?;
        match self.put_inner(tx, entry) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.abort_after_error(tx);
                Err(err)
            }
        }
    }

    fn put_inner(&self, tx: &mut Transaction, entry: &Entry) -> Result<()> {
        let normalized = normalized_entry(entry);
        let dn = normalized.dn.clone();
        let bytes = serialize_entry(&normalized)?;

        self.inner.writer.acquire(tx.id());
        tx.holds_writer = true;
        let mut io = self.inner.io.lock();

        let old = self.visible_or_none(&mut io, &dn, tx)?;
        let entry_ref = self
            .inner
            .mvcc
            .create_version(&mut io, tx.id(), &dn, &bytes)?;
        tx.undo.extend(io.take_undo());
        tx.last_lsn = io.wal.current_lsn();

        let known = self.inner.radix.read().lookup(&dn).is_some();
        if known {
            tx.stage_radix_update(&dn, entry_ref);
        } else {
            tx.stage_radix_insert(&dn, entry_ref);
        }

        let old_pair = match &old {
            Some(version) => match &version.payload {
                Some(payload) => Some((
                    deserialize_entry(payload)?,
                    EntryRef::new(version.page_id, version.slot_id),
                )),
                None => None,
            },
            None => None,
        };
        let ops = {
            let indexes = self.inner.indexes.read();
            indexes.plan_change(
                old_pair.as_ref().map(|(e, r)| (e, *r)),
                Some((&normalized, entry_ref)),
            )
        };
        tx.staged_index_ops.extend(ops);
        tx.touch(&dn);
        Ok(())
    }

    /// Reads the entry visible to the transaction's snapshot.
    pub fn get(&self, tx: &Transaction, dn: &str) -> Result<Entry> {
        self.ensure_open()?;
        tx.ensure_active()?;
        let dn = normalize_dn(dn);
        let outcome = match self.inner.mvcc.walk_cached(&dn, tx.snapshot()) {
            Some(outcome) => outcome,
            None => {
                let mut io = self.inner.io.lock();
                self.inner
                    .mvcc
                    .get_visible_for_tx(&mut io, &dn, tx.snapshot())
            }
        };
        match outcome {
            Ok(version) => {
                let payload = version.payload.ok_or(DirError::NotFound("entry"))?;
                deserialize_entry(&payload)
            }
            Err(
                DirError::NotFound(_) | DirError::VersionDeleted | DirError::NoVisibleVersion,
            ) => Err(DirError::NotFound("entry")),
            Err(err) => Err(err),
        }
    }

    /// Deletes an entry by appending a tombstone version.
    pub fn delete(&self, tx: &mut Transaction, dn: &str) -> Result<()> {
        self.ensure_open()?;
        tx.ensure_active()?;
        self.ensure_writable()?;
        match self.delete_inner(tx, dn) {
            Ok(()) => Ok(()),
            Err(err @ DirError::NotFound(_)) => Err(err),
            Err(err) => {
                self.abort_after_error(tx);
                Err(err)
            }
        }
    }

    fn delete_inner(&self, tx: &mut Transaction, dn: &str) -> Result<()> {
        let dn = normalize_dn(dn);
        self.inner.writer.acquire(tx.id());
        tx.holds_writer = true;
        let mut io = self.inner.io.lock();

        let old = self
            .visible_or_none(&mut io, &dn, tx)?
            .ok_or(DirError::NotFound("entry"))?;
        let old_payload = old.payload.as_ref().ok_or(DirError::NotFound("entry"))?;
        let old_entry = deserialize_entry(old_payload)?;
        let old_ref = EntryRef::new(old.page_id, old.slot_id);

        let tomb_ref = self.inner.mvcc.delete_version(&mut io, tx.id(), &dn)?;
        tx.undo.extend(io.take_undo());
        tx.last_lsn = io.wal.current_lsn();
        // Point the DN index at the tombstone so evicted chains still
        // materialize the deletion.
        tx.stage_radix_update(&dn, tomb_ref);

        let ops = {
            let indexes = self.inner.indexes.read();
            indexes.plan_change(Some((&old_entry, old_ref)), None)
        };
        tx.staged_index_ops.extend(ops);
        tx.touch(&dn);
        Ok(())
    }

    /// True when any stored DN is a direct or indirect child of `dn`.
    pub fn has_children(&self, tx: &Transaction, dn: &str) -> Result<bool> {
        self.ensure_open()?;
        tx.ensure_active()?;
        Ok(self.inner.radix.read().has_children(&normalize_dn(dn)))
    }

    /// Scoped search: lazily yields entries under `base` visible to the
    /// transaction's snapshot, in hierarchical DN order.
    pub fn search_by_dn(&self, tx: &Transaction, base: &str, scope: Scope) -> Result<SearchIter> {
        self.ensure_open()?;
        tx.ensure_active()?;
        let base = normalize_dn(base);
        let cursor = self.inner.radix.read().iterate(&base, scope);
        Ok(SearchIter {
            inner: Arc::clone(&self.inner),
            snapshot: tx.snapshot().clone(),
            cursor,
            matcher: None,
        })
    }

    /// Subtree search combined with a caller-supplied filter matcher.
    pub fn search_by_filter<M>(
        &self,
        tx: &Transaction,
        base: &str,
        matcher: M,
    ) -> Result<SearchIter>
    where
        M: FilterMatcher + Send + 'static,
    {
        let mut iter = self.search_by_dn(tx, base, Scope::Subtree)?;
        iter.matcher = Some(Box::new(matcher));
        Ok(iter)
    }

    /// Candidate entries from an attribute index. Equality patterns match
    /// exactly; substring patterns use `*` wildcards and may return false
    /// positives for the caller to verify.
    pub fn index_candidates(
        &self,
        tx: &Transaction,
        attribute: &str,
        kind: IndexKind,
        pattern: &[u8],
    ) -> Result<Vec<Entry>> {
        self.ensure_open()?;
        tx.ensure_active()?;
        let mut io = self.inner.io.lock();
        let refs = {
            let indexes = self.inner.indexes.read();
            match kind {
                IndexKind::Equality => indexes.search_equality(&mut *io, attribute, pattern)?,
                IndexKind::Presence => indexes.search_presence(&mut *io, attribute)?,
                IndexKind::Substring => indexes.search_substring(&mut *io, attribute, pattern)?,
            }
        };
        let mut seen = std::collections::HashSet::new();
        let mut entries = Vec::new();
        for entry_ref in refs {
            let page = io.read_page(entry_ref.page_id)?;
            let record = VersionRecord::decode(heap::read_record(&page.payload, entry_ref.slot_id)?)?;
            if !seen.insert(record.dn.clone()) {
                continue;
            }
            let outcome = match self.inner.mvcc.walk_cached(&record.dn, tx.snapshot()) {
                Some(outcome) => outcome,
                None => self
                    .inner
                    .mvcc
                    .get_visible_for_tx(&mut io, &record.dn, tx.snapshot()),
            };
            if let Ok(version) = outcome {
                if let Some(payload) = version.payload {
                    entries.push(deserialize_entry(&payload)?);
                }
            }
        }
        Ok(entries)
    }

    /// Commits: stamps commit timestamps into page records, fsyncs the
    /// commit record, then publishes versions, DN-index inserts, and
    /// attribute-index changes to readers.
    pub fn commit(&self, tx: &mut Transaction) -> Result<()> {
        self.ensure_open()?;
        tx.ensure_active()?;
        match self.commit_inner(tx) {
            Ok(()) => {
                tx.set_state(TxState::Committed);
                self.finish_tx(tx);
                Ok(())
            }
            Err(err) => {
                let _ = self.rollback_inner(tx);
                tx.set_state(TxState::Aborted);
                self.finish_tx(tx);
                Err(err)
            }
        }
    }

    fn commit_inner(&self, tx: &mut Transaction) -> Result<()> {
        if self.inner.config.read_only {
            return Ok(());
        }
        let mut io = self.inner.io.lock();
        let commit_ts = self.inner.txm.allocate_commit_ts();
        if !tx.has_writes() {
            io.append_wal(&WalRecord::commit(tx.id(), commit_ts))?;
            return Ok(());
        }

        self.inner
            .mvcc
            .stamp_versions(&mut io, tx.id(), commit_ts, &tx.touched_dns)?;
        io.append_wal(&WalRecord::commit(tx.id(), commit_ts))?;
        io.sync_wal()?;
        // Durability point passed: everything below must not unwind the
        // commit, so failures are logged rather than propagated.
        self.inner
            .mvcc
            .publish_versions(tx.id(), commit_ts, &tx.touched_dns);
        {
            let mut radix = self.inner.radix.write();
            for (dn, entry_ref) in &tx.staged_radix_inserts {
                let outcome = match radix.insert(dn, *entry_ref) {
                    Err(DirError::AlreadyExists(_)) => radix.update(dn, *entry_ref),
                    other => other,
                };
                if let Err(err) = outcome {
                    error!(%dn, %err, "failed to publish DN-index insert");
                }
            }
            for (dn, entry_ref) in &tx.staged_radix_updates {
                let outcome = match radix.update(dn, *entry_ref) {
                    Err(DirError::NotFound(_)) => radix.insert(dn, *entry_ref),
                    other => other,
                };
                if let Err(err) = outcome {
                    error!(%dn, %err, "failed to publish DN-index update");
                }
            }
        }
        {
            let mut indexes = self.inner.indexes.write();
            if let Err(err) = indexes.apply_ops(&mut *io, &tx.staged_index_ops) {
                error!(%err, "failed to apply attribute-index changes at commit");
            }
        }
        io.take_undo();
        Ok(())
    }

    /// Rolls back: appends the abort record, restores before-images in
    /// reverse order, and unlinks the transaction's versions.
    pub fn rollback(&self, tx: &mut Transaction) -> Result<()> {
        self.ensure_open()?;
        tx.ensure_active()?;
        let result = self.rollback_inner(tx);
        tx.set_state(TxState::Aborted);
        self.finish_tx(tx);
        result
    }

    fn rollback_inner(&self, tx: &mut Transaction) -> Result<()> {
        if self.inner.config.read_only {
            return Ok(());
        }
        let mut io = self.inner.io.lock();
        io.append_wal(&WalRecord::abort(tx.id()))?;
        for undo in tx.undo.iter().rev() {
            let mut page = io.read_page(undo.page_id)?;
            let start = undo.offset as usize;
            let end = start + undo.before.len();
            if end > page.payload.len() {
                return Err(DirError::Corrupted(
                    "undo image exceeds page payload".into(),
                ));
            }
            page.payload[start..end].copy_from_slice(&undo.before);
            io.write_page(page)?;
        }
        io.take_undo();
        self.inner.mvcc.rollback_versions(tx.id(), &tx.touched_dns);
        Ok(())
    }

    fn abort_after_error(&self, tx: &mut Transaction) {
        if let Err(err) = self.rollback_inner(tx) {
            warn!(%err, tx_id = tx.id(), "rollback after failed operation");
        }
        tx.set_state(TxState::Aborted);
        self.finish_tx(tx);
    }

    fn finish_tx(&self, tx: &mut Transaction) {
        self.inner.txm.finish(tx.id());
        if tx.holds_writer {
            self.inner.writer.release(tx.id());
            tx.holds_writer = false;
        }
    }

    /// Creates an attribute index and backfills it from the latest committed
    /// entries.
    pub fn create_index(&self, attribute: &str, kind: IndexKind) -> Result<()> {
        self.ensure_open()?;
        self.ensure_writable()?;
        self.inner.writer.acquire(MAINTENANCE_WRITER);
        let result = self.create_index_inner(attribute, kind);
        self.inner.writer.release(MAINTENANCE_WRITER);
        result
    }

    fn create_index_inner(&self, attribute: &str, kind: IndexKind) -> Result<()> {
        let mut io = self.inner.io.lock();
        let mut indexes = self.inner.indexes.write();
        indexes.create_index(&mut *io, attribute, kind)?;
        let pairs = self.inner.radix.read().collect_all()?;
        for (_, entry_ref) in pairs {
            let page = io.read_page(entry_ref.page_id)?;
            let record = VersionRecord::decode(heap::read_record(&page.payload, entry_ref.slot_id)?)?;
            if record.tombstone || record.commit_ts == 0 {
                continue;
            }
            let entry = deserialize_entry(&record.entry_bytes)?;
            indexes.add_entry_keys(&mut *io, attribute, kind, &entry, entry_ref)?;
        }
        Ok(())
    }

    /// Drops an attribute index and frees its pages.
    pub fn drop_index(&self, attribute: &str, kind: IndexKind) -> Result<()> {
        self.ensure_open()?;
        self.ensure_writable()?;
        self.inner.writer.acquire(MAINTENANCE_WRITER);
        let result = {
            let mut io = self.inner.io.lock();
            let mut indexes = self.inner.indexes.write();
            indexes.drop_index(&mut *io, attribute, kind)
        };
        self.inner.writer.release(MAINTENANCE_WRITER);
        result
    }

    /// Runs a full checkpoint and truncates the WAL prefix.
    pub fn checkpoint(&self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_writable()?;
        checkpoint_impl(&self.inner)
    }

    /// One garbage-collection pass over the version chains.
    pub fn gc(&self) -> Result<GcStats> {
        self.ensure_open()?;
        Ok(run_gc(&self.inner.mvcc, &self.inner.txm, &self.inner.radix))
    }

    /// Rewrites the store into a fresh file keeping only the latest committed
    /// versions, then atomically swaps it in. Returns reclaimed pages.
    pub fn compact(&self) -> Result<u64> {
        self.rewrite_store(None)
    }

    /// Re-encrypts every page and WAL record under a new 32-byte key.
    pub fn rotate_encryption_key(&self, new_key: &[u8]) -> Result<()> {
        let cipher = Some(Arc::new(crate::crypto::PageCipher::new(new_key)?));
        self.rewrite_store(Some(cipher)).map(|_| ())
    }

    fn rewrite_store(
        &self,
        new_cipher: Option<Option<Arc<crate::crypto::PageCipher>>>,
    ) -> Result<u64> {
        self.ensure_open()?;
        self.ensure_writable()?;
        self.inner.writer.acquire(MAINTENANCE_WRITER);
        let result = self.rewrite_store_inner(new_cipher);
        self.inner.writer.release(MAINTENANCE_WRITER);
        result
    }

    fn rewrite_store_inner(
        &self,
        new_cipher: Option<Option<Arc<crate::crypto::PageCipher>>>,
    ) -> Result<u64> {
        if self.inner.txm.active_count() > 0 {
            return Err(DirError::InvalidArgument(
                "store rewrite requires no active transactions".into(),
            ));
        }
        let mut io = self.inner.io.lock();
        let mut radix = self.inner.radix.write();
        let mut indexes = self.inner.indexes.write();

        // Settle the current state on disk and drain the WAL: after this the
        // data file alone is authoritative, so a crash on either side of the
        // rename below lands on a consistent store.
        self.inner.ckpt.checkpoint(
            &mut io,
            &mut radix,
            &mut indexes,
            &[],
            self.inner.txm.counters(),
        )?;
        self.inner.ckpt.truncate_wal(&mut io, None)?;

        let mut live = Vec::new();
        for (dn, entry_ref) in radix.collect_all()? {
            let page = io.read_page(entry_ref.page_id)?;
            let record = VersionRecord::decode(heap::read_record(&page.payload, entry_ref.slot_id)?)?;
            if record.commit_ts == 0 || record.tombstone {
                continue;
            }
            live.push((dn, record));
        }

        let cipher = match &new_cipher {
            Some(cipher) => cipher.clone(),
            None => io.pager.cipher().cloned(),
        };
        let compact_path = self.inner.data_path.with_extension("oba.rewrite");
        let _ = fs::remove_file(&compact_path);
        let opts = PagerOptions {
            page_size: self.inner.config.page_size,
            initial_pages: 0,
            create_if_missing: true,
            read_only: false,
            sync_on_write: false,
        };
        let mut new_pager = PageManager::open(&compact_path, opts.clone(), cipher.clone())?;
        let mut new_radix = RadixTree::new();
        let mut new_indexes = IndexManager::new();
        for (attribute, kind) in indexes.list() {
            new_indexes.create_index(&mut new_pager, &attribute, kind)?;
        }

        let mut fill: Option<Page> = None;
        for (dn, record) in &live {
            let bytes = record.encode()?;
            let (page_id, slot) = append_to_heap(&mut new_pager, &mut fill, &bytes)?;
            let entry_ref = EntryRef::new(page_id, slot);
            new_radix.insert(dn, entry_ref)?;
            let entry = deserialize_entry(&record.entry_bytes)?;
            let ops = new_indexes.plan_change(None, Some((&entry, entry_ref)));
            new_indexes.apply_ops(&mut new_pager, &ops)?;
        }
        if let Some(page) = fill.take() {
            new_pager.write(&page)?;
        }

        let dn_root = new_radix.persist(&mut new_pager)?;
        let catalog_root = new_indexes.persist(&mut new_pager)?;
        let mut header = new_pager.header().clone();
        header.dn_index_root = dn_root;
        header.index_catalog_root = catalog_root;
        let (next_tx_id, next_ts) = self.inner.txm.counters();
        header.next_tx_id = next_tx_id;
        header.next_ts = next_ts;
        header.last_lsn = io.wal.current_lsn();
        new_pager.update_header(header)?;
        new_pager.sync()?;
        drop(new_pager);

        let old_total = io.pager.header().total_pages;
        fs::rename(&compact_path, &self.inner.data_path)?;
        let reopened = PageManager::open(&self.inner.data_path, opts, cipher.clone())?;
        let new_total = reopened.header().total_pages;
        let last_lsn = io.wal.current_lsn();
        io.pager = reopened;
        io.pool.clear();
        // The drained WAL referenced the old page layout; reopen it fresh
        // (and under the new cipher when rotating).
        io.wal.truncate(last_lsn)?;
        io.wal = Wal::open(&self.inner.data_path, false, cipher)?;
        io.wal.ensure_lsn_at_least(last_lsn);
        self.inner.mvcc.clear();
        *radix = new_radix;
        *indexes = new_indexes;
        info!(old_total, new_total, "store rewrite complete");
        Ok(old_total.saturating_sub(new_total))
    }

    /// Engine-wide counters.
    pub fn stats(&self) -> Result<DbStats> {
        self.ensure_open()?;
        let mut io = self.inner.io.lock();
        Ok(DbStats {
            pager: io.pager.stats()?,
            wal_bytes: io.wal.size()?,
            buffer_pool_pages: io.pool.len(),
            active_transactions: self.inner.txm.active_count(),
            entries: self.inner.radix.read().len(),
            cached_version_chains: self.inner.mvcc.cached_chain_count(),
            last_checkpoint_lsn: self.inner.ckpt.last_checkpoint_lsn(),
        })
    }

    /// Page-checksum sweep plus structural checks on every attribute index.
    pub fn verify_integrity(&self) -> Result<IntegrityReport> {
        self.ensure_open()?;
        let mut io = self.inner.io.lock();
        let mut report = IntegrityReport::default();
        let total = io.pager.header().total_pages;
        for page_id in 1..total {
            report.pages_checked += 1;
            match io.pager.read(page_id) {
                Ok(_) => {}
                Err(DirError::ChecksumMismatch(_)) => report.checksum_failures.push(page_id),
                Err(_) => {}
            }
        }
        {
            let indexes = self.inner.indexes.read();
            for (attribute, kind) in indexes.list() {
                if let Err(err) = indexes.validate_tree(&mut *io, &attribute, kind) {
                    report
                        .index_errors
                        .push(format!("{kind:?} index on {attribute}: {err}"));
                }
            }
        }
        report.entries = self.inner.radix.read().len();
        Ok(report)
    }

    /// Flushes everything, aborts still-active transactions, takes a final
    /// checkpoint, and releases the files. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let (lock, condvar) = &*self.inner.shutdown;
            *lock.lock() = true;
            condvar.notify_all();
        }
        let workers: Vec<JoinHandle<()>> = self.inner.workers.lock().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }
        if self.inner.config.read_only {
            return Ok(());
        }
        {
            let mut io = self.inner.io.lock();
            for tx_id in self.inner.txm.active_ids() {
                warn!(tx_id, "aborting transaction still active at close");
                io.append_wal(&WalRecord::abort(tx_id))?;
                self.inner.txm.finish(tx_id);
            }
        }
        checkpoint_impl(&self.inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DirError::Closed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.inner.config.read_only {
            return Err(DirError::ReadOnly);
        }
        Ok(())
    }

    fn visible_or_none(
        &self,
        io: &mut IoState,
        dn: &str,
        tx: &Transaction,
    ) -> Result<Option<Version>> {
        match self.inner.mvcc.get_visible_for_tx(io, dn, tx.snapshot()) {
            Ok(version) => Ok(Some(version)),
            Err(
                DirError::NotFound(_) | DirError::VersionDeleted | DirError::NoVisibleVersion,
            ) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn lock_io(&self) -> MutexGuard<'_, IoState> {
        self.inner.io.lock()
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.inner.radix.read().len()
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.config.data_dir
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Drop for DirectoryDB {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(err) = self.close() {
                error!(%err, "error while closing store on drop");
            }
        }
    }
}

/// Lazy search result stream. Yields entries visible to the originating
/// snapshot; DNs whose visible version is a tombstone (or that have none)
/// are skipped silently.
pub struct SearchIter {
    inner: Arc<DbInner>,
    snapshot: crate::storage::Snapshot,
    cursor: RadixCursor,
    matcher: Option<Box<dyn FilterMatcher + Send>>,
}

impl SearchIter {
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        loop {
            let item = {
                let radix = self.inner.radix.read();
                self.cursor.next(&radix)?
            };
            let Some((dn, _)) = item else {
                return Ok(None);
            };
            let outcome = match self.inner.mvcc.walk_cached(&dn, &self.snapshot) {
                Some(outcome) => outcome,
                None => {
                    let mut io = self.inner.io.lock();
                    self.inner.mvcc.get_visible_for_tx(&mut io, &dn, &self.snapshot)
                }
            };
            match outcome {
                Ok(version) => {
                    let Some(payload) = version.payload else {
                        continue;
                    };
                    let entry = deserialize_entry(&payload)?;
                    if let Some(matcher) = &self.matcher {
                        if !matcher.matches(&entry) {
                            continue;
                        }
                    }
                    return Ok(Some(entry));
                }
                Err(
                    DirError::NotFound(_) | DirError::VersionDeleted | DirError::NoVisibleVersion,
                ) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Cooperative cancellation flag shared with the underlying cursor.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cursor.cancel_flag()
    }

    /// Ends the stream; idempotent.
    pub fn close(&mut self) {
        self.cursor.close();
    }
}

impl Iterator for SearchIter {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

fn normalized_entry(entry: &Entry) -> Entry {
    let mut normalized = Entry::new(&entry.dn);
    for (name, values) in &entry.attributes {
        for value in values {
            normalized.add_value(name, value.clone());
        }
    }
    normalized
}

fn checkpoint_impl(inner: &DbInner) -> Result<()> {
    let mut io = inner.io.lock();
    let mut radix = inner.radix.write();
    let mut indexes = inner.indexes.write();
    let active = inner.txm.active_ids();
    inner
        .ckpt
        .checkpoint(&mut io, &mut radix, &mut indexes, &active, inner.txm.counters())?;
    inner.ckpt.truncate_wal(&mut io, inner.txm.min_active_first_lsn())
}

/// Resolves a DN to its last committed version through the DN index.
fn load_committed_version(
    inner: &DbInner,
    io: &mut IoState,
    dn: &str,
) -> Result<Option<Version>> {
    let entry_ref = match inner.radix.read().lookup(dn) {
        Some(entry_ref) => entry_ref,
        None => return Ok(None),
    };
    let page = io.read_page(entry_ref.page_id)?;
    let record = VersionRecord::decode(heap::read_record(&page.payload, entry_ref.slot_id)?)?;
    if record.commit_ts == 0 {
        // The ref points at an in-flight version; the committed state (if
        // any) is still linked in memory, not reachable from here.
        return Ok(None);
    }
    Ok(Some(Version {
        tx_id: record.tx_id,
        commit_ts: record.commit_ts,
        is_deleted: record.tombstone,
        payload: if record.tombstone {
            None
        } else {
            Some(record.entry_bytes)
        },
        page_id: entry_ref.page_id,
        slot_id: entry_ref.slot_id,
        prev: None,
    }))
}

/// WAL recovery: redo committed page updates in LSN order, undo updates of
/// transactions that never committed (in reverse LSN order), then sync.
fn recover(io: &mut IoState) -> Result<RecoveryOutcome> {
    let mut records = Vec::new();
    let mut iter = io.wal.iter(0)?;
    while let Some(record) = iter.next_record()? {
        records.push(record);
    }
    let mut outcome = RecoveryOutcome::default();
    if records.is_empty() {
        return Ok(outcome);
    }
    let committed: std::collections::HashSet<u64> = records
        .iter()
        .filter(|r| r.kind == WalRecordKind::TxCommit)
        .map(|r| r.tx_id)
        .collect();
    outcome.max_tx_id = records.iter().map(|r| r.tx_id).max().unwrap_or(0);
    outcome.max_commit_ts = records
        .iter()
        .filter(|r| r.kind == WalRecordKind::TxCommit)
        .filter_map(|r| r.commit_ts().ok())
        .max()
        .unwrap_or(0);

    let payload_len = io.pager.payload_len();
    let mut touched: HashMap<PageId, Page> = HashMap::new();
    let mut load = |io: &mut IoState, touched: &mut HashMap<PageId, Page>, page_id: PageId| {
        touched.entry(page_id).or_insert_with(|| {
            match io.pager.read(page_id) {
                Ok(page) => page,
                Err(err) => {
                    // Torn or never-flushed page: rebuild from a zeroed
                    // image; surviving WAL spans restore its records.
                    warn!(page_id, %err, "rebuilding page during recovery");
                    Page::new(page_id, PageType::Data, payload_len)
                }
            }
        });
    };

    for record in &records {
        if record.kind != WalRecordKind::PageUpdate || !committed.contains(&record.tx_id) {
            continue;
        }
        load(io, &mut touched, record.page_id);
        let page = touched.get_mut(&record.page_id).expect("just loaded");
        apply_span(page, record.after_off, &record.after)?;
        page.lsn = record.lsn;
        outcome.replayed = true;
    }
    for record in records.iter().rev() {
        if record.kind != WalRecordKind::PageUpdate || committed.contains(&record.tx_id) {
            continue;
        }
        load(io, &mut touched, record.page_id);
        let page = touched.get_mut(&record.page_id).expect("just loaded");
        apply_span(page, record.before_off, &record.before)?;
        outcome.replayed = true;
    }

    if outcome.replayed {
        let count = touched.len();
        for (_, page) in touched {
            io.pager.write(&page)?;
        }
        let header = io.pager.header().clone();
        io.pager.update_header(header)?;
        io.pager.sync()?;
        info!(pages = count, "WAL recovery applied");
    }
    Ok(outcome)
}

/// Appends a record into the current fill page, rolling to a fresh data page
/// when full.
fn append_to_heap(
    pager: &mut PageManager,
    fill: &mut Option<Page>,
    bytes: &[u8],
) -> Result<(PageId, u16)> {
    if let Some(page) = fill.as_mut() {
        if heap::has_room(&page.payload, bytes.len()) {
            let slot = heap::append_record(page, bytes)?.expect("room was checked");
            return Ok((page.id, slot));
        }
    }
    if let Some(page) = fill.take() {
        pager.write(&page)?;
    }
    let id = pager.allocate(PageType::Data)?;
    let mut page = pager.read(id)?;
    match heap::append_record(&mut page, bytes)? {
        Some(slot) => {
            let page_id = page.id;
            *fill = Some(page);
            Ok((page_id, slot))
        }
        None => Err(DirError::InvalidArgument(format!(
            "record of {} bytes exceeds page capacity",
            bytes.len()
        ))),
    }
}

fn apply_span(page: &mut Page, offset: u16, bytes: &[u8]) -> Result<()> {
    let start = offset as usize;
    let end = start + bytes.len();
    if end > page.payload.len() {
        return Err(DirError::Corrupted(
            "WAL image exceeds page payload".into(),
        ));
    }
    page.payload[start..end].copy_from_slice(bytes);
    Ok(())
}

/// Rebuilds the DN index and attribute indexes by scanning live data pages.
/// Returns the rebuilt structures plus the highest commit timestamp and
/// transaction id seen in version records.
fn rebuild_from_pages(
    io: &mut IoState,
    old_dn_root: PageId,
    old_catalog_root: PageId,
    read_only: bool,
) -> Result<(RadixTree, IndexManager, u64, u64)> {
    // Free the stale persisted images; both are rebuilt below. A read-only
    // open cannot touch the file, so it rebuilds the DN index in memory only
    // and leaves attribute indexes unavailable until a writable open.
    let kinds = if read_only {
        Vec::new()
    } else {
        if old_dn_root != 0 {
            if let Err(err) = crate::index::blob::free_blob(io, old_dn_root) {
                warn!(%err, "leaking stale DN-index pages during rebuild");
            }
        }
        match IndexManager::load(io, old_catalog_root) {
            Ok(mut old) => {
                let kinds = old.clear(io);
                if old_catalog_root != 0 {
                    if let Err(err) = crate::index::blob::free_blob(io, old_catalog_root) {
                        warn!(%err, "leaking stale catalog pages during rebuild");
                    }
                }
                kinds
            }
            Err(err) => {
                warn!(%err, "index catalog unreadable; rebuilding without indexes");
                Vec::new()
            }
        }
    };

    let mut indexes = IndexManager::new();
    for (attribute, kind) in kinds {
        indexes.create_index(io, &attribute, kind)?;
    }

    struct Latest {
        commit_ts: u64,
        tombstone: bool,
        entry_ref: EntryRef,
        entry_bytes: Vec<u8>,
    }
    let mut latest: HashMap<String, Latest> = HashMap::new();
    let mut max_ts = 0u64;
    let mut max_tx = 0u64;
    let total = io.pager.header().total_pages;
    for page_id in 1..total {
        let page = match io.pager.read(page_id) {
            Ok(page) => page,
            Err(_) => continue,
        };
        if page.page_type != PageType::Data {
            continue;
        }
        for slot in 0..heap::slot_count(&page.payload) {
            let bytes = match heap::read_record(&page.payload, slot) {
                Ok(bytes) => bytes,
                Err(_) => break,
            };
            let record = match VersionRecord::decode(bytes) {
                Ok(record) => record,
                Err(_) => continue,
            };
            max_tx = max_tx.max(record.tx_id);
            if record.commit_ts == 0 {
                continue;
            }
            max_ts = max_ts.max(record.commit_ts);
            let replace = latest
                .get(&record.dn)
                .map(|seen| record.commit_ts > seen.commit_ts)
                .unwrap_or(true);
            if replace {
                latest.insert(
                    record.dn.clone(),
                    Latest {
                        commit_ts: record.commit_ts,
                        tombstone: record.tombstone,
                        entry_ref: EntryRef::new(page_id, slot),
                        entry_bytes: record.entry_bytes,
                    },
                );
            }
        }
    }

    let mut radix = RadixTree::new();
    for (dn, version) in &latest {
        if version.tombstone {
            continue;
        }
        radix.insert(dn, version.entry_ref)?;
        let entry = deserialize_entry(&version.entry_bytes)?;
        let ops = indexes.plan_change(None, Some((&entry, version.entry_ref)));
        indexes.apply_ops(io, &ops)?;
    }
    info!(entries = radix.len(), "rebuilt DN index from data pages");
    Ok((radix, indexes, max_ts, max_tx))
}

fn spawn_workers(inner: &Arc<DbInner>) {
    let mut workers = inner.workers.lock();
    if inner.config.checkpoint_interval_seconds > 0 {
        let weak = Arc::downgrade(inner);
        let shutdown = Arc::clone(&inner.shutdown);
        let interval = Duration::from_secs(inner.config.checkpoint_interval_seconds);
        workers.push(std::thread::spawn(move || {
            background_loop(weak, shutdown, interval, |inner| {
                if let Err(err) = checkpoint_impl(inner) {
                    warn!(%err, "background checkpoint failed");
                }
            });
        }));
    }
    if inner.config.gc_enabled {
        let weak = Arc::downgrade(inner);
        let shutdown = Arc::clone(&inner.shutdown);
        let interval = Duration::from_secs(inner.config.gc_interval_seconds.max(1));
        workers.push(std::thread::spawn(move || {
            background_loop(weak, shutdown, interval, |inner| {
                run_gc(&inner.mvcc, &inner.txm, &inner.radix);
            });
        }));
    }
}

fn background_loop(
    weak: Weak<DbInner>,
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    interval: Duration,
    tick: impl Fn(&DbInner),
) {
    loop {
        {
            let (lock, condvar) = &*shutdown;
            let mut stop = lock.lock();
            if *stop {
                return;
            }
            condvar.wait_for(&mut stop, interval);
            if *stop {
                return;
            }
        }
        match weak.upgrade() {
            Some(inner) => {
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                tick(&inner);
            }
            None => return,
        }
    }
}
