//! Transaction handles and the transaction manager.
//!
//! The manager assigns monotonically increasing transaction ids and snapshot
//! timestamps from one shared counter, tracks the active set, and writes the
//! begin/commit/abort WAL records. Writers serialize on the engine's writer
//! lock from their first mutating call; the manager itself is lock-light.

use std::collections::HashMap;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{DirError, Result};
use crate::index::manager::StagedIndexOp;
use crate::model::EntryRef;
use crate::pager::{IoState, Lsn, PageUndo, WalRecord};
use crate::storage::Snapshot;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    Aborted,
}

/// An open transaction. Obtained from [`DirectoryDB::begin`] and consumed by
/// `commit` or `rollback`; operations on a finished transaction return
/// `TxClosed`.
///
/// [`DirectoryDB::begin`]: crate::db::DirectoryDB::begin
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    snapshot: Snapshot,
    state: TxState,
    /// DNs touched by this transaction, in first-touch order.
    pub(crate) touched_dns: Vec<String>,
    /// DN-index inserts staged until commit (aborted transactions must never
    /// surface their DNs in scoped enumeration).
    pub(crate) staged_radix_inserts: Vec<(String, EntryRef)>,
    /// Entry-ref moves for DNs already present in the DN index.
    pub(crate) staged_radix_updates: Vec<(String, EntryRef)>,
    /// Attribute-index mutations staged until commit.
    pub(crate) staged_index_ops: Vec<StagedIndexOp>,
    /// Before-images for runtime rollback, in capture order.
    pub(crate) undo: Vec<PageUndo>,
    pub(crate) first_lsn: Lsn,
    pub(crate) last_lsn: Lsn,
    pub(crate) holds_writer: bool,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// LSN of this transaction's `TxBegin` record (0 for read-only mode).
    pub fn first_lsn(&self) -> Lsn {
        self.first_lsn
    }

    /// LSN of the transaction's most recent page-update record.
    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(DirError::TxClosed);
        }
        Ok(())
    }

    pub(crate) fn set_state(&mut self, state: TxState) {
        self.state = state;
    }

    pub(crate) fn touch(&mut self, dn: &str) {
        if !self.touched_dns.iter().any(|d| d == dn) {
            self.touched_dns.push(dn.to_string());
        }
    }

    /// Stages a DN-index insert, replacing an earlier staged ref for the
    /// same DN (a transaction may rewrite its own insert).
    pub(crate) fn stage_radix_insert(&mut self, dn: &str, entry: EntryRef) {
        if let Some(slot) = self
            .staged_radix_inserts
            .iter_mut()
            .find(|(staged, _)| staged == dn)
        {
            slot.1 = entry;
        } else {
            self.staged_radix_inserts.push((dn.to_string(), entry));
        }
    }

    pub(crate) fn stage_radix_update(&mut self, dn: &str, entry: EntryRef) {
        if let Some(slot) = self
            .staged_radix_updates
            .iter_mut()
            .find(|(staged, _)| staged == dn)
        {
            slot.1 = entry;
        } else {
            self.staged_radix_updates.push((dn.to_string(), entry));
        }
    }

    pub(crate) fn is_staged_insert(&self, dn: &str) -> bool {
        self.staged_radix_inserts.iter().any(|(staged, _)| staged == dn)
    }

    pub(crate) fn has_writes(&self) -> bool {
        !self.touched_dns.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveTx {
    snapshot_ts: u64,
    first_lsn: Lsn,
}

/// Assigns transaction ids and timestamps, tracks the active set.
#[derive(Debug)]
pub struct TxManager {
    next_tx_id: AtomicU64,
    next_ts: AtomicU64,
    active: Mutex<HashMap<u64, ActiveTx>>,
}

impl TxManager {
    pub fn new(next_tx_id: u64, next_ts: u64) -> Self {
        Self {
            next_tx_id: AtomicU64::new(next_tx_id.max(1)),
            next_ts: AtomicU64::new(next_ts.max(1)),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Begins a transaction: assigns its id and snapshot timestamp, captures
    /// the active set, and appends the `TxBegin` record.
    pub fn begin(&self, io: &mut IoState) -> Result<Transaction> {
        let id = self.next_tx_id.fetch_add(1, Ordering::SeqCst);
        let mut active = self.active.lock();
        let ts = self.next_ts.fetch_add(1, Ordering::SeqCst);
        let active_tx_ids = active.keys().copied().collect();
        let first_lsn = io.append_wal(&WalRecord::begin(id))?;
        active.insert(
            id,
            ActiveTx {
                snapshot_ts: ts,
                first_lsn,
            },
        );
        drop(active);
        Ok(Transaction {
            id,
            snapshot: Snapshot {
                ts,
                active_tx_ids,
                creator_tx_id: id,
            },
            state: TxState::Active,
            touched_dns: Vec::new(),
            staged_radix_inserts: Vec::new(),
            staged_radix_updates: Vec::new(),
            staged_index_ops: Vec::new(),
            undo: Vec::new(),
            first_lsn,
            last_lsn: first_lsn,
            holds_writer: false,
        })
    }

    /// Read-only variant of [`begin`](Self::begin): no WAL record is written
    /// (used when the store is opened read-only).
    pub fn begin_readonly(&self) -> Transaction {
        let id = self.next_tx_id.fetch_add(1, Ordering::SeqCst);
        let mut active = self.active.lock();
        let ts = self.next_ts.fetch_add(1, Ordering::SeqCst);
        let active_tx_ids = active.keys().copied().collect();
        active.insert(
            id,
            ActiveTx {
                snapshot_ts: ts,
                first_lsn: Lsn::MAX,
            },
        );
        drop(active);
        Transaction {
            id,
            snapshot: Snapshot {
                ts,
                active_tx_ids,
                creator_tx_id: id,
            },
            state: TxState::Active,
            touched_dns: Vec::new(),
            staged_radix_inserts: Vec::new(),
            staged_radix_updates: Vec::new(),
            staged_index_ops: Vec::new(),
            undo: Vec::new(),
            first_lsn: 0,
            last_lsn: 0,
            holds_writer: false,
        }
    }

    /// Allocates a commit timestamp (strictly greater than every snapshot
    /// timestamp handed out so far).
    pub fn allocate_commit_ts(&self) -> u64 {
        self.next_ts.fetch_add(1, Ordering::SeqCst)
    }

    /// Removes a finished transaction from the active set.
    pub fn finish(&self, tx_id: u64) {
        self.active.lock().remove(&tx_id);
    }

    pub fn active_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.active.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// First LSN of the oldest active transaction (WAL truncation bound).
    pub fn min_active_first_lsn(&self) -> Option<Lsn> {
        self.active.lock().values().map(|tx| tx.first_lsn).min()
    }

    /// Oldest snapshot timestamp still held by an active transaction.
    pub fn oldest_active_snapshot_ts(&self) -> Option<u64> {
        self.active.lock().values().map(|tx| tx.snapshot_ts).min()
    }

    /// Latest timestamp handed out; versions at or below it and not held by
    /// an active snapshot are GC candidates.
    pub fn current_ts(&self) -> u64 {
        self.next_ts.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Counter values persisted into the file header at checkpoint.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.next_tx_id.load(Ordering::SeqCst),
            self.next_ts.load(Ordering::SeqCst),
        )
    }
}
