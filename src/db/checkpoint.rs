//! Checkpointing and WAL truncation policy.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use crate::error::Result;
use crate::index::{IndexManager, RadixTree};
use crate::pager::{IoState, Lsn, WalRecord};

/// Drives the checkpoint sequence and publishes the safe-truncation LSN.
#[derive(Debug)]
pub struct CheckpointManager {
    last_checkpoint_lsn: AtomicU64,
}

impl CheckpointManager {
    pub fn new(initial: Lsn) -> Self {
        Self {
            last_checkpoint_lsn: AtomicU64::new(initial),
        }
    }

    pub fn last_checkpoint_lsn(&self) -> Lsn {
        self.last_checkpoint_lsn.load(Ordering::SeqCst)
    }

    /// Runs a full checkpoint:
    /// 1. `CheckpointBegin(active)` is appended and its LSN captured,
    /// 2. every dirty pooled page is flushed and the page file synced,
    /// 3. the DN radix image and index catalog are persisted and their roots
    ///    (plus the transaction counters) published in the file header,
    /// 4. `CheckpointEnd(cp_begin)` is appended and the WAL synced,
    /// 5. the safe-truncation LSN becomes `cp_begin`.
    pub fn checkpoint(
        &self,
        io: &mut IoState,
        radix: &mut RadixTree,
        indexes: &mut IndexManager,
        active_tx_ids: &[u64],
        counters: (u64, u64),
    ) -> Result<Lsn> {
        let cp_begin = io.append_wal(&WalRecord::checkpoint_begin(active_tx_ids))?;
        io.flush_all()?;

        let dn_root = radix.persist(io)?;
        let catalog_root = indexes.persist(io)?;
        let mut header = io.pager.header().clone();
        header.dn_index_root = dn_root;
        header.index_catalog_root = catalog_root;
        header.next_tx_id = counters.0;
        header.next_ts = counters.1;
        header.last_lsn = io.wal.current_lsn();
        io.pager.update_header(header)?;
        // Persisting the indexes dirtied pool frames; push those out too.
        io.flush_all()?;

        io.append_wal(&WalRecord::checkpoint_end(cp_begin))?;
        io.sync_wal()?;
        self.last_checkpoint_lsn.store(cp_begin, Ordering::SeqCst);
        info!(cp_begin, "checkpoint complete");
        Ok(cp_begin)
    }

    /// Truncates the WAL below the smaller of the last checkpoint LSN and
    /// the first LSN of any active transaction.
    pub fn truncate_wal(
        &self,
        io: &mut IoState,
        min_active_first_lsn: Option<Lsn>,
    ) -> Result<()> {
        let last_cp = self.last_checkpoint_lsn();
        if last_cp == 0 {
            return Ok(());
        }
        let bound = min_active_first_lsn.unwrap_or(Lsn::MAX).min(last_cp);
        if bound <= 1 {
            return Ok(());
        }
        debug!(upto = bound - 1, "truncating WAL prefix");
        io.wal.truncate(bound - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::{BufferPool, PageManager, PagerOptions, Wal};
    use tempfile::TempDir;

    fn open_io(dir: &TempDir) -> IoState {
        let data = dir.path().join("store.oba");
        let pager = PageManager::open(&data, PagerOptions::default(), None).unwrap();
        let wal = Wal::open(&data, false, None).unwrap();
        let pool = BufferPool::new(64 * 4096, 4096).unwrap();
        IoState::new(pager, pool, wal)
    }

    #[test]
    fn checkpoint_persists_roots_and_publishes_lsn() {
        let dir = TempDir::new().unwrap();
        let mut io = open_io(&dir);
        let mut radix = RadixTree::new();
        radix
            .insert("uid=a,dc=t", crate::model::EntryRef::new(1, 0))
            .unwrap();
        let mut indexes = IndexManager::new();

        let ckpt = CheckpointManager::new(0);
        let cp_begin = ckpt
            .checkpoint(&mut io, &mut radix, &mut indexes, &[], (10, 20))
            .unwrap();
        assert_eq!(ckpt.last_checkpoint_lsn(), cp_begin);
        let header = io.pager.header();
        assert_ne!(header.dn_index_root, 0);
        assert_ne!(header.index_catalog_root, 0);
        assert_eq!((header.next_tx_id, header.next_ts), (10, 20));
    }

    #[test]
    fn truncation_respects_active_transactions() {
        let dir = TempDir::new().unwrap();
        let mut io = open_io(&dir);
        let mut radix = RadixTree::new();
        let mut indexes = IndexManager::new();

        // A handful of page updates from an old transaction.
        for i in 0..4u64 {
            io.log_page_update(1, i + 1, 0, b"", b"x").unwrap();
        }
        let ckpt = CheckpointManager::new(0);
        ckpt.checkpoint(&mut io, &mut radix, &mut indexes, &[1], (2, 2))
            .unwrap();

        // An active transaction whose first LSN predates the checkpoint pins
        // the whole prefix.
        ckpt.truncate_wal(&mut io, Some(1)).unwrap();
        let mut iter = io.wal.iter(0).unwrap();
        let first = iter.next_record().unwrap().unwrap();
        assert_eq!(first.lsn, 1, "records pinned by the active tx survive");

        // Without active transactions the prefix below the checkpoint goes.
        ckpt.truncate_wal(&mut io, None).unwrap();
        let mut iter = io.wal.iter(0).unwrap();
        let first = iter.next_record().unwrap().unwrap();
        assert!(first.lsn >= ckpt.last_checkpoint_lsn());
    }
}
