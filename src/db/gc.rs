//! Version-chain garbage collection.
//!
//! Prunes chain tails that no live snapshot can observe and retires fully
//! dead DNs (committed tombstones older than every active snapshot) from the
//! DN index. Page space itself is reclaimed by compaction.

use parking_lot::RwLock;
use tracing::debug;

use crate::db::transaction::TxManager;
use crate::index::RadixTree;
use crate::storage::VersionStore;

/// Result of one GC pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// DNs whose chains were fully dead and were removed from the DN index.
    pub dead_dns: usize,
}

pub(crate) fn run_gc(mvcc: &VersionStore, txm: &TxManager, radix: &RwLock<RadixTree>) -> GcStats {
    // Everything at or below this timestamp that is shadowed by a newer
    // committed version is unobservable by any current or future snapshot.
    let oldest = txm
        .oldest_active_snapshot_ts()
        .unwrap_or_else(|| txm.current_ts());
    let dead = mvcc.prune(oldest);
    if !dead.is_empty() {
        let mut radix = radix.write();
        for dn in &dead {
            radix.remove(dn);
        }
        debug!(dead = dead.len(), oldest, "gc retired tombstoned DNs");
    }
    GcStats {
        dead_dns: dead.len(),
    }
}
