//! # Obelisk - Embedded Directory Storage Engine
//!
//! Obelisk is a crash-safe, transactional key-value store whose primary key
//! is a distinguished name (DN) and whose value is a typed multi-valued
//! attribute record. It supports hierarchical scoped lookup, attribute-
//! indexed filter search, snapshot-isolated multi-reader/single-writer
//! concurrency, and online backup with point-in-time restore.
//!
//! ## Quick Start
//!
//! ```no_run
//! use obelisk::{Config, DirectoryDB, Entry, Scope};
//!
//! let db = DirectoryDB::open(Config::new("./data"))?;
//!
//! let mut tx = db.begin()?;
//! let entry = Entry::new("uid=alice,ou=users,dc=example,dc=com")
//!     .with_str("cn", "Alice Smith");
//! db.put(&mut tx, &entry)?;
//! db.commit(&mut tx)?;
//!
//! let tx = db.begin()?;
//! let alice = db.get(&tx, "uid=alice,ou=users,dc=example,dc=com")?;
//! for entry in db.search_by_dn(&tx, "dc=example,dc=com", Scope::Subtree)? {
//!     let entry = entry?;
//!     println!("{}", entry.dn);
//! }
//! # let _ = alice;
//! # Ok::<(), obelisk::DirError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Pager layer**: fixed-size typed pages with a free list, a write-ahead
//!   log with LSN-ordered records, and a byte-bounded buffer pool
//! - **Index layer**: a paged B+ tree for attribute indexes and a radix tree
//!   over hierarchical DN keys for scoped lookup
//! - **Storage layer**: per-DN MVCC version chains with snapshot visibility
//! - **Engine layer**: transactions, checkpointing, GC, and the facade
//! - **Backup layer**: full and incremental archives with CRC32 integrity
//!   and a bespoke block codec

pub mod backup;
pub mod crypto;
pub mod db;
pub mod error;
pub mod index;
pub mod logging;
pub mod model;
pub mod pager;
pub mod storage;

// Re-export the main public API.
pub use crate::backup::{
    backup_full, backup_incremental, restore, verify, BackupKind, BackupMetadata, BackupReport,
};
pub use crate::db::{Config, DbStats, DirectoryDB, IntegrityReport, SearchIter, Transaction, TxState};
pub use crate::error::{DirError, Result};
pub use crate::index::manager::IndexKind;
pub use crate::logging::init_logging;
pub use crate::model::{Entry, EntryRef, FilterMatcher, Scope};
