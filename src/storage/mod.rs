//! Entry storage: slotted data pages and the MVCC version store.

pub mod heap;
pub mod mvcc;

pub use mvcc::{Snapshot, Version, VersionStore};
