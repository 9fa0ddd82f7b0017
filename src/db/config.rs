use std::path::PathBuf;
use std::sync::Arc;

use crate::crypto::{PageCipher, KEY_LEN};
use crate::error::{DirError, Result};
use crate::pager::DEFAULT_PAGE_SIZE;

/// Engine configuration, supplied by the caller on open.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the page file, WAL, and backup metadata.
    pub data_dir: PathBuf,
    /// Page size in bytes; must be a multiple of 512.
    pub page_size: u32,
    /// Pages preallocated when the file is created.
    pub initial_pages: u64,
    /// Buffer pool capacity in bytes.
    pub buffer_pool_bytes: u64,
    /// fsync every page write (durability over throughput).
    pub sync_on_write: bool,
    /// Disallow writers and WAL creation.
    pub read_only: bool,
    /// Background checkpoint period; 0 disables the worker.
    pub checkpoint_interval_seconds: u64,
    /// Enable version-chain garbage collection.
    pub gc_enabled: bool,
    /// Background GC period.
    pub gc_interval_seconds: u64,
    /// 32-byte at-rest encryption key.
    pub encryption_key: Option<[u8; KEY_LEN]>,
    /// File holding the key (raw bytes or hex); ignored when
    /// `encryption_key` is set.
    pub encryption_key_file: Option<PathBuf>,
}

impl Config {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            page_size: DEFAULT_PAGE_SIZE,
            initial_pages: 0,
            buffer_pool_bytes: 16 * 1024 * 1024,
            sync_on_write: false,
            read_only: false,
            checkpoint_interval_seconds: 0,
            gc_enabled: true,
            gc_interval_seconds: 60,
            encryption_key: None,
            encryption_key_file: None,
        }
    }

    /// Durability-first preset: every page write is fsynced.
    pub fn fully_durable(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            sync_on_write: true,
            ..Self::new(data_dir)
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.page_size < 512 || self.page_size % 512 != 0 || self.page_size > 65536 {
            return Err(DirError::InvalidArgument(format!(
                "page_size {} must be a multiple of 512 between 512 and 65536",
                self.page_size
            )));
        }
        if self.buffer_pool_bytes < u64::from(self.page_size) {
            return Err(DirError::InvalidArgument(
                "buffer_pool_bytes smaller than one page".into(),
            ));
        }
        if self.gc_enabled && self.gc_interval_seconds == 0 {
            return Err(DirError::InvalidArgument(
                "gc_interval_seconds must be non-zero when GC is enabled".into(),
            ));
        }
        Ok(())
    }

    /// Builds the at-rest cipher from the configured key material.
    pub(crate) fn build_cipher(&self) -> Result<Option<Arc<PageCipher>>> {
        if let Some(key) = &self.encryption_key {
            return Ok(Some(Arc::new(PageCipher::new(key)?)));
        }
        if let Some(path) = &self.encryption_key_file {
            return Ok(Some(Arc::new(PageCipher::from_key_file(path)?)));
        }
        Ok(None)
    }
}
