//! Write-ahead log.
//!
//! Single-writer append of variable-length records, each stamped with a
//! strictly monotonically increasing LSN. Record framing (little-endian):
//!
//! ```text
//! kind(u8) | lsn(u64) | tx_id(u64) | page_id(u64) |
//! before_off(u16) | before_len(u16) | after_off(u16) | after_len(u16) |
//! before bytes | after bytes | crc32(u32)
//! ```
//!
//! The CRC covers every preceding byte of the record. A short read or a CRC
//! mismatch marks a torn tail: iteration stops there and everything before it
//! is the durable prefix.

use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crc32fast::Hasher;
use tracing::warn;

use crate::crypto::PageCipher;
use crate::error::{DirError, Result};

use super::{Lsn, PageId};

const WAL_MAGIC: &[u8; 4] = b"OBAW";
const WAL_FORMAT_VERSION: u32 = 1;
pub(crate) const WAL_HEADER_SIZE: usize = 16;
const RECORD_HEADER_SIZE: usize = 1 + 8 + 8 + 8 + 2 + 2 + 2 + 2;

/// Kind byte of a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalRecordKind {
    TxBegin = 1,
    TxCommit = 2,
    TxAbort = 3,
    PageUpdate = 4,
    CheckpointBegin = 5,
    CheckpointEnd = 6,
}

impl WalRecordKind {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::TxBegin),
            2 => Ok(Self::TxCommit),
            3 => Ok(Self::TxAbort),
            4 => Ok(Self::PageUpdate),
            5 => Ok(Self::CheckpointBegin),
            6 => Ok(Self::CheckpointEnd),
            _ => Err(DirError::Corrupted(format!(
                "unknown WAL record kind {value}"
            ))),
        }
    }
}

/// A decoded WAL record. `before`/`after` hold plaintext images; for
/// non-page records the `after` segment carries the record payload
/// (commit timestamp, active transaction list, checkpoint-begin LSN).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub kind: WalRecordKind,
    pub lsn: Lsn,
    pub tx_id: u64,
    pub page_id: PageId,
    pub before_off: u16,
    pub after_off: u16,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

impl WalRecord {
    fn control(kind: WalRecordKind, tx_id: u64, after: Vec<u8>) -> Self {
        Self {
            kind,
            lsn: 0,
            tx_id,
            page_id: 0,
            before_off: 0,
            after_off: 0,
            before: Vec::new(),
            after,
        }
    }

    pub fn begin(tx_id: u64) -> Self {
        Self::control(WalRecordKind::TxBegin, tx_id, Vec::new())
    }

    pub fn commit(tx_id: u64, commit_ts: u64) -> Self {
        Self::control(WalRecordKind::TxCommit, tx_id, commit_ts.to_le_bytes().to_vec())
    }

    pub fn abort(tx_id: u64) -> Self {
        Self::control(WalRecordKind::TxAbort, tx_id, Vec::new())
    }

    pub fn checkpoint_begin(active_tx_ids: &[u64]) -> Self {
        let mut payload = Vec::with_capacity(active_tx_ids.len() * 8);
        for id in active_tx_ids {
            payload.extend_from_slice(&id.to_le_bytes());
        }
        Self::control(WalRecordKind::CheckpointBegin, 0, payload)
    }

    pub fn checkpoint_end(cp_begin_lsn: Lsn) -> Self {
        Self::control(
            WalRecordKind::CheckpointEnd,
            0,
            cp_begin_lsn.to_le_bytes().to_vec(),
        )
    }

    /// Commit timestamp carried by a `TxCommit` record.
    pub fn commit_ts(&self) -> Result<u64> {
        if self.kind != WalRecordKind::TxCommit || self.after.len() != 8 {
            return Err(DirError::Corrupted(
                "commit record carries no commit timestamp".into(),
            ));
        }
        Ok(u64::from_le_bytes(
            self.after[..8].try_into().expect("slice is 8 bytes"),
        ))
    }

    /// `cp_begin` LSN carried by a `CheckpointEnd` record.
    pub fn checkpoint_begin_lsn(&self) -> Result<Lsn> {
        if self.kind != WalRecordKind::CheckpointEnd || self.after.len() != 8 {
            return Err(DirError::Corrupted(
                "checkpoint-end record carries no begin LSN".into(),
            ));
        }
        Ok(u64::from_le_bytes(
            self.after[..8].try_into().expect("slice is 8 bytes"),
        ))
    }

    /// Active transaction list carried by a `CheckpointBegin` record.
    pub fn active_tx_ids(&self) -> Result<Vec<u64>> {
        if self.kind != WalRecordKind::CheckpointBegin || self.after.len() % 8 != 0 {
            return Err(DirError::Corrupted(
                "checkpoint-begin record carries a malformed active list".into(),
            ));
        }
        Ok(self
            .after
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().expect("chunk is 8 bytes")))
            .collect())
    }
}

/// Append-only log file with LSN assignment, forward iteration, and prefix
/// truncation.
#[derive(Debug)]
pub struct Wal {
    file: Option<File>,
    path: PathBuf,
    next_lsn: Lsn,
    read_only: bool,
    cipher: Option<Arc<PageCipher>>,
}

impl Wal {
    /// Opens the WAL beside the data file. In read-only mode a missing WAL is
    /// tolerated (and never created).
    pub fn open(
        data_path: &Path,
        read_only: bool,
        cipher: Option<Arc<PageCipher>>,
    ) -> Result<Self> {
        let path = wal_path(data_path);
        let exists = path.exists();
        if read_only && !exists {
            return Ok(Self {
                file: None,
                path,
                next_lsn: 1,
                read_only,
                cipher,
            });
        }
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .truncate(false)
            .open(&path)?;
        let mut wal = Self {
            file: Some(file),
            path,
            next_lsn: 1,
            read_only,
            cipher,
        };
        let len = wal.file.as_ref().expect("wal file").metadata()?.len();
        if len == 0 {
            wal.write_header()?;
        } else {
            wal.validate_header()?;
            wal.next_lsn = wal.scan_last_lsn()? + 1;
        }
        Ok(wal)
    }

    /// Appends a record, assigning the next LSN. `sync` is separate so
    /// commits can group.
    pub fn append(&mut self, record: &WalRecord) -> Result<Lsn> {
        self.ensure_writable()?;
        let lsn = self.next_lsn;
        self.append_with_lsn(record, lsn)?;
        self.next_lsn += 1;
        Ok(lsn)
    }

    fn append_with_lsn(&mut self, record: &WalRecord, lsn: Lsn) -> Result<()> {
        let bytes = self.encode_record(record, lsn)?;
        let file = self.file.as_mut().ok_or(DirError::ReadOnly)?;
        file.seek(SeekFrom::End(0))?;
        file.write_all(&bytes)?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.sync_data()?;
        }
        Ok(())
    }

    /// LSN of the most recently appended record (0 when empty).
    pub fn current_lsn(&self) -> Lsn {
        self.next_lsn - 1
    }

    /// Raises the LSN counter to continue after `lsn`. Used on open to
    /// restore monotonicity from the file header after WAL truncation.
    pub fn ensure_lsn_at_least(&mut self, lsn: Lsn) {
        if self.next_lsn <= lsn {
            self.next_lsn = lsn + 1;
        }
    }

    pub fn size(&self) -> Result<u64> {
        match &self.file {
            Some(file) => Ok(file.metadata()?.len()),
            None => Ok(0),
        }
    }

    /// Forward cursor over records with `lsn > start_lsn`. The cursor owns an
    /// independent read handle, so iteration does not block appends.
    pub fn iter(&self, start_lsn: Lsn) -> Result<WalIter> {
        let file = match OpenOptions::new().read(true).open(&self.path) {
            Ok(file) => Some(file),
            Err(_) if self.file.is_none() => None,
            Err(err) => return Err(err.into()),
        };
        let mut iter = WalIter {
            file,
            start_lsn,
            cipher: self.cipher.clone(),
            done: false,
        };
        iter.seek_to_first()?;
        Ok(iter)
    }

    /// Removes the prefix of records with `lsn <= upto_lsn` by rewriting the
    /// file in place.
    pub fn truncate(&mut self, upto_lsn: Lsn) -> Result<()> {
        self.ensure_writable()?;
        let mut survivors = Vec::new();
        let mut iter = self.iter(upto_lsn)?;
        while let Some(record) = iter.next_record()? {
            survivors.push(record);
        }
        let file = self.file.as_mut().ok_or(DirError::ReadOnly)?;
        file.set_len(WAL_HEADER_SIZE as u64)?;
        file.seek(SeekFrom::End(0))?;
        for record in survivors {
            let lsn = record.lsn;
            self.append_with_lsn(&record, lsn)?;
        }
        self.sync()
    }

    fn encode_record(&self, record: &WalRecord, lsn: Lsn) -> Result<Vec<u8>> {
        let before = match &self.cipher {
            Some(cipher) if !record.before.is_empty() => cipher.seal(&record.before)?,
            _ => record.before.clone(),
        };
        let after = match &self.cipher {
            Some(cipher) if !record.after.is_empty() => cipher.seal(&record.after)?,
            _ => record.after.clone(),
        };
        let before_len = u16::try_from(before.len())
            .map_err(|_| DirError::InvalidArgument("WAL before-image exceeds u16::MAX".into()))?;
        let after_len = u16::try_from(after.len())
            .map_err(|_| DirError::InvalidArgument("WAL after-image exceeds u16::MAX".into()))?;

        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + before.len() + after.len() + 4);
        buf.push(record.kind as u8);
        buf.extend_from_slice(&lsn.to_le_bytes());
        buf.extend_from_slice(&record.tx_id.to_le_bytes());
        buf.extend_from_slice(&record.page_id.to_le_bytes());
        buf.extend_from_slice(&record.before_off.to_le_bytes());
        buf.extend_from_slice(&before_len.to_le_bytes());
        buf.extend_from_slice(&record.after_off.to_le_bytes());
        buf.extend_from_slice(&after_len.to_le_bytes());
        buf.extend_from_slice(&before);
        buf.extend_from_slice(&after);
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());
        Ok(buf)
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = [0u8; WAL_HEADER_SIZE];
        header[0..4].copy_from_slice(WAL_MAGIC);
        header[4..8].copy_from_slice(&WAL_FORMAT_VERSION.to_le_bytes());
        let file = self.file.as_mut().ok_or(DirError::ReadOnly)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        file.sync_data()?;
        Ok(())
    }

    fn validate_header(&mut self) -> Result<()> {
        let file = self.file.as_mut().expect("wal file");
        let mut header = [0u8; WAL_HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)
            .map_err(|_| DirError::Corrupted("WAL file shorter than header".into()))?;
        if &header[0..4] != WAL_MAGIC {
            return Err(DirError::Corrupted("invalid WAL magic".into()));
        }
        let version = u32::from_le_bytes(header[4..8].try_into().expect("slice is 4 bytes"));
        if version != WAL_FORMAT_VERSION {
            return Err(DirError::UnsupportedFormat(format!(
                "WAL format version {version}"
            )));
        }
        Ok(())
    }

    fn scan_last_lsn(&self) -> Result<Lsn> {
        let mut last = 0;
        let mut iter = self.iter(0)?;
        while let Some(record) = iter.next_record()? {
            last = record.lsn;
        }
        Ok(last)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(DirError::ReadOnly);
        }
        Ok(())
    }
}

/// Forward cursor over WAL records.
#[derive(Debug)]
pub struct WalIter {
    file: Option<File>,
    start_lsn: Lsn,
    cipher: Option<Arc<PageCipher>>,
    done: bool,
}

impl WalIter {
    fn seek_to_first(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            let len = file.metadata()?.len();
            if len < WAL_HEADER_SIZE as u64 {
                self.done = true;
                return Ok(());
            }
            file.seek(SeekFrom::Start(WAL_HEADER_SIZE as u64))?;
        } else {
            self.done = true;
        }
        Ok(())
    }

    /// Yields the next record with `lsn > start_lsn`, or `None` at EOF or at
    /// the first torn record.
    pub fn next_record(&mut self) -> Result<Option<WalRecord>> {
        loop {
            if self.done {
                return Ok(None);
            }
            match self.read_one()? {
                Some(record) if record.lsn > self.start_lsn => return Ok(Some(record)),
                Some(_) => continue,
                None => {
                    self.done = true;
                    return Ok(None);
                }
            }
        }
    }

    fn read_one(&mut self) -> Result<Option<WalRecord>> {
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Ok(None),
        };
        let mut header = [0u8; RECORD_HEADER_SIZE];
        if !read_exact_or_eof(file, &mut header)? {
            return Ok(None);
        }
        let kind = match WalRecordKind::from_u8(header[0]) {
            Ok(kind) => kind,
            Err(_) => {
                warn!("torn WAL record: unknown kind byte, halting iteration");
                return Ok(None);
            }
        };
        let lsn = u64::from_le_bytes(header[1..9].try_into().expect("slice is 8 bytes"));
        let tx_id = u64::from_le_bytes(header[9..17].try_into().expect("slice is 8 bytes"));
        let page_id = u64::from_le_bytes(header[17..25].try_into().expect("slice is 8 bytes"));
        let before_off = u16::from_le_bytes(header[25..27].try_into().expect("slice is 2 bytes"));
        let before_len =
            u16::from_le_bytes(header[27..29].try_into().expect("slice is 2 bytes")) as usize;
        let after_off = u16::from_le_bytes(header[29..31].try_into().expect("slice is 2 bytes"));
        let after_len =
            u16::from_le_bytes(header[31..33].try_into().expect("slice is 2 bytes")) as usize;

        let mut body = vec![0u8; before_len + after_len + 4];
        if !read_exact_or_eof(file, &mut body)? {
            warn!(lsn, "torn WAL record: truncated body, halting iteration");
            return Ok(None);
        }
        let stored_crc = u32::from_le_bytes(
            body[before_len + after_len..]
                .try_into()
                .expect("slice is 4 bytes"),
        );
        let mut hasher = Hasher::new();
        hasher.update(&header);
        hasher.update(&body[..before_len + after_len]);
        if hasher.finalize() != stored_crc {
            warn!(lsn, "torn WAL record: CRC mismatch, halting iteration");
            return Ok(None);
        }

        let stored_before = &body[..before_len];
        let stored_after = &body[before_len..before_len + after_len];
        let (before, after) = match &self.cipher {
            Some(cipher) => (
                if stored_before.is_empty() {
                    Vec::new()
                } else {
                    cipher.open(stored_before)?
                },
                if stored_after.is_empty() {
                    Vec::new()
                } else {
                    cipher.open(stored_after)?
                },
            ),
            None => (stored_before.to_vec(), stored_after.to_vec()),
        };

        Ok(Some(WalRecord {
            kind,
            lsn,
            tx_id,
            page_id,
            before_off,
            after_off,
            before,
            after,
        }))
    }
}

fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> Result<bool> {
    let mut read = 0usize;
    while read < buf.len() {
        let bytes = file.read(&mut buf[read..])?;
        if bytes == 0 {
            return Ok(false);
        }
        read += bytes;
    }
    Ok(true)
}

fn wal_path(data_path: &Path) -> PathBuf {
    let mut os_string = data_path.as_os_str().to_owned();
    os_string.push(".wal");
    PathBuf::from(os_string)
}
