//! Page file management.
//!
//! The page manager owns the data file: a sequence of fixed-size pages where
//! page 0 is the file header and every other page carries a 32-byte typed
//! page header followed by its payload. Freed pages are chained into a free
//! list anchored in the file header and reused before the file grows.

use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crc32fast::hash;

use crate::crypto::{PageCipher, SEAL_OVERHEAD};
use crate::error::{DirError, Result};

pub mod buffer_pool;
pub mod wal;

pub use buffer_pool::BufferPool;
pub use wal::{Wal, WalIter, WalRecord, WalRecordKind};

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;
/// Size of the per-page header preceding the payload.
pub const PAGE_HEADER_SIZE: usize = 32;
/// Magic bytes at the start of the file header page.
pub const FILE_MAGIC: &[u8; 4] = b"OBAD";
const FORMAT_VERSION: u32 = 1;
const FILE_HEADER_REGION: usize = 72;

pub type PageId = u64;
pub type Lsn = u64;

/// Logical type of an allocated page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Page 0: the file header.
    Header = 0,
    /// Entry payload storage (slotted records).
    Data = 1,
    /// Member of the free list.
    Free = 2,
    /// B+ tree node, radix image, or index catalog page.
    AttrIndex = 3,
}

impl PageType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Header),
            1 => Ok(Self::Data),
            2 => Ok(Self::Free),
            3 => Ok(Self::AttrIndex),
            _ => Err(DirError::Corrupted(format!("unknown page type {value}"))),
        }
    }
}

/// Page flag: the page is a B+ tree leaf.
pub const PAGE_FLAG_LEAF: u8 = 0x01;

/// An in-memory page image: decoded header fields plus the plaintext payload.
#[derive(Debug, Clone)]
pub struct Page {
    pub id: PageId,
    pub page_type: PageType,
    pub flags: u8,
    pub item_count: u16,
    pub free_space: u16,
    pub lsn: Lsn,
    pub payload: Vec<u8>,
}

impl Page {
    pub fn new(id: PageId, page_type: PageType, payload_len: usize) -> Self {
        Self {
            id,
            page_type,
            flags: 0,
            item_count: 0,
            free_space: payload_len as u16,
            lsn: 0,
            payload: vec![0; payload_len],
        }
    }
}

/// Decoded file header (page 0).
#[derive(Debug, Clone, Default)]
pub struct FileHeader {
    pub version: u32,
    pub page_size: u32,
    pub total_pages: u64,
    /// Head of the free-list chain; 0 means the list is empty.
    pub free_list_head: PageId,
    /// Root page of the persisted DN radix image; 0 means absent.
    pub dn_index_root: PageId,
    /// Root page of the persisted attribute-index catalog; 0 means absent.
    pub index_catalog_root: PageId,
    /// Transaction-id counter persisted at checkpoint/close.
    pub next_tx_id: u64,
    /// Timestamp counter persisted at checkpoint/close.
    pub next_ts: u64,
    /// Highest WAL LSN at the last checkpoint; keeps the LSN space
    /// monotonic across restarts even after the WAL is truncated away.
    pub last_lsn: u64,
}

impl FileHeader {
    fn encode(&self, buf: &mut [u8]) {
        buf.fill(0);
        buf[0..4].copy_from_slice(FILE_MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[12..20].copy_from_slice(&self.total_pages.to_le_bytes());
        buf[20..28].copy_from_slice(&self.free_list_head.to_le_bytes());
        buf[28..36].copy_from_slice(&self.dn_index_root.to_le_bytes());
        buf[36..44].copy_from_slice(&self.index_catalog_root.to_le_bytes());
        buf[44..52].copy_from_slice(&self.next_tx_id.to_le_bytes());
        buf[52..60].copy_from_slice(&self.next_ts.to_le_bytes());
        buf[60..68].copy_from_slice(&self.last_lsn.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FILE_HEADER_REGION {
            return Err(DirError::Corrupted("file header region truncated".into()));
        }
        if &buf[0..4] != FILE_MAGIC {
            return Err(DirError::Corrupted("invalid file header magic".into()));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().expect("slice is 4 bytes"));
        if version != FORMAT_VERSION {
            return Err(DirError::UnsupportedFormat(format!(
                "page file format version {version}"
            )));
        }
        Ok(Self {
            version,
            page_size: u32::from_le_bytes(buf[8..12].try_into().expect("slice is 4 bytes")),
            total_pages: u64::from_le_bytes(buf[12..20].try_into().expect("slice is 8 bytes")),
            free_list_head: u64::from_le_bytes(buf[20..28].try_into().expect("slice is 8 bytes")),
            dn_index_root: u64::from_le_bytes(buf[28..36].try_into().expect("slice is 8 bytes")),
            index_catalog_root: u64::from_le_bytes(
                buf[36..44].try_into().expect("slice is 8 bytes"),
            ),
            next_tx_id: u64::from_le_bytes(buf[44..52].try_into().expect("slice is 8 bytes")),
            next_ts: u64::from_le_bytes(buf[52..60].try_into().expect("slice is 8 bytes")),
            last_lsn: u64::from_le_bytes(buf[60..68].try_into().expect("slice is 8 bytes")),
        })
    }
}

/// Options controlling how the page file is opened.
#[derive(Debug, Clone)]
pub struct PagerOptions {
    pub page_size: u32,
    pub initial_pages: u64,
    pub create_if_missing: bool,
    pub read_only: bool,
    pub sync_on_write: bool,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            initial_pages: 0,
            create_if_missing: true,
            read_only: false,
            sync_on_write: false,
        }
    }
}

/// Page occupancy counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagerStats {
    pub total_pages: u64,
    pub free_pages: u64,
    pub used_pages: u64,
}

/// Minimal page access surface shared by the index structures.
///
/// Implemented by [`PageManager`] directly (uncached, used in unit tests) and
/// by [`IoState`] (cached through the buffer pool).
pub trait PageIo {
    fn read_page(&mut self, id: PageId) -> Result<Page>;
    fn write_page(&mut self, page: Page) -> Result<()>;
    fn allocate_page(&mut self, page_type: PageType) -> Result<PageId>;
    fn free_page(&mut self, id: PageId) -> Result<()>;
    fn payload_len(&self) -> usize;
}

/// Owns the page file: allocation, free list, typed reads and writes, and
/// the page-0 file header.
#[derive(Debug)]
pub struct PageManager {
    file: File,
    path: PathBuf,
    header: FileHeader,
    opts: PagerOptions,
    cipher: Option<Arc<PageCipher>>,
}

impl PageManager {
    /// Opens or creates the page file at `path`.
    pub fn open(path: &Path, opts: PagerOptions, cipher: Option<Arc<PageCipher>>) -> Result<Self> {
        if opts.page_size < 512 || opts.page_size % 512 != 0 || opts.page_size > 65536 {
            return Err(DirError::InvalidArgument(format!(
                "page size {} must be a multiple of 512 between 512 and 65536",
                opts.page_size
            )));
        }
        let exists = path.exists();
        if !exists && (!opts.create_if_missing || opts.read_only) {
            return Err(DirError::NotFound("page file"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(!opts.read_only)
            .create(!exists && opts.create_if_missing)
            .truncate(false)
            .open(path)?;

        let mut pager = Self {
            file,
            path: path.to_path_buf(),
            header: FileHeader {
                version: FORMAT_VERSION,
                page_size: opts.page_size,
                total_pages: 1,
                ..FileHeader::default()
            },
            opts,
            cipher,
        };

        let file_len = pager.file.metadata()?.len();
        if file_len == 0 {
            pager.init_file()?;
        } else {
            pager.load_header()?;
        }
        Ok(pager)
    }

    fn init_file(&mut self) -> Result<()> {
        self.write_header_page()?;
        for _ in 0..self.opts.initial_pages {
            let id = self.extend_one(PageType::Free)?;
            let mut page = Page::new(id, PageType::Free, self.payload_len());
            page.payload[0..8].copy_from_slice(&self.header.free_list_head.to_le_bytes());
            self.write(&page)?;
            self.header.free_list_head = id;
        }
        self.write_header_page()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn load_header(&mut self) -> Result<()> {
        let mut buf = vec![0u8; FILE_HEADER_REGION];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut buf).map_err(|_| {
            DirError::Corrupted("page file too short to hold a file header".into())
        })?;
        let header = FileHeader::decode(&buf)?;
        if header.page_size != self.opts.page_size {
            // The stored geometry wins; callers passing a different size are
            // only wrong about the default.
            self.opts.page_size = header.page_size;
        }
        if header.page_size < 512 || header.page_size % 512 != 0 {
            return Err(DirError::Corrupted(format!(
                "stored page size {} is not a multiple of 512",
                header.page_size
            )));
        }
        self.header = header;
        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        self.header.page_size
    }

    pub fn is_read_only(&self) -> bool {
        self.opts.read_only
    }

    pub fn sync_on_write(&self) -> bool {
        self.opts.sync_on_write
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cipher(&self) -> Option<&Arc<PageCipher>> {
        self.cipher.as_ref()
    }

    /// Usable plaintext payload bytes per page (page size minus the page
    /// header, minus the cipher overhead when encryption is configured).
    pub fn payload_len(&self) -> usize {
        let raw = self.header.page_size as usize - PAGE_HEADER_SIZE;
        match &self.cipher {
            Some(_) => raw - SEAL_OVERHEAD,
            None => raw,
        }
    }

    /// Allocates a page, reusing the free list before extending the file.
    pub fn allocate(&mut self, page_type: PageType) -> Result<PageId> {
        self.ensure_writable()?;
        if page_type == PageType::Header || page_type == PageType::Free {
            return Err(DirError::InvalidArgument(
                "cannot allocate header or free pages directly".into(),
            ));
        }
        let id = if self.header.free_list_head != 0 {
            let head = self.header.free_list_head;
            let free_page = self.read(head)?;
            if free_page.page_type != PageType::Free {
                return Err(DirError::Corrupted(format!(
                    "free-list head {head} is not a free page"
                )));
            }
            let next = u64::from_le_bytes(
                free_page.payload[0..8].try_into().expect("slice is 8 bytes"),
            );
            self.header.free_list_head = next;
            head
        } else {
            self.extend_one(page_type)?
        };
        let page = Page::new(id, page_type, self.payload_len());
        self.write(&page)?;
        self.write_header_page()?;
        Ok(id)
    }

    fn extend_one(&mut self, _page_type: PageType) -> Result<PageId> {
        let id = self.header.total_pages;
        self.header.total_pages += 1;
        Ok(id)
    }

    /// Returns a page to the free list. Its type is cleared and its payload
    /// becomes the free-list link.
    pub fn free(&mut self, page_id: PageId) -> Result<()> {
        self.ensure_writable()?;
        if page_id == 0 || page_id >= self.header.total_pages {
            return Err(DirError::InvalidArgument(format!(
                "cannot free page {page_id}"
            )));
        }
        let mut page = Page::new(page_id, PageType::Free, self.payload_len());
        page.payload[0..8].copy_from_slice(&self.header.free_list_head.to_le_bytes());
        self.write(&page)?;
        self.header.free_list_head = page_id;
        self.write_header_page()?;
        Ok(())
    }

    /// Reads and decodes one page, verifying its checksum.
    pub fn read(&mut self, page_id: PageId) -> Result<Page> {
        if page_id == 0 {
            return Err(DirError::InvalidArgument(
                "page 0 is the file header".into(),
            ));
        }
        if page_id >= self.header.total_pages {
            return Err(DirError::InvalidArgument(format!(
                "page {page_id} beyond end of file"
            )));
        }
        let raw = self.read_raw(page_id)?;
        self.decode_page(page_id, &raw)
    }

    /// Batched read; `None` for ids outside the file.
    pub fn read_batch(&mut self, page_ids: &[PageId]) -> Result<Vec<Option<Page>>> {
        let mut pages = Vec::with_capacity(page_ids.len());
        for &id in page_ids {
            if id == 0 || id >= self.header.total_pages {
                pages.push(None);
            } else {
                pages.push(Some(self.read(id)?));
            }
        }
        Ok(pages)
    }

    /// Encodes and writes one page, honoring `sync_on_write`.
    pub fn write(&mut self, page: &Page) -> Result<()> {
        self.ensure_writable()?;
        if page.id == 0 {
            return Err(DirError::InvalidArgument(
                "page 0 is the file header".into(),
            ));
        }
        if page.payload.len() != self.payload_len() {
            return Err(DirError::InvalidArgument(format!(
                "page payload of {} bytes does not match pager payload size {}",
                page.payload.len(),
                self.payload_len()
            )));
        }
        let stored_payload = match &self.cipher {
            Some(cipher) => cipher.seal(&page.payload)?,
            None => page.payload.clone(),
        };
        let mut buf = vec![0u8; self.header.page_size as usize];
        buf[0..8].copy_from_slice(&page.id.to_le_bytes());
        buf[8] = page.page_type as u8;
        buf[9] = page.flags;
        buf[12..14].copy_from_slice(&page.item_count.to_le_bytes());
        buf[14..16].copy_from_slice(&page.free_space.to_le_bytes());
        buf[16..24].copy_from_slice(&page.lsn.to_le_bytes());
        buf[24..28].copy_from_slice(&hash(&stored_payload).to_le_bytes());
        buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + stored_payload.len()]
            .copy_from_slice(&stored_payload);
        self.write_raw(page.id, &buf)?;
        if self.opts.sync_on_write {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Flushes OS buffers for the page file.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Replaces the file header and rewrites page 0.
    pub fn update_header(&mut self, header: FileHeader) -> Result<()> {
        self.ensure_writable()?;
        self.header = header;
        self.write_header_page()
    }

    /// Walks the free list to report occupancy.
    pub fn stats(&mut self) -> Result<PagerStats> {
        let total_pages = self.header.total_pages;
        let mut free_pages = 0u64;
        let mut cursor = self.header.free_list_head;
        while cursor != 0 {
            free_pages += 1;
            if free_pages > total_pages {
                return Err(DirError::Corrupted("free list contains a cycle".into()));
            }
            let page = self.read(cursor)?;
            cursor = u64::from_le_bytes(page.payload[0..8].try_into().expect("slice is 8 bytes"));
        }
        Ok(PagerStats {
            total_pages,
            free_pages,
            used_pages: total_pages - free_pages - 1,
        })
    }

    /// Drops trailing free pages and shrinks the file. Used by compaction.
    pub fn shrink(&mut self) -> Result<u64> {
        self.ensure_writable()?;
        let mut free: Vec<PageId> = Vec::new();
        let mut cursor = self.header.free_list_head;
        while cursor != 0 {
            free.push(cursor);
            let page = self.read(cursor)?;
            cursor = u64::from_le_bytes(page.payload[0..8].try_into().expect("slice is 8 bytes"));
        }
        let mut new_total = self.header.total_pages;
        let mut dropped = std::collections::HashSet::new();
        loop {
            let tail = new_total - 1;
            if tail == 0 || !free.contains(&tail) {
                break;
            }
            dropped.insert(tail);
            new_total -= 1;
        }
        if new_total == self.header.total_pages {
            return Ok(0);
        }
        let removed = self.header.total_pages - new_total;
        self.header.total_pages = new_total;
        // Rebuild the free-list chain without the dropped tail pages.
        self.header.free_list_head = 0;
        for &id in free.iter().rev() {
            if dropped.contains(&id) {
                continue;
            }
            let mut page = Page::new(id, PageType::Free, self.payload_len());
            page.payload[0..8].copy_from_slice(&self.header.free_list_head.to_le_bytes());
            self.write(&page)?;
            self.header.free_list_head = id;
        }
        self.file
            .set_len(u64::from(self.header.page_size) * new_total)?;
        self.write_header_page()?;
        self.file.sync_data()?;
        Ok(removed)
    }

    /// Reads the raw on-disk image of a page (header plus stored payload),
    /// bypassing decryption. Used by backup.
    pub fn read_raw(&mut self, page_id: PageId) -> Result<Vec<u8>> {
        let offset = self.page_offset(page_id)?;
        let mut buf = vec![0u8; self.header.page_size as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        let bytes_read = self.file.read(&mut buf)?;
        if bytes_read < buf.len() {
            buf[bytes_read..].fill(0);
        }
        Ok(buf)
    }

    /// Writes a raw page image as-is. Used by restore.
    pub fn write_raw(&mut self, page_id: PageId, raw: &[u8]) -> Result<()> {
        if raw.len() != self.header.page_size as usize {
            return Err(DirError::InvalidArgument(
                "raw page image does not match page size".into(),
            ));
        }
        let offset = self.page_offset(page_id)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(raw)?;
        if page_id >= self.header.total_pages {
            self.header.total_pages = page_id + 1;
        }
        Ok(())
    }

    fn decode_page(&self, page_id: PageId, raw: &[u8]) -> Result<Page> {
        if raw.len() < PAGE_HEADER_SIZE {
            return Err(DirError::Corrupted("page shorter than header".into()));
        }
        let stored_id = u64::from_le_bytes(raw[0..8].try_into().expect("slice is 8 bytes"));
        if stored_id != page_id {
            return Err(DirError::Corrupted(format!(
                "page {page_id} carries id {stored_id}"
            )));
        }
        let page_type = PageType::from_u8(raw[8])?;
        let flags = raw[9];
        let item_count = u16::from_le_bytes(raw[12..14].try_into().expect("slice is 2 bytes"));
        let free_space = u16::from_le_bytes(raw[14..16].try_into().expect("slice is 2 bytes"));
        let lsn = u64::from_le_bytes(raw[16..24].try_into().expect("slice is 8 bytes"));
        let checksum = u32::from_le_bytes(raw[24..28].try_into().expect("slice is 4 bytes"));
        let stored_payload = &raw[PAGE_HEADER_SIZE..];
        if hash(stored_payload) != checksum {
            return Err(DirError::ChecksumMismatch(format!(
                "page {page_id} payload checksum"
            )));
        }
        let payload = match &self.cipher {
            Some(cipher) => {
                let plain = cipher.open(&stored_payload[..self.payload_len() + SEAL_OVERHEAD])?;
                if plain.len() != self.payload_len() {
                    return Err(DirError::Corrupted(format!(
                        "page {page_id} decrypted to unexpected length"
                    )));
                }
                plain
            }
            None => stored_payload.to_vec(),
        };
        Ok(Page {
            id: page_id,
            page_type,
            flags,
            item_count,
            free_space,
            lsn,
            payload,
        })
    }

    fn write_header_page(&mut self) -> Result<()> {
        if self.opts.read_only {
            return Err(DirError::ReadOnly);
        }
        let mut buf = vec![0u8; self.header.page_size as usize];
        self.header.encode(&mut buf[..FILE_HEADER_REGION]);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf)?;
        if self.opts.sync_on_write {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn page_offset(&self, page_id: PageId) -> Result<u64> {
        page_id
            .checked_mul(u64::from(self.header.page_size))
            .ok_or_else(|| DirError::InvalidArgument("page offset overflow".into()))
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.opts.read_only {
            return Err(DirError::ReadOnly);
        }
        Ok(())
    }
}

impl PageIo for PageManager {
    fn read_page(&mut self, id: PageId) -> Result<Page> {
        self.read(id)
    }

    fn write_page(&mut self, page: Page) -> Result<()> {
        self.write(&page)
    }

    fn allocate_page(&mut self, page_type: PageType) -> Result<PageId> {
        self.allocate(page_type)
    }

    fn free_page(&mut self, id: PageId) -> Result<()> {
        self.free(id)
    }

    fn payload_len(&self) -> usize {
        PageManager::payload_len(self)
    }
}

/// A captured before-image, used to undo a page update on rollback.
#[derive(Debug, Clone)]
pub struct PageUndo {
    pub page_id: PageId,
    pub offset: u16,
    pub before: Vec<u8>,
}

/// The engine's I/O core: page manager, buffer pool, and WAL behind a single
/// lock so the WAL-before-page-flush rule is enforced in one place.
#[derive(Debug)]
pub struct IoState {
    pub pager: PageManager,
    pub pool: BufferPool,
    pub wal: Wal,
    undo_buffer: Vec<PageUndo>,
}

impl IoState {
    pub fn new(pager: PageManager, pool: BufferPool, wal: Wal) -> Self {
        Self {
            pager,
            pool,
            wal,
            undo_buffer: Vec::new(),
        }
    }

    /// Drains the before-images captured since the last call. The writer lock
    /// serializes mutators, so the buffer always belongs to one transaction.
    pub fn take_undo(&mut self) -> Vec<PageUndo> {
        std::mem::take(&mut self.undo_buffer)
    }

    /// Appends a page-update record carrying before and after images of the
    /// modified byte range. The record is durable only after [`sync_wal`].
    pub fn log_page_update(
        &mut self,
        tx_id: u64,
        page_id: PageId,
        offset: u16,
        before: &[u8],
        after: &[u8],
    ) -> Result<Lsn> {
        let lsn = self.wal.append(&WalRecord {
            kind: WalRecordKind::PageUpdate,
            lsn: 0,
            tx_id,
            page_id,
            before_off: offset,
            after_off: offset,
            before: before.to_vec(),
            after: after.to_vec(),
        })?;
        self.undo_buffer.push(PageUndo {
            page_id,
            offset,
            before: before.to_vec(),
        });
        Ok(lsn)
    }

    pub fn append_wal(&mut self, record: &WalRecord) -> Result<Lsn> {
        self.wal.append(record)
    }

    pub fn sync_wal(&mut self) -> Result<()> {
        self.wal.sync()
    }

    /// Writes every dirty pooled page through the pager and syncs the file.
    /// The WAL is synced first so no page image can outrun its log records.
    pub fn flush_all(&mut self) -> Result<()> {
        self.wal.sync()?;
        let Self { pager, pool, .. } = self;
        pool.flush_all(&mut |page| pager.write(page))?;
        pager.sync()
    }

    /// Drops a page from the pool without flushing (used when freeing).
    pub fn evict(&mut self, id: PageId) {
        self.pool.remove(id);
    }
}

impl PageIo for IoState {
    fn read_page(&mut self, id: PageId) -> Result<Page> {
        if let Some(page) = self.pool.get(id) {
            return Ok(page.clone());
        }
        let page = self.pager.read(id)?;
        let Self { pager, pool, wal, .. } = self;
        pool.put(page.clone(), false, &mut |evicted| {
            wal.sync()?;
            pager.write(evicted)
        })?;
        Ok(page)
    }

    fn write_page(&mut self, page: Page) -> Result<()> {
        self.pager.ensure_writable()?;
        let Self { pager, pool, wal, .. } = self;
        pool.put(page, true, &mut |evicted| {
            wal.sync()?;
            pager.write(evicted)
        })
    }

    fn allocate_page(&mut self, page_type: PageType) -> Result<PageId> {
        self.pager.allocate(page_type)
    }

    fn free_page(&mut self, id: PageId) -> Result<()> {
        self.pool.remove(id);
        self.pager.free(id)
    }

    fn payload_len(&self) -> usize {
        self.pager.payload_len()
    }
}
