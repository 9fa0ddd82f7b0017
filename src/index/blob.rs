//! Chained-page blob storage for persisted index images.
//!
//! A blob is split across attribute-index pages linked head-to-tail. Each
//! page payload is `next_page(u64) | chunk_len(u32) | bytes`. Used by the DN
//! radix image and the attribute-index catalog; their root page ids are
//! mirrored in the file header.

use std::convert::TryInto;

use crate::error::{DirError, Result};
use crate::pager::{Page, PageId, PageIo, PageType};

const CHUNK_HEADER: usize = 12;

/// Writes `data` into a fresh page chain and returns its root. The previous
/// chain (if any) is freed first so checkpoints do not leak pages.
pub(crate) fn write_blob(io: &mut dyn PageIo, data: &[u8], old_root: PageId) -> Result<PageId> {
    if old_root != 0 {
        free_blob(io, old_root)?;
    }
    let chunk_cap = io.payload_len() - CHUNK_HEADER;
    let mut chunks: Vec<&[u8]> = data.chunks(chunk_cap).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }
    // Allocate every page first so each chunk can point at its successor.
    let mut page_ids = Vec::with_capacity(chunks.len());
    for _ in 0..chunks.len() {
        page_ids.push(io.allocate_page(PageType::AttrIndex)?);
    }
    for (idx, chunk) in chunks.iter().enumerate() {
        let mut page = Page::new(page_ids[idx], PageType::AttrIndex, io.payload_len());
        let next = page_ids.get(idx + 1).copied().unwrap_or(0);
        page.payload[0..8].copy_from_slice(&next.to_le_bytes());
        page.payload[8..12].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
        page.payload[CHUNK_HEADER..CHUNK_HEADER + chunk.len()].copy_from_slice(chunk);
        page.item_count = 1;
        io.write_page(page)?;
    }
    Ok(page_ids[0])
}

/// Reads a blob written by [`write_blob`].
pub(crate) fn read_blob(io: &mut dyn PageIo, root: PageId) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut cursor = root;
    let mut hops = 0u64;
    while cursor != 0 {
        hops += 1;
        if hops > 1 << 24 {
            return Err(DirError::Corrupted("blob page chain contains a cycle".into()));
        }
        let page = io.read_page(cursor)?;
        if page.page_type != PageType::AttrIndex {
            return Err(DirError::Corrupted(format!(
                "blob chain page {cursor} has wrong type"
            )));
        }
        let next = u64::from_le_bytes(page.payload[0..8].try_into().expect("slice is 8 bytes"));
        let len =
            u32::from_le_bytes(page.payload[8..12].try_into().expect("slice is 4 bytes")) as usize;
        if CHUNK_HEADER + len > page.payload.len() {
            return Err(DirError::Corrupted("blob chunk length out of range".into()));
        }
        data.extend_from_slice(&page.payload[CHUNK_HEADER..CHUNK_HEADER + len]);
        cursor = next;
    }
    Ok(data)
}

/// Frees every page of a blob chain.
pub(crate) fn free_blob(io: &mut dyn PageIo, root: PageId) -> Result<()> {
    let mut cursor = root;
    while cursor != 0 {
        let page = io.read_page(cursor)?;
        let next = u64::from_le_bytes(page.payload[0..8].try_into().expect("slice is 8 bytes"));
        io.free_page(cursor)?;
        cursor = next;
    }
    Ok(())
}
