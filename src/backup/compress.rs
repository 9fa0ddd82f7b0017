//! Block compression for backup archives.
//!
//! LZ4-style byte stream: each sequence is a token byte whose high nibble is
//! the literal run length and low nibble the match length minus 4, optional
//! extended length bytes (a value of 255 means another byte follows), the
//! literals, and a little-endian u16 match offset. Matches are at least 4 and
//! at most 259 bytes, offsets at most 65535. The final sequence carries
//! literals only.
//!
//! Archives frame the stream as repeated `(raw_size u32, compressed_size
//! u32, bytes)` blocks terminated by a zero pair; a block whose compressed
//! size equals its raw size is stored uncompressed.

use std::collections::HashMap;
use std::convert::TryInto;

use crate::error::{DirError, Result};

/// Uncompressed block size used when framing a stream.
pub const BLOCK_SIZE: usize = 64 * 1024;
const MIN_MATCH: usize = 4;
const MAX_MATCH: usize = 259;
const MAX_OFFSET: usize = 65535;

/// Compresses one block. The output is never larger than worst-case
/// literals-only framing; callers store the raw block when that wins.
pub fn compress_block(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() / 2 + 16);
    let mut table: HashMap<[u8; 4], usize> = HashMap::new();
    let mut pos = 0usize;
    let mut literal_start = 0usize;

    while pos + MIN_MATCH <= input.len() {
        let seq: [u8; 4] = input[pos..pos + 4].try_into().expect("slice is 4 bytes");
        let candidate = table.insert(seq, pos);
        if let Some(cand) = candidate {
            let distance = pos - cand;
            if distance <= MAX_OFFSET {
                let mut len = MIN_MATCH;
                while pos + len < input.len()
                    && len < MAX_MATCH
                    && input[cand + len] == input[pos + len]
                {
                    len += 1;
                }
                emit_sequence(&mut out, &input[literal_start..pos], distance as u16, len);
                pos += len;
                literal_start = pos;
                continue;
            }
        }
        pos += 1;
    }
    emit_literals_only(&mut out, &input[literal_start..]);
    out
}

fn emit_length(out: &mut Vec<u8>, mut extra: usize) {
    while extra >= 255 {
        out.push(255);
        extra -= 255;
    }
    out.push(extra as u8);
}

fn emit_sequence(out: &mut Vec<u8>, literals: &[u8], offset: u16, match_len: usize) {
    let lit_len = literals.len();
    let lit_nibble = lit_len.min(15);
    let match_code = match_len - MIN_MATCH;
    let match_nibble = match_code.min(15);
    out.push(((lit_nibble as u8) << 4) | match_nibble as u8);
    if lit_nibble == 15 {
        emit_length(out, lit_len - 15);
    }
    out.extend_from_slice(literals);
    out.extend_from_slice(&offset.to_le_bytes());
    if match_nibble == 15 {
        emit_length(out, match_code - 15);
    }
}

fn emit_literals_only(out: &mut Vec<u8>, literals: &[u8]) {
    if literals.is_empty() {
        return;
    }
    let lit_len = literals.len();
    let lit_nibble = lit_len.min(15);
    out.push((lit_nibble as u8) << 4);
    if lit_nibble == 15 {
        emit_length(out, lit_len - 15);
    }
    out.extend_from_slice(literals);
}

fn read_length(input: &[u8], pos: &mut usize) -> Result<usize> {
    let mut total = 0usize;
    loop {
        let byte = *input
            .get(*pos)
            .ok_or_else(|| DirError::Corrupted("compressed block length truncated".into()))?;
        *pos += 1;
        total += byte as usize;
        if byte != 255 {
            return Ok(total);
        }
    }
}

/// Decompresses one block produced by [`compress_block`].
pub fn decompress_block(input: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len);
    let mut pos = 0usize;
    while pos < input.len() {
        let token = input[pos];
        pos += 1;
        let mut lit_len = (token >> 4) as usize;
        if lit_len == 15 {
            lit_len += read_length(input, &mut pos)?;
        }
        if pos + lit_len > input.len() {
            return Err(DirError::Corrupted("compressed literals truncated".into()));
        }
        out.extend_from_slice(&input[pos..pos + lit_len]);
        pos += lit_len;
        if pos >= input.len() {
            break;
        }
        if pos + 2 > input.len() {
            return Err(DirError::Corrupted("compressed match offset truncated".into()));
        }
        let offset = u16::from_le_bytes(input[pos..pos + 2].try_into().expect("2 bytes")) as usize;
        pos += 2;
        if offset == 0 || offset > out.len() {
            return Err(DirError::Corrupted("compressed match offset invalid".into()));
        }
        let mut match_len = (token & 0x0F) as usize;
        if match_len == 15 {
            match_len += read_length(input, &mut pos)?;
        }
        match_len += MIN_MATCH;
        // Byte-wise copy: overlapping matches replicate recent output.
        let start = out.len() - offset;
        for i in 0..match_len {
            let byte = out[start + i];
            out.push(byte);
        }
    }
    if out.len() != expected_len {
        return Err(DirError::Corrupted(format!(
            "decompressed {} bytes, expected {expected_len}",
            out.len()
        )));
    }
    Ok(out)
}

/// Frames and compresses `data` block by block.
pub fn compress_stream(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    for chunk in data.chunks(BLOCK_SIZE) {
        let compressed = compress_block(chunk);
        if compressed.len() >= chunk.len() {
            out.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
            out.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
            out.extend_from_slice(chunk);
        } else {
            out.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
            out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
            out.extend_from_slice(&compressed);
        }
    }
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

/// Reverses [`compress_stream`].
pub fn decompress_stream(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    loop {
        if pos + 8 > data.len() {
            return Err(DirError::Corrupted("compressed stream truncated".into()));
        }
        let raw_size =
            u32::from_le_bytes(data[pos..pos + 4].try_into().expect("4 bytes")) as usize;
        let comp_size =
            u32::from_le_bytes(data[pos + 4..pos + 8].try_into().expect("4 bytes")) as usize;
        pos += 8;
        if raw_size == 0 && comp_size == 0 {
            return Ok(out);
        }
        if pos + comp_size > data.len() {
            return Err(DirError::Corrupted("compressed block truncated".into()));
        }
        let block = &data[pos..pos + comp_size];
        pos += comp_size;
        if comp_size == raw_size {
            out.extend_from_slice(block);
        } else {
            out.extend_from_slice(&decompress_block(block, raw_size)?);
        }
    }
}
