//! Data model for directory entries.
//!
//! The primary key of the store is a distinguished name (DN): a comma
//! separated sequence of `attribute=value` components (RDNs), compared
//! case-insensitively on ASCII with surrounding whitespace trimmed. Values are
//! typed multi-valued attribute records: a mapping from lower-case attribute
//! name to an ordered sequence of binary values.
//!
//! # Key Types
//!
//! - [`Entry`] - A directory entry: normalized DN plus attributes
//! - [`EntryRef`] - The `(page_id, slot_id)` pair locating an entry's bytes
//! - [`Scope`] - Search scope for hierarchical lookup

use std::collections::BTreeMap;
use std::convert::TryInto;

use crate::error::{DirError, Result};

/// Maximum length in bytes of a serialized DN.
pub const MAX_DN_LEN: usize = 4096;

/// Location of an entry's bytes in the page file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryRef {
    pub page_id: u64,
    pub slot_id: u16,
}

impl EntryRef {
    pub const fn new(page_id: u64, slot_id: u16) -> Self {
        Self { page_id, slot_id }
    }
}

/// Search scope for hierarchical DN lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The base entry itself.
    Base,
    /// Immediate children of the base (exactly one additional RDN).
    OneLevel,
    /// The base entry and all of its descendants.
    Subtree,
}

/// Predicate applied to candidate entries during filter search.
///
/// The filter evaluator lives outside the engine; it plugs in through this
/// trait. Closures implement it for free.
pub trait FilterMatcher {
    fn matches(&self, entry: &Entry) -> bool;
}

impl<F: Fn(&Entry) -> bool> FilterMatcher for F {
    fn matches(&self, entry: &Entry) -> bool {
        self(entry)
    }
}

/// A directory entry: a normalized DN and its attributes.
///
/// Attribute names are stored lower-cased; each attribute holds an ordered
/// sequence of opaque binary values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub dn: String,
    pub attributes: BTreeMap<String, Vec<Vec<u8>>>,
}

impl Entry {
    /// Creates an empty entry for `dn`, normalizing it.
    pub fn new(dn: &str) -> Self {
        Self {
            dn: normalize_dn(dn),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds one value to `attr` (name lower-cased), preserving value order.
    pub fn add_value(&mut self, attr: &str, value: impl Into<Vec<u8>>) -> &mut Self {
        self.attributes
            .entry(attr.trim().to_ascii_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    /// Convenience for string-valued attributes.
    pub fn with_str(mut self, attr: &str, value: &str) -> Self {
        self.add_value(attr, value.as_bytes().to_vec());
        self
    }

    pub fn values(&self, attr: &str) -> Option<&[Vec<u8>]> {
        self.attributes
            .get(&attr.trim().to_ascii_lowercase())
            .map(|v| v.as_slice())
    }

    pub fn has_attribute(&self, attr: &str) -> bool {
        self.attributes
            .contains_key(&attr.trim().to_ascii_lowercase())
    }
}

/// Normalizes a DN: trims surrounding whitespace, lower-cases ASCII, and
/// trims whitespace around each comma-separated RDN.
pub fn normalize_dn(dn: &str) -> String {
    dn.trim()
        .split(',')
        .map(|rdn| rdn.trim().to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}

/// Splits a normalized DN into its RDN components, leaf-first.
pub fn dn_components(dn: &str) -> Vec<&str> {
    if dn.is_empty() {
        return Vec::new();
    }
    dn.split(',').collect()
}

/// Builds the hierarchical key for a normalized DN: RDN components reversed
/// and re-joined, so that descendants of a base share the base's key as a
/// prefix and byte order equals hierarchical order.
///
/// `uid=a,ou=users,dc=example` becomes `dc=example,ou=users,uid=a`.
pub fn hierarchical_key(dn: &str) -> Vec<u8> {
    let mut components = dn_components(dn);
    components.reverse();
    components.join(",").into_bytes()
}

/// Inverse of [`hierarchical_key`].
pub fn dn_from_hierarchical_key(key: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(key)
        .map_err(|_| DirError::Corrupted("hierarchical key is not valid UTF-8".into()))?;
    let mut components = dn_components(text);
    components.reverse();
    Ok(components.join(","))
}

/// Serializes an entry into the wire layout:
/// `dn_len(u32) | dn | attr_count(u32) |
///  repeated[name_len(u16) | name | value_count(u32) | repeated[value_len(u32) | value]]`
/// (all little-endian).
pub fn serialize_entry(entry: &Entry) -> Result<Vec<u8>> {
    let dn = entry.dn.as_bytes();
    if dn.len() > MAX_DN_LEN {
        return Err(DirError::InvalidArgument(format!(
            "DN of {} bytes exceeds maximum of {MAX_DN_LEN}",
            dn.len()
        )));
    }
    let mut buf = Vec::with_capacity(64 + dn.len());
    buf.extend_from_slice(&(dn.len() as u32).to_le_bytes());
    buf.extend_from_slice(dn);
    buf.extend_from_slice(&(entry.attributes.len() as u32).to_le_bytes());
    for (name, values) in &entry.attributes {
        let name_len = u16::try_from(name.len())
            .map_err(|_| DirError::InvalidArgument("attribute name exceeds u16::MAX".into()))?;
        buf.extend_from_slice(&name_len.to_le_bytes());
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
        for value in values {
            let value_len = u32::try_from(value.len()).map_err(|_| {
                DirError::InvalidArgument("attribute value exceeds u32::MAX".into())
            })?;
            buf.extend_from_slice(&value_len.to_le_bytes());
            buf.extend_from_slice(value);
        }
    }
    Ok(buf)
}

/// Deserializes an entry from the wire layout produced by [`serialize_entry`].
pub fn deserialize_entry(data: &[u8]) -> Result<Entry> {
    let mut cursor = Cursor::new(data);
    let dn_len = cursor.read_u32()? as usize;
    let dn_bytes = cursor.read_bytes(dn_len)?;
    let dn = String::from_utf8(dn_bytes.to_vec())
        .map_err(|_| DirError::Corrupted("entry DN is not valid UTF-8".into()))?;
    let attr_count = cursor.read_u32()? as usize;
    let mut attributes = BTreeMap::new();
    for _ in 0..attr_count {
        let name_len = cursor.read_u16()? as usize;
        let name_bytes = cursor.read_bytes(name_len)?;
        let name = String::from_utf8(name_bytes.to_vec())
            .map_err(|_| DirError::Corrupted("attribute name is not valid UTF-8".into()))?;
        let value_count = cursor.read_u32()? as usize;
        let mut values = Vec::with_capacity(value_count.min(64));
        for _ in 0..value_count {
            let value_len = cursor.read_u32()? as usize;
            values.push(cursor.read_bytes(value_len)?.to_vec());
        }
        attributes.insert(name, values);
    }
    Ok(Entry { dn, attributes })
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| DirError::Corrupted("entry length overflow".into()))?;
        if end > self.data.len() {
            return Err(DirError::Corrupted("entry record truncated".into()));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes: [u8; 2] = self
            .read_bytes(2)?
            .try_into()
            .map_err(|_| DirError::Corrupted("failed to read u16 from entry record".into()))?;
        Ok(u16::from_le_bytes(bytes))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self
            .read_bytes(4)?
            .try_into()
            .map_err(|_| DirError::Corrupted("failed to read u32 from entry record".into()))?;
        Ok(u32::from_le_bytes(bytes))
    }
}
