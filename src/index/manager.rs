//! Attribute-index catalog.
//!
//! Each indexed attribute owns a B+ tree keyed by equality value, presence
//! marker, or value trigram. Entry mutations are diffed into staged index
//! operations which the transaction applies at commit. The catalog persists
//! to a chained-page blob whose root is mirrored in the file header.

use std::collections::{BTreeMap, BTreeSet};
use std::convert::TryInto;

use tracing::debug;

use crate::error::{DirError, Result};
use crate::index::blob;
use crate::index::btree::BTree;
use crate::model::{Entry, EntryRef};
use crate::pager::{PageId, PageIo};

const CATALOG_MAGIC: &[u8; 4] = b"OIDX";
const CATALOG_VERSION: u16 = 1;

/// Kind of attribute index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexKind {
    Equality,
    Presence,
    Substring,
}

impl IndexKind {
    fn as_u8(self) -> u8 {
        match self {
            Self::Equality => 0,
            Self::Presence => 1,
            Self::Substring => 2,
        }
    }

    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Equality),
            1 => Ok(Self::Presence),
            2 => Ok(Self::Substring),
            _ => Err(DirError::Corrupted(format!("unknown index kind {value}"))),
        }
    }
}

/// One staged index mutation, applied at commit.
#[derive(Debug, Clone)]
pub struct StagedIndexOp {
    pub attribute: String,
    pub kind: IndexKind,
    pub key: Vec<u8>,
    pub entry: EntryRef,
    pub insert: bool,
}

/// Catalog of attribute indexes.
#[derive(Debug, Default)]
pub struct IndexManager {
    indexes: BTreeMap<(String, IndexKind), BTree>,
    dirty: bool,
    root_page: PageId,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty index for `(attribute, kind)`.
    pub fn create_index(
        &mut self,
        io: &mut dyn PageIo,
        attribute: &str,
        kind: IndexKind,
    ) -> Result<()> {
        let attribute = attribute.trim().to_ascii_lowercase();
        let key = (attribute.clone(), kind);
        if self.indexes.contains_key(&key) {
            return Err(DirError::AlreadyExists(format!(
                "{kind:?} index on {attribute}"
            )));
        }
        let tree = BTree::create(io)?;
        self.indexes.insert(key, tree);
        self.dirty = true;
        Ok(())
    }

    /// Drops an index and frees its pages.
    pub fn drop_index(
        &mut self,
        io: &mut dyn PageIo,
        attribute: &str,
        kind: IndexKind,
    ) -> Result<()> {
        let attribute = attribute.trim().to_ascii_lowercase();
        let tree = self
            .indexes
            .remove(&(attribute, kind))
            .ok_or(DirError::NotFound("index"))?;
        tree.free_pages(io)?;
        self.dirty = true;
        Ok(())
    }

    pub fn has_index(&self, attribute: &str, kind: IndexKind) -> bool {
        self.indexes
            .contains_key(&(attribute.trim().to_ascii_lowercase(), kind))
    }

    pub fn list(&self) -> Vec<(String, IndexKind)> {
        self.indexes.keys().cloned().collect()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page
    }

    /// Diffs an entry mutation into staged operations for every affected
    /// index. `old`/`new` are `(entry, backing ref)` pairs; deletion passes
    /// `new = None`, insertion `old = None`.
    pub fn plan_change(
        &self,
        old: Option<(&Entry, EntryRef)>,
        new: Option<(&Entry, EntryRef)>,
    ) -> Vec<StagedIndexOp> {
        let mut ops = Vec::new();
        for ((attribute, kind), _) in &self.indexes {
            let old_keys = old
                .map(|(entry, _)| index_keys(entry, attribute, *kind))
                .unwrap_or_default();
            let new_keys = new
                .map(|(entry, _)| index_keys(entry, attribute, *kind))
                .unwrap_or_default();
            let refs_equal = match (old, new) {
                (Some((_, a)), Some((_, b))) => a == b,
                _ => false,
            };
            if let Some((_, old_ref)) = old {
                for key in &old_keys {
                    if refs_equal && new_keys.contains(key) {
                        continue;
                    }
                    ops.push(StagedIndexOp {
                        attribute: attribute.clone(),
                        kind: *kind,
                        key: key.clone(),
                        entry: old_ref,
                        insert: false,
                    });
                }
            }
            if let Some((_, new_ref)) = new {
                for key in &new_keys {
                    if refs_equal && old_keys.contains(key) {
                        continue;
                    }
                    ops.push(StagedIndexOp {
                        attribute: attribute.clone(),
                        kind: *kind,
                        key: key.clone(),
                        entry: new_ref,
                        insert: true,
                    });
                }
            }
        }
        ops
    }

    /// Applies staged operations to the trees. Delete misses are tolerated
    /// (the index may have been created after the entry).
    pub fn apply_ops(&mut self, io: &mut dyn PageIo, ops: &[StagedIndexOp]) -> Result<()> {
        for op in ops {
            let tree = match self
                .indexes
                .get_mut(&(op.attribute.clone(), op.kind))
            {
                Some(tree) => tree,
                None => continue,
            };
            if op.insert {
                tree.insert(io, &op.key, op.entry)?;
            } else {
                match tree.delete(io, &op.key, op.entry) {
                    Ok(()) => {}
                    Err(DirError::NotFound(_)) => {
                        debug!(attribute = %op.attribute, "index delete found no posting");
                    }
                    Err(err) => return Err(err),
                }
            }
            self.dirty = true;
        }
        Ok(())
    }

    /// Exact-value candidates from an equality index.
    pub fn search_equality(
        &self,
        io: &mut dyn PageIo,
        attribute: &str,
        value: &[u8],
    ) -> Result<Vec<EntryRef>> {
        let attribute = attribute.trim().to_ascii_lowercase();
        let tree = self
            .indexes
            .get(&(attribute, IndexKind::Equality))
            .ok_or(DirError::NotFound("index"))?;
        tree.search(io, &value.to_ascii_lowercase())
    }

    /// Every ref recorded by a presence index.
    pub fn search_presence(&self, io: &mut dyn PageIo, attribute: &str) -> Result<Vec<EntryRef>> {
        let attribute = attribute.trim().to_ascii_lowercase();
        let tree = self
            .indexes
            .get(&(attribute.clone(), IndexKind::Presence))
            .ok_or(DirError::NotFound("index"))?;
        tree.search(io, attribute.as_bytes())
    }

    /// Candidate refs for a wildcard pattern from a substring index: the
    /// intersection of the postings of every trigram extracted from the
    /// pattern's literal fragments. Candidates are a superset; the caller
    /// verifies each against the full pattern.
    pub fn search_substring(
        &self,
        io: &mut dyn PageIo,
        attribute: &str,
        pattern: &[u8],
    ) -> Result<Vec<EntryRef>> {
        let attribute = attribute.trim().to_ascii_lowercase();
        let tree = self
            .indexes
            .get(&(attribute, IndexKind::Substring))
            .ok_or(DirError::NotFound("index"))?;
        let grams = pattern_trigrams(pattern);
        if grams.is_empty() {
            // Too little literal text to prune; hand back every posting.
            let mut cursor = tree.range(io, None, None)?;
            let mut refs = BTreeSet::new();
            while let Some((_, entry)) = cursor.next(io)? {
                refs.insert(entry);
            }
            return Ok(refs.into_iter().collect());
        }
        let mut intersection: Option<BTreeSet<EntryRef>> = None;
        for gram in grams {
            let postings: BTreeSet<EntryRef> = tree.search(io, &gram)?.into_iter().collect();
            intersection = Some(match intersection {
                Some(acc) => acc.intersection(&postings).copied().collect(),
                None => postings,
            });
            if intersection.as_ref().map(BTreeSet::is_empty).unwrap_or(false) {
                break;
            }
        }
        Ok(intersection.unwrap_or_default().into_iter().collect())
    }

    /// Serializes the catalog (attribute, kind, tree root) into a page blob.
    pub fn persist(&mut self, io: &mut dyn PageIo) -> Result<PageId> {
        let mut image = Vec::new();
        image.extend_from_slice(CATALOG_MAGIC);
        image.extend_from_slice(&CATALOG_VERSION.to_le_bytes());
        image.extend_from_slice(&[0u8; 2]);
        image.extend_from_slice(&(self.indexes.len() as u64).to_le_bytes());
        for ((attribute, kind), tree) in &self.indexes {
            image.extend_from_slice(&(attribute.len() as u16).to_le_bytes());
            image.extend_from_slice(attribute.as_bytes());
            image.push(kind.as_u8());
            image.extend_from_slice(&tree.root_page().to_le_bytes());
        }
        let root = blob::write_blob(io, &image, self.root_page)?;
        self.root_page = root;
        self.dirty = false;
        Ok(root)
    }

    /// Reloads the catalog from its persisted blob.
    pub fn load(io: &mut dyn PageIo, root_page: PageId) -> Result<Self> {
        let mut manager = Self::new();
        if root_page == 0 {
            return Ok(manager);
        }
        let image = blob::read_blob(io, root_page)?;
        if image.len() < 16 || &image[0..4] != CATALOG_MAGIC {
            return Err(DirError::Corrupted("index catalog magic mismatch".into()));
        }
        let version = u16::from_le_bytes(image[4..6].try_into().expect("slice is 2 bytes"));
        if version != CATALOG_VERSION {
            return Err(DirError::UnsupportedFormat(format!(
                "index catalog version {version}"
            )));
        }
        let count = u64::from_le_bytes(image[8..16].try_into().expect("slice is 8 bytes"));
        let mut pos = 16usize;
        for _ in 0..count {
            if pos + 2 > image.len() {
                return Err(DirError::Corrupted("index catalog truncated".into()));
            }
            let attr_len =
                u16::from_le_bytes(image[pos..pos + 2].try_into().expect("2 bytes")) as usize;
            pos += 2;
            if pos + attr_len + 9 > image.len() {
                return Err(DirError::Corrupted("index catalog truncated".into()));
            }
            let attribute = String::from_utf8(image[pos..pos + attr_len].to_vec())
                .map_err(|_| DirError::Corrupted("index attribute is not UTF-8".into()))?;
            pos += attr_len;
            let kind = IndexKind::from_u8(image[pos])?;
            pos += 1;
            let root = u64::from_le_bytes(image[pos..pos + 8].try_into().expect("8 bytes"));
            pos += 8;
            manager.indexes.insert((attribute, kind), BTree::open(root));
        }
        manager.root_page = root_page;
        manager.dirty = false;
        Ok(manager)
    }

    /// Drops every tree, tolerating free failures on damaged trees (the
    /// caller is rebuilding anyway). Returns the catalog so the caller can
    /// recreate the same indexes.
    pub fn clear(&mut self, io: &mut dyn PageIo) -> Vec<(String, IndexKind)> {
        let kinds = self.list();
        let indexes = std::mem::take(&mut self.indexes);
        for ((attribute, _), tree) in indexes {
            if let Err(err) = tree.free_pages(io) {
                debug!(%attribute, %err, "leaking index pages during rebuild");
            }
        }
        self.dirty = true;
        kinds
    }

    /// Structural check of one index tree (integrity sweeps).
    pub fn validate_tree(
        &self,
        io: &mut dyn PageIo,
        attribute: &str,
        kind: IndexKind,
    ) -> Result<()> {
        let tree = self
            .indexes
            .get(&(attribute.trim().to_ascii_lowercase(), kind))
            .ok_or(DirError::NotFound("index"))?;
        tree.validate(io)
    }

    /// Inserts one entry's keys into a single index (index backfill).
    pub fn add_entry_keys(
        &mut self,
        io: &mut dyn PageIo,
        attribute: &str,
        kind: IndexKind,
        entry: &Entry,
        entry_ref: EntryRef,
    ) -> Result<()> {
        let attribute = attribute.trim().to_ascii_lowercase();
        let keys = index_keys(entry, &attribute, kind);
        let tree = self
            .indexes
            .get_mut(&(attribute, kind))
            .ok_or(DirError::NotFound("index"))?;
        for key in keys {
            tree.insert(io, &key, entry_ref)?;
        }
        self.dirty = true;
        Ok(())
    }
}

/// Index keys an entry produces for one `(attribute, kind)`.
fn index_keys(entry: &Entry, attribute: &str, kind: IndexKind) -> BTreeSet<Vec<u8>> {
    let mut keys = BTreeSet::new();
    let values = match entry.values(attribute) {
        Some(values) => values,
        None => return keys,
    };
    match kind {
        IndexKind::Equality => {
            for value in values {
                if !value.is_empty() {
                    keys.insert(value.to_ascii_lowercase());
                }
            }
        }
        IndexKind::Presence => {
            keys.insert(attribute.as_bytes().to_vec());
        }
        IndexKind::Substring => {
            for value in values {
                for gram in trigrams(value) {
                    keys.insert(gram.to_vec());
                }
            }
        }
    }
    keys
}

/// Unique lower-cased trigrams of a value. Pure; exercised in isolation.
pub fn trigrams(value: &[u8]) -> BTreeSet<[u8; 3]> {
    let lowered = value.to_ascii_lowercase();
    lowered
        .windows(3)
        .map(|w| [w[0], w[1], w[2]])
        .collect()
}

/// Trigrams of the literal (non-wildcard) fragments of a `*` pattern.
pub fn pattern_trigrams(pattern: &[u8]) -> BTreeSet<[u8; 3]> {
    let mut grams = BTreeSet::new();
    for fragment in pattern.split(|&b| b == b'*') {
        grams.extend(trigrams(fragment));
    }
    grams
}
