//! Hierarchical DN index: a compressed byte-wise radix tree.
//!
//! Keys are hierarchical forms of normalized DNs (RDN components reversed,
//! see [`crate::model::hierarchical_key`]), so every descendant of a base DN
//! shares the base's key plus a comma as a prefix, and byte order over keys
//! equals hierarchical DN order. Each stored DN carries one entry ref.
//!
//! The tree lives in memory and is persisted as a key/ref image into a
//! chained-page blob at checkpoint; the root page id is mirrored in the file
//! header.

use std::collections::BTreeMap;
use std::convert::TryInto;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{DirError, Result};
use crate::index::blob;
use crate::model::{dn_from_hierarchical_key, hierarchical_key, EntryRef, Scope};
use crate::pager::{PageId, PageIo};

const IMAGE_MAGIC: &[u8; 4] = b"ODNI";
const IMAGE_VERSION: u16 = 1;

#[derive(Debug, Default)]
struct RadixNode {
    value: Option<EntryRef>,
    children: BTreeMap<u8, Child>,
}

#[derive(Debug)]
struct Child {
    edge: Vec<u8>,
    node: RadixNode,
}

enum Location<'a> {
    /// The key ends exactly on a node.
    Exact(&'a RadixNode),
    /// The key ends inside an edge; the remainder of the edge follows it.
    MidEdge(&'a [u8]),
    Missing,
}

/// The DN index.
#[derive(Debug)]
pub struct RadixTree {
    root: RadixNode,
    len: usize,
    dirty: bool,
    root_page: PageId,
}

impl Default for RadixTree {
    fn default() -> Self {
        Self::new()
    }
}

impl RadixTree {
    pub fn new() -> Self {
        Self {
            root: RadixNode::default(),
            len: 0,
            dirty: false,
            root_page: 0,
        }
    }

    /// Number of stored DNs.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when the in-memory tree has diverged from its persisted image.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Root page of the persisted image (0 when never persisted).
    pub fn root_page_id(&self) -> PageId {
        self.root_page
    }

    /// Maps a DN to its entry ref. Duplicate DNs are rejected.
    pub fn insert(&mut self, dn: &str, entry: EntryRef) -> Result<()> {
        let key = hierarchical_key(dn);
        if key.is_empty() {
            return Err(DirError::KeyEmpty);
        }
        insert_into(&mut self.root, &key, entry).map_err(|_| {
            DirError::AlreadyExists(format!("entry {dn}"))
        })?;
        self.len += 1;
        self.dirty = true;
        Ok(())
    }

    pub fn lookup(&self, dn: &str) -> Option<EntryRef> {
        let key = hierarchical_key(dn);
        match self.locate(&key) {
            Location::Exact(node) => node.value,
            _ => None,
        }
    }

    /// Replaces the ref stored for an existing DN.
    pub fn update(&mut self, dn: &str, entry: EntryRef) -> Result<()> {
        let key = hierarchical_key(dn);
        if update_in(&mut self.root, &key, entry) {
            self.dirty = true;
            Ok(())
        } else {
            Err(DirError::NotFound("entry"))
        }
    }

    pub fn remove(&mut self, dn: &str) -> Option<EntryRef> {
        let key = hierarchical_key(dn);
        let removed = remove_from(&mut self.root, &key);
        if removed.is_some() {
            self.len -= 1;
            self.dirty = true;
        }
        removed
    }

    /// True when any stored DN is a descendant of `dn`.
    pub fn has_children(&self, dn: &str) -> bool {
        let key = hierarchical_key(dn);
        match self.locate(&key) {
            Location::Exact(node) => node.children.contains_key(&b','),
            Location::MidEdge(remainder) => remainder.first() == Some(&b','),
            Location::Missing => false,
        }
    }

    /// Lazy scoped iteration over (DN, ref) pairs in hierarchical order.
    pub fn iterate(&self, base_dn: &str, scope: Scope) -> RadixCursor {
        RadixCursor::new(hierarchical_key(base_dn), scope)
    }

    /// Smallest terminal key strictly greater than `after`.
    fn successor(&self, after: &[u8]) -> Option<(Vec<u8>, EntryRef)> {
        let mut acc = Vec::new();
        successor_in(&self.root, &mut acc, after)
    }

    /// Every stored (DN, ref) pair in hierarchical order.
    pub fn collect_all(&self) -> Result<Vec<(String, EntryRef)>> {
        let mut pairs = Vec::with_capacity(self.len);
        let mut acc = Vec::new();
        collect_pairs(&self.root, &mut acc, &mut pairs);
        pairs
            .into_iter()
            .map(|(key, entry)| Ok((dn_from_hierarchical_key(&key)?, entry)))
            .collect()
    }

    fn locate(&self, key: &[u8]) -> Location<'_> {
        let mut node = &self.root;
        let mut pos = 0usize;
        loop {
            if pos == key.len() {
                return Location::Exact(node);
            }
            let child = match node.children.get(&key[pos]) {
                Some(child) => child,
                None => return Location::Missing,
            };
            let edge = child.edge.as_slice();
            let rest = &key[pos..];
            if rest.len() < edge.len() {
                return if edge.starts_with(rest) {
                    Location::MidEdge(&edge[rest.len()..])
                } else {
                    Location::Missing
                };
            }
            if !rest.starts_with(edge) {
                return Location::Missing;
            }
            pos += edge.len();
            node = &child.node;
        }
    }

    /// Serializes the key/ref image and writes it into a fresh page chain,
    /// freeing the previous one. Returns the new root page id.
    pub fn persist(&mut self, io: &mut dyn PageIo) -> Result<PageId> {
        let mut pairs = Vec::with_capacity(self.len);
        let mut acc = Vec::new();
        collect_pairs(&self.root, &mut acc, &mut pairs);

        let mut image = Vec::with_capacity(16 + pairs.len() * 32);
        image.extend_from_slice(IMAGE_MAGIC);
        image.extend_from_slice(&IMAGE_VERSION.to_le_bytes());
        image.extend_from_slice(&[0u8; 2]);
        image.extend_from_slice(&(pairs.len() as u64).to_le_bytes());
        for (key, entry) in &pairs {
            image.extend_from_slice(&(key.len() as u16).to_le_bytes());
            image.extend_from_slice(key);
            image.extend_from_slice(&entry.page_id.to_le_bytes());
            image.extend_from_slice(&entry.slot_id.to_le_bytes());
        }
        let root = blob::write_blob(io, &image, self.root_page)?;
        self.root_page = root;
        self.dirty = false;
        Ok(root)
    }

    /// Rebuilds the tree from a persisted image.
    pub fn load(io: &mut dyn PageIo, root_page: PageId) -> Result<Self> {
        let mut tree = Self::new();
        if root_page == 0 {
            return Ok(tree);
        }
        let image = blob::read_blob(io, root_page)?;
        if image.len() < 16 || &image[0..4] != IMAGE_MAGIC {
            return Err(DirError::Corrupted("DN index image magic mismatch".into()));
        }
        let version = u16::from_le_bytes(image[4..6].try_into().expect("slice is 2 bytes"));
        if version != IMAGE_VERSION {
            return Err(DirError::UnsupportedFormat(format!(
                "DN index image version {version}"
            )));
        }
        let count = u64::from_le_bytes(image[8..16].try_into().expect("slice is 8 bytes"));
        let mut pos = 16usize;
        for _ in 0..count {
            if pos + 2 > image.len() {
                return Err(DirError::Corrupted("DN index image truncated".into()));
            }
            let key_len =
                u16::from_le_bytes(image[pos..pos + 2].try_into().expect("2 bytes")) as usize;
            pos += 2;
            if pos + key_len + 10 > image.len() {
                return Err(DirError::Corrupted("DN index image truncated".into()));
            }
            let key = image[pos..pos + key_len].to_vec();
            pos += key_len;
            let page_id = u64::from_le_bytes(image[pos..pos + 8].try_into().expect("8 bytes"));
            let slot_id =
                u16::from_le_bytes(image[pos + 8..pos + 10].try_into().expect("2 bytes"));
            pos += 10;
            let dn = dn_from_hierarchical_key(&key)?;
            tree.insert(&dn, EntryRef::new(page_id, slot_id))?;
        }
        tree.root_page = root_page;
        tree.dirty = false;
        Ok(tree)
    }
}

fn insert_into(node: &mut RadixNode, key: &[u8], entry: EntryRef) -> std::result::Result<(), ()> {
    if key.is_empty() {
        if node.value.is_some() {
            return Err(());
        }
        node.value = Some(entry);
        return Ok(());
    }
    let first = key[0];
    match node.children.get_mut(&first) {
        None => {
            node.children.insert(
                first,
                Child {
                    edge: key.to_vec(),
                    node: RadixNode {
                        value: Some(entry),
                        children: BTreeMap::new(),
                    },
                },
            );
            Ok(())
        }
        Some(child) => {
            let common = common_prefix(&child.edge, key);
            if common == child.edge.len() {
                return insert_into(&mut child.node, &key[common..], entry);
            }
            // Split the edge at the divergence point.
            let old_suffix = child.edge.split_off(common);
            let old_node = std::mem::take(&mut child.node);
            let mut mid = RadixNode::default();
            mid.children.insert(
                old_suffix[0],
                Child {
                    edge: old_suffix,
                    node: old_node,
                },
            );
            child.node = mid;
            insert_into(&mut child.node, &key[common..], entry)
        }
    }
}

fn update_in(node: &mut RadixNode, key: &[u8], entry: EntryRef) -> bool {
    if key.is_empty() {
        if node.value.is_some() {
            node.value = Some(entry);
            return true;
        }
        return false;
    }
    match node.children.get_mut(&key[0]) {
        Some(child) if key.starts_with(&child.edge) => {
            let edge_len = child.edge.len();
            update_in(&mut child.node, &key[edge_len..], entry)
        }
        _ => false,
    }
}

fn remove_from(node: &mut RadixNode, key: &[u8]) -> Option<EntryRef> {
    if key.is_empty() {
        return node.value.take();
    }
    let first = key[0];
    let child = node.children.get_mut(&first)?;
    if !key.starts_with(&child.edge) {
        return None;
    }
    let edge_len = child.edge.len();
    let removed = remove_from(&mut child.node, &key[edge_len..])?;
    // Collapse empty and pass-through nodes to keep the tree compressed.
    if child.node.value.is_none() && child.node.children.is_empty() {
        node.children.remove(&first);
    } else if child.node.value.is_none() && child.node.children.len() == 1 {
        let (_, grand) = child.node.children.pop_first().expect("one child");
        child.edge.extend_from_slice(&grand.edge);
        child.node = grand.node;
    }
    Some(removed)
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn successor_in(node: &RadixNode, acc: &mut Vec<u8>, after: &[u8]) -> Option<(Vec<u8>, EntryRef)> {
    if let Some(entry) = node.value {
        if acc.as_slice() > after {
            return Some((acc.clone(), entry));
        }
    }
    for child in node.children.values() {
        let len_before = acc.len();
        acc.extend_from_slice(&child.edge);
        // Skip subtrees that cannot contain a key greater than `after`:
        // every key below shares `acc` as prefix.
        let viable = acc.as_slice() > after || after.starts_with(acc);
        if viable {
            if let Some(found) = successor_in(&child.node, acc, after) {
                acc.truncate(len_before);
                return Some(found);
            }
        }
        acc.truncate(len_before);
    }
    None
}

fn collect_pairs(node: &RadixNode, acc: &mut Vec<u8>, out: &mut Vec<(Vec<u8>, EntryRef)>) {
    if let Some(entry) = node.value {
        out.push((acc.clone(), entry));
    }
    for child in node.children.values() {
        let len_before = acc.len();
        acc.extend_from_slice(&child.edge);
        collect_pairs(&child.node, acc, out);
        acc.truncate(len_before);
    }
}

/// Smallest byte string greater than every string with prefix `p`, or `None`
/// when no such bound exists.
fn prefix_upper_bound(p: &[u8]) -> Option<Vec<u8>> {
    let mut bound = p.to_vec();
    while let Some(last) = bound.pop() {
        if last < u8::MAX {
            bound.push(last + 1);
            return Some(bound);
        }
    }
    None
}

/// Lazy scoped cursor over the DN index.
///
/// The cursor re-descends from the root on every step (`successor` search),
/// so it holds no borrows into the tree between calls and tolerates
/// concurrent mutation; `cancel` ends the stream cooperatively.
#[derive(Debug)]
pub struct RadixCursor {
    base_key: Vec<u8>,
    scope: Scope,
    last: Option<Vec<u8>>,
    base_emitted: bool,
    done: bool,
    cancelled: Arc<AtomicBool>,
}

impl RadixCursor {
    fn new(base_key: Vec<u8>, scope: Scope) -> Self {
        Self {
            base_key,
            scope,
            last: None,
            base_emitted: false,
            done: false,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn close(&mut self) {
        self.done = true;
    }

    pub fn next(&mut self, tree: &RadixTree) -> Result<Option<(String, EntryRef)>> {
        if self.done || self.cancelled.load(Ordering::Relaxed) {
            self.done = true;
            return Ok(None);
        }

        // The base entry itself leads Base and Subtree scopes.
        if !self.base_emitted {
            self.base_emitted = true;
            if matches!(self.scope, Scope::Base | Scope::Subtree) {
                if let Location::Exact(node) = tree.locate(&self.base_key) {
                    if let Some(entry) = node.value {
                        if matches!(self.scope, Scope::Base) {
                            self.done = true;
                        }
                        let dn = dn_from_hierarchical_key(&self.base_key)?;
                        return Ok(Some((dn, entry)));
                    }
                }
            }
            if matches!(self.scope, Scope::Base) {
                self.done = true;
                return Ok(None);
            }
        }

        let mut child_prefix = self.base_key.clone();
        child_prefix.push(b',');
        loop {
            let after = self.last.as_deref().unwrap_or(&child_prefix);
            let (key, entry) = match tree.successor(after) {
                Some(found) => found,
                None => {
                    self.done = true;
                    return Ok(None);
                }
            };
            if !key.starts_with(&child_prefix) {
                self.done = true;
                return Ok(None);
            }
            let remainder = &key[child_prefix.len()..];
            if matches!(self.scope, Scope::OneLevel) {
                if let Some(comma) = remainder.iter().position(|&b| b == b',') {
                    // A deeper descendant: hop over its whole subtree.
                    let subtree_prefix = &key[..child_prefix.len() + comma + 1];
                    match prefix_upper_bound(subtree_prefix) {
                        Some(bound) => {
                            self.last = Some(bound);
                            continue;
                        }
                        None => {
                            self.done = true;
                            return Ok(None);
                        }
                    }
                }
            }
            self.last = Some(key.clone());
            let dn = dn_from_hierarchical_key(&key)?;
            return Ok(Some((dn, entry)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(tree: &RadixTree, base: &str, scope: Scope) -> Vec<String> {
        let mut cursor = tree.iterate(base, scope);
        let mut dns = Vec::new();
        while let Some((dn, _)) = cursor.next(tree).unwrap() {
            dns.push(dn);
        }
        dns
    }

    fn populated() -> RadixTree {
        let mut tree = RadixTree::new();
        for (i, dn) in [
            "dc=t",
            "ou=users,dc=t",
            "uid=alice,ou=users,dc=t",
            "uid=bob,ou=users,dc=t",
            "ou=groups,dc=t",
            "cn=admins,ou=groups,dc=t",
        ]
        .iter()
        .enumerate()
        {
            tree.insert(dn, EntryRef::new(i as u64 + 1, 0)).unwrap();
        }
        tree
    }

    #[test]
    fn insert_lookup_and_duplicate() {
        let mut tree = RadixTree::new();
        tree.insert("uid=a,dc=t", EntryRef::new(3, 1)).unwrap();
        assert_eq!(tree.lookup("uid=a,dc=t"), Some(EntryRef::new(3, 1)));
        assert_eq!(tree.lookup("uid=b,dc=t"), None);
        assert!(matches!(
            tree.insert("uid=a,dc=t", EntryRef::new(4, 0)),
            Err(DirError::AlreadyExists(_))
        ));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn remove_and_collapse() {
        let mut tree = populated();
        assert_eq!(tree.remove("uid=bob,ou=users,dc=t"), Some(EntryRef::new(4, 0)));
        assert_eq!(tree.remove("uid=bob,ou=users,dc=t"), None);
        assert_eq!(tree.lookup("uid=alice,ou=users,dc=t"), Some(EntryRef::new(3, 0)));
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn has_children_cases() {
        let tree = populated();
        assert!(tree.has_children("dc=t"));
        assert!(tree.has_children("ou=users,dc=t"));
        assert!(!tree.has_children("uid=alice,ou=users,dc=t"));
        assert!(!tree.has_children("dc=missing"));
    }

    #[test]
    fn base_scope_yields_only_base() {
        let tree = populated();
        assert_eq!(collect(&tree, "ou=users,dc=t", Scope::Base), vec!["ou=users,dc=t"]);
        assert!(collect(&tree, "ou=nothing,dc=t", Scope::Base).is_empty());
    }

    #[test]
    fn one_level_scope_yields_immediate_children() {
        let tree = populated();
        assert_eq!(
            collect(&tree, "dc=t", Scope::OneLevel),
            vec!["ou=groups,dc=t", "ou=users,dc=t"]
        );
        assert_eq!(
            collect(&tree, "ou=users,dc=t", Scope::OneLevel),
            vec!["uid=alice,ou=users,dc=t", "uid=bob,ou=users,dc=t"]
        );
    }

    #[test]
    fn one_level_skips_grandchildren_without_parent_entry() {
        let mut tree = RadixTree::new();
        // No entry for ou=users itself; its subtree must not leak into a
        // one-level listing under dc=t.
        tree.insert("uid=a,ou=users,dc=t", EntryRef::new(1, 0)).unwrap();
        tree.insert("cn=x,dc=t", EntryRef::new(2, 0)).unwrap();
        assert_eq!(collect(&tree, "dc=t", Scope::OneLevel), vec!["cn=x,dc=t"]);
    }

    #[test]
    fn subtree_scope_yields_base_and_descendants_in_order() {
        let tree = populated();
        let dns = collect(&tree, "dc=t", Scope::Subtree);
        assert_eq!(
            dns,
            vec![
                "dc=t",
                "ou=groups,dc=t",
                "cn=admins,ou=groups,dc=t",
                "ou=users,dc=t",
                "uid=alice,ou=users,dc=t",
                "uid=bob,ou=users,dc=t",
            ]
        );
    }

    #[test]
    fn subtree_of_missing_base_yields_descendants() {
        let mut tree = RadixTree::new();
        for i in 0..4u64 {
            tree.insert(&format!("uid=u{i:04},dc=t"), EntryRef::new(i, 0)).unwrap();
        }
        let dns = collect(&tree, "dc=t", Scope::Subtree);
        assert_eq!(dns.len(), 4);
        let mut sorted = dns.clone();
        sorted.sort();
        assert_eq!(dns, sorted);
    }

    #[test]
    fn sibling_prefix_dns_do_not_mix() {
        let mut tree = RadixTree::new();
        tree.insert("uid=a,dc=example", EntryRef::new(1, 0)).unwrap();
        tree.insert("uid=b,dc=example2", EntryRef::new(2, 0)).unwrap();
        assert_eq!(
            collect(&tree, "dc=example", Scope::Subtree),
            vec!["uid=a,dc=example"]
        );
        assert!(!tree.has_children("dc=exam"));
    }

    #[test]
    fn cancelled_cursor_stops() {
        let tree = populated();
        let mut cursor = tree.iterate("dc=t", Scope::Subtree);
        assert!(cursor.next(&tree).unwrap().is_some());
        cursor.cancel_flag().store(true, Ordering::Relaxed);
        assert!(cursor.next(&tree).unwrap().is_none());
    }

    #[test]
    fn persist_and_load_roundtrip() {
        use crate::pager::{PageManager, PagerOptions};
        use tempfile::NamedTempFile;

        let tmp = NamedTempFile::new().unwrap();
        let mut io = PageManager::open(tmp.path(), PagerOptions::default(), None).unwrap();
        let mut tree = populated();
        assert!(tree.is_dirty());
        let root = tree.persist(&mut io).unwrap();
        assert!(!tree.is_dirty());

        let loaded = RadixTree::load(&mut io, root).unwrap();
        assert_eq!(loaded.len(), tree.len());
        assert_eq!(
            collect(&loaded, "dc=t", Scope::Subtree),
            collect(&tree, "dc=t", Scope::Subtree)
        );
        assert_eq!(loaded.root_page_id(), root);
    }
}
