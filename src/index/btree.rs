//! Paged B+ tree keyed on variable-length bytes.
//!
//! Nodes live on attribute-index pages, one node per page:
//!
//! ```text
//! is_leaf(u8) | key_count(u16) | next_leaf(u64) | prev_leaf(u64) | reserved(u16)
//! keys: repeated len(u16) | bytes
//! leaves: key_count x (page_id u64 | slot_id u16)
//! internals: key_count + 1 child page ids (u64)
//! ```
//!
//! Keys are compared lexicographically (a proper prefix sorts first).
//! Duplicate keys are allowed; equal keys may span leaves, so exact search
//! walks the sibling links while keys stay equal. Node capacity is derived
//! from page space: a node splits when its encoding outgrows the payload and
//! rebalances when it falls below a quarter of it.

use std::convert::TryInto;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{DirError, Result};
use crate::model::EntryRef;
use crate::pager::{Page, PageId, PageIo, PageType, PAGE_FLAG_LEAF};

/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = 1024;
const NODE_HEADER_LEN: usize = 21;
const LEAF_VALUE_LEN: usize = 10;
const CHILD_LEN: usize = 8;
const MIN_FILL_DIVISOR: usize = 4;

#[derive(Debug, Clone)]
struct Node {
    page_id: PageId,
    is_leaf: bool,
    keys: Vec<Vec<u8>>,
    refs: Vec<EntryRef>,
    children: Vec<PageId>,
    next_leaf: PageId,
    prev_leaf: PageId,
}

impl Node {
    fn leaf(page_id: PageId) -> Self {
        Self {
            page_id,
            is_leaf: true,
            keys: Vec::new(),
            refs: Vec::new(),
            children: Vec::new(),
            next_leaf: 0,
            prev_leaf: 0,
        }
    }

    fn internal(page_id: PageId) -> Self {
        Self {
            page_id,
            is_leaf: false,
            keys: Vec::new(),
            refs: Vec::new(),
            children: Vec::new(),
            next_leaf: 0,
            prev_leaf: 0,
        }
    }

    fn encoded_len(&self) -> usize {
        let keys: usize = self.keys.iter().map(|k| 2 + k.len()).sum();
        let values = if self.is_leaf {
            self.keys.len() * LEAF_VALUE_LEN
        } else {
            (self.keys.len() + 1) * CHILD_LEN
        };
        NODE_HEADER_LEN + keys + values
    }

    fn encode(&self, payload_len: usize) -> Result<Page> {
        if self.encoded_len() > payload_len {
            return Err(DirError::Corrupted(format!(
                "btree node {} encoding exceeds page payload",
                self.page_id
            )));
        }
        let mut page = Page::new(self.page_id, PageType::AttrIndex, payload_len);
        if self.is_leaf {
            page.flags |= PAGE_FLAG_LEAF;
        }
        page.item_count = self.keys.len() as u16;
        let buf = &mut page.payload;
        buf[0] = u8::from(self.is_leaf);
        buf[1..3].copy_from_slice(&(self.keys.len() as u16).to_le_bytes());
        buf[3..11].copy_from_slice(&self.next_leaf.to_le_bytes());
        buf[11..19].copy_from_slice(&self.prev_leaf.to_le_bytes());
        let mut pos = NODE_HEADER_LEN;
        for key in &self.keys {
            buf[pos..pos + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
            pos += 2;
            buf[pos..pos + key.len()].copy_from_slice(key);
            pos += key.len();
        }
        if self.is_leaf {
            for entry in &self.refs {
                buf[pos..pos + 8].copy_from_slice(&entry.page_id.to_le_bytes());
                buf[pos + 8..pos + 10].copy_from_slice(&entry.slot_id.to_le_bytes());
                pos += LEAF_VALUE_LEN;
            }
        } else {
            for child in &self.children {
                buf[pos..pos + 8].copy_from_slice(&child.to_le_bytes());
                pos += CHILD_LEN;
            }
        }
        page.free_space = (payload_len - pos) as u16;
        Ok(page)
    }

    fn decode(page: &Page) -> Result<Self> {
        let buf = &page.payload;
        if buf.len() < NODE_HEADER_LEN {
            return Err(DirError::Corrupted("btree page shorter than header".into()));
        }
        let is_leaf = match buf[0] {
            0 => false,
            1 => true,
            other => {
                return Err(DirError::Corrupted(format!(
                    "btree page {} has leaf marker {other}",
                    page.id
                )))
            }
        };
        let key_count =
            u16::from_le_bytes(buf[1..3].try_into().expect("slice is 2 bytes")) as usize;
        let next_leaf = u64::from_le_bytes(buf[3..11].try_into().expect("slice is 8 bytes"));
        let prev_leaf = u64::from_le_bytes(buf[11..19].try_into().expect("slice is 8 bytes"));
        let mut pos = NODE_HEADER_LEN;
        let mut keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            if pos + 2 > buf.len() {
                return Err(DirError::Corrupted("btree key table truncated".into()));
            }
            let len =
                u16::from_le_bytes(buf[pos..pos + 2].try_into().expect("slice is 2 bytes"))
                    as usize;
            pos += 2;
            if pos + len > buf.len() {
                return Err(DirError::Corrupted("btree key bytes truncated".into()));
            }
            keys.push(buf[pos..pos + len].to_vec());
            pos += len;
        }
        let mut refs = Vec::new();
        let mut children = Vec::new();
        if is_leaf {
            for _ in 0..key_count {
                if pos + LEAF_VALUE_LEN > buf.len() {
                    return Err(DirError::Corrupted("btree leaf values truncated".into()));
                }
                let page_id =
                    u64::from_le_bytes(buf[pos..pos + 8].try_into().expect("slice is 8 bytes"));
                let slot_id = u16::from_le_bytes(
                    buf[pos + 8..pos + 10].try_into().expect("slice is 2 bytes"),
                );
                refs.push(EntryRef::new(page_id, slot_id));
                pos += LEAF_VALUE_LEN;
            }
        } else {
            for _ in 0..=key_count {
                if pos + CHILD_LEN > buf.len() {
                    return Err(DirError::Corrupted("btree child table truncated".into()));
                }
                children
                    .push(u64::from_le_bytes(buf[pos..pos + 8].try_into().expect("8 bytes")));
                pos += CHILD_LEN;
            }
        }
        Ok(Self {
            page_id: page.id,
            is_leaf,
            keys,
            refs,
            children,
            next_leaf,
            prev_leaf,
        })
    }
}

fn read_node(io: &mut dyn PageIo, page_id: PageId) -> Result<Node> {
    let page = io.read_page(page_id)?;
    if page.page_type != PageType::AttrIndex {
        return Err(DirError::Corrupted(format!(
            "page {page_id} is not an attribute-index page"
        )));
    }
    Node::decode(&page)
}

fn write_node(io: &mut dyn PageIo, node: &Node) -> Result<()> {
    let page = node.encode(io.payload_len())?;
    io.write_page(page)
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(DirError::KeyEmpty);
    }
    if key.len() > MAX_KEY_LEN {
        return Err(DirError::KeyTooLarge(key.len()));
    }
    Ok(())
}

/// Outcome of a recursive insert: a split bubbles the separator and the new
/// right sibling upward.
enum InsertOutcome {
    Done,
    Split { separator: Vec<u8>, right: PageId },
}

/// A disk-backed B+ tree rooted at a single page.
#[derive(Debug, Clone)]
pub struct BTree {
    root: PageId,
}

impl BTree {
    /// Allocates an empty tree (a single empty leaf as root).
    pub fn create(io: &mut dyn PageIo) -> Result<Self> {
        let root = io.allocate_page(PageType::AttrIndex)?;
        let node = Node::leaf(root);
        write_node(io, &node)?;
        Ok(Self { root })
    }

    /// Attaches to an existing tree.
    pub fn open(root: PageId) -> Self {
        Self { root }
    }

    pub fn root_page(&self) -> PageId {
        self.root
    }

    /// Inserts a (key, ref) pair; duplicate keys are allowed.
    pub fn insert(&mut self, io: &mut dyn PageIo, key: &[u8], entry: EntryRef) -> Result<()> {
        check_key(key)?;
        match self.insert_into(io, self.root, key, entry)? {
            InsertOutcome::Done => Ok(()),
            InsertOutcome::Split { separator, right } => {
                let new_root_id = io.allocate_page(PageType::AttrIndex)?;
                let mut new_root = Node::internal(new_root_id);
                new_root.keys.push(separator);
                new_root.children.push(self.root);
                new_root.children.push(right);
                write_node(io, &new_root)?;
                self.root = new_root_id;
                Ok(())
            }
        }
    }

    /// Inserts, failing with `AlreadyExists` when the key is present.
    pub fn insert_unique(
        &mut self,
        io: &mut dyn PageIo,
        key: &[u8],
        entry: EntryRef,
    ) -> Result<()> {
        check_key(key)?;
        if !self.search(io, key)?.is_empty() {
            return Err(DirError::AlreadyExists(format!(
                "key of {} bytes already present",
                key.len()
            )));
        }
        self.insert(io, key, entry)
    }

    fn insert_into(
        &mut self,
        io: &mut dyn PageIo,
        page_id: PageId,
        key: &[u8],
        entry: EntryRef,
    ) -> Result<InsertOutcome> {
        let mut node = read_node(io, page_id)?;
        if node.is_leaf {
            let pos = node.keys.partition_point(|k| k.as_slice() < key);
            node.keys.insert(pos, key.to_vec());
            node.refs.insert(pos, entry);
            return self.finish_insert(io, node);
        }
        let child_idx = node.keys.partition_point(|k| k.as_slice() < key);
        let child = node.children[child_idx];
        match self.insert_into(io, child, key, entry)? {
            InsertOutcome::Done => Ok(InsertOutcome::Done),
            InsertOutcome::Split { separator, right } => {
                node.keys.insert(child_idx, separator);
                node.children.insert(child_idx + 1, right);
                self.finish_insert(io, node)
            }
        }
    }

    fn finish_insert(&mut self, io: &mut dyn PageIo, mut node: Node) -> Result<InsertOutcome> {
        let payload_len = io.payload_len();
        if node.encoded_len() <= payload_len {
            write_node(io, &node)?;
            return Ok(InsertOutcome::Done);
        }
        if node.keys.len() < 2 {
            return Err(DirError::KeyTooLarge(
                node.keys.first().map(|k| k.len()).unwrap_or(0),
            ));
        }

        let right_id = io.allocate_page(PageType::AttrIndex)?;
        let mid = node.keys.len() / 2;
        let separator;
        let mut right;
        if node.is_leaf {
            right = Node::leaf(right_id);
            right.keys = node.keys.split_off(mid);
            right.refs = node.refs.split_off(mid);
            separator = right.keys[0].clone();
            right.next_leaf = node.next_leaf;
            right.prev_leaf = node.page_id;
            if node.next_leaf != 0 {
                let mut old_next = read_node(io, node.next_leaf)?;
                old_next.prev_leaf = right_id;
                write_node(io, &old_next)?;
            }
            node.next_leaf = right_id;
        } else {
            right = Node::internal(right_id);
            // The median separator moves up rather than staying in a child.
            right.keys = node.keys.split_off(mid + 1);
            separator = node.keys.pop().expect("median exists");
            right.children = node.children.split_off(mid + 1);
        }
        write_node(io, &node)?;
        write_node(io, &right)?;
        Ok(InsertOutcome::Split {
            separator,
            right: right_id,
        })
    }

    /// Returns every ref stored under `key` (duplicates may span leaves).
    pub fn search(&self, io: &mut dyn PageIo, key: &[u8]) -> Result<Vec<EntryRef>> {
        check_key(key)?;
        let mut refs = Vec::new();
        let mut leaf = self.leftmost_leaf_for(io, key)?;
        loop {
            let start = leaf.keys.partition_point(|k| k.as_slice() < key);
            for idx in start..leaf.keys.len() {
                if leaf.keys[idx].as_slice() != key {
                    return Ok(refs);
                }
                refs.push(leaf.refs[idx]);
            }
            if leaf.next_leaf == 0 || leaf.keys.last().map(|k| k.as_slice() > key).unwrap_or(false)
            {
                return Ok(refs);
            }
            leaf = read_node(io, leaf.next_leaf)?;
        }
    }

    fn leftmost_leaf_for(&self, io: &mut dyn PageIo, key: &[u8]) -> Result<Node> {
        let mut node = read_node(io, self.root)?;
        while !node.is_leaf {
            let idx = node.keys.partition_point(|k| k.as_slice() < key);
            node = read_node(io, node.children[idx])?;
        }
        Ok(node)
    }

    fn leftmost_leaf(&self, io: &mut dyn PageIo) -> Result<Node> {
        let mut node = read_node(io, self.root)?;
        while !node.is_leaf {
            node = read_node(io, node.children[0])?;
        }
        Ok(node)
    }

    fn rightmost_leaf(&self, io: &mut dyn PageIo) -> Result<Node> {
        let mut node = read_node(io, self.root)?;
        while !node.is_leaf {
            node = read_node(io, *node.children.last().expect("internal has children"))?;
        }
        Ok(node)
    }

    /// Removes one exact (key, ref) pair. Scans forward across equal keys to
    /// match the ref; rebalances on underflow.
    pub fn delete(&mut self, io: &mut dyn PageIo, key: &[u8], entry: EntryRef) -> Result<()> {
        check_key(key)?;
        if !self.delete_from(io, self.root, key, entry)? {
            return Err(DirError::NotFound("key"));
        }
        // Collapse empty internal roots with a single child.
        loop {
            let root = read_node(io, self.root)?;
            if root.is_leaf || !root.keys.is_empty() || root.children.len() != 1 {
                return Ok(());
            }
            let child = root.children[0];
            io.free_page(self.root)?;
            self.root = child;
        }
    }

    fn delete_from(
        &mut self,
        io: &mut dyn PageIo,
        page_id: PageId,
        key: &[u8],
        entry: EntryRef,
    ) -> Result<bool> {
        let mut node = read_node(io, page_id)?;
        if node.is_leaf {
            let start = node.keys.partition_point(|k| k.as_slice() < key);
            for idx in start..node.keys.len() {
                if node.keys[idx].as_slice() != key {
                    return Ok(false);
                }
                if node.refs[idx] == entry {
                    node.keys.remove(idx);
                    node.refs.remove(idx);
                    write_node(io, &node)?;
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        // Duplicates may live on either side of an equal separator, so try
        // every child whose range can contain the key.
        let lower = node.keys.partition_point(|k| k.as_slice() < key);
        let upper = node.keys.partition_point(|k| k.as_slice() <= key);
        for child_idx in lower..=upper {
            let child = node.children[child_idx];
            if self.delete_from(io, child, key, entry)? {
                self.rebalance_child(io, page_id, child_idx)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn rebalance_child(
        &mut self,
        io: &mut dyn PageIo,
        parent_id: PageId,
        child_idx: usize,
    ) -> Result<()> {
        let payload_len = io.payload_len();
        let min_fill = payload_len / MIN_FILL_DIVISOR;
        let mut parent = read_node(io, parent_id)?;
        let child = read_node(io, parent.children[child_idx])?;
        if !child.keys.is_empty() && child.encoded_len() >= min_fill {
            return Ok(());
        }

        // Borrow from the left sibling first, then the right.
        if child_idx > 0 {
            let left = read_node(io, parent.children[child_idx - 1])?;
            if left.encoded_len() > min_fill && left.keys.len() > 1 {
                return self.borrow_from_left(io, &mut parent, child_idx, left, child);
            }
        }
        if child_idx + 1 < parent.children.len() {
            let right = read_node(io, parent.children[child_idx + 1])?;
            if right.encoded_len() > min_fill && right.keys.len() > 1 {
                return self.borrow_from_right(io, &mut parent, child_idx, child, right);
            }
        }

        // Merge with a sibling when the combined node fits in one page.
        if child_idx > 0 {
            let left = read_node(io, parent.children[child_idx - 1])?;
            if merged_len(&left, &child, &parent.keys[child_idx - 1]) <= payload_len {
                return self.merge_pair(io, parent, child_idx - 1);
            }
        }
        if child_idx + 1 < parent.children.len() {
            let right = read_node(io, parent.children[child_idx + 1])?;
            if merged_len(&child, &right, &parent.keys[child_idx]) <= payload_len {
                return self.merge_pair(io, parent, child_idx);
            }
        }
        // Neither borrow nor merge is possible under the byte budget; a
        // slightly underfull node is tolerated.
        Ok(())
    }

    fn borrow_from_left(
        &mut self,
        io: &mut dyn PageIo,
        parent: &mut Node,
        child_idx: usize,
        mut left: Node,
        mut child: Node,
    ) -> Result<()> {
        if child.is_leaf {
            let key = left.keys.pop().expect("donor has keys");
            let entry = left.refs.pop().expect("donor has refs");
            child.keys.insert(0, key.clone());
            child.refs.insert(0, entry);
            parent.keys[child_idx - 1] = key;
        } else {
            let sep = parent.keys[child_idx - 1].clone();
            let key = left.keys.pop().expect("donor has keys");
            let grand = left.children.pop().expect("donor has children");
            child.keys.insert(0, sep);
            child.children.insert(0, grand);
            parent.keys[child_idx - 1] = key;
        }
        write_node(io, &left)?;
        write_node(io, &child)?;
        write_node(io, parent)
    }

    fn borrow_from_right(
        &mut self,
        io: &mut dyn PageIo,
        parent: &mut Node,
        child_idx: usize,
        mut child: Node,
        mut right: Node,
    ) -> Result<()> {
        if child.is_leaf {
            let key = right.keys.remove(0);
            let entry = right.refs.remove(0);
            child.keys.push(key);
            child.refs.push(entry);
            parent.keys[child_idx] = right.keys[0].clone();
        } else {
            let sep = parent.keys[child_idx].clone();
            let key = right.keys.remove(0);
            let grand = right.children.remove(0);
            child.keys.push(sep);
            child.children.push(grand);
            parent.keys[child_idx] = key;
        }
        write_node(io, &right)?;
        write_node(io, &child)?;
        write_node(io, parent)
    }

    /// Merges `children[idx + 1]` into `children[idx]` and drops the
    /// separator between them.
    fn merge_pair(&mut self, io: &mut dyn PageIo, mut parent: Node, idx: usize) -> Result<()> {
        let mut left = read_node(io, parent.children[idx])?;
        let right = read_node(io, parent.children[idx + 1])?;
        let separator = parent.keys.remove(idx);
        parent.children.remove(idx + 1);
        if left.is_leaf {
            left.keys.extend(right.keys);
            left.refs.extend(right.refs);
            left.next_leaf = right.next_leaf;
            if right.next_leaf != 0 {
                let mut after = read_node(io, right.next_leaf)?;
                after.prev_leaf = left.page_id;
                write_node(io, &after)?;
            }
        } else {
            left.keys.push(separator);
            left.keys.extend(right.keys);
            left.children.extend(right.children);
        }
        write_node(io, &left)?;
        write_node(io, &parent)?;
        io.free_page(right.page_id)?;
        Ok(())
    }

    /// Forward cursor over `[start, end]` (both inclusive, either optional).
    pub fn range(
        &self,
        io: &mut dyn PageIo,
        start: Option<&[u8]>,
        end: Option<Vec<u8>>,
    ) -> Result<BTreeCursor> {
        let leaf = match start {
            Some(key) => self.leftmost_leaf_for(io, key)?,
            None => self.leftmost_leaf(io)?,
        };
        let idx = match start {
            Some(key) => leaf.keys.partition_point(|k| k.as_slice() < key),
            None => 0,
        };
        Ok(BTreeCursor {
            leaf: Some(leaf),
            idx,
            end,
            end_exclusive: None,
            prefix: None,
            reverse: false,
            cancelled: Arc::new(AtomicBool::new(false)),
            done: false,
        })
    }

    /// Half-open scan `[start, end)`.
    pub fn range_half_open(
        &self,
        io: &mut dyn PageIo,
        start: &[u8],
        end_exclusive: Vec<u8>,
    ) -> Result<BTreeCursor> {
        let mut cursor = self.range(io, Some(start), None)?;
        cursor.end = None;
        cursor.prefix = None;
        cursor.end_exclusive = Some(end_exclusive);
        Ok(cursor)
    }

    /// Cursor over every key starting with `prefix`, ascending.
    pub fn prefix(&self, io: &mut dyn PageIo, prefix: &[u8]) -> Result<BTreeCursor> {
        let mut cursor = self.range(io, Some(prefix), None)?;
        cursor.prefix = Some(prefix.to_vec());
        Ok(cursor)
    }

    /// Reverse cursor over the whole tree (descending key order).
    pub fn iter_reverse(&self, io: &mut dyn PageIo) -> Result<BTreeCursor> {
        let leaf = self.rightmost_leaf(io)?;
        let idx = leaf.keys.len();
        Ok(BTreeCursor {
            leaf: Some(leaf),
            idx,
            end: None,
            end_exclusive: None,
            prefix: None,
            reverse: true,
            cancelled: Arc::new(AtomicBool::new(false)),
            done: false,
        })
    }

    /// Frees every page of the tree.
    pub fn free_pages(self, io: &mut dyn PageIo) -> Result<()> {
        free_subtree(io, self.root)
    }

    /// Structural check: key order inside nodes, uniform leaf depth, and the
    /// leaf chain yielding ascending keys.
    pub fn validate(&self, io: &mut dyn PageIo) -> Result<()> {
        let mut depth = None;
        validate_subtree(io, self.root, 0, &mut depth)?;
        let mut leaf = self.leftmost_leaf(io)?;
        let mut last: Option<Vec<u8>> = None;
        loop {
            for key in &leaf.keys {
                if let Some(prev) = &last {
                    if prev > key {
                        return Err(DirError::Corrupted(
                            "leaf chain yields keys out of order".into(),
                        ));
                    }
                }
                last = Some(key.clone());
            }
            if leaf.next_leaf == 0 {
                return Ok(());
            }
            leaf = read_node(io, leaf.next_leaf)?;
        }
    }
}

fn merged_len(left: &Node, right: &Node, separator: &[u8]) -> usize {
    let mut len = left.encoded_len() + right.encoded_len() - NODE_HEADER_LEN;
    if !left.is_leaf {
        // The separator is pulled down into the merged node.
        len += 2 + separator.len();
    }
    len
}

fn free_subtree(io: &mut dyn PageIo, page_id: PageId) -> Result<()> {
    let node = read_node(io, page_id)?;
    if !node.is_leaf {
        for child in &node.children {
            free_subtree(io, *child)?;
        }
    }
    io.free_page(page_id)
}

fn validate_subtree(
    io: &mut dyn PageIo,
    page_id: PageId,
    depth: usize,
    leaf_depth: &mut Option<usize>,
) -> Result<()> {
    let node = read_node(io, page_id)?;
    for pair in node.keys.windows(2) {
        if pair[0] > pair[1] {
            return Err(DirError::Corrupted(format!(
                "btree node {page_id} keys out of order"
            )));
        }
    }
    if node.is_leaf {
        match leaf_depth {
            Some(expected) if *expected != depth => {
                return Err(DirError::Corrupted("btree leaves at unequal depth".into()))
            }
            Some(_) => {}
            None => *leaf_depth = Some(depth),
        }
        return Ok(());
    }
    if node.children.len() != node.keys.len() + 1 {
        return Err(DirError::Corrupted(format!(
            "btree internal node {page_id} child/key mismatch"
        )));
    }
    for child in &node.children {
        validate_subtree(io, *child, depth + 1, leaf_depth)?;
    }
    Ok(())
}

/// A lazy cursor over leaf entries. `next` walks the sibling links; `close`
/// is idempotent and a cancelled cursor ends the stream on the next call.
#[derive(Debug)]
pub struct BTreeCursor {
    leaf: Option<Node>,
    idx: usize,
    end: Option<Vec<u8>>,
    end_exclusive: Option<Vec<u8>>,
    prefix: Option<Vec<u8>>,
    reverse: bool,
    cancelled: Arc<AtomicBool>,
    done: bool,
}

impl BTreeCursor {
    /// Shared cancellation flag; setting it ends the stream cooperatively.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn close(&mut self) {
        self.done = true;
        self.leaf = None;
    }

    pub fn next(&mut self, io: &mut dyn PageIo) -> Result<Option<(Vec<u8>, EntryRef)>> {
        if self.done {
            return Ok(None);
        }
        if self.cancelled.load(Ordering::Relaxed) {
            self.close();
            return Ok(None);
        }
        if self.reverse {
            return self.next_reverse(io);
        }
        loop {
            let leaf = match &self.leaf {
                Some(leaf) => leaf,
                None => {
                    self.done = true;
                    return Ok(None);
                }
            };
            if self.idx >= leaf.keys.len() {
                if leaf.next_leaf == 0 {
                    self.close();
                    return Ok(None);
                }
                let next = read_node(io, leaf.next_leaf)?;
                self.leaf = Some(next);
                self.idx = 0;
                continue;
            }
            let key = leaf.keys[self.idx].clone();
            let entry = leaf.refs[self.idx];
            if let Some(end) = &self.end {
                if key.as_slice() > end.as_slice() {
                    self.close();
                    return Ok(None);
                }
            }
            if let Some(end) = &self.end_exclusive {
                if key.as_slice() >= end.as_slice() {
                    self.close();
                    return Ok(None);
                }
            }
            if let Some(prefix) = &self.prefix {
                if !key.starts_with(prefix) {
                    self.close();
                    return Ok(None);
                }
            }
            self.idx += 1;
            return Ok(Some((key, entry)));
        }
    }

    fn next_reverse(&mut self, io: &mut dyn PageIo) -> Result<Option<(Vec<u8>, EntryRef)>> {
        loop {
            let leaf = match &self.leaf {
                Some(leaf) => leaf,
                None => {
                    self.done = true;
                    return Ok(None);
                }
            };
            if self.idx == 0 {
                if leaf.prev_leaf == 0 {
                    self.close();
                    return Ok(None);
                }
                let prev = read_node(io, leaf.prev_leaf)?;
                self.idx = prev.keys.len();
                self.leaf = Some(prev);
                continue;
            }
            self.idx -= 1;
            let leaf = self.leaf.as_ref().expect("leaf present");
            return Ok(Some((leaf.keys[self.idx].clone(), leaf.refs[self.idx])));
        }
    }
}
