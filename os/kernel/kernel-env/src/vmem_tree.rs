//! # Declared Virtual Memory
//!
//! A B+ tree from range start address to [`PageDesc`]. It records what an
//! environment *may* touch; the commit table and the hardware tables record
//! what it actually touched.
//!
//! Nodes live in an arena and link by index. Leaves are chained left to
//! right through `next` so gap searches run without revisiting interior
//! nodes. Ranges are never removed; unmapping clears [`PageDesc::valid`].

use crate::Handle;
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use kernel_vmem::PageEntryBits;

/// Minimum degree of the tree.
pub const DEGREE: usize = 8;
/// Keys per node before it splits.
pub const MAX_KEYS: usize = DEGREE * 2 - 1;

/// Access rights of a declared range.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct VmemFlags {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub user: bool,
    #[bits(4)]
    __: u8,
}

impl VmemFlags {
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::new().with_read(true).with_write(true).with_user(true)
    }

    #[must_use]
    pub const fn user_ro() -> Self {
        Self::new().with_read(true).with_user(true)
    }

    /// Leaf permission bits granting these rights.
    #[must_use]
    pub const fn entry_bits(self) -> PageEntryBits {
        PageEntryBits::new()
            .with_present(true)
            .with_writable(self.write())
            .with_user_access(self.user())
            .with_no_execute(!self.exec())
    }
}

/// One declared range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDesc {
    /// `false` once the range has been unmapped.
    pub valid: bool,
    pub flags: VmemFlags,
    /// Backing VMO, or anonymous zeroed memory.
    pub vmo: Option<Handle>,
    /// Byte offset into the VMO.
    pub offset: u64,
    pub size: u64,
}

type NodeId = u32;

enum Body {
    Leaf(Vec<PageDesc>),
    Interior(Vec<NodeId>),
}

struct Node {
    keys: Vec<u64>,
    body: Body,
    next: Option<NodeId>,
}

impl Node {
    fn leaf() -> Self {
        Self {
            keys: Vec::with_capacity(MAX_KEYS),
            body: Body::Leaf(Vec::with_capacity(MAX_KEYS)),
            next: None,
        }
    }

    /// Child slot for `key`: the number of separators `<= key`.
    #[inline]
    fn child_index(&self, key: u64) -> usize {
        self.keys.partition_point(|&k| k <= key)
    }
}

#[derive(Default)]
pub struct VmemTree {
    nodes: Vec<Node>,
    root: Option<NodeId>,
    len: usize,
}

impl VmemTree {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
            len: 0,
        }
    }

    /// Declared ranges, valid or not.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Levels from root to leaves.
    #[must_use]
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut node = self.root;
        while let Some(id) = node {
            depth += 1;
            node = match &self.node(id).body {
                Body::Leaf(_) => None,
                Body::Interior(kids) => kids.first().copied(),
            };
        }
        depth
    }

    #[inline]
    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id as usize]
    }

    #[inline]
    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id as usize]
    }

    #[allow(clippy::cast_possible_truncation)]
    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        (self.nodes.len() - 1) as NodeId
    }

    /// Split the full child `idx` of `parent` around its middle.
    ///
    /// A leaf keeps its lower `DEGREE` keys and copies the first key of the
    /// new right sibling up; an interior node moves its middle key up.
    fn split_child(&mut self, parent: NodeId, idx: usize) {
        let child = match &self.node(parent).body {
            Body::Interior(kids) => kids[idx],
            Body::Leaf(_) => unreachable!("leaves have no children"),
        };

        let left = self.node_mut(child);
        let mut right_keys = left.keys.split_off(DEGREE);
        let (separator, right) = match &mut left.body {
            Body::Leaf(vals) => {
                let right_vals = vals.split_off(DEGREE);
                let separator = right_keys[0];
                let right = Node {
                    keys: right_keys,
                    body: Body::Leaf(right_vals),
                    next: left.next,
                };
                (separator, right)
            }
            Body::Interior(kids) => {
                let right_kids = kids.split_off(DEGREE);
                let separator = left.keys.pop().unwrap_or_else(|| right_keys.remove(0));
                let right = Node {
                    keys: right_keys,
                    body: Body::Interior(right_kids),
                    next: None,
                };
                (separator, right)
            }
        };

        let is_leaf = matches!(right.body, Body::Leaf(_));
        let right_id = self.push(right);
        if is_leaf {
            self.node_mut(child).next = Some(right_id);
        }

        let parent = self.node_mut(parent);
        parent.keys.insert(idx, separator);
        if let Body::Interior(kids) = &mut parent.body {
            kids.insert(idx + 1, right_id);
        }
    }

    /// Declare the range starting at `start`, replacing any range that
    /// starts at the same address.
    pub fn insert(&mut self, start: u64, desc: PageDesc) -> Option<PageDesc> {
        let root = match self.root {
            Some(root) => root,
            None => {
                let root = self.push(Node::leaf());
                self.root = Some(root);
                root
            }
        };

        let mut node = root;
        if self.node(root).keys.len() == MAX_KEYS {
            node = self.push(Node {
                keys: Vec::with_capacity(MAX_KEYS),
                body: Body::Interior(Vec::from([root])),
                next: None,
            });
            self.split_child(node, 0);
            self.root = Some(node);
        }

        loop {
            let (idx, kid) = {
                let n = self.node(node);
                match &n.body {
                    Body::Leaf(_) => break,
                    Body::Interior(kids) => {
                        let idx = n.child_index(start);
                        (idx, kids[idx])
                    }
                }
            };
            node = if self.node(kid).keys.len() == MAX_KEYS {
                self.split_child(node, idx);
                let n = self.node(node);
                let idx = if start >= n.keys[idx] { idx + 1 } else { idx };
                match &n.body {
                    Body::Interior(kids) => kids[idx],
                    Body::Leaf(_) => unreachable!(),
                }
            } else {
                kid
            };
        }

        let leaf = self.node_mut(node);
        let at = leaf.keys.partition_point(|&k| k < start);
        let Body::Leaf(vals) = &mut leaf.body else {
            unreachable!()
        };
        if leaf.keys.get(at) == Some(&start) {
            return Some(core::mem::replace(&mut vals[at], desc));
        }
        leaf.keys.insert(at, start);
        vals.insert(at, desc);
        self.len += 1;
        None
    }

    /// Leaf and index of the last range starting at or below `addr`.
    fn floor(&self, addr: u64) -> Option<(NodeId, usize)> {
        let mut id = self.root?;
        loop {
            let node = self.node(id);
            match &node.body {
                Body::Interior(kids) => id = kids[node.child_index(addr)],
                Body::Leaf(_) => {
                    let pos = node.child_index(addr);
                    return pos.checked_sub(1).map(|i| (id, i));
                }
            }
        }
    }

    #[inline]
    fn entry(&self, id: NodeId, i: usize) -> (u64, &PageDesc) {
        let node = self.node(id);
        match &node.body {
            Body::Leaf(vals) => (node.keys[i], &vals[i]),
            Body::Interior(_) => unreachable!("cursor on interior node"),
        }
    }

    /// The valid range containing `addr`, with its start.
    #[must_use]
    pub fn find(&self, addr: u64) -> Option<(u64, &PageDesc)> {
        let (id, i) = self.floor(addr)?;
        let (start, desc) = self.entry(id, i);
        if desc.valid && addr - start < desc.size {
            return Some((start, desc));
        }
        if desc.valid {
            return None;
        }
        // a dead range may sit inside a live one declared after it
        self.iter()
            .take_while(|(k, _)| *k <= addr)
            .find(|(k, d)| d.valid && addr - k < d.size)
    }

    /// The range starting exactly at `start`.
    pub fn get_mut(&mut self, start: u64) -> Option<&mut PageDesc> {
        let (id, i) = self.floor(start)?;
        let node = self.node_mut(id);
        if node.keys[i] != start {
            return None;
        }
        match &mut node.body {
            Body::Leaf(vals) => Some(&mut vals[i]),
            Body::Interior(_) => None,
        }
    }

    fn leftmost(&self) -> Option<NodeId> {
        let mut id = self.root?;
        loop {
            match &self.node(id).body {
                Body::Leaf(_) => return Some(id),
                Body::Interior(kids) => id = kids[0],
            }
        }
    }

    /// All ranges in address order.
    #[must_use]
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            tree: self,
            node: self.leftmost(),
            index: 0,
        }
    }

    /// Ranges in address order, starting with the one at or below `addr`.
    #[must_use]
    pub fn iter_from(&self, addr: u64) -> Iter<'_> {
        match self.floor(addr) {
            Some((id, i)) => Iter {
                tree: self,
                node: Some(id),
                index: i,
            },
            None => self.iter(),
        }
    }

    /// Whether any valid range intersects `[start, start + size)`.
    #[must_use]
    pub fn overlaps(&self, start: u64, size: u64) -> bool {
        if self.find(start).is_some() {
            return true;
        }
        let end = start.saturating_add(size);
        self.iter_from(start)
            .take_while(|(k, _)| *k < end)
            .any(|(k, d)| d.valid && k.saturating_add(d.size) > start)
    }

    /// Lowest address `>= from` with `size` free bytes before the next
    /// valid range.
    #[must_use]
    pub fn find_gap(&self, from: u64, size: u64) -> Option<u64> {
        let mut candidate = match self.find(from) {
            Some((start, desc)) => start.checked_add(desc.size)?,
            None => from,
        };
        for (start, desc) in self.iter_from(from).filter(|(_, d)| d.valid) {
            let end = start.checked_add(desc.size)?;
            if end <= candidate {
                continue;
            }
            if start >= candidate.checked_add(size)? {
                break;
            }
            candidate = end;
        }
        candidate.checked_add(size).map(|_| candidate)
    }
}

/// Cursor walking the leaf chain.
pub struct Iter<'a> {
    tree: &'a VmemTree,
    node: Option<NodeId>,
    index: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (u64, &'a PageDesc);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = self.node?;
            let node = self.tree.node(id);
            if self.index < node.keys.len() {
                let item = self.tree.entry(id, self.index);
                self.index += 1;
                return Some(item);
            }
            self.node = node.next;
            self.index = 0;
        }
    }
}
