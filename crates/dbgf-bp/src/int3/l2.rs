use std::sync::{
    OnceLock,
    atomic::{AtomicU64, Ordering},
};

use dbgf_core::{DbgfConfig, DbgfDriver, DbgfError, RendezvousMode};
use smallvec::SmallVec;

use crate::{BreakpointHandle, bitmap::AtomicBitmap};

/// Index of a tree node.
///
/// The upper bits select the chunk, the lower 13 bits the node within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct L2Index(u32);

impl L2Index {
    pub const NIL: Self = Self(0x3f_ffff);

    const CHUNK_SHIFT: u32 = 13;
    const MASK: u64 = 0x3f_ffff;

    fn new(chunk: usize, index: usize) -> Self {
        Self(((chunk as u32) << Self::CHUNK_SHIFT) | index as u32)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw & Self::MASK as u32)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    fn chunk(self) -> usize {
        (self.0 >> Self::CHUNK_SHIFT) as usize
    }

    fn index(self) -> usize {
        (self.0 & ((1 << Self::CHUNK_SHIFT) - 1)) as usize
    }
}

//
// Node layout.
//
// word0: key (bits 0..48) | handle bits 0..16 (bits 48..64)
// word1: left (bits 0..22) | right (bits 22..44) | depth (bits 44..48) |
//        handle bits 16..32 (bits 48..64)
//

const KEY_MASK: u64 = (1 << 48) - 1;
const RIGHT_SHIFT: u32 = 22;
const DEPTH_SHIFT: u32 = 44;
const DEPTH_MAX: u8 = 15;
const HANDLE_SHIFT: u32 = 48;

/// A decoded tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct L2Node {
    pub key: u64,
    pub handle: BreakpointHandle,
    pub left: L2Index,
    pub right: L2Index,

    /// Height of the subtree below the node, saturating at 15.
    pub depth: u8,
}

impl L2Node {
    fn leaf(key: u64, handle: BreakpointHandle) -> Self {
        Self {
            key: key & KEY_MASK,
            handle,
            left: L2Index::NIL,
            right: L2Index::NIL,
            depth: 0,
        }
    }

    fn encode(&self) -> [u64; 2] {
        let handle = u64::from(self.handle.raw());

        [
            (self.key & KEY_MASK) | ((handle & 0xffff) << HANDLE_SHIFT),
            (u64::from(self.left.0) & L2Index::MASK)
                | ((u64::from(self.right.0) & L2Index::MASK) << RIGHT_SHIFT)
                | (u64::from(self.depth.min(DEPTH_MAX)) << DEPTH_SHIFT)
                | ((handle >> 16) << HANDLE_SHIFT),
        ]
    }

    fn decode([word0, word1]: [u64; 2]) -> Self {
        let handle = (word0 >> HANDLE_SHIFT) | ((word1 >> HANDLE_SHIFT) << 16);

        Self {
            key: word0 & KEY_MASK,
            handle: BreakpointHandle::from_raw(handle as u32).unwrap_or(BreakpointHandle::NIL),
            left: L2Index::from_raw(word1 as u32),
            right: L2Index::from_raw((word1 >> RIGHT_SHIFT) as u32),
            depth: ((word1 >> DEPTH_SHIFT) & 0xf) as u8,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.left == L2Index::NIL && self.right == L2Index::NIL
    }
}

#[derive(Default)]
struct NodeSlot {
    words: [AtomicU64; 2],
}

struct L2Chunk {
    bitmap: AtomicBitmap,
    nodes: Box<[NodeSlot]>,
}

impl L2Chunk {
    fn new() -> Self {
        const LEN: usize = DbgfConfig::L2_NODES_PER_CHUNK;

        Self {
            bitmap: AtomicBitmap::new(LEN),
            nodes: (0..LEN).map(|_| NodeSlot::default()).collect(),
        }
    }
}

/// Pool of binary search tree nodes for colliding software breakpoints.
///
/// Searching is lock-free. Every change to a tree's shape must be made by
/// the single holder of the tree lock in [`Int3Index`]; removals
/// additionally run inside a rendezvous, so no search can observe a node
/// while it is being rewritten or freed.
///
/// [`Int3Index`]: super::Int3Index
pub(crate) struct L2Pool {
    chunks: Box<[OnceLock<L2Chunk>]>,
    retries: u32,
}

impl L2Pool {
    pub fn new(config: &DbgfConfig) -> Self {
        Self {
            chunks: (0..config.l2_chunks()).map(|_| OnceLock::new()).collect(),
            retries: config.allocation_retries.max(1),
        }
    }

    fn capacity(&self) -> usize {
        self.chunks.len() * DbgfConfig::L2_NODES_PER_CHUNK
    }

    fn slot(&self, index: L2Index) -> Result<&NodeSlot, DbgfError> {
        let chunk = self
            .chunks
            .get(index.chunk())
            .and_then(OnceLock::get)
            .ok_or(DbgfError::Corrupted("tree node in unallocated chunk"))?;

        if !chunk.bitmap.is_set(index.index()) {
            return Err(DbgfError::Corrupted("tree node is free"));
        }

        chunk
            .nodes
            .get(index.index())
            .ok_or(DbgfError::Corrupted("tree node out of range"))
    }

    pub fn node(&self, index: L2Index) -> Result<L2Node, DbgfError> {
        let slot = self.slot(index)?;
        Ok(L2Node::decode([
            slot.words[0].load(Ordering::Acquire),
            slot.words[1].load(Ordering::Acquire),
        ]))
    }

    fn write(&self, index: L2Index, node: &L2Node) -> Result<(), DbgfError> {
        let slot = self.slot(index)?;
        let [word0, word1] = node.encode();

        // The link word goes last so a search never follows a new link
        // before the key it leads to is visible.
        slot.words[0].store(word0, Ordering::Release);
        slot.words[1].store(word1, Ordering::Release);
        Ok(())
    }

    /// Allocates a leaf node.
    pub fn allocate<Driver>(
        &self,
        driver: &Driver,
        config: &DbgfConfig,
        key: u64,
        handle: BreakpointHandle,
    ) -> Result<L2Index, DbgfError>
    where
        Driver: DbgfDriver,
    {
        for _ in 0..self.retries {
            let mut vacant = None;

            for (chunk_id, slot) in self.chunks.iter().enumerate() {
                let Some(chunk) = slot.get()
                else {
                    vacant.get_or_insert(chunk_id);
                    continue;
                };

                if let Some(index) = chunk.bitmap.claim() {
                    let index = L2Index::new(chunk_id, index);
                    self.write(index, &L2Node::leaf(key, handle))?;
                    return Ok(index);
                }
            }

            let Some(chunk_id) = vacant
            else {
                break;
            };

            let slot = &self.chunks[chunk_id];
            driver.rendezvous(RendezvousMode::Once, config.rendezvous_timeout, &|_vcpu| {
                slot.get_or_init(L2Chunk::new);
                Ok(())
            })?;

            tracing::debug!(chunk_id, "tree node chunk allocated");
        }

        Err(DbgfError::NoMoreSlots)
    }

    pub fn free(&self, index: L2Index) {
        let Some(chunk) = self.chunks.get(index.chunk()).and_then(OnceLock::get)
        else {
            return;
        };

        let slot = &chunk.nodes[index.index()];
        slot.words[0].store(0, Ordering::Relaxed);
        slot.words[1].store(0, Ordering::Relaxed);
        chunk.bitmap.clear(index.index());
    }

    /// Returns the number of allocated nodes.
    pub fn len(&self) -> usize {
        self.chunks
            .iter()
            .filter_map(OnceLock::get)
            .map(|chunk| chunk.bitmap.count())
            .sum()
    }

    /// Searches the tree rooted at `root` for `key`.
    ///
    /// A walk longer than the pool capacity can only be caused by a cycle
    /// and is reported as corruption.
    pub fn search(&self, root: L2Index, key: u64) -> Result<Option<BreakpointHandle>, DbgfError> {
        let key = key & KEY_MASK;
        let mut index = root;

        for _ in 0..=self.capacity() {
            if index == L2Index::NIL {
                return Ok(None);
            }

            let node = self.node(index)?;
            if key == node.key {
                return Ok(Some(node.handle));
            }

            index = if key < node.key { node.left } else { node.right };
        }

        Err(DbgfError::Corrupted("tree walk does not terminate"))
    }

    /// Inserts `key` into the tree rooted at `root`.
    ///
    /// Returns the handle already stored under `key`, if any.
    pub fn insert<Driver>(
        &self,
        driver: &Driver,
        config: &DbgfConfig,
        root: L2Index,
        key: u64,
        handle: BreakpointHandle,
    ) -> Result<Option<BreakpointHandle>, DbgfError>
    where
        Driver: DbgfDriver,
    {
        let key = key & KEY_MASK;
        let mut path = SmallVec::<[L2Index; 16]>::new();
        let mut index = root;

        loop {
            if path.len() > self.capacity() {
                return Err(DbgfError::Corrupted("tree walk does not terminate"));
            }

            let mut node = self.node(index)?;
            if key == node.key {
                return Ok(Some(node.handle));
            }

            path.push(index);

            let next = if key < node.key { node.left } else { node.right };
            if next != L2Index::NIL {
                index = next;
                continue;
            }

            let leaf = self.allocate(driver, config, key, handle)?;
            if key < node.key {
                node.left = leaf;
            }
            else {
                node.right = leaf;
            }

            self.write(index, &node)?;
            self.update_depths(&path)?;
            return Ok(None);
        }
    }

    /// Links `leaf` as a child of `root` according to its key.
    pub fn link(&self, root: L2Index, leaf: L2Index) -> Result<(), DbgfError> {
        let mut parent = self.node(root)?;
        let child = self.node(leaf)?;

        if child.key < parent.key {
            parent.left = leaf;
        }
        else {
            parent.right = leaf;
        }

        self.write(root, &parent)?;
        self.update_depths(&[root])
    }

    /// Removes `key` from the tree rooted at `root` and returns the new
    /// root, which is [`L2Index::NIL`] if the tree became empty.
    ///
    /// Must only run while every virtual CPU is held at a safe point.
    pub fn remove(
        &self,
        root: L2Index,
        key: u64,
        handle: BreakpointHandle,
    ) -> Result<L2Index, DbgfError> {
        let key = key & KEY_MASK;
        let mut path = SmallVec::<[L2Index; 16]>::new();
        let mut parent = L2Index::NIL;
        let mut index = root;

        let mut node = loop {
            if index == L2Index::NIL {
                return Err(DbgfError::Corrupted("breakpoint missing from its tree"));
            }

            if path.len() > self.capacity() {
                return Err(DbgfError::Corrupted("tree walk does not terminate"));
            }

            let node = self.node(index)?;
            if key == node.key {
                break node;
            }

            parent = index;
            path.push(index);
            index = if key < node.key { node.left } else { node.right };
        };

        if node.handle != handle {
            return Err(DbgfError::Corrupted("tree key maps to another breakpoint"));
        }

        let mut new_root = root;

        if node.right == L2Index::NIL {
            // Promote the left subtree.
            if parent == L2Index::NIL {
                new_root = node.left;
            }
            else {
                self.replace_child(parent, index, node.left)?;
            }

            self.free(index);
        }
        else {
            // Replace the node with its in-order successor.
            path.push(index);

            let mut successor_parent = index;
            let mut successor_index = node.right;
            let mut successor = self.node(successor_index)?;

            while successor.left != L2Index::NIL {
                successor_parent = successor_index;
                path.push(successor_index);
                successor_index = successor.left;
                successor = self.node(successor_index)?;
            }

            if successor_parent == index {
                node.right = successor.right;
            }
            else {
                self.replace_child(successor_parent, successor_index, successor.right)?;
            }

            node.key = successor.key;
            node.handle = successor.handle;
            self.write(index, &node)?;
            self.free(successor_index);
        }

        self.update_depths(&path)?;
        Ok(new_root)
    }

    fn replace_child(
        &self,
        parent: L2Index,
        old: L2Index,
        new: L2Index,
    ) -> Result<(), DbgfError> {
        let mut node = self.node(parent)?;

        if node.left == old {
            node.left = new;
        }
        else if node.right == old {
            node.right = new;
        }
        else {
            return Err(DbgfError::Corrupted("tree parent does not link child"));
        }

        self.write(parent, &node)
    }

    /// Recomputes the depth hints along `path`, deepest node last.
    fn update_depths(&self, path: &[L2Index]) -> Result<(), DbgfError> {
        for &index in path.iter().rev() {
            let mut node = self.node(index)?;
            let depth = [node.left, node.right]
                .into_iter()
                .filter(|&child| child != L2Index::NIL)
                .map(|child| self.node(child).map(|child| child.depth.saturating_add(1)))
                .try_fold(0, |depth, child| child.map(|child| depth.max(child)))?
                .min(DEPTH_MAX);

            if depth == node.depth {
                break;
            }

            node.depth = depth;
            self.write(index, &node)?;
        }

        Ok(())
    }
}
