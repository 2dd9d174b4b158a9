//! Two-level address index of software breakpoints.
//!
//! The first level is a flat table with one entry per 64 KiB bucket of the
//! low 32 address bits. An entry is either empty, a direct handle to the
//! only breakpoint in its bucket, or the root of a binary search tree that
//! holds every breakpoint of the bucket keyed by the remaining address bits.

mod l2;

use std::sync::{
    Mutex, OnceLock, PoisonError,
    atomic::{AtomicU32, Ordering},
};

use dbgf_core::{DbgfConfig, DbgfDriver, DbgfError, RendezvousMode, Va};

use self::l2::{L2Index, L2Pool};
use crate::{BreakpointHandle, store::BreakpointStore};

const L1_ENTRIES: usize = 0x10000;

/// Returns the first level slot of `va`.
pub(crate) fn l1_index(va: Va) -> usize {
    ((va.0 >> 16) & 0xffff) as usize
}

/// Returns the tree key of `va`.
///
/// Together with the first level slot the key identifies the full address.
pub(crate) fn l2_key(va: Va) -> u64 {
    ((va.0 >> 32) << 16) | (va.0 & 0xffff)
}

/// A decoded first level entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum L1Entry {
    Empty,
    Direct(BreakpointHandle),
    Tree(L2Index),
}

impl L1Entry {
    const TYPE_SHIFT: u32 = 28;
    const VALUE_MASK: u32 = (1 << Self::TYPE_SHIFT) - 1;

    const TYPE_EMPTY: u32 = 0;
    const TYPE_DIRECT: u32 = 1;
    const TYPE_TREE: u32 = 2;

    fn encode(self) -> u32 {
        match self {
            Self::Empty => Self::TYPE_EMPTY << Self::TYPE_SHIFT,
            Self::Direct(handle) => {
                (Self::TYPE_DIRECT << Self::TYPE_SHIFT) | (handle.raw() & Self::VALUE_MASK)
            }
            Self::Tree(root) => (Self::TYPE_TREE << Self::TYPE_SHIFT) | root.raw(),
        }
    }

    fn decode(raw: u32) -> Result<Self, DbgfError> {
        let value = raw & Self::VALUE_MASK;

        match raw >> Self::TYPE_SHIFT {
            Self::TYPE_EMPTY => Ok(Self::Empty),
            Self::TYPE_DIRECT => BreakpointHandle::from_raw(value)
                .map(Self::Direct)
                .ok_or(DbgfError::Corrupted("L1 entry holds a nil handle")),
            Self::TYPE_TREE => Ok(Self::Tree(L2Index::from_raw(value))),
            _ => Err(DbgfError::Corrupted("L1 entry has an unknown type")),
        }
    }
}

/// Address index of software breakpoints.
pub(crate) struct Int3Index {
    l1: OnceLock<Box<[AtomicU32]>>,
    l2: L2Pool,

    // Serializes every change to the shape of the index.
    lock: Mutex<()>,
}

impl Int3Index {
    pub fn new(config: &DbgfConfig) -> Self {
        Self {
            l1: OnceLock::new(),
            l2: L2Pool::new(config),
            lock: Mutex::new(()),
        }
    }

    fn l1_table<Driver>(
        &self,
        driver: &Driver,
        config: &DbgfConfig,
    ) -> Result<&[AtomicU32], DbgfError>
    where
        Driver: DbgfDriver,
    {
        if let Some(l1) = self.l1.get() {
            return Ok(l1);
        }

        driver.rendezvous(RendezvousMode::Once, config.rendezvous_timeout, &|_vcpu| {
            self.l1.get_or_init(|| {
                (0..L1_ENTRIES)
                    .map(|_| AtomicU32::new(L1Entry::Empty.encode()))
                    .collect()
            });
            Ok(())
        })?;

        tracing::debug!("software breakpoint table allocated");

        self.l1
            .get()
            .map(|l1| &**l1)
            .ok_or(DbgfError::Other("rendezvous did not run its worker"))
    }

    /// Returns the first level entry covering `va`.
    pub fn entry(&self, va: Va) -> Result<L1Entry, DbgfError> {
        match self.l1.get() {
            Some(l1) => L1Entry::decode(l1[l1_index(va)].load(Ordering::Acquire)),
            None => Ok(L1Entry::Empty),
        }
    }

    /// Returns the number of tree nodes in use.
    pub fn l2_len(&self) -> usize {
        self.l2.len()
    }

    /// Looks up the breakpoint at `va`.
    ///
    /// Lock-free; safe to call from the trap path.
    pub fn lookup(
        &self,
        store: &BreakpointStore,
        va: Va,
    ) -> Result<Option<BreakpointHandle>, DbgfError> {
        match self.entry(va)? {
            L1Entry::Empty => Ok(None),
            L1Entry::Direct(handle) => {
                let record = store.resolve(handle)?;
                match record.int3_va() {
                    Some(address) if address == va => Ok(Some(handle)),
                    Some(_) => Ok(None),
                    None => Err(DbgfError::Corrupted("L1 entry references a non-INT3 breakpoint")),
                }
            }
            L1Entry::Tree(root) => self.l2.search(root, l2_key(va)),
        }
    }

    /// Adds `handle` as the breakpoint at `va`.
    ///
    /// Returns the handle already registered at `va`, if any, in which case
    /// the index is left unchanged.
    pub fn insert<Driver>(
        &self,
        driver: &Driver,
        config: &DbgfConfig,
        store: &BreakpointStore,
        va: Va,
        handle: BreakpointHandle,
    ) -> Result<Option<BreakpointHandle>, DbgfError>
    where
        Driver: DbgfDriver,
    {
        let l1 = self.l1_table(driver, config)?;
        let slot = &l1[l1_index(va)];

        // Fast path for an empty bucket.
        if slot
            .compare_exchange(
                L1Entry::Empty.encode(),
                L1Entry::Direct(handle).encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            return Ok(None);
        }

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            let raw = slot.load(Ordering::Acquire);

            match L1Entry::decode(raw)? {
                L1Entry::Empty => {
                    if slot
                        .compare_exchange(
                            raw,
                            L1Entry::Direct(handle).encode(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return Ok(None);
                    }
                }

                L1Entry::Direct(existing) => {
                    let existing_va = store.resolve(existing)?.int3_va().ok_or(
                        DbgfError::Corrupted("L1 entry references a non-INT3 breakpoint"),
                    )?;

                    if existing_va == va {
                        return Ok(Some(existing));
                    }

                    let root =
                        self.convert_to_tree(driver, config, existing_va, existing, va, handle)?;
                    if slot
                        .compare_exchange(
                            raw,
                            L1Entry::Tree(root).encode(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        tracing::trace!(%va, %existing_va, "L1 entry converted to tree");
                        return Ok(None);
                    }

                    // Entry changed under us; drop the tree and retry.
                    self.release_tree(root)?;
                }

                L1Entry::Tree(root) => {
                    return self.l2.insert(driver, config, root, l2_key(va), handle);
                }
            }
        }
    }

    fn convert_to_tree<Driver>(
        &self,
        driver: &Driver,
        config: &DbgfConfig,
        existing_va: Va,
        existing: BreakpointHandle,
        va: Va,
        handle: BreakpointHandle,
    ) -> Result<L2Index, DbgfError>
    where
        Driver: DbgfDriver,
    {
        let root = self.l2.allocate(driver, config, l2_key(existing_va), existing)?;

        let leaf = match self.l2.allocate(driver, config, l2_key(va), handle) {
            Ok(leaf) => leaf,
            Err(err) => {
                self.l2.free(root);
                return Err(err);
            }
        };

        if let Err(err) = self.l2.link(root, leaf) {
            self.l2.free(leaf);
            self.l2.free(root);
            return Err(err);
        }

        Ok(root)
    }

    fn release_tree(&self, root: L2Index) -> Result<(), DbgfError> {
        let node = self.l2.node(root)?;
        for child in [node.left, node.right] {
            if child != L2Index::NIL {
                self.l2.free(child);
            }
        }

        self.l2.free(root);
        Ok(())
    }

    /// Removes the breakpoint `handle` registered at `va`.
    ///
    /// Runs inside a rendezvous. A tree left with a single node collapses
    /// back into a direct entry.
    pub fn remove<Driver>(
        &self,
        driver: &Driver,
        config: &DbgfConfig,
        va: Va,
        handle: BreakpointHandle,
    ) -> Result<(), DbgfError>
    where
        Driver: DbgfDriver,
    {
        let l1 = self
            .l1
            .get()
            .ok_or(DbgfError::Corrupted("software breakpoint table missing"))?;
        let slot = &l1[l1_index(va)];

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        driver.rendezvous(RendezvousMode::Once, config.rendezvous_timeout, &|_vcpu| {
            self.remove_locked(slot, va, handle)
        })
    }

    fn remove_locked(
        &self,
        slot: &AtomicU32,
        va: Va,
        handle: BreakpointHandle,
    ) -> Result<(), DbgfError> {
        match L1Entry::decode(slot.load(Ordering::Acquire))? {
            L1Entry::Direct(existing) if existing == handle => {
                slot.store(L1Entry::Empty.encode(), Ordering::Release);
                Ok(())
            }

            L1Entry::Tree(root) => {
                let new_root = self.l2.remove(root, l2_key(va), handle)?;
                if new_root == L2Index::NIL {
                    slot.store(L1Entry::Empty.encode(), Ordering::Release);
                    return Ok(());
                }

                let node = self.l2.node(new_root)?;
                if !node.is_leaf() {
                    slot.store(L1Entry::Tree(new_root).encode(), Ordering::Release);
                    return Ok(());
                }

                slot.store(L1Entry::Direct(node.handle).encode(), Ordering::Release);
                self.l2.free(new_root);
                tracing::trace!(%va, "tree collapsed into L1 entry");
                Ok(())
            }

            _ => Err(DbgfError::Corrupted("breakpoint missing from its L1 entry")),
        }
    }
}
