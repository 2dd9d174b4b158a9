use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicU32, Ordering},
};

use dbgf_core::{
    DbgfConfig, DbgfDriver, DbgfError, HitPhase, IoAccess, IoPort, RendezvousMode, VcpuId,
    Verdict,
};

use crate::{BreakpointHandle, BreakpointInfo, OwnerHandle, bitmap::AtomicBitmap};

/// An execution hit delivered to an owner.
#[derive(Debug)]
pub struct Hit<'a> {
    /// The virtual CPU that hit the breakpoint.
    pub vcpu: VcpuId,

    /// The breakpoint that was hit.
    pub handle: BreakpointHandle,

    /// State of the breakpoint at the time of the hit.
    pub info: &'a BreakpointInfo,

    /// User data of the context the callback runs in.
    pub user: u64,

    /// Whether the instruction has executed yet.
    pub phase: HitPhase,
}

/// A port I/O hit delivered to an owner.
#[derive(Debug)]
pub struct IoHit<'a> {
    /// The virtual CPU that performed the access.
    pub vcpu: VcpuId,

    /// The breakpoint that was hit.
    pub handle: BreakpointHandle,

    /// State of the breakpoint at the time of the hit.
    pub info: &'a BreakpointInfo,

    /// User data of the context the callback runs in.
    pub user: u64,

    /// Whether the access has been performed yet.
    pub phase: HitPhase,

    /// The accessed port.
    pub port: IoPort,

    /// Direction and width of the access.
    pub access: IoAccess,

    /// The written value, or for reads after the access, the value read.
    pub value: u32,
}

/// Callback notified on execution hits.
pub type ExecCallback = Arc<dyn Fn(&Hit<'_>) -> Verdict + Send + Sync>;

/// Callback notified on port I/O hits.
pub type IoCallback = Arc<dyn Fn(&IoHit<'_>) -> Verdict + Send + Sync>;

/// The callbacks of one owner.
#[derive(Default, Clone)]
pub(crate) struct OwnerCallbacks {
    pub exec: Option<ExecCallback>,
    pub io: Option<IoCallback>,
    pub reduced_exec: Option<ExecCallback>,
    pub reduced_io: Option<IoCallback>,
}

#[derive(Default)]
struct OwnerSlot {
    refs: AtomicU32,

    // Written while `refs` pins the slot. Read from the trap path.
    callbacks: spin::RwLock<OwnerCallbacks>,
}

struct OwnerChunk {
    bitmap: AtomicBitmap,
    slots: Box<[OwnerSlot]>,
}

impl OwnerChunk {
    fn new() -> Self {
        Self {
            bitmap: AtomicBitmap::new(OwnerRegistry::OWNERS_PER_CHUNK),
            slots: (0..OwnerRegistry::OWNERS_PER_CHUNK)
                .map(|_| OwnerSlot::default())
                .collect(),
        }
    }
}

/// Registry of breakpoint owners.
///
/// Every live owner holds one self-reference; every breakpoint that names
/// the owner holds one more. An owner can only be destroyed while the
/// self-reference is the only one left.
///
/// Owner slots live in chunks allocated on demand, like breakpoint records.
pub(crate) struct OwnerRegistry {
    chunks: Box<[OnceLock<OwnerChunk>]>,
}

impl OwnerRegistry {
    pub const OWNERS_PER_CHUNK: usize = 512;
    pub const MAX_CHUNKS: usize = 64;

    pub fn new() -> Self {
        Self {
            chunks: (0..Self::MAX_CHUNKS).map(|_| OnceLock::new()).collect(),
        }
    }

    pub fn create<Driver>(
        &self,
        driver: &Driver,
        config: &DbgfConfig,
        exec: Option<ExecCallback>,
        io: Option<IoCallback>,
    ) -> Result<OwnerHandle, DbgfError>
    where
        Driver: DbgfDriver,
    {
        if exec.is_none() && io.is_none() {
            return Err(DbgfError::InvalidParameter(
                "owner requires at least one callback",
            ));
        }

        let (index, slot) = self.claim(driver, config)?;
        *slot.callbacks.write() = OwnerCallbacks {
            exec,
            io,
            ..Default::default()
        };
        slot.refs.store(1, Ordering::Release);

        Ok(OwnerHandle::new(index))
    }

    fn claim<Driver>(
        &self,
        driver: &Driver,
        config: &DbgfConfig,
    ) -> Result<(usize, &OwnerSlot), DbgfError>
    where
        Driver: DbgfDriver,
    {
        for _ in 0..config.allocation_retries {
            let mut vacant = None;

            for (chunk_id, slot) in self.chunks.iter().enumerate() {
                let Some(chunk) = slot.get()
                else {
                    vacant.get_or_insert(chunk_id);
                    continue;
                };

                if let Some(index) = chunk.bitmap.claim() {
                    let owner = chunk_id * Self::OWNERS_PER_CHUNK + index;
                    return Ok((owner, &chunk.slots[index]));
                }
            }

            let Some(chunk_id) = vacant
            else {
                break;
            };

            let slot = &self.chunks[chunk_id];
            driver.rendezvous(RendezvousMode::Once, config.rendezvous_timeout, &|_vcpu| {
                slot.get_or_init(OwnerChunk::new);
                Ok(())
            })?;

            tracing::debug!(chunk_id, "owner chunk allocated");
        }

        Err(DbgfError::NoMoreSlots)
    }

    pub fn destroy(&self, owner: OwnerHandle) -> Result<(), DbgfError> {
        let (chunk, index) = self.locate(owner)?;
        let slot = &chunk.slots[index];

        match slot
            .refs
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(0) => return Err(DbgfError::InvalidHandle),
            Err(_) => return Err(DbgfError::OwnerBusy),
        }

        *slot.callbacks.write() = OwnerCallbacks::default();
        chunk.bitmap.clear(index);
        Ok(())
    }

    /// Takes a reference on behalf of a breakpoint.
    pub fn retain(&self, owner: OwnerHandle) -> Result<(), DbgfError> {
        self.slot(owner)?
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                (refs != 0).then(|| refs + 1)
            })
            .map(drop)
            .map_err(|_| DbgfError::InvalidHandle)
    }

    /// Drops a reference taken by [`OwnerRegistry::retain`].
    pub fn release(&self, owner: OwnerHandle) {
        let Ok(slot) = self.slot(owner)
        else {
            return;
        };

        let previous = slot.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 1, "released the self-reference of {owner}");
    }

    pub fn set_up_reduced(
        &self,
        owner: OwnerHandle,
        exec: Option<ExecCallback>,
        io: Option<IoCallback>,
    ) -> Result<(), DbgfError> {
        let slot = self.live_slot(owner)?;
        let mut callbacks = slot.callbacks.write();

        if exec.is_some() && callbacks.exec.is_none() {
            return Err(DbgfError::InvalidParameter(
                "owner has no execution callback",
            ));
        }

        if io.is_some() && callbacks.io.is_none() {
            return Err(DbgfError::InvalidParameter("owner has no I/O callback"));
        }

        callbacks.reduced_exec = exec;
        callbacks.reduced_io = io;
        Ok(())
    }

    pub fn callbacks(&self, owner: OwnerHandle) -> Result<OwnerCallbacks, DbgfError> {
        Ok(self.live_slot(owner)?.callbacks.read().clone())
    }

    #[cfg(test)]
    pub fn references(&self, owner: OwnerHandle) -> u32 {
        self.slot(owner)
            .map(|slot| slot.refs.load(Ordering::Acquire))
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn allocated_chunks(&self) -> usize {
        self.chunks.iter().filter(|slot| slot.get().is_some()).count()
    }

    fn locate(&self, owner: OwnerHandle) -> Result<(&OwnerChunk, usize), DbgfError> {
        let chunk = self
            .chunks
            .get(owner.index() / Self::OWNERS_PER_CHUNK)
            .and_then(OnceLock::get)
            .ok_or(DbgfError::InvalidHandle)?;

        Ok((chunk, owner.index() % Self::OWNERS_PER_CHUNK))
    }

    fn slot(&self, owner: OwnerHandle) -> Result<&OwnerSlot, DbgfError> {
        let (chunk, index) = self.locate(owner)?;
        Ok(&chunk.slots[index])
    }

    fn live_slot(&self, owner: OwnerHandle) -> Result<&OwnerSlot, DbgfError> {
        let slot = self.slot(owner)?;
        match slot.refs.load(Ordering::Acquire) {
            0 => Err(DbgfError::InvalidHandle),
            _ => Ok(slot),
        }
    }
}
