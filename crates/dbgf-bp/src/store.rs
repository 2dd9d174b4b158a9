use std::sync::{
    OnceLock,
    atomic::{AtomicU32, AtomicU64, Ordering},
};

use dbgf_core::{
    DbgfConfig, DbgfDriver, DbgfError, HwAccess, IoAccess, IoPort, Pa, RendezvousMode, Va,
};

use crate::{
    BreakpointFlags, BreakpointHandle, BreakpointInfo, BreakpointKind, OwnerHandle,
    bitmap::AtomicBitmap,
};

//
// State word layout.
//
// Bits 0..8 hold the kind tag (0 while the record is free), bits 8..24 the
// breakpoint flags and bit 31 marks a record that is being cleared.
//

const KIND_MASK: u32 = 0xff;
const FLAGS_SHIFT: u32 = 8;
const CLEARING: u32 = 1 << 31;

const KIND_FREE: u32 = 0;
const KIND_REGISTER: u32 = 1;
const KIND_INT3: u32 = 2;
const KIND_PORT_IO: u32 = 3;
const KIND_MMIO: u32 = 4;

/// Everything needed to initialize a freshly claimed record.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordInit {
    pub kind: BreakpointKind,
    pub owner: Option<OwnerHandle>,
    pub user: u64,
    pub hit_trigger: u64,
    pub hit_disable: u64,

    /// Flags other than [`BreakpointFlags::ENABLED`], which is only ever set
    /// by arming.
    pub flags: BreakpointFlags,
}

/// A breakpoint record.
///
/// Every field is atomic, so the trap path can read records while the
/// management path updates them.
#[derive(Default)]
pub(crate) struct Record {
    state: AtomicU32,
    owner: AtomicU32,
    hits: AtomicU64,
    hit_trigger: AtomicU64,
    hit_disable: AtomicU64,
    user: AtomicU64,
    payload: [AtomicU64; 3],
}

impl Record {
    fn init(&self, init: &RecordInit) {
        let (kind, payload) = encode_kind(&init.kind);
        let flags = init.flags.difference(BreakpointFlags::ENABLED);

        self.owner.store(
            init.owner.map_or(u32::MAX, OwnerHandle::raw),
            Ordering::Relaxed,
        );
        self.hits.store(0, Ordering::Relaxed);
        self.hit_trigger.store(init.hit_trigger, Ordering::Relaxed);
        self.hit_disable.store(init.hit_disable, Ordering::Relaxed);
        self.user.store(init.user, Ordering::Relaxed);
        for (word, value) in self.payload.iter().zip(payload) {
            word.store(value, Ordering::Relaxed);
        }

        // Publishes the fields above.
        self.state.store(
            kind | (u32::from(flags.bits()) << FLAGS_SHIFT),
            Ordering::Release,
        );
    }

    fn reset(&self) {
        self.state.store(KIND_FREE, Ordering::Release);
        self.owner.store(u32::MAX, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.user.store(0, Ordering::Relaxed);
        for word in &self.payload {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub fn is_live(&self) -> bool {
        self.state.load(Ordering::Acquire) & KIND_MASK != KIND_FREE
    }

    pub fn is_clearing(&self) -> bool {
        self.state.load(Ordering::Acquire) & CLEARING != 0
    }

    pub fn owner(&self) -> Option<OwnerHandle> {
        OwnerHandle::from_raw(self.owner.load(Ordering::Relaxed))
    }

    pub fn user(&self) -> u64 {
        self.user.load(Ordering::Relaxed)
    }

    pub fn flags(&self) -> BreakpointFlags {
        flags_of(self.state.load(Ordering::Acquire))
    }

    pub fn kind(&self) -> Option<BreakpointKind> {
        let state = self.state.load(Ordering::Acquire);
        let payload = self.payload.each_ref().map(|word| word.load(Ordering::Relaxed));
        decode_kind(state & KIND_MASK, payload)
    }

    /// Returns the address of a software breakpoint.
    pub fn int3_va(&self) -> Option<Va> {
        match self.state.load(Ordering::Acquire) & KIND_MASK {
            KIND_INT3 => Some(Va(self.payload[0].load(Ordering::Relaxed))),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> Option<BreakpointInfo> {
        let state = self.state.load(Ordering::Acquire);
        let payload = self.payload.each_ref().map(|word| word.load(Ordering::Relaxed));

        Some(BreakpointInfo {
            owner: self.owner(),
            kind: decode_kind(state & KIND_MASK, payload)?,
            flags: flags_of(state),
            hits: self.hits.load(Ordering::Relaxed),
            hit_trigger: self.hit_trigger.load(Ordering::Relaxed),
            hit_disable: self.hit_disable.load(Ordering::Relaxed),
            user: self.user(),
        })
    }

    /// Sets the enabled flag. Returns `false` if it was already set.
    pub fn set_enabled(&self) -> bool {
        let bit = u32::from(BreakpointFlags::ENABLED.bits()) << FLAGS_SHIFT;
        self.state.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    /// Clears the enabled flag. Returns `false` if it was already clear.
    pub fn clear_enabled(&self) -> bool {
        let bit = u32::from(BreakpointFlags::ENABLED.bits()) << FLAGS_SHIFT;
        self.state.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    /// Marks the record as being cleared.
    ///
    /// Returns `false` if another caller got there first.
    pub fn begin_clear(&self) -> bool {
        self.state.fetch_or(CLEARING, Ordering::AcqRel) & CLEARING == 0
    }

    pub fn abort_clear(&self) {
        self.state.fetch_and(!CLEARING, Ordering::AcqRel);
    }

    /// Counts a hit and returns the new total.
    pub fn count_hit(&self) -> u64 {
        self.hits.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Returns `true` if the `hits`-th hit notifies the owner.
    pub fn in_hit_window(&self, hits: u64) -> bool {
        let trigger = self.hit_trigger.load(Ordering::Relaxed);
        let disable = self.hit_disable.load(Ordering::Relaxed);
        trigger <= hits && hits <= disable
    }

    /// Stores the byte replaced by a software breakpoint.
    pub fn set_original(&self, original: u8) {
        self.payload[2].store(u64::from(original), Ordering::Release);
    }

    /// Stores the hardware slot of a register breakpoint.
    pub fn set_hw_slot(&self, slot: u8) {
        let word = &self.payload[1];
        let value = word.load(Ordering::Relaxed) & !(0xff << 16);
        word.store(value | (u64::from(slot) << 16), Ordering::Release);
    }
}

fn flags_of(state: u32) -> BreakpointFlags {
    BreakpointFlags::from_bits_truncate((state >> FLAGS_SHIFT) as u16)
}

fn encode_kind(kind: &BreakpointKind) -> (u32, [u64; 3]) {
    match *kind {
        BreakpointKind::Register {
            address,
            access,
            size,
            slot,
        } => (
            KIND_REGISTER,
            [
                address,
                u64::from(access.bits()) | (u64::from(size) << 8) | (u64::from(slot) << 16),
                0,
            ],
        ),
        BreakpointKind::Int3 { va, pa, original } => {
            (KIND_INT3, [va.0, pa.0, u64::from(original)])
        }
        BreakpointKind::PortIo {
            port,
            count,
            access,
        } => (
            KIND_PORT_IO,
            [
                u64::from(port.0) | (u64::from(count) << 16) | (u64::from(access.bits()) << 32),
                0,
                0,
            ],
        ),
        BreakpointKind::Mmio { pa, size, access } => (
            KIND_MMIO,
            [pa.0, u64::from(size) | (u64::from(access.bits()) << 32), 0],
        ),
    }
}

fn decode_kind(kind: u32, payload: [u64; 3]) -> Option<BreakpointKind> {
    match kind {
        KIND_REGISTER => Some(BreakpointKind::Register {
            address: payload[0],
            access: HwAccess::from_bits(payload[1] as u8)?,
            size: (payload[1] >> 8) as u8,
            slot: (payload[1] >> 16) as u8,
        }),
        KIND_INT3 => Some(BreakpointKind::Int3 {
            va: Va(payload[0]),
            pa: Pa(payload[1]),
            original: payload[2] as u8,
        }),
        KIND_PORT_IO => Some(BreakpointKind::PortIo {
            port: IoPort(payload[0] as u16),
            count: (payload[0] >> 16) as u16,
            access: IoAccess::from_bits_truncate((payload[0] >> 32) as u8),
        }),
        KIND_MMIO => Some(BreakpointKind::Mmio {
            pa: Pa(payload[0]),
            size: payload[1] as u32,
            access: IoAccess::from_bits_truncate((payload[1] >> 32) as u8),
        }),
        _ => None,
    }
}

struct Chunk {
    bitmap: AtomicBitmap,
    records: Box<[Record]>,

    // User data for reduced-context callbacks, indexed like `records`.
    reduced_user: Box<[AtomicU64]>,
}

impl Chunk {
    fn new() -> Self {
        const LEN: usize = DbgfConfig::BREAKPOINTS_PER_CHUNK;

        Self {
            bitmap: AtomicBitmap::new(LEN),
            records: (0..LEN).map(|_| Record::default()).collect(),
            reduced_user: (0..LEN).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

/// Chunked storage of breakpoint records.
///
/// Chunks are allocated on demand. A chunk is installed inside a rendezvous
/// so that every virtual CPU observes it before any handle into it is
/// handed out.
pub(crate) struct BreakpointStore {
    chunks: Box<[OnceLock<Chunk>]>,
    retries: u32,
}

impl BreakpointStore {
    pub fn new(config: &DbgfConfig) -> Self {
        Self {
            chunks: (0..config.breakpoint_chunks())
                .map(|_| OnceLock::new())
                .collect(),
            retries: config.allocation_retries.max(1),
        }
    }

    /// Claims a free record and initializes it.
    pub fn allocate<Driver>(
        &self,
        driver: &Driver,
        config: &DbgfConfig,
        init: &RecordInit,
    ) -> Result<(BreakpointHandle, &Record), DbgfError>
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
                    let record = &chunk.records[index];
                    record.init(init);
                    return Ok((BreakpointHandle::new(chunk_id, index), record));
                }
            }

            // Every allocated chunk is full.
            let Some(chunk_id) = vacant
            else {
                break;
            };

            self.allocate_chunk(driver, config, chunk_id)?;
        }

        Err(DbgfError::NoMoreSlots)
    }

    fn allocate_chunk<Driver>(
        &self,
        driver: &Driver,
        config: &DbgfConfig,
        chunk_id: usize,
    ) -> Result<(), DbgfError>
    where
        Driver: DbgfDriver,
    {
        let slot = &self.chunks[chunk_id];

        driver.rendezvous(RendezvousMode::Once, config.rendezvous_timeout, &|_vcpu| {
            slot.get_or_init(Chunk::new);
            Ok(())
        })?;

        tracing::debug!(chunk_id, "breakpoint chunk allocated");
        Ok(())
    }

    /// Returns the live record behind `handle`.
    pub fn get(&self, handle: BreakpointHandle) -> Option<&Record> {
        let chunk = self.chunks.get(handle.chunk())?.get()?;
        if !chunk.bitmap.is_set(handle.index()) {
            return None;
        }

        let record = chunk.records.get(handle.index())?;
        record.is_live().then_some(record)
    }

    /// Returns the record behind `handle`, failing with
    /// [`DbgfError::Corrupted`] if an index structure referenced a free
    /// record.
    pub fn resolve(&self, handle: BreakpointHandle) -> Result<&Record, DbgfError> {
        self.get(handle)
            .ok_or(DbgfError::Corrupted("index references a free breakpoint"))
    }

    pub fn free(&self, handle: BreakpointHandle) {
        let Some(chunk) = self.chunks.get(handle.chunk()).and_then(OnceLock::get)
        else {
            return;
        };

        chunk.records[handle.index()].reset();
        chunk.reduced_user[handle.index()].store(0, Ordering::Relaxed);
        chunk.bitmap.clear(handle.index());
    }

    pub fn reduced_user(&self, handle: BreakpointHandle) -> u64 {
        self.chunks
            .get(handle.chunk())
            .and_then(OnceLock::get)
            .and_then(|chunk| chunk.reduced_user.get(handle.index()))
            .map_or(0, |user| user.load(Ordering::Relaxed))
    }

    pub fn set_reduced_user(&self, handle: BreakpointHandle, user: u64) -> Result<(), DbgfError> {
        if self.get(handle).is_none() {
            return Err(DbgfError::InvalidHandle);
        }

        let chunk = self
            .chunks
            .get(handle.chunk())
            .and_then(OnceLock::get)
            .ok_or(DbgfError::InvalidHandle)?;

        chunk.reduced_user[handle.index()].store(user, Ordering::Relaxed);
        Ok(())
    }

    /// Iterates over the handles of allocated records.
    pub fn handles(&self) -> impl Iterator<Item = BreakpointHandle> + '_ {
        self.chunks
            .iter()
            .enumerate()
            .filter_map(|(chunk_id, slot)| Some((chunk_id, slot.get()?)))
            .flat_map(|(chunk_id, chunk)| {
                chunk
                    .bitmap
                    .iter_set()
                    .map(move |index| BreakpointHandle::new(chunk_id, index))
            })
    }

    pub fn allocated_chunks(&self) -> usize {
        self.chunks.iter().filter(|slot| slot.get().is_some()).count()
    }
}
