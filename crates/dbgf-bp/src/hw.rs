use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use dbgf_core::{
    DbgfError, HwAccess, HwBreakpoint, HwBreakpoints, IoPort, arch::MAX_HW_BREAKPOINTS,
};

use crate::BreakpointHandle;

struct HwSlot {
    handle: AtomicU32,
    enabled: AtomicBool,
    address: AtomicU64,
    access: AtomicU8,
    size: AtomicU8,
}

impl HwSlot {
    fn new() -> Self {
        Self {
            handle: AtomicU32::new(BreakpointHandle::NIL.raw()),
            enabled: AtomicBool::new(false),
            address: AtomicU64::new(0),
            access: AtomicU8::new(0),
            size: AtomicU8::new(0),
        }
    }

    fn handle(&self) -> Option<BreakpointHandle> {
        BreakpointHandle::from_raw(self.handle.load(Ordering::Acquire))
    }

    fn breakpoint(&self) -> Option<HwBreakpoint> {
        Some(HwBreakpoint {
            address: self.address.load(Ordering::Relaxed),
            access: HwAccess::from_bits(self.access.load(Ordering::Relaxed))?,
            size: self.size.load(Ordering::Relaxed),
        })
    }
}

/// The global hardware breakpoint slot table.
///
/// Slot contents are shared by every virtual CPU; each one loads the same
/// debug register state during the rendezvous that follows a change.
pub(crate) struct HwSlots {
    slots: [HwSlot; MAX_HW_BREAKPOINTS],
    count: usize,
    enabled: AtomicU32,
    enabled_io: AtomicU32,
}

impl HwSlots {
    pub fn new(count: usize) -> Self {
        Self {
            slots: std::array::from_fn(|_| HwSlot::new()),
            count: count.min(MAX_HW_BREAKPOINTS),
            enabled: AtomicU32::new(0),
            enabled_io: AtomicU32::new(0),
        }
    }

    fn slots(&self) -> &[HwSlot] {
        &self.slots[..self.count]
    }

    /// Claims a free slot for `handle`.
    pub fn assign(
        &self,
        handle: BreakpointHandle,
        breakpoint: HwBreakpoint,
    ) -> Result<u8, DbgfError> {
        for (index, slot) in self.slots().iter().enumerate() {
            if slot
                .handle
                .compare_exchange(
                    BreakpointHandle::NIL.raw(),
                    handle.raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }

            slot.address.store(breakpoint.address, Ordering::Relaxed);
            slot.access.store(breakpoint.access.bits(), Ordering::Relaxed);
            slot.size.store(breakpoint.size, Ordering::Relaxed);
            slot.enabled.store(false, Ordering::Release);
            return Ok(index as u8);
        }

        Err(DbgfError::NoMoreSlots)
    }

    /// Releases the slot of `handle`. The slot must be disabled.
    pub fn unassign(&self, index: u8, handle: BreakpointHandle) -> Result<(), DbgfError> {
        let slot = self
            .slots()
            .get(usize::from(index))
            .ok_or(DbgfError::Corrupted("hardware slot out of range"))?;

        if slot.enabled.load(Ordering::Acquire) {
            return Err(DbgfError::Corrupted("hardware slot still enabled"));
        }

        slot.handle
            .compare_exchange(
                handle.raw(),
                BreakpointHandle::NIL.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(drop)
            .map_err(|_| DbgfError::Corrupted("hardware slot owned by another breakpoint"))
    }

    /// Returns the breakpoint already watching the same address, access
    /// and size.
    pub fn find(&self, breakpoint: HwBreakpoint) -> Option<BreakpointHandle> {
        self.slots().iter().find_map(|slot| {
            let handle = slot.handle()?;
            (slot.breakpoint()? == breakpoint).then_some(handle)
        })
    }

    pub fn set_enabled(&self, index: u8, enabled: bool) {
        if let Some(slot) = self.slots().get(usize::from(index)) {
            slot.enabled.store(enabled, Ordering::Release);
        }
    }

    /// Returns the breakpoint in an enabled slot.
    pub fn enabled_handle(&self, index: usize) -> Option<BreakpointHandle> {
        let slot = self.slots().get(index)?;
        if !slot.enabled.load(Ordering::Acquire) {
            return None;
        }

        slot.handle()
    }

    /// Recomputes the enabled counters and returns the slot state to load
    /// into the debug registers.
    pub fn recalc(&self) -> HwBreakpoints {
        let mut enabled = 0;
        let mut enabled_io = 0;

        let breakpoints = self
            .slots()
            .iter()
            .map(|slot| {
                if !slot.enabled.load(Ordering::Acquire) {
                    return None;
                }

                let breakpoint = slot.breakpoint()?;
                enabled += 1;
                if breakpoint.access == HwAccess::Io {
                    enabled_io += 1;
                }

                Some(breakpoint)
            })
            .collect();

        self.enabled.store(enabled, Ordering::Release);
        self.enabled_io.store(enabled_io, Ordering::Release);
        breakpoints
    }

    pub fn enabled_count(&self) -> u32 {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn enabled_io_count(&self) -> u32 {
        self.enabled_io.load(Ordering::Acquire)
    }

    /// Returns the enabled I/O breakpoint covering an access of `size`
    /// bytes at `port`.
    pub fn io_match(&self, port: IoPort, size: u8) -> Option<BreakpointHandle> {
        let first = u64::from(port.0);
        let last = first + u64::from(size.max(1)) - 1;

        self.slots().iter().find_map(|slot| {
            if !slot.enabled.load(Ordering::Acquire) {
                return None;
            }

            let breakpoint = slot.breakpoint()?;
            if breakpoint.access != HwAccess::Io {
                return None;
            }

            let start = breakpoint.address;
            let end = start + u64::from(breakpoint.size.max(1)) - 1;
            (start <= last && first <= end).then(|| slot.handle()).flatten()
        })
    }
}
