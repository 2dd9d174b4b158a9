use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use dbgf_core::{HitPhase, IoAccess, IoPort};

use crate::BreakpointHandle;

/// A trapped port access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PortAccess {
    pub port: IoPort,
    pub access: IoAccess,
    pub value: u32,
    pub phase: HitPhase,
}

/// A notification postponed from the reduced context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deferred {
    Exec,
    Io(PortAccess),
}

const DEFERRED_NONE: u8 = 0;
const DEFERRED_EXEC: u8 = 1;
const DEFERRED_IO: u8 = 2;

/// Per virtual CPU breakpoint state.
///
/// Only the owning virtual CPU writes its state, so every access is
/// relaxed.
pub(crate) struct VcpuState {
    active: AtomicU32,
    deferred: AtomicU8,

    // port | access << 16 | phase << 24
    io_access: AtomicU32,
    io_value: AtomicU32,
}

impl VcpuState {
    pub fn new() -> Self {
        Self {
            active: AtomicU32::new(BreakpointHandle::NIL.raw()),
            deferred: AtomicU8::new(DEFERRED_NONE),
            io_access: AtomicU32::new(0),
            io_value: AtomicU32::new(0),
        }
    }

    /// Returns the breakpoint hit most recently.
    pub fn active(&self) -> Option<BreakpointHandle> {
        BreakpointHandle::from_raw(self.active.load(Ordering::Relaxed))
    }

    pub fn set_active(&self, handle: BreakpointHandle) {
        self.active.store(handle.raw(), Ordering::Relaxed);
    }

    pub fn defer(&self, deferred: Deferred) {
        if let Deferred::Io(PortAccess {
            port,
            access,
            value,
            phase,
        }) = deferred
        {
            let phase = match phase {
                HitPhase::Before => 0,
                HitPhase::After => 1,
            };

            self.io_access.store(
                u32::from(port.0) | (u32::from(access.bits()) << 16) | (phase << 24),
                Ordering::Relaxed,
            );
            self.io_value.store(value, Ordering::Relaxed);
            self.deferred.store(DEFERRED_IO, Ordering::Relaxed);
        }
        else {
            self.deferred.store(DEFERRED_EXEC, Ordering::Relaxed);
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred.load(Ordering::Relaxed) != DEFERRED_NONE
    }

    /// Takes the pending notification, if any.
    pub fn take_deferred(&self) -> Option<Deferred> {
        match self.deferred.swap(DEFERRED_NONE, Ordering::Relaxed) {
            DEFERRED_EXEC => Some(Deferred::Exec),
            DEFERRED_IO => {
                let io_access = self.io_access.load(Ordering::Relaxed);
                Some(Deferred::Io(PortAccess {
                    port: IoPort(io_access as u16),
                    access: IoAccess::from_bits_truncate((io_access >> 16) as u8),
                    value: self.io_value.load(Ordering::Relaxed),
                    phase: match io_access >> 24 {
                        0 => HitPhase::Before,
                        _ => HitPhase::After,
                    },
                }))
            }
            _ => None,
        }
    }
}
