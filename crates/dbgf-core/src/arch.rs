//! Architecture abstraction.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// The maximum number of hardware breakpoint slots any architecture exposes.
pub const MAX_HW_BREAKPOINTS: usize = 4;

/// The maximum length of a single instruction, in bytes.
///
/// The trap dispatcher prefetches this many bytes when stepping over a
/// patched instruction.
pub const MAX_INSTRUCTION_LENGTH: usize = 16;

/// Defines the CPU-specific pieces the breakpoint core depends on.
///
/// The core itself never touches debug registers or instruction encodings.
/// It describes the hardware slots in a neutral form and lets the
/// architecture turn them into register values.
pub trait Architecture {
    /// The single-byte trap instruction patched over instruction
    /// breakpoints.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `0xcc` (`INT3` instruction)
    const BREAKPOINT: u8;

    /// The number of hardware breakpoint slots.
    ///
    /// Must not exceed [`MAX_HW_BREAKPOINTS`].
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `4` (`DR0` through `DR3`)
    const HW_BREAKPOINT_COUNT: usize;

    /// The debug register state loaded into a virtual CPU.
    type DebugRegisters: Debug + Default + Clone + PartialEq;

    /// Computes the debug register state for the given slot assignment.
    ///
    /// `slots[n]` describes hardware slot `n`; `None` means the slot is
    /// unassigned or disabled.
    fn debug_registers(slots: &[Option<HwBreakpoint>]) -> Self::DebugRegisters;

    /// Returns a bitmask of hardware slots reported as triggered by the
    /// given debug status value.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `DR6.B0` through `DR6.B3`
    fn triggered_hw_breakpoints(status: u64) -> u8;
}

/// Hardware breakpoint access type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HwAccess {
    /// Break on instruction execution.
    Execute,

    /// Break on data writes.
    Write,

    /// Break on I/O port reads or writes.
    Io,

    /// Break on data reads or writes.
    ReadWrite,
}

impl HwAccess {
    /// Decodes the access type from its stored representation.
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Execute),
            1 => Some(Self::Write),
            2 => Some(Self::Io),
            3 => Some(Self::ReadWrite),
            _ => None,
        }
    }

    /// Returns the stored representation of the access type.
    pub fn bits(self) -> u8 {
        match self {
            Self::Execute => 0,
            Self::Write => 1,
            Self::Io => 2,
            Self::ReadWrite => 3,
        }
    }
}

/// A programmed hardware breakpoint slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HwBreakpoint {
    /// The linear address (or port number for [`HwAccess::Io`]).
    pub address: u64,

    /// The access type.
    pub access: HwAccess,

    /// The access width in bytes (1, 2, 4 or 8).
    pub size: u8,
}

/// Hardware slot assignment handed to [`Architecture::debug_registers`].
pub type HwBreakpoints = SmallVec<[Option<HwBreakpoint>; MAX_HW_BREAKPOINTS]>;
