//! AMD64 architecture definitions.

mod dr;

use dbgf_core::{Architecture, HwAccess, HwBreakpoint};

pub use self::dr::{BreakpointCondition, BreakpointLength, Dr6, Dr7};

/// AMD64 architecture.
#[derive(Debug)]
pub struct Amd64;

/// The `DR0`-`DR3` and `DR7` values loaded into a virtual CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugRegisters {
    /// Breakpoint linear addresses (`DR0` through `DR3`).
    pub address: [u64; 4],

    /// Debug control register.
    pub dr7: Dr7,
}

impl Default for DebugRegisters {
    fn default() -> Self {
        Self {
            address: [0; 4],
            dr7: Dr7::cleared(),
        }
    }
}

impl Architecture for Amd64 {
    const BREAKPOINT: u8 = 0xcc;
    const HW_BREAKPOINT_COUNT: usize = 4;

    type DebugRegisters = DebugRegisters;

    fn debug_registers(slots: &[Option<HwBreakpoint>]) -> Self::DebugRegisters {
        let mut registers = DebugRegisters::default();

        for (index, slot) in slots.iter().enumerate().take(Self::HW_BREAKPOINT_COUNT) {
            let Some(slot) = slot
            else {
                continue;
            };

            let condition = match slot.access {
                HwAccess::Execute => BreakpointCondition::Execution,
                HwAccess::Write => BreakpointCondition::Write,
                HwAccess::Io => BreakpointCondition::Io,
                HwAccess::ReadWrite => BreakpointCondition::ReadWrite,
            };

            // Instruction breakpoints must use a 1-byte length.
            let length = match slot.access {
                HwAccess::Execute => BreakpointLength::Byte,
                _ => BreakpointLength::from_size(slot.size).unwrap_or(BreakpointLength::Byte),
            };

            registers.address[index] = slot.address;
            registers.dr7 = registers.dr7.with_breakpoint(index as u8, condition, length);
        }

        registers
    }

    fn triggered_hw_breakpoints(status: u64) -> u8 {
        Dr6(status).breakpoint_condition()
    }
}
