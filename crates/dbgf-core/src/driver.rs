use std::time::Duration;

use crate::{Architecture, DbgfError, Pa, Va, VcpuId};

/// How a rendezvous runs its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousMode {
    /// The worker runs on exactly one virtual CPU while all others are held
    /// at a safe point.
    Once,

    /// The worker runs on every virtual CPU, all of them being held at a
    /// safe point until the last one finishes.
    AllAtOnce,
}

/// A worker executed inside a rendezvous.
pub type RendezvousWorker<'a> = dyn Fn(VcpuId) -> Result<(), DbgfError> + Sync + 'a;

/// The primitives the breakpoint core needs from the surrounding hypervisor.
///
/// None of these are implemented by the debug facility itself: address
/// translation, guest memory access, instruction emulation, debug register
/// loading and the all-vCPU rendezvous are provided by the virtual machine
/// monitor.
pub trait DbgfDriver: Send + Sync {
    /// The architecture supported by the driver.
    type Architecture: Architecture + ?Sized;

    /// Returns the number of virtual CPUs.
    fn vcpu_count(&self) -> u16;

    /// Translates a guest virtual address in the address space of the
    /// given virtual CPU.
    fn translate_address(&self, vcpu: VcpuId, va: Va) -> Result<Pa, DbgfError>;

    /// Reads guest physical memory.
    fn read_physical(&self, pa: Pa, buffer: &mut [u8]) -> Result<(), DbgfError>;

    /// Writes guest physical memory.
    fn write_physical(&self, pa: Pa, data: &[u8]) -> Result<(), DbgfError>;

    /// Reads guest virtual memory in the address space of the given
    /// virtual CPU.
    fn read_virtual(&self, vcpu: VcpuId, va: Va, buffer: &mut [u8]) -> Result<(), DbgfError>;

    /// Emulates exactly one instruction at `va` using the prefetched
    /// instruction bytes instead of guest memory.
    fn emulate_one(&self, vcpu: VcpuId, va: Va, prefetched: &[u8]) -> Result<(), DbgfError>;

    /// Loads the debug registers of the given virtual CPU.
    fn load_debug_registers(
        &self,
        vcpu: VcpuId,
        registers: &<Self::Architecture as Architecture>::DebugRegisters,
    ) -> Result<(), DbgfError>;

    /// Enables or disables interception of guest port I/O for breakpoint
    /// checking.
    fn set_port_io_intercept(&self, enabled: bool) -> Result<(), DbgfError>;

    /// Pauses every virtual CPU at a safe point and runs `worker`.
    ///
    /// Fails with [`DbgfError::Timeout`] if the virtual CPUs cannot be
    /// brought together within `timeout`. Any error returned by the worker
    /// is propagated.
    fn rendezvous(
        &self,
        mode: RendezvousMode,
        timeout: Duration,
        worker: &RendezvousWorker<'_>,
    ) -> Result<(), DbgfError>;
}
