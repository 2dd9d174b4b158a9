//! Sets a few breakpoints against a flat, in-process guest memory and
//! replays the traps a hypervisor would deliver.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use dbgf::{
    DbgfDriver, DbgfError, HitPhase, HwAccess, IoAccess, IoPort, Pa, RendezvousMode,
    RendezvousWorker, TrapOutcome, Va, VcpuId, Verdict,
    arch::amd64::{Amd64, DebugRegisters},
    bp::{BreakpointFlags, BreakpointManager, BreakpointRequest, Hit, IoHit},
};

const MEMORY_SIZE: usize = 0x10_0000;

/// A single vCPU guest with identity-mapped memory.
struct FlatDriver {
    memory: Mutex<Vec<u8>>,
    debug_registers: Mutex<DebugRegisters>,
}

impl FlatDriver {
    fn new() -> Self {
        Self {
            memory: Mutex::new(vec![0x90; MEMORY_SIZE]),
            debug_registers: Mutex::new(DebugRegisters::default()),
        }
    }

    fn range(&self, pa: Pa, len: usize) -> Result<std::ops::Range<usize>, DbgfError> {
        let start = usize::try_from(pa.0).map_err(|_| DbgfError::Other("address out of range"))?;
        match start.checked_add(len) {
            Some(end) if end <= MEMORY_SIZE => Ok(start..end),
            _ => Err(DbgfError::Other("address out of range")),
        }
    }
}

impl DbgfDriver for FlatDriver {
    type Architecture = Amd64;

    fn vcpu_count(&self) -> u16 {
        1
    }

    fn translate_address(&self, _vcpu: VcpuId, va: Va) -> Result<Pa, DbgfError> {
        if va.0 >= MEMORY_SIZE as u64 {
            return Err(DbgfError::Translation(va));
        }

        Ok(Pa(va.0))
    }

    fn read_physical(&self, pa: Pa, buffer: &mut [u8]) -> Result<(), DbgfError> {
        let range = self.range(pa, buffer.len())?;
        let memory = self.memory.lock().map_err(|_| DbgfError::Other("poisoned"))?;
        buffer.copy_from_slice(&memory[range]);
        Ok(())
    }

    fn write_physical(&self, pa: Pa, data: &[u8]) -> Result<(), DbgfError> {
        let range = self.range(pa, data.len())?;
        let mut memory = self.memory.lock().map_err(|_| DbgfError::Other("poisoned"))?;
        memory[range].copy_from_slice(data);
        Ok(())
    }

    fn read_virtual(&self, vcpu: VcpuId, va: Va, buffer: &mut [u8]) -> Result<(), DbgfError> {
        let pa = self.translate_address(vcpu, va)?;
        self.read_physical(pa, buffer)
    }

    fn emulate_one(&self, vcpu: VcpuId, va: Va, prefetched: &[u8]) -> Result<(), DbgfError> {
        tracing::info!(%vcpu, %va, opcode = prefetched[0], "emulating instruction");
        Ok(())
    }

    fn load_debug_registers(
        &self,
        vcpu: VcpuId,
        registers: &DebugRegisters,
    ) -> Result<(), DbgfError> {
        tracing::info!(%vcpu, ?registers, "loading debug registers");
        *self
            .debug_registers
            .lock()
            .map_err(|_| DbgfError::Other("poisoned"))? = *registers;
        Ok(())
    }

    fn set_port_io_intercept(&self, enabled: bool) -> Result<(), DbgfError> {
        tracing::info!(enabled, "port I/O interception");
        Ok(())
    }

    fn rendezvous(
        &self,
        _mode: RendezvousMode,
        _timeout: Duration,
        worker: &RendezvousWorker<'_>,
    ) -> Result<(), DbgfError> {
        worker(VcpuId(0))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    let manager = BreakpointManager::new(FlatDriver::new());
    let vcpu = VcpuId(0);

    // Trace every instruction hit before and after it executes.
    let hits = Arc::new(Mutex::new(0u64));
    let owner = manager.create_owner(
        Some(Arc::new({
            let hits = hits.clone();
            move |hit: &Hit<'_>| {
                tracing::info!(
                    handle = %hit.handle,
                    phase = ?hit.phase,
                    hits = hit.info.hits(),
                    "hit"
                );
                if let Ok(mut hits) = hits.lock() {
                    *hits += 1;
                }
                Verdict::Continue
            }
        })),
        Some(Arc::new(|hit: &IoHit<'_>| {
            tracing::info!(
                port = %hit.port,
                write = hit.access.is_write(),
                size = hit.access.size(),
                value = hit.value,
                "port hit"
            );
            Verdict::Continue
        })),
    )?;

    let entry = Va(0x1000);
    let traced = manager
        .set(
            BreakpointRequest::int3(entry)
                .with_owner(owner)
                .with_flags(BreakpointFlags::all()),
        )?
        .handle();

    // A breakpoint without an owner stops the guest.
    let stop = manager.set(BreakpointRequest::int3(Va(0x1040)))?.handle();

    manager.set(BreakpointRequest::register(0x2000, HwAccess::Write, 8))?;
    manager.set(BreakpointRequest::port_io(0x3f8, 8, IoAccess::WRITE).with_owner(owner))?;

    for pc in [entry, entry, Va(0x1040), Va(0x1080)] {
        match manager.full().on_int3(vcpu, pc)? {
            TrapOutcome::Forward => tracing::info!(%pc, "not ours, injecting"),
            TrapOutcome::Resume => tracing::info!(%pc, "resumed"),
            TrapOutcome::Halt(handle) => tracing::info!(%pc, %handle, "halted"),
            TrapOutcome::DeferToFull(handle) => tracing::info!(%pc, %handle, "deferred"),
        }
    }

    // A byte written to the serial port.
    let access =
        IoAccess::for_access(true, 1).ok_or(DbgfError::InvalidParameter("access width"))?;
    manager
        .full()
        .on_port_io(vcpu, IoPort(0x3f8), access, u32::from(b'A'), HitPhase::Before)?;

    manager.enumerate(|handle, info| {
        println!("{handle}: {:?} hits={} enabled={}", info.kind(), info.hits(), info.is_enabled());
        std::ops::ControlFlow::Continue(())
    });

    manager.clear(traced)?;
    manager.clear(stop)?;

    println!("traced hits: {}", hits.lock().map(|hits| *hits).unwrap_or_default());
    Ok(())
}
