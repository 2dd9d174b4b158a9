//! Arming and disarming of breakpoints.
//!
//! Arming makes a breakpoint observable to the guest: software breakpoints
//! patch the trap instruction into guest memory, hardware breakpoints load
//! the debug registers of every virtual CPU and port I/O breakpoints turn
//! on port interception. Disarming undoes it. A failure halfway reverts
//! the flag and counter updates already made.
//!
//! Transitions run one at a time under the manager's transition lock, and
//! a record being cleared can only be disarmed by the clear itself.

use std::sync::{MutexGuard, PoisonError, atomic::Ordering};

use dbgf_core::{Architecture, DbgfDriver, DbgfError, Pa, RendezvousMode};

use crate::{BreakpointHandle, BreakpointKind, BreakpointManager, store::Record};

impl<Driver> BreakpointManager<Driver>
where
    Driver: DbgfDriver,
{
    fn lock_transitions(&self) -> MutexGuard<'_, ()> {
        self.transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Arms a breakpoint. Returns `false` if it was already armed.
    pub(crate) fn arm(&self, handle: BreakpointHandle, record: &Record) -> Result<bool, DbgfError> {
        let _guard = self.lock_transitions();
        if !record.is_live() || record.is_clearing() {
            return Err(DbgfError::InvalidHandle);
        }

        let kind = record
            .kind()
            .ok_or(DbgfError::Corrupted("breakpoint has no kind"))?;

        if !record.set_enabled() {
            return Ok(false);
        }

        let result = match kind {
            BreakpointKind::Int3 { pa, .. } => self.arm_int3(record, pa),
            BreakpointKind::Register { slot, .. } => self.arm_register(slot),
            BreakpointKind::PortIo { .. } => self.arm_port_io(),
            BreakpointKind::Mmio { .. } => Err(DbgfError::NotSupported),
        };

        if let Err(err) = result {
            record.clear_enabled();
            tracing::warn!(%handle, %err, "failed to arm breakpoint");
            return Err(err);
        }

        tracing::trace!(%handle, "breakpoint armed");
        Ok(true)
    }

    /// Disarms a breakpoint. Returns `false` if it was already disarmed.
    pub(crate) fn disarm(
        &self,
        handle: BreakpointHandle,
        record: &Record,
    ) -> Result<bool, DbgfError> {
        let _guard = self.lock_transitions();
        if !record.is_live() || record.is_clearing() {
            return Err(DbgfError::InvalidHandle);
        }

        self.disarm_locked(handle, record)
    }

    /// Disarms a breakpoint the caller is clearing.
    pub(crate) fn disarm_for_clear(
        &self,
        handle: BreakpointHandle,
        record: &Record,
    ) -> Result<bool, DbgfError> {
        let _guard = self.lock_transitions();
        self.disarm_locked(handle, record)
    }

    fn disarm_locked(&self, handle: BreakpointHandle, record: &Record) -> Result<bool, DbgfError> {
        let kind = record
            .kind()
            .ok_or(DbgfError::Corrupted("breakpoint has no kind"))?;

        if !record.clear_enabled() {
            return Ok(false);
        }

        let result = match kind {
            BreakpointKind::Int3 { pa, original, .. } => self.disarm_int3(pa, original),
            BreakpointKind::Register { slot, .. } => self.disarm_register(slot),
            BreakpointKind::PortIo { .. } => self.disarm_port_io(),
            BreakpointKind::Mmio { .. } => Ok(()),
        };

        if let Err(err) = result {
            record.set_enabled();
            tracing::warn!(%handle, %err, "failed to disarm breakpoint");
            return Err(err);
        }

        tracing::trace!(%handle, "breakpoint disarmed");
        Ok(true)
    }

    fn arm_int3(&self, record: &Record, pa: Pa) -> Result<(), DbgfError> {
        // Must be counted before the instruction is patched in.
        self.enabled_int3.fetch_add(1, Ordering::AcqRel);

        let mut original = [0u8; 1];
        let result = self
            .driver
            .read_physical(pa, &mut original)
            .and_then(|()| {
                record.set_original(original[0]);
                self.driver
                    .write_physical(pa, &[<Driver::Architecture as Architecture>::BREAKPOINT])
            });

        if result.is_err() {
            self.enabled_int3.fetch_sub(1, Ordering::AcqRel);
        }

        result
    }

    fn disarm_int3(&self, pa: Pa, original: u8) -> Result<(), DbgfError> {
        let breakpoint = <Driver::Architecture as Architecture>::BREAKPOINT;

        let mut current = [0u8; 1];
        self.driver.read_physical(pa, &mut current)?;

        if current[0] == breakpoint {
            self.driver.write_physical(pa, &[original])?;
        }
        else {
            // Rewritten by the guest.
            tracing::warn!(
                %pa,
                current = current[0],
                original,
                "breakpoint instruction overwritten, original byte not restored"
            );
        }

        self.enabled_int3.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    fn arm_register(&self, slot: u8) -> Result<(), DbgfError> {
        self.hw.set_enabled(slot, true);

        if let Err(err) = self.sync_hw() {
            self.hw.set_enabled(slot, false);
            self.resync_hw();
            return Err(err);
        }

        Ok(())
    }

    fn disarm_register(&self, slot: u8) -> Result<(), DbgfError> {
        self.hw.set_enabled(slot, false);

        if let Err(err) = self.sync_hw() {
            self.hw.set_enabled(slot, true);
            self.resync_hw();
            return Err(err);
        }

        Ok(())
    }

    /// Loads the hardware slot table into the debug registers of every
    /// virtual CPU.
    fn sync_hw(&self) -> Result<(), DbgfError> {
        self.driver.rendezvous(
            RendezvousMode::AllAtOnce,
            self.config.rendezvous_timeout,
            &|vcpu| {
                let slots = self.hw.recalc();
                let registers = <Driver::Architecture as Architecture>::debug_registers(&slots);
                self.driver.load_debug_registers(vcpu, &registers)
            },
        )
    }

    fn resync_hw(&self) {
        self.hw.recalc();

        if let Err(err) = self.sync_hw() {
            tracing::error!(%err, "debug registers may disagree with the slot table");
        }
    }

    // The transition lock keeps a second arm from returning before the
    // first one has turned interception on.
    fn arm_port_io(&self) -> Result<(), DbgfError> {
        if !self.port_io.arm() {
            return Ok(());
        }

        let result = self.driver.rendezvous(
            RendezvousMode::Once,
            self.config.rendezvous_timeout,
            &|_vcpu| self.driver.set_port_io_intercept(true),
        );

        if result.is_err() {
            self.port_io.disarm();
        }

        result
    }

    fn disarm_port_io(&self) -> Result<(), DbgfError> {
        if !self.port_io.disarm() {
            return Ok(());
        }

        let result = self.driver.rendezvous(
            RendezvousMode::Once,
            self.config.rendezvous_timeout,
            &|_vcpu| self.driver.set_port_io_intercept(false),
        );

        if result.is_err() {
            self.port_io.arm();
        }

        result
    }
}
