use dbgf_core::{
    Architecture, ContextKind, DbgfDriver, DbgfError, HitPhase, IoAccess, IoPort, TrapOutcome, Va,
    VcpuId, Verdict, arch::MAX_INSTRUCTION_LENGTH,
};

use crate::{
    BreakpointFlags, BreakpointHandle, BreakpointInfo, BreakpointKind, BreakpointManager, Hit,
    IoHit,
    store::Record,
    vcpu::{Deferred, PortAccess, VcpuState},
};

/// The outcome of dispatching a trap to the breakpoint core.
pub type BreakpointOutcome = TrapOutcome<BreakpointHandle>;

/// Routes guest traps to breakpoints and their owners.
///
/// A dispatcher is bound to the context it runs in. In the reduced context
/// only callbacks registered with
/// [`BreakpointManager::set_up_reduced_owner`] are invoked; hits of other
/// owners are deferred and picked up by [`Dispatcher::handle_deferred`]
/// once the virtual CPU returns to the full context.
///
/// The trap path never allocates, never blocks and never takes the locks
/// of the management path.
pub struct Dispatcher<'a, Driver>
where
    Driver: DbgfDriver,
{
    manager: &'a BreakpointManager<Driver>,
    context: ContextKind,
}

impl<'a, Driver> Dispatcher<'a, Driver>
where
    Driver: DbgfDriver,
{
    pub(crate) fn new(manager: &'a BreakpointManager<Driver>, context: ContextKind) -> Self {
        Self { manager, context }
    }

    /// Returns the context this dispatcher runs in.
    pub fn context(&self) -> ContextKind {
        self.context
    }

    /// Handles a breakpoint instruction trap at `pc`.
    ///
    /// Returns [`TrapOutcome::Forward`] if no enabled software breakpoint
    /// is registered at `pc`, in which case the trap belongs to the guest.
    pub fn on_int3(&self, vcpu: VcpuId, pc: Va) -> Result<BreakpointOutcome, DbgfError> {
        let manager = self.manager;
        let state = manager.vcpu(vcpu)?;

        if manager.enabled_int3_count() == 0 {
            return Ok(TrapOutcome::Forward);
        }

        let Some(handle) = manager.int3.lookup(&manager.store, pc)?
        else {
            return Ok(TrapOutcome::Forward);
        };

        let (record, info) = self.resolve(handle)?;
        let BreakpointKind::Int3 { va, original, .. } = info.kind()
        else {
            return Err(DbgfError::Corrupted("INT3 index references another kind"));
        };

        if !info.is_enabled() {
            return Ok(TrapOutcome::Forward);
        }

        let info = self.count_hit(state, handle, record, info);
        if !record.in_hit_window(info.hits()) {
            self.step_over(vcpu, va, original)?;
            return Ok(TrapOutcome::Resume);
        }

        self.notify_exec(vcpu, state, handle, &info)
    }

    /// Handles a debug exception raised by the hardware breakpoints.
    ///
    /// `status` is the architectural debug status value (`DR6` on AMD64).
    pub fn on_debug_exception(
        &self,
        vcpu: VcpuId,
        status: u64,
    ) -> Result<BreakpointOutcome, DbgfError> {
        let manager = self.manager;
        let state = manager.vcpu(vcpu)?;

        if manager.hw.enabled_count() == 0 {
            return Ok(TrapOutcome::Forward);
        }

        let triggered = <Driver::Architecture as Architecture>::triggered_hw_breakpoints(status);

        for index in 0..u8::BITS as usize {
            if triggered & (1 << index) == 0 {
                continue;
            }

            let Some(handle) = manager.hw.enabled_handle(index)
            else {
                continue;
            };

            return self.on_hw_hit(vcpu, state, handle);
        }

        Ok(TrapOutcome::Forward)
    }

    /// Handles a trapped port access.
    ///
    /// `access` describes the direction and width of the single access.
    /// For writes `value` is the written value, for reads in the
    /// [`HitPhase::After`] phase the value read.
    pub fn on_port_io(
        &self,
        vcpu: VcpuId,
        port: IoPort,
        access: IoAccess,
        value: u32,
        phase: HitPhase,
    ) -> Result<BreakpointOutcome, DbgfError> {
        let manager = self.manager;
        let state = manager.vcpu(vcpu)?;

        if manager.port_io.armed_count() > 0
            && let Some((handle, record, info)) = self.port_io_match(port, access, phase)?
        {
            let info = self.count_hit(state, handle, record, info);
            if !record.in_hit_window(info.hits()) {
                return Ok(TrapOutcome::Resume);
            }

            let port_access = PortAccess {
                port,
                access,
                value,
                phase,
            };

            return self.notify_io(vcpu, state, handle, &info, port_access);
        }

        if manager.hw.enabled_io_count() > 0
            && let Some(handle) = manager.hw.io_match(port, access.size())
        {
            return self.on_hw_hit(vcpu, state, handle);
        }

        Ok(TrapOutcome::Forward)
    }

    /// Delivers a notification deferred from the reduced context.
    ///
    /// Must be called from the full context. The hit was already counted
    /// when it was deferred. Returns [`TrapOutcome::Forward`] if nothing is
    /// pending.
    pub fn handle_deferred(&self, vcpu: VcpuId) -> Result<BreakpointOutcome, DbgfError> {
        if self.context != ContextKind::Full {
            return Err(DbgfError::InvalidParameter(
                "deferred hits are handled in the full context",
            ));
        }

        let state = self.manager.vcpu(vcpu)?;
        let Some(deferred) = state.take_deferred()
        else {
            return Ok(TrapOutcome::Forward);
        };

        let handle = state
            .active()
            .ok_or(DbgfError::Corrupted("deferred hit without an active breakpoint"))?;

        let Some(info) = self.manager.store.get(handle).and_then(Record::snapshot)
        else {
            // Cleared in between. The guest byte is restored, so the
            // instruction simply runs again.
            tracing::debug!(%handle, %vcpu, "deferred breakpoint cleared before pickup");
            return Ok(TrapOutcome::Resume);
        };

        match deferred {
            Deferred::Exec => self.notify_exec(vcpu, state, handle, &info),
            Deferred::Io(port_access) => self.notify_io(vcpu, state, handle, &info, port_access),
        }
    }

    /// Finds the enabled port I/O breakpoint covering any of the ports a
    /// `access.size()` wide access at `port` touches.
    fn port_io_match(
        &self,
        port: IoPort,
        access: IoAccess,
        phase: HitPhase,
    ) -> Result<Option<(BreakpointHandle, &'a Record, BreakpointInfo)>, DbgfError> {
        let phase_flag = match phase {
            HitPhase::Before => BreakpointFlags::HIT_EXEC_BEFORE,
            HitPhase::After => BreakpointFlags::HIT_EXEC_AFTER,
        };

        let first = port.index();
        let last = (first + usize::from(access.size().max(1))).min(IoPort::COUNT);

        for index in first..last {
            let Some(handle) = self.manager.port_io.get(IoPort(index as u16))
            else {
                continue;
            };

            let (record, info) = self.resolve(handle)?;
            let BreakpointKind::PortIo { access: mask, .. } = info.kind()
            else {
                return Err(DbgfError::Corrupted("port I/O table references another kind"));
            };

            if info.is_enabled() && mask.intersects(access) && info.flags().contains(phase_flag) {
                return Ok(Some((handle, record, info)));
            }
        }

        Ok(None)
    }

    fn resolve(&self, handle: BreakpointHandle) -> Result<(&'a Record, BreakpointInfo), DbgfError> {
        let record = self.manager.store.resolve(handle)?;
        let info = record
            .snapshot()
            .ok_or(DbgfError::Corrupted("index references a free breakpoint"))?;
        Ok((record, info))
    }

    fn count_hit(
        &self,
        state: &VcpuState,
        handle: BreakpointHandle,
        record: &Record,
        info: BreakpointInfo,
    ) -> BreakpointInfo {
        state.set_active(handle);
        BreakpointInfo {
            hits: record.count_hit(),
            ..info
        }
    }

    fn on_hw_hit(
        &self,
        vcpu: VcpuId,
        state: &VcpuState,
        handle: BreakpointHandle,
    ) -> Result<BreakpointOutcome, DbgfError> {
        let (record, info) = self.resolve(handle)?;
        if !matches!(info.kind(), BreakpointKind::Register { .. }) {
            return Err(DbgfError::Corrupted("hardware slot references another kind"));
        }

        if !info.is_enabled() {
            return Ok(TrapOutcome::Forward);
        }

        let info = self.count_hit(state, handle, record, info);
        if !record.in_hit_window(info.hits()) {
            return Ok(TrapOutcome::Resume);
        }

        self.notify_exec(vcpu, state, handle, &info)
    }

    fn notify_exec(
        &self,
        vcpu: VcpuId,
        state: &VcpuState,
        handle: BreakpointHandle,
        info: &BreakpointInfo,
    ) -> Result<BreakpointOutcome, DbgfError> {
        let Some(owner) = info.owner()
        else {
            tracing::debug!(%handle, %vcpu, "unowned breakpoint hit");
            return Ok(TrapOutcome::Halt(handle));
        };

        let callbacks = self
            .manager
            .owners
            .callbacks(owner)
            .map_err(|_| DbgfError::Corrupted("breakpoint references a destroyed owner"))?;

        let (callback, user) = match self.context {
            ContextKind::Full => (callbacks.exec, info.user()),
            ContextKind::Reduced => (
                callbacks.reduced_exec,
                self.manager.store.reduced_user(handle),
            ),
        };

        let Some(callback) = callback
        else {
            return self.defer(state, handle, Deferred::Exec);
        };

        let hit = |phase| Hit {
            vcpu,
            handle,
            info,
            user,
            phase,
        };

        match info.kind() {
            BreakpointKind::Int3 { va, original, .. } => {
                if info.flags().contains(BreakpointFlags::HIT_EXEC_BEFORE) {
                    let verdict = callback(&hit(HitPhase::Before));
                    if let Some(outcome) =
                        self.apply(state, handle, verdict, Some(Deferred::Exec))?
                    {
                        return Ok(outcome);
                    }
                }

                self.step_over(vcpu, va, original)?;

                // The instruction has executed; the notification can no
                // longer be deferred.
                if info.flags().contains(BreakpointFlags::HIT_EXEC_AFTER) {
                    let verdict = callback(&hit(HitPhase::After));
                    if let Some(outcome) = self.apply(state, handle, verdict, None)? {
                        return Ok(outcome);
                    }
                }

                Ok(TrapOutcome::Resume)
            }

            BreakpointKind::Register { .. } => {
                let phase = if info.flags().contains(BreakpointFlags::HIT_EXEC_BEFORE) {
                    HitPhase::Before
                }
                else {
                    HitPhase::After
                };

                let verdict = callback(&hit(phase));
                Ok(self
                    .apply(state, handle, verdict, Some(Deferred::Exec))?
                    .unwrap_or(TrapOutcome::Resume))
            }

            _ => Err(DbgfError::Corrupted("execution hit on an I/O breakpoint")),
        }
    }

    fn notify_io(
        &self,
        vcpu: VcpuId,
        state: &VcpuState,
        handle: BreakpointHandle,
        info: &BreakpointInfo,
        port_access: PortAccess,
    ) -> Result<BreakpointOutcome, DbgfError> {
        let Some(owner) = info.owner()
        else {
            tracing::debug!(%handle, %vcpu, port = %port_access.port, "unowned breakpoint hit");
            return Ok(TrapOutcome::Halt(handle));
        };

        let callbacks = self
            .manager
            .owners
            .callbacks(owner)
            .map_err(|_| DbgfError::Corrupted("breakpoint references a destroyed owner"))?;

        let (callback, user) = match self.context {
            ContextKind::Full => (callbacks.io, info.user()),
            ContextKind::Reduced => (callbacks.reduced_io, self.manager.store.reduced_user(handle)),
        };

        let deferred = Deferred::Io(port_access);
        let Some(callback) = callback
        else {
            return self.defer(state, handle, deferred);
        };

        let verdict = callback(&IoHit {
            vcpu,
            handle,
            info,
            user,
            phase: port_access.phase,
            port: port_access.port,
            access: port_access.access,
            value: port_access.value,
        });

        Ok(self
            .apply(state, handle, verdict, Some(deferred))?
            .unwrap_or(TrapOutcome::Resume))
    }

    /// Turns a verdict into an outcome. `None` means the guest continues.
    ///
    /// `deferred` is what a deferral replays; `None` forbids deferral.
    fn apply(
        &self,
        state: &VcpuState,
        handle: BreakpointHandle,
        verdict: Verdict,
        deferred: Option<Deferred>,
    ) -> Result<Option<BreakpointOutcome>, DbgfError> {
        match (verdict, deferred) {
            (Verdict::Continue, _) => Ok(None),
            (Verdict::Halt, _) => Ok(Some(TrapOutcome::Halt(handle))),
            (Verdict::DeferToFull, Some(deferred)) if self.context == ContextKind::Reduced => {
                self.defer(state, handle, deferred).map(Some)
            }
            (Verdict::DeferToFull, _) => {
                tracing::error!(
                    %handle,
                    context = ?self.context,
                    "owner deferred a hit it cannot defer"
                );
                Err(DbgfError::OwnerContract)
            }
        }
    }

    fn defer(
        &self,
        state: &VcpuState,
        handle: BreakpointHandle,
        deferred: Deferred,
    ) -> Result<BreakpointOutcome, DbgfError> {
        match self.context {
            ContextKind::Reduced => {
                state.defer(deferred);
                Ok(TrapOutcome::DeferToFull(handle))
            }
            ContextKind::Full => Err(DbgfError::Corrupted("owner has no callback for the hit")),
        }
    }

    /// Executes the instruction under a software breakpoint as if the
    /// breakpoint were not there.
    fn step_over(&self, vcpu: VcpuId, va: Va, original: u8) -> Result<(), DbgfError> {
        let driver = &self.manager.driver;

        let mut instruction = [0u8; MAX_INSTRUCTION_LENGTH];
        driver.read_virtual(vcpu, va, &mut instruction)?;
        instruction[0] = original;

        driver.emulate_one(vcpu, va, &instruction)
    }
}
