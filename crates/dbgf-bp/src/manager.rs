use std::{
    ops::ControlFlow,
    sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    },
};

use dbgf_core::{
    Architecture, ContextKind, DbgfConfig, DbgfDriver, DbgfError, HwAccess, HwBreakpoint,
    IoAccess, IoPort, Va, VcpuId,
};

use crate::{
    BreakpointFlags, BreakpointHandle, BreakpointInfo, BreakpointKind, BreakpointRequest,
    BreakpointTarget, Dispatcher, ExecCallback, IoCallback, OwnerHandle, SetOutcome,
    hw::HwSlots,
    int3::Int3Index,
    owner::OwnerRegistry,
    port_io::PortIoTable,
    store::{BreakpointStore, Record, RecordInit},
    vcpu::VcpuState,
};

/// Breakpoint manager.
///
/// Owns every breakpoint of one virtual machine together with the indexes
/// the trap path uses to find them. Management operations may be called
/// from any thread; trap dispatch goes through [`BreakpointManager::full`]
/// and [`BreakpointManager::reduced`].
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use dbgf_bp::{BreakpointManager, BreakpointRequest, Hit};
/// # use dbgf_core::{DbgfDriver, DbgfError, Va, Verdict};
/// # fn example<Driver: DbgfDriver>(driver: Driver) -> Result<(), DbgfError> {
/// let manager = BreakpointManager::new(driver);
///
/// let owner = manager.create_owner(
///     Some(Arc::new(|hit: &Hit<'_>| {
///         tracing::info!(handle = %hit.handle, hits = hit.info.hits(), "hit");
///         Verdict::Continue
///     })),
///     None,
/// )?;
///
/// let handle = manager
///     .set(BreakpointRequest::int3(Va(0xfffff800_00101000)).with_owner(owner))?
///     .handle();
///
/// manager.clear(handle)?;
/// manager.destroy_owner(owner)?;
/// # Ok(())
/// # }
/// ```
pub struct BreakpointManager<Driver>
where
    Driver: DbgfDriver,
{
    pub(crate) driver: Driver,
    pub(crate) config: DbgfConfig,
    pub(crate) owners: OwnerRegistry,
    pub(crate) store: BreakpointStore,
    pub(crate) int3: Int3Index,
    pub(crate) hw: HwSlots,
    pub(crate) port_io: PortIoTable,
    pub(crate) vcpus: Box<[VcpuState]>,
    pub(crate) enabled_int3: AtomicU32,

    // Serializes arming and disarming, so the enabled flag of a record and
    // its trap side effect change together.
    pub(crate) transitions: Mutex<()>,
}

impl<Driver> BreakpointManager<Driver>
where
    Driver: DbgfDriver,
{
    /// Creates a new manager with the default configuration.
    pub fn new(driver: Driver) -> Self {
        Self::with_config(driver, DbgfConfig::default())
    }

    /// Creates a new manager.
    pub fn with_config(driver: Driver, config: DbgfConfig) -> Self {
        let vcpus = (0..driver.vcpu_count()).map(|_| VcpuState::new()).collect();

        Self {
            owners: OwnerRegistry::new(),
            store: BreakpointStore::new(&config),
            int3: Int3Index::new(&config),
            hw: HwSlots::new(<Driver::Architecture as Architecture>::HW_BREAKPOINT_COUNT),
            port_io: PortIoTable::new(),
            vcpus,
            enabled_int3: AtomicU32::new(0),
            transitions: Mutex::new(()),
            driver,
            config,
        }
    }

    /// Returns the driver.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Returns the configuration.
    pub fn config(&self) -> &DbgfConfig {
        &self.config
    }

    /// Returns the trap dispatcher for the full context.
    pub fn full(&self) -> Dispatcher<'_, Driver> {
        Dispatcher::new(self, ContextKind::Full)
    }

    /// Returns the trap dispatcher for the reduced context.
    pub fn reduced(&self) -> Dispatcher<'_, Driver> {
        Dispatcher::new(self, ContextKind::Reduced)
    }

    pub(crate) fn vcpu(&self, vcpu: VcpuId) -> Result<&VcpuState, DbgfError> {
        self.vcpus
            .get(vcpu.index())
            .ok_or(DbgfError::InvalidParameter("virtual CPU out of range"))
    }

    //
    // Owners
    //

    /// Registers a breakpoint owner.
    ///
    /// At least one callback must be given. The execution callback serves
    /// software and hardware breakpoints, the I/O callback serves port I/O
    /// breakpoints.
    pub fn create_owner(
        &self,
        exec: Option<ExecCallback>,
        io: Option<IoCallback>,
    ) -> Result<OwnerHandle, DbgfError> {
        let owner = self
            .owners
            .create(&self.driver, &self.config, exec, io)?;
        tracing::debug!(%owner, "owner created");
        Ok(owner)
    }

    /// Destroys an owner.
    ///
    /// Fails with [`DbgfError::OwnerBusy`] while any breakpoint still
    /// references it.
    pub fn destroy_owner(&self, owner: OwnerHandle) -> Result<(), DbgfError> {
        self.owners.destroy(owner)?;
        tracing::debug!(%owner, "owner destroyed");
        Ok(())
    }

    /// Registers callbacks that may run in the reduced context.
    ///
    /// Without them, hits taken in the reduced context are deferred to the
    /// full context.
    pub fn set_up_reduced_owner(
        &self,
        owner: OwnerHandle,
        exec: Option<ExecCallback>,
        io: Option<IoCallback>,
    ) -> Result<(), DbgfError> {
        self.owners.set_up_reduced(owner, exec, io)
    }

    //
    // Breakpoints
    //

    /// Sets a breakpoint.
    ///
    /// If a breakpoint with the same target exists, its handle is returned
    /// as [`SetOutcome::AlreadyExists`] and it is enabled if the request
    /// asks for it. A failure leaves no trace of the new breakpoint, unless
    /// its lookup entry cannot be removed again. The breakpoint then stays
    /// allocated and disabled until it is cleared.
    pub fn set(&self, request: BreakpointRequest) -> Result<SetOutcome, DbgfError> {
        if request.hit_trigger > request.hit_disable {
            return Err(DbgfError::InvalidParameter(
                "hit trigger exceeds hit disable",
            ));
        }

        match request.target {
            BreakpointTarget::Int3 { va } => self.set_int3(&request, va),
            BreakpointTarget::Register {
                address,
                access,
                size,
            } => self.set_register(&request, address, access, size),
            BreakpointTarget::PortIo {
                port,
                count,
                access,
            } => self.set_port_io(&request, port, count, access),
            BreakpointTarget::Mmio { .. } => Err(DbgfError::NotSupported),
        }
    }

    fn check_owner(&self, request: &BreakpointRequest, io: bool) -> Result<(), DbgfError> {
        let Some(owner) = request.owner
        else {
            return Ok(());
        };

        let callbacks = self.owners.callbacks(owner)?;
        match io {
            false if callbacks.exec.is_none() => Err(DbgfError::InvalidParameter(
                "owner has no execution callback",
            )),
            true if callbacks.io.is_none() => {
                Err(DbgfError::InvalidParameter("owner has no I/O callback"))
            }
            _ => Ok(()),
        }
    }

    fn existing(
        &self,
        handle: BreakpointHandle,
        flags: BreakpointFlags,
    ) -> Result<SetOutcome, DbgfError> {
        if flags.contains(BreakpointFlags::ENABLED) {
            self.enable(handle)?;
        }

        Ok(SetOutcome::AlreadyExists(handle))
    }

    fn set_int3(&self, request: &BreakpointRequest, va: Va) -> Result<SetOutcome, DbgfError> {
        self.check_owner(request, false)?;
        self.vcpu(request.vcpu)?;

        if let Some(existing) = self.int3.lookup(&self.store, va)? {
            return self.existing(existing, request.flags);
        }

        let pa = self.driver.translate_address(request.vcpu, va)?;
        let (handle, record) = self.allocate(
            request,
            BreakpointKind::Int3 {
                va,
                pa,
                original: 0,
            },
        )?;

        match self
            .int3
            .insert(&self.driver, &self.config, &self.store, va, handle)
        {
            Ok(None) => {}
            Ok(Some(existing)) => {
                self.free(handle, record);
                return self.existing(existing, request.flags);
            }
            Err(err) => {
                self.free(handle, record);
                return Err(err);
            }
        }

        if request.flags.contains(BreakpointFlags::ENABLED)
            && let Err(err) = self.arm(handle, record)
        {
            match self.int3.remove(&self.driver, &self.config, va, handle) {
                Ok(()) => self.free(handle, record),
                Err(unwind) => self.keep_disabled(handle, &unwind),
            }
            return Err(err);
        }

        tracing::debug!(%handle, %va, %pa, "software breakpoint set");
        Ok(SetOutcome::Created(handle))
    }

    fn set_register(
        &self,
        request: &BreakpointRequest,
        address: u64,
        access: HwAccess,
        size: u8,
    ) -> Result<SetOutcome, DbgfError> {
        let size = match (access, size) {
            (HwAccess::Execute, _) => 1,
            (_, 1 | 2 | 4 | 8) => size,
            _ => {
                return Err(DbgfError::InvalidParameter(
                    "hardware breakpoint size must be 1, 2, 4 or 8",
                ));
            }
        };

        if access == HwAccess::Io && address > 0xffff {
            return Err(DbgfError::InvalidParameter("I/O breakpoint port out of range"));
        }

        self.check_owner(request, false)?;

        let breakpoint = HwBreakpoint {
            address,
            access,
            size,
        };

        if let Some(existing) = self.hw.find(breakpoint) {
            return self.existing(existing, request.flags);
        }

        let (handle, record) = self.allocate(
            request,
            BreakpointKind::Register {
                address,
                access,
                size,
                slot: 0,
            },
        )?;

        let slot = match self.hw.assign(handle, breakpoint) {
            Ok(slot) => slot,
            Err(err) => {
                self.free(handle, record);
                return Err(err);
            }
        };

        record.set_hw_slot(slot);

        if request.flags.contains(BreakpointFlags::ENABLED)
            && let Err(err) = self.arm(handle, record)
        {
            match self.hw.unassign(slot, handle) {
                Ok(()) => self.free(handle, record),
                Err(unwind) => self.keep_disabled(handle, &unwind),
            }
            return Err(err);
        }

        tracing::debug!(%handle, address, ?access, size, slot, "hardware breakpoint set");
        Ok(SetOutcome::Created(handle))
    }

    fn set_port_io(
        &self,
        request: &BreakpointRequest,
        port: IoPort,
        count: u16,
        access: IoAccess,
    ) -> Result<SetOutcome, DbgfError> {
        if count == 0 || port.index() + usize::from(count) > IoPort::COUNT {
            return Err(DbgfError::InvalidParameter("port range out of bounds"));
        }

        if access.is_empty() {
            return Err(DbgfError::InvalidParameter("port access mask is empty"));
        }

        self.check_owner(request, true)?;

        if let Some(existing) = self.port_io.find_exact(port, count) {
            return self.existing(existing, request.flags);
        }

        let (handle, record) = self.allocate(
            request,
            BreakpointKind::PortIo {
                port,
                count,
                access,
            },
        )?;

        if let Err(err) = self
            .port_io
            .add(&self.driver, &self.config, port, count, handle)
        {
            self.free(handle, record);
            return Err(err);
        }

        if request.flags.contains(BreakpointFlags::ENABLED)
            && let Err(err) = self.arm(handle, record)
        {
            match self
                .port_io
                .remove(&self.driver, &self.config, port, count, handle)
            {
                Ok(()) => self.free(handle, record),
                Err(unwind) => self.keep_disabled(handle, &unwind),
            }
            return Err(err);
        }

        tracing::debug!(%handle, %port, count, %access, "port I/O breakpoint set");
        Ok(SetOutcome::Created(handle))
    }

    fn allocate(
        &self,
        request: &BreakpointRequest,
        kind: BreakpointKind,
    ) -> Result<(BreakpointHandle, &Record), DbgfError> {
        if let Some(owner) = request.owner {
            self.owners.retain(owner)?;
        }

        let init = RecordInit {
            kind,
            owner: request.owner,
            user: request.user,
            hit_trigger: request.hit_trigger,
            hit_disable: request.hit_disable,
            flags: request.flags,
        };

        self.store
            .allocate(&self.driver, &self.config, &init)
            .inspect_err(|_| {
                if let Some(owner) = request.owner {
                    self.owners.release(owner);
                }
            })
    }

    /// Leaves a breakpoint that failed to arm allocated and disabled.
    ///
    /// Its lookup entry could not be removed, and freeing the record would
    /// leave the entry dangling. It stays visible to [`Self::enumerate`]
    /// and can be cleared later.
    fn keep_disabled(&self, handle: BreakpointHandle, err: &DbgfError) {
        tracing::error!(%handle, %err, "failed to unwind breakpoint, left disabled");
    }

    fn free(&self, handle: BreakpointHandle, record: &Record) {
        let owner = record.owner();
        self.store.free(handle);

        if let Some(owner) = owner {
            self.owners.release(owner);
        }
    }

    /// Registers the user data passed to reduced-context callbacks of a
    /// breakpoint.
    pub fn set_up_reduced_context(
        &self,
        handle: BreakpointHandle,
        user: u64,
    ) -> Result<(), DbgfError> {
        self.store.set_reduced_user(handle, user)
    }

    /// Clears a breakpoint.
    ///
    /// The breakpoint is disarmed, removed from its lookup structure and
    /// freed. Concurrent clears of the same handle fail with
    /// [`DbgfError::InvalidHandle`] for all callers but one.
    pub fn clear(&self, handle: BreakpointHandle) -> Result<(), DbgfError> {
        let record = self.store.get(handle).ok_or(DbgfError::InvalidHandle)?;
        if !record.begin_clear() {
            return Err(DbgfError::InvalidHandle);
        }

        let result = self.clear_record(handle, record);
        if result.is_err() {
            record.abort_clear();
        }

        result
    }

    fn clear_record(&self, handle: BreakpointHandle, record: &Record) -> Result<(), DbgfError> {
        let kind = record
            .kind()
            .ok_or(DbgfError::Corrupted("breakpoint has no kind"))?;

        self.disarm_for_clear(handle, record)?;

        match kind {
            BreakpointKind::Int3 { va, .. } => {
                self.int3.remove(&self.driver, &self.config, va, handle)?
            }
            BreakpointKind::Register { slot, .. } => self.hw.unassign(slot, handle)?,
            BreakpointKind::PortIo { port, count, .. } => {
                self.port_io
                    .remove(&self.driver, &self.config, port, count, handle)?
            }
            BreakpointKind::Mmio { .. } => {}
        }

        self.free(handle, record);
        tracing::debug!(%handle, "breakpoint cleared");
        Ok(())
    }

    /// Enables a breakpoint.
    ///
    /// Returns `false` if it was already enabled. Fails with
    /// [`DbgfError::InvalidHandle`] once the breakpoint is being cleared.
    pub fn enable(&self, handle: BreakpointHandle) -> Result<bool, DbgfError> {
        let record = self.store.get(handle).ok_or(DbgfError::InvalidHandle)?;
        self.arm(handle, record)
    }

    /// Disables a breakpoint.
    ///
    /// Returns `false` if it was already disabled. Fails with
    /// [`DbgfError::InvalidHandle`] once the breakpoint is being cleared.
    pub fn disable(&self, handle: BreakpointHandle) -> Result<bool, DbgfError> {
        let record = self.store.get(handle).ok_or(DbgfError::InvalidHandle)?;
        self.disarm(handle, record)
    }

    /// Returns a snapshot of a breakpoint.
    pub fn info(&self, handle: BreakpointHandle) -> Result<BreakpointInfo, DbgfError> {
        self.store
            .get(handle)
            .and_then(Record::snapshot)
            .ok_or(DbgfError::InvalidHandle)
    }

    /// Visits every breakpoint until `f` breaks.
    ///
    /// Enumeration is best-effort. Breakpoints set or cleared concurrently
    /// may or may not be visited, but every snapshot handed to `f` was live
    /// when it was taken.
    pub fn enumerate<F>(&self, mut f: F)
    where
        F: FnMut(BreakpointHandle, &BreakpointInfo) -> ControlFlow<()>,
    {
        for handle in self.store.handles() {
            let Some(info) = self.store.get(handle).and_then(Record::snapshot)
            else {
                continue;
            };

            // Freed while the snapshot was taken.
            if self.store.get(handle).is_none() {
                continue;
            }

            if f(handle, &info).is_break() {
                break;
            }
        }
    }

    //
    // Introspection
    //

    /// Returns the number of enabled software breakpoints.
    pub fn enabled_int3_count(&self) -> u32 {
        self.enabled_int3.load(Ordering::Acquire)
    }

    /// Returns the number of enabled hardware breakpoints.
    pub fn enabled_hw_count(&self) -> u32 {
        self.hw.enabled_count()
    }

    /// Returns the number of enabled hardware I/O breakpoints.
    pub fn enabled_hw_io_count(&self) -> u32 {
        self.hw.enabled_io_count()
    }

    /// Returns the number of enabled port I/O breakpoints.
    pub fn port_io_armed_count(&self) -> u32 {
        self.port_io.armed_count()
    }

    /// Returns the breakpoint the virtual CPU hit most recently.
    pub fn active_breakpoint(&self, vcpu: VcpuId) -> Result<Option<BreakpointHandle>, DbgfError> {
        Ok(self.vcpu(vcpu)?.active())
    }

    /// Returns `true` if the virtual CPU has a notification waiting for
    /// [`Dispatcher::handle_deferred`].
    pub fn has_deferred(&self, vcpu: VcpuId) -> Result<bool, DbgfError> {
        Ok(self.vcpu(vcpu)?.is_deferred())
    }

    /// Returns the number of allocated breakpoint chunks.
    pub fn allocated_chunks(&self) -> usize {
        self.store.allocated_chunks()
    }

    /// Returns the number of search tree nodes in use by colliding
    /// software breakpoints.
    pub fn tree_node_count(&self) -> usize {
        self.int3.l2_len()
    }
}
