use std::sync::{
    OnceLock,
    atomic::{AtomicU32, Ordering},
};

use dbgf_core::{DbgfConfig, DbgfDriver, DbgfError, IoPort, RendezvousMode};

use crate::BreakpointHandle;

/// Per-port lookup table of port I/O breakpoints.
pub(crate) struct PortIoTable {
    ports: OnceLock<Box<[AtomicU32]>>,

    // Number of enabled port I/O breakpoints. Interception is on while it
    // is non-zero.
    armed: AtomicU32,
}

impl PortIoTable {
    pub fn new() -> Self {
        Self {
            ports: OnceLock::new(),
            armed: AtomicU32::new(0),
        }
    }

    fn table<Driver>(&self, driver: &Driver, config: &DbgfConfig) -> Result<&[AtomicU32], DbgfError>
    where
        Driver: DbgfDriver,
    {
        if let Some(ports) = self.ports.get() {
            return Ok(ports);
        }

        driver.rendezvous(RendezvousMode::Once, config.rendezvous_timeout, &|_vcpu| {
            self.ports.get_or_init(|| {
                (0..IoPort::COUNT)
                    .map(|_| AtomicU32::new(BreakpointHandle::NIL.raw()))
                    .collect()
            });
            Ok(())
        })?;

        tracing::debug!("port I/O table allocated");

        self.ports
            .get()
            .map(|ports| &**ports)
            .ok_or(DbgfError::Other("rendezvous did not run its worker"))
    }

    /// Returns the breakpoint covering `port`.
    pub fn get(&self, port: IoPort) -> Option<BreakpointHandle> {
        let ports = self.ports.get()?;
        BreakpointHandle::from_raw(ports[port.index()].load(Ordering::Acquire))
    }

    /// Returns the breakpoint registered for exactly `count` ports starting
    /// at `port`.
    pub fn find_exact(&self, port: IoPort, count: u16) -> Option<BreakpointHandle> {
        let ports = self.ports.get()?;
        let range = port.index()..port.index() + usize::from(count);
        let handle = BreakpointHandle::from_raw(ports.get(range.start)?.load(Ordering::Acquire))?;

        let covered = ports[range.clone()]
            .iter()
            .all(|entry| entry.load(Ordering::Acquire) == handle.raw());
        let bounded = [range.start.checked_sub(1), Some(range.end)]
            .into_iter()
            .flatten()
            .filter_map(|index| ports.get(index))
            .all(|entry| entry.load(Ordering::Acquire) != handle.raw());

        (covered && bounded).then_some(handle)
    }

    /// Registers `handle` for every port of the range.
    ///
    /// Either every port is claimed or none is.
    pub fn add<Driver>(
        &self,
        driver: &Driver,
        config: &DbgfConfig,
        port: IoPort,
        count: u16,
        handle: BreakpointHandle,
    ) -> Result<(), DbgfError>
    where
        Driver: DbgfDriver,
    {
        let ports = self.table(driver, config)?;
        let range = &ports[port.index()..port.index() + usize::from(count)];

        for (claimed, entry) in range.iter().enumerate() {
            if entry
                .compare_exchange(
                    BreakpointHandle::NIL.raw(),
                    handle.raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                continue;
            }

            for entry in &range[..claimed] {
                entry.store(BreakpointHandle::NIL.raw(), Ordering::Release);
            }

            return Err(DbgfError::RangeOverlapping);
        }

        Ok(())
    }

    /// Unregisters `handle` from every port of the range.
    ///
    /// Runs inside a rendezvous so that no access being dispatched still
    /// holds the handle once this returns.
    pub fn remove<Driver>(
        &self,
        driver: &Driver,
        config: &DbgfConfig,
        port: IoPort,
        count: u16,
        handle: BreakpointHandle,
    ) -> Result<(), DbgfError>
    where
        Driver: DbgfDriver,
    {
        let ports = self
            .ports
            .get()
            .ok_or(DbgfError::Corrupted("port I/O table missing"))?;
        let range = &ports[port.index()..port.index() + usize::from(count)];

        driver.rendezvous(RendezvousMode::Once, config.rendezvous_timeout, &|_vcpu| {
            let mut result = Ok(());

            for entry in range {
                if entry
                    .compare_exchange(
                        handle.raw(),
                        BreakpointHandle::NIL.raw(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    result = Err(DbgfError::Corrupted("port owned by another breakpoint"));
                }
            }

            result
        })
    }

    /// Counts an enabled breakpoint. Returns `true` for the first one.
    pub fn arm(&self) -> bool {
        self.armed.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Uncounts an enabled breakpoint. Returns `true` for the last one.
    pub fn disarm(&self) -> bool {
        self.armed.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn armed_count(&self) -> u32 {
        self.armed.load(Ordering::Acquire)
    }
}
