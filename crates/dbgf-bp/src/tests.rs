use std::{
    collections::{HashMap, HashSet},
    ops::ControlFlow,
    sync::{
        Arc, Mutex, mpsc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use dbgf_arch_amd64::{Amd64, DebugRegisters};
use dbgf_core::{
    DbgfConfig, DbgfDriver, DbgfError, HitPhase, HwAccess, IoAccess, IoPort, Pa,
    RendezvousMode, RendezvousWorker, TrapOutcome, Va, VcpuId, Verdict,
};

use crate::{
    BreakpointFlags, BreakpointHandle, BreakpointKind, BreakpointManager, BreakpointRequest,
    ExecCallback, Hit, IoCallback, IoHit, SetOutcome,
    int3::L1Entry,
    store::{BreakpointStore, RecordInit},
};

///////////////////////////////////////////////////////////////////////////////
// Mock Driver
///////////////////////////////////////////////////////////////////////////////

/// Byte returned for guest memory that was never written.
const FILL: u8 = 0x90;

pub(crate) struct MockDriver {
    vcpus: u16,
    memory: Mutex<HashMap<u64, u8>>,
    unmapped: Mutex<HashSet<u64>>,
    read_only: Mutex<HashSet<u64>>,
    registers: Mutex<HashMap<VcpuId, DebugRegisters>>,
    emulated: Mutex<Vec<(VcpuId, Va, u8)>>,
    port_io_intercept: AtomicBool,
    rendezvous_count: AtomicUsize,
    fail_rendezvous: AtomicBool,
    gate: Mutex<Option<Gate>>,
}

/// Holds one rendezvous until the test lets it go.
struct Gate {
    entered: mpsc::Sender<()>,
    release: mpsc::Receiver<Result<(), DbgfError>>,
}

impl MockDriver {
    pub(crate) fn new(vcpus: u16) -> Self {
        Self {
            vcpus,
            memory: Mutex::new(HashMap::new()),
            unmapped: Mutex::new(HashSet::new()),
            read_only: Mutex::new(HashSet::new()),
            registers: Mutex::new(HashMap::new()),
            emulated: Mutex::new(Vec::new()),
            port_io_intercept: AtomicBool::new(false),
            rendezvous_count: AtomicUsize::new(0),
            fail_rendezvous: AtomicBool::new(false),
            gate: Mutex::new(None),
        }
    }

    fn peek(&self, address: u64) -> u8 {
        self.memory
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or(FILL)
    }

    fn poke(&self, address: u64, value: u8) {
        self.memory.lock().unwrap().insert(address, value);
    }

    fn unmap(&self, va: Va) {
        self.unmapped.lock().unwrap().insert(va.0);
    }

    fn protect(&self, pa: u64) {
        self.read_only.lock().unwrap().insert(pa);
    }

    fn registers(&self, vcpu: VcpuId) -> DebugRegisters {
        self.registers
            .lock()
            .unwrap()
            .get(&vcpu)
            .copied()
            .unwrap_or_default()
    }

    fn emulated(&self) -> Vec<(VcpuId, Va, u8)> {
        self.emulated.lock().unwrap().clone()
    }

    fn fail_rendezvous(&self, fail: bool) {
        self.fail_rendezvous.store(fail, Ordering::SeqCst);
    }

    /// Holds the next rendezvous before its worker runs.
    ///
    /// The returned receiver signals that the rendezvous was entered. The
    /// result sent through the returned sender lets it go: `Ok` runs the
    /// worker, an error fails the rendezvous instead.
    fn hold_next_rendezvous(
        &self,
    ) -> (mpsc::Receiver<()>, mpsc::Sender<Result<(), DbgfError>>) {
        let (entered_tx, entered) = mpsc::channel();
        let (release, release_rx) = mpsc::channel();

        *self.gate.lock().unwrap() = Some(Gate {
            entered: entered_tx,
            release: release_rx,
        });

        (entered, release)
    }

    fn intercepting(&self) -> bool {
        self.port_io_intercept.load(Ordering::SeqCst)
    }
}

impl DbgfDriver for MockDriver {
    type Architecture = Amd64;

    fn vcpu_count(&self) -> u16 {
        self.vcpus
    }

    fn translate_address(&self, _vcpu: VcpuId, va: Va) -> Result<Pa, DbgfError> {
        if self.unmapped.lock().unwrap().contains(&va.0) {
            return Err(DbgfError::Translation(va));
        }

        Ok(Pa(va.0))
    }

    fn read_physical(&self, pa: Pa, buffer: &mut [u8]) -> Result<(), DbgfError> {
        for (offset, byte) in buffer.iter_mut().enumerate() {
            *byte = self.peek(pa.0 + offset as u64);
        }

        Ok(())
    }

    fn write_physical(&self, pa: Pa, data: &[u8]) -> Result<(), DbgfError> {
        if self.read_only.lock().unwrap().contains(&pa.0) {
            return Err(DbgfError::Other("page is read-only"));
        }

        for (offset, byte) in data.iter().enumerate() {
            self.poke(pa.0 + offset as u64, *byte);
        }

        Ok(())
    }

    fn read_virtual(&self, vcpu: VcpuId, va: Va, buffer: &mut [u8]) -> Result<(), DbgfError> {
        let pa = self.translate_address(vcpu, va)?;
        self.read_physical(pa, buffer)
    }

    fn emulate_one(&self, vcpu: VcpuId, va: Va, prefetched: &[u8]) -> Result<(), DbgfError> {
        self.emulated.lock().unwrap().push((vcpu, va, prefetched[0]));
        Ok(())
    }

    fn load_debug_registers(
        &self,
        vcpu: VcpuId,
        registers: &DebugRegisters,
    ) -> Result<(), DbgfError> {
        self.registers.lock().unwrap().insert(vcpu, *registers);
        Ok(())
    }

    fn set_port_io_intercept(&self, enabled: bool) -> Result<(), DbgfError> {
        self.port_io_intercept.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn rendezvous(
        &self,
        mode: RendezvousMode,
        _timeout: Duration,
        worker: &RendezvousWorker<'_>,
    ) -> Result<(), DbgfError> {
        self.rendezvous_count.fetch_add(1, Ordering::SeqCst);

        if self.fail_rendezvous.load(Ordering::SeqCst) {
            return Err(DbgfError::Timeout);
        }

        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.send(()).unwrap();
            gate.release.recv().unwrap()?;
        }

        match mode {
            RendezvousMode::Once => worker(VcpuId(0)),
            RendezvousMode::AllAtOnce => (0..self.vcpus).try_for_each(|vcpu| worker(VcpuId(vcpu))),
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// Test Helpers
///////////////////////////////////////////////////////////////////////////////

const VCPU: VcpuId = VcpuId(0);

type Log<T> = Arc<Mutex<Vec<T>>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

fn manager() -> BreakpointManager<MockDriver> {
    init_tracing();
    BreakpointManager::new(MockDriver::new(2))
}

/// Records `(user, phase, hits)` of every execution hit.
fn exec_recorder(verdict: Verdict) -> (ExecCallback, Log<(u64, HitPhase, u64)>) {
    let log = Log::default();
    let callback: ExecCallback = Arc::new({
        let log = log.clone();
        move |hit: &Hit<'_>| {
            log.lock()
                .unwrap()
                .push((hit.user, hit.phase, hit.info.hits()));
            verdict
        }
    });

    (callback, log)
}

/// Records `(port, access, value, user)` of every port I/O hit.
fn io_recorder(verdict: Verdict) -> (IoCallback, Log<(IoPort, IoAccess, u32, u64)>) {
    let log = Log::default();
    let callback: IoCallback = Arc::new({
        let log = log.clone();
        move |hit: &IoHit<'_>| {
            log.lock()
                .unwrap()
                .push((hit.port, hit.access, hit.value, hit.user));
            verdict
        }
    });

    (callback, log)
}

fn disabled() -> BreakpointFlags {
    BreakpointFlags::HIT_EXEC_BEFORE
}

fn count(manager: &BreakpointManager<MockDriver>) -> usize {
    let mut count = 0;
    manager.enumerate(|_, _| {
        count += 1;
        ControlFlow::Continue(())
    });
    count
}

///////////////////////////////////////////////////////////////////////////////
// Software breakpoints
///////////////////////////////////////////////////////////////////////////////

#[test]
fn instruction_byte_round_trip() {
    let manager = manager();
    let va = Va(0x40_1000);
    manager.driver().poke(va.0, 0x55);

    let handle = manager.set(BreakpointRequest::int3(va)).unwrap().handle();
    assert_eq!(manager.driver().peek(va.0), 0xcc);
    assert_eq!(manager.enabled_int3_count(), 1);
    assert!(matches!(
        manager.info(handle).unwrap().kind(),
        BreakpointKind::Int3 { original: 0x55, .. }
    ));

    assert!(manager.disable(handle).unwrap());
    assert!(!manager.disable(handle).unwrap());
    assert_eq!(manager.driver().peek(va.0), 0x55);
    assert_eq!(manager.enabled_int3_count(), 0);

    assert!(manager.enable(handle).unwrap());
    assert!(!manager.enable(handle).unwrap());
    assert_eq!(manager.driver().peek(va.0), 0xcc);
    assert_eq!(manager.enabled_int3_count(), 1);

    manager.clear(handle).unwrap();
    assert_eq!(manager.driver().peek(va.0), 0x55);
    assert_eq!(manager.enabled_int3_count(), 0);
    assert!(matches!(manager.info(handle), Err(DbgfError::InvalidHandle)));
    assert!(matches!(manager.clear(handle), Err(DbgfError::InvalidHandle)));
}

#[test]
fn overwritten_instruction_is_not_restored() {
    let manager = manager();
    let va = Va(0x40_2000);
    manager.driver().poke(va.0, 0x55);

    let handle = manager.set(BreakpointRequest::int3(va)).unwrap().handle();
    manager.driver().poke(va.0, 0x48);

    assert!(manager.disable(handle).unwrap());
    assert_eq!(manager.driver().peek(va.0), 0x48);
    assert!(!manager.info(handle).unwrap().is_enabled());
    assert_eq!(manager.enabled_int3_count(), 0);
}

#[test]
fn duplicate_instruction_breakpoint_is_enabled() {
    let manager = manager();
    let va = Va(0x40_3000);

    let first = manager
        .set(BreakpointRequest::int3(va).with_flags(disabled()))
        .unwrap();
    assert!(matches!(first, SetOutcome::Created(_)));
    assert_eq!(manager.driver().peek(va.0), FILL);

    let second = manager.set(BreakpointRequest::int3(va)).unwrap();
    assert_eq!(second, SetOutcome::AlreadyExists(first.handle()));
    assert!(manager.info(first.handle()).unwrap().is_enabled());
    assert_eq!(manager.driver().peek(va.0), 0xcc);
    assert_eq!(count(&manager), 1);
}

#[test]
fn failed_translation_leaves_nothing_behind() {
    let manager = manager();
    let va = Va(0x40_4000);
    manager.driver().unmap(va);

    assert!(matches!(
        manager.set(BreakpointRequest::int3(va)),
        Err(DbgfError::Translation(address)) if address == va
    ));
    assert_eq!(count(&manager), 0);
    assert_eq!(manager.int3.entry(va).unwrap(), L1Entry::Empty);
}

#[test]
fn failed_patch_is_unwound() {
    let manager = manager();
    let (exec, _) = exec_recorder(Verdict::Continue);
    let owner = manager.create_owner(Some(exec), None).unwrap();

    let va = Va(0x40_5000);
    manager.driver().protect(va.0);

    assert!(
        manager
            .set(BreakpointRequest::int3(va).with_owner(owner))
            .is_err()
    );
    assert_eq!(count(&manager), 0);
    assert_eq!(manager.enabled_int3_count(), 0);
    assert_eq!(manager.int3.entry(va).unwrap(), L1Entry::Empty);

    // The owner reference taken for the breakpoint was returned.
    manager.destroy_owner(owner).unwrap();
}

#[test]
fn unremovable_breakpoint_is_kept_disabled() {
    let manager = manager();
    let (exec, _) = exec_recorder(Verdict::Continue);
    let owner = manager.create_owner(Some(exec), None).unwrap();

    // Allocates the tables in another bucket.
    let other = manager
        .set(BreakpointRequest::int3(Va(0x50_6000)))
        .unwrap()
        .handle();

    let va = Va(0x40_7000);
    manager.driver().protect(va.0);
    manager.driver().fail_rendezvous(true);

    assert!(matches!(
        manager.set(BreakpointRequest::int3(va).with_owner(owner)),
        Err(DbgfError::Other(_))
    ));
    manager.driver().fail_rendezvous(false);

    let L1Entry::Direct(handle) = manager.int3.entry(va).unwrap()
    else {
        panic!("the index entry was removed");
    };

    let info = manager.info(handle).unwrap();
    assert!(!info.is_enabled());
    assert_eq!(info.owner(), Some(owner));
    assert_eq!(count(&manager), 2);
    assert_eq!(manager.enabled_int3_count(), 1);
    assert_eq!(manager.driver().peek(va.0), FILL);

    // Lookups keep resolving the entry.
    assert_eq!(manager.full().on_int3(VCPU, va).unwrap(), TrapOutcome::Forward);
    assert_eq!(
        manager.set(BreakpointRequest::int3(va).with_flags(disabled())).unwrap(),
        SetOutcome::AlreadyExists(handle)
    );
    assert!(matches!(
        manager.destroy_owner(owner),
        Err(DbgfError::OwnerBusy)
    ));

    manager.clear(handle).unwrap();
    manager.clear(other).unwrap();
    assert_eq!(manager.int3.entry(va).unwrap(), L1Entry::Empty);
    manager.destroy_owner(owner).unwrap();
}

#[test]
fn colliding_addresses_share_a_tree() {
    let manager = manager();
    let a = Va(0x1000);
    let b = Va(0x1040);
    let c = Va(0x1080);

    let ha = manager.set(BreakpointRequest::int3(a)).unwrap().handle();
    assert_eq!(manager.int3.entry(a).unwrap(), L1Entry::Direct(ha));

    // A direct entry for another address in the bucket is not a hit.
    assert_eq!(manager.full().on_int3(VCPU, b).unwrap(), TrapOutcome::Forward);

    let hb = manager.set(BreakpointRequest::int3(b)).unwrap().handle();
    assert!(matches!(manager.int3.entry(a).unwrap(), L1Entry::Tree(_)));
    assert_eq!(manager.tree_node_count(), 2);

    // Unowned breakpoints halt.
    assert_eq!(manager.full().on_int3(VCPU, a).unwrap(), TrapOutcome::Halt(ha));
    assert_eq!(manager.full().on_int3(VCPU, b).unwrap(), TrapOutcome::Halt(hb));
    assert_eq!(manager.full().on_int3(VCPU, c).unwrap(), TrapOutcome::Forward);

    manager.clear(ha).unwrap();
    assert_eq!(manager.int3.entry(b).unwrap(), L1Entry::Direct(hb));
    assert_eq!(manager.tree_node_count(), 0);
    assert_eq!(manager.full().on_int3(VCPU, a).unwrap(), TrapOutcome::Forward);
    assert_eq!(manager.full().on_int3(VCPU, b).unwrap(), TrapOutcome::Halt(hb));

    manager.clear(hb).unwrap();
    assert_eq!(manager.int3.entry(b).unwrap(), L1Entry::Empty);
}

#[test]
fn index_survives_any_removal_order() {
    let manager = manager();

    // All in the bucket of 0x30000, some differing only in the upper bits.
    let addresses = (0..48u64)
        .map(|i| Va(((i % 3) << 40) | 0x3_0000 | ((i * 29) % 48) * 0x20))
        .collect::<Vec<_>>();

    let mut live = addresses
        .iter()
        .map(|&va| {
            let request = BreakpointRequest::int3(va).with_flags(disabled());
            (va, manager.set(request).unwrap().handle())
        })
        .collect::<Vec<_>>();

    assert_eq!(manager.tree_node_count(), addresses.len());

    let mut removed = Vec::new();
    let check = |live: &[(Va, BreakpointHandle)], removed: &[Va]| {
        for &(va, handle) in live {
            assert_eq!(
                manager.int3.lookup(&manager.store, va).unwrap(),
                Some(handle)
            );
        }

        for &va in removed {
            assert_eq!(manager.int3.lookup(&manager.store, va).unwrap(), None);
        }
    };

    // Every other breakpoint first, then the rest from the back.
    let mut index = 0;
    while index < live.len() {
        let (va, handle) = live.remove(index);
        manager.clear(handle).unwrap();
        removed.push(va);
        check(&live, &removed);
        index += 1;
    }

    while let Some((va, handle)) = live.pop() {
        if live.len() == 1 {
            assert!(matches!(manager.int3.entry(va).unwrap(), L1Entry::Tree(_)));
        }

        manager.clear(handle).unwrap();
        removed.push(va);
        check(&live, &removed);

        if let [(_, last)] = live.as_slice() {
            assert_eq!(manager.int3.entry(va).unwrap(), L1Entry::Direct(*last));
            assert_eq!(manager.tree_node_count(), 0);
        }
    }

    assert_eq!(manager.int3.entry(addresses[0]).unwrap(), L1Entry::Empty);
    assert_eq!(manager.tree_node_count(), 0);
}

#[test]
fn concurrent_allocation_yields_unique_handles() {
    let manager = manager();
    let handles = Mutex::new(Vec::new());

    // Every thread competes for the same eight buckets.
    std::thread::scope(|scope| {
        for thread in 0..8u64 {
            let manager = &manager;
            let handles = &handles;

            scope.spawn(move || {
                for i in 0..64u64 {
                    let va = Va(0x1000_0000 + (i % 8) * 0x1_0000 + (i / 8) * 0x200 + thread * 0x20);
                    let handle = manager.set(BreakpointRequest::int3(va)).unwrap().handle();
                    handles.lock().unwrap().push((va, handle));
                }
            });
        }
    });

    let handles = handles.into_inner().unwrap();
    let unique = handles
        .iter()
        .map(|&(_, handle)| handle)
        .collect::<HashSet<_>>();

    assert_eq!(handles.len(), 512);
    assert_eq!(unique.len(), 512);
    assert_eq!(manager.enabled_int3_count(), 512);

    for (va, handle) in handles {
        assert_eq!(
            manager.int3.lookup(&manager.store, va).unwrap(),
            Some(handle)
        );
        assert_eq!(manager.driver().peek(va.0), 0xcc);
    }
}

///////////////////////////////////////////////////////////////////////////////
// Hits
///////////////////////////////////////////////////////////////////////////////

#[test]
fn hits_are_counted_and_stepped_over() {
    let manager = manager();
    let (exec, log) = exec_recorder(Verdict::Continue);
    let owner = manager.create_owner(Some(exec), None).unwrap();

    let va = Va(0x40_6000);
    manager.driver().poke(va.0, 0x55);

    let handle = manager
        .set(BreakpointRequest::int3(va).with_owner(owner).with_user(7))
        .unwrap()
        .handle();

    for _ in 0..5 {
        assert_eq!(manager.full().on_int3(VCPU, va).unwrap(), TrapOutcome::Resume);
    }

    assert_eq!(manager.info(handle).unwrap().hits(), 5);
    assert_eq!(manager.active_breakpoint(VCPU).unwrap(), Some(handle));
    assert_eq!(
        *log.lock().unwrap(),
        (1..=5)
            .map(|hits| (7, HitPhase::Before, hits))
            .collect::<Vec<_>>()
    );

    // The original byte replaces the trap instruction in the prefetch.
    let emulated = manager.driver().emulated();
    assert_eq!(emulated.len(), 5);
    assert!(emulated.iter().all(|&entry| entry == (VCPU, va, 0x55)));
}

#[test]
fn hit_window_filters_notifications() {
    let manager = manager();
    let (exec, log) = exec_recorder(Verdict::Continue);
    let owner = manager.create_owner(Some(exec), None).unwrap();

    let va = Va(0x40_7000);
    let handle = manager
        .set(
            BreakpointRequest::int3(va)
                .with_owner(owner)
                .hit_trigger(3)
                .hit_disable(4),
        )
        .unwrap()
        .handle();

    for _ in 0..6 {
        assert_eq!(manager.full().on_int3(VCPU, va).unwrap(), TrapOutcome::Resume);
    }

    let hits = log
        .lock()
        .unwrap()
        .iter()
        .map(|&(_, _, hits)| hits)
        .collect::<Vec<_>>();

    assert_eq!(hits, [3, 4]);
    assert_eq!(manager.info(handle).unwrap().hits(), 6);
    assert_eq!(manager.driver().emulated().len(), 6);

    assert!(matches!(
        manager.set(BreakpointRequest::int3(Va(0x40_8000)).hit_trigger(5).hit_disable(4)),
        Err(DbgfError::InvalidParameter(_))
    ));
}

#[test]
fn after_phase_follows_the_step() {
    let manager = manager();
    let (exec, log) = exec_recorder(Verdict::Continue);
    let owner = manager.create_owner(Some(exec), None).unwrap();

    let va = Va(0x40_9000);
    manager
        .set(
            BreakpointRequest::int3(va)
                .with_owner(owner)
                .with_flags(BreakpointFlags::all()),
        )
        .unwrap();

    assert_eq!(manager.full().on_int3(VCPU, va).unwrap(), TrapOutcome::Resume);

    let phases = log
        .lock()
        .unwrap()
        .iter()
        .map(|&(_, phase, _)| phase)
        .collect::<Vec<_>>();
    assert_eq!(phases, [HitPhase::Before, HitPhase::After]);
    assert_eq!(manager.driver().emulated().len(), 1);
}

#[test]
fn halting_verdict_skips_the_step() {
    let manager = manager();
    let (exec, _) = exec_recorder(Verdict::Halt);
    let owner = manager.create_owner(Some(exec), None).unwrap();

    let va = Va(0x40_a000);
    let handle = manager
        .set(BreakpointRequest::int3(va).with_owner(owner))
        .unwrap()
        .handle();

    assert_eq!(manager.full().on_int3(VCPU, va).unwrap(), TrapOutcome::Halt(handle));
    assert!(manager.driver().emulated().is_empty());
}

#[test]
fn disabled_breakpoints_forward() {
    let manager = manager();
    let va = Va(0x40_b000);
    let other = Va(0x50_b000);

    let handle = manager
        .set(BreakpointRequest::int3(va).with_flags(disabled()))
        .unwrap()
        .handle();

    // Nothing is armed at all.
    assert_eq!(manager.full().on_int3(VCPU, va).unwrap(), TrapOutcome::Forward);

    // Something else is armed, this one still is not.
    manager.set(BreakpointRequest::int3(other)).unwrap();
    assert_eq!(manager.full().on_int3(VCPU, va).unwrap(), TrapOutcome::Forward);
    assert_eq!(manager.info(handle).unwrap().hits(), 0);
}

#[test]
fn full_context_cannot_defer() {
    let manager = manager();
    let (exec, _) = exec_recorder(Verdict::DeferToFull);
    let owner = manager.create_owner(Some(exec), None).unwrap();

    let va = Va(0x40_c000);
    manager
        .set(BreakpointRequest::int3(va).with_owner(owner))
        .unwrap();

    let err = manager.full().on_int3(VCPU, va).unwrap_err();
    assert!(matches!(err, DbgfError::OwnerContract));
    assert!(err.is_fatal());
}

///////////////////////////////////////////////////////////////////////////////
// Reduced context
///////////////////////////////////////////////////////////////////////////////

#[test]
fn reduced_hits_are_deferred_to_full() {
    let manager = manager();
    let (exec, log) = exec_recorder(Verdict::Continue);
    let owner = manager.create_owner(Some(exec), None).unwrap();

    let va = Va(0x40_d000);
    manager.driver().poke(va.0, 0x55);

    let handle = manager
        .set(BreakpointRequest::int3(va).with_owner(owner))
        .unwrap()
        .handle();

    assert_eq!(
        manager.reduced().on_int3(VCPU, va).unwrap(),
        TrapOutcome::DeferToFull(handle)
    );
    assert!(manager.has_deferred(VCPU).unwrap());
    assert!(log.lock().unwrap().is_empty());
    assert!(manager.driver().emulated().is_empty());
    assert_eq!(manager.info(handle).unwrap().hits(), 1);

    assert!(manager.reduced().handle_deferred(VCPU).is_err());

    assert_eq!(manager.full().handle_deferred(VCPU).unwrap(), TrapOutcome::Resume);
    assert!(!manager.has_deferred(VCPU).unwrap());
    assert_eq!(*log.lock().unwrap(), [(0, HitPhase::Before, 1)]);
    assert_eq!(manager.driver().emulated(), [(VCPU, va, 0x55)]);

    // Nothing left to pick up, and the hit was not counted twice.
    assert_eq!(manager.full().handle_deferred(VCPU).unwrap(), TrapOutcome::Forward);
    assert_eq!(manager.info(handle).unwrap().hits(), 1);
}

#[test]
fn reduced_callbacks_see_reduced_user_data() {
    let manager = manager();
    let (exec, full_log) = exec_recorder(Verdict::Continue);
    let (reduced_exec, reduced_log) = exec_recorder(Verdict::Continue);
    let owner = manager.create_owner(Some(exec), None).unwrap();
    manager
        .set_up_reduced_owner(owner, Some(reduced_exec), None)
        .unwrap();

    let va = Va(0x40_e000);
    let handle = manager
        .set(BreakpointRequest::int3(va).with_owner(owner).with_user(1))
        .unwrap()
        .handle();
    manager.set_up_reduced_context(handle, 2).unwrap();

    assert_eq!(manager.reduced().on_int3(VCPU, va).unwrap(), TrapOutcome::Resume);
    assert_eq!(manager.full().on_int3(VCPU, va).unwrap(), TrapOutcome::Resume);

    assert_eq!(*reduced_log.lock().unwrap(), [(2, HitPhase::Before, 1)]);
    assert_eq!(*full_log.lock().unwrap(), [(1, HitPhase::Before, 2)]);
    assert!(!manager.has_deferred(VCPU).unwrap());
}

#[test]
fn reduced_callback_may_defer() {
    let manager = manager();
    let (exec, full_log) = exec_recorder(Verdict::Continue);
    let (reduced_exec, reduced_log) = exec_recorder(Verdict::DeferToFull);
    let owner = manager.create_owner(Some(exec), None).unwrap();
    manager
        .set_up_reduced_owner(owner, Some(reduced_exec), None)
        .unwrap();

    let va = Va(0x40_f000);
    let handle = manager
        .set(BreakpointRequest::int3(va).with_owner(owner))
        .unwrap()
        .handle();

    assert_eq!(
        manager.reduced().on_int3(VCPU, va).unwrap(),
        TrapOutcome::DeferToFull(handle)
    );
    assert_eq!(reduced_log.lock().unwrap().len(), 1);
    assert!(manager.driver().emulated().is_empty());

    assert_eq!(manager.full().handle_deferred(VCPU).unwrap(), TrapOutcome::Resume);
    assert_eq!(full_log.lock().unwrap().len(), 1);
    assert_eq!(manager.driver().emulated().len(), 1);
}

#[test]
fn deferred_hit_on_cleared_breakpoint_resumes() {
    let manager = manager();
    let (exec, log) = exec_recorder(Verdict::Continue);
    let owner = manager.create_owner(Some(exec), None).unwrap();

    let va = Va(0x41_0000);
    let handle = manager
        .set(BreakpointRequest::int3(va).with_owner(owner))
        .unwrap()
        .handle();

    assert_eq!(
        manager.reduced().on_int3(VCPU, va).unwrap(),
        TrapOutcome::DeferToFull(handle)
    );

    manager.clear(handle).unwrap();
    assert_eq!(manager.full().handle_deferred(VCPU).unwrap(), TrapOutcome::Resume);
    assert!(log.lock().unwrap().is_empty());
}

///////////////////////////////////////////////////////////////////////////////
// Hardware breakpoints
///////////////////////////////////////////////////////////////////////////////

#[test]
fn hardware_slots_are_limited() {
    let manager = manager();

    let handles = (0..4u64)
        .map(|i| {
            let request = BreakpointRequest::register(0x7000 + i * 8, HwAccess::Write, 8);
            manager.set(request).unwrap().handle()
        })
        .collect::<Vec<_>>();

    assert!(matches!(
        manager.set(BreakpointRequest::register(0x8000, HwAccess::Write, 8)),
        Err(DbgfError::NoMoreSlots)
    ));
    assert_eq!(count(&manager), 4);
    assert_eq!(manager.enabled_hw_count(), 4);

    for vcpu in [VcpuId(0), VcpuId(1)] {
        let registers = manager.driver().registers(vcpu);
        for slot in 0..4u8 {
            assert!(registers.dr7.global_breakpoint(slot));
            assert_eq!(registers.address[usize::from(slot)], 0x7000 + u64::from(slot) * 8);
        }
    }

    manager.clear(handles[0]).unwrap();
    assert_eq!(manager.enabled_hw_count(), 3);
    assert!(!manager.driver().registers(VcpuId(1)).dr7.global_breakpoint(0));

    let handle = manager
        .set(BreakpointRequest::register(0x8000, HwAccess::Write, 8))
        .unwrap()
        .handle();
    assert!(matches!(
        manager.info(handle).unwrap().kind(),
        BreakpointKind::Register { slot: 0, .. }
    ));
}

#[test]
fn duplicate_hardware_breakpoint_is_reported() {
    let manager = manager();
    let request = BreakpointRequest::register(0x7000, HwAccess::ReadWrite, 4);

    let handle = manager.set(request).unwrap().handle();
    assert_eq!(manager.set(request).unwrap(), SetOutcome::AlreadyExists(handle));
    assert!(matches!(
        manager.set(BreakpointRequest::register(0x7000, HwAccess::ReadWrite, 3)),
        Err(DbgfError::InvalidParameter(_))
    ));
}

#[test]
fn failed_hardware_arm_is_reverted() {
    let manager = manager();
    let handle = manager
        .set(BreakpointRequest::register(0x7000, HwAccess::Execute, 1).with_flags(disabled()))
        .unwrap()
        .handle();

    manager.driver().fail_rendezvous(true);
    assert!(matches!(manager.enable(handle), Err(DbgfError::Timeout)));
    assert!(!manager.info(handle).unwrap().is_enabled());
    assert_eq!(manager.enabled_hw_count(), 0);

    manager.driver().fail_rendezvous(false);
    assert!(manager.enable(handle).unwrap());
    assert_eq!(manager.enabled_hw_count(), 1);
}

#[test]
fn debug_exception_dispatch() {
    let manager = manager();
    let (exec, log) = exec_recorder(Verdict::Continue);
    let owner = manager.create_owner(Some(exec), None).unwrap();

    let unowned = manager
        .set(BreakpointRequest::register(0x40_2000, HwAccess::Execute, 1))
        .unwrap()
        .handle();
    let owned = manager
        .set(BreakpointRequest::register(0x40_3000, HwAccess::Execute, 1).with_owner(owner))
        .unwrap()
        .handle();

    let full = manager.full();
    assert_eq!(full.on_debug_exception(VCPU, 0b0001).unwrap(), TrapOutcome::Halt(unowned));
    assert_eq!(full.on_debug_exception(VCPU, 0b0010).unwrap(), TrapOutcome::Resume);
    assert_eq!(full.on_debug_exception(VCPU, 0b0100).unwrap(), TrapOutcome::Forward);

    assert_eq!(manager.info(unowned).unwrap().hits(), 1);
    assert_eq!(manager.info(owned).unwrap().hits(), 1);
    assert_eq!(*log.lock().unwrap(), [(0, HitPhase::Before, 1)]);
    assert_eq!(manager.active_breakpoint(VCPU).unwrap(), Some(owned));
}

///////////////////////////////////////////////////////////////////////////////
// Port I/O breakpoints
///////////////////////////////////////////////////////////////////////////////

#[test]
fn port_ranges_do_not_overlap() {
    let manager = manager();

    let first = manager
        .set(BreakpointRequest::port_io(0x60, 4, IoAccess::ALL))
        .unwrap()
        .handle();
    assert!(manager.driver().port_io_intercept.load(Ordering::SeqCst));

    assert!(matches!(
        manager.set(BreakpointRequest::port_io(0x5e, 4, IoAccess::ALL)),
        Err(DbgfError::RangeOverlapping)
    ));

    // The rejected range released the ports it had claimed.
    let second = manager
        .set(BreakpointRequest::port_io(0x5e, 2, IoAccess::ALL))
        .unwrap()
        .handle();

    assert_eq!(
        manager
            .set(BreakpointRequest::port_io(0x60, 4, IoAccess::ALL))
            .unwrap(),
        SetOutcome::AlreadyExists(first)
    );
    assert!(matches!(
        manager.set(BreakpointRequest::port_io(0x60, 2, IoAccess::ALL)),
        Err(DbgfError::RangeOverlapping)
    ));
    assert_eq!(manager.port_io_armed_count(), 2);

    manager.clear(first).unwrap();
    assert!(manager.driver().port_io_intercept.load(Ordering::SeqCst));
    manager.clear(second).unwrap();
    assert!(!manager.driver().port_io_intercept.load(Ordering::SeqCst));
    assert_eq!(manager.port_io_armed_count(), 0);

    assert!(matches!(
        manager.set(BreakpointRequest::port_io(0x60, 0, IoAccess::ALL)),
        Err(DbgfError::InvalidParameter(_))
    ));
    assert!(matches!(
        manager.set(BreakpointRequest::port_io(0xffff, 2, IoAccess::ALL)),
        Err(DbgfError::InvalidParameter(_))
    ));
}

#[test]
fn port_io_dispatch() {
    let manager = manager();
    let (io, log) = io_recorder(Verdict::Continue);
    let owner = manager.create_owner(None, Some(io)).unwrap();

    let handle = manager
        .set(
            BreakpointRequest::port_io(0x70, 2, IoAccess::WRITE)
                .with_owner(owner)
                .with_user(9),
        )
        .unwrap()
        .handle();

    let full = manager.full();
    let port = IoPort(0x71);

    // Wrong direction, phase without notification, port outside the range.
    assert_eq!(
        full.on_port_io(VCPU, port, IoAccess::READ_BYTE, 0, HitPhase::Before)
            .unwrap(),
        TrapOutcome::Forward
    );
    assert_eq!(
        full.on_port_io(VCPU, port, IoAccess::WRITE_BYTE, 0x8f, HitPhase::After)
            .unwrap(),
        TrapOutcome::Forward
    );
    assert_eq!(
        full.on_port_io(VCPU, IoPort(0x72), IoAccess::WRITE_BYTE, 0x8f, HitPhase::Before)
            .unwrap(),
        TrapOutcome::Forward
    );

    assert_eq!(
        full.on_port_io(VCPU, port, IoAccess::WRITE_BYTE, 0x8f, HitPhase::Before)
            .unwrap(),
        TrapOutcome::Resume
    );
    assert_eq!(
        *log.lock().unwrap(),
        [(port, IoAccess::WRITE_BYTE, 0x8f, 9)]
    );
    assert_eq!(manager.info(handle).unwrap().hits(), 1);
}

#[test]
fn wide_port_access_covers_every_port() {
    let manager = manager();
    let (io, log) = io_recorder(Verdict::Continue);
    let owner = manager.create_owner(None, Some(io)).unwrap();

    let handle = manager
        .set(BreakpointRequest::port_io(0x62, 1, IoAccess::WRITE).with_owner(owner))
        .unwrap()
        .handle();

    let full = manager.full();
    let port = IoPort(0x60);
    let dword = IoAccess::for_access(true, 4).unwrap();

    // A word at 0x60 stops short of 0x62.
    assert_eq!(
        full.on_port_io(VCPU, port, IoAccess::WRITE_WORD, 0x1234, HitPhase::Before)
            .unwrap(),
        TrapOutcome::Forward
    );

    assert_eq!(
        full.on_port_io(VCPU, port, dword, 0x1234_5678, HitPhase::Before)
            .unwrap(),
        TrapOutcome::Resume
    );
    assert_eq!(*log.lock().unwrap(), [(port, dword, 0x1234_5678, 0)]);
    assert_eq!(manager.info(handle).unwrap().hits(), 1);

    // The last ports of the space do not wrap around.
    assert_eq!(
        full.on_port_io(VCPU, IoPort(0xfffe), dword, 0, HitPhase::Before)
            .unwrap(),
        TrapOutcome::Forward
    );
}

#[test]
fn unremovable_port_range_is_kept_disabled() {
    let manager = manager();

    // Allocates the port table without turning interception on.
    manager
        .set(BreakpointRequest::port_io(0x80, 1, IoAccess::ALL).with_flags(disabled()))
        .unwrap();

    manager.driver().fail_rendezvous(true);
    assert!(matches!(
        manager.set(BreakpointRequest::port_io(0x60, 4, IoAccess::ALL)),
        Err(DbgfError::Timeout)
    ));
    manager.driver().fail_rendezvous(false);

    assert!(!manager.driver().intercepting());
    assert_eq!(manager.port_io_armed_count(), 0);
    assert_eq!(
        manager
            .full()
            .on_port_io(VCPU, IoPort(0x61), IoAccess::WRITE_BYTE, 0, HitPhase::Before)
            .unwrap(),
        TrapOutcome::Forward
    );

    // The range still maps to the breakpoint, which can be enabled again.
    let SetOutcome::AlreadyExists(handle) = manager
        .set(BreakpointRequest::port_io(0x60, 4, IoAccess::ALL))
        .unwrap()
    else {
        panic!("the port range was released");
    };
    assert!(manager.info(handle).unwrap().is_enabled());
    assert!(manager.driver().intercepting());

    manager.clear(handle).unwrap();
    assert!(!manager.driver().intercepting());
}

#[test]
fn reduced_port_io_is_deferred() {
    let manager = manager();
    let (io, log) = io_recorder(Verdict::Continue);
    let owner = manager.create_owner(None, Some(io)).unwrap();

    let handle = manager
        .set(BreakpointRequest::port_io(0x3f8, 8, IoAccess::ALL).with_owner(owner))
        .unwrap()
        .handle();

    let port = IoPort(0x3fd);
    assert_eq!(
        manager
            .reduced()
            .on_port_io(VCPU, port, IoAccess::READ_BYTE, 0, HitPhase::Before)
            .unwrap(),
        TrapOutcome::DeferToFull(handle)
    );
    assert!(log.lock().unwrap().is_empty());

    assert_eq!(manager.full().handle_deferred(VCPU).unwrap(), TrapOutcome::Resume);
    assert_eq!(*log.lock().unwrap(), [(port, IoAccess::READ_BYTE, 0, 0)]);
}

#[test]
fn hardware_io_breakpoint_dispatch() {
    let manager = manager();
    let handle = manager
        .set(BreakpointRequest::register(0x3f8, HwAccess::Io, 1))
        .unwrap()
        .handle();
    assert_eq!(manager.enabled_hw_io_count(), 1);

    let full = manager.full();
    assert_eq!(
        full.on_port_io(VCPU, IoPort(0x3f8), IoAccess::WRITE_BYTE, 0x41, HitPhase::Before)
            .unwrap(),
        TrapOutcome::Halt(handle)
    );
    assert_eq!(
        full.on_port_io(VCPU, IoPort(0x3f9), IoAccess::WRITE_BYTE, 0x41, HitPhase::Before)
            .unwrap(),
        TrapOutcome::Forward
    );
}

///////////////////////////////////////////////////////////////////////////////
// Concurrent management
///////////////////////////////////////////////////////////////////////////////

#[test]
fn enable_during_clear_is_refused() {
    let manager = manager();
    let va = Va(0x41_5000);
    let handle = manager.set(BreakpointRequest::int3(va)).unwrap().handle();
    assert_eq!(manager.driver().peek(va.0), 0xcc);

    let (entered, release) = manager.driver().hold_next_rendezvous();
    std::thread::scope(|scope| {
        let clear = scope.spawn(|| manager.clear(handle));

        // Disarmed, waiting to remove the index entry.
        entered.recv().unwrap();
        assert_eq!(manager.driver().peek(va.0), FILL);

        assert!(matches!(manager.enable(handle), Err(DbgfError::InvalidHandle)));
        assert!(matches!(manager.disable(handle), Err(DbgfError::InvalidHandle)));
        assert_eq!(manager.driver().peek(va.0), FILL);

        release.send(Ok(())).unwrap();
        clear.join().unwrap().unwrap();
    });

    assert_eq!(manager.driver().peek(va.0), FILL);
    assert_eq!(manager.enabled_int3_count(), 0);
    assert!(matches!(manager.info(handle), Err(DbgfError::InvalidHandle)));
    assert_eq!(manager.int3.entry(va).unwrap(), L1Entry::Empty);
}

#[test]
fn failed_clear_can_be_enabled_again() {
    let manager = manager();
    let va = Va(0x41_6000);
    let handle = manager.set(BreakpointRequest::int3(va)).unwrap().handle();

    let (entered, release) = manager.driver().hold_next_rendezvous();
    std::thread::scope(|scope| {
        let clear = scope.spawn(|| manager.clear(handle));

        entered.recv().unwrap();
        release.send(Err(DbgfError::Timeout)).unwrap();
        assert!(matches!(clear.join().unwrap(), Err(DbgfError::Timeout)));
    });

    // The breakpoint survived disarmed.
    assert!(!manager.info(handle).unwrap().is_enabled());
    assert_eq!(manager.driver().peek(va.0), FILL);

    assert!(manager.enable(handle).unwrap());
    assert_eq!(manager.driver().peek(va.0), 0xcc);
    assert_eq!(manager.enabled_int3_count(), 1);

    manager.clear(handle).unwrap();
    assert_eq!(manager.driver().peek(va.0), FILL);
}

#[test]
fn concurrent_port_arms_agree_on_interception() {
    let manager = manager();

    // Allocates the port table without turning interception on.
    manager
        .set(BreakpointRequest::port_io(0x80, 1, IoAccess::ALL).with_flags(disabled()))
        .unwrap();

    let (entered, release) = manager.driver().hold_next_rendezvous();
    std::thread::scope(|scope| {
        let first =
            scope.spawn(|| manager.set(BreakpointRequest::port_io(0x60, 1, IoAccess::ALL)));

        // The first arm is turning interception on.
        entered.recv().unwrap();

        let second =
            scope.spawn(|| manager.set(BreakpointRequest::port_io(0x70, 1, IoAccess::ALL)));

        // Waits for the first arm instead of relying on it.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!second.is_finished());

        release.send(Err(DbgfError::Timeout)).unwrap();
        assert!(matches!(first.join().unwrap(), Err(DbgfError::Timeout)));

        let second = second.join().unwrap().unwrap().handle();
        assert!(manager.info(second).unwrap().is_enabled());
    });

    assert_eq!(manager.port_io_armed_count(), 1);
    assert!(manager.driver().intercepting());
    assert_eq!(manager.port_io.get(IoPort(0x60)), None);
}

///////////////////////////////////////////////////////////////////////////////
// Owners and bookkeeping
///////////////////////////////////////////////////////////////////////////////

#[test]
fn owner_outlives_its_breakpoints() {
    let manager = manager();
    let (exec, _) = exec_recorder(Verdict::Continue);
    let owner = manager.create_owner(Some(exec), None).unwrap();

    let handle = manager
        .set(BreakpointRequest::int3(Va(0x41_1000)).with_owner(owner))
        .unwrap()
        .handle();

    assert!(matches!(
        manager.destroy_owner(owner),
        Err(DbgfError::OwnerBusy)
    ));

    manager.clear(handle).unwrap();
    manager.destroy_owner(owner).unwrap();
    assert!(matches!(
        manager.destroy_owner(owner),
        Err(DbgfError::InvalidHandle)
    ));
    assert!(matches!(
        manager.set(BreakpointRequest::int3(Va(0x41_1000)).with_owner(owner)),
        Err(DbgfError::InvalidHandle)
    ));
}

#[test]
fn owner_callbacks_must_match_the_kind() {
    let manager = manager();
    let (exec, _) = exec_recorder(Verdict::Continue);
    let (io, _) = io_recorder(Verdict::Continue);
    let exec_owner = manager.create_owner(Some(exec), None).unwrap();
    let io_owner = manager.create_owner(None, Some(io)).unwrap();

    assert!(matches!(
        manager.set(BreakpointRequest::int3(Va(0x41_2000)).with_owner(io_owner)),
        Err(DbgfError::InvalidParameter(_))
    ));
    assert!(matches!(
        manager.set(BreakpointRequest::port_io(0x80, 1, IoAccess::ALL).with_owner(exec_owner)),
        Err(DbgfError::InvalidParameter(_))
    ));
    assert!(matches!(
        manager.create_owner(None, None),
        Err(DbgfError::InvalidParameter(_))
    ));
}

#[test]
fn mmio_is_not_supported() {
    let manager = manager();
    assert!(matches!(
        manager.set(BreakpointRequest::mmio(Pa(0xfee0_0000), 4, IoAccess::ALL)),
        Err(DbgfError::NotSupported)
    ));
    assert_eq!(count(&manager), 0);
}

#[test]
fn enumeration_visits_every_breakpoint() {
    let manager = manager();
    let mut expected = vec![
        manager
            .set(BreakpointRequest::int3(Va(0x41_3000)))
            .unwrap()
            .handle(),
        manager
            .set(BreakpointRequest::register(0x7000, HwAccess::Write, 4))
            .unwrap()
            .handle(),
        manager
            .set(BreakpointRequest::port_io(0x60, 1, IoAccess::READ))
            .unwrap()
            .handle(),
    ];
    expected.sort();

    let mut visited = Vec::new();
    manager.enumerate(|handle, info| {
        assert!(info.is_enabled());
        visited.push(handle);
        ControlFlow::Continue(())
    });
    visited.sort();
    assert_eq!(visited, expected);

    let mut visited = 0;
    manager.enumerate(|_, _| {
        visited += 1;
        ControlFlow::Break(())
    });
    assert_eq!(visited, 1);
}

#[test]
fn clear_is_exclusive() {
    let manager = manager();
    let handle = manager
        .set(BreakpointRequest::int3(Va(0x41_4000)))
        .unwrap()
        .handle();

    let results = std::thread::scope(|scope| {
        let workers = (0..4)
            .map(|_| scope.spawn(|| manager.clear(handle)))
            .collect::<Vec<_>>();

        workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|result| result.as_ref().err())
            .all(|err| matches!(err, DbgfError::InvalidHandle))
    );
    assert_eq!(count(&manager), 0);
}

#[test]
fn unknown_vcpu_is_rejected() {
    let manager = manager();
    assert!(matches!(
        manager.full().on_int3(VcpuId(2), Va(0x1000)),
        Err(DbgfError::InvalidParameter(_))
    ));
}

#[test]
fn store_is_bounded_by_its_chunks() {
    init_tracing();

    let driver = MockDriver::new(1);
    let config = DbgfConfig::default().with_max_breakpoint_chunks(1);
    let store = BreakpointStore::new(&config);
    let init = RecordInit {
        kind: BreakpointKind::Mmio {
            pa: Pa(0),
            size: 1,
            access: IoAccess::ALL,
        },
        owner: None,
        user: 0,
        hit_trigger: 0,
        hit_disable: u64::MAX,
        flags: BreakpointFlags::empty(),
    };

    let mut last = None;
    for _ in 0..DbgfConfig::BREAKPOINTS_PER_CHUNK {
        last = Some(store.allocate(&driver, &config, &init).unwrap().0);
    }

    assert!(matches!(
        store.allocate(&driver, &config, &init),
        Err(DbgfError::NoMoreSlots)
    ));
    assert_eq!(store.allocated_chunks(), 1);
    assert_eq!(driver.rendezvous_count.load(Ordering::SeqCst), 1);

    let last = last.unwrap();
    store.free(last);
    assert_eq!(store.allocate(&driver, &config, &init).unwrap().0, last);
}
