use dbgf_core::{HwAccess, IoAccess, IoPort, Pa, Va, VcpuId};

use crate::{BreakpointHandle, OwnerHandle};

bitflags::bitflags! {
    /// Breakpoint flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BreakpointFlags: u16 {
        /// The breakpoint is armed.
        const ENABLED = 1 << 0;

        /// Notify the owner before the instruction or access executes.
        const HIT_EXEC_BEFORE = 1 << 1;

        /// Notify the owner after the instruction or access executed.
        const HIT_EXEC_AFTER = 1 << 2;
    }
}

impl Default for BreakpointFlags {
    fn default() -> Self {
        Self::ENABLED | Self::HIT_EXEC_BEFORE
    }
}

/// The kind of a breakpoint together with its kind-specific data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointKind {
    /// Hardware debug register breakpoint.
    Register {
        /// Guest address watched by the slot.
        address: u64,

        /// Access type.
        access: HwAccess,

        /// Access width in bytes.
        size: u8,

        /// Hardware slot the breakpoint is assigned to.
        slot: u8,
    },

    /// Software breakpoint implemented by patching the breakpoint
    /// instruction into guest memory.
    Int3 {
        /// Virtual address of the patched instruction.
        va: Va,

        /// Physical address the virtual address translated to when the
        /// breakpoint was set.
        pa: Pa,

        /// The guest byte replaced by the breakpoint instruction.
        original: u8,
    },

    /// Port I/O breakpoint covering `count` consecutive ports.
    PortIo {
        /// First port of the range.
        port: IoPort,

        /// Number of ports.
        count: u16,

        /// Accesses that trigger the breakpoint.
        access: IoAccess,
    },

    /// Memory-mapped I/O breakpoint. Setting one is not supported.
    Mmio {
        /// Physical address of the range.
        pa: Pa,

        /// Size of the range in bytes.
        size: u32,

        /// Accesses that trigger the breakpoint.
        access: IoAccess,
    },
}

/// A snapshot of a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointInfo {
    pub(crate) owner: Option<OwnerHandle>,
    pub(crate) kind: BreakpointKind,
    pub(crate) flags: BreakpointFlags,
    pub(crate) hits: u64,
    pub(crate) hit_trigger: u64,
    pub(crate) hit_disable: u64,
    pub(crate) user: u64,
}

impl BreakpointInfo {
    /// Returns the owner, if any.
    ///
    /// A hit on a breakpoint without an owner halts the virtual CPU.
    pub fn owner(&self) -> Option<OwnerHandle> {
        self.owner
    }

    /// Returns the kind and kind-specific data.
    pub fn kind(&self) -> BreakpointKind {
        self.kind
    }

    /// Returns the flags.
    pub fn flags(&self) -> BreakpointFlags {
        self.flags
    }

    /// Returns `true` if the breakpoint is armed.
    pub fn is_enabled(&self) -> bool {
        self.flags.contains(BreakpointFlags::ENABLED)
    }

    /// Returns the number of times the breakpoint was hit.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Returns the first hit that notifies the owner.
    pub fn hit_trigger(&self) -> u64 {
        self.hit_trigger
    }

    /// Returns the last hit that notifies the owner.
    ///
    /// [`u64::MAX`] means there is no upper bound.
    pub fn hit_disable(&self) -> u64 {
        self.hit_disable
    }

    /// Returns the user data passed to full-context callbacks.
    pub fn user(&self) -> u64 {
        self.user
    }
}

/// What a breakpoint request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointTarget {
    /// Instruction at a guest virtual address.
    Int3 {
        /// Address of the instruction.
        va: Va,
    },

    /// Hardware debug register watch.
    Register {
        /// Watched address.
        address: u64,

        /// Access type.
        access: HwAccess,

        /// Access width in bytes (1, 2, 4 or 8).
        size: u8,
    },

    /// Range of I/O ports.
    PortIo {
        /// First port.
        port: IoPort,

        /// Number of ports.
        count: u16,

        /// Accesses that trigger the breakpoint.
        access: IoAccess,
    },

    /// Range of memory-mapped I/O.
    Mmio {
        /// Physical address.
        pa: Pa,

        /// Size in bytes.
        size: u32,

        /// Accesses that trigger the breakpoint.
        access: IoAccess,
    },
}

/// A request to set a breakpoint.
///
/// Built with one of the target constructors and refined with the `with_*`
/// methods before being passed to
/// [`BreakpointManager::set`](crate::BreakpointManager::set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointRequest {
    pub(crate) target: BreakpointTarget,
    pub(crate) owner: Option<OwnerHandle>,
    pub(crate) user: u64,
    pub(crate) flags: BreakpointFlags,
    pub(crate) hit_trigger: u64,
    pub(crate) hit_disable: u64,
    pub(crate) vcpu: VcpuId,
}

impl BreakpointRequest {
    /// Creates a request for `target` with default settings.
    ///
    /// The default breakpoint has no owner, is enabled, notifies before
    /// execution and triggers on every hit.
    pub fn new(target: BreakpointTarget) -> Self {
        Self {
            target,
            owner: None,
            user: 0,
            flags: BreakpointFlags::default(),
            hit_trigger: 0,
            hit_disable: u64::MAX,
            vcpu: VcpuId(0),
        }
    }

    /// Creates a request for a software breakpoint at `va`.
    pub fn int3(va: impl Into<Va>) -> Self {
        Self::new(BreakpointTarget::Int3 { va: va.into() })
    }

    /// Creates a request for a hardware breakpoint.
    pub fn register(address: u64, access: HwAccess, size: u8) -> Self {
        Self::new(BreakpointTarget::Register {
            address,
            access,
            size,
        })
    }

    /// Creates a request for a port I/O breakpoint covering `count` ports.
    pub fn port_io(port: impl Into<IoPort>, count: u16, access: IoAccess) -> Self {
        Self::new(BreakpointTarget::PortIo {
            port: port.into(),
            count,
            access,
        })
    }

    /// Creates a request for a memory-mapped I/O breakpoint.
    pub fn mmio(pa: impl Into<Pa>, size: u32, access: IoAccess) -> Self {
        Self::new(BreakpointTarget::Mmio {
            pa: pa.into(),
            size,
            access,
        })
    }

    /// Sets the owner notified on hits.
    pub fn with_owner(self, owner: OwnerHandle) -> Self {
        Self {
            owner: Some(owner),
            ..self
        }
    }

    /// Sets the user data passed to full-context callbacks.
    pub fn with_user(self, user: u64) -> Self {
        Self { user, ..self }
    }

    /// Replaces the flags.
    pub fn with_flags(self, flags: BreakpointFlags) -> Self {
        Self { flags, ..self }
    }

    /// Sets the first hit that notifies the owner.
    pub fn hit_trigger(self, hit_trigger: u64) -> Self {
        Self {
            hit_trigger,
            ..self
        }
    }

    /// Sets the last hit that notifies the owner.
    pub fn hit_disable(self, hit_disable: u64) -> Self {
        Self {
            hit_disable,
            ..self
        }
    }

    /// Sets the virtual CPU whose address space is used to translate the
    /// address of a software breakpoint.
    pub fn on_vcpu(self, vcpu: VcpuId) -> Self {
        Self { vcpu, ..self }
    }

    /// Returns the target.
    pub fn target(&self) -> BreakpointTarget {
        self.target
    }
}

/// The result of a successful [`BreakpointManager::set`].
///
/// [`BreakpointManager::set`]: crate::BreakpointManager::set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetOutcome {
    /// A new breakpoint was created.
    Created(BreakpointHandle),

    /// A breakpoint with the same target already exists.
    AlreadyExists(BreakpointHandle),
}

impl SetOutcome {
    /// Returns the handle of the new or existing breakpoint.
    pub fn handle(self) -> BreakpointHandle {
        match self {
            Self::Created(handle) | Self::AlreadyExists(handle) => handle,
        }
    }
}
