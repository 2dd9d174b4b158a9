//! Breakpoint management.
//!
//! Stores breakpoints of a virtual machine and routes guest traps to them.
//! Four kinds are supported:
//!
//! - **Software** breakpoints patch the single-byte trap instruction into
//!   guest memory. They are found by address through a two-level index: a
//!   flat table keyed by bits 16 to 31 of the address whose entries either
//!   reference the single breakpoint of their bucket directly or point to a
//!   binary search tree of all breakpoints in the bucket.
//! - **Hardware** breakpoints occupy one of the architectural debug
//!   register slots. Slot contents are global; every change is loaded into
//!   all virtual CPUs inside a rendezvous.
//! - **Port I/O** breakpoints claim a range of ports in a per-port table.
//! - **MMIO** breakpoints are recognized but cannot be set.
//!
//! Breakpoint records live in lazily allocated chunks and are addressed by
//! a [`BreakpointHandle`]. Each breakpoint may name an owner, a set of
//! callbacks created with [`BreakpointManager::create_owner`], which is
//! notified on hits. Breakpoints without an owner halt the virtual CPU.
//!
//! # Trap handling
//!
//! Traps are dispatched through a [`Dispatcher`]. The dispatcher obtained
//! from [`BreakpointManager::reduced`] runs in the reduced, privileged
//! context and only calls callbacks registered for it; other hits are
//! deferred and replayed by the dispatcher from
//! [`BreakpointManager::full`]:
//!
//! ```no_run
//! # use dbgf_bp::BreakpointManager;
//! # use dbgf_core::{DbgfDriver, DbgfError, TrapOutcome, Va, VcpuId};
//! # fn handle<Driver: DbgfDriver>(
//! #     manager: &BreakpointManager<Driver>,
//! #     vcpu: VcpuId,
//! #     pc: Va,
//! # ) -> Result<(), DbgfError> {
//! match manager.reduced().on_int3(vcpu, pc)? {
//!     TrapOutcome::Forward => { /* inject the trap into the guest */ }
//!     TrapOutcome::Resume => {}
//!     TrapOutcome::Halt(_handle) => { /* stop for the debugger */ }
//!     TrapOutcome::DeferToFull(_) => {
//!         // After switching to the full context.
//!         manager.full().handle_deferred(vcpu)?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod arm;
mod bitmap;
mod breakpoint;
mod dispatch;
mod handle;
mod hw;
mod int3;
mod manager;
mod owner;
mod port_io;
mod store;
mod vcpu;

#[cfg(test)]
mod tests;

pub use self::{
    breakpoint::{
        BreakpointFlags, BreakpointInfo, BreakpointKind, BreakpointRequest, BreakpointTarget,
        SetOutcome,
    },
    dispatch::{BreakpointOutcome, Dispatcher},
    handle::{BreakpointHandle, OwnerHandle},
    manager::BreakpointManager,
    owner::{ExecCallback, Hit, IoCallback, IoHit},
};
