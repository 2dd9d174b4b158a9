//! Breakpoint management core for a hypervisor debug facility.
//!
//! This crate bundles the pieces of the debug facility behind features:
//!
//! - [`dbgf_core`] types are re-exported at the crate root.
//! - `arch-amd64` exposes the AMD64 debug register encoding as
//!   [`arch::amd64`].
//! - `bp` exposes the breakpoint manager and trap dispatcher as [`bp`].
//!
//! The embedding hypervisor implements [`DbgfDriver`] and hands it to
//! [`bp::BreakpointManager`].

#![cfg_attr(docsrs, feature(doc_cfg))]

pub use dbgf_core::*;

/// Architecture implementations.
pub mod arch {
    #[cfg(feature = "arch-amd64")]
    #[cfg_attr(docsrs, doc(cfg(feature = "arch-amd64")))]
    pub use dbgf_arch_amd64 as amd64;
}

#[cfg(feature = "bp")]
#[cfg_attr(docsrs, doc(cfg(feature = "bp")))]
pub use dbgf_bp as bp;
