//! Core types of the debug facility.
//!
//! This crate holds everything the breakpoint core shares with its
//! embedders: guest address newtypes, the [`Architecture`] abstraction, the
//! [`DbgfDriver`] trait through which the core reaches the hypervisor, the
//! [`DbgfError`] type and the [`DbgfConfig`] runtime limits.

pub mod arch;
mod config;
mod core;
mod driver;
mod error;
mod event;

pub use self::{
    arch::{Architecture, HwAccess, HwBreakpoint, HwBreakpoints},
    config::DbgfConfig,
    core::{IoPort, Pa, Va, VcpuId},
    driver::{DbgfDriver, RendezvousMode, RendezvousWorker},
    error::DbgfError,
    event::{ContextKind, HitPhase, IoAccess, TrapOutcome, Verdict},
};
