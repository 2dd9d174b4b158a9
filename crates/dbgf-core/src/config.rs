use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime limits of the breakpoint core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbgfConfig {
    /// Upper bound for every rendezvous.
    pub rendezvous_timeout: Duration,

    /// How many times the chunk allocators retry before giving up.
    pub allocation_retries: u32,

    /// Number of breakpoint chunks that may be allocated.
    ///
    /// Clamped to [`DbgfConfig::MAX_BREAKPOINT_CHUNKS`].
    pub max_breakpoint_chunks: usize,

    /// Number of tree node chunks that may be allocated.
    ///
    /// Clamped to [`DbgfConfig::MAX_L2_CHUNKS`].
    pub max_l2_chunks: usize,
}

impl DbgfConfig {
    /// Breakpoint records per chunk.
    pub const BREAKPOINTS_PER_CHUNK: usize = 16384;

    /// Hard limit on breakpoint chunks.
    pub const MAX_BREAKPOINT_CHUNKS: usize = 64;

    /// Tree nodes per chunk.
    pub const L2_NODES_PER_CHUNK: usize = 8192;

    /// Hard limit on tree node chunks.
    pub const MAX_L2_CHUNKS: usize = 128;

    /// Sets the rendezvous timeout.
    pub fn with_rendezvous_timeout(self, rendezvous_timeout: Duration) -> Self {
        Self {
            rendezvous_timeout,
            ..self
        }
    }

    /// Limits the number of breakpoint chunks.
    pub fn with_max_breakpoint_chunks(self, max_breakpoint_chunks: usize) -> Self {
        Self {
            max_breakpoint_chunks,
            ..self
        }
    }

    /// Limits the number of tree node chunks.
    pub fn with_max_l2_chunks(self, max_l2_chunks: usize) -> Self {
        Self {
            max_l2_chunks,
            ..self
        }
    }

    /// Returns the effective breakpoint chunk limit.
    pub fn breakpoint_chunks(&self) -> usize {
        self.max_breakpoint_chunks.min(Self::MAX_BREAKPOINT_CHUNKS)
    }

    /// Returns the effective tree node chunk limit.
    pub fn l2_chunks(&self) -> usize {
        self.max_l2_chunks.min(Self::MAX_L2_CHUNKS)
    }
}

impl Default for DbgfConfig {
    fn default() -> Self {
        Self {
            rendezvous_timeout: Duration::from_secs(10),
            allocation_retries: 16,
            max_breakpoint_chunks: Self::MAX_BREAKPOINT_CHUNKS,
            max_l2_chunks: Self::MAX_L2_CHUNKS,
        }
    }
}
