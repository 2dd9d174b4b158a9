use dbgf_core::DbgfConfig;

/// Opaque reference to a breakpoint.
///
/// The upper 16 bits select the chunk, the lower 16 bits the record within
/// it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointHandle(u32);

impl BreakpointHandle {
    /// The handle that refers to nothing.
    pub const NIL: Self = Self(u32::MAX);

    const CHUNK_SHIFT: u32 = 16;
    const INDEX_MASK: u32 = (1 << Self::CHUNK_SHIFT) - 1;

    pub(crate) fn new(chunk: usize, index: usize) -> Self {
        debug_assert!(chunk < DbgfConfig::MAX_BREAKPOINT_CHUNKS);
        debug_assert!(index < DbgfConfig::BREAKPOINTS_PER_CHUNK);
        Self(((chunk as u32) << Self::CHUNK_SHIFT) | index as u32)
    }

    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            u32::MAX => None,
            raw => Some(Self(raw)),
        }
    }

    /// Returns the raw value.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Returns `true` for [`BreakpointHandle::NIL`].
    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }

    pub(crate) fn chunk(self) -> usize {
        (self.0 >> Self::CHUNK_SHIFT) as usize
    }

    pub(crate) fn index(self) -> usize {
        (self.0 & Self::INDEX_MASK) as usize
    }
}

impl std::fmt::Debug for BreakpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "BreakpointHandle({self})")
    }
}

impl std::fmt::Display for BreakpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_nil() {
            return f.write_str("nil");
        }

        write!(f, "{}:{}", self.chunk(), self.index())
    }
}

/// Opaque reference to a breakpoint owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerHandle(u32);

impl OwnerHandle {
    /// The handle that refers to nothing.
    pub const NIL: Self = Self(u32::MAX);

    pub(crate) fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            u32::MAX => None,
            raw => Some(Self(raw)),
        }
    }

    /// Returns the raw value.
    pub fn raw(self) -> u32 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for OwnerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
