/// `DR6` debug status register.
///
/// Reports debug conditions that were sampled at the time the last debug
/// exception was generated. Updates to this register only occur when an
/// exception is generated.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Dr6(pub u64);

impl Dr6 {
    /// B0 through B3 (breakpoint condition detected) flags (bits 0 through 3).
    ///
    /// These flags may be set even if the breakpoint is not enabled in
    /// `DR7`, so a handler should only consider the bits of enabled
    /// breakpoints.
    pub fn breakpoint_condition(self) -> u8 {
        (self.0 & 0b1111) as _
    }

    /// Returns `true` if breakpoint `index` was detected.
    pub fn triggered(self, index: u8) -> bool {
        index < 4 && self.breakpoint_condition() & (1 << index) != 0
    }
}

impl std::fmt::Debug for Dr6 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Dr6")
            .field("breakpoint_condition", &self.breakpoint_condition())
            .finish()
    }
}

impl From<u64> for Dr6 {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Dr6> for u64 {
    fn from(value: Dr6) -> Self {
        value.0
    }
}
