/// `DR7` debug control register.
///
/// Enables or disables breakpoints and sets breakpoint conditions.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Dr7(pub u64);

/// Breakpoint condition (R/Wn field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointCondition {
    /// Break on instruction execution only.
    Execution,
    /// Break on data writes only.
    Write,
    /// Break on I/O reads or writes.
    Io,
    /// Break on data reads or writes but not instruction fetches.
    ReadWrite,
}

/// Breakpoint length (LENn field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointLength {
    /// 1-byte length.
    Byte,
    /// 2-byte length.
    Word,
    /// 8-byte length.
    Quadword,
    /// 4-byte length.
    Dword,
}

impl BreakpointCondition {
    fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0b00 => Self::Execution,
            0b01 => Self::Write,
            0b10 => Self::Io,
            _ => Self::ReadWrite,
        }
    }

    fn bits(self) -> u64 {
        match self {
            Self::Execution => 0b00,
            Self::Write => 0b01,
            Self::Io => 0b10,
            Self::ReadWrite => 0b11,
        }
    }
}

impl BreakpointLength {
    /// Returns the length for an access width in bytes.
    pub fn from_size(size: u8) -> Option<Self> {
        match size {
            1 => Some(Self::Byte),
            2 => Some(Self::Word),
            4 => Some(Self::Dword),
            8 => Some(Self::Quadword),
            _ => None,
        }
    }

    fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0b00 => Self::Byte,
            0b01 => Self::Word,
            0b10 => Self::Quadword,
            _ => Self::Dword,
        }
    }

    fn bits(self) -> u64 {
        match self {
            Self::Byte => 0b00,
            Self::Word => 0b01,
            Self::Quadword => 0b10,
            Self::Dword => 0b11,
        }
    }
}

impl Dr7 {
    /// Bit 10 is reserved and always reads as one.
    pub const RESERVED_ONE: u64 = 1 << 10;

    /// GE (global exact breakpoint enable) flag (bit 9).
    pub const GLOBAL_EXACT: u64 = 1 << 9;

    /// Returns the value with no breakpoint enabled.
    pub const fn cleared() -> Self {
        Self(Self::RESERVED_ONE)
    }

    /// L0 through L3 (local breakpoint enable) flags (bits 0, 2, 4, and 6).
    ///
    /// Enables (when set) the breakpoint condition for the associated
    /// breakpoint for the current task. The processor automatically clears
    /// these flags on every task switch.
    pub fn local_breakpoint(self, index: u8) -> bool {
        index < 4 && (self.0 >> (index * 2)) & 1 != 0
    }

    /// G0 through G3 (global breakpoint enable) flags (bits 1, 3, 5, and 7).
    ///
    /// Enables (when set) the breakpoint condition for the associated
    /// breakpoint for all tasks. The processor does not clear these flags on
    /// a task switch.
    pub fn global_breakpoint(self, index: u8) -> bool {
        index < 4 && (self.0 >> (index * 2 + 1)) & 1 != 0
    }

    /// GD (general detect enable) flag (bit 13).
    pub fn general_detect(self) -> bool {
        (self.0 >> 13) & 1 != 0
    }

    /// Condition for a breakpoint (R/W0 through R/W3).
    pub fn condition(self, index: u8) -> BreakpointCondition {
        match index {
            0..4 => BreakpointCondition::from_bits(self.0 >> (16 + index * 4)),
            _ => BreakpointCondition::Execution,
        }
    }

    /// Length for a breakpoint (LEN0 through LEN3).
    pub fn length(self, index: u8) -> BreakpointLength {
        match index {
            0..4 => BreakpointLength::from_bits(self.0 >> (18 + index * 4)),
            _ => BreakpointLength::Byte,
        }
    }

    /// Returns the value with breakpoint `index` globally enabled for the
    /// given condition and length.
    ///
    /// Indices above 3 leave the value unchanged.
    pub fn with_breakpoint(
        self,
        index: u8,
        condition: BreakpointCondition,
        length: BreakpointLength,
    ) -> Self {
        if index >= 4 {
            return self;
        }

        let field_shift = 16 + index * 4;
        let mut value = self.0 & !(0b1111 << field_shift);
        value |= (condition.bits() | (length.bits() << 2)) << field_shift;
        value |= 1 << (index * 2 + 1);
        Self(value | Self::GLOBAL_EXACT)
    }

    /// Returns `true` if any of the four breakpoints is enabled.
    pub fn any_enabled(self) -> bool {
        self.0 & 0xff != 0
    }
}

impl std::fmt::Debug for Dr7 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut s = f.debug_struct("Dr7");
        for index in 0..4u8 {
            if self.local_breakpoint(index) || self.global_breakpoint(index) {
                s.field("index", &index)
                    .field("condition", &self.condition(index))
                    .field("length", &self.length(index));
            }
        }
        s.field("general_detect", &self.general_detect()).finish()
    }
}

impl From<u64> for Dr7 {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Dr7> for u64 {
    fn from(value: Dr7) -> Self {
        value.0
    }
}
