use serde::{Deserialize, Serialize};

/// The execution context a trap is being handled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    /// The full user-mode context. Any owner callback may run here.
    Full,

    /// The reduced, privileged context. Only callbacks explicitly set up
    /// for it may run, and nothing may allocate or block.
    Reduced,
}

/// When an owner is notified relative to the trapping access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HitPhase {
    /// Before the instruction or access executes.
    Before,

    /// After the instruction or access executed.
    After,
}

/// The decision an owner callback returns for a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Resume the guest.
    Continue,

    /// Stop the virtual CPU and hand control to the debugger.
    Halt,

    /// Re-run the notification in the full context.
    ///
    /// Only valid from a reduced-context callback.
    DeferToFull,
}

/// The outcome of dispatching a trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrapOutcome<Handle> {
    /// The trap does not belong to any breakpoint and must be delivered to
    /// the guest (or, for port I/O, the access proceeds normally).
    Forward,

    /// A breakpoint was hit and fully handled. The guest resumes.
    Resume,

    /// A breakpoint was hit and the virtual CPU must stop for the debugger.
    Halt(Handle),

    /// A breakpoint was hit in the reduced context and the owner must be
    /// notified from the full context.
    DeferToFull(Handle),
}

bitflags::bitflags! {
    /// Port I/O access directions and widths.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct IoAccess: u8 {
        /// Byte read.
        const READ_BYTE = 1 << 0;

        /// Word read.
        const READ_WORD = 1 << 1;

        /// Dword read.
        const READ_DWORD = 1 << 2;

        /// Byte write.
        const WRITE_BYTE = 1 << 3;

        /// Word write.
        const WRITE_WORD = 1 << 4;

        /// Dword write.
        const WRITE_DWORD = 1 << 5;

        /// Reads of any width.
        const READ = Self::READ_BYTE.bits() | Self::READ_WORD.bits() | Self::READ_DWORD.bits();

        /// Writes of any width.
        const WRITE = Self::WRITE_BYTE.bits() | Self::WRITE_WORD.bits() | Self::WRITE_DWORD.bits();

        /// Any access.
        const ALL = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl IoAccess {
    /// Describes a single access of `size` bytes.
    ///
    /// Returns `None` for widths other than 1, 2 and 4.
    pub fn for_access(write: bool, size: u8) -> Option<Self> {
        Some(match (write, size) {
            (false, 1) => Self::READ_BYTE,
            (false, 2) => Self::READ_WORD,
            (false, 4) => Self::READ_DWORD,
            (true, 1) => Self::WRITE_BYTE,
            (true, 2) => Self::WRITE_WORD,
            (true, 4) => Self::WRITE_DWORD,
            _ => return None,
        })
    }

    /// Returns `true` if the access writes.
    pub fn is_write(self) -> bool {
        self.intersects(Self::WRITE)
    }

    /// Returns the widest access width in bytes, or 0 if empty.
    pub fn size(self) -> u8 {
        if self.intersects(Self::READ_DWORD | Self::WRITE_DWORD) {
            4
        }
        else if self.intersects(Self::READ_WORD | Self::WRITE_WORD) {
            2
        }
        else if self.intersects(Self::READ_BYTE | Self::WRITE_BYTE) {
            1
        }
        else {
            0
        }
    }
}

impl std::fmt::Display for IoAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut result = [b'-'; 2];

        if self.intersects(IoAccess::READ) {
            result[0] = b'r';
        }
        if self.intersects(IoAccess::WRITE) {
            result[1] = b'w';
        }

        // SAFETY: The `result` array is always valid UTF-8.
        f.write_str(unsafe { std::str::from_utf8_unchecked(&result) })
    }
}
