use serde::{Deserialize, Serialize};

/// A virtual CPU identifier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VcpuId(pub u16);

impl VcpuId {
    /// Returns the identifier as a table index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u16> for VcpuId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for VcpuId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> ::std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
