use super::macros::impl_address;

impl_address!(Pa(u64), 16, "A guest physical address.");
impl_address!(Va(u64), 16, "A guest virtual address.");
impl_address!(IoPort(u16), 4, "A guest I/O port.");

impl IoPort {
    /// The number of addressable I/O ports.
    pub const COUNT: usize = 0x10000;

    /// Returns the port as a table index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}
