mod address;
pub(crate) mod macros;
mod vcpu_id;

pub use self::{
    address::{IoPort, Pa, Va},
    vcpu_id::VcpuId,
};
