mod dr6;
mod dr7;

pub use self::{
    dr6::Dr6,
    dr7::{BreakpointCondition, BreakpointLength, Dr7},
};
