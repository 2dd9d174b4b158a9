use crate::Va;

/// An error that can occur when working with the debug facility.
#[derive(thiserror::Error, Debug)]
pub enum DbgfError {
    /// An error occurred in the driver.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error + Send + Sync>),

    /// No free breakpoint, tree node, owner or hardware slot is available.
    #[error("No more slots available")]
    NoMoreSlots,

    /// The handle is stale or out of range.
    #[error("Invalid handle")]
    InvalidHandle,

    /// The owner is still referenced by at least one breakpoint.
    #[error("Owner is still in use")]
    OwnerBusy,

    /// The port range overlaps a different breakpoint.
    #[error("Range overlaps an existing breakpoint")]
    RangeOverlapping,

    /// A parameter was rejected.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Operation not supported.
    #[error("Operation not supported.")]
    NotSupported,

    /// A rendezvous did not complete in time.
    #[error("Operation timed out.")]
    Timeout,

    /// The virtual address has no physical backing.
    #[error("Translation failed for {0}")]
    Translation(Va),

    /// An index structure references a slot that cannot be valid.
    #[error("Structure corrupted: {0}")]
    Corrupted(&'static str),

    /// An owner callback returned a verdict that is not allowed in the
    /// context it was invoked from.
    #[error("Owner callback returned an unexpected verdict")]
    OwnerContract,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

impl DbgfError {
    /// Wraps a driver-specific error.
    pub fn driver(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Driver(Box::new(err))
    }

    /// Returns `true` if the error cannot be continued past.
    ///
    /// Fatal errors indicate that an invariant was violated earlier
    /// (a corrupted index) or that an owner broke the callback contract.
    /// The virtual machine must not be resumed after either.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corrupted(_) | Self::OwnerContract)
    }
}
