/// Query against the persistent-region bookkeeping this crate does not own.
///
/// A negative or unknown answer means "do not write through": the flush
/// engine skips the line rather than risk faulting on unmapped memory.
pub trait RegionQuery {
    fn is_in_open_region(&self, addr: u64, len: usize) -> bool;
}

/// Treats every address as belonging to an open region.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysOpen;

impl RegionQuery for AlwaysOpen {
    fn is_in_open_region(&self, _addr: u64, _len: usize) -> bool {
        true
    }
}
