use super::segment::{MemoryRegion, Segment};
use crate::RmemResult;

/// The limited two-sided surface of a connection.
///
/// Two-sided traffic exists only to ship registration records during
/// bring-up; nothing on the data path ever sends or receives.
pub trait TwoSidesComm {
    /// Synchronous send of a contiguous array, staged through `seg`.
    /// Fail-fast on any transport error.
    fn send_vec<T: Copy>(&self, msg: &[T], seg: &Segment, mr: &MemoryRegion) -> RmemResult<()>;

    /// Blocking receive into the pre-posted buffer in `seg`, decoded as a
    /// vector of `T` sized by the completed byte length.
    fn recv_vec<T: Copy>(&self, seg: &Segment) -> RmemResult<Vec<T>>;
}
