pub mod common;
pub mod config;
pub mod framework;
pub mod rdma;

#[allow(unused)]
#[derive(Debug)]
pub enum RmemError {
    RmemRdmaError,
    RmemSegmentError,
    RmemConfigError,
}

pub type RmemResult<T> = Result<T, RmemError>;

// Queue pair sizing.  The work-request depth is derived from the two-sided
// staging capacity over the largest control message we ship, and doubles as
// the per-lane in-flight one-sided op ceiling.
pub const QP_BUF_CAPACITY: usize = 1 << 16;
pub const MAX_MSG_BYTES: usize = 64;
pub const MAX_WR_DEPTH: usize = QP_BUF_CAPACITY / MAX_MSG_BYTES;
pub const MAX_SEND_SGE: u32 = 32;
pub const MAX_RECV_SGE: u32 = 1;
pub const MAX_INLINE_DATA: u32 = 0;
