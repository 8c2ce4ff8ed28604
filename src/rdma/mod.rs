pub mod compute_node;
pub mod connection;
pub mod mem_node;
pub mod one_side;
pub mod segment;
pub mod two_sides;

use std::fs;

use lazy_static::lazy_static;
use rdma_sys::*;

use crate::fatal;
use crate::{MAX_INLINE_DATA, MAX_RECV_SGE, MAX_SEND_SGE, MAX_WR_DEPTH};

/// One segment published by a memory node: its base address and the rkey
/// that authorizes remote access.  Shipped as-is over the bring-up send,
/// tightly packed, host byte order.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct RegionInfo {
    pub raddr: u64,
    pub rkey: u32,
}

lazy_static! {
    /// Whether the kernel has huge pages provisioned.  Checked once; segments
    /// fall back to small pages when it is false.
    pub static ref HUGE_PAGES_AVAILABLE: bool = fs::read_to_string("/proc/sys/vm/nr_hugepages")
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(|n| n > 0)
        .unwrap_or(false);
}

/// Set a file descriptor to O_NONBLOCK.
pub fn make_nonblocking(fd: i32) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) != 0 {
            fatal!("fcntl(O_NONBLOCK): {}", errno::errno());
        }
    }
}

/// Set a file descriptor to O_SYNC.
pub fn make_sync(fd: i32) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_SYNC) != 0 {
            fatal!("fcntl(O_SYNC): {}", errno::errno());
        }
    }
}

/// The queue-pair shape every lane is created with.  Completions must be
/// requested explicitly; the depth ceiling is what the per-lane in-flight
/// counters guard.
pub fn default_qp_init_attr() -> ibv_qp_init_attr {
    let mut init_attr = unsafe { std::mem::zeroed::<ibv_qp_init_attr>() };
    init_attr.cap.max_send_wr = MAX_WR_DEPTH as u32;
    init_attr.cap.max_recv_wr = MAX_WR_DEPTH as u32;
    init_attr.cap.max_send_sge = MAX_SEND_SGE;
    init_attr.cap.max_recv_sge = MAX_RECV_SGE;
    init_attr.cap.max_inline_data = MAX_INLINE_DATA;
    init_attr.sq_sig_all = 0;
    init_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
    init_attr
}
