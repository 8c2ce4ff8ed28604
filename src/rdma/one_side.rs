use std::sync::atomic::{AtomicI32, Ordering};

use rdma_sys::*;

use super::connection::Connection;
use crate::fatal;

/// The one-sided surface of a connection: post a prepared work request (or
/// chain) and drain completions.  Both are non-blocking; completion
/// tracking is the caller's business, through `wr_id`.
pub trait OneSideComm {
    fn post_one_sided(&self, send_wr: *mut ibv_send_wr);
    fn poll_cq(&self, wc: &mut [ibv_wc]) -> i32;
}

fn send_flags(signal: bool, fence: bool) -> u32 {
    (if signal {
        ibv_send_flags::IBV_SEND_SIGNALED.0
    } else {
        0
    }) | (if fence {
        ibv_send_flags::IBV_SEND_FENCE.0
    } else {
        0
    })
}

/// Fill a work request describing a one-sided read of `len` bytes from
/// `raddr` into the local buffer at `laddr`.
///
/// `ack` is the completion slot the poll loop will decrement; it rides in
/// `wr_id`.  Unsignaled requests (mid-sequence) pass null.
pub fn read_config(
    wr: &mut ibv_send_wr,
    sge: &mut ibv_sge,
    raddr: u64,
    rkey: u32,
    laddr: u64,
    lkey: u32,
    ack: *const AtomicI32,
    len: usize,
    signal: bool,
    fence: bool,
) {
    sge.addr = laddr;
    sge.length = len as u32;
    sge.lkey = lkey;

    wr.wr_id = ack as u64;
    wr.num_sge = 1;
    wr.sg_list = sge as *mut _;
    wr.next = std::ptr::null_mut();
    wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
    wr.send_flags = send_flags(signal, fence);
    wr.wr.rdma.remote_addr = raddr;
    wr.wr.rdma.rkey = rkey;
}

/// Fill a work request describing a one-sided write of `len` bytes from the
/// local buffer at `laddr` to `raddr`.  The caller has already staged the
/// payload at `laddr`.
pub fn write_config(
    wr: &mut ibv_send_wr,
    sge: &mut ibv_sge,
    raddr: u64,
    rkey: u32,
    laddr: u64,
    lkey: u32,
    ack: *const AtomicI32,
    len: usize,
    signal: bool,
    fence: bool,
) {
    sge.addr = laddr;
    sge.length = len as u32;
    sge.lkey = lkey;

    wr.wr_id = ack as u64;
    wr.num_sge = 1;
    wr.sg_list = sge as *mut _;
    wr.next = std::ptr::null_mut();
    wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
    wr.send_flags = send_flags(signal, fence);
    wr.wr.rdma.remote_addr = raddr;
    wr.wr.rdma.rkey = rkey;
}

/// Fill a work request describing an 8-byte remote compare-and-swap.  The
/// prior value lands in the local buffer at `laddr`.
pub fn cas_config(
    wr: &mut ibv_send_wr,
    sge: &mut ibv_sge,
    raddr: u64,
    rkey: u32,
    laddr: u64,
    lkey: u32,
    expected: u64,
    swap: u64,
    ack: *const AtomicI32,
    signal: bool,
    fence: bool,
) {
    sge.addr = laddr;
    sge.length = std::mem::size_of::<u64>() as u32;
    sge.lkey = lkey;

    wr.wr_id = ack as u64;
    wr.num_sge = 1;
    wr.sg_list = sge as *mut _;
    wr.next = std::ptr::null_mut();
    wr.opcode = ibv_wr_opcode::IBV_WR_ATOMIC_CMP_AND_SWP;
    wr.send_flags = send_flags(signal, fence);
    wr.wr.atomic.remote_addr = raddr;
    wr.wr.atomic.rkey = rkey;
    wr.wr.atomic.compare_add = expected;
    wr.wr.atomic.swap = swap;
}

/// Fill a work request describing an 8-byte remote fetch-and-add.  The
/// prior value lands in the local buffer at `laddr`.
pub fn faa_config(
    wr: &mut ibv_send_wr,
    sge: &mut ibv_sge,
    raddr: u64,
    rkey: u32,
    laddr: u64,
    lkey: u32,
    add: u64,
    ack: *const AtomicI32,
    signal: bool,
    fence: bool,
) {
    sge.addr = laddr;
    sge.length = std::mem::size_of::<u64>() as u32;
    sge.lkey = lkey;

    wr.wr_id = ack as u64;
    wr.num_sge = 1;
    wr.sg_list = sge as *mut _;
    wr.next = std::ptr::null_mut();
    wr.opcode = ibv_wr_opcode::IBV_WR_ATOMIC_FETCH_AND_ADD;
    wr.send_flags = send_flags(signal, fence);
    wr.wr.atomic.remote_addr = raddr;
    wr.wr.atomic.rkey = rkey;
    wr.wr.atomic.compare_add = add;
}

/// Arm the completion slot and hand the request (or chain) to the lane.
pub fn post(conn: &Connection, wr: *mut ibv_send_wr, ack: &AtomicI32) {
    ack.store(1, Ordering::Release);
    conn.post_one_sided(wr);
}

/// One poll attempt against the lane's completion queue.  Every completion
/// drained credits the slot its `wr_id` names, so concurrent ops on the
/// same lane retire each other.  Returns true once `ack` has drained.
pub fn poll_once(conn: &Connection, ack: &AtomicI32) -> bool {
    if ack.load(Ordering::Acquire) == 0 {
        return true;
    }
    let mut wc = unsafe { std::mem::zeroed::<ibv_wc>() };
    let n = conn.poll_cq(std::slice::from_mut(&mut wc));
    if n == 0 || (n < 0 && errno::errno().0 == libc::EAGAIN) {
        return false;
    }
    if n != 1 || wc.status != ibv_wc_status::IBV_WC_SUCCESS {
        fatal!(
            "ibv_poll_cq: ret {} status {} on lane {}->{}",
            n,
            wc.status,
            conn.local_id(),
            conn.peer_id()
        );
    }
    let counter = unsafe { &*(wc.wr_id as *const AtomicI32) };
    let old = counter.fetch_sub(1, Ordering::AcqRel);
    if old < 1 {
        fatal!("completion slot underflow (old = {})", old);
    }
    ack.load(Ordering::Acquire) == 0
}

/// Spin until the op owning `ack` completes.  Fatal on any non-success
/// completion; there is no user-visible error path for one-sided ops.
pub fn poll(conn: &Connection, ack: &AtomicI32) {
    while !poll_once(conn, ack) {}
}
