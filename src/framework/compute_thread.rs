use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use log::info;
use rdma_sys::*;

use super::alloc::{BumpAllocator, HEADER_SIZE};
use super::policy::{LanePolicy, QpSched, SegPolicy};
use super::ring::{RingBuf, RingCounter};
use crate::common::pointer::RemotePtr;
use crate::config::Config;
use crate::fatal;
use crate::rdma::compute_node::ComputeNode;
use crate::rdma::one_side;
use crate::rdma::segment::{
    ALLOCATED_OFFSET, BARRIER_OFFSET, CONTROL_FLAG_OFFSET, ROOT_OFFSET,
};
use crate::MAX_WR_DEPTH;

#[derive(Default, Clone, Copy)]
pub struct OpMetric {
    pub ops: u64,
    pub bytes: u64,
}

/// Per-thread op counts.  Coarse on purpose; nothing here is ever written
/// to a file by the runtime.
#[derive(Default, Clone, Copy)]
pub struct Metrics {
    pub read: OpMetric,
    pub write: OpMetric,
    pub cas: u64,
    pub faa: u64,
}

/// A sequenced batch in flight: the lane it is pinned to, the chained work
/// requests (boxed so the chain pointers stay put), and the staging slices
/// each one borrowed.
struct SeqEntry {
    wr: Box<ibv_send_wr>,
    sge: Box<ibv_sge>,
    staged: Option<*mut u8>,
    is_write: bool,
}

struct SeqBatch {
    lane_idx: u32,
    posted: bool,
    entries: Vec<SeqEntry>,
    op_counter: Option<usize>,
}

/// A one-sided op that has been posted but whose slots are still held.
pub(crate) struct Pending {
    pub(crate) lane: u32,
    pub(crate) slot: usize,
}

/// The per-thread runtime for one-sided RDMA.
///
/// Each compute thread owns its completion-slot ring, its staging and
/// cached buffer rings (the two halves of its slice of the node's big local
/// segment), its allocator, and its policy state.  Lanes are the only
/// shared resource, and they are shared without locks: the transport takes
/// concurrent posts, and completions find their issuer through `wr_id`.
pub struct ComputeThread {
    pub(crate) node_id: u16,
    pub(crate) id: u64,
    pub(crate) cn: Arc<ComputeNode>,
    pub(crate) cfg: Arc<Config>,
    pub(crate) op_counters: Box<[AtomicI32]>,
    pub(crate) op_ring: RingCounter,
    seq_ring: RingCounter,
    seq_batches: HashMap<usize, SeqBatch>,
    /// The unposted batch new sequenced ops append to, if any.  Sequence
    /// slots are per top-level coroutine and only one is supported.
    open_seq: Option<usize>,
    pub(crate) staging: RingBuf,
    cached: RingBuf,
    sched: QpSched,
    alloc: BumpAllocator,
    pub metrics: Metrics,
}

unsafe impl Send for ComputeThread {}

impl ComputeThread {
    pub fn new(cn: &Arc<ComputeNode>, cfg: &Arc<Config>) -> Self {
        let (id, slice) = cn.register_thread();
        let bufsz = cfg.thread_buf_bytes() as usize;
        let half = bufsz >> 1;
        let staging = unsafe { RingBuf::new(slice, half) };
        let cached = unsafe { RingBuf::new(slice.add(half), half) };

        let slots = cfg.cn_ops_per_thread as usize;
        let op_counters: Box<[AtomicI32]> =
            (0..slots).map(|_| AtomicI32::new(0)).collect();

        let mut sched = QpSched::new(cfg);
        sched.set_policy(LanePolicy::from_str(&cfg.qp_sched_pol), id);
        let mut alloc = BumpAllocator::new(cfg);
        alloc.policy.set_policy(SegPolicy::from_str(&cfg.alloc_pol), cfg, id);

        info!("created thread #{}", id);
        Self {
            node_id: cfg.node_id,
            id,
            cn: cn.clone(),
            cfg: cfg.clone(),
            op_counters,
            op_ring: RingCounter::new(slots),
            seq_ring: RingCounter::new(slots),
            seq_batches: HashMap::new(),
            open_seq: None,
            staging,
            cached,
            sched,
            alloc,
            metrics: Metrics::default(),
        }
    }

    #[inline]
    pub fn get_tid(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn is_local<T>(&self, ptr: RemotePtr<T>) -> bool {
        ptr.id() == self.node_id
    }

    /// The allocation size (header included) a request for `n` elements of
    /// `T` will actually reserve.
    pub fn compute_size<T>(&self, n: usize) -> u64 {
        self.alloc.compute_size::<T>(n)
    }

    // ---- slot plumbing ----------------------------------------------------

    fn acquire_op_slot(&mut self) -> usize {
        match self.op_ring.acquire() {
            Some(idx) => idx,
            None => fatal!(
                "no completion slot available; cn_ops_per_thread = {} exceeded",
                self.cfg.cn_ops_per_thread
            ),
        }
    }

    fn acquire_staging(&mut self, size: usize, align: usize) -> *mut u8 {
        match self.staging.acquire(size, align) {
            Some(buf) => buf,
            None => fatal!(
                "staging ring exhausted for a {}-byte request; increase cn_thread_bufsz",
                size
            ),
        }
    }

    fn lane_enter(&self, lane: u32) {
        let prior = self.cn.lane_op_counters[lane as usize].fetch_add(1, Ordering::AcqRel);
        if prior + 1 >= MAX_WR_DEPTH {
            fatal!(
                "lane {} has {} in-flight ops, at the queue-pair depth {}",
                lane,
                prior + 1,
                MAX_WR_DEPTH
            );
        }
    }

    fn lane_exit(&self, lane: u32) {
        self.cn.lane_op_counters[lane as usize].fetch_sub(1, Ordering::AcqRel);
    }

    // ---- issue / wait / retire --------------------------------------------

    pub(crate) fn issue_read(&mut self, ptr_raw: u64, laddr: u64, len: usize, fence: bool) -> Pending {
        let cn = self.cn.clone();
        let lane = self.sched.lane_idx(RemotePtr::<u8>::from_raw(ptr_raw).id());
        self.lane_enter(lane);
        let ci = cn.get_conn(ptr_raw, lane);
        let rkey = cn.get_rkey(ptr_raw);
        let slot = self.acquire_op_slot();
        let ack = &self.op_counters[slot] as *const AtomicI32;

        let mut wr = unsafe { std::mem::zeroed::<ibv_send_wr>() };
        let mut sge = unsafe { std::mem::zeroed::<ibv_sge>() };
        one_side::read_config(
            &mut wr,
            &mut sge,
            RemotePtr::<u8>::from_raw(ptr_raw).addr(),
            rkey,
            laddr,
            ci.lkey,
            ack,
            len,
            true,
            fence,
        );
        one_side::post(&ci.conn, &mut wr, unsafe { &*ack });
        Pending { lane, slot }
    }

    pub(crate) fn issue_write(&mut self, ptr_raw: u64, laddr: u64, len: usize, fence: bool) -> Pending {
        let cn = self.cn.clone();
        let lane = self.sched.lane_idx(RemotePtr::<u8>::from_raw(ptr_raw).id());
        self.lane_enter(lane);
        let ci = cn.get_conn(ptr_raw, lane);
        let rkey = cn.get_rkey(ptr_raw);
        let slot = self.acquire_op_slot();
        let ack = &self.op_counters[slot] as *const AtomicI32;

        let mut wr = unsafe { std::mem::zeroed::<ibv_send_wr>() };
        let mut sge = unsafe { std::mem::zeroed::<ibv_sge>() };
        one_side::write_config(
            &mut wr,
            &mut sge,
            RemotePtr::<u8>::from_raw(ptr_raw).addr(),
            rkey,
            laddr,
            ci.lkey,
            ack,
            len,
            true,
            fence,
        );
        one_side::post(&ci.conn, &mut wr, unsafe { &*ack });
        Pending { lane, slot }
    }

    pub(crate) fn issue_cas(
        &mut self,
        ptr_raw: u64,
        laddr: u64,
        expected: u64,
        swap: u64,
        fence: bool,
    ) -> Pending {
        let cn = self.cn.clone();
        let lane = self.sched.lane_idx(RemotePtr::<u8>::from_raw(ptr_raw).id());
        self.lane_enter(lane);
        let ci = cn.get_conn(ptr_raw, lane);
        let rkey = cn.get_rkey(ptr_raw);
        let slot = self.acquire_op_slot();
        let ack = &self.op_counters[slot] as *const AtomicI32;

        let mut wr = unsafe { std::mem::zeroed::<ibv_send_wr>() };
        let mut sge = unsafe { std::mem::zeroed::<ibv_sge>() };
        one_side::cas_config(
            &mut wr,
            &mut sge,
            RemotePtr::<u8>::from_raw(ptr_raw).addr(),
            rkey,
            laddr,
            ci.lkey,
            expected,
            swap,
            ack,
            true,
            fence,
        );
        one_side::post(&ci.conn, &mut wr, unsafe { &*ack });
        Pending { lane, slot }
    }

    pub(crate) fn issue_faa(&mut self, ptr_raw: u64, laddr: u64, add: u64, fence: bool) -> Pending {
        let cn = self.cn.clone();
        let lane = self.sched.lane_idx(RemotePtr::<u8>::from_raw(ptr_raw).id());
        self.lane_enter(lane);
        let ci = cn.get_conn(ptr_raw, lane);
        let rkey = cn.get_rkey(ptr_raw);
        let slot = self.acquire_op_slot();
        let ack = &self.op_counters[slot] as *const AtomicI32;

        let mut wr = unsafe { std::mem::zeroed::<ibv_send_wr>() };
        let mut sge = unsafe { std::mem::zeroed::<ibv_sge>() };
        one_side::faa_config(
            &mut wr,
            &mut sge,
            RemotePtr::<u8>::from_raw(ptr_raw).addr(),
            rkey,
            laddr,
            ci.lkey,
            add,
            ack,
            true,
            fence,
        );
        one_side::post(&ci.conn, &mut wr, unsafe { &*ack });
        Pending { lane, slot }
    }

    fn wait_op(&self, ptr_raw: u64, p: &Pending) {
        let ci = self.cn.get_conn(ptr_raw, p.lane);
        one_side::poll(&ci.conn, &self.op_counters[p.slot]);
    }

    /// One poll attempt for a pending op; used by the async variants.
    pub(crate) fn op_done(&self, ptr_raw: u64, p: &Pending) -> bool {
        let ci = self.cn.get_conn(ptr_raw, p.lane);
        one_side::poll_once(&ci.conn, &self.op_counters[p.slot])
    }

    pub(crate) fn retire(&mut self, p: Pending) {
        self.op_ring.release(p.slot);
        self.lane_exit(p.lane);
    }

    // ---- synchronous one-sided ops ----------------------------------------

    /// Read a fixed-size object from the remote heap.
    pub fn read<T: Copy>(&mut self, ptr: RemotePtr<T>) -> T {
        self.read_opts(ptr, true, true)
    }

    pub fn read_opts<T: Copy>(&mut self, ptr: RemotePtr<T>, fence: bool, local_copy: bool) -> T {
        let size = std::mem::size_of::<T>();
        if local_copy && self.is_local(ptr) {
            let val = unsafe { std::ptr::read_volatile(ptr.as_local() as *const T) };
            self.metrics.read.ops += 1;
            self.metrics.read.bytes += size as u64;
            return val;
        }
        let staging = self.acquire_staging(size, std::mem::align_of::<T>());
        let p = self.issue_read(ptr.raw(), staging as u64, size, fence);
        self.wait_op(ptr.raw(), &p);
        let val = unsafe { std::ptr::read(staging as *const T) };
        self.staging.release(staging);
        self.retire(p);
        self.metrics.read.ops += 1;
        self.metrics.read.bytes += size as u64;
        val
    }

    /// Zero-copy read: `len` bytes land directly in `dst`, which must point
    /// into this thread's cached slice (or other lane-registered memory).
    pub fn read_into<T: Copy>(&mut self, ptr: RemotePtr<T>, dst: *mut T, len: usize, fence: bool) {
        let p = self.issue_read(ptr.raw(), dst as u64, len, fence);
        self.wait_op(ptr.raw(), &p);
        self.retire(p);
        self.metrics.read.ops += 1;
        self.metrics.read.bytes += len as u64;
    }

    /// Write a fixed-size object to the remote heap.
    pub fn write<T: Copy>(&mut self, ptr: RemotePtr<T>, val: &T) {
        self.write_opts(ptr, val, true, true)
    }

    pub fn write_opts<T: Copy>(
        &mut self,
        ptr: RemotePtr<T>,
        val: &T,
        fence: bool,
        local_copy: bool,
    ) {
        let size = std::mem::size_of::<T>();
        if local_copy && self.is_local(ptr) {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    val as *const T as *const u8,
                    ptr.as_local() as *mut u8,
                    size,
                );
            }
            flush_line(ptr.as_local() as *const u8);
            if fence {
                store_fence();
            }
            self.metrics.write.ops += 1;
            self.metrics.write.bytes += size as u64;
            return;
        }
        let staging = self.acquire_staging(size, std::mem::align_of::<T>());
        unsafe {
            // Zero first so struct padding never leaks stale staging bytes.
            std::ptr::write_bytes(staging, 0, size);
            std::ptr::copy_nonoverlapping(val as *const T as *const u8, staging, size);
        }
        let p = self.issue_write(ptr.raw(), staging as u64, size, fence);
        self.wait_op(ptr.raw(), &p);
        self.staging.release(staging);
        self.retire(p);
        self.metrics.write.ops += 1;
        self.metrics.write.bytes += size as u64;
    }

    /// Zero-copy write: `len` bytes are taken directly from `src`.
    pub fn write_from<T: Copy>(
        &mut self,
        ptr: RemotePtr<T>,
        src: *const T,
        len: usize,
        fence: bool,
        local_copy: bool,
    ) {
        if local_copy && self.is_local(ptr) {
            unsafe {
                std::ptr::copy_nonoverlapping(src as *const u8, ptr.as_local() as *mut u8, len);
            }
            flush_line(ptr.as_local() as *const u8);
            if fence {
                store_fence();
            }
            self.metrics.write.ops += 1;
            self.metrics.write.bytes += len as u64;
            return;
        }
        let p = self.issue_write(ptr.raw(), src as u64, len, fence);
        self.wait_op(ptr.raw(), &p);
        self.retire(p);
        self.metrics.write.ops += 1;
        self.metrics.write.bytes += len as u64;
    }

    /// Remote compare-and-swap.  Returns the prior value.  Never takes the
    /// local shortcut: its atomicity must match remote issuers'.
    pub fn compare_and_swap<T: Copy>(&mut self, ptr: RemotePtr<T>, expected: T, swap: T) -> T {
        self.cas_opts(ptr, expected, swap, true)
    }

    pub fn cas_opts<T: Copy>(
        &mut self,
        ptr: RemotePtr<T>,
        expected: T,
        swap: T,
        fence: bool,
    ) -> T {
        if std::mem::size_of::<T>() > 8 {
            fatal!("compare_and_swap requires size_of::<T>() <= 8");
        }
        let staging = self.acquire_staging(8, 8);
        let p = self.issue_cas(ptr.raw(), staging as u64, to_u64(expected), to_u64(swap), fence);
        self.wait_op(ptr.raw(), &p);
        let prev = unsafe { std::ptr::read(staging as *const u64) };
        self.staging.release(staging);
        self.retire(p);
        self.metrics.cas += 1;
        from_u64(prev)
    }

    /// Remote fetch-and-add.  Returns the prior value.  Never takes the
    /// local shortcut.
    pub fn fetch_and_add<T: Copy>(&mut self, ptr: RemotePtr<T>, add: u64) -> T {
        self.faa_opts(ptr, add, true)
    }

    pub fn faa_opts<T: Copy>(&mut self, ptr: RemotePtr<T>, add: u64, fence: bool) -> T {
        if std::mem::size_of::<T>() > 8 {
            fatal!("fetch_and_add requires size_of::<T>() <= 8");
        }
        let staging = self.acquire_staging(8, 8);
        let p = self.issue_faa(ptr.raw(), staging as u64, add, fence);
        self.wait_op(ptr.raw(), &p);
        let prev = unsafe { std::ptr::read(staging as *const u64) };
        self.staging.release(staging);
        self.retire(p);
        self.metrics.faa += 1;
        from_u64(prev)
    }

    // ---- sequenced ops ----------------------------------------------------

    /// Append a read to the open sequence batch.  With `signal` the batch
    /// is chained, posted, and drained; the returned vector holds every
    /// staged non-write value in issue order.
    ///
    /// All pointers in one batch must live on the same memory segment.
    pub fn seq_read<T: Copy>(
        &mut self,
        ptr: RemotePtr<T>,
        signal: bool,
        fence: bool,
    ) -> Option<Vec<T>> {
        let size = std::mem::size_of::<T>();
        let staging = self.acquire_staging(size, std::mem::align_of::<T>());
        match self.seq_append(
            ptr.raw(),
            false,
            staging as u64,
            size,
            Some(staging),
            signal,
            fence,
        ) {
            None => None,
            Some((idx, slot)) => {
                let lane = self.seq_batches[&idx].lane_idx;
                self.wait_slot(ptr.raw(), lane, slot);
                Some(self.finish_seq::<T>(idx))
            }
        }
    }

    /// Zero-copy sequenced read into `dst`.  Values read this way are not
    /// part of the returned vector.
    pub fn seq_read_into<T: Copy>(
        &mut self,
        ptr: RemotePtr<T>,
        dst: *mut T,
        len: usize,
        signal: bool,
        fence: bool,
    ) -> Option<Vec<T>> {
        match self.seq_append(ptr.raw(), false, dst as u64, len, None, signal, fence) {
            None => None,
            Some((idx, slot)) => {
                let lane = self.seq_batches[&idx].lane_idx;
                self.wait_slot(ptr.raw(), lane, slot);
                Some(self.finish_seq::<T>(idx))
            }
        }
    }

    /// Append a write to the open sequence batch.  Local pointers degrade
    /// to a flushed memcpy without touching the batch.
    pub fn seq_write<T: Copy>(
        &mut self,
        ptr: RemotePtr<T>,
        val: &T,
        signal: bool,
        fence: bool,
    ) -> Option<Vec<T>> {
        let size = std::mem::size_of::<T>();
        if self.is_local(ptr) {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    val as *const T as *const u8,
                    ptr.as_local() as *mut u8,
                    size,
                );
            }
            flush_line(ptr.as_local() as *const u8);
            if fence {
                store_fence();
            }
            return None;
        }
        let staging = self.acquire_staging(size, std::mem::align_of::<T>());
        unsafe {
            std::ptr::write_bytes(staging, 0, size);
            std::ptr::copy_nonoverlapping(val as *const T as *const u8, staging, size);
        }
        match self.seq_append(
            ptr.raw(),
            true,
            staging as u64,
            size,
            Some(staging),
            signal,
            fence,
        ) {
            None => None,
            Some((idx, slot)) => {
                let lane = self.seq_batches[&idx].lane_idx;
                self.wait_slot(ptr.raw(), lane, slot);
                Some(self.finish_seq::<T>(idx))
            }
        }
    }

    /// Zero-copy sequenced write from `src`.
    pub fn seq_write_from<T: Copy>(
        &mut self,
        ptr: RemotePtr<T>,
        src: *const T,
        len: usize,
        signal: bool,
        fence: bool,
    ) -> Option<Vec<T>> {
        if self.is_local(ptr) {
            unsafe {
                std::ptr::copy_nonoverlapping(src as *const u8, ptr.as_local() as *mut u8, len);
            }
            flush_line(ptr.as_local() as *const u8);
            if fence {
                store_fence();
            }
            return None;
        }
        match self.seq_append(ptr.raw(), true, src as u64, len, None, signal, fence) {
            None => None,
            Some((idx, slot)) => {
                let lane = self.seq_batches[&idx].lane_idx;
                self.wait_slot(ptr.raw(), lane, slot);
                Some(self.finish_seq::<T>(idx))
            }
        }
    }

    /// The open, unposted batch, or a fresh sequence slot with a lane
    /// pinned for the whole batch.
    fn find_seq_slot(&mut self, ptr_raw: u64) -> usize {
        if let Some(idx) = self.open_seq {
            let batch = &self.seq_batches[&idx];
            if !batch.posted {
                if batch.entries.len() >= self.cfg.cn_wrs_per_seq as usize {
                    fatal!(
                        "sequence batch would exceed cn_wrs_per_seq = {}",
                        self.cfg.cn_wrs_per_seq
                    );
                }
                return idx;
            }
        }
        let idx = match self.seq_ring.acquire() {
            Some(idx) => idx,
            None => fatal!(
                "no sequence slot available; cn_ops_per_thread = {} exceeded",
                self.cfg.cn_ops_per_thread
            ),
        };
        let lane = self.sched.lane_idx(RemotePtr::<u8>::from_raw(ptr_raw).id());
        self.lane_enter(lane);
        self.seq_batches.insert(
            idx,
            SeqBatch {
                lane_idx: lane,
                posted: false,
                entries: Vec::new(),
                op_counter: None,
            },
        );
        self.open_seq = Some(idx);
        idx
    }

    /// Append one request; on `signal`, link the chain, post its head, and
    /// report `(batch, completion slot)` for the caller to drain.
    pub(crate) fn seq_append(
        &mut self,
        ptr_raw: u64,
        is_write: bool,
        laddr: u64,
        len: usize,
        staged: Option<*mut u8>,
        signal: bool,
        fence: bool,
    ) -> Option<(usize, usize)> {
        let cn = self.cn.clone();
        let idx = self.find_seq_slot(ptr_raw);
        let lane = self.seq_batches[&idx].lane_idx;
        let ci = cn.get_conn(ptr_raw, lane);
        let rkey = cn.get_rkey(ptr_raw);
        let raddr = RemotePtr::<u8>::from_raw(ptr_raw).addr();

        let mut wr = Box::new(unsafe { std::mem::zeroed::<ibv_send_wr>() });
        let mut sge = Box::new(unsafe { std::mem::zeroed::<ibv_sge>() });

        if !signal {
            if is_write {
                one_side::write_config(
                    &mut wr, &mut sge, raddr, rkey, laddr, ci.lkey,
                    std::ptr::null(), len, false, fence,
                );
            } else {
                one_side::read_config(
                    &mut wr, &mut sge, raddr, rkey, laddr, ci.lkey,
                    std::ptr::null(), len, false, fence,
                );
            }
            self.seq_batches.get_mut(&idx).unwrap().entries.push(SeqEntry {
                wr,
                sge,
                staged,
                is_write,
            });
            return None;
        }

        let slot = self.acquire_op_slot();
        let ack = &self.op_counters[slot] as *const AtomicI32;
        if is_write {
            one_side::write_config(
                &mut wr, &mut sge, raddr, rkey, laddr, ci.lkey, ack, len, true, fence,
            );
        } else {
            one_side::read_config(
                &mut wr, &mut sge, raddr, rkey, laddr, ci.lkey, ack, len, true, fence,
            );
        }

        let batch = self.seq_batches.get_mut(&idx).unwrap();
        batch.entries.push(SeqEntry {
            wr,
            sge,
            staged,
            is_write,
        });
        // Chain every request; only the terminator is signaled, so the
        // transport walks the list and one completion covers the batch.
        for i in 0..batch.entries.len() - 1 {
            let next = batch.entries[i + 1].wr.as_mut() as *mut ibv_send_wr;
            batch.entries[i].wr.next = next;
        }
        batch.op_counter = Some(slot);
        let head = batch.entries[0].wr.as_mut() as *mut ibv_send_wr;
        batch.posted = true;
        one_side::post(&ci.conn, head, unsafe { &*ack });
        self.open_seq = None;
        Some((idx, slot))
    }

    pub(crate) fn wait_slot(&self, ptr_raw: u64, lane: u32, slot: usize) {
        let ci = self.cn.get_conn(ptr_raw, lane);
        one_side::poll(&ci.conn, &self.op_counters[slot]);
    }

    /// One poll attempt for a sequenced terminator; used by async variants.
    pub(crate) fn slot_done(&self, ptr_raw: u64, lane: u32, slot: usize) -> bool {
        let ci = self.cn.get_conn(ptr_raw, lane);
        one_side::poll_once(&ci.conn, &self.op_counters[slot])
    }

    pub(crate) fn seq_lane(&self, idx: usize) -> u32 {
        self.seq_batches[&idx].lane_idx
    }

    /// Gather staged non-write values in issue order, then give back every
    /// ring slot the batch held.
    pub(crate) fn finish_seq<T: Copy>(&mut self, idx: usize) -> Vec<T> {
        let batch = match self.seq_batches.remove(&idx) {
            Some(b) => b,
            None => fatal!("finishing a sequence slot that is not in flight"),
        };
        let mut result = Vec::new();
        for e in &batch.entries {
            if !e.is_write {
                if let Some(buf) = e.staged {
                    result.push(unsafe { std::ptr::read(buf as *const T) });
                }
            }
        }
        for e in &batch.entries {
            if let Some(buf) = e.staged {
                self.staging.release(buf);
            }
        }
        if let Some(slot) = batch.op_counter {
            self.op_ring.release(slot);
        }
        self.seq_ring.release(idx);
        self.lane_exit(batch.lane_idx);
        result
    }

    // ---- allocator --------------------------------------------------------

    /// Allocate room for `n` elements of `T` in remote memory.
    ///
    /// Freelist hits stay local; otherwise the allocation policy picks a
    /// segment and a remote fetch-and-add reserves the bytes.  A policy
    /// that keeps naming an exhausted segment will loop here forever; that
    /// is a configuration responsibility, not a checked error.
    pub fn allocate<T>(&mut self, n: usize) -> RemotePtr<T> {
        let size = self.alloc.compute_size::<T>(n);
        if let Some(addr) = self.alloc.try_allocate_local(size) {
            return RemotePtr::from_raw(addr);
        }
        let cn = self.cn.clone();
        loop {
            let (mn_id, seg_idx) = self.alloc.policy.get_mn_seg();
            let base = cn.seg_start(mn_id, seg_idx as u64);
            let hint = cn.alloc_hint(mn_id, seg_idx as u64);
            // The hint only ever grows, so a full segment stays rejected
            // without the round trip.
            if hint.load(Ordering::Acquire) + size > self.alloc.seg_size() {
                continue;
            }
            let bump = RemotePtr::<u64>::from_raw(base + ALLOCATED_OFFSET);
            let offset: u64 = self.fetch_and_add(bump, size);
            if offset + size > self.alloc.seg_size() {
                // Over-reserved on a full segment; the FAA cannot be undone.
                continue;
            }
            let mut curr = hint.load(Ordering::Acquire);
            let new_hint = offset + size;
            while curr < new_hint {
                match hint.compare_exchange(curr, new_hint, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => break,
                    Err(seen) => curr = seen,
                }
            }
            // Fresh block: set the size word, zero the padding word.
            let block = base + offset;
            self.write(RemotePtr::<u64>::from_raw(block), &size);
            self.write(RemotePtr::<u64>::from_raw(block + 8), &0u64);
            return RemotePtr::from_raw(block + HEADER_SIZE);
        }
    }

    /// Return a block to this thread's freelists.  The block's stored size
    /// is read back from its header; no remote bookkeeping changes.
    pub fn deallocate<T>(&mut self, ptr: RemotePtr<T>) {
        let size: u64 = self.read(RemotePtr::<u64>::from_raw(ptr.raw() - HEADER_SIZE));
        self.alloc.reclaim(ptr.raw(), size);
    }

    /// Allocate remote memory and hand back a locally-dereferenceable
    /// pointer.  Only meaningful when the chosen segment lives on this
    /// machine (a co-located LOCAL-* allocation policy).
    pub fn new_local<T>(&mut self, n: usize) -> *mut T {
        let ptr = self.allocate::<T>(n);
        if ptr.is_null() {
            fatal!("allocation failed");
        }
        ptr.as_local()
    }

    /// Counterpart of `new_local`.
    pub fn delete_local<T>(&mut self, ptr: *mut T) {
        if ptr.is_null() {
            fatal!("delete_local of a null pointer");
        }
        self.deallocate(RemotePtr::<T>::new(self.node_id, ptr as u64));
    }

    /// Deferred-reclamation hook.  Epoch-based reclamation is future work;
    /// today blocks are only reusable through `deallocate` on the owning
    /// thread.
    pub fn reclaim<T>(&mut self, _ptr: RemotePtr<T>) {}

    /// Scratch memory from this thread's cached slice, usable as a
    /// zero-copy source or destination.
    pub fn local_alloc<T>(&mut self, n: usize) -> *mut T {
        let bytes = std::mem::size_of::<T>() * n;
        match self.cached.acquire(bytes, std::mem::align_of::<T>()) {
            Some(buf) => buf as *mut T,
            None => fatal!("cached ring exhausted for a {}-byte request", bytes),
        }
    }

    pub fn local_free<T>(&mut self, buf: *mut T) {
        self.cached.release(buf as *mut u8);
    }

    // ---- root pointer and barrier -----------------------------------------

    fn ctrl_word(&self, offset: u64) -> RemotePtr<u64> {
        RemotePtr::from_raw(self.cn.seg_start(self.cfg.first_mn_id, 0) + offset)
    }

    /// Publish the root pointer in segment 0 of the first memory node.
    /// Written once per experiment, by the coordinator, before the first
    /// barrier.
    pub fn set_root<T>(&mut self, root: RemotePtr<T>) {
        let raw = root.raw();
        self.write(self.ctrl_word(ROOT_OFFSET), &raw);
    }

    pub fn get_root<T>(&mut self) -> RemotePtr<T> {
        let raw: u64 = self.read(self.ctrl_word(ROOT_OFFSET));
        RemotePtr::from_raw(raw)
    }

    pub fn cas_root<T>(&mut self, old: RemotePtr<T>, new: RemotePtr<T>) -> RemotePtr<T> {
        let prev = self.compare_and_swap(self.ctrl_word(ROOT_OFFSET), old.raw(), new.raw());
        RemotePtr::from_raw(prev)
    }

    pub fn faa_root(&mut self, add: u64) -> u64 {
        self.fetch_and_add(self.ctrl_word(ROOT_OFFSET), add)
    }

    /// Sense-reversing barrier on the shared barrier word.
    ///
    /// Arrival adds 2, keeping the sense in the low bit.  The last arriver
    /// resets the count by writing the flipped sense; everyone else spins
    /// until the sense flips.  The word never resets to zero, so the same
    /// slot serves every round.
    pub fn arrive_barrier(&mut self, participants: u64) {
        let barrier = self.ctrl_word(BARRIER_OFFSET);
        let was: u64 = self.fetch_and_add(barrier, 2);
        let new_sense = 1 - (was & 1);
        if (was >> 1) == participants - 1 {
            self.write(barrier, &new_sense);
            return;
        }
        while (self.read(barrier) & 1) != new_sense {}
    }

    // ---- shutdown ---------------------------------------------------------

    fn audit_leaks(&self) {
        if !self.op_ring.is_drained() {
            fatal!("thread {} leaked completion slots", self.id);
        }
        if !self.seq_ring.is_drained() || !self.seq_batches.is_empty() {
            fatal!("thread {} leaked sequence slots", self.id);
        }
        if !self.staging.is_drained() {
            fatal!("thread {} leaked staging buffers", self.id);
        }
        if !self.cached.is_drained() {
            fatal!("thread {} leaked cached buffers", self.id);
        }
    }
}

impl Drop for ComputeThread {
    fn drop(&mut self) {
        // One control-flag bump per memory node; their teardown waits for
        // the whole job's threads.
        for mn in self.cfg.first_mn_id..=self.cfg.last_mn_id {
            let flag =
                RemotePtr::<u64>::from_raw(self.cn.seg_start(mn, 0) + CONTROL_FLAG_OFFSET);
            self.fetch_and_add::<u64>(flag, 1);
        }
        self.audit_leaks();
        info!("compute thread {} shutdown", self.id);
    }
}

pub(crate) fn to_u64<T: Copy>(val: T) -> u64 {
    let mut raw = 0u64;
    unsafe {
        std::ptr::copy_nonoverlapping(
            &val as *const T as *const u8,
            &mut raw as *mut u64 as *mut u8,
            std::mem::size_of::<T>(),
        );
    }
    raw
}

pub(crate) fn from_u64<T: Copy>(raw: u64) -> T {
    unsafe { std::ptr::read(&raw as *const u64 as *const T) }
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn flush_line(addr: *const u8) {
    unsafe { core::arch::x86_64::_mm_clflush(addr) }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
fn flush_line(_addr: *const u8) {}

#[cfg(target_arch = "x86_64")]
#[inline]
fn store_fence() {
    unsafe { core::arch::x86_64::_mm_sfence() }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
fn store_fence() {
    std::sync::atomic::fence(Ordering::SeqCst);
}
