use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::info;

use super::connection::{connect_loopback, connect_remote, Connection};
use super::segment::{MemoryRegion, Segment, CONTROL_BLOCK_SIZE};
use super::two_sides::TwoSidesComm;
use super::RegionInfo;
use crate::common::MachineInfo;
use crate::config::Config;
use crate::fatal;

/// A lane to a memory node, plus the lkey that lets the big local segment
/// be used as the scatter/gather side of ops on that lane.
pub struct ConnInfo {
    pub conn: Connection,
    pub lkey: u32,
}

/// One remote segment as seen from this node: its id-tagged base, and the
/// last bump-counter value any local thread observed.  The hint only grows,
/// so a stale hint can cause a wasted FAA but never a wrong allocation.
struct SegEntry {
    start: u64,
    hint: AtomicU64,
}

/// Everything a machine needs to serve in the compute role.
///
/// A compute node holds lanes to every memory node and knows every published
/// segment.  Rather than registering one buffer per thread, it registers one
/// big segment per lane and slices it among the compute threads.
pub struct ComputeNode {
    self_info: MachineInfo,
    seg: Segment,
    mrs: Vec<MemoryRegion>,
    num_threads: u64,
    thread_bufsz: u64,
    threads: AtomicU64,
    conns: HashMap<u16, Vec<ConnInfo>>,
    rkeys: HashMap<u64, u32>,
    segs: HashMap<u16, Vec<SegEntry>>,
    seg_mask: u64,
    /// In-flight one-sided ops per lane; crossing the QP depth is fatal.
    pub lane_op_counters: Vec<AtomicUsize>,
    cfg: Arc<Config>,
}

impl ComputeNode {
    pub fn new(self_info: MachineInfo, cfg: &Arc<Config>) -> Self {
        info!("node {}: configuring compute node", cfg.node_id);
        let num_threads = cfg.cn_threads;
        let thread_bufsz = cfg.thread_buf_bytes();
        let wanted = num_threads * thread_bufsz;
        let seg = Segment::new(wanted.next_power_of_two()).unwrap();

        let mut segs = HashMap::new();
        for mn in cfg.first_mn_id..=cfg.last_mn_id {
            segs.insert(mn, Vec::new());
        }

        let mut lane_op_counters = Vec::with_capacity(cfg.qp_lanes as usize);
        for _ in 0..cfg.qp_lanes {
            lane_op_counters.push(AtomicUsize::new(0));
        }

        Self {
            self_info,
            seg,
            mrs: Vec::new(),
            num_threads,
            thread_bufsz,
            threads: AtomicU64::new(0),
            conns: HashMap::new(),
            rkeys: HashMap::new(),
            segs,
            seg_mask: cfg.seg_mask(),
            lane_op_counters,
            cfg: cfg.clone(),
        }
    }

    /// Open loopback lanes to a co-located memory node.  Registration
    /// records are injected in-process; nothing crosses the wire.
    pub fn connect_local(&mut self, memnodes: &[MachineInfo], local_rkeys: &[RegionInfo]) {
        for p in memnodes {
            if p.id != self.self_info.id {
                continue;
            }
            for _ in 0..self.cfg.qp_lanes {
                info!(
                    "connecting to localhost {}:{} (id = {})",
                    p.address, self.cfg.mn_port, p.id
                );
                let conn = connect_loopback(self.self_info.id, &self.self_info.address, self.cfg.mn_port);
                let mr = self.seg.register_with_pd(conn.pd()).unwrap();
                let lkey = mr.lkey();
                self.mrs.push(mr);
                self.save_conn(p.id, conn, lkey);
                for r in local_rkeys {
                    self.save_region(p.id, r.raddr, r.rkey);
                }
            }
        }
    }

    /// Dial every remote memory node over `qp_lanes` lanes, registering the
    /// big local segment with each lane's PD and recording the shipped
    /// registration records.
    pub fn connect_remote(&mut self, memnodes: &[MachineInfo]) {
        for p in memnodes {
            if p.id == self.self_info.id {
                continue;
            }
            for _ in 0..self.cfg.qp_lanes {
                info!(
                    "connecting to remote machine {}:{} (id = {}) from {}",
                    p.address, self.cfg.mn_port, p.id, self.self_info.id
                );
                let conn = connect_remote(
                    self.self_info.id,
                    p.id,
                    &p.address,
                    self.cfg.mn_port,
                    &self.seg,
                    &mut self.mrs,
                );
                let records: Vec<RegionInfo> = match conn.recv_vec(&self.seg) {
                    Ok(v) => v,
                    Err(e) => fatal!("receiving registration records: {:?}", e),
                };
                let lkey = self.mrs.last().unwrap().lkey();
                self.save_conn(p.id, conn, lkey);
                for r in &records {
                    self.save_region(p.id, r.raddr, r.rkey);
                }
            }
        }
    }

    fn save_conn(&mut self, node_id: u16, conn: Connection, lkey: u32) {
        self.conns
            .entry(node_id)
            .or_default()
            .push(ConnInfo { conn, lkey });
    }

    fn save_region(&mut self, node_id: u16, region: u64, rkey: u32) {
        const NODE_MASK: u64 = 0xFFFF << 48;
        if region & NODE_MASK != 0 {
            fatal!("top bits of region 0x{:x} must be 0", region);
        }
        if region & self.seg_mask != 0 {
            fatal!("region 0x{:x} is not aligned to the segment size", region);
        }
        let key = ((node_id as u64) << 48) | region;
        // rkeys are per peer, not per lane; only the first lane records it.
        if !self.rkeys.contains_key(&key) {
            info!(
                "  received segment 0x{:x} from node {} with rkey {}",
                region, node_id, rkey
            );
            self.rkeys.insert(key, rkey);
            // Nothing is allocated this early, so the first hint is just the
            // control-block tail; no read-back needed.
            self.segs.get_mut(&node_id).unwrap().push(SegEntry {
                start: key,
                hint: AtomicU64::new(CONTROL_BLOCK_SIZE),
            });
        }
    }

    /// Hand out the next zero-based thread id and that thread's slice of
    /// the big local segment.
    pub fn register_thread(&self) -> (u64, *mut u8) {
        let id = self.threads.fetch_add(1, Ordering::AcqRel);
        if id >= self.num_threads {
            fatal!(
                "register_thread produced thread #{} when only {} are supported",
                id,
                self.num_threads
            );
        }
        let slice = unsafe { self.seg.raw().add((id * self.thread_bufsz) as usize) };
        (id, slice)
    }

    /// The connection and lkey to use for a pointer, on a given lane.
    pub fn get_conn(&self, ptr_raw: u64, lane_idx: u32) -> &ConnInfo {
        let node_id = (ptr_raw >> 48 & 0xFFFF) as u16;
        match self.conns.get(&node_id) {
            Some(lanes) => &lanes[lane_idx as usize],
            None => fatal!("no connection to node {}", node_id),
        }
    }

    /// The rkey for a pointer: mask off the intra-segment offset and look
    /// up the `(peer | segment base)` key.
    pub fn get_rkey(&self, raw: u64) -> u32 {
        match self.rkeys.get(&(raw & !self.seg_mask)) {
            Some(rkey) => *rkey,
            None => fatal!("no rkey covers pointer 0x{:x}", raw),
        }
    }

    /// The id-tagged base address of a segment.
    pub fn seg_start(&self, mn_id: u16, seg_idx: u64) -> u64 {
        self.segs[&mn_id][seg_idx as usize].start
    }

    /// The last observed bump-counter value for a segment.
    pub fn alloc_hint(&self, mn_id: u16, seg_idx: u64) -> &AtomicU64 {
        &self.segs[&mn_id][seg_idx as usize].hint
    }
}
