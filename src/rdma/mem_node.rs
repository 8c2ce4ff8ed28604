use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info};
use rdma_sys::*;

use super::connection::{make_listen_id, Connection};
use super::segment::{ControlBlock, MemoryRegion, Segment};
use super::two_sides::TwoSidesComm;
use super::{default_qp_init_attr, make_nonblocking, RegionInfo};
use crate::common::MachineInfo;
use crate::config::Config;
use crate::fatal;

/// Context attached to each accepted endpoint.  It keeps the private data
/// echoed back during accept alive, and records who connected.
struct IdContext {
    machine_id: u32,
    conn_param: rdma_conn_param,
}

unsafe impl Send for IdContext {}

/// One published segment plus its registration.
struct SegInfo {
    seg: Segment,
    _mr: MemoryRegion,
}

/// Everything the listener thread owns while it accepts connections.
struct Listener {
    self_id: u16,
    listen_id: *mut rdma_cm_id,
    channel: *mut rdma_event_channel,
    remaining: u64,
    ris: Vec<RegionInfo>,
    send_seg: Segment,
    send_mr: MemoryRegion,
}

unsafe impl Send for Listener {}

/// A machine that publishes pinned memory segments.
///
/// Every segment hangs off the single listening endpoint's protection
/// domain, so every accepted lane can address all of them.  Accepting runs
/// on a dedicated thread because a machine that is both compute and memory
/// must take inbound connections while it is dialing outbound ones.
pub struct MemoryNode {
    self_info: MachineInfo,
    segs: Vec<SegInfo>,
    ris: Vec<RegionInfo>,
    listen_id: *mut rdma_cm_id,
    runner: Option<JoinHandle<(Vec<Connection>, Vec<Box<IdContext>>)>>,
    conns: Vec<Connection>,
    _contexts: Vec<Box<IdContext>>,
    total_threads: u64,
}

unsafe impl Send for MemoryNode {}

impl MemoryNode {
    pub fn new(self_info: MachineInfo, cfg: &Arc<Config>) -> Self {
        let num_segs = cfg.segs_per_mn;
        info!(
            "node {}: configuring memory node ({} segments at 2^{}B each)",
            self_info.id, num_segs, cfg.seg_size
        );

        // Lanes we expect from every compute node that is not this process.
        let mut cns = cfg.num_cns();
        if cfg.is_cn(self_info.id) {
            cns -= 1;
        }
        let remaining = cns * cfg.qp_lanes as u64;

        let listen_id = make_listen_id(&self_info.address, cfg.mn_port);
        if unsafe { (*listen_id).pd }.is_null() {
            fatal!("listening endpoint has no protection domain");
        }

        // A small dedicated segment backs the bring-up sends; its size only
        // needs to cover the registration-record array.
        let send_seg = Segment::new(1 << 20).unwrap();
        let send_mr = send_seg.register_with_pd(unsafe { (*listen_id).pd }).unwrap();

        let mut segs = Vec::new();
        for _ in 0..num_segs {
            let seg = Segment::new(cfg.seg_bytes()).unwrap();
            unsafe { ControlBlock::init_at(seg.raw(), cfg.seg_bytes()) };
            let mr = seg.register_with_pd(unsafe { (*listen_id).pd }).unwrap();
            segs.push(SegInfo { seg, _mr: mr });
        }

        let ris: Vec<RegionInfo> = segs
            .iter()
            .map(|s| RegionInfo {
                raddr: s.seg.raw() as u64,
                rkey: s._mr.rkey(),
            })
            .collect();
        info!("shared segments:");
        for ri in &ris {
            let (raddr, rkey) = (ri.raddr, ri.rkey);
            info!("  0x{:x} (rk=0x{:x})", raddr, rkey);
        }

        // Listen on an async channel; the thread spawned below drives it.
        let channel = unsafe { rdma_create_event_channel() };
        if unsafe { rdma_migrate_id(listen_id, channel) } != 0 {
            fatal!("rdma_migrate_id: {}", errno::errno());
        }
        make_nonblocking(unsafe { (*channel).fd });
        if unsafe { rdma_listen(listen_id, 0) } != 0 {
            fatal!("rdma_listen: {}", errno::errno());
        }

        info!("listener thread awaiting {} connections", remaining);
        let listener = Listener {
            self_id: self_info.id,
            listen_id,
            channel,
            remaining,
            ris: ris.clone(),
            send_seg,
            send_mr,
        };
        let runner = std::thread::spawn(move || listener.run());

        Self {
            self_info,
            segs,
            ris,
            listen_id,
            runner: Some(runner),
            conns: Vec::new(),
            _contexts: Vec::new(),
            total_threads: cfg.total_threads(),
        }
    }

    /// Registration records for the co-located case: a compute node in the
    /// same process cannot ship rkeys to itself over the wire.
    pub fn get_local_rkeys(&self) -> Vec<RegionInfo> {
        self.ris.clone()
    }

    /// Wait for every expected connection, then stop listening.  Blocks
    /// until the listener thread has been joined.
    pub fn init_done(&mut self) {
        if let Some(runner) = self.runner.take() {
            let (conns, contexts) = runner.join().unwrap();
            self.conns = conns;
            self._contexts = contexts;
        }
        info!("stopping listening thread ({} lanes open)", self.conns.len());
        unsafe { rdma_destroy_ep(self.listen_id) };
        // Give peers a beat to finish their own bring-up before heavy
        // one-sided traffic starts landing.
        std::thread::sleep(Duration::from_secs(1));
    }
}

impl Drop for MemoryNode {
    fn drop(&mut self) {
        // Every compute thread in the job bumps the control flag once on
        // shutdown; tearing down segments earlier would yank memory out
        // from under in-flight ops.
        let cb = unsafe { ControlBlock::at(self.segs[0].seg.raw()) };
        while cb.control_flag.load(std::sync::atomic::Ordering::Acquire) != self.total_threads {
            std::thread::yield_now();
        }
        info!("memory node {} shutdown", self.self_info.id);
    }
}

impl Listener {
    fn run(mut self) -> (Vec<Connection>, Vec<Box<IdContext>>) {
        let mut conns = Vec::new();
        let mut contexts = Vec::new();
        while self.remaining > 0 {
            let mut event: *mut rdma_cm_event = std::ptr::null_mut();
            if unsafe { rdma_get_cm_event(self.channel, &mut event) } != 0 {
                if errno::errno().0 != libc::EAGAIN {
                    fatal!("rdma_get_cm_event: {}", errno::errno());
                }
                std::thread::yield_now();
                continue;
            }

            let id = unsafe { (*event).id };
            let kind = unsafe { (*event).event };
            if kind == rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST {
                self.on_connect(id, event, &mut conns, &mut contexts);
            } else if kind == rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED
                || kind == rdma_cm_event_type::RDMA_CM_EVENT_TIMEWAIT_EXIT
                || kind == rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED
            {
                // Nothing to do beyond acknowledging; disconnects are not
                // handled gracefully by design.
                unsafe { rdma_ack_cm_event(event) };
            } else {
                fatal!("listener got unexpected cm event {}", kind);
            }
        }
        (conns, contexts)
    }

    /// Accept one inbound lane: build its QP on the listening PD, echo the
    /// peer id back as private data, and ship the registration records.
    fn on_connect(
        &mut self,
        id: *mut rdma_cm_id,
        event: *mut rdma_cm_event,
        conns: &mut Vec<Connection>,
        contexts: &mut Vec<Box<IdContext>>,
    ) {
        let private = unsafe { (*event).param.conn.private_data };
        if private.is_null() {
            fatal!("connect request without private data");
        }
        let machine_id = unsafe { *(private as *const u32) };
        if machine_id == self.self_id as u32 {
            fatal!("self-connections do not go through the listener");
        }

        let mut init_attr = default_qp_init_attr();
        let ret = unsafe { rdma_create_qp(id, (*self.listen_id).pd, &mut init_attr) };
        if ret != 0 {
            fatal!("rdma_create_qp: {}", errno::errno());
        }

        let mut context = Box::new(IdContext {
            machine_id,
            conn_param: unsafe { std::mem::zeroed() },
        });
        context.conn_param.private_data = &context.machine_id as *const u32 as *const _;
        context.conn_param.private_data_len = std::mem::size_of::<u32>() as u8;
        context.conn_param.rnr_retry_count = 7;
        context.conn_param.retry_count = 255;
        context.conn_param.responder_resources = 255;
        context.conn_param.initiator_depth = 255;
        unsafe {
            (*id).context = context.as_mut() as *mut IdContext as *mut _;
            make_nonblocking((*(*(*id).recv_cq).channel).fd);
            make_nonblocking((*(*(*id).send_cq).channel).fd);
        }

        let conn = Connection::new(self.self_id, machine_id as u16, id);
        if unsafe { rdma_accept(id, &mut context.conn_param) } != 0 {
            fatal!("rdma_accept: {}", errno::errno());
        }
        unsafe { rdma_ack_cm_event(event) };

        // Let the peer's event loop observe ESTABLISHED before the record
        // send lands on its pre-posted receive.
        std::thread::sleep(Duration::from_millis(100));
        if let Err(e) = conn.send_vec(&self.ris, &self.send_seg, &self.send_mr) {
            fatal!("failed to ship registration records: {:?}", e);
        }
        debug!(
            "accepted lane from node {} ({} still expected)",
            machine_id,
            self.remaining - 1
        );

        conns.push(conn);
        contexts.push(context);
        self.remaining -= 1;
    }
}
