use std::ffi::CString;
use std::time::Duration;

use log::{debug, info};
use rdma_sys::*;

use super::one_side::OneSideComm;
use super::segment::{MemoryRegion, Segment};
use super::two_sides::TwoSidesComm;
use super::{default_qp_init_attr, make_nonblocking, make_sync};
use crate::fatal;
use crate::{RmemError, RmemResult};

/// Bounds for the exponential backoff between rejected connection attempts.
pub const CONNECT_BACKOFF_MIN_US: u64 = 100;
pub const CONNECT_BACKOFF_MAX_US: u64 = 5_000_000;

/// One reliable-connected endpoint between this machine and a peer.
///
/// A connection is created on each side when a compute node dials a memory
/// node (the loopback case only creates one, on the compute side).  Once
/// made, it is oblivious to which side built it: the surface is posting
/// one-sided work requests, polling the send completion queue, and the
/// limited two-sided send/receive used to ship registration records during
/// bring-up.
pub struct Connection {
    id: *mut rdma_cm_id,
    local_id: u16,
    peer_id: u16,
    loopback: bool,
}

unsafe impl Send for Connection {}
unsafe impl Sync for Connection {}

impl Connection {
    pub fn new(local_id: u16, peer_id: u16, id: *mut rdma_cm_id) -> Self {
        Self {
            id,
            local_id,
            peer_id,
            loopback: local_id == peer_id,
        }
    }

    #[inline]
    pub fn local_id(&self) -> u16 {
        self.local_id
    }

    #[inline]
    pub fn peer_id(&self) -> u16 {
        self.peer_id
    }

    #[inline]
    pub fn pd(&self) -> *mut ibv_pd {
        unsafe { (*self.id).pd }
    }
}

impl OneSideComm for Connection {
    /// Enqueue a prepared one-sided work request (or a chain of them) on the
    /// send queue.  Success means the transport accepted the request, not
    /// that it completed.
    fn post_one_sided(&self, send_wr: *mut ibv_send_wr) {
        let mut bad_wr: *mut ibv_send_wr = std::ptr::null_mut();
        let ret = unsafe { ibv_post_send((*self.id).qp, send_wr, &mut bad_wr) };
        if ret != 0 {
            fatal!("ibv_post_send: {}", errno::errno());
        }
    }

    /// Drain up to `wc.len()` completions from the send CQ.  Non-blocking;
    /// returns the count, or a negative value with errno set.
    fn poll_cq(&self, wc: &mut [ibv_wc]) -> i32 {
        unsafe { ibv_poll_cq((*self.id).send_cq, wc.len() as i32, wc.as_mut_ptr()) }
    }
}

impl TwoSidesComm for Connection {
    /// Only used to ship registration records during bring-up, so
    /// throughput is irrelevant and the send is fully synchronous.
    ///
    /// The receiver is assumed to know the incoming byte count and to have
    /// pre-posted a large-enough buffer.
    fn send_vec<T: Copy>(
        &self,
        msg: &[T],
        seg: &Segment,
        mr: &MemoryRegion,
    ) -> RmemResult<()> {
        let msg_size = std::mem::size_of_val(msg);
        unsafe {
            std::ptr::copy_nonoverlapping(msg.as_ptr() as *const u8, seg.raw(), msg_size);
        }

        let mut sge = ibv_sge {
            addr: seg.raw() as u64,
            length: msg_size as u32,
            lkey: mr.lkey(),
        };

        let mut wr = unsafe { std::mem::zeroed::<ibv_send_wr>() };
        wr.wr_id = 1; // synchronous; identity is irrelevant
        wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
        wr.num_sge = 1;
        wr.sg_list = &mut sge as *mut _;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;

        let mut bad_wr: *mut ibv_send_wr = std::ptr::null_mut();
        let ret = unsafe { ibv_post_send((*self.id).qp, &mut wr, &mut bad_wr) };
        if ret != 0 {
            debug!("send_vec ibv_post_send: {}", errno::errno());
            return Err(RmemError::RmemRdmaError);
        }

        let mut wc = unsafe { std::mem::zeroed::<ibv_wc>() };
        let mut comps = unsafe { rdma_get_send_comp(self.id, &mut wc) };
        while comps < 0 && errno::errno().0 == libc::EAGAIN {
            comps = unsafe { rdma_get_send_comp(self.id, &mut wc) };
        }
        if comps < 0 {
            debug!("rdma_get_send_comp: {}", errno::errno());
            return Err(RmemError::RmemRdmaError);
        }
        if wc.status != ibv_wc_status::IBV_WC_SUCCESS {
            debug!("rdma_get_send_comp status {}", wc.status);
            return Err(RmemError::RmemRdmaError);
        }
        Ok(())
    }

    fn recv_vec<T: Copy>(&self, seg: &Segment) -> RmemResult<Vec<T>> {
        let mut wc = unsafe { std::mem::zeroed::<ibv_wc>() };
        loop {
            let ret = unsafe { rdma_get_recv_comp(self.id, &mut wc) };
            if ret < 0 {
                if errno::errno().0 == libc::EAGAIN {
                    continue;
                }
                debug!("rdma_get_recv_comp: {}", errno::errno());
                return Err(RmemError::RmemRdmaError);
            }
            break;
        }
        if wc.status != ibv_wc_status::IBV_WC_SUCCESS {
            debug!("rdma_get_recv_comp status {}", wc.status);
            return Err(RmemError::RmemRdmaError);
        }

        let elems = wc.byte_len as usize / std::mem::size_of::<T>();
        let mut vec = Vec::<T>::with_capacity(elems);
        unsafe {
            std::ptr::copy_nonoverlapping(seg.raw() as *const T, vec.as_mut_ptr(), elems);
            vec.set_len(elems);
        }
        Ok(vec)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        unsafe {
            // Loopback endpoints never went through rdma_cm connect, so
            // there is nothing to disconnect and no event channel of ours.
            if !self.loopback {
                rdma_disconnect(self.id);
                let mut event: *mut rdma_cm_event = std::ptr::null_mut();
                while rdma_get_cm_event((*self.id).channel, &mut event) == 0 {
                    rdma_ack_cm_event(event);
                }
            }
            let channel = (*self.id).channel;
            let has_context = !(*self.id).context.is_null();
            rdma_destroy_ep(self.id);
            // Dialing connections own their event channel; accepted ones
            // carry a context and their channel belongs to the listener.
            if !self.loopback && !has_context && !channel.is_null() {
                rdma_destroy_event_channel(channel);
            }
        }
    }
}

/// Resolve a peer and create a reliable-connected endpoint toward it.
pub fn initialize_ep(address: &str, port: u16) -> *mut rdma_cm_id {
    let node = CString::new(address).unwrap();
    let service = CString::new(port.to_string()).unwrap();

    let mut hints = unsafe { std::mem::zeroed::<rdma_addrinfo>() };
    hints.ai_port_space = rdma_port_space::RDMA_PS_TCP as i32;
    let mut resolved: *mut rdma_addrinfo = std::ptr::null_mut();
    let ret = unsafe {
        rdma_getaddrinfo(
            node.as_ptr() as *mut _,
            service.as_ptr() as *mut _,
            &hints,
            &mut resolved,
        )
    };
    if ret != 0 {
        fatal!("rdma_getaddrinfo({}:{}): {}", address, port, errno::errno());
    }

    let mut init_attr = default_qp_init_attr();
    let mut id: *mut rdma_cm_id = std::ptr::null_mut();
    let ret = unsafe { rdma_create_ep(&mut id, resolved, std::ptr::null_mut(), &mut init_attr) };
    unsafe { rdma_freeaddrinfo(resolved) };
    if ret != 0 {
        fatal!("rdma_create_ep: {}", errno::errno());
    }
    id
}

/// Dial a remote memory node.  Retries forever on rejection with
/// exponential backoff (biased by our own id to break symmetry when two
/// machines dial each other); any other unexpected event is fatal.
///
/// On each attempt the caller's big local segment is registered with the
/// fresh endpoint's PD and a receive for the registration-record array is
/// pre-posted, so the record exchange can start the instant the connection
/// is established.
pub fn connect_remote(
    my_id: u16,
    mn_id: u16,
    mn_addr: &str,
    port: u16,
    seg: &Segment,
    mrs: &mut Vec<MemoryRegion>,
) -> Connection {
    let mut backoff_us: u64 = 0;
    loop {
        // A fresh endpoint per attempt; rejection destroys it below.
        let id = initialize_ep(mn_addr, port);
        let mr = seg.register_with_pd(unsafe { (*id).pd }).unwrap();
        let ret = unsafe {
            rdma_post_recv(
                id,
                std::ptr::null_mut(),
                seg.raw() as *mut _,
                seg.capacity() as usize,
                mr.as_ptr(),
            )
        };
        if ret != 0 {
            fatal!("rdma_post_recv: {}", errno::errno());
        }
        mrs.push(mr);

        let event_channel = unsafe { rdma_create_event_channel() };
        unsafe { make_nonblocking((*event_channel).fd) };
        if unsafe { rdma_migrate_id(id, event_channel) } != 0 {
            fatal!("rdma_migrate_id: {}", errno::errno());
        }

        let private = my_id as u32;
        let mut conn_param = unsafe { std::mem::zeroed::<rdma_conn_param>() };
        conn_param.private_data = &private as *const u32 as *const _;
        conn_param.private_data_len = std::mem::size_of::<u32>() as u8;
        conn_param.retry_count = 255;
        conn_param.rnr_retry_count = 7;
        conn_param.responder_resources = 8;
        conn_param.initiator_depth = 8;
        if unsafe { rdma_connect(id, &mut conn_param) } != 0 {
            fatal!("rdma_connect: {}", errno::errno());
        }

        // The channel needs a few events before it is usable; walk them.
        loop {
            let mut event: *mut rdma_cm_event = std::ptr::null_mut();
            let mut ret = unsafe { rdma_get_cm_event((*id).channel, &mut event) };
            while ret < 0 && errno::errno().0 == libc::EAGAIN {
                ret = unsafe { rdma_get_cm_event((*id).channel, &mut event) };
            }

            let cm_event = unsafe { (*event).event };
            if unsafe { rdma_ack_cm_event(event) } != 0 {
                fatal!("rdma_ack_cm_event: {}", errno::errno());
            }

            if cm_event == rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED {
                unsafe {
                    make_sync((*event_channel).fd);
                    make_nonblocking((*(*(*id).recv_cq).channel).fd);
                    make_nonblocking((*(*(*id).send_cq).channel).fd);
                }
                return Connection::new(my_id, mn_id, id);
            } else if cm_event == rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED {
                // benign; already acked
            } else if cm_event == rdma_cm_event_type::RDMA_CM_EVENT_REJECTED {
                mrs.pop(); // deregister before the endpoint (and its PD) go away
                unsafe {
                    rdma_destroy_ep(id);
                    rdma_destroy_event_channel(event_channel);
                }
                backoff_us = if backoff_us > 0 {
                    ((backoff_us + 100 * my_id as u64) * 2).min(CONNECT_BACKOFF_MAX_US)
                } else {
                    CONNECT_BACKOFF_MIN_US
                };
                debug!(
                    "node {} rejected by {}; retrying in {} us",
                    my_id, mn_id, backoff_us
                );
                std::thread::sleep(Duration::from_micros(backoff_us));
                break;
            } else {
                fatal!("unexpected cm event {} while connecting", cm_event);
            }
        }
    }
}

/// Connect to the local device.  Used only when this machine is both a
/// compute and a memory node: no handshake runs, the endpoint's QP is
/// driven through INIT/RTR/RTS by hand against itself, and registration
/// records are injected in-process rather than shipped.
pub fn connect_loopback(my_id: u16, address: &str, port: u16) -> Connection {
    let id = initialize_ep(address, port);

    let mut dev_attr = unsafe { std::mem::zeroed::<ibv_device_attr>() };
    if unsafe { ibv_query_device((*id).verbs, &mut dev_attr) } != 0 {
        fatal!("ibv_query_device: {}", errno::errno());
    }

    // Use the first active physical port.
    let mut port_attr = unsafe { std::mem::zeroed::<ibv_port_attr>() };
    let mut loopback_port: u8 = 1;
    for i in 1..=dev_attr.phys_port_cnt {
        if unsafe { ___ibv_query_port((*id).verbs, i, &mut port_attr) } != 0 {
            fatal!("ibv_query_port: {}", errno::errno());
        }
        if port_attr.state == ibv_port_state::IBV_PORT_ACTIVE {
            loopback_port = i;
            break;
        }
    }

    let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
    attr.qp_access_flags = (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0
        | ibv_access_flags::IBV_ACCESS_REMOTE_READ.0
        | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0
        | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC.0) as i32;
    attr.max_dest_rd_atomic = 8;
    attr.path_mtu = ibv_mtu::IBV_MTU_4096;
    attr.min_rnr_timer = 12;
    attr.rq_psn = 0;
    attr.sq_psn = 0;
    attr.timeout = 12;
    attr.retry_cnt = 255;
    attr.rnr_retry = 7;
    attr.max_rd_atomic = 8;
    attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
    attr.port_num = loopback_port;
    let mask = ibv_qp_attr_mask::IBV_QP_STATE.0
        | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX.0
        | ibv_qp_attr_mask::IBV_QP_PORT.0
        | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS.0;
    if unsafe { ibv_modify_qp((*id).qp, &mut attr, mask as i32) } != 0 {
        fatal!("ibv_modify_qp(INIT): {}", errno::errno());
    }

    attr.ah_attr.dlid = port_attr.lid;
    attr.ah_attr.port_num = loopback_port;

    // A zero LID means the link is RoCE; the address handle must carry a
    // global route header instead.
    if port_attr.lid == 0 {
        attr.ah_attr.is_global = 1;
        if port_attr.gid_tbl_len < 1 {
            fatal!("need a gid table with at least one entry");
        }
        let mut gid = unsafe { std::mem::zeroed::<ibv_gid>() };
        if unsafe { ibv_query_gid((*id).verbs, loopback_port, 0, &mut gid) } != 0 {
            fatal!("ibv_query_gid: {}", errno::errno());
        }
        attr.ah_attr.grh.dgid = gid;
        attr.ah_attr.grh.sgid_index = 0;
        attr.ah_attr.grh.hop_limit = 0xFF;
        attr.ah_attr.grh.traffic_class = 0;
        attr.ah_attr.grh.flow_label = 0;
    }

    attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
    attr.dest_qp_num = unsafe { (*(*id).qp).qp_num };
    let mask = ibv_qp_attr_mask::IBV_QP_STATE.0
        | ibv_qp_attr_mask::IBV_QP_AV.0
        | ibv_qp_attr_mask::IBV_QP_PATH_MTU.0
        | ibv_qp_attr_mask::IBV_QP_DEST_QPN.0
        | ibv_qp_attr_mask::IBV_QP_RQ_PSN.0
        | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC.0
        | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER.0;
    if unsafe { ibv_modify_qp((*id).qp, &mut attr, mask as i32) } != 0 {
        fatal!("ibv_modify_qp(RTR): {}", errno::errno());
    }

    attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
    let mask = ibv_qp_attr_mask::IBV_QP_STATE.0
        | ibv_qp_attr_mask::IBV_QP_SQ_PSN.0
        | ibv_qp_attr_mask::IBV_QP_TIMEOUT.0
        | ibv_qp_attr_mask::IBV_QP_RETRY_CNT.0
        | ibv_qp_attr_mask::IBV_QP_RNR_RETRY.0
        | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC.0;
    if unsafe { ibv_modify_qp((*id).qp, &mut attr, mask as i32) } != 0 {
        fatal!("ibv_modify_qp(RTS): {}", errno::errno());
    }

    unsafe {
        make_nonblocking((*(*(*id).recv_cq).channel).fd);
        make_nonblocking((*(*(*id).send_cq).channel).fd);
    }

    info!("node {} loopback lane up on port {}", my_id, loopback_port);
    Connection::new(my_id, my_id, id)
}

/// Create the passive endpoint a memory node listens on.
pub fn make_listen_id(address: &str, port: u16) -> *mut rdma_cm_id {
    let node = CString::new(address).unwrap();
    let service = CString::new(port.to_string()).unwrap();

    let mut hints = unsafe { std::mem::zeroed::<rdma_addrinfo>() };
    hints.ai_flags = RAI_PASSIVE as i32;
    hints.ai_port_space = rdma_port_space::RDMA_PS_TCP as i32;
    let mut resolved: *mut rdma_addrinfo = std::ptr::null_mut();
    let ret = unsafe {
        rdma_getaddrinfo(
            node.as_ptr() as *mut _,
            service.as_ptr() as *mut _,
            &hints,
            &mut resolved,
        )
    };
    if ret != 0 {
        fatal!("rdma_getaddrinfo({}:{}): {}", address, port, errno::errno());
    }

    let mut init_attr = default_qp_init_attr();
    init_attr.cap.max_send_sge = 1;
    init_attr.cap.max_recv_sge = 1;
    init_attr.sq_sig_all = 1;
    let mut listen_id: *mut rdma_cm_id = std::ptr::null_mut();
    let ret =
        unsafe { rdma_create_ep(&mut listen_id, resolved, std::ptr::null_mut(), &mut init_attr) };
    unsafe { rdma_freeaddrinfo(resolved) };
    if ret != 0 {
        fatal!("listener rdma_create_ep for {}:{}: {}", address, port, errno::errno());
    }
    listen_id
}
