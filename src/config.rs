use clap::Parser;

/// Job-wide configuration.  Every machine in a job runs with identical
/// arguments except `--node-id`.  Memory and compute roles are id ranges;
/// a node whose id falls in both ranges plays both roles.
#[derive(Parser, Debug, Clone)]
#[command(name = "rmem", about = "Distributed remote-memory runtime over RDMA")]
pub struct Config {
    /// A numerical identifier for this node.
    #[arg(long)]
    pub node_id: u16,

    /// The node-id of the first node that hosts memory segments.
    #[arg(long)]
    pub first_mn_id: u16,

    /// The node-id of the last node that hosts memory segments.
    #[arg(long)]
    pub last_mn_id: u16,

    /// The node-id of the first node that performs computations.
    #[arg(long)]
    pub first_cn_id: u16,

    /// The node-id of the last node that performs computations.
    #[arg(long)]
    pub last_cn_id: u16,

    /// Each remotely-accessible segment holds 2^{seg-size} bytes.
    #[arg(long, default_value_t = 20)]
    pub seg_size: u64,

    /// The number of remotely-accessible segments on each memory node.
    #[arg(long, default_value_t = 2)]
    pub segs_per_mn: u64,

    /// The port memory nodes listen on during bring-up.
    #[arg(long)]
    pub mn_port: u16,

    /// Parallel connections ("lanes") per compute-to-memory node pair.
    #[arg(long, default_value_t = 2)]
    pub qp_lanes: u32,

    /// How to pick a lane per op: RAND, RR, MOD, or ONE_TO_ONE.
    #[arg(long, default_value = "RAND")]
    pub qp_sched_pol: String,

    /// How to pick a segment per allocation: RAND, GLOBAL-RR, GLOBAL-MOD,
    /// LOCAL-RR, or LOCAL-MOD.
    #[arg(long, default_value = "GLOBAL-RR")]
    pub alloc_pol: String,

    /// The number of compute threads to run on each compute node.
    #[arg(long)]
    pub cn_threads: u64,

    /// Maximum concurrent ops a thread may issue without a completion.
    #[arg(long, default_value_t = 8)]
    pub cn_ops_per_thread: u64,

    /// Each compute thread owns a 2^{cn-thread-bufsz}-byte local buffer.
    #[arg(long, default_value_t = 20)]
    pub cn_thread_bufsz: u64,

    /// Maximum work requests chained into one sequenced batch.
    #[arg(long, default_value_t = 16)]
    pub cn_wrs_per_seq: u64,
}

impl Config {
    pub fn seg_bytes(&self) -> u64 {
        1u64 << self.seg_size
    }

    /// Bitmask covering the intra-segment offset of an address.
    pub fn seg_mask(&self) -> u64 {
        self.seg_bytes() - 1
    }

    pub fn thread_buf_bytes(&self) -> u64 {
        1u64 << self.cn_thread_bufsz
    }

    pub fn num_mns(&self) -> u64 {
        (self.last_mn_id - self.first_mn_id + 1) as u64
    }

    pub fn num_cns(&self) -> u64 {
        (self.last_cn_id - self.first_cn_id + 1) as u64
    }

    /// Compute threads across the whole job; the memory-node shutdown
    /// counter waits for exactly this many control-flag increments.
    pub fn total_threads(&self) -> u64 {
        self.num_cns() * self.cn_threads
    }

    pub fn is_mn(&self, id: u16) -> bool {
        id >= self.first_mn_id && id <= self.last_mn_id
    }

    pub fn is_cn(&self, id: u16) -> bool {
        id >= self.first_cn_id && id <= self.last_cn_id
    }

    /// Job-wide unique id for a thread, folding node id and thread id.
    pub fn thread_uid(&self, thread_id: u64) -> u64 {
        (self.node_id - self.first_cn_id) as u64 * self.cn_threads + thread_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Config {
        let mut argv = vec![
            "rmem",
            "--node-id",
            "1",
            "--first-mn-id",
            "0",
            "--last-mn-id",
            "0",
            "--first-cn-id",
            "1",
            "--last-cn-id",
            "2",
            "--mn-port",
            "7471",
            "--cn-threads",
            "4",
        ];
        argv.extend_from_slice(extra);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults() {
        let cfg = parse(&[]);
        assert_eq!(cfg.seg_size, 20);
        assert_eq!(cfg.segs_per_mn, 2);
        assert_eq!(cfg.qp_lanes, 2);
        assert_eq!(cfg.qp_sched_pol, "RAND");
        assert_eq!(cfg.alloc_pol, "GLOBAL-RR");
        assert_eq!(cfg.cn_ops_per_thread, 8);
        assert_eq!(cfg.cn_thread_bufsz, 20);
        assert_eq!(cfg.cn_wrs_per_seq, 16);
    }

    #[test]
    fn derived_geometry() {
        let cfg = parse(&["--seg-size", "21"]);
        assert_eq!(cfg.seg_bytes(), 1 << 21);
        assert_eq!(cfg.seg_mask(), (1 << 21) - 1);
        assert_eq!(cfg.num_mns(), 1);
        assert_eq!(cfg.num_cns(), 2);
        assert_eq!(cfg.total_threads(), 8);
    }

    #[test]
    fn role_membership() {
        let cfg = parse(&[]);
        assert!(cfg.is_mn(0));
        assert!(!cfg.is_mn(1));
        assert!(cfg.is_cn(1) && cfg.is_cn(2));
        assert!(!cfg.is_cn(0));
    }

    #[test]
    fn thread_uid_folds_node_and_thread() {
        let cfg = parse(&[]);
        assert_eq!(cfg.thread_uid(3), 3); // node 1 is the first compute node
        let mut argv_cfg = parse(&[]);
        argv_cfg.node_id = 2;
        assert_eq!(argv_cfg.thread_uid(0), 4);
    }

    #[test]
    fn missing_required_is_rejected() {
        assert!(Config::try_parse_from(["rmem", "--node-id", "0"]).is_err());
    }
}
