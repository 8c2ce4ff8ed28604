use std::sync::Arc;

use clap::Parser;
use log::info;

use rmem::common::logs::init_log;
use rmem::common::MachineInfo;
use rmem::config::Config;
use rmem::framework::compute_thread::ComputeThread;
use rmem::rdma::compute_node::ComputeNode;
use rmem::rdma::mem_node::MemoryNode;

/// Compute-node role: dial every memory node, then run one worker per
/// configured thread.  Thread 0 allocates a 1024-element u64 array,
/// publishes it as the root, writes each slot with its index, and reads
/// everything back before the whole job meets at the barrier.
///
/// A node whose id falls in both role ranges also stands up the memory
/// role here: its segments are published from this process and reached
/// over loopback lanes, with the registration records handed across
/// in-process instead of over the wire.
#[derive(Parser)]
struct Args {
    #[command(flatten)]
    cfg: Config,

    /// `id=address` for every node in the job, comma separated.
    #[arg(long, value_delimiter = ',')]
    peers: Vec<String>,
}

fn parse_peers(specs: &[String]) -> Vec<MachineInfo> {
    specs
        .iter()
        .map(|s| {
            let (id, addr) = s.split_once('=').expect("peer spec must be id=address");
            MachineInfo {
                id: id.parse().expect("peer id must be numeric"),
                address: addr.to_string(),
            }
        })
        .collect()
}

const ARRAY_LEN: usize = 1024;

fn worker(cn: Arc<ComputeNode>, cfg: Arc<Config>) {
    let mut ct = ComputeThread::new(&cn, &cfg);
    if cfg.node_id == cfg.first_cn_id && ct.get_tid() == 0 {
        let array = ct.allocate::<u64>(ARRAY_LEN);
        for i in 0..ARRAY_LEN {
            ct.write(array + i, &(i as u64));
        }
        for i in 0..ARRAY_LEN {
            let got: u64 = ct.read(array + i);
            assert_eq!(got, i as u64);
        }
        ct.set_root(array);
        info!("array round-trip at {} verified", array);
    }
    ct.arrive_barrier(cfg.total_threads());
    let m = ct.metrics;
    info!(
        "thread {} done: {} reads / {} writes / {} faa / {} cas",
        ct.get_tid(),
        m.read.ops,
        m.write.ops,
        m.faa,
        m.cas
    );
}

fn main() {
    init_log();
    let args = Args::parse();
    let cfg = Arc::new(args.cfg);
    let peers = parse_peers(&args.peers);

    if !cfg.is_cn(cfg.node_id) {
        panic!("node {} is not in the compute-node id range", cfg.node_id);
    }
    let address = peers
        .iter()
        .find(|p| p.id == cfg.node_id)
        .map(|p| p.address.clone())
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let memnodes: Vec<MachineInfo> = peers
        .iter()
        .filter(|p| cfg.is_mn(p.id))
        .cloned()
        .collect();

    let self_info = MachineInfo {
        id: cfg.node_id,
        address,
    };

    // Memory role first, so the segments exist before any lane opens.
    let mut mn = if cfg.is_mn(cfg.node_id) {
        Some(MemoryNode::new(self_info.clone(), &cfg))
    } else {
        None
    };

    let mut cn = ComputeNode::new(self_info, &cfg);
    // A co-located memory node cannot ship its rkeys to this process over
    // the wire; they are injected here before the remote dials start.
    if let Some(mn) = &mn {
        cn.connect_local(&memnodes, &mn.get_local_rkeys());
    }
    cn.connect_remote(&memnodes);
    if let Some(mn) = mn.as_mut() {
        mn.init_done();
    }
    let cn = Arc::new(cn);

    let handles: Vec<_> = (0..cfg.cn_threads)
        .map(|_| {
            let cn = cn.clone();
            let cfg = cfg.clone();
            std::thread::spawn(move || worker(cn, cfg))
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    info!("compute node {} done", cfg.node_id);
    // The memory role, if any, is dropped last; its teardown blocks until
    // every compute thread in the job has bumped the control flag.
}
