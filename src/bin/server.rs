use std::sync::Arc;

use clap::Parser;
use log::info;

use rmem::common::logs::init_log;
use rmem::common::MachineInfo;
use rmem::config::Config;
use rmem::rdma::mem_node::MemoryNode;

/// Memory-only node: publish segments, accept every expected lane, then
/// hold the memory until the whole job's compute threads have shut down.
/// A node that also computes runs `client` instead, which stands up both
/// roles in one process.
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

fn main() {
    init_log();
    let args = Args::parse();
    let cfg = Arc::new(args.cfg);
    let peers = parse_peers(&args.peers);

    if !cfg.is_mn(cfg.node_id) {
        panic!("node {} is not in the memory-node id range", cfg.node_id);
    }
    if cfg.is_cn(cfg.node_id) {
        panic!(
            "node {} is also a compute node; run the client, which hosts both roles",
            cfg.node_id
        );
    }
    let address = peers
        .iter()
        .find(|p| p.id == cfg.node_id)
        .map(|p| p.address.clone())
        .unwrap_or_else(|| "0.0.0.0".to_string());

    let mut mn = MemoryNode::new(
        MachineInfo {
            id: cfg.node_id,
            address,
        },
        &cfg,
    );
    mn.init_done();
    info!("all lanes connected; serving until the job shuts down");
    // Dropping the node blocks until every compute thread has bumped the
    // control flag.
}
