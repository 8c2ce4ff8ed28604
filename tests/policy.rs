use std::sync::Arc;

use clap::Parser;
use rmem::config::Config;
use rmem::framework::policy::{LanePolicy, MnAlloc, QpSched, SegPolicy};

fn config(args: &[&str]) -> Arc<Config> {
    let mut argv = vec![
        "rmem",
        "--node-id",
        "2",
        "--first-mn-id",
        "0",
        "--last-mn-id",
        "1",
        "--first-cn-id",
        "2",
        "--last-cn-id",
        "3",
        "--mn-port",
        "7471",
        "--cn-threads",
        "4",
        "--qp-lanes",
        "4",
        "--segs-per-mn",
        "2",
    ];
    argv.extend_from_slice(args);
    Arc::new(Config::try_parse_from(argv).unwrap())
}

#[test]
fn lane_policy_parsing() {
    assert_eq!(LanePolicy::from_str("MOD"), LanePolicy::Mod);
    assert_eq!(LanePolicy::from_str("RR"), LanePolicy::Rr);
    assert_eq!(LanePolicy::from_str("RAND"), LanePolicy::Rand);
    assert_eq!(LanePolicy::from_str("ONE_TO_ONE"), LanePolicy::OneToOne);
}

#[test]
#[should_panic]
fn lane_policy_rejects_unknown_string() {
    LanePolicy::from_str("FASTEST");
}

#[test]
fn mod_lane_is_thread_id_mod_lanes() {
    let cfg = config(&[]);
    let mut sched = QpSched::new(&cfg);
    sched.set_policy(LanePolicy::Mod, 6);
    assert_eq!(sched.lane_idx(0), 6 % 4);
    assert_eq!(sched.lane_idx(1), 6 % 4);
}

#[test]
fn one_to_one_lane_is_thread_id() {
    let cfg = config(&[]);
    let mut sched = QpSched::new(&cfg);
    sched.set_policy(LanePolicy::OneToOne, 3);
    assert_eq!(sched.lane_idx(0), 3);
}

#[test]
#[should_panic]
fn one_to_one_requires_enough_lanes() {
    let cfg = config(&["--qp-lanes", "2"]);
    let mut sched = QpSched::new(&cfg);
    sched.set_policy(LanePolicy::OneToOne, 0);
}

#[test]
fn rr_lane_cycles_independently_per_peer() {
    let cfg = config(&[]);
    let mut sched = QpSched::new(&cfg);
    sched.set_policy(LanePolicy::Rr, 0);
    let first = sched.lane_idx(0);
    let mut seen = vec![first];
    for _ in 0..3 {
        let next = sched.lane_idx(0);
        assert_eq!(next, (seen.last().unwrap() + 1) % 4);
        seen.push(next);
    }
    // Peer 1 advances its own cursor, then peer 0 resumes where it left.
    sched.lane_idx(1);
    assert_eq!(sched.lane_idx(0), (first + 4) % 4);
}

#[test]
fn rand_lane_stays_in_range() {
    let cfg = config(&[]);
    let mut sched = QpSched::new(&cfg);
    sched.set_policy(LanePolicy::Rand, 0);
    for _ in 0..64 {
        assert!(sched.lane_idx(0) < 4);
    }
}

#[test]
fn seg_policy_parsing() {
    assert_eq!(SegPolicy::from_str("RAND"), SegPolicy::Rand);
    assert_eq!(SegPolicy::from_str("GLOBAL-RR"), SegPolicy::GlobalRr);
    assert_eq!(SegPolicy::from_str("GLOBAL-MOD"), SegPolicy::GlobalMod);
    assert_eq!(SegPolicy::from_str("LOCAL-RR"), SegPolicy::LocalRr);
    assert_eq!(SegPolicy::from_str("LOCAL-MOD"), SegPolicy::LocalMod);
}

#[test]
#[should_panic]
fn seg_policy_rejects_unknown_string() {
    SegPolicy::from_str("GLOBAL");
}

#[test]
fn global_mod_pins_thread_to_one_segment() {
    let cfg = config(&[]);
    // node 2 is the first compute node, so thread_uid(1) == 1 → segment 1
    // of memory node 0 with 2 segments per node.
    let mut alloc = MnAlloc::new(&cfg);
    alloc.set_policy(SegPolicy::GlobalMod, &cfg, 1);
    assert_eq!(alloc.get_mn_seg(), (0, 1));
    assert_eq!(alloc.get_mn_seg(), (0, 1));

    // thread_uid 3 lands on memory node 1, segment 1.
    let mut alloc = MnAlloc::new(&cfg);
    alloc.set_policy(SegPolicy::GlobalMod, &cfg, 3);
    assert_eq!(alloc.get_mn_seg(), (1, 1));
}

#[test]
fn global_rr_walks_every_segment_of_every_node() {
    let cfg = config(&[]);
    let mut alloc = MnAlloc::new(&cfg);
    alloc.set_policy(SegPolicy::GlobalRr, &cfg, 0);
    let mut seen = std::collections::HashSet::new();
    for _ in 0..4 {
        seen.insert(alloc.get_mn_seg());
    }
    // 2 nodes × 2 segments: a full cycle visits each exactly once.
    assert_eq!(seen.len(), 4);
    for (mn, seg) in seen {
        assert!(mn <= 1);
        assert!(seg <= 1);
    }
}

#[test]
fn rand_seg_stays_in_range() {
    let cfg = config(&[]);
    let mut alloc = MnAlloc::new(&cfg);
    alloc.set_policy(SegPolicy::Rand, &cfg, 0);
    for _ in 0..64 {
        let (mn, seg) = alloc.get_mn_seg();
        assert!(mn <= 1);
        assert!(seg <= 1);
    }
}

#[test]
#[should_panic]
fn local_policies_require_colocated_roles() {
    let cfg = config(&[]);
    let mut alloc = MnAlloc::new(&cfg);
    alloc.set_policy(SegPolicy::LocalMod, &cfg, 0);
}

#[test]
fn local_mod_targets_the_owning_node() {
    let argv = [
        "rmem",
        "--node-id",
        "1",
        "--first-mn-id",
        "0",
        "--last-mn-id",
        "1",
        "--first-cn-id",
        "0",
        "--last-cn-id",
        "1",
        "--mn-port",
        "7471",
        "--cn-threads",
        "2",
        "--segs-per-mn",
        "2",
    ];
    let cfg = Arc::new(Config::try_parse_from(argv).unwrap());
    let mut alloc = MnAlloc::new(&cfg);
    alloc.set_policy(SegPolicy::LocalMod, &cfg, 1);
    assert_eq!(alloc.get_mn_seg(), (1, 1));
    assert_eq!(alloc.get_mn_seg(), (1, 1));
}
