//! Cluster-formation integration tests: discovery, identity assignment and
//! table replication across in-process nodes.

extern crate std;

mod common;

use common::{bring_up, build_node, mac, vm_desc, Fabric, MIB};
use spanvisor_core::cluster::NodeStatus;
use spanvisor_core::config::NodeConfig;
use spanvisor_core::node::NodeState;
use spanvisor_hal::memory::MemRange;

fn node0_cfg(expected: u8) -> NodeConfig {
    NodeConfig {
        expected_nodes: expected,
        nvcpu: 1,
        alloc_bytes: 128 * MIB,
        vm_desc: Some(vm_desc()),
        ..NodeConfig::default()
    }
}

fn peer_cfg(expected: u8) -> NodeConfig {
    NodeConfig {
        expected_nodes: expected,
        nvcpu: 1,
        alloc_bytes: 128 * MIB,
        vm_desc: None,
        ..NodeConfig::default()
    }
}

#[test]
fn two_node_bring_up() {
    let fabric = Fabric::new();
    let n0 = build_node(&fabric, mac(0), node0_cfg(2), 1);
    let n1 = build_node(&fabric, mac(1), peer_cfg(2), 1);

    bring_up(&[n0.node, n1.node]);

    for n in [&n0, &n1] {
        assert_eq!(n.node.state(), NodeState::Running);
        assert_eq!(n.node.cluster.nr_nodes(), 2);
        assert_eq!(n.node.cluster.nr_vcpus(), 2);
    }

    let t0 = n0.node.cluster.table_snapshot();
    let t1 = n1.node.cluster.table_snapshot();
    assert_eq!(t0, t1, "replicated tables must be identical");

    assert_eq!(t0[0].mac, mac(0));
    assert_eq!(t0[1].mac, mac(1));
    assert_eq!(t0[0].mem, MemRange::new(0x4000_0000, 128 * MIB));
    assert_eq!(t0[1].mem, MemRange::new(0x4800_0000, 128 * MIB));
    assert!(t0.iter().all(|n| n.status == NodeStatus::Online));

    assert_eq!(n0.node.cluster.my_nodeid(), 0);
    assert_eq!(n1.node.cluster.my_nodeid(), 1);
}

#[test]
fn three_node_bring_up_assigns_dense_vcpus() {
    let fabric = Fabric::new();
    let mut cfg1 = peer_cfg(3);
    cfg1.nvcpu = 2;
    let n0 = build_node(&fabric, mac(0), node0_cfg(3), 1);
    let n1 = build_node(&fabric, mac(1), cfg1, 2);
    let n2 = build_node(&fabric, mac(2), peer_cfg(3), 1);

    bring_up(&[n0.node, n1.node, n2.node]);

    let table = n0.node.cluster.table_snapshot();
    assert_eq!(table, n1.node.cluster.table_snapshot());
    assert_eq!(table, n2.node.cluster.table_snapshot());

    assert_eq!(n0.node.cluster.nr_vcpus(), 4);

    // vCPU ids are dense and each belongs to exactly one node.
    let mut seen = Vec::new();
    for n in &table {
        seen.extend_from_slice(&n.vcpus[..n.nvcpu as usize]);
    }
    seen.sort_unstable();
    assert_eq!(seen, [0, 1, 2, 3]);

    // Memory slices are contiguous and disjoint.
    for w in table.windows(2) {
        assert_eq!(w[0].mem.end(), w[1].mem.start);
        assert!(!w[0].mem.overlaps(&w[1].mem));
    }
}

#[test]
fn single_node_cluster_comes_up_alone() {
    let fabric = Fabric::new();
    let n0 = build_node(&fabric, mac(0), node0_cfg(1), 1);

    bring_up(&[n0.node]);

    assert_eq!(n0.node.state(), NodeState::Running);
    assert_eq!(n0.node.cluster.nr_nodes(), 1);
    let table = n0.node.cluster.table_snapshot();
    assert_eq!(table[0].status, NodeStatus::Online);
    // vCPU 0 boots hot on the bootstrap node.
    assert!(n0.node.pcpu(0).is_online());
}
