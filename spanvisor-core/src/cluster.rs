//! Cluster formation: node discovery, identity assignment, and the
//! replicated cluster table.
//!
//! The bootstrap node (the one configured with a VM descriptor) assigns
//! node ids, vCPU ids and guest-RAM slices as peers answer its discovery
//! broadcast, then replicates the finished table to everyone. After the
//! boot signal the table is frozen and bit-exact identical on every node.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use spanvisor_hal::memory::{GuestPhysAddr, MemRange, PAGE_SIZE};
use spanvisor_hal::nic::MacAddr;
use spin::{Mutex, RwLock};

use crate::control;
use crate::msg::{
    ClusterInfoHdr, EmptyHdr, HandlerResult, InitAckHdr, MsgRegistry, MsgType, SetupDoneHdr,
};
use crate::node::{Node, NodeState};
use crate::pcpu::RecvMsg;

pub const NODE_MAX: usize = 64;
pub const VCPU_PER_NODE_MAX: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterError {
    TooManyNodes,
    TooManyVcpus,
    UnknownPeer,
    BadTable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeStatus {
    #[default]
    None = 0,
    Ack = 1,
    Online = 2,
}

/// One row of the replicated cluster table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub nodeid: u8,
    pub mac: MacAddr,
    pub nvcpu: u8,
    pub vcpus: [u8; VCPU_PER_NODE_MAX],
    pub mem: MemRange,
    pub status: NodeStatus,
}

pub struct Cluster {
    table: RwLock<[ClusterNode; NODE_MAX]>,
    nr_nodes: AtomicUsize,
    nr_vcpus: AtomicUsize,
    online_map: AtomicU64,
    active_map: AtomicU64,
    my_nodeid: AtomicUsize,
    acked: AtomicBool,
    /// Next free guest-physical address when carving node slices (bootstrap
    /// node only).
    ram_next: Mutex<GuestPhysAddr>,
}

const NODEID_UNSET: usize = usize::MAX;

impl Cluster {
    pub fn new(ram_start: GuestPhysAddr) -> Self {
        Self {
            table: RwLock::new([ClusterNode::default(); NODE_MAX]),
            nr_nodes: AtomicUsize::new(0),
            nr_vcpus: AtomicUsize::new(0),
            online_map: AtomicU64::new(0),
            active_map: AtomicU64::new(0),
            my_nodeid: AtomicUsize::new(NODEID_UNSET),
            acked: AtomicBool::new(false),
            ram_next: Mutex::new(ram_start),
        }
    }

    pub fn nr_nodes(&self) -> usize {
        self.nr_nodes.load(Ordering::Acquire)
    }

    pub fn nr_vcpus(&self) -> usize {
        self.nr_vcpus.load(Ordering::Acquire)
    }

    pub fn acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }

    pub fn my_nodeid(&self) -> u8 {
        let id = self.my_nodeid.load(Ordering::Acquire);
        debug_assert!(id != NODEID_UNSET);
        id as u8
    }

    pub fn my_nodeid_or(&self, default: u8) -> u8 {
        match self.my_nodeid.load(Ordering::Acquire) {
            NODEID_UNSET => default,
            id => id as u8,
        }
    }

    pub fn node(&self, nodeid: u8) -> Option<ClusterNode> {
        if (nodeid as usize) < self.nr_nodes() {
            Some(self.table.read()[nodeid as usize])
        } else {
            None
        }
    }

    pub fn me(&self) -> ClusterNode {
        self.table.read()[self.my_nodeid() as usize]
    }

    pub fn mac_of(&self, nodeid: u8) -> Option<MacAddr> {
        self.node(nodeid).map(|n| n.mac)
    }

    /// Home of a guest-physical address: the node whose configured slice
    /// contains it.
    pub fn home_of(&self, ipa: GuestPhysAddr) -> Option<u8> {
        let table = self.table.read();
        table[..self.nr_nodes()]
            .iter()
            .find(|n| n.mem.contains(ipa))
            .map(|n| n.nodeid)
    }

    /// Node hosting a given vCPU.
    pub fn vcpu_owner(&self, vcpuid: u32) -> Option<u8> {
        let table = self.table.read();
        table[..self.nr_nodes()]
            .iter()
            .find(|n| n.vcpus[..n.nvcpu as usize].contains(&(vcpuid as u8)))
            .map(|n| n.nodeid)
    }

    pub fn table_snapshot(&self) -> Vec<ClusterNode> {
        let table = self.table.read();
        table[..self.nr_nodes()].to_vec()
    }

    pub fn set_online(&self, nodeid: u8) {
        self.online_map.fetch_or(1 << nodeid, Ordering::AcqRel);
    }

    pub fn set_active(&self, nodeid: u8) {
        self.active_map.fetch_or(1 << nodeid, Ordering::AcqRel);
    }

    pub fn active_map(&self) -> u64 {
        self.active_map.load(Ordering::Acquire)
    }

    /// Have all peers (everyone but us) reported setup completion?
    pub fn all_peers_active(&self, expected_nodes: u8) -> bool {
        let full = match expected_nodes {
            64.. => u64::MAX,
            n => (1u64 << n) - 1,
        };
        let mask = full & !(1 << self.my_nodeid());
        self.active_map() & mask == mask
    }

    /// Record a peer (or ourselves) during discovery: allocate its node id,
    /// vCPU ids and guest-RAM slice. Bootstrap node only.
    pub fn ack_node(
        &self,
        mac: MacAddr,
        nvcpu: u8,
        allocated: u64,
    ) -> Result<u8, ClusterError> {
        if nvcpu as usize > VCPU_PER_NODE_MAX {
            return Err(ClusterError::TooManyVcpus);
        }

        let mut table = self.table.write();

        let nodeid = self.nr_nodes.load(Ordering::Acquire);
        if nodeid >= NODE_MAX {
            return Err(ClusterError::TooManyNodes);
        }

        let mut vcpus = [0u8; VCPU_PER_NODE_MAX];
        let vcpu_base = self.nr_vcpus.load(Ordering::Acquire);
        for (i, v) in vcpus.iter_mut().take(nvcpu as usize).enumerate() {
            *v = (vcpu_base + i) as u8;
        }

        let mem = {
            let mut ram_next = self.ram_next.lock();
            let start = *ram_next;
            *ram_next += allocated;
            MemRange::new(start, allocated)
        };

        table[nodeid] = ClusterNode {
            nodeid: nodeid as u8,
            mac,
            nvcpu,
            vcpus,
            mem,
            status: NodeStatus::Ack,
        };

        self.nr_vcpus
            .store(vcpu_base + nvcpu as usize, Ordering::Release);
        self.nr_nodes.store(nodeid + 1, Ordering::Release);
        self.set_online(nodeid as u8);

        Ok(nodeid as u8)
    }

    /// Adopt the table broadcast by the bootstrap node and locate ourselves
    /// in it by MAC address.
    pub fn install_table(
        &self,
        nnodes: u8,
        nvcpus: u8,
        nodes: &[ClusterNode],
        my_mac: MacAddr,
    ) -> Result<u8, ClusterError> {
        if nodes.len() != nnodes as usize || nnodes as usize > NODE_MAX {
            return Err(ClusterError::BadTable);
        }

        {
            let mut table = self.table.write();
            for (slot, n) in table.iter_mut().zip(nodes.iter()) {
                *slot = *n;
            }
        }
        self.nr_nodes.store(nnodes as usize, Ordering::Release);
        self.nr_vcpus.store(nvcpus as usize, Ordering::Release);
        self.set_online(0);
        self.set_active(0);

        let me = nodes
            .iter()
            .find(|n| n.mac == my_mac)
            .ok_or(ClusterError::UnknownPeer)?;
        self.my_nodeid.store(me.nodeid as usize, Ordering::Release);
        self.acked.store(true, Ordering::Release);
        Ok(me.nodeid)
    }

    pub fn set_status(&self, nodeid: u8, status: NodeStatus) {
        self.table.write()[nodeid as usize].status = status;
    }

    /// Freeze the table with every member online.
    pub fn mark_all_online(&self) {
        let mut table = self.table.write();
        let nr = self.nr_nodes.load(Ordering::Acquire);
        for n in table[..nr].iter_mut() {
            n.status = NodeStatus::Online;
        }
    }
}

fn log_dump(node: &Node) {
    crate::log!(
        "[cluster] nr nodes: {} nr vcpus: {}",
        node.cluster.nr_nodes(),
        node.cluster.nr_vcpus()
    );
    for n in node.cluster.table_snapshot() {
        crate::log!(
            "[cluster] node {}: {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x} nvcpu {} mem {:#x}+{:#x}",
            n.nodeid,
            n.mac[0],
            n.mac[1],
            n.mac[2],
            n.mac[3],
            n.mac[4],
            n.mac[5],
            n.nvcpu,
            n.mem.start,
            n.mem.size
        );
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Bring this node into the cluster. The bootstrap node drives discovery;
/// peers answer it. Returns with the node in the `Running` state and the
/// cluster table frozen.
pub fn cluster_init(node: &Node) {
    node.set_state(NodeState::Booting);
    if node.cfg.is_bootstrap() {
        node0_init(node);
    } else {
        subnode_init(node);
    }
    node.set_state(NodeState::Running);
    log_dump(node);
}

fn node0_init(node: &Node) {
    let cluster = &node.cluster;
    cluster.my_nodeid.store(0, Ordering::Release);

    // Node 0 acks itself first; peers follow in INIT_ACK arrival order.
    if let Err(_e) = cluster.ack_node(node.nic.mac(), node.cfg.nvcpu, node.cfg.alloc_bytes) {
        control::cluster_panic(node, "self ack failed");
    }

    let expected = node.cfg.expected_nodes;
    if expected > 1 {
        let msg = node.broadcast_msg_init(MsgType::Init, &EmptyHdr, None);
        node.send_msg(&msg).ok();

        node.idle_wait(
            || cluster.nr_nodes() == expected as usize,
            Some(node.cfg.reply_timeout_ms),
            "init ack quorum",
        );

        broadcast_cluster_info(node);

        node.idle_wait(
            || cluster.all_peers_active(expected),
            Some(node.cfg.reply_timeout_ms),
            "peer setup",
        );
    }

    if me_setup(node) != 0 {
        control::cluster_panic(node, "local setup failed");
    }

    cluster.mark_all_online();
    node.set_boot_signaled();

    if expected > 1 {
        let msg = node.broadcast_msg_init(MsgType::BootSig, &EmptyHdr, None);
        node.send_msg(&msg).ok();
    }
}

fn subnode_init(node: &Node) {
    crate::log!("[cluster] waiting for recognition from cluster");

    // INIT and CLUSTER_INFO arrive on the inbound queue; their handlers
    // answer the discovery and adopt the table.
    node.idle_wait(|| node.cluster.acked(), None, "cluster recognition");

    crate::log!("[cluster] node {} initializing", node.cluster.my_nodeid());

    let status = me_setup(node);

    let msg = node.msg_init_to_nodeid(0, MsgType::SetupDone, &SetupDoneHdr { status }, None);
    node.send_msg(&msg).ok();

    if status != 0 {
        control::cluster_panic(node, "local setup failed");
    }

    node.idle_wait(
        || node.boot_signaled(),
        Some(node.cfg.reply_timeout_ms),
        "boot signal",
    );
}

/// Local setup once our identity and memory slice are known: bring up the
/// shared-memory layer over our slice and mark ourselves active.
fn me_setup(node: &Node) -> u8 {
    let me = node.cluster.me();

    node.vsm.node_init(me.mem);

    if node.cfg.is_bootstrap() {
        // vCPU 0 boots hot; everything else waits for a wakeup request.
        node.pcpu(0).set_online(true);
    }

    node.cluster.set_active(me.nodeid);
    0
}

fn broadcast_cluster_info(node: &Node) {
    log_dump(node);

    let snapshot = node.cluster.table_snapshot();
    let body = match postcard::to_allocvec(&snapshot) {
        Ok(b) if b.len() <= PAGE_SIZE => b,
        _ => control::cluster_panic(node, "cluster table encode"),
    };

    let hdr = ClusterInfoHdr {
        nnodes: node.cluster.nr_nodes() as u8,
        nvcpus: node.cluster.nr_vcpus() as u8,
    };
    let msg = node.broadcast_msg_init(MsgType::ClusterInfo, &hdr, Some(&body));
    node.send_msg(&msg).ok();
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub fn register_handlers(reg: &MsgRegistry) {
    reg.register_handler(MsgType::Init, recv_init, false);
    reg.register_handler(MsgType::InitAck, recv_init_ack, true);
    reg.register_handler(MsgType::ClusterInfo, recv_cluster_info, false);
    reg.register_handler(MsgType::SetupDone, recv_setup_done, false);
    reg.register_handler(MsgType::BootSig, recv_boot_sig, false);
}

/// Discovery request from the bootstrap node: answer with our resources.
fn recv_init(node: &Node, msg: &RecvMsg) -> HandlerResult {
    if node.cfg.is_bootstrap() {
        control::cluster_panic(node, "second bootstrap node");
    }

    crate::log!("[cluster] init request, answering with {} vcpus", node.cfg.nvcpu);

    let hdr = InitAckHdr {
        nvcpu: node.cfg.nvcpu,
        allocated: node.cfg.alloc_bytes,
    };
    let ack = node.msg_init(msg.src_mac, MsgType::InitAck, &hdr, None);
    node.send_msg(&ack).ok();
    HandlerResult::Done
}

fn recv_init_ack(node: &Node, msg: &RecvMsg) -> HandlerResult {
    let hdr: InitAckHdr = msg.decode();
    match node.cluster.ack_node(msg.src_mac, hdr.nvcpu, hdr.allocated) {
        Ok(nodeid) => {
            crate::log!(
                "[cluster] acked node {}: {} vcpus {:#x} bytes",
                nodeid,
                hdr.nvcpu,
                hdr.allocated
            );
            HandlerResult::Done
        }
        Err(_) => control::cluster_panic(node, "init ack overflow"),
    }
}

fn recv_cluster_info(node: &Node, msg: &RecvMsg) -> HandlerResult {
    let hdr: ClusterInfoHdr = msg.decode();
    let body = match msg.body_slice() {
        Some(b) => b,
        None => control::cluster_panic(node, "cluster info without table"),
    };
    let nodes: Vec<ClusterNode> = match postcard::from_bytes(body) {
        Ok(n) => n,
        Err(_) => control::cluster_panic(node, "cluster table decode"),
    };

    match node
        .cluster
        .install_table(hdr.nnodes, hdr.nvcpus, &nodes, node.nic.mac())
    {
        Ok(nodeid) => {
            crate::log!("[cluster] I am node {}", nodeid);
            HandlerResult::Done
        }
        Err(_) => control::cluster_panic(node, "not in cluster table"),
    }
}

fn recv_setup_done(node: &Node, msg: &RecvMsg) -> HandlerResult {
    let hdr: SetupDoneHdr = msg.decode();

    if node.state() == NodeState::ShuttingDown {
        // Shutdown acknowledgement toward the initiator.
        node.shutdown_acks.fetch_add(1, Ordering::AcqRel);
        return HandlerResult::Done;
    }

    if node.cluster.my_nodeid_or(u8::MAX) != 0 {
        control::cluster_panic(node, "setup done on sub-node");
    }
    if hdr.status != 0 {
        control::cluster_panic(node, "peer setup failed");
    }

    let peer = msg.src_nodeid;
    node.cluster.set_active(peer);
    node.cluster.set_status(peer, NodeStatus::Online);
    crate::log!("[cluster] node {} ready", peer);
    HandlerResult::Done
}

fn recv_boot_sig(node: &Node, _msg: &RecvMsg) -> HandlerResult {
    node.cluster.mark_all_online();
    node.set_boot_signaled();
    HandlerResult::Done
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_node_carves_disjoint_slices() {
        let cluster = Cluster::new(0x4000_0000);
        let a = cluster.ack_node([0x02, 0, 0, 0, 0, 0], 1, 0x800_0000).unwrap();
        let b = cluster.ack_node([0x02, 0, 0, 0, 0, 1], 2, 0x800_0000).unwrap();
        assert_eq!((a, b), (0, 1));

        let na = cluster.node(0).unwrap();
        let nb = cluster.node(1).unwrap();
        assert_eq!(na.mem, MemRange::new(0x4000_0000, 0x800_0000));
        assert_eq!(nb.mem, MemRange::new(0x4800_0000, 0x800_0000));
        assert!(!na.mem.overlaps(&nb.mem));
        assert_eq!(na.mem.end(), nb.mem.start);
    }

    #[test]
    fn test_vcpu_ids_dense() {
        let cluster = Cluster::new(0x4000_0000);
        cluster.ack_node([0x02, 0, 0, 0, 0, 0], 2, PAGE_SIZE as u64).unwrap();
        cluster.ack_node([0x02, 0, 0, 0, 0, 1], 3, PAGE_SIZE as u64).unwrap();
        assert_eq!(cluster.nr_vcpus(), 5);
        assert_eq!(cluster.node(0).unwrap().vcpus[..2], [0, 1]);
        assert_eq!(cluster.node(1).unwrap().vcpus[..3], [2, 3, 4]);
        assert_eq!(cluster.vcpu_owner(1), Some(0));
        assert_eq!(cluster.vcpu_owner(4), Some(1));
        assert_eq!(cluster.vcpu_owner(5), None);
    }

    #[test]
    fn test_home_of_uses_static_ranges() {
        let cluster = Cluster::new(0x4000_0000);
        cluster.ack_node([0x02, 0, 0, 0, 0, 0], 1, 0x800_0000).unwrap();
        cluster.ack_node([0x02, 0, 0, 0, 0, 1], 1, 0x800_0000).unwrap();
        assert_eq!(cluster.home_of(0x4000_1000), Some(0));
        assert_eq!(cluster.home_of(0x4800_0000), Some(1));
        assert_eq!(cluster.home_of(0x5000_0000), None);
        assert_eq!(cluster.home_of(0x3fff_f000), None);
    }

    #[test]
    fn test_install_table_locates_self() {
        let origin = Cluster::new(0x4000_0000);
        origin.ack_node([0x02, 0, 0, 0, 0, 0], 1, PAGE_SIZE as u64).unwrap();
        origin.ack_node([0x02, 0, 0, 0, 0, 1], 1, PAGE_SIZE as u64).unwrap();
        let snap = origin.table_snapshot();

        let peer = Cluster::new(0x4000_0000);
        let id = peer
            .install_table(2, 2, &snap, [0x02, 0, 0, 0, 0, 1])
            .unwrap();
        assert_eq!(id, 1);
        assert!(peer.acked());
        assert_eq!(peer.table_snapshot(), snap);

        let stranger = Cluster::new(0x4000_0000);
        assert_eq!(
            stranger.install_table(2, 2, &snap, [0x02, 0, 0, 0, 0, 9]),
            Err(ClusterError::UnknownPeer)
        );
    }

    #[test]
    fn test_table_serde_round_trip() {
        let cluster = Cluster::new(0x4000_0000);
        cluster.ack_node([0x02, 0, 0, 0, 0, 0], 1, 0x800_0000).unwrap();
        cluster.ack_node([0x02, 0, 0, 0, 0, 1], 2, 0x800_0000).unwrap();
        let snap = cluster.table_snapshot();
        let bytes = postcard::to_allocvec(&snap).unwrap();
        assert!(bytes.len() <= PAGE_SIZE);
        let back: Vec<ClusterNode> = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, snap);
    }
}
