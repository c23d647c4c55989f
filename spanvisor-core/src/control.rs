//! Control plane: the per-CPU service loop, vCPU wakeup, orderly shutdown
//! and the cluster-wide panic path.

use core::sync::atomic::Ordering;

use crate::cluster::ClusterError;
use crate::dispatch;
use crate::msg::{
    CpuWakeupAckHdr, CpuWakeupHdr, EmptyHdr, HandlerResult, MsgRegistry, MsgType, PanicHdr,
    SetupDoneHdr, NODEID_UNKNOWN,
};
use crate::node::{Node, NodeState};
use crate::pcpu::RecvMsg;
use crate::vsm;

/// Per-CPU service loop entered once the cluster is running. The platform
/// resumes the local vCPU between rounds; the core's part is draining the
/// inbound queue and reacting to state changes.
pub fn run(node: &Node) -> ! {
    loop {
        dispatch::do_recv_waitqueue(node);
        if node.state() == NodeState::ShuttingDown {
            shutdown_local(node);
        }
        node.cpu.wait_hint();
    }
}

/// Bring a vCPU online, crossing the wire when it lives on a peer.
pub fn vcpu_wakeup(node: &Node, vcpuid: u32) -> Result<(), ClusterError> {
    let owner = node
        .cluster
        .vcpu_owner(vcpuid)
        .ok_or(ClusterError::UnknownPeer)?;

    if owner == node.cluster.my_nodeid() {
        let idx = local_vcpu_index(node, vcpuid).ok_or(ClusterError::UnknownPeer)?;
        node.pcpu(idx).set_online(true);
        return Ok(());
    }

    let req = node.msg_init_to_nodeid(owner, MsgType::CpuWakeup, &CpuWakeupHdr { vcpuid }, None);
    node.send_msg(&req).ok();
    let ack = node.recv_reply(&req);
    let ack_hdr: CpuWakeupAckHdr = ack.decode();
    if ack_hdr.status != 0 {
        cluster_panic(node, "vcpu wakeup failed");
    }
    Ok(())
}

/// Idle-wait until the local vCPU slot is marked online.
pub fn wait_for_vcpu_online(node: &Node, cpu: usize) {
    node.idle_wait(|| node.pcpu(cpu).is_online(), None, "vcpu online");
}

fn local_vcpu_index(node: &Node, vcpuid: u32) -> Option<usize> {
    let me = node.cluster.me();
    me.vcpus[..me.nvcpu as usize]
        .iter()
        .position(|&v| v as u32 == vcpuid)
}

/// Ask the whole cluster to stop. The caller flushes its own slice first,
/// while every peer is still serving; recipients drain through
/// `shutdown_local` on their next service round.
pub fn request_shutdown(node: &Node) {
    crate::log!("[ctl] shutdown requested");
    vsm::reclaim_local_pages(node);
    *node.shutdown_from.lock() = None;
    let msg = node.broadcast_msg_init(MsgType::Shutdown, &EmptyHdr, None);
    node.send_msg(&msg).ok();
    node.set_state(NodeState::ShuttingDown);
}

/// Stop this node: park the vCPUs, pull our memory slice home so dirty
/// pages survive on their owner of record, acknowledge, halt. The initiator
/// already flushed in `request_shutdown` and halts last, once every peer
/// has acknowledged.
pub fn shutdown_local(node: &Node) -> ! {
    crate::log!("[ctl] shutting down");

    for cpu in 0..node.ncpus() {
        node.pcpu(cpu).set_online(false);
    }

    let initiator = *node.shutdown_from.lock();
    match initiator {
        Some(mac) => {
            vsm::reclaim_local_pages(node);
            let ack = node.msg_init(mac, MsgType::SetupDone, &SetupDoneHdr { status: 0 }, None);
            node.send_msg(&ack).ok();
        }
        None => {
            let peers = node.cluster.nr_nodes().saturating_sub(1);
            node.idle_wait(
                || node.shutdown_acks.load(Ordering::Acquire) >= peers,
                Some(node.cfg.reply_timeout_ms),
                "shutdown acks",
            );
        }
    }

    node.set_state(NodeState::Halted);
    node.cpu.halt()
}

/// Unrecoverable failure: tell every peer, then stop this node. PANIC
/// bypasses all cleanup.
pub fn cluster_panic(node: &Node, tag: &str) -> ! {
    crate::log!(
        "[panic] node {}: {}",
        node.cluster.my_nodeid_or(NODEID_UNKNOWN),
        tag
    );

    if node.state() != NodeState::Halted {
        node.set_state(NodeState::Halted);
        let hdr = PanicHdr::with_tag(node.cluster.my_nodeid_or(NODEID_UNKNOWN), tag);
        let msg = node.broadcast_msg_init(MsgType::Panic, &hdr, None);
        let _ = node.send_msg(&msg);
    }

    node.cpu.halt()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub fn register_handlers(reg: &MsgRegistry) {
    reg.register_handler(MsgType::CpuWakeup, recv_cpu_wakeup, false);
    reg.register_handler(MsgType::Shutdown, recv_shutdown, false);
    reg.register_handler(MsgType::Panic, recv_panic, false);
}

fn recv_cpu_wakeup(node: &Node, msg: &RecvMsg) -> HandlerResult {
    let hdr: CpuWakeupHdr = msg.decode();
    match local_vcpu_index(node, hdr.vcpuid) {
        Some(idx) if idx < node.ncpus() => {
            crate::log!("[ctl] vcpu {} wakeup", hdr.vcpuid);
            node.pcpu(idx).set_online(true);
            node.pcpu(idx).wakeup.store(true, Ordering::Release);
            node.cpu.send_ipi(idx);
            node.msg_reply(
                msg,
                MsgType::CpuWakeupAck,
                &CpuWakeupAckHdr { status: 0 },
                None,
            )
            .ok();
            HandlerResult::Done
        }
        _ => cluster_panic(node, "wakeup for foreign vcpu"),
    }
}

fn recv_shutdown(node: &Node, msg: &RecvMsg) -> HandlerResult {
    crate::log!("[ctl] shutdown from node {}", msg.src_nodeid);
    *node.shutdown_from.lock() = Some(msg.src_mac);
    node.set_state(NodeState::ShuttingDown);
    HandlerResult::Done
}

fn recv_panic(node: &Node, msg: &RecvMsg) -> HandlerResult {
    let hdr: PanicHdr = msg.decode();
    crate::log!("[panic] node {} reports: {}", hdr.nodeid, hdr.tag_str());
    node.set_state(NodeState::Halted);
    node.cpu.halt()
}
