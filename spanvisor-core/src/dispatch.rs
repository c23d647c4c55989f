//! Receive path: frame intake from IRQ context and the deferred ("lazy
//! IRQ") per-CPU dispatch loop.
//!
//! Handlers may themselves send a request and wait for its reply. To keep
//! that re-entrancy stack-bounded, a CPU inside the dispatcher only ever
//! consumes replies while waiting; freshly arrived requests stay queued
//! until the current handler returns and the dispatch loop picks them up.

use heapless::Vec as HVec;
use spanvisor_hal::page::PageBox;

use crate::control;
use crate::msg::{HandlerResult, MsgType, COMMON_HDR_SIZE, ETH_HDR_SIZE, MSG_ETH_MAGIC};
use crate::node::Node;
use crate::pcpu::RecvMsg;

/// Frame intake, called from NIC IRQ context for every frame addressed to
/// us or broadcast. Copies the message out of the NIC buffer, then routes:
/// replies go to the CPU named by the connection id (waking it with an IPI
/// when it is not the current one), everything else to the current CPU.
pub fn recv_frame(node: &Node, frame: &[u8], body: Option<&[u8]>) {
    if frame.len() < ETH_HDR_SIZE || frame[12] != MSG_ETH_MAGIC {
        // Not cluster traffic; the link is dedicated, so just drop it.
        return;
    }

    let mtype = match MsgType::from_u8(frame[13]) {
        Some(t) if t != MsgType::None => t,
        _ => control::cluster_panic(node, "unknown msg type"),
    };
    let hdr_size = match node.registry.hdr_size(mtype) {
        Some(s) => s,
        None => control::cluster_panic(node, "unregistered msg type"),
    };
    if frame.len() < ETH_HDR_SIZE + hdr_size {
        control::cluster_panic(node, "truncated msg");
    }

    let mut src_mac = [0u8; 6];
    src_mac.copy_from_slice(&frame[6..12]);
    let src_nodeid = frame[ETH_HDR_SIZE];
    let conid = u32::from_le_bytes([
        frame[ETH_HDR_SIZE + 2],
        frame[ETH_HDR_SIZE + 3],
        frame[ETH_HDR_SIZE + 4],
        frame[ETH_HDR_SIZE + 5],
    ]);

    let mut hdr = HVec::new();
    hdr.extend_from_slice(&frame[ETH_HDR_SIZE + COMMON_HDR_SIZE..ETH_HDR_SIZE + hdr_size])
        .ok();

    let msg = RecvMsg {
        src_mac,
        mtype,
        src_nodeid,
        conid,
        hdr,
        body: body.map(PageBox::from_bytes),
        body_len: body.map_or(0, <[u8]>::len),
    };

    node.monitor.count_recv(mtype);

    if mtype.is_reply() {
        let cpu = msg.dest_cpu();
        if cpu >= node.ncpus() {
            control::cluster_panic(node, "reply routed to bad cpu");
        }
        node.pcpu(cpu).recv_waitq.enqueue(msg);
        if cpu != node.cpu.cpu_id() {
            node.cpu.send_ipi(cpu);
        }
    } else {
        node.mycpu().recv_waitq.enqueue(msg);
    }
}

/// Drain the current CPU's inbound queue and run handlers.
///
/// Nested invocation is forbidden: a handler that needs its reply drains
/// replies through `drain_replies` instead. Messages a handler defers (page
/// transition in flight) are pushed back and retried on the next call.
pub fn do_recv_waitqueue(node: &Node) {
    let pcpu = node.mycpu();

    if pcpu.in_lazyirq() {
        control::cluster_panic(node, "nested dispatch");
    }

    node.cpu.local_irq_disable();
    pcpu.lazyirq_enter();

    loop {
        let batch = pcpu.recv_waitq.drain();
        if batch.is_empty() {
            break;
        }

        node.cpu.local_irq_enable();
        let mut progressed = false;
        for m in batch {
            match deliver(node, m) {
                Delivery::Handled => progressed = true,
                Delivery::Deferred(m) => pcpu.recv_waitq.enqueue(m),
            }
        }
        node.cpu.local_irq_disable();

        // Only deferred messages remain: leave them for a later round
        // instead of spinning on them here.
        if !progressed {
            break;
        }
    }

    pcpu.lazyirq_exit();
    node.cpu.local_irq_enable();
}

/// Consume queued replies for the current CPU without touching requests.
/// This is the only dispatch a CPU performs while inside a handler.
pub fn drain_replies(node: &Node) {
    while let Some(m) = node.mycpu().recv_waitq.take_reply() {
        reply_rx(node, m);
    }
}

enum Delivery {
    Handled,
    Deferred(RecvMsg),
}

fn deliver(node: &Node, msg: RecvMsg) -> Delivery {
    crate::log!(
        "[msg] handle {} conid={:#x} from node{}",
        msg.mtype.name(),
        msg.conid,
        msg.src_nodeid
    );

    match node.registry.handler(msg.mtype) {
        Some((handler, node0_only)) => {
            if node0_only && node.cluster.my_nodeid_or(u8::MAX) != 0 {
                control::cluster_panic(node, "node0-only msg on sub-node");
            }
            match handler(node, &msg) {
                HandlerResult::Done => Delivery::Handled,
                HandlerResult::Requeue => Delivery::Deferred(msg),
            }
        }
        None if msg.mtype.is_reply() => {
            reply_rx(node, msg);
            Delivery::Handled
        }
        None => control::cluster_panic(node, "unhandled msg type"),
    }
}

/// Install `msg` as the reply to the current CPU's outstanding request.
pub(crate) fn reply_rx(node: &Node, msg: RecvMsg) {
    let slot = node.mycpu().waiting_reply.lock().take();
    match slot {
        Some(slot) => {
            if slot.conid() != msg.conid {
                control::cluster_panic(node, "reply pairing violation");
            }
            slot.complete(msg);
        }
        None => control::cluster_panic(node, "reply without request"),
    }
}
