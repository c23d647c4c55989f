//! Per-physical-CPU state: inbound message queue, the single waiting-reply
//! slot, and the lazy-IRQ depth counter.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use heapless::Vec as HVec;
use spanvisor_hal::nic::MacAddr;
use spanvisor_hal::page::PageBox;
use spin::Mutex;

use crate::msg::{MsgType, ReplySlot, WireHdr, MSG_HDR_MAX};

/// An owned inbound message. The receive path copies the header (and body,
/// when present) out of the NIC buffer before the dispatch frame returns;
/// ownership then flows queue -> handler -> drop.
pub struct RecvMsg {
    pub src_mac: MacAddr,
    pub mtype: MsgType,
    pub src_nodeid: u8,
    pub conid: u32,
    pub hdr: HVec<u8, MSG_HDR_MAX>,
    pub body: Option<PageBox>,
    pub body_len: usize,
}

impl RecvMsg {
    /// Decode the type-specific header.
    pub fn decode<H: WireHdr>(&self) -> H {
        H::get(&self.hdr)
    }

    pub fn body_slice(&self) -> Option<&[u8]> {
        self.body.as_ref().map(|p| &p.as_slice()[..self.body_len])
    }

    /// CPU index encoded in the connection id's low 3 bits.
    #[inline]
    pub fn dest_cpu(&self) -> usize {
        (self.conid & 0x7) as usize
    }
}

/// IRQ-safe FIFO of owned messages.
pub struct MsgQueue {
    q: Mutex<VecDeque<RecvMsg>>,
}

impl MsgQueue {
    pub fn new() -> Self {
        Self {
            q: Mutex::new(VecDeque::new()),
        }
    }

    pub fn enqueue(&self, msg: RecvMsg) {
        self.q.lock().push_back(msg);
    }

    pub fn is_empty(&self) -> bool {
        self.q.lock().is_empty()
    }

    /// Snapshot and empty the queue.
    pub fn drain(&self) -> Vec<RecvMsg> {
        let mut q = self.q.lock();
        q.drain(..).collect()
    }

    /// Remove the first queued reply-type message, leaving requests queued.
    pub fn take_reply(&self) -> Option<RecvMsg> {
        let mut q = self.q.lock();
        let idx = q.iter().position(|m| m.mtype.is_reply())?;
        q.remove(idx)
    }
}

impl Default for MsgQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-CPU state block.
pub struct Pcpu {
    pub recv_waitq: MsgQueue,
    /// The outstanding request this CPU is waiting a reply for, if any.
    pub waiting_reply: Mutex<Option<Arc<ReplySlot>>>,
    lazyirq_depth: AtomicU32,
    pub online: AtomicBool,
    pub wakeup: AtomicBool,
}

impl Pcpu {
    pub fn new() -> Self {
        Self {
            recv_waitq: MsgQueue::new(),
            waiting_reply: Mutex::new(None),
            lazyirq_depth: AtomicU32::new(0),
            online: AtomicBool::new(false),
            wakeup: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn in_lazyirq(&self) -> bool {
        self.lazyirq_depth.load(Ordering::Relaxed) != 0
    }

    pub fn lazyirq_enter(&self) {
        self.lazyirq_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lazyirq_exit(&self) {
        self.lazyirq_depth.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }
}

impl Default for Pcpu {
    fn default() -> Self {
        Self::new()
    }
}
