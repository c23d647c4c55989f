//! Inter-node message transport.
//!
//! A message is one Ethernet frame: a small typed header segment and an
//! optional page-sized body as the second scatter/gather segment. The
//! message type rides in the EtherType low byte under a fixed protocol
//! magic, so the receive path dispatches without touching the payload.
//!
//! Requests are correlated with their single reply through a 32-bit
//! connection id whose low 3 bits carry the originating CPU index; each CPU
//! has exactly one outstanding request at a time.

use alloc::sync::Arc;

use heapless::Vec as HVec;
use spanvisor_hal::nic::{MacAddr, TxFrame, BROADCAST_MAC};
use spin::{Mutex, RwLock};
use static_assertions::const_assert;

use crate::control;
use crate::node::Node;
use crate::pcpu::RecvMsg;

/// EtherType high byte marking cluster traffic.
pub const MSG_ETH_MAGIC: u8 = 0xaa;

pub const ETH_HDR_SIZE: usize = 14;
/// `src_nodeid(1) | type(1) | connection_id(4)`, common to every header.
pub const COMMON_HDR_SIZE: usize = 6;
/// Upper bound on any type-specific header payload.
pub const MSG_HDR_MAX: usize = 40;
pub const FRAME_HDR_MAX: usize = ETH_HDR_SIZE + COMMON_HDR_SIZE + MSG_HDR_MAX;

/// Source node id stamped before the local node has been assigned one.
pub const NODEID_UNKNOWN: u8 = 0xff;

pub const NUM_MSG: usize = 19;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    None = 0,
    Init = 1,
    InitAck = 2,
    ClusterInfo = 3,
    SetupDone = 4,
    CpuWakeup = 5,
    CpuWakeupAck = 6,
    Shutdown = 7,
    Fetch = 8,
    FetchReply = 9,
    Invalidate = 10,
    InvalidateAck = 11,
    Interrupt = 12,
    MmioRequest = 13,
    MmioReply = 14,
    GicConfig = 15,
    Sgi = 16,
    Panic = 17,
    BootSig = 18,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<MsgType> {
        Some(match v {
            0 => MsgType::None,
            1 => MsgType::Init,
            2 => MsgType::InitAck,
            3 => MsgType::ClusterInfo,
            4 => MsgType::SetupDone,
            5 => MsgType::CpuWakeup,
            6 => MsgType::CpuWakeupAck,
            7 => MsgType::Shutdown,
            8 => MsgType::Fetch,
            9 => MsgType::FetchReply,
            10 => MsgType::Invalidate,
            11 => MsgType::InvalidateAck,
            12 => MsgType::Interrupt,
            13 => MsgType::MmioRequest,
            14 => MsgType::MmioReply,
            15 => MsgType::GicConfig,
            16 => MsgType::Sgi,
            17 => MsgType::Panic,
            18 => MsgType::BootSig,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            MsgType::None => "msg:none",
            MsgType::Init => "msg:init",
            MsgType::InitAck => "msg:init_ack",
            MsgType::ClusterInfo => "msg:cluster_info",
            MsgType::SetupDone => "msg:setup_done",
            MsgType::CpuWakeup => "msg:cpu_wakeup",
            MsgType::CpuWakeupAck => "msg:cpu_wakeup_ack",
            MsgType::Shutdown => "msg:shutdown",
            MsgType::Fetch => "msg:fetch",
            MsgType::FetchReply => "msg:fetch_reply",
            MsgType::Invalidate => "msg:invalidate",
            MsgType::InvalidateAck => "msg:invalidate_ack",
            MsgType::Interrupt => "msg:interrupt",
            MsgType::MmioRequest => "msg:mmio_request",
            MsgType::MmioReply => "msg:mmio_reply",
            MsgType::GicConfig => "msg:gic_config",
            MsgType::Sgi => "msg:sgi",
            MsgType::Panic => "msg:panic",
            MsgType::BootSig => "msg:boot_sig",
        }
    }

    /// The closed reply set.
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            MsgType::CpuWakeupAck
                | MsgType::FetchReply
                | MsgType::MmioReply
                | MsgType::InvalidateAck
        )
    }

    /// Types that expect exactly one reply and therefore occupy the sending
    /// CPU's waiting-reply slot.
    pub fn expects_reply(self) -> bool {
        matches!(
            self,
            MsgType::CpuWakeup | MsgType::Fetch | MsgType::MmioRequest | MsgType::Invalidate
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgError {
    UnknownType,
    NotRegistered,
    NoReplyExpected,
    Nic(spanvisor_hal::nic::NicError),
}

// ---------------------------------------------------------------------------
// Wire headers
// ---------------------------------------------------------------------------

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    let b = v.to_le_bytes();
    buf[off..off + 4].copy_from_slice(&b);
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    let b = v.to_le_bytes();
    buf[off..off + 8].copy_from_slice(&b);
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes([
        buf[off],
        buf[off + 1],
        buf[off + 2],
        buf[off + 3],
        buf[off + 4],
        buf[off + 5],
        buf[off + 6],
        buf[off + 7],
    ])
}

/// Fixed-layout little-endian header codec. `SIZE` is a compile-time
/// constant per message type, registered in the message registry.
pub trait WireHdr: Sized {
    const SIZE: usize;
    fn put(&self, buf: &mut [u8]);
    fn get(buf: &[u8]) -> Self;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyHdr;

impl WireHdr for EmptyHdr {
    const SIZE: usize = 0;
    fn put(&self, _buf: &mut [u8]) {}
    fn get(_buf: &[u8]) -> Self {
        EmptyHdr
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InitAckHdr {
    pub nvcpu: u8,
    pub allocated: u64,
}

impl WireHdr for InitAckHdr {
    const SIZE: usize = 9;
    fn put(&self, buf: &mut [u8]) {
        buf[0] = self.nvcpu;
        put_u64(buf, 1, self.allocated);
    }
    fn get(buf: &[u8]) -> Self {
        Self {
            nvcpu: buf[0],
            allocated: get_u64(buf, 1),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClusterInfoHdr {
    pub nnodes: u8,
    pub nvcpus: u8,
}

impl WireHdr for ClusterInfoHdr {
    const SIZE: usize = 2;
    fn put(&self, buf: &mut [u8]) {
        buf[0] = self.nnodes;
        buf[1] = self.nvcpus;
    }
    fn get(buf: &[u8]) -> Self {
        Self {
            nnodes: buf[0],
            nvcpus: buf[1],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SetupDoneHdr {
    pub status: u8,
}

impl WireHdr for SetupDoneHdr {
    const SIZE: usize = 1;
    fn put(&self, buf: &mut [u8]) {
        buf[0] = self.status;
    }
    fn get(buf: &[u8]) -> Self {
        Self { status: buf[0] }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CpuWakeupHdr {
    pub vcpuid: u32,
}

impl WireHdr for CpuWakeupHdr {
    const SIZE: usize = 4;
    fn put(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.vcpuid);
    }
    fn get(buf: &[u8]) -> Self {
        Self {
            vcpuid: get_u32(buf, 0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CpuWakeupAckHdr {
    pub status: u8,
}

impl WireHdr for CpuWakeupAckHdr {
    const SIZE: usize = 1;
    fn put(&self, buf: &mut [u8]) {
        buf[0] = self.status;
    }
    fn get(buf: &[u8]) -> Self {
        Self { status: buf[0] }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchHdr {
    pub ipa: u64,
    pub wr: u8,
    /// Originating requester; preserved when the home forwards to the
    /// current owner so the owner records the right copyset member.
    pub req_nodeid: u8,
}

impl WireHdr for FetchHdr {
    const SIZE: usize = 10;
    fn put(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.ipa);
        buf[8] = self.wr;
        buf[9] = self.req_nodeid;
    }
    fn get(buf: &[u8]) -> Self {
        Self {
            ipa: get_u64(buf, 0),
            wr: buf[8],
            req_nodeid: buf[9],
        }
    }
}

/// Copyset byte on the wire: bits 0..=2 name nodes 0..=2, bit 7 means the
/// set overflowed and the writer must invalidate the whole cluster.
pub const WIRE_COPYSET_BCAST: u8 = 1 << 7;

#[derive(Debug, Clone, Copy)]
pub struct FetchReplyHdr {
    pub ipa: u64,
    pub copyset: u8,
    pub wr: u8,
}

impl WireHdr for FetchReplyHdr {
    const SIZE: usize = 10;
    fn put(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.ipa);
        buf[8] = self.copyset;
        buf[9] = self.wr;
    }
    fn get(buf: &[u8]) -> Self {
        Self {
            ipa: get_u64(buf, 0),
            copyset: buf[8],
            wr: buf[9],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InvalidateHdr {
    pub ipa: u64,
}

impl WireHdr for InvalidateHdr {
    const SIZE: usize = 8;
    fn put(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.ipa);
    }
    fn get(buf: &[u8]) -> Self {
        Self {
            ipa: get_u64(buf, 0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InvalidateAckHdr {
    pub ipa: u64,
}

impl WireHdr for InvalidateAckHdr {
    const SIZE: usize = 8;
    fn put(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.ipa);
    }
    fn get(buf: &[u8]) -> Self {
        Self {
            ipa: get_u64(buf, 0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InterruptHdr {
    pub vcpuid: u32,
    pub intid: u32,
}

impl WireHdr for InterruptHdr {
    const SIZE: usize = 8;
    fn put(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.vcpuid);
        put_u32(buf, 4, self.intid);
    }
    fn get(buf: &[u8]) -> Self {
        Self {
            vcpuid: get_u32(buf, 0),
            intid: get_u32(buf, 4),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MmioRequestHdr {
    pub addr: u64,
    pub val: u64,
    pub size: u8,
    pub wr: u8,
}

impl WireHdr for MmioRequestHdr {
    const SIZE: usize = 18;
    fn put(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.addr);
        put_u64(buf, 8, self.val);
        buf[16] = self.size;
        buf[17] = self.wr;
    }
    fn get(buf: &[u8]) -> Self {
        Self {
            addr: get_u64(buf, 0),
            val: get_u64(buf, 8),
            size: buf[16],
            wr: buf[17],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MmioReplyHdr {
    pub val: u64,
    pub status: u8,
}

impl WireHdr for MmioReplyHdr {
    const SIZE: usize = 9;
    fn put(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.val);
        buf[8] = self.status;
    }
    fn get(buf: &[u8]) -> Self {
        Self {
            val: get_u64(buf, 0),
            status: buf[8],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GicConfigHdr {
    pub intid: u32,
    pub target_vcpuid: u32,
    pub enabled: u8,
}

impl WireHdr for GicConfigHdr {
    const SIZE: usize = 9;
    fn put(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.intid);
        put_u32(buf, 4, self.target_vcpuid);
        buf[8] = self.enabled;
    }
    fn get(buf: &[u8]) -> Self {
        Self {
            intid: get_u32(buf, 0),
            target_vcpuid: get_u32(buf, 4),
            enabled: buf[8],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SgiHdr {
    pub sgi_id: u8,
    pub target_vcpuid: u32,
}

impl WireHdr for SgiHdr {
    const SIZE: usize = 5;
    fn put(&self, buf: &mut [u8]) {
        buf[0] = self.sgi_id;
        put_u32(buf, 1, self.target_vcpuid);
    }
    fn get(buf: &[u8]) -> Self {
        Self {
            sgi_id: buf[0],
            target_vcpuid: get_u32(buf, 1),
        }
    }
}

pub const PANIC_TAG_LEN: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct PanicHdr {
    pub nodeid: u8,
    pub tag: [u8; PANIC_TAG_LEN],
}

impl PanicHdr {
    pub fn with_tag(nodeid: u8, tag: &str) -> Self {
        let mut buf = [0u8; PANIC_TAG_LEN];
        let n = tag.len().min(PANIC_TAG_LEN);
        buf[..n].copy_from_slice(&tag.as_bytes()[..n]);
        Self { nodeid, tag: buf }
    }

    pub fn tag_str(&self) -> &str {
        let end = self.tag.iter().position(|&b| b == 0).unwrap_or(PANIC_TAG_LEN);
        core::str::from_utf8(&self.tag[..end]).unwrap_or("")
    }
}

impl WireHdr for PanicHdr {
    const SIZE: usize = 1 + PANIC_TAG_LEN;
    fn put(&self, buf: &mut [u8]) {
        buf[0] = self.nodeid;
        buf[1..1 + PANIC_TAG_LEN].copy_from_slice(&self.tag);
    }
    fn get(buf: &[u8]) -> Self {
        let mut tag = [0u8; PANIC_TAG_LEN];
        tag.copy_from_slice(&buf[1..1 + PANIC_TAG_LEN]);
        Self { nodeid: buf[0], tag }
    }
}

const_assert!(PanicHdr::SIZE <= MSG_HDR_MAX);
const_assert!(MmioRequestHdr::SIZE <= MSG_HDR_MAX);
const_assert!(FRAME_HDR_MAX <= 64);

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Disposition returned by a message handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    Done,
    /// The handler could not make progress (a page transition is in flight
    /// or the CPU's reply slot is busy); retry on a later dispatch round.
    Requeue,
}

pub type MsgHandler = fn(&Node, &RecvMsg) -> HandlerResult;

#[derive(Clone, Copy, Default)]
struct MsgEntry {
    hdr_size: u8,
    registered: bool,
    handler: Option<MsgHandler>,
    node0_only: bool,
}

/// Per-node message registry: header size for every defined type, handler
/// for every request type the node serves. Populated at init by each
/// subsystem; isolated cores (tests) build their own.
pub struct MsgRegistry {
    entries: RwLock<[MsgEntry; NUM_MSG]>,
}

impl MsgRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new([MsgEntry::default(); NUM_MSG]),
        }
    }

    pub fn register(&self, t: MsgType, hdr_size: usize) {
        let mut entries = self.entries.write();
        entries[t as usize].hdr_size = hdr_size as u8;
        entries[t as usize].registered = true;
    }

    pub fn register_handler(&self, t: MsgType, handler: MsgHandler, node0_only: bool) {
        let mut entries = self.entries.write();
        entries[t as usize].handler = Some(handler);
        entries[t as usize].node0_only = node0_only;
    }

    pub fn hdr_size(&self, t: MsgType) -> Option<usize> {
        let e = self.entries.read()[t as usize];
        e.registered.then_some(e.hdr_size as usize)
    }

    pub fn handler(&self, t: MsgType) -> Option<(MsgHandler, bool)> {
        let e = self.entries.read()[t as usize];
        e.handler.map(|h| (h, e.node0_only))
    }
}

impl Default for MsgRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Header sizes for the whole closed message set. Handlers are registered
/// separately by the subsystem that owns each type.
pub fn register_builtin_sizes(reg: &MsgRegistry) {
    let sizes: &[(MsgType, usize)] = &[
        (MsgType::Init, EmptyHdr::SIZE),
        (MsgType::InitAck, InitAckHdr::SIZE),
        (MsgType::ClusterInfo, ClusterInfoHdr::SIZE),
        (MsgType::SetupDone, SetupDoneHdr::SIZE),
        (MsgType::CpuWakeup, CpuWakeupHdr::SIZE),
        (MsgType::CpuWakeupAck, CpuWakeupAckHdr::SIZE),
        (MsgType::Shutdown, EmptyHdr::SIZE),
        (MsgType::Fetch, FetchHdr::SIZE),
        (MsgType::FetchReply, FetchReplyHdr::SIZE),
        (MsgType::Invalidate, InvalidateHdr::SIZE),
        (MsgType::InvalidateAck, InvalidateAckHdr::SIZE),
        (MsgType::Interrupt, InterruptHdr::SIZE),
        (MsgType::MmioRequest, MmioRequestHdr::SIZE),
        (MsgType::MmioReply, MmioReplyHdr::SIZE),
        (MsgType::GicConfig, GicConfigHdr::SIZE),
        (MsgType::Sgi, SgiHdr::SIZE),
        (MsgType::Panic, PanicHdr::SIZE),
        (MsgType::BootSig, EmptyHdr::SIZE),
    ];
    for &(t, payload) in sizes {
        reg.register(t, COMMON_HDR_SIZE + payload);
    }
}

// ---------------------------------------------------------------------------
// Reply correlation
// ---------------------------------------------------------------------------

/// Single-producer reply cell. The receive path completes it; the waiting
/// CPU observes `ready` and takes the message.
pub struct ReplySlot {
    conid: u32,
    ready: core::sync::atomic::AtomicBool,
    msg: Mutex<Option<RecvMsg>>,
}

impl ReplySlot {
    pub fn new(conid: u32) -> Self {
        Self {
            conid,
            ready: core::sync::atomic::AtomicBool::new(false),
            msg: Mutex::new(None),
        }
    }

    pub fn conid(&self) -> u32 {
        self.conid
    }

    pub fn complete(&self, msg: RecvMsg) {
        *self.msg.lock() = Some(msg);
        self.ready
            .store(true, core::sync::atomic::Ordering::Release);
    }

    pub fn try_take(&self) -> Option<RecvMsg> {
        if self.ready.load(core::sync::atomic::Ordering::Acquire) {
            self.msg.lock().take()
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound messages
// ---------------------------------------------------------------------------

/// An assembled outbound message. For request types it also owns the reply
/// slot registered on the sending CPU.
pub struct MsgOut<'a> {
    pub dst_mac: MacAddr,
    pub mtype: MsgType,
    pub conid: u32,
    hdr: HVec<u8, MSG_HDR_MAX>,
    pub body: Option<&'a [u8]>,
    reply: Option<Arc<ReplySlot>>,
}

impl<'a> MsgOut<'a> {
    pub fn reply_slot(&self) -> Option<&Arc<ReplySlot>> {
        self.reply.as_ref()
    }
}

impl Node {
    fn new_connection(&self) -> u32 {
        let mut conid = self.next_conid.lock();
        let c = *conid;
        *conid = conid.wrapping_add(1);
        (c << 3) | (self.cpu.cpu_id() as u32 & 0x7)
    }

    /// Assemble a message toward `dst_mac`, minting a fresh connection id.
    /// Request types claim the calling CPU's waiting-reply slot; claiming it
    /// twice is a protocol bug and panics the cluster.
    pub fn msg_init<'a, H: WireHdr>(
        &self,
        dst_mac: MacAddr,
        t: MsgType,
        hdr: &H,
        body: Option<&'a [u8]>,
    ) -> MsgOut<'a> {
        match self.registry.hdr_size(t) {
            Some(size) if size == COMMON_HDR_SIZE + H::SIZE => {}
            _ => control::cluster_panic(self, "msg hdr size"),
        }

        let conid = self.new_connection();

        let mut scratch = [0u8; MSG_HDR_MAX];
        hdr.put(&mut scratch[..]);
        let mut hb: HVec<u8, MSG_HDR_MAX> = HVec::new();
        hb.extend_from_slice(&scratch[..H::SIZE]).ok();

        let reply = if t.expects_reply() {
            let slot = Arc::new(ReplySlot::new(conid));
            let mut waiting = self.mycpu().waiting_reply.lock();
            if waiting.is_some() {
                drop(waiting);
                control::cluster_panic(self, "request already pending");
            }
            *waiting = Some(slot.clone());
            Some(slot)
        } else {
            None
        };

        MsgOut {
            dst_mac,
            mtype: t,
            conid,
            hdr: hb,
            body,
            reply,
        }
    }

    /// `msg_init` toward a node looked up in the cluster table.
    pub fn msg_init_to_nodeid<'a, H: WireHdr>(
        &self,
        dst_nodeid: u8,
        t: MsgType,
        hdr: &H,
        body: Option<&'a [u8]>,
    ) -> MsgOut<'a> {
        match self.cluster.mac_of(dst_nodeid) {
            Some(mac) => self.msg_init(mac, t, hdr, body),
            None => control::cluster_panic(self, "unknown dst nodeid"),
        }
    }

    pub fn broadcast_msg_init<'a, H: WireHdr>(
        &self,
        t: MsgType,
        hdr: &H,
        body: Option<&'a [u8]>,
    ) -> MsgOut<'a> {
        self.msg_init(BROADCAST_MAC, t, hdr, body)
    }

    /// Emit exactly one frame. Sending to ourselves is a programming error.
    pub fn send_msg(&self, msg: &MsgOut<'_>) -> Result<(), MsgError> {
        if msg.dst_mac == self.nic.mac() {
            control::cluster_panic(self, "send to self");
        }

        let mut frame = [0u8; FRAME_HDR_MAX];
        frame[0..6].copy_from_slice(&msg.dst_mac);
        frame[6..12].copy_from_slice(&self.nic.mac());
        frame[12] = MSG_ETH_MAGIC;
        frame[13] = msg.mtype as u8;
        frame[14] = self.cluster.my_nodeid_or(NODEID_UNKNOWN);
        frame[15] = msg.mtype as u8;
        put_u32(&mut frame, 16, msg.conid);
        let len = ETH_HDR_SIZE + COMMON_HDR_SIZE + msg.hdr.len();
        frame[ETH_HDR_SIZE + COMMON_HDR_SIZE..len].copy_from_slice(&msg.hdr);

        crate::log!(
            "[msg] send {} conid={:#x} to {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            msg.mtype.name(),
            msg.conid,
            msg.dst_mac[0],
            msg.dst_mac[1],
            msg.dst_mac[2],
            msg.dst_mac[3],
            msg.dst_mac[4],
            msg.dst_mac[5]
        );

        self.monitor.count_sent(msg.mtype);
        self.nic
            .xmit(TxFrame {
                hdr: &frame[..len],
                body: msg.body,
            })
            .map_err(MsgError::Nic)
    }

    /// Idle-wait for the single reply to `msg`. Escalates to a cluster
    /// panic when the watchdog expires.
    pub fn recv_reply(&self, msg: &MsgOut<'_>) -> RecvMsg {
        let slot = match msg.reply_slot() {
            Some(s) => s.clone(),
            None => control::cluster_panic(self, "no reply expected"),
        };
        let deadline = self.clock.now_ms() + self.cfg.reply_timeout_ms;
        loop {
            if let Some(m) = slot.try_take() {
                return m;
            }
            if self.mycpu().in_lazyirq() {
                // Inside a handler: consume replies only; requests stay
                // queued for the outer dispatch loop.
                crate::dispatch::drain_replies(self);
            } else {
                crate::dispatch::do_recv_waitqueue(self);
            }
            if self.clock.now_ms() > deadline {
                control::cluster_panic(self, "reply timeout");
            }
            self.cpu.wait_hint();
        }
    }

    /// Build and send the reply to `req`; never waits.
    pub fn msg_reply<H: WireHdr>(
        &self,
        req: &RecvMsg,
        t: MsgType,
        hdr: &H,
        body: Option<&[u8]>,
    ) -> Result<(), MsgError> {
        match self.registry.hdr_size(t) {
            Some(size) if size == COMMON_HDR_SIZE + H::SIZE => {}
            _ => control::cluster_panic(self, "msg hdr size"),
        }

        let mut scratch = [0u8; MSG_HDR_MAX];
        hdr.put(&mut scratch[..]);
        let mut hb: HVec<u8, MSG_HDR_MAX> = HVec::new();
        hb.extend_from_slice(&scratch[..H::SIZE]).ok();

        let reply = MsgOut {
            dst_mac: req.src_mac,
            mtype: t,
            conid: req.conid,
            hdr: hb,
            body,
            reply: None,
        };
        self.send_msg(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msgtype_round_trip() {
        for v in 0..NUM_MSG as u8 {
            let t = MsgType::from_u8(v).unwrap();
            assert_eq!(t as u8, v);
        }
        assert!(MsgType::from_u8(NUM_MSG as u8).is_none());
        assert!(MsgType::from_u8(0xfe).is_none());
    }

    #[test]
    fn test_reply_set_is_closed() {
        let replies: alloc::vec::Vec<MsgType> = (0..NUM_MSG as u8)
            .filter_map(MsgType::from_u8)
            .filter(|t| t.is_reply())
            .collect();
        assert_eq!(
            replies,
            alloc::vec![
                MsgType::CpuWakeupAck,
                MsgType::FetchReply,
                MsgType::InvalidateAck,
                MsgType::MmioReply,
            ]
        );
        for t in (0..NUM_MSG as u8).filter_map(MsgType::from_u8) {
            assert!(!(t.expects_reply() && t.is_reply()));
        }
    }

    #[test]
    fn test_fetch_hdr_round_trip() {
        let hdr = FetchHdr {
            ipa: 0x4000_1000,
            wr: 1,
            req_nodeid: 2,
        };
        let mut buf = [0u8; FetchHdr::SIZE];
        hdr.put(&mut buf);
        let back = FetchHdr::get(&buf);
        assert_eq!(back.ipa, hdr.ipa);
        assert_eq!(back.wr, hdr.wr);
        assert_eq!(back.req_nodeid, hdr.req_nodeid);
    }

    #[test]
    fn test_panic_hdr_tag() {
        let hdr = PanicHdr::with_tag(3, "coherence invariant");
        let mut buf = [0u8; PanicHdr::SIZE];
        hdr.put(&mut buf);
        let back = PanicHdr::get(&buf);
        assert_eq!(back.nodeid, 3);
        assert_eq!(back.tag_str(), "coherence invariant");
    }

    #[test]
    fn test_registry_rejects_unregistered() {
        let reg = MsgRegistry::new();
        assert!(reg.hdr_size(MsgType::Fetch).is_none());
        register_builtin_sizes(&reg);
        assert_eq!(
            reg.hdr_size(MsgType::Fetch),
            Some(COMMON_HDR_SIZE + FetchHdr::SIZE)
        );
        assert!(reg.handler(MsgType::Fetch).is_none());
    }
}
