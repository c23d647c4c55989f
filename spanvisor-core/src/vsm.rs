//! Virtual shared memory: the page cache and the coherence engine.
//!
//! The union of all nodes' RAM slices forms the guest-physical space. Every
//! page has a *home* (the node whose configured slice contains it) and an
//! *owner* (the last writer). The home serializes all ownership transitions
//! for its pages and keeps a pointer to the current owner, so locating a
//! migrated page is always a single forwarding hop. Writes move ownership;
//! reads replicate the page and are tracked in the owner's copyset so a
//! later writer can invalidate every copy. Per page this yields a
//! sequentially-consistent single-writer / multiple-reader discipline.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spanvisor_hal::memory::{page_base, page_offset, GuestPhysAddr, MemRange, PAGE_SIZE};
use spanvisor_hal::mmu::S2Pte;
use spanvisor_hal::page::PageBox;
use spin::{Mutex, Once, RwLock};

use crate::control;
use crate::msg::{
    FetchHdr, FetchReplyHdr, HandlerResult, InvalidateAckHdr, InvalidateHdr, MsgRegistry,
    MsgType, WIRE_COPYSET_BCAST,
};
use crate::node::Node;
use crate::pcpu::RecvMsg;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VsmError {
    /// The address falls outside every node's memory slice; the caller
    /// injects an abort into the guest.
    OutOfRange,
}

/*
 *  cache page flags
 *
 *  | ...... | L | OOOOO | .......... |
 *   63    38  37 36   32 31         0
 *
 *  O: owner
 *  L: lock
 */
pub const CACHE_PAGE_OWNER_SHIFT: u32 = 32;
pub const CACHE_PAGE_OWNER_MASK: u64 = 0x1f;
pub const CACHE_PAGE_LOCK: u64 = 1 << 37;

/// Per-page cache slot: protocol flags plus the local copy, when present.
///
/// The lock bit marks a transition in flight. It is taken with `try_lock`
/// from handlers (which defer instead of spinning) and is the only lock in
/// this subsystem held across network I/O: the home keeps it across a
/// forward, a new owner keeps it across its invalidation round.
pub struct CachePage {
    flags: AtomicU64,
    data: Mutex<Option<PageBox>>,
    /// Serializes fetch attempts for this page from different local CPUs.
    fetch_gate: Mutex<()>,
}

impl CachePage {
    fn new(owner: u8) -> Self {
        Self {
            flags: AtomicU64::new(((owner as u64) & CACHE_PAGE_OWNER_MASK) << CACHE_PAGE_OWNER_SHIFT),
            data: Mutex::new(None),
            fetch_gate: Mutex::new(()),
        }
    }

    #[inline]
    pub fn owner(&self) -> u8 {
        ((self.flags.load(Ordering::SeqCst) >> CACHE_PAGE_OWNER_SHIFT) & CACHE_PAGE_OWNER_MASK)
            as u8
    }

    pub fn set_owner(&self, owner: u8) {
        self.flags
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(
                    (v & !(CACHE_PAGE_OWNER_MASK << CACHE_PAGE_OWNER_SHIFT))
                        | (((owner as u64) & CACHE_PAGE_OWNER_MASK) << CACHE_PAGE_OWNER_SHIFT),
                )
            })
            .ok();
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & CACHE_PAGE_LOCK != 0
    }

    fn try_lock(&self) -> bool {
        self.flags.fetch_or(CACHE_PAGE_LOCK, Ordering::SeqCst) & CACHE_PAGE_LOCK == 0
    }

    fn unlock(&self) {
        self.flags.fetch_and(!CACHE_PAGE_LOCK, Ordering::SeqCst);
    }

    /// Non-blocking acquisition for handlers.
    fn try_guard(&self) -> Option<PageGuard<'_>> {
        self.try_lock().then_some(PageGuard(self))
    }

    /// Blocking acquisition for top-level paths; keeps servicing the
    /// inbound queue so the holder's dependencies can make progress.
    fn lock_wait<'a>(&'a self, node: &Node) -> PageGuard<'a> {
        loop {
            if let Some(guard) = self.try_guard() {
                return guard;
            }
            if !node.mycpu().in_lazyirq() {
                crate::dispatch::do_recv_waitqueue(node);
            }
            node.cpu.wait_hint();
        }
    }
}

struct PageGuard<'a>(&'a CachePage);

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

/// Per-node page cache over the whole guest-physical space. Slots are
/// created on first touch and stay for the life of the VM.
pub struct Vsm {
    mem: Once<MemRange>,
    pages: RwLock<BTreeMap<GuestPhysAddr, Arc<CachePage>>>,
}

impl Vsm {
    pub fn new() -> Self {
        Self {
            mem: Once::new(),
            pages: RwLock::new(BTreeMap::new()),
        }
    }

    /// Bind this node's own slice of the guest-physical space.
    pub fn node_init(&self, mem: MemRange) {
        crate::log!("[vsm] init over {:#x}+{:#x}", mem.start, mem.size);
        self.mem.call_once(|| mem);
    }

    pub fn local_range(&self) -> Option<MemRange> {
        self.mem.get().copied()
    }

    fn lookup(&self, page_ipa: GuestPhysAddr) -> Option<Arc<CachePage>> {
        self.pages.read().get(&page_ipa).cloned()
    }

    fn page(&self, page_ipa: GuestPhysAddr, default_owner: u8) -> Arc<CachePage> {
        if let Some(entry) = self.lookup(page_ipa) {
            return entry;
        }
        let mut pages = self.pages.write();
        pages
            .entry(page_ipa)
            .or_insert_with(|| Arc::new(CachePage::new(default_owner)))
            .clone()
    }

    /// Pages of our own slice whose ownership has migrated to a peer.
    pub fn migrated_pages(&self, me: u8, range: &MemRange) -> Vec<GuestPhysAddr> {
        self.pages
            .read()
            .iter()
            .filter(|(ipa, entry)| range.contains(**ipa) && entry.owner() != me)
            .map(|(ipa, _)| *ipa)
            .collect()
    }
}

impl Default for Vsm {
    fn default() -> Self {
        Self::new()
    }
}

fn must_pte<'a>(node: &'a Node, ipa: GuestPhysAddr) -> &'a S2Pte {
    match node.mmu.pte(ipa, true) {
        Some(pte) => pte,
        None => control::cluster_panic(node, "pagewalk failed"),
    }
}

/// Copyset as carried in a fetch reply: the holders a new writer must
/// invalidate, excluding the requester itself.
fn wire_copyset(pte: &S2Pte, exclude: u8) -> u8 {
    let mut cs = pte.copyset();
    if exclude < 3 {
        cs &= !(1 << exclude);
    }
    if pte.copyset_overflowed() {
        cs |= WIRE_COPYSET_BCAST;
    }
    cs
}

// ---------------------------------------------------------------------------
// Access paths
// ---------------------------------------------------------------------------

/// Copy `buf.len()` bytes between `buf` and guest memory at `ipa`,
/// fetching pages as needed. Used by MMIO emulation and other hypervisor
/// paths that may touch remote memory; accesses crossing page (and
/// therefore possibly node) boundaries are chunked.
pub fn vsm_access(
    node: &Node,
    ipa: GuestPhysAddr,
    buf: &mut [u8],
    wr: bool,
) -> Result<(), VsmError> {
    let mut off = 0usize;
    while off < buf.len() {
        let cur = ipa + off as u64;
        let page_end = page_base(cur) + PAGE_SIZE as u64;
        let chunk = ((page_end - cur) as usize).min(buf.len() - off);
        access_page(node, cur, &mut buf[off..off + chunk], wr)?;
        off += chunk;
    }
    Ok(())
}

/// Stage-2 fault entry point: make `ipa` present locally with permission
/// for the faulting access, then let the guest retry.
pub fn handle_stage2_fault(node: &Node, ipa: GuestPhysAddr, wr: bool) -> Result<(), VsmError> {
    fetch_page(node, page_base(ipa), wr)
}

fn access_page(
    node: &Node,
    ipa: GuestPhysAddr,
    buf: &mut [u8],
    wr: bool,
) -> Result<(), VsmError> {
    loop {
        if try_local_access(node, ipa, buf, wr) {
            return Ok(());
        }
        fetch_page(node, page_base(ipa), wr)?;
    }
}

fn try_local_access(node: &Node, ipa: GuestPhysAddr, buf: &mut [u8], wr: bool) -> bool {
    let page_ipa = page_base(ipa);
    let pte = match node.mmu.pte(page_ipa, false) {
        Some(pte) => pte,
        None => return false,
    };
    if !pte.permits(wr) {
        return false;
    }
    let entry = match node.vsm.lookup(page_ipa) {
        Some(entry) => entry,
        None => return false,
    };
    let _guard = match entry.try_guard() {
        Some(g) => g,
        None => return false,
    };
    // Re-validate: an invalidation may have won the race for the lock.
    if !pte.permits(wr) {
        return false;
    }
    let mut data = entry.data.lock();
    let page = match data.as_mut() {
        Some(p) => p,
        None => return false,
    };
    let off = page_offset(ipa);
    if wr {
        page.as_mut_slice()[off..off + buf.len()].copy_from_slice(buf);
    } else {
        buf.copy_from_slice(&page.as_slice()[off..off + buf.len()]);
    }
    true
}

fn fetch_page(node: &Node, page_ipa: GuestPhysAddr, wr: bool) -> Result<(), VsmError> {
    let home = node
        .cluster
        .home_of(page_ipa)
        .ok_or(VsmError::OutOfRange)?;
    let me = node.cluster.my_nodeid();
    node.monitor.count_remote_fault();
    if home == me {
        fetch_at_home(node, page_ipa, wr);
    } else {
        fetch_remote(node, page_ipa, wr, home);
    }
    Ok(())
}

/// Fault on a page we are home for. The home orders every transition of
/// its pages, so the slot lock is held for the whole operation, including
/// the pull from a remote owner.
fn fetch_at_home(node: &Node, ipa: GuestPhysAddr, wr: bool) {
    let me = node.cluster.my_nodeid();
    let entry = node.vsm.page(ipa, me);
    let _guard = entry.lock_wait(node);
    let pte = must_pte(node, ipa);

    if pte.permits(wr) {
        return;
    }

    let owner = entry.owner();
    if owner == me {
        {
            let mut data = entry.data.lock();
            if data.is_none() {
                // First touch: guest RAM reads as zeros.
                *data = Some(PageBox::zeroed());
            }
        }
        if wr {
            // Shared after serving readers; push the copies out to go
            // exclusive again.
            invalidate_round(node, ipa, wire_copyset(pte, me));
            pte.clear_copyset();
        }
        pte.grant_rw();
        return;
    }

    // The page migrated away; pull it back from the current owner.
    crate::log!("[vsm] fetch {:#x} wr={} from owner {}", ipa, wr, owner);
    let hdr = FetchHdr {
        ipa,
        wr: wr as u8,
        req_nodeid: me,
    };
    let req = node.msg_init_to_nodeid(owner, MsgType::Fetch, &hdr, None);
    node.send_msg(&req).ok();
    let mut reply = node.recv_reply(&req);
    let rhdr: FetchReplyHdr = reply.decode();

    install_body(&entry, &mut reply);

    if wr {
        entry.set_owner(me);
        invalidate_round(node, ipa, rhdr.copyset);
        pte.clear_copyset();
        pte.grant_rw();
    } else {
        pte.grant_ro();
    }
}

/// Fault on a page homed elsewhere: ask the home, which answers from its
/// own copy or forwards to the current owner. The slot lock is *not* held
/// across the wait; a concurrent invalidation must be able to claim it.
fn fetch_remote(node: &Node, ipa: GuestPhysAddr, wr: bool, home: u8) {
    let me = node.cluster.my_nodeid();
    let entry = node.vsm.page(ipa, home);

    let _gate = entry.fetch_gate.lock();
    let pte = must_pte(node, ipa);
    if pte.permits(wr) {
        // Another local CPU fetched it while we waited for the gate.
        return;
    }

    crate::log!("[vsm] fetch {:#x} wr={} from home {}", ipa, wr, home);
    let hdr = FetchHdr {
        ipa,
        wr: wr as u8,
        req_nodeid: me,
    };
    let req = node.msg_init_to_nodeid(home, MsgType::Fetch, &hdr, None);
    node.send_msg(&req).ok();
    let mut reply = node.recv_reply(&req);
    let rhdr: FetchReplyHdr = reply.decode();

    let _guard = entry.lock_wait(node);
    install_body(&entry, &mut reply);

    if wr {
        entry.set_owner(me);
        invalidate_round(node, ipa, rhdr.copyset);
        pte.clear_copyset();
        pte.grant_rw();
    } else {
        entry.set_owner(home);
        pte.grant_ro();
    }
}

fn install_body(entry: &CachePage, reply: &mut RecvMsg) {
    let page = match reply.body.take() {
        Some(p) => p,
        None => PageBox::zeroed(),
    };
    *entry.data.lock() = Some(page);
}

/// Invalidate every holder named by the wire copyset (or the whole cluster
/// after overflow) and collect one ack per holder. Runs with the page slot
/// locked: we own the page, and fetches arriving meanwhile are deferred.
fn invalidate_round(node: &Node, ipa: GuestPhysAddr, wire_cs: u8) {
    let me = node.cluster.my_nodeid();
    let holders: Vec<u8> = if wire_cs & WIRE_COPYSET_BCAST != 0 {
        (0..node.cluster.nr_nodes() as u8).filter(|&n| n != me).collect()
    } else {
        (0..3u8)
            .filter(|&n| wire_cs & (1 << n) != 0 && n != me)
            .collect()
    };

    for holder in holders {
        let hdr = InvalidateHdr { ipa };
        let req = node.msg_init_to_nodeid(holder, MsgType::Invalidate, &hdr, None);
        node.send_msg(&req).ok();
        let ack = node.recv_reply(&req);
        let ack_hdr: InvalidateAckHdr = ack.decode();
        if ack_hdr.ipa != ipa {
            control::cluster_panic(node, "invalidate ack mismatch");
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub fn register_handlers(reg: &MsgRegistry) {
    reg.register_handler(MsgType::Fetch, recv_fetch, false);
    reg.register_handler(MsgType::Invalidate, recv_invalidate, false);
}

fn recv_fetch(node: &Node, msg: &RecvMsg) -> HandlerResult {
    let hdr: FetchHdr = msg.decode();
    let ipa = hdr.ipa;
    let wr = hdr.wr != 0;
    let req_nodeid = hdr.req_nodeid;
    let me = node.cluster.my_nodeid();

    let home = match node.cluster.home_of(ipa) {
        Some(h) => h,
        None => control::cluster_panic(node, "fetch out of range"),
    };

    let entry = if home == me {
        node.vsm.page(ipa, me)
    } else {
        match node.vsm.lookup(ipa) {
            Some(e) => e,
            None => control::cluster_panic(node, "fetch at stranger node"),
        }
    };

    let _guard = match entry.try_guard() {
        Some(g) => g,
        // A transition for this page is in flight; retry after it settles.
        None => return HandlerResult::Requeue,
    };

    if entry.owner() == me {
        serve_fetch(node, msg, &entry, ipa, wr, req_nodeid);
        return HandlerResult::Done;
    }

    if home != me {
        control::cluster_panic(node, "fetch at non-owner");
    }

    // We are home but the page moved: forward one hop to the owner. The
    // forward needs this CPU's reply slot; if an outstanding request holds
    // it, retry once that completes.
    if node.mycpu().waiting_reply.lock().is_some() {
        return HandlerResult::Requeue;
    }

    node.monitor.count_fetch_forwarded();
    let owner = entry.owner();
    crate::log!("[vsm] forward fetch {:#x} req={} to owner {}", ipa, req_nodeid, owner);

    let fwd_hdr = FetchHdr {
        ipa,
        wr: wr as u8,
        req_nodeid,
    };
    let fwd = node.msg_init_to_nodeid(owner, MsgType::Fetch, &fwd_hdr, None);
    node.send_msg(&fwd).ok();
    let mut reply = node.recv_reply(&fwd);
    let rhdr: FetchReplyHdr = reply.decode();

    if wr {
        // Ownership has moved to the requester; record it so later
        // fetches forward to the right place.
        entry.set_owner(req_nodeid);
    }

    let body = reply.body.take();
    node.msg_reply(
        msg,
        MsgType::FetchReply,
        &rhdr,
        body.as_ref().map(|p| p.as_slice()),
    )
    .ok();
    HandlerResult::Done
}

/// Serve a fetch from our own copy: we are the current owner.
fn serve_fetch(
    node: &Node,
    msg: &RecvMsg,
    entry: &CachePage,
    ipa: GuestPhysAddr,
    wr: bool,
    req_nodeid: u8,
) {
    node.monitor.count_fetch_served();
    let pte = must_pte(node, ipa);
    let mut data = entry.data.lock();
    if data.is_none() {
        // Remote first touch of a page we are home for.
        *data = Some(PageBox::zeroed());
    }

    if !wr {
        // Keep our copy read-only and remember the new reader.
        if pte.is_writable() {
            pte.grant_ro();
            node.mmu.tlb_flush_ipa(ipa);
        } else if !pte.is_valid() {
            pte.grant_ro();
        }
        pte.add_copyset(req_nodeid);
        let reply_hdr = FetchReplyHdr {
            ipa,
            copyset: 0,
            wr: 0,
        };
        if let Some(page) = data.as_ref() {
            node.msg_reply(msg, MsgType::FetchReply, &reply_hdr, Some(page.as_slice()))
                .ok();
        }
    } else {
        // Hand over exclusivity together with the set of holders the new
        // writer must invalidate; our own copy dies here.
        let copyset = wire_copyset(pte, req_nodeid);
        let page = data.take();
        pte.clear_copyset();
        pte.revoke();
        node.mmu.tlb_flush_ipa(ipa);
        entry.set_owner(req_nodeid);

        let reply_hdr = FetchReplyHdr {
            ipa,
            copyset,
            wr: 1,
        };
        node.msg_reply(
            msg,
            MsgType::FetchReply,
            &reply_hdr,
            page.as_ref().map(|p| p.as_slice()),
        )
        .ok();
    }
}

fn recv_invalidate(node: &Node, msg: &RecvMsg) -> HandlerResult {
    let hdr: InvalidateHdr = msg.decode();
    let ipa = hdr.ipa;

    if let Some(entry) = node.vsm.lookup(ipa) {
        let _guard = match entry.try_guard() {
            Some(g) => g,
            None => return HandlerResult::Requeue,
        };
        if let Some(pte) = node.mmu.pte(ipa, false) {
            pte.revoke();
            node.mmu.tlb_flush_ipa(ipa);
        }
        *entry.data.lock() = None;
    }
    // Nothing cached is fine: a racing access will simply re-fault.

    node.msg_reply(msg, MsgType::InvalidateAck, &InvalidateAckHdr { ipa }, None)
        .ok();
    HandlerResult::Done
}

/// Pull every migrated page of our own slice back home through the normal
/// write-fetch path; used on shutdown so dirty data survives on its home.
pub fn reclaim_local_pages(node: &Node) {
    let me = node.cluster.my_nodeid();
    let range = match node.vsm.local_range() {
        Some(r) => r,
        None => return,
    };
    for ipa in node.vsm.migrated_pages(me, &range) {
        let _ = fetch_page(node, ipa, true);
    }
}
