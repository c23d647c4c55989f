//! Common test helpers: software HAL implementations and an in-process
//! Ethernet fabric that wires several `Node` instances together.
//!
//! These tests run on the host; frame delivery happens synchronously on the
//! sender's thread, standing in for the receiver's NIC IRQ. Each node's own
//! threads drive its dispatch loops, one thread per simulated CPU.

extern crate std;

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use spanvisor_core::config::{NodeConfig, VmDesc};
use spanvisor_core::dispatch;
use spanvisor_core::node::Node;
use spanvisor_hal::clock::Clock;
use spanvisor_hal::cpu::CpuIf;
use spanvisor_hal::mmu::{S2Pte, Stage2Mmu};
use spanvisor_hal::nic::{FrameNic, MacAddr, NicError, TxFrame, BROADCAST_MAC};

pub const MIB: u64 = 1024 * 1024;

thread_local! {
    static CPU_ID: Cell<usize> = const { Cell::new(0) };
    static IRQ_DISABLED: Cell<bool> = const { Cell::new(false) };
}

/// Register the calling thread as the given CPU of whatever node it drives.
pub fn set_cpu_id(id: usize) {
    CPU_ID.with(|c| c.set(id));
}

pub fn mac(i: u8) -> MacAddr {
    [0x02, 0, 0, 0, 0, i]
}

pub fn vm_desc() -> VmDesc {
    VmDesc {
        entrypoint: 0x4020_0000,
        fdt_base: 0x4840_0000,
        initrd_base: 0x4800_0000,
    }
}

// ---------------------------------------------------------------------------
// Software HAL
// ---------------------------------------------------------------------------

pub struct TestClock(Instant);

impl TestClock {
    pub fn new() -> Self {
        Self(Instant::now())
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> u64 {
        self.0.elapsed().as_millis() as u64
    }
}

pub struct TestCpu {
    ncpus: usize,
    halted: AtomicBool,
}

impl TestCpu {
    pub fn new(ncpus: usize) -> Self {
        Self {
            ncpus,
            halted: AtomicBool::new(false),
        }
    }

    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }
}

impl CpuIf for TestCpu {
    fn cpu_id(&self) -> usize {
        CPU_ID.with(|c| c.get())
    }

    fn ncpus(&self) -> usize {
        self.ncpus
    }

    fn send_ipi(&self, _cpu: usize) {
        // Threads poll with a short wait hint; nothing to do.
    }

    fn wait_hint(&self) {
        std::thread::sleep(Duration::from_micros(100));
    }

    fn halt(&self) -> ! {
        self.halted.store(true, Ordering::Release);
        panic!("cpu halted");
    }

    fn local_irq_disable(&self) {
        IRQ_DISABLED.with(|f| f.set(true));
    }

    fn local_irq_enable(&self) {
        IRQ_DISABLED.with(|f| f.set(false));
    }

    fn local_irq_disabled(&self) -> bool {
        IRQ_DISABLED.with(|f| f.get())
    }
}

/// Software stage-2 table: a map of leaf entries, leaked so the trait can
/// hand out `&S2Pte` without lifetime gymnastics.
pub struct SoftMmu {
    ptes: Mutex<HashMap<u64, &'static S2Pte>>,
    flushes: AtomicU64,
}

impl SoftMmu {
    pub fn new() -> Self {
        Self {
            ptes: Mutex::new(HashMap::new()),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl Stage2Mmu for SoftMmu {
    fn pte(&self, ipa: u64, create: bool) -> Option<&S2Pte> {
        let mut ptes = self.ptes.lock().unwrap();
        if let Some(pte) = ptes.get(&ipa) {
            return Some(*pte);
        }
        if create {
            let pte: &'static S2Pte = Box::leak(Box::new(S2Pte::new()));
            ptes.insert(ipa, pte);
            Some(pte)
        } else {
            None
        }
    }

    fn tlb_flush_ipa(&self, _ipa: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Fabric
// ---------------------------------------------------------------------------

/// In-process layer-2 segment. `xmit` hands the frame straight to the
/// destination node's receive path, on the sender's thread, exactly like a
/// NIC raising its RX interrupt.
pub struct Fabric {
    nodes: Mutex<HashMap<MacAddr, &'static Node>>,
}

impl Fabric {
    pub fn new() -> Arc<Fabric> {
        Arc::new(Fabric {
            nodes: Mutex::new(HashMap::new()),
        })
    }

    pub fn attach(&self, mac: MacAddr, node: &'static Node) {
        self.nodes.lock().unwrap().insert(mac, node);
    }

    fn deliver(&self, src: MacAddr, dst: MacAddr, hdr: &[u8], body: Option<&[u8]>) {
        let targets: Vec<&'static Node> = {
            let nodes = self.nodes.lock().unwrap();
            if dst == BROADCAST_MAC {
                nodes
                    .iter()
                    .filter(|(m, _)| **m != src)
                    .map(|(_, n)| *n)
                    .collect()
            } else {
                nodes.get(&dst).copied().into_iter().collect()
            }
        };

        // RX runs in the receiver's IRQ context, i.e. on one of *its* CPUs;
        // park our own CPU identity while we impersonate it.
        let saved = CPU_ID.with(|c| c.get());
        CPU_ID.with(|c| c.set(0));
        for node in targets {
            dispatch::recv_frame(node, hdr, body);
        }
        CPU_ID.with(|c| c.set(saved));
    }
}

pub struct TestNic {
    mac: MacAddr,
    fabric: Arc<Fabric>,
}

impl FrameNic for TestNic {
    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn xmit(&self, frame: TxFrame<'_>) -> Result<(), NicError> {
        if frame.hdr.len() < 6 {
            return Err(NicError::FrameTooLarge);
        }
        let mut dst = [0u8; 6];
        dst.copy_from_slice(&frame.hdr[..6]);
        self.fabric.deliver(self.mac, dst, frame.hdr, frame.body);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Node harness
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
pub struct TestNode {
    pub node: &'static Node,
    pub cpu: &'static TestCpu,
    pub mmu: &'static SoftMmu,
    pub mac: MacAddr,
}

pub fn build_node(
    fabric: &Arc<Fabric>,
    mac: MacAddr,
    cfg: NodeConfig,
    ncpus: usize,
) -> TestNode {
    let nic: &'static TestNic = Box::leak(Box::new(TestNic {
        mac,
        fabric: fabric.clone(),
    }));
    let mmu: &'static SoftMmu = Box::leak(Box::new(SoftMmu::new()));
    let cpu: &'static TestCpu = Box::leak(Box::new(TestCpu::new(ncpus)));
    let clock: &'static TestClock = Box::leak(Box::new(TestClock::new()));
    let node: &'static Node =
        Box::leak(Box::new(Node::new(cfg, nic, mmu, cpu, clock).expect("node config")));
    fabric.attach(mac, node);
    TestNode {
        node,
        cpu,
        mmu,
        mac,
    }
}

/// Service the inbound queue until `done` is raised; used by nodes that
/// only answer the scenario driven elsewhere.
pub fn serve_until(node: &Node, done: &AtomicBool) {
    while !done.load(Ordering::Acquire) {
        dispatch::do_recv_waitqueue(node);
        std::thread::sleep(Duration::from_micros(200));
    }
}

/// Run cluster formation on every node concurrently, one thread per node,
/// and wait for all of them to reach the running state.
pub fn bring_up(nodes: &[&'static Node]) {
    let handles: Vec<_> = nodes
        .iter()
        .map(|&node| {
            std::thread::spawn(move || {
                set_cpu_id(0);
                spanvisor_core::cluster::cluster_init(node);
            })
        })
        .collect();
    for h in handles {
        h.join().expect("cluster init");
    }
}

/// Guest-memory helpers over the access path under test.
pub fn guest_read_u64(node: &Node, ipa: u64) -> u64 {
    let mut buf = [0u8; 8];
    spanvisor_core::vsm::vsm_access(node, ipa, &mut buf, false).expect("read in range");
    u64::from_le_bytes(buf)
}

pub fn guest_write_u64(node: &Node, ipa: u64, val: u64) {
    let mut buf = val.to_le_bytes();
    spanvisor_core::vsm::vsm_access(node, ipa, &mut buf, true).expect("write in range");
}
