//! The per-node context value.
//!
//! Everything the original design kept in globals (local node identity, the
//! cluster table, per-CPU blocks) hangs off a single `Node` that is threaded
//! explicitly through the subsystems. Tests build several of them in one
//! process, each with its own registry and software HAL.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use spanvisor_hal::clock::Clock;
use spanvisor_hal::cpu::CpuIf;
use spanvisor_hal::mmu::Stage2Mmu;
use spanvisor_hal::nic::{FrameNic, MacAddr};
use spin::Mutex;

use crate::cluster::Cluster;
use crate::config::{ConfigError, NodeConfig};
use crate::monitor::Monitor;
use crate::msg::MsgRegistry;
use crate::pcpu::Pcpu;
use crate::vsm::Vsm;
use crate::{cluster, control, dispatch, msg, vsm};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    Idle = 0,
    Booting = 1,
    Running = 2,
    ShuttingDown = 3,
    Halted = 4,
}

impl NodeState {
    fn from_u8(v: u8) -> NodeState {
        match v {
            1 => NodeState::Booting,
            2 => NodeState::Running,
            3 => NodeState::ShuttingDown,
            4 => NodeState::Halted,
            _ => NodeState::Idle,
        }
    }
}

pub struct Node {
    pub cfg: NodeConfig,
    pub nic: &'static dyn FrameNic,
    pub mmu: &'static dyn Stage2Mmu,
    pub cpu: &'static dyn CpuIf,
    pub clock: &'static dyn Clock,
    pub registry: MsgRegistry,
    pub cluster: Cluster,
    pub vsm: Vsm,
    pub monitor: Monitor,
    pcpus: Vec<Pcpu>,
    state: AtomicU8,
    boot_signaled: AtomicBool,
    pub(crate) shutdown_acks: AtomicUsize,
    pub(crate) shutdown_from: Mutex<Option<MacAddr>>,
    pub(crate) next_conid: Mutex<u32>,
}

impl Node {
    pub fn new(
        cfg: NodeConfig,
        nic: &'static dyn FrameNic,
        mmu: &'static dyn Stage2Mmu,
        cpu: &'static dyn CpuIf,
        clock: &'static dyn Clock,
    ) -> Result<Node, ConfigError> {
        cfg.validate()?;

        // Reply routing carries the CPU index in 3 connection-id bits.
        if cpu.ncpus() == 0 || cpu.ncpus() > 8 {
            return Err(ConfigError::BadVcpuCount);
        }

        let mut pcpus = Vec::with_capacity(cpu.ncpus());
        for _ in 0..cpu.ncpus() {
            pcpus.push(Pcpu::new());
        }

        let node = Node {
            cfg,
            nic,
            mmu,
            cpu,
            clock,
            registry: MsgRegistry::new(),
            cluster: Cluster::new(cfg.ram_start),
            vsm: Vsm::new(),
            monitor: Monitor::new(),
            pcpus,
            state: AtomicU8::new(NodeState::Idle as u8),
            boot_signaled: AtomicBool::new(false),
            shutdown_acks: AtomicUsize::new(0),
            shutdown_from: Mutex::new(None),
            next_conid: Mutex::new(0),
        };

        msg::register_builtin_sizes(&node.registry);
        cluster::register_handlers(&node.registry);
        vsm::register_handlers(&node.registry);
        control::register_handlers(&node.registry);

        Ok(node)
    }

    #[inline]
    pub fn ncpus(&self) -> usize {
        self.pcpus.len()
    }

    #[inline]
    pub fn pcpu(&self, cpu: usize) -> &Pcpu {
        &self.pcpus[cpu]
    }

    /// The calling CPU's state block.
    #[inline]
    pub fn mycpu(&self) -> &Pcpu {
        &self.pcpus[self.cpu.cpu_id()]
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: NodeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn boot_signaled(&self) -> bool {
        self.boot_signaled.load(Ordering::Acquire)
    }

    pub fn set_boot_signaled(&self) {
        self.boot_signaled.store(true, Ordering::Release);
    }

    /// Idle-wait until `cond` holds, servicing the inbound queue in between.
    /// `what` names the wait in the panic tag if `timeout_ms` expires.
    pub fn idle_wait<F: FnMut() -> bool>(
        &self,
        mut cond: F,
        timeout_ms: Option<u64>,
        what: &str,
    ) {
        let deadline = timeout_ms.map(|t| self.clock.now_ms() + t);
        loop {
            if cond() {
                return;
            }
            dispatch::do_recv_waitqueue(self);
            if cond() {
                return;
            }
            if let Some(d) = deadline {
                if self.clock.now_ms() > d {
                    control::cluster_panic(self, what);
                }
            }
            self.cpu.wait_hint();
        }
    }
}
