#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Spanvisor: a distributed type-1 hypervisor that presents one logical
//! multi-processor machine across a cluster of physical nodes.
//!
//! This crate is the thin assembly layer. The distributed-memory core
//! (message transport, cluster formation, page coherence) lives in
//! `spanvisor-core`; hardware access is abstracted by `spanvisor-hal` and
//! provided by the platform port.

extern crate alloc;

use once_cell::race::OnceBox;

pub use spanvisor_core::{
    cluster, config, control, dispatch, monitor, msg, node, pcpu, vsm, CoreError, Node,
    NodeConfig, NodeState,
};
pub use spanvisor_hal as hal;

static NODE: OnceBox<Node> = OnceBox::new();

/// Spanvisor top-level error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanvisorError {
    Core(CoreError),
    AlreadyInitialized,
}

impl From<CoreError> for SpanvisorError {
    fn from(err: CoreError) -> Self {
        SpanvisorError::Core(err)
    }
}

impl From<spanvisor_core::ConfigError> for SpanvisorError {
    fn from(err: spanvisor_core::ConfigError) -> Self {
        SpanvisorError::Core(CoreError::Config(err))
    }
}

/// Build the process-wide node context and join (or form) the cluster.
/// Returns the running node, ready for `control::run` on every CPU.
pub fn init(
    cfg: NodeConfig,
    nic: &'static dyn hal::FrameNic,
    mmu: &'static dyn hal::Stage2Mmu,
    cpu: &'static dyn hal::CpuIf,
    clock: &'static dyn hal::Clock,
) -> Result<&'static Node, SpanvisorError> {
    let node = Node::new(cfg, nic, mmu, cpu, clock)?;
    if NODE.set(alloc::boxed::Box::new(node)).is_err() {
        return Err(SpanvisorError::AlreadyInitialized);
    }
    let node = NODE.get().ok_or(SpanvisorError::AlreadyInitialized)?;

    cluster::cluster_init(node);
    Ok(node)
}

/// The process-wide node context, once `init` has run.
pub fn node() -> Option<&'static Node> {
    NODE.get()
}
