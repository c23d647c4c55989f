#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Spanvisor distributed-memory core.
//!
//! Implements the subsystems that let N nodes present a single coherent
//! guest: the inter-node message transport and its receive dispatch, the
//! cluster-formation state machine, and the page-coherence engine over the
//! union of all nodes' RAM. Hardware is reached exclusively through the
//! `spanvisor-hal` traits.

extern crate alloc;

pub mod cluster;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod log;
pub mod monitor;
pub mod msg;
pub mod node;
pub mod pcpu;
pub mod vsm;

pub use cluster::{ClusterNode, NodeStatus, NODE_MAX};
pub use config::{ConfigError, NodeConfig, VmDesc};
pub use msg::{MsgError, MsgType};
pub use node::{Node, NodeState};
pub use vsm::VsmError;

/// Core error types surfaced to the embedding layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    Config(ConfigError),
    Msg(MsgError),
    Cluster(cluster::ClusterError),
    Vsm(VsmError),
}

impl From<ConfigError> for CoreError {
    fn from(err: ConfigError) -> Self {
        CoreError::Config(err)
    }
}

impl From<MsgError> for CoreError {
    fn from(err: MsgError) -> Self {
        CoreError::Msg(err)
    }
}

impl From<cluster::ClusterError> for CoreError {
    fn from(err: cluster::ClusterError) -> Self {
        CoreError::Cluster(err)
    }
}

impl From<VsmError> for CoreError {
    fn from(err: VsmError) -> Self {
        CoreError::Vsm(err)
    }
}
