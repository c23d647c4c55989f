//! Per-node message and coherence counters.
//!
//! Lock-free; read by diagnostics and by the test suites to assert expected
//! protocol flows.

use core::array;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::msg::{MsgType, NUM_MSG};

pub struct Monitor {
    sent: [AtomicU64; NUM_MSG],
    recvd: [AtomicU64; NUM_MSG],
    fetch_served: AtomicU64,
    fetch_forwarded: AtomicU64,
    remote_faults: AtomicU64,
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            sent: array::from_fn(|_| AtomicU64::new(0)),
            recvd: array::from_fn(|_| AtomicU64::new(0)),
            fetch_served: AtomicU64::new(0),
            fetch_forwarded: AtomicU64::new(0),
            remote_faults: AtomicU64::new(0),
        }
    }

    pub fn count_sent(&self, t: MsgType) {
        self.sent[t as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_recv(&self, t: MsgType) {
        self.recvd[t as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_fetch_served(&self) {
        self.fetch_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_fetch_forwarded(&self) {
        self.fetch_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_remote_fault(&self) {
        self.remote_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent(&self, t: MsgType) -> u64 {
        self.sent[t as usize].load(Ordering::Relaxed)
    }

    pub fn recvd(&self, t: MsgType) -> u64 {
        self.recvd[t as usize].load(Ordering::Relaxed)
    }

    pub fn fetches_served(&self) -> u64 {
        self.fetch_served.load(Ordering::Relaxed)
    }

    pub fn fetches_forwarded(&self) -> u64 {
        self.fetch_forwarded.load(Ordering::Relaxed)
    }

    pub fn remote_faults(&self) -> u64 {
        self.remote_faults.load(Ordering::Relaxed)
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}
