//! Monotonic time source for watchdog timeouts.

pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary epoch; monotonic, never wraps within
    /// the life of the VM.
    fn now_ms(&self) -> u64;
}
