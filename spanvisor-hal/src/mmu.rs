//! Stage-2 MMU interface.
//!
//! The core never walks pagetables itself; it asks the platform for the leaf
//! entry of a guest-physical page and manipulates the entry's software bits.
//! The layout mirrors an AArch64 stage-2 descriptor: access permissions in
//! S2AP, the access flag at bit 10, and the coherence engine's copyset in
//! the software-defined high bits.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::memory::GuestPhysAddr;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct S2PteFlags: u64 {
        const VALID = 1 << 0;
        /// S2AP read permission.
        const READ  = 1 << 6;
        /// S2AP write permission.
        const WRITE = 1 << 7;
        /// Access flag.
        const AF    = 1 << 10;
    }
}

/// Copyset bitmap: one bit per node id 0..=2.
pub const S2PTE_COPYSET_SHIFT: u32 = 55;
pub const S2PTE_COPYSET_MASK: u64 = 0x7 << S2PTE_COPYSET_SHIFT;
/// Set once the copyset can no longer name every read-copy holder; writes
/// must then invalidate every node in the cluster.
pub const S2PTE_COPYSET_BCAST: u64 = 1 << 58;

/// Highest node id the copyset bitmap can name explicitly.
pub const COPYSET_DIRECT_MAX: u8 = 3;

/// A stage-2 leaf entry. Updated only by the local node; remote nodes request
/// changes through coherence messages.
#[derive(Debug, Default)]
pub struct S2Pte(AtomicU64);

impl S2Pte {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.raw() & S2PteFlags::VALID.bits() != 0
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        let raw = self.raw();
        raw & S2PteFlags::VALID.bits() != 0 && raw & S2PteFlags::READ.bits() != 0
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        let raw = self.raw();
        raw & S2PteFlags::VALID.bits() != 0 && raw & S2PteFlags::WRITE.bits() != 0
    }

    /// Does the entry already satisfy an access of the given kind?
    #[inline]
    pub fn permits(&self, write: bool) -> bool {
        if write {
            self.is_writable()
        } else {
            self.is_readable()
        }
    }

    /// Map read-only (shared copy).
    pub fn grant_ro(&self) {
        let set = (S2PteFlags::VALID | S2PteFlags::READ | S2PteFlags::AF).bits();
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some((v & !S2PteFlags::WRITE.bits()) | set)
            })
            .ok();
    }

    /// Map read-write (exclusive copy).
    pub fn grant_rw(&self) {
        let set =
            (S2PteFlags::VALID | S2PteFlags::READ | S2PteFlags::WRITE | S2PteFlags::AF).bits();
        self.0.fetch_or(set, Ordering::SeqCst);
    }

    /// Drop the mapping; the copyset bits are cleared with it.
    pub fn revoke(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    /// Copyset bitmap over node ids 0..=2.
    #[inline]
    pub fn copyset(&self) -> u8 {
        ((self.raw() & S2PTE_COPYSET_MASK) >> S2PTE_COPYSET_SHIFT) as u8
    }

    #[inline]
    pub fn copyset_overflowed(&self) -> bool {
        self.raw() & S2PTE_COPYSET_BCAST != 0
    }

    /// Record `nodeid` as a read-copy holder. Ids beyond the bitmap force
    /// broadcast invalidation.
    pub fn add_copyset(&self, nodeid: u8) {
        let bits = if nodeid < COPYSET_DIRECT_MAX {
            1u64 << (S2PTE_COPYSET_SHIFT + nodeid as u32)
        } else {
            S2PTE_COPYSET_BCAST
        };
        self.0.fetch_or(bits, Ordering::SeqCst);
    }

    pub fn clear_copyset(&self) {
        self.0
            .fetch_and(!(S2PTE_COPYSET_MASK | S2PTE_COPYSET_BCAST), Ordering::SeqCst);
    }
}

/// Nested-pagetable service provided by the platform.
pub trait Stage2Mmu: Send + Sync {
    /// Walk to the leaf entry for `ipa`, creating intermediate levels when
    /// `create` is set. Returns `None` for an unmapped address when `create`
    /// is false.
    fn pte(&self, ipa: GuestPhysAddr, create: bool) -> Option<&S2Pte>;

    /// Invalidate the stage-2 TLB for a single guest-physical page on every
    /// local CPU.
    fn tlb_flush_ipa(&self, ipa: GuestPhysAddr);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perm_transitions() {
        let pte = S2Pte::new();
        assert!(!pte.is_valid());
        pte.grant_rw();
        assert!(pte.is_writable() && pte.is_readable());
        pte.grant_ro();
        assert!(pte.is_readable() && !pte.is_writable());
        pte.revoke();
        assert!(!pte.is_valid());
    }

    #[test]
    fn test_copyset_bitmap() {
        let pte = S2Pte::new();
        pte.grant_rw();
        pte.add_copyset(1);
        pte.add_copyset(2);
        assert_eq!(pte.copyset(), 0b110);
        assert!(!pte.copyset_overflowed());
        pte.add_copyset(5);
        assert!(pte.copyset_overflowed());
        pte.clear_copyset();
        assert_eq!(pte.copyset(), 0);
        assert!(!pte.copyset_overflowed());
        // permissions survive copyset manipulation
        assert!(pte.is_writable());
    }
}
