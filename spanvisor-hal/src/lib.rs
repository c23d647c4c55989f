#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Host collaborator abstraction layer for the Spanvisor hypervisor.
//!
//! The distributed-memory core is ISA-agnostic; everything that touches real
//! hardware (frame I/O, the stage-2 MMU, inter-processor interrupts, the
//! monotonic clock) is reached through the traits in this crate. Platform
//! ports implement them against real devices; the test suites implement them
//! in software.

extern crate alloc;

pub mod clock;
pub mod cpu;
pub mod memory;
pub mod mmu;
pub mod nic;
pub mod page;

pub use clock::Clock;
pub use cpu::CpuIf;
pub use memory::{GuestPhysAddr, MemRange, PAGE_SHIFT, PAGE_SIZE};
pub use mmu::{S2Pte, Stage2Mmu};
pub use nic::{FrameNic, MacAddr, NicError, TxFrame, BROADCAST_MAC};
pub use page::PageBox;
