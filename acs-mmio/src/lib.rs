//! Device Access Layer for SMMUv3 Compliance Drivers
//!
//! This crate provides the low-level building blocks the SMMU engine sits on:
//! register access, device-visible DMA memory, ring-buffer index arithmetic
//! and deadline-bounded polling.
//!
//! # Modules
//!
//! - [`region`]: Register access trait and a volatile MMIO implementation
//! - [`barrier`]: Memory barrier helpers for device memory ordering
//! - [`dma`]: DMA memory regions and the allocator interface that provides them
//! - [`ring`]: Producer/consumer ring indices with an extra wrap bit
//! - [`poll`]: Monotonic clocks and deadlines for bounded busy-waits
//!
//! # Example
//!
//! ```ignore
//! use acs_mmio::{MmioRegion, RegisterIo, poll::GenericTimer};
//! use core::time::Duration;
//!
//! // SMMU register frame at 0x2b40_0000 (two 64K pages)
//! let regs = unsafe { MmioRegion::new(0x2b40_0000, 0x2_0000) };
//!
//! regs.write32(0x20, 0);
//! let acked = regs.poll32(0x24, |ack| ack == 0, &GenericTimer, Duration::from_millis(10));
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod barrier;
pub mod dma;
pub mod poll;
pub mod region;
pub mod ring;

// Re-exports for convenience
pub use barrier::{dsb, read_barrier, write_barrier};
pub use dma::{DmaAllocator, DmaRegion};
pub use poll::{Clock, Deadline, TickClock, poll_until};
pub use region::{MmioRegion, RegisterIo};
pub use ring::{QueueEntry, Ring};
