//! Memory Barrier Helpers
//!
//! The SMMU reads its tables and command queue from normal memory and its
//! producer/consumer indices from device registers. Every table or queue
//! update therefore needs a barrier between the memory writes and the
//! register write that makes them visible to the device.
//!
//! # Usage Patterns
//!
//! ## Command Queue (driver produces, SMMU consumes)
//!
//! ```ignore
//! queue.write_entry(slot, cmd);
//! write_barrier();              // Entry visible before the producer index
//! regs.write32(CMDQ_PROD, prod);
//! ```
//!
//! ## Event Queue (SMMU produces, driver consumes)
//!
//! ```ignore
//! let prod = regs.read32(EVENTQ_PROD);
//! read_barrier();               // Observe the record the index points past
//! let event = queue.read_entry(slot);
//! ```

use core::sync::atomic::{Ordering, fence};

/// Read barrier (acquire semantics).
///
/// Use after reading a producer index written by the device and before
/// reading the records it covers.
#[inline]
pub fn read_barrier() {
    fence(Ordering::Acquire);
}

/// Write barrier (release semantics).
///
/// Use between filling a table entry or queue slot and publishing it.
#[inline]
pub fn write_barrier() {
    fence(Ordering::Release);
}

/// Data Synchronisation Barrier (DSB SY).
///
/// Waits for all outstanding memory accesses, including those to device
/// memory, to complete. On targets other than AArch64 (host-side tests and
/// simulators) this degrades to a sequentially consistent fence.
#[inline]
pub fn dsb() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: DSB is always safe to execute
    unsafe {
        core::arch::asm!("dsb sy", options(nostack, preserves_flags));
    }

    #[cfg(not(target_arch = "aarch64"))]
    fence(Ordering::SeqCst);
}
