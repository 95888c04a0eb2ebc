//! Register Access
//!
//! [`RegisterIo`] is the seam between the SMMU engine and the hardware: the
//! engine only ever touches registers through it, so a platform can back it
//! with real MMIO ([`MmioRegion`]) while tests back it with a simulated
//! register file.
//!
//! # Safety
//!
//! Constructing an [`MmioRegion`] is unsafe: the caller vouches that the base
//! address is a mapped device region. After that, all accesses are safe and
//! use volatile operations so the compiler cannot elide or merge them.

use core::ptr::{read_volatile, write_volatile};
use core::time::Duration;

use crate::barrier;
use crate::poll::{Clock, poll_until};

/// Offset-based access to a block of device registers.
pub trait RegisterIo {
    /// Read a 32-bit register.
    fn read32(&self, offset: usize) -> u32;

    /// Write a 32-bit register.
    fn write32(&self, offset: usize, value: u32);

    /// Read a 64-bit register.
    fn read64(&self, offset: usize) -> u64;

    /// Write a 64-bit register.
    fn write64(&self, offset: usize, value: u64);

    /// Order all prior memory writes before any later register write.
    #[inline]
    fn barrier(&self) {
        barrier::dsb();
    }

    /// Modify a 32-bit register using read-modify-write.
    ///
    /// Note: This is NOT atomic - use with care for concurrent access.
    #[inline]
    fn modify32<F>(&self, offset: usize, f: F)
    where
        F: FnOnce(u32) -> u32,
    {
        let value = self.read32(offset);
        self.write32(offset, f(value));
    }

    /// Poll a 32-bit register until a condition is met or `timeout` elapses.
    ///
    /// Returns `true` if the condition was met.
    #[inline]
    fn poll32<C, F>(&self, offset: usize, condition: F, clock: &C, timeout: Duration) -> bool
    where
        C: Clock + ?Sized,
        F: Fn(u32) -> bool,
    {
        poll_until(clock, timeout, || condition(self.read32(offset)))
    }
}

/// A memory-mapped I/O region.
///
/// # Example
///
/// ```ignore
/// let mmio = unsafe { MmioRegion::new(0x2b40_0000, 0x2_0000) };
///
/// let idr0 = mmio.read32(0x00);
/// mmio.write64(0x80, strtab_base);
/// ```
#[derive(Clone, Copy)]
pub struct MmioRegion {
    base: usize,
    size: usize,
}

impl MmioRegion {
    /// Create a new MMIO region.
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `base` points to a valid, mapped MMIO region of at least `size` bytes
    /// - The region has device memory attributes (non-cacheable)
    /// - No other code accesses this region concurrently without synchronisation
    #[inline]
    #[must_use]
    pub const unsafe fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// Get the base address of this region.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Get the size of this region.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }
}

impl RegisterIo for MmioRegion {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size, "MMIO read32 offset out of bounds");
        debug_assert!(offset.is_multiple_of(4), "MMIO read32 offset not aligned");
        // SAFETY: Caller of `new` vouched for the region, offset is within bounds
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.size, "MMIO write32 offset out of bounds");
        debug_assert!(offset.is_multiple_of(4), "MMIO write32 offset not aligned");
        // SAFETY: Caller of `new` vouched for the region, offset is within bounds
        unsafe { write_volatile((self.base + offset) as *mut u32, value) }
    }

    #[inline]
    fn read64(&self, offset: usize) -> u64 {
        assert!(offset + 8 <= self.size, "MMIO read64 offset out of bounds");
        debug_assert!(offset.is_multiple_of(8), "MMIO read64 offset not aligned");
        // SAFETY: Caller of `new` vouched for the region, offset is within bounds
        unsafe { read_volatile((self.base + offset) as *const u64) }
    }

    #[inline]
    fn write64(&self, offset: usize, value: u64) {
        assert!(offset + 8 <= self.size, "MMIO write64 offset out of bounds");
        debug_assert!(offset.is_multiple_of(8), "MMIO write64 offset not aligned");
        // SAFETY: Caller of `new` vouched for the region, offset is within bounds
        unsafe { write_volatile((self.base + offset) as *mut u64, value) }
    }
}

impl core::fmt::Debug for MmioRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MmioRegion")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}
