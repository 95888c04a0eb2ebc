//! Device-Visible Memory
//!
//! Queues and tables the SMMU walks live in ordinary memory that the driver
//! allocates and hands to the device by physical address. A [`DmaRegion`]
//! bundles the CPU pointer with that physical address; the platform's
//! [`DmaAllocator`] creates and reclaims them.
//!
//! # Memory Requirements
//!
//! Region memory must be:
//! - Physically contiguous
//! - Zeroed on allocation
//! - Aligned to at least the alignment requested (the SMMU needs queues and
//!   tables aligned to their own size)

use core::fmt::Debug;
use core::ptr::{NonNull, read_volatile, write_volatile};

use crate::ring::QueueEntry;

/// A block of DMA memory.
///
/// All accesses are volatile and bounds-checked against the region size.
pub struct DmaRegion {
    virt: NonNull<u8>,
    phys: u64,
    size: usize,
    align: usize,
}

// SAFETY: A DmaRegion is an exclusive handle to its memory; moving it to
// another thread moves that exclusivity with it.
unsafe impl Send for DmaRegion {}

impl DmaRegion {
    /// Wrap an allocation.
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `virt` points to `size` bytes of writable memory aligned to `align`
    /// - `phys` is the device-visible address of the same memory
    /// - The memory stays valid until the region is returned to its allocator
    /// - No other handle aliases the memory
    #[inline]
    #[must_use]
    pub const unsafe fn new(virt: NonNull<u8>, phys: u64, size: usize, align: usize) -> Self {
        Self {
            virt,
            phys,
            size,
            align,
        }
    }

    /// CPU-side pointer to the start of the region.
    #[inline]
    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    /// Device-visible address of the start of the region.
    #[inline]
    #[must_use]
    pub const fn phys(&self) -> u64 {
        self.phys
    }

    /// Size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Alignment the region was allocated with.
    #[inline]
    #[must_use]
    pub const fn align(&self) -> usize {
        self.align
    }

    /// Read the `index`th 64-bit word.
    #[inline]
    #[must_use]
    pub fn read_u64(&self, index: usize) -> u64 {
        assert!((index + 1) * 8 <= self.size, "DMA read past end of region");
        // SAFETY: In bounds per the check above, memory valid per `new`
        unsafe { read_volatile(self.virt.as_ptr().cast::<u64>().add(index)) }
    }

    /// Write the `index`th 64-bit word.
    #[inline]
    pub fn write_u64(&self, index: usize, value: u64) {
        assert!((index + 1) * 8 <= self.size, "DMA write past end of region");
        // SAFETY: In bounds per the check above, memory valid per `new`
        unsafe { write_volatile(self.virt.as_ptr().cast::<u64>().add(index), value) }
    }

    /// Number of `E` records that fit in the region.
    #[inline]
    #[must_use]
    pub const fn capacity_of<E: QueueEntry>(&self) -> usize {
        self.size / E::SIZE
    }

    /// Read the record in `slot`.
    #[inline]
    #[must_use]
    pub fn read_entry<E: QueueEntry>(&self, slot: usize) -> E {
        assert!(slot < self.capacity_of::<E>(), "DMA entry slot out of bounds");
        // SAFETY: Slot in bounds; E is POD and the region is aligned to at
        // least the entry size, so the slot is suitably aligned
        unsafe { read_volatile(self.virt.as_ptr().cast::<E>().add(slot)) }
    }

    /// Write the record in `slot`.
    #[inline]
    pub fn write_entry<E: QueueEntry>(&self, slot: usize, entry: E) {
        assert!(slot < self.capacity_of::<E>(), "DMA entry slot out of bounds");
        // SAFETY: As for read_entry
        unsafe { write_volatile(self.virt.as_ptr().cast::<E>().add(slot), entry) }
    }
}

impl Debug for DmaRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaRegion")
            .field("virt", &self.virt)
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

/// Provider of zeroed, physically contiguous DMA memory.
///
/// Implemented by the platform layer; the SMMU engine never allocates
/// device-visible memory any other way.
pub trait DmaAllocator {
    /// Error type for failed allocations
    type Error: Debug;

    /// Allocate `size` zeroed bytes aligned to `align` (a power of two).
    fn alloc_zeroed(&self, size: usize, align: usize) -> Result<DmaRegion, Self::Error>;

    /// Return a region to the allocator.
    ///
    /// # Safety
    ///
    /// `region` must have come from this allocator and the device must no
    /// longer be able to access it.
    unsafe fn free(&self, region: DmaRegion);
}
