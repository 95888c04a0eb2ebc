//! Platform Collaborator Traits
//!
//! The engine touches the outside world through three seams:
//! - [`RegisterIo`]: the device register frame
//! - [`DmaAllocator`]: device-visible memory for queues and tables
//! - [`Topology`]: how many SMMUs exist, their revision and where they live

use acs_mmio::RegisterIo;
pub use acs_mmio::{DmaAllocator, DmaRegion};

use crate::error::SmmuError;

/// Attribute selector for [`Topology::info`] and `Smmu::get_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmmuInfo {
    /// Number of SMMU instances on the platform
    Count,
    /// Architecture major revision of one instance
    ArchMajorRev,
    /// Physical base address of one instance's register frame
    BaseAddress,
    /// Substream ID width probed from the device
    SsidBits,
    /// Input address size in bits probed from the device
    InputAddressSize,
    /// Output address size in bits probed from the device
    OutputAddressSize,
}

/// Platform description of the SMMUs present.
pub trait Topology {
    /// Register access for one instance
    type Io: RegisterIo;

    /// Query one attribute of instance `index` (or of the platform for
    /// [`SmmuInfo::Count`]). Unknown attributes read as zero.
    fn info(&self, field: SmmuInfo, index: usize) -> u64;

    /// Map the register frame (both pages) at physical `base`.
    fn map_registers(&self, base: u64) -> Self::Io;

    /// Number of SMMU instances.
    fn smmu_count(&self) -> usize {
        self.info(SmmuInfo::Count, 0) as usize
    }

    /// Architecture major revision of instance `index`.
    fn arch_major_rev(&self, index: usize) -> u32 {
        self.info(SmmuInfo::ArchMajorRev, index) as u32
    }

    /// Register base of instance `index`.
    fn base_address(&self, index: usize) -> u64 {
        self.info(SmmuInfo::BaseAddress, index)
    }
}

/// Allocate a zeroed DMA region, folding the allocator's error into
/// [`SmmuError::AllocFailed`].
pub(crate) fn dma_alloc<D>(dma: &D, size: usize, align: usize) -> Result<DmaRegion, SmmuError>
where
    D: DmaAllocator + ?Sized,
{
    dma.alloc_zeroed(size, align).map_err(|e| {
        log::error!("SMMU: DMA allocation of {:#x} bytes failed: {:?}", size, e);
        SmmuError::AllocFailed
    })
}

/// Tables are aligned to their own size (at least one 64-byte entry).
#[inline]
pub(crate) fn table_align(size: usize) -> usize {
    size.next_power_of_two().max(64)
}
