//! Context Descriptor Tables
//!
//! A stage-1 master owns one CD table indexed by substream ID. It is linear
//! unless the device supports two-level CD tables and the table would need
//! more than one 64KB leaf.

use crate::config::CDTAB_SPLIT;
use crate::descriptors::{CdTableFormat, ContextDescriptor, Stage1Context, l1_cd_descriptor};
use crate::error::SmmuError;
use crate::sparse::{SparseTable, TableEntry, TableLayout};
use crate::traits::DmaAllocator;

impl TableEntry for ContextDescriptor {
    const DWORDS: usize = 8;

    fn initial() -> Self {
        Self::invalid()
    }

    fn dwords(&self) -> &[u64] {
        &self.dwords
    }

    fn from_dwords(words: &[u64]) -> Self {
        let mut dwords = [0u64; 8];
        dwords.copy_from_slice(words);
        Self { dwords }
    }

    fn level1_descriptor(leaf_phys: u64, _split: u8) -> u64 {
        l1_cd_descriptor(leaf_phys)
    }
}

/// Per-master context descriptor table.
pub struct CdTable {
    table: SparseTable<ContextDescriptor>,
    s1cdmax: u8,
}

impl CdTable {
    /// Allocate a table of `2^s1cdmax` CDs.
    pub fn alloc<D>(dma: &D, s1cdmax: u8, two_level_supported: bool) -> Result<Self, SmmuError>
    where
        D: DmaAllocator + ?Sized,
    {
        let entries = 1usize << s1cdmax;
        let table = if two_level_supported && entries > (1 << CDTAB_SPLIT) {
            SparseTable::two_level(dma, entries, CDTAB_SPLIT)?
        } else {
            SparseTable::linear(dma, entries)?
        };

        log::debug!(
            "SMMU: CD table {:?} at {:#x}, {} CDs",
            table.layout(),
            table.root_phys(),
            entries
        );

        Ok(Self { table, s1cdmax })
    }

    /// STE0.S1FMT for this table.
    #[must_use]
    pub const fn format(&self) -> CdTableFormat {
        match self.table.layout() {
            TableLayout::Linear => CdTableFormat::Linear,
            TableLayout::TwoLevel { .. } => CdTableFormat::TwoLevel64K,
        }
    }

    /// Address written to STE0.S1ContextPtr.
    #[must_use]
    pub fn phys(&self) -> u64 {
        self.table.root_phys()
    }

    #[inline]
    #[must_use]
    pub const fn s1cdmax(&self) -> u8 {
        self.s1cdmax
    }

    /// Write a valid CD for `ctx` at `ssid`.
    ///
    /// Fails with [`SmmuError::SubstreamIdOutOfRange`] before touching any
    /// memory if `ssid >= 2^s1cdmax`.
    pub fn write<D>(&mut self, dma: &D, ssid: u32, ctx: &Stage1Context) -> Result<(), SmmuError>
    where
        D: DmaAllocator + ?Sized,
    {
        let index = ssid as usize;
        if index >= self.table.entries() {
            return Err(SmmuError::SubstreamIdOutOfRange(ssid));
        }

        self.table.ensure_leaf(dma, index)?;
        let cd = ContextDescriptor::stage1(ctx);
        self.table.write(index, &cd)?;

        log::trace!(
            "SMMU: CD[{:#x}] = {:#018x} {:#018x} {:#018x} {:#018x}",
            ssid,
            cd.dwords[0],
            cd.dwords[1],
            cd.dwords[2],
            cd.dwords[3]
        );
        Ok(())
    }

    pub fn read(&self, ssid: u32) -> Result<ContextDescriptor, SmmuError> {
        self.table.read(ssid as usize).map_err(|e| match e {
            SmmuError::IndexOutOfRange(_) => SmmuError::SubstreamIdOutOfRange(ssid),
            other => other,
        })
    }

    /// Release every leaf and the root.
    pub fn free<D>(self, dma: &D)
    where
        D: DmaAllocator + ?Sized,
    {
        self.table.release(dma);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDma;

    fn context() -> Stage1Context {
        Stage1Context {
            asid: 0,
            ttbr: 0x8_2000_0000,
            tcr: 0x5_0000_3510,
            mair: 0xff44_0c04,
        }
    }

    #[test]
    fn test_small_table_is_linear() {
        let dma = MockDma::new();
        let table = CdTable::alloc(&dma, 4, true).unwrap();
        assert_eq!(table.format(), CdTableFormat::Linear);
        assert_eq!(table.s1cdmax(), 4);
        table.free(&dma);
        assert_eq!(dma.live(), 0);
    }

    #[test]
    fn test_large_table_is_two_level_when_supported() {
        let dma = MockDma::new();
        let mut table = CdTable::alloc(&dma, 12, true).unwrap();
        assert_eq!(table.format(), CdTableFormat::TwoLevel64K);
        // Only the root until a CD is written
        assert_eq!(dma.live(), 1);

        table.write(&dma, 2048 + 5, &context()).unwrap();
        assert_eq!(dma.live(), 2);
        let cd = table.read(2048 + 5).unwrap();
        assert!(cd.is_valid());
        assert_eq!(cd.ttb0(), 0x8_2000_0000);
        table.free(&dma);
        assert_eq!(dma.live(), 0);

        let linear = CdTable::alloc(&dma, 12, false).unwrap();
        assert_eq!(linear.format(), CdTableFormat::Linear);
        linear.free(&dma);
    }

    #[test]
    fn test_write_and_read_back() {
        let dma = MockDma::new();
        let mut table = CdTable::alloc(&dma, 2, false).unwrap();
        assert!(!table.read(1).unwrap().is_valid());

        table.write(&dma, 1, &context()).unwrap();
        let cd = table.read(1).unwrap();
        assert_eq!(cd, ContextDescriptor::stage1(&context()));
        assert_eq!(cd.mair(), 0xff44_0c04);
        assert!(!table.read(0).unwrap().is_valid());
        table.free(&dma);
    }

    #[test]
    fn test_ssid_bound_rejected_without_mutation() {
        let dma = MockDma::new();
        let mut table = CdTable::alloc(&dma, 2, false).unwrap();
        let allocated = dma.allocations();

        assert_eq!(
            table.write(&dma, 4, &context()),
            Err(SmmuError::SubstreamIdOutOfRange(4))
        );
        assert_eq!(dma.allocations(), allocated);
        for ssid in 0..4 {
            assert_eq!(table.read(ssid).unwrap(), ContextDescriptor::invalid());
        }
        assert_eq!(table.read(4), Err(SmmuError::SubstreamIdOutOfRange(4)));
        table.free(&dma);
    }
}
