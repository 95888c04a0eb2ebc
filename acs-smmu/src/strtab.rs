//! Stream Table
//!
//! One STE per stream ID, held in a linear table or a two-level table with
//! `2^split` STEs per leaf. Unused stream IDs hold an abort entry.

use tock_registers::{
    interfaces::{Readable, Writeable},
    registers::InMemoryRegister,
};

use crate::descriptors::{StreamTableEntry, l1_stream_descriptor};
use crate::error::SmmuError;
use crate::master::{Master, StreamId};
use crate::registers::{STRTAB_BASE, STRTAB_BASE_CFG};
use crate::sparse::{EntryLocation, SparseTable, TableEntry, TableLayout};
use crate::traits::DmaAllocator;

impl TableEntry for StreamTableEntry {
    const DWORDS: usize = 8;

    fn initial() -> Self {
        Self::abort()
    }

    fn dwords(&self) -> &[u64] {
        &self.dwords
    }

    fn from_dwords(words: &[u64]) -> Self {
        let mut dwords = [0u64; 8];
        dwords.copy_from_slice(words);
        Self { dwords }
    }

    fn level1_descriptor(leaf_phys: u64, split: u8) -> u64 {
        l1_stream_descriptor(leaf_phys, split)
    }
}

/// A device's stream table.
pub struct StreamTable {
    table: SparseTable<StreamTableEntry>,
    sid_bits: u8,
}

impl StreamTable {
    /// Allocate the table for `sid_bits` stream ID bits.
    ///
    /// Two-level layout is used when `two_level` is set and the stream ID
    /// space is wider than one leaf.
    pub fn new<D>(dma: &D, sid_bits: u8, two_level: bool, split: u8) -> Result<Self, SmmuError>
    where
        D: DmaAllocator + ?Sized,
    {
        let entries = 1usize << sid_bits;
        let table = if two_level && sid_bits > split {
            SparseTable::two_level(dma, entries, split)?
        } else {
            SparseTable::linear(dma, entries)?
        };

        log::debug!(
            "SMMU: stream table {:?} at {:#x}, {} STEs",
            table.layout(),
            table.root_phys(),
            entries
        );

        Ok(Self { table, sid_bits })
    }

    #[inline]
    #[must_use]
    pub const fn sid_bits(&self) -> u8 {
        self.sid_bits
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> TableLayout {
        self.table.layout()
    }

    /// Whether `sid` is inside the table.
    #[inline]
    #[must_use]
    pub fn contains(&self, sid: StreamId) -> bool {
        (sid as usize) < self.table.entries()
    }

    /// Value for SMMU_STRTAB_BASE.
    #[must_use]
    pub fn base_register_value(&self) -> u64 {
        let base = InMemoryRegister::<u64, STRTAB_BASE::Register>::new(0);
        base.write(STRTAB_BASE::RA::SET + STRTAB_BASE::ADDR.val(self.table.root_phys() >> 6));
        base.get()
    }

    /// Value for SMMU_STRTAB_BASE_CFG.
    #[must_use]
    pub fn base_cfg_value(&self) -> u32 {
        let cfg = InMemoryRegister::<u32, STRTAB_BASE_CFG::Register>::new(0);
        match self.table.layout() {
            TableLayout::Linear => cfg.write(
                STRTAB_BASE_CFG::FMT::Linear + STRTAB_BASE_CFG::LOG2SIZE.val(self.sid_bits.into()),
            ),
            TableLayout::TwoLevel { split } => cfg.write(
                STRTAB_BASE_CFG::FMT::TwoLevel
                    + STRTAB_BASE_CFG::LOG2SIZE.val(self.sid_bits.into())
                    + STRTAB_BASE_CFG::SPLIT.val(split.into()),
            ),
        }
        cfg.get()
    }

    /// Location of the STE for `sid`, or `None` if its leaf is missing.
    #[must_use]
    pub fn get_entry(&self, sid: StreamId) -> Option<EntryLocation> {
        self.table.locate(sid as usize)
    }

    /// Allocate the leaf holding `sid` if needed.
    pub fn ensure_leaf<D>(&mut self, dma: &D, sid: StreamId) -> Result<(), SmmuError>
    where
        D: DmaAllocator + ?Sized,
    {
        if !self.contains(sid) {
            return Err(SmmuError::StreamIdOutOfRange(sid));
        }
        self.table.ensure_leaf(dma, sid as usize)
    }

    pub fn read(&self, sid: StreamId) -> Result<StreamTableEntry, SmmuError> {
        self.table.read(sid as usize)
    }

    pub fn write_entry(
        &mut self,
        sid: StreamId,
        ste: &StreamTableEntry,
    ) -> Result<(), SmmuError> {
        self.table.write(sid as usize, ste)?;
        log::trace!(
            "SMMU: STE[{:#x}] = {:#018x} {:#018x} {:#018x} {:#018x}",
            sid,
            ste.dwords[0],
            ste.dwords[1],
            ste.dwords[2],
            ste.dwords[3]
        );
        Ok(())
    }

    /// Write the STE for `sid` from a master's configuration, or an abort
    /// entry when there is none.
    pub fn write_master(
        &mut self,
        sid: StreamId,
        master: Option<&Master>,
    ) -> Result<(), SmmuError> {
        let ste = match master {
            Some(master) => master.stream_table_entry()?,
            None => StreamTableEntry::abort(),
        };
        self.write_entry(sid, &ste)
    }

    /// Read-modify-write the STE for `sid`.
    pub fn update<F>(&mut self, sid: StreamId, f: F) -> Result<StreamTableEntry, SmmuError>
    where
        F: FnOnce(&mut StreamTableEntry),
    {
        self.table.update(sid as usize, f)
    }

    /// Raw level-1 descriptor for a group (two-level tables only).
    #[must_use]
    pub fn level1_descriptor(&self, group: usize) -> Option<u64> {
        self.table.level1_descriptor(group)
    }

    /// Physical address of a group's leaf, if allocated.
    #[must_use]
    pub fn leaf_phys(&self, group: usize) -> Option<u64> {
        self.table.leaf_phys(group)
    }

    /// Free every leaf and the root.
    pub fn teardown<D>(self, dma: &D)
    where
        D: DmaAllocator + ?Sized,
    {
        self.table.release(dma);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::{Stage2Context, STE0};
    use crate::master::TranslationStage;
    use crate::mock::MockDma;

    #[test]
    fn test_linear_table_defaults_to_abort() {
        let dma = MockDma::new();
        let table = StreamTable::new(&dma, 4, true, 8).unwrap();
        assert_eq!(table.layout(), TableLayout::Linear);
        for sid in 0..16 {
            assert!(table.read(sid).unwrap().is_abort());
        }
        assert_eq!(table.base_cfg_value(), 4);
        table.teardown(&dma);
        assert_eq!(dma.live(), 0);
    }

    #[test]
    fn test_two_level_split6_sid130() {
        let dma = MockDma::new();
        let mut table = StreamTable::new(&dma, 10, true, 6).unwrap();
        assert_eq!(table.layout(), TableLayout::TwoLevel { split: 6 });
        assert_eq!(table.base_cfg_value(), (1 << 16) | (6 << 6) | 10);
        assert!(table.get_entry(130).is_none());

        table.ensure_leaf(&dma, 130).unwrap();
        let loc = table.get_entry(130).unwrap();
        assert_eq!(loc.group, 2);
        assert_eq!(loc.slot, 130 & 63);

        let leaf = table.leaf_phys(2).unwrap();
        let desc = table.level1_descriptor(2).unwrap();
        assert_eq!(desc & !0x3f, leaf);
        assert_eq!(desc & 0x1f, 7);
        assert!(table.read(130).unwrap().is_abort());

        table.teardown(&dma);
        assert_eq!(dma.live(), 0);
    }

    #[test]
    fn test_two_level_needs_wide_sids() {
        let dma = MockDma::new();
        let table = StreamTable::new(&dma, 6, true, 6).unwrap();
        assert_eq!(table.layout(), TableLayout::Linear);
        table.teardown(&dma);
    }

    #[test]
    fn test_base_register_value() {
        let dma = MockDma::new();
        let table = StreamTable::new(&dma, 2, false, 8).unwrap();
        let base = table.base_register_value();
        assert_eq!(base & !(1 << 62), table.table.root_phys());
        assert_ne!(base & (1 << 62), 0);
        table.teardown(&dma);
    }

    #[test]
    fn test_write_master_round_trip() {
        let dma = MockDma::new();
        let mut table = StreamTable::new(&dma, 8, false, 8).unwrap();

        let mut master = Master::new(0x21);
        master.stage = Some(TranslationStage::Stage2);
        master.s2 = Stage2Context {
            vmid: 0,
            vttbr: 0x8_4000_0000,
            vtcr: 0x2_3590,
        };
        table.write_master(0x21, Some(&master)).unwrap();

        let ste = table.read(0x21).unwrap();
        assert_eq!(ste, master.stream_table_entry().unwrap());
        assert!(matches!(ste.config(), Some(STE0::CONFIG::Value::Stage2)));
        assert_eq!(ste.s2_ttb(), 0x8_4000_0000);

        // Same master twice gives the same STE
        table.write_master(0x21, Some(&master)).unwrap();
        assert_eq!(table.read(0x21).unwrap(), ste);

        table.write_master(0x21, None).unwrap();
        assert!(table.read(0x21).unwrap().is_abort());

        assert_eq!(table.ensure_leaf(&dma, 0x100), Err(SmmuError::StreamIdOutOfRange(0x100)));
        table.teardown(&dma);
    }

    #[test]
    fn test_update_sets_dcp() {
        let dma = MockDma::new();
        let mut table = StreamTable::new(&dma, 4, false, 8).unwrap();
        let ste = table.update(3, |ste| ste.set_dcp(true)).unwrap();
        assert!(ste.dcp());
        assert!(table.read(3).unwrap().dcp());
        assert!(table.read(3).unwrap().is_abort());
        table.teardown(&dma);
    }
}
