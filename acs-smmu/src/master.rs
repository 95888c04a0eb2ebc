//! Masters and the Master Registry
//!
//! A master is the translation configuration of one stream ID. Masters are
//! created on first `map`, reset (but kept) on `unmap`, and only dropped
//! when the whole engine stops.

use hashbrown::HashMap;

use crate::cdtab::CdTable;
use crate::descriptors::{Stage1Context, Stage2Context, StreamTableEntry, TcrAttributes};
use crate::error::SmmuError;
use crate::traits::DmaAllocator;

/// Stream identifier of an upstream device
pub type StreamId = u32;

/// Which translation stage(s) a master uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationStage {
    /// Stage 1 through a context descriptor
    Stage1,
    /// Stage 2 only
    Stage2,
    /// Stage 1 followed by stage 2
    Nested,
}

/// Description of the page tables a master should translate through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageTableDescriptor {
    /// Translation table base (TTB0 for stage 1, VTTBR for stage 2)
    pub pgt_base: u64,
    /// Memory attribute indirection (stage 1)
    pub mair: u64,
    pub tcr: TcrAttributes,
}

/// Caller's identification of a master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterAttributes {
    /// Which SMMU the master sits behind
    pub smmu_index: usize,
    pub streamid: StreamId,
    /// Substream whose CD is written (stage 1)
    pub substreamid: u32,
    /// Substream ID width; the CD table holds `2^ssid_bits` CDs
    pub ssid_bits: u8,
    pub stage: TranslationStage,
}

/// Stage-1 state: the CD table and the context written into it.
pub struct Stage1Config {
    pub cdtab: CdTable,
    pub context: Stage1Context,
}

/// Translation configuration of one stream ID.
pub struct Master {
    /// Index of the SMMU this master was mapped on; `None` until mapped
    pub(crate) smmu: Option<usize>,
    pub(crate) sid: StreamId,
    pub(crate) ssid_bits: u8,
    pub(crate) ssid: u32,
    pub(crate) stage: Option<TranslationStage>,
    pub(crate) s1: Option<Stage1Config>,
    pub(crate) s2: Stage2Context,
}

impl Master {
    /// A blank, unmapped master for `sid`.
    #[must_use]
    pub fn new(sid: StreamId) -> Self {
        Self {
            smmu: None,
            sid,
            ssid_bits: 0,
            ssid: 0,
            stage: None,
            s1: None,
            s2: Stage2Context::default(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn sid(&self) -> StreamId {
        self.sid
    }

    #[inline]
    #[must_use]
    pub const fn smmu(&self) -> Option<usize> {
        self.smmu
    }

    #[inline]
    #[must_use]
    pub const fn stage(&self) -> Option<TranslationStage> {
        self.stage
    }

    #[inline]
    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        self.smmu.is_some()
    }

    /// The CD table, if this master has one.
    #[must_use]
    pub fn cdtab(&self) -> Option<&CdTable> {
        self.s1.as_ref().map(|s1| &s1.cdtab)
    }

    /// STE encoding this master's configuration.
    ///
    /// A master with no stage gets an abort entry. A single STE never
    /// carries both stages.
    pub fn stream_table_entry(&self) -> Result<StreamTableEntry, SmmuError> {
        match self.stage {
            None => Ok(StreamTableEntry::abort()),
            Some(TranslationStage::Stage2) => Ok(StreamTableEntry::stage2(&self.s2)),
            Some(TranslationStage::Stage1) => {
                let s1 = self
                    .s1
                    .as_ref()
                    .ok_or(SmmuError::StageUnsupported(TranslationStage::Stage1))?;
                Ok(StreamTableEntry::stage1(
                    s1.cdtab.phys(),
                    s1.cdtab.s1cdmax(),
                    s1.cdtab.format(),
                ))
            }
            Some(TranslationStage::Nested) => Err(SmmuError::MixedStageUnsupported),
        }
    }

    /// Detach the CD table, leaving the master without stage-1 state.
    pub(crate) fn take_cdtab(&mut self) -> Option<CdTable> {
        self.s1.take().map(|s1| s1.cdtab)
    }

    /// Free the CD table and return every field to its unmapped value.
    pub(crate) fn reset<D>(&mut self, dma: &D)
    where
        D: DmaAllocator + ?Sized,
    {
        if let Some(cdtab) = self.take_cdtab() {
            cdtab.free(dma);
        }
        *self = Self::new(self.sid);
    }
}

/// Stream ID to master map. Entries are inserted on demand and never
/// removed individually.
#[derive(Default)]
pub struct MasterRegistry {
    masters: HashMap<StreamId, Master>,
}

impl MasterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            masters: HashMap::new(),
        }
    }

    /// The master for `sid`, creating a blank one if absent.
    pub fn lookup_or_create(&mut self, sid: StreamId) -> &mut Master {
        self.masters.entry(sid).or_insert_with(|| Master::new(sid))
    }

    #[must_use]
    pub fn get(&self, sid: StreamId) -> Option<&Master> {
        self.masters.get(&sid)
    }

    pub fn get_mut(&mut self, sid: StreamId) -> Option<&mut Master> {
        self.masters.get_mut(&sid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.masters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.masters.is_empty()
    }

    /// Free every master's CD table and forget all masters.
    pub fn clear<D>(&mut self, dma: &D)
    where
        D: DmaAllocator + ?Sized,
    {
        for (_, mut master) in self.masters.drain() {
            if let Some(cdtab) = master.take_cdtab() {
                cdtab.free(dma);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::{CdTableFormat, STE0};
    use crate::mock::MockDma;

    #[test]
    fn test_lookup_or_create_inserts_once() {
        let mut registry = MasterRegistry::new();
        assert!(registry.is_empty());

        let master = registry.lookup_or_create(7);
        assert_eq!(master.sid(), 7);
        assert!(!master.is_mapped());
        master.ssid_bits = 3;

        assert_eq!(registry.lookup_or_create(7).ssid_bits, 3);
        registry.lookup_or_create(9);
        assert_eq!(registry.len(), 2);
        assert!(registry.get(8).is_none());
    }

    #[test]
    fn test_unconfigured_master_aborts() {
        let master = Master::new(1);
        assert!(master.stream_table_entry().unwrap().is_abort());
    }

    #[test]
    fn test_nested_stage_rejected() {
        let mut master = Master::new(1);
        master.stage = Some(TranslationStage::Nested);
        assert_eq!(
            master.stream_table_entry(),
            Err(SmmuError::MixedStageUnsupported)
        );
    }

    #[test]
    fn test_stage1_entry_points_at_cd_table() {
        let dma = MockDma::new();
        let mut master = Master::new(4);
        master.stage = Some(TranslationStage::Stage1);
        master.s1 = Some(Stage1Config {
            cdtab: CdTable::alloc(&dma, 3, false).unwrap(),
            context: Stage1Context::default(),
        });

        let ste = master.stream_table_entry().unwrap();
        assert!(matches!(ste.config(), Some(STE0::CONFIG::Value::Stage1)));
        assert_eq!(ste.s1_context_ptr(), master.cdtab().unwrap().phys());
        assert_eq!(ste.s1cdmax(), 3);
        assert_eq!(master.cdtab().unwrap().format(), CdTableFormat::Linear);

        master.reset(&dma);
        assert!(master.cdtab().is_none());
        assert_eq!(master.stage(), None);
        assert_eq!(master.sid(), 4);
        assert_eq!(dma.live(), 0);
    }

    #[test]
    fn test_clear_frees_cd_tables() {
        let dma = MockDma::new();
        let mut registry = MasterRegistry::new();
        for sid in 0..3 {
            let master = registry.lookup_or_create(sid);
            master.s1 = Some(Stage1Config {
                cdtab: CdTable::alloc(&dma, 1, false).unwrap(),
                context: Stage1Context::default(),
            });
        }
        assert_eq!(dma.live(), 3);
        registry.clear(&dma);
        assert!(registry.is_empty());
        assert_eq!(dma.live(), 0);
    }
}
