//! Lazily Populated Two-Level Tables
//!
//! The stream table and every context descriptor table share one shape:
//! either a flat array of 64-byte entries, or a root array of 8-byte level-1
//! descriptors each pointing at a leaf of `2^split` entries.
//!
//! ```text
//!   index = | group (index >> split) | slot (index & (2^split - 1)) |
//!
//!   root (L1)            leaves (L2)
//! +----------+        +-------+-------+-----+
//! | desc 0   |------->| E0    | E1    | ... |
//! +----------+        +-------+-------+-----+
//! | desc 1 0 |   (not present until first use)
//! +----------+
//! ```
//!
//! Linear tables are fully populated at construction. Two-level tables
//! only allocate the root; leaves appear through [`SparseTable::ensure_leaf`]
//! and are reclaimed together in [`SparseTable::release`].

use alloc::vec::Vec;
use core::marker::PhantomData;

use acs_mmio::write_barrier;

use crate::error::SmmuError;
use crate::traits::{DmaAllocator, DmaRegion, dma_alloc, table_align};

/// Bytes per level-1 descriptor
const L1_DESC_SIZE: usize = 8;

/// An entry type that can live in a [`SparseTable`].
pub trait TableEntry: Copy {
    /// Number of 64-bit words in one entry
    const DWORDS: usize;

    /// Value every entry holds before it is first written.
    fn initial() -> Self;

    /// The words in memory order.
    fn dwords(&self) -> &[u64];

    /// Rebuild an entry from its words.
    fn from_dwords(words: &[u64]) -> Self;

    /// Level-1 descriptor pointing at a leaf of `2^split` entries.
    fn level1_descriptor(leaf_phys: u64, split: u8) -> u64;

    /// Size of one entry in bytes.
    #[inline]
    fn size() -> usize {
        Self::DWORDS * 8
    }
}

/// Table shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableLayout {
    Linear,
    TwoLevel { split: u8 },
}

/// Where an entry lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    /// Level-1 group (always 0 for linear tables)
    pub group: usize,
    /// Entry index within the leaf (or the linear table)
    pub slot: usize,
    /// Physical address of the entry
    pub phys: u64,
}

/// A linear or two-level table of `E` in DMA memory.
pub struct SparseTable<E: TableEntry> {
    layout: TableLayout,
    entries: usize,
    root: DmaRegion,
    leaves: Vec<Option<DmaRegion>>,
    _entry: PhantomData<E>,
}

impl<E: TableEntry> SparseTable<E> {
    /// Allocate a linear table of `entries` entries, all set to
    /// [`TableEntry::initial`].
    pub fn linear<D>(dma: &D, entries: usize) -> Result<Self, SmmuError>
    where
        D: DmaAllocator + ?Sized,
    {
        let size = entries * E::size();
        let root = dma_alloc(dma, size, table_align(size))?;
        let initial = E::initial();
        for index in 0..entries {
            store(&root, index, &initial);
        }

        Ok(Self {
            layout: TableLayout::Linear,
            entries,
            root,
            leaves: Vec::new(),
            _entry: PhantomData,
        })
    }

    /// Allocate the level-1 root of a two-level table covering `entries`
    /// entries in leaves of `2^split`. Every descriptor starts not present.
    pub fn two_level<D>(dma: &D, entries: usize, split: u8) -> Result<Self, SmmuError>
    where
        D: DmaAllocator + ?Sized,
    {
        let groups = entries.div_ceil(1 << split).max(1);
        let size = groups * L1_DESC_SIZE;
        let root = dma_alloc(dma, size, table_align(size))?;

        let mut leaves = Vec::with_capacity(groups);
        leaves.resize_with(groups, || None);

        Ok(Self {
            layout: TableLayout::TwoLevel { split },
            entries,
            root,
            leaves,
            _entry: PhantomData,
        })
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> TableLayout {
        self.layout
    }

    /// Number of addressable entries.
    #[inline]
    #[must_use]
    pub const fn entries(&self) -> usize {
        self.entries
    }

    /// Physical address of the linear table or the level-1 root.
    #[inline]
    #[must_use]
    pub fn root_phys(&self) -> u64 {
        self.root.phys()
    }

    /// Split an index into its group and in-leaf slot.
    #[inline]
    fn split_index(&self, index: usize) -> (usize, usize) {
        match self.layout {
            TableLayout::Linear => (0, index),
            TableLayout::TwoLevel { split } => (index >> split, index & ((1 << split) - 1)),
        }
    }

    /// Region and slot backing `index`, if present.
    fn backing(&self, index: usize) -> Option<(&DmaRegion, usize, usize)> {
        if index >= self.entries {
            return None;
        }
        let (group, slot) = self.split_index(index);
        match self.layout {
            TableLayout::Linear => Some((&self.root, group, slot)),
            TableLayout::TwoLevel { .. } => self.leaves[group]
                .as_ref()
                .map(|leaf| (leaf, group, slot)),
        }
    }

    /// Find the entry for `index`.
    ///
    /// Returns `None` when the index is out of range or its leaf has not
    /// been allocated yet.
    #[must_use]
    pub fn locate(&self, index: usize) -> Option<EntryLocation> {
        self.backing(index).map(|(region, group, slot)| EntryLocation {
            group,
            slot,
            phys: region.phys() + (slot * E::size()) as u64,
        })
    }

    /// Make sure the leaf covering `index` exists, allocating it and
    /// publishing its level-1 descriptor if not. No-op for linear tables.
    pub fn ensure_leaf<D>(&mut self, dma: &D, index: usize) -> Result<(), SmmuError>
    where
        D: DmaAllocator + ?Sized,
    {
        if index >= self.entries {
            return Err(SmmuError::IndexOutOfRange(index));
        }
        let TableLayout::TwoLevel { split } = self.layout else {
            return Ok(());
        };

        let group = index >> split;
        if self.leaves[group].is_some() {
            return Ok(());
        }

        let size = (1usize << split) * E::size();
        let leaf = dma_alloc(dma, size, table_align(size))?;
        let initial = E::initial();
        for slot in 0..(1usize << split) {
            store(&leaf, slot, &initial);
        }

        // Leaf contents must be visible before the descriptor points at them
        write_barrier();
        self.root
            .write_u64(group, E::level1_descriptor(leaf.phys(), split));

        log::trace!(
            "SMMU: leaf {} at {:#x} ({} entries)",
            group,
            leaf.phys(),
            1usize << split
        );
        self.leaves[group] = Some(leaf);
        Ok(())
    }

    /// Read the entry at `index`.
    pub fn read(&self, index: usize) -> Result<E, SmmuError> {
        let (region, _, slot) = self.backing_or_err(index)?;
        Ok(load(region, slot))
    }

    /// Write the entry at `index`.
    ///
    /// Words above the first are stored before word 0, with a barrier in
    /// between, so the device never sees a valid word 0 next to stale
    /// upper words.
    pub fn write(&mut self, index: usize, entry: &E) -> Result<(), SmmuError> {
        let (region, _, slot) = self.backing_or_err(index)?;
        store(region, slot, entry);
        Ok(())
    }

    /// Read-modify-write the entry at `index`, returning the new value.
    pub fn update<F>(&mut self, index: usize, f: F) -> Result<E, SmmuError>
    where
        F: FnOnce(&mut E),
    {
        let mut entry = self.read(index)?;
        f(&mut entry);
        self.write(index, &entry)?;
        Ok(entry)
    }

    fn backing_or_err(&self, index: usize) -> Result<(&DmaRegion, usize, usize), SmmuError> {
        if index >= self.entries {
            return Err(SmmuError::IndexOutOfRange(index));
        }
        self.backing(index).ok_or(SmmuError::LeafNotPresent(index))
    }

    /// Raw level-1 descriptor of `group` (two-level tables only).
    #[must_use]
    pub fn level1_descriptor(&self, group: usize) -> Option<u64> {
        match self.layout {
            TableLayout::Linear => None,
            TableLayout::TwoLevel { .. } if group < self.leaves.len() => {
                Some(self.root.read_u64(group))
            }
            TableLayout::TwoLevel { .. } => None,
        }
    }

    /// Physical address of the leaf for `group`, if allocated.
    #[must_use]
    pub fn leaf_phys(&self, group: usize) -> Option<u64> {
        self.leaves
            .get(group)
            .and_then(Option::as_ref)
            .map(DmaRegion::phys)
    }

    /// Number of leaves currently allocated.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.leaves.iter().filter(|leaf| leaf.is_some()).count()
    }

    /// Return every leaf and the root to the allocator.
    pub fn release<D>(self, dma: &D)
    where
        D: DmaAllocator + ?Sized,
    {
        for leaf in self.leaves.into_iter().flatten() {
            // SAFETY: The leaf came from this allocator and the caller has
            // detached the table from the device
            unsafe { dma.free(leaf) };
        }
        // SAFETY: As above
        unsafe { dma.free(self.root) };
    }
}

fn load<E: TableEntry>(region: &DmaRegion, slot: usize) -> E {
    let base = slot * E::DWORDS;
    let mut words = [0u64; 8];
    for (i, word) in words.iter_mut().take(E::DWORDS).enumerate() {
        *word = region.read_u64(base + i);
    }
    E::from_dwords(&words[..E::DWORDS])
}

fn store<E: TableEntry>(region: &DmaRegion, slot: usize, entry: &E) {
    let base = slot * E::DWORDS;
    let words = entry.dwords();
    for i in (1..E::DWORDS).rev() {
        region.write_u64(base + i, words[i]);
    }
    write_barrier();
    region.write_u64(base, words[0]);
}
