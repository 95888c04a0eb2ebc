//! Simulated hardware for unit tests
//!
//! [`MockRegs`] is a register file that acknowledges CR0 writes, consumes
//! commands as soon as the producer index moves and lets tests inject
//! events. [`MockDma`] hands out heap memory whose physical address is its
//! pointer, so the simulated device can walk queues directly.

use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::ptr::{NonNull, read_volatile, write_volatile};

use acs_mmio::ring::{OVERFLOW_FLAG, advance, index_mask};
use acs_mmio::{DmaAllocator, DmaRegion, RegisterIo};

use crate::evtq::EventEntry;
use crate::registers::*;
use crate::traits::{SmmuInfo, Topology};

/// ID register contents for a simulated SMMU.
#[derive(Debug, Clone, Copy)]
pub struct MockIdr {
    pub idr0: u32,
    pub idr1: u32,
    pub idr5: u32,
}

impl MockIdr {
    /// Both stages, two-level tables, HYP, AArch64 tables, 48-bit OAS,
    /// 8 stream ID bits, 5 substream ID bits and large queues.
    pub fn full() -> Self {
        Self {
            idr0: 0b11 | (2 << 2) | (1 << 9) | (1 << 19) | (1 << 27),
            idr1: 8 | (5 << 6) | (19 << 16) | (19 << 21),
            idr5: 5,
        }
    }

    pub fn sid_bits(mut self, bits: u32) -> Self {
        self.idr1 = (self.idr1 & !0x3f) | bits;
        self
    }

    pub fn ssid_bits(mut self, bits: u32) -> Self {
        self.idr1 = (self.idr1 & !(0x1f << 6)) | (bits << 6);
        self
    }

    pub fn ttf(mut self, ttf: u32) -> Self {
        self.idr0 = (self.idr0 & !(0b11 << 2)) | (ttf << 2);
        self
    }

    pub fn oas(mut self, oas: u32) -> Self {
        self.idr5 = (self.idr5 & !0b111) | oas;
        self
    }

    pub fn no_stage1(mut self) -> Self {
        self.idr0 &= !(1 << 1);
        self
    }

    pub fn no_stage2(mut self) -> Self {
        self.idr0 &= !1;
        self
    }

    pub fn no_hyp(mut self) -> Self {
        self.idr0 &= !(1 << 9);
        self
    }

    pub fn tables_preset(mut self) -> Self {
        self.idr1 |= 1 << 30;
        self
    }

    pub fn queues_preset(mut self) -> Self {
        self.idr1 |= 1 << 29;
        self
    }
}

struct MockState {
    words: BTreeMap<usize, u32>,
    ack: bool,
    stalled: bool,
    commands: Vec<u8>,
}

/// Shared simulated register frame. Clones see the same registers.
#[derive(Clone)]
pub struct MockRegs(Rc<RefCell<MockState>>);

impl MockRegs {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(MockState {
            words: BTreeMap::new(),
            ack: true,
            stalled: false,
            commands: Vec::new(),
        })))
    }

    pub fn with_idr(idr: MockIdr) -> Self {
        let regs = Self::new();
        regs.poke(SMMU_IDR0, idr.idr0);
        regs.poke(SMMU_IDR1, idr.idr1);
        regs.poke(SMMU_IDR5, idr.idr5);
        regs
    }

    fn peek(&self, offset: usize) -> u32 {
        self.0.borrow().words.get(&offset).copied().unwrap_or(0)
    }

    fn poke(&self, offset: usize, value: u32) {
        self.0.borrow_mut().words.insert(offset, value);
    }

    /// Whether CR0 writes are mirrored into CR0ACK.
    pub fn set_ack(&self, ack: bool) {
        self.0.borrow_mut().ack = ack;
    }

    /// Stop (or resume) consuming commands. Resuming consumes everything
    /// already produced.
    pub fn stall_cmdq(&self, stalled: bool) {
        self.0.borrow_mut().stalled = stalled;
        if !stalled {
            self.consume_commands();
        }
    }

    /// Opcodes consumed so far, oldest first.
    pub fn commands(&self) -> Vec<u8> {
        self.0.borrow().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.0.borrow_mut().commands.clear();
    }

    fn queue_base(&self, offset: usize) -> (usize, u8) {
        let base = self.read64(offset);
        let addr = (base & (((1u64 << 47) - 1) << 5)) as usize;
        (addr, (base & 0x1f) as u8)
    }

    fn consume_commands(&self) {
        if self.0.borrow().stalled {
            return;
        }
        let (addr, log2size) = self.queue_base(SMMU_CMDQ_BASE);
        let prod = self.peek(SMMU_CMDQ_PROD);
        let mut cons = self.peek(SMMU_CMDQ_CONS);
        while cons != prod {
            let slot = (cons & index_mask(log2size)) as usize;
            // SAFETY: MockDma regions are mapped at their physical address
            let word0 = unsafe { read_volatile((addr + slot * 16) as *const u64) };
            self.0.borrow_mut().commands.push(word0 as u8);
            cons = advance(cons, log2size);
        }
        self.poke(SMMU_CMDQ_CONS, cons);
    }

    /// Produce one event record as the device would.
    pub fn inject_event(&self, entry: EventEntry) {
        let (addr, log2size) = self.queue_base(SMMU_EVENTQ_BASE);
        let prod = self.peek(SMMU_EVENTQ_PROD);
        let slot = (prod & index_mask(log2size)) as usize;
        for (i, dword) in entry.dwords.iter().enumerate() {
            // SAFETY: MockDma regions are mapped at their physical address
            unsafe { write_volatile((addr + slot * 32 + i * 8) as *mut u64, *dword) };
        }
        self.poke(SMMU_EVENTQ_PROD, advance(prod, log2size));
    }

    /// Flip the event queue overflow flag.
    pub fn toggle_event_overflow(&self) {
        let prod = self.peek(SMMU_EVENTQ_PROD);
        self.poke(SMMU_EVENTQ_PROD, prod ^ OVERFLOW_FLAG);
    }

    /// Toggle GERROR bits, activating the matching errors.
    pub fn raise_gerror(&self, bits: u32) {
        let gerror = self.peek(SMMU_GERROR);
        self.poke(SMMU_GERROR, gerror ^ bits);
    }
}

impl RegisterIo for MockRegs {
    fn read32(&self, offset: usize) -> u32 {
        self.peek(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.poke(offset, value);
        let ack = self.0.borrow().ack;
        match offset {
            SMMU_CR0 if ack => self.poke(SMMU_CR0ACK, value),
            SMMU_CMDQ_PROD => self.consume_commands(),
            _ => {}
        }
    }

    fn read64(&self, offset: usize) -> u64 {
        u64::from(self.peek(offset)) | (u64::from(self.peek(offset + 4)) << 32)
    }

    fn write64(&self, offset: usize, value: u64) {
        self.poke(offset, value as u32);
        self.poke(offset + 4, (value >> 32) as u32);
    }

    fn barrier(&self) {}
}

#[derive(Debug)]
pub struct MockAllocError;

/// Heap-backed DMA allocator with leak accounting and fault injection.
pub struct MockDma {
    live: Cell<usize>,
    allocations: Cell<usize>,
    last_size: Cell<usize>,
    fail_in: Cell<Option<usize>>,
}

impl MockDma {
    pub fn new() -> Self {
        Self {
            live: Cell::new(0),
            allocations: Cell::new(0),
            last_size: Cell::new(0),
            fail_in: Cell::new(None),
        }
    }

    /// Regions allocated and not yet freed.
    pub fn live(&self) -> usize {
        self.live.get()
    }

    /// Successful allocations over the allocator's lifetime.
    pub fn allocations(&self) -> usize {
        self.allocations.get()
    }

    pub fn last_size(&self) -> usize {
        self.last_size.get()
    }

    pub fn fail_next(&self) {
        self.fail_after(0);
    }

    /// Let `successes` allocations through, then fail one.
    pub fn fail_after(&self, successes: usize) {
        self.fail_in.set(Some(successes));
    }
}

impl DmaAllocator for MockDma {
    type Error = MockAllocError;

    fn alloc_zeroed(&self, size: usize, align: usize) -> Result<DmaRegion, Self::Error> {
        match self.fail_in.get() {
            Some(0) => {
                self.fail_in.set(None);
                return Err(MockAllocError);
            }
            Some(n) => self.fail_in.set(Some(n - 1)),
            None => {}
        }

        let layout = Layout::from_size_align(size, align).map_err(|_| MockAllocError)?;
        // SAFETY: Every table and queue has a non-zero size
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(MockAllocError)?;

        self.live.set(self.live.get() + 1);
        self.allocations.set(self.allocations.get() + 1);
        self.last_size.set(size);
        // SAFETY: Fresh allocation of `size` bytes, identity-mapped
        Ok(unsafe { DmaRegion::new(ptr, ptr.as_ptr() as u64, size, align) })
    }

    unsafe fn free(&self, region: DmaRegion) {
        self.live.set(self.live.get() - 1);
        if let Ok(layout) = Layout::from_size_align(region.size(), region.align()) {
            // SAFETY: The region came from `alloc_zeroed` with this layout
            unsafe { dealloc(region.as_ptr(), layout) };
        }
    }
}

/// One simulated SMMU instance.
pub struct MockSmmu {
    pub arch: u32,
    pub base: u64,
    pub regs: MockRegs,
}

impl MockSmmu {
    pub fn v3(base: u64, idr: MockIdr) -> Self {
        Self {
            arch: 3,
            base,
            regs: MockRegs::with_idr(idr),
        }
    }
}

pub struct MockTopology {
    pub smmus: Vec<MockSmmu>,
}

impl Topology for MockTopology {
    type Io = MockRegs;

    fn info(&self, field: SmmuInfo, index: usize) -> u64 {
        match field {
            SmmuInfo::Count => self.smmus.len() as u64,
            SmmuInfo::ArchMajorRev => self.smmus.get(index).map_or(0, |s| s.arch.into()),
            SmmuInfo::BaseAddress => self.smmus.get(index).map_or(0, |s| s.base),
            _ => 0,
        }
    }

    fn map_registers(&self, base: u64) -> MockRegs {
        self.smmus
            .iter()
            .find(|s| s.base == base)
            .map_or_else(MockRegs::new, |s| s.regs.clone())
    }
}
