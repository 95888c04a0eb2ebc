//! Event Queue
//!
//! The SMMU produces 32-byte fault records into a DMA ring and advances
//! SMMU_EVENTQ_PROD (page 1); software consumes them and publishes
//! SMMU_EVENTQ_CONS. Bit 31 of the producer toggles when the device had to
//! drop records; software acknowledges by copying it into the consumer.

use alloc::vec::Vec;
use core::fmt;

use acs_mmio::ring::{OVERFLOW_FLAG, wrap_mask};
use acs_mmio::{RegisterIo, Ring, read_barrier};
use tock_registers::{
    interfaces::{Readable, Writeable},
    register_bitfields,
    registers::InMemoryRegister,
};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::EVTQ_MIN_BYTES;
use crate::error::SmmuError;
use crate::registers::{
    GERROR, QUEUE_BASE, SMMU_EVENTQ_BASE, SMMU_EVENTQ_CONS, SMMU_EVENTQ_PROD, SMMU_GERROR,
    SMMU_GERRORN,
};
use crate::traits::{DmaAllocator, DmaRegion, dma_alloc};

register_bitfields![u64,
    /// Event record word 0
    EVT0 [
        ID OFFSET(0) NUMBITS(8) [],
        /// Substream ID valid
        SSV OFFSET(11) NUMBITS(1) [],
        SUBSTREAMID OFFSET(12) NUMBITS(20) [],
        STREAMID OFFSET(32) NUMBITS(32) []
    ]
];

/// Event Queue Entry - 32 bytes
#[repr(C, align(32))]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct EventEntry {
    pub dwords: [u64; 4],
}

impl EventEntry {
    /// Size of an event entry in bytes.
    pub const SIZE: usize = 32;

    #[inline]
    fn word0(&self) -> InMemoryRegister<u64, EVT0::Register> {
        InMemoryRegister::new(self.dwords[0])
    }

    /// Event type.
    #[inline]
    #[must_use]
    pub fn event_id(&self) -> u8 {
        self.word0().read(EVT0::ID) as u8
    }

    /// Stream ID of the faulting transaction.
    #[inline]
    #[must_use]
    pub fn stream_id(&self) -> u32 {
        self.word0().read(EVT0::STREAMID) as u32
    }

    /// Substream ID, when the record carries one.
    #[inline]
    #[must_use]
    pub fn substream_id(&self) -> Option<u32> {
        let w0 = self.word0();
        w0.is_set(EVT0::SSV)
            .then(|| w0.read(EVT0::SUBSTREAMID) as u32)
    }

    /// Input address of the faulting transaction (where applicable).
    #[inline]
    #[must_use]
    pub const fn input_address(&self) -> u64 {
        self.dwords[2]
    }
}

/// Decoded event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    UnsupportedUpstreamTransaction,
    StreamIdOutOfRange,
    SteFetchAbort,
    BadSte,
    BadAtsRequest,
    StreamDisabled,
    TranslationForbidden,
    BadSubstreamId,
    CdFetchAbort,
    BadCd,
    WalkAbort,
    Translation,
    AddressSize,
    Access,
    Permission,
    TlbConflict,
    ConfigCacheConflict,
    PageRequest,
    VmsFetchAbort,
    /// Event ID the architecture does not define
    Invalid(u8),
}

impl FaultKind {
    /// Map an event ID to its kind.
    #[must_use]
    pub const fn classify(id: u8) -> Self {
        match id {
            0x01 => Self::UnsupportedUpstreamTransaction,
            0x02 => Self::StreamIdOutOfRange,
            0x03 => Self::SteFetchAbort,
            0x04 => Self::BadSte,
            0x05 => Self::BadAtsRequest,
            0x06 => Self::StreamDisabled,
            0x07 => Self::TranslationForbidden,
            0x08 => Self::BadSubstreamId,
            0x09 => Self::CdFetchAbort,
            0x0A => Self::BadCd,
            0x0B => Self::WalkAbort,
            0x10 => Self::Translation,
            0x11 => Self::AddressSize,
            0x12 => Self::Access,
            0x13 => Self::Permission,
            0x20 => Self::TlbConflict,
            0x21 => Self::ConfigCacheConflict,
            0x24 => Self::PageRequest,
            0x25 => Self::VmsFetchAbort,
            other => Self::Invalid(other),
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedUpstreamTransaction => write!(f, "unsupported upstream transaction"),
            Self::StreamIdOutOfRange => write!(f, "transaction stream ID out of range"),
            Self::SteFetchAbort => write!(f, "STE fetch caused external abort"),
            Self::BadSte => write!(f, "used STE invalid"),
            Self::BadAtsRequest => write!(f, "address translation request disallowed"),
            Self::StreamDisabled => write!(f, "non-substream transactions disabled"),
            Self::TranslationForbidden => write!(f, "forbidden translation"),
            Self::BadSubstreamId => write!(f, "bad substream ID"),
            Self::CdFetchAbort => write!(f, "CD fetch caused external abort"),
            Self::BadCd => write!(f, "fetched CD invalid"),
            Self::WalkAbort => write!(f, "table walk caused external abort"),
            Self::Translation => write!(f, "translation fault"),
            Self::AddressSize => write!(f, "address size fault"),
            Self::Access => write!(f, "access flag fault"),
            Self::Permission => write!(f, "permission fault"),
            Self::TlbConflict => write!(f, "TLB conflict"),
            Self::ConfigCacheConflict => write!(f, "configuration cache conflict"),
            Self::PageRequest => write!(f, "speculative page request hint"),
            Self::VmsFetchAbort => write!(f, "VMS fetch caused external abort"),
            Self::Invalid(id) => write!(f, "invalid fault {id:#04x}"),
        }
    }
}

/// One consumed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub entry: EventEntry,
    pub kind: FaultKind,
}

impl EventRecord {
    #[must_use]
    pub fn new(entry: EventEntry) -> Self {
        Self {
            kind: FaultKind::classify(entry.event_id()),
            entry,
        }
    }
}

/// Outcome of [`EventQueue::drain_all`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Events consumed, oldest first
    pub events: Vec<EventRecord>,
    /// The device signalled lost events
    pub overflowed: bool,
    /// GERROR reported an event queue abort; nothing was drained
    pub aborted: bool,
}

/// A device's event queue.
pub struct EventQueue {
    region: DmaRegion,
    ring: Ring,
}

impl EventQueue {
    /// Allocate a queue of `2^log2size` records.
    pub fn new<D>(dma: &D, log2size: u8) -> Result<Self, SmmuError>
    where
        D: DmaAllocator + ?Sized,
    {
        let bytes = ((1usize << log2size) * EventEntry::SIZE).max(EVTQ_MIN_BYTES);
        let region = dma_alloc(dma, bytes, bytes)?;

        log::debug!(
            "SMMU: event queue at {:#x}, {} entries",
            region.phys(),
            1usize << log2size
        );

        Ok(Self {
            region,
            ring: Ring::new(log2size),
        })
    }

    #[inline]
    #[must_use]
    pub const fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Value for SMMU_EVENTQ_BASE.
    #[must_use]
    pub fn base_register_value(&self) -> u64 {
        let base = InMemoryRegister::<u64, QUEUE_BASE::Register>::new(0);
        base.write(
            QUEUE_BASE::RWA::SET
                + QUEUE_BASE::ADDR.val(self.region.phys() >> 5)
                + QUEUE_BASE::LOG2SIZE.val(self.ring.log2size().into()),
        );
        base.get()
    }

    /// Program base, producer and consumer registers with an empty ring.
    pub fn program<R: RegisterIo + ?Sized>(&mut self, regs: &R) {
        self.ring.set_prod(0);
        self.ring.set_cons(0);
        regs.write64(SMMU_EVENTQ_BASE, self.base_register_value());
        regs.write32(SMMU_EVENTQ_PROD, 0);
        regs.write32(SMMU_EVENTQ_CONS, 0);
    }

    /// Consume the record at the consumer index, if the ring holds one.
    pub fn remove_one<R: RegisterIo + ?Sized>(&mut self, regs: &R) -> Option<EventEntry> {
        if self.ring.is_empty() {
            return None;
        }

        // Producer index was read before the record it covers
        read_barrier();
        let entry = self.region.read_entry::<EventEntry>(self.ring.cons_slot());
        let cons = self.ring.advance_cons();
        regs.write32(SMMU_EVENTQ_CONS, cons);
        Some(entry)
    }

    /// Reload the producer index from the device.
    ///
    /// Returns `true` if the overflow flag changed since the last sync.
    pub fn sync_prod<R: RegisterIo + ?Sized>(&mut self, regs: &R) -> bool {
        let prod = regs.read32(SMMU_EVENTQ_PROD);
        let overflowed = (prod & OVERFLOW_FLAG) != (self.ring.prod() & OVERFLOW_FLAG);
        self.ring.set_prod(prod);
        overflowed
    }

    /// Consume every pending record.
    ///
    /// Does nothing if GERROR shows the queue could not be written. The
    /// producer is re-read after each pass until a pass finds the ring
    /// empty; finally the overflow flag is acknowledged.
    pub fn drain_all<R: RegisterIo + ?Sized>(&mut self, regs: &R, index: usize) -> DrainReport {
        let mut report = DrainReport::default();

        if gerror_aborted(regs, index) {
            log::warn!("SMMU{}: GERROR set, event queue not writable", index);
            report.aborted = true;
            return report;
        }

        loop {
            while let Some(entry) = self.remove_one(regs) {
                let record = EventRecord::new(entry);
                log::info!(
                    "SMMU{}: event {:#04x} received: {} (sid={:#x} addr={:#x})",
                    index,
                    entry.event_id(),
                    record.kind,
                    entry.stream_id(),
                    entry.input_address()
                );
                log::info!(
                    "SMMU{}:   {:#018x} {:#018x} {:#018x} {:#018x}",
                    index,
                    entry.dwords[0],
                    entry.dwords[1],
                    entry.dwords[2],
                    entry.dwords[3]
                );
                report.events.push(record);
            }

            if self.sync_prod(regs) {
                log::warn!("SMMU{}: event queue overflow, events lost", index);
                report.overflowed = true;
            }
            if self.ring.is_empty() {
                break;
            }
        }

        if report.events.is_empty() {
            log::info!("SMMU{}: no outstanding events", index);
        }

        let log2size = self.ring.log2size();
        let cons = (self.ring.prod() & OVERFLOW_FLAG) | (self.ring.cons() & wrap_mask(log2size));
        self.ring.set_cons(cons);
        regs.write32(SMMU_EVENTQ_CONS, cons);

        report
    }

    /// Return the queue memory to the allocator.
    pub fn release<D>(self, dma: &D)
    where
        D: DmaAllocator + ?Sized,
    {
        // SAFETY: The caller has disabled the queue, so the device no longer
        // writes it
        unsafe { dma.free(self.region) };
    }
}

/// Check GERROR for event queue aborts, acknowledging everything else.
fn gerror_aborted<R: RegisterIo + ?Sized>(regs: &R, index: usize) -> bool {
    let gerror = regs.read32(SMMU_GERROR);
    let active = InMemoryRegister::<u32, GERROR::Register>::new(gerror ^ regs.read32(SMMU_GERRORN));

    if active.is_set(GERROR::MSI_EVTQ_ABT_ERR) {
        log::error!("SMMU{}: event queue MSI write aborted", index);
        return true;
    }
    if active.is_set(GERROR::EVTQ_ABT_ERR) {
        log::error!("SMMU{}: event queue write aborted, events may have been lost", index);
        return true;
    }

    regs.write32(SMMU_GERRORN, gerror);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDma, MockRegs};

    fn event(id: u8, sid: u32) -> EventEntry {
        EventEntry {
            dwords: [u64::from(id) | (u64::from(sid) << 32), 0, 0x4000_1000, 0],
        }
    }

    #[test]
    fn test_entry_fields() {
        let mut entry = event(0x10, 0x42);
        assert_eq!(entry.event_id(), 0x10);
        assert_eq!(entry.stream_id(), 0x42);
        assert_eq!(entry.substream_id(), None);
        assert_eq!(entry.input_address(), 0x4000_1000);

        entry.dwords[0] |= (1 << 11) | (5 << 12);
        assert_eq!(entry.substream_id(), Some(5));
    }

    #[test]
    fn test_bad_ste_distinct_from_invalid() {
        assert_eq!(FaultKind::classify(0x04), FaultKind::BadSte);
        assert!(!FaultKind::classify(0x04).is_invalid());
        assert_eq!(FaultKind::classify(0xFF), FaultKind::Invalid(0xFF));
        assert!(FaultKind::classify(0xFF).is_invalid());
        assert_eq!(FaultKind::classify(0x13), FaultKind::Permission);
        assert_eq!(FaultKind::classify(0x25), FaultKind::VmsFetchAbort);
        assert!(FaultKind::classify(0x0C).is_invalid());
    }

    #[test]
    fn test_drain_consumes_in_order() {
        let dma = MockDma::new();
        let regs = MockRegs::new();
        let mut evtq = EventQueue::new(&dma, 2).unwrap();
        evtq.program(&regs);

        regs.inject_event(event(0x04, 3));
        regs.inject_event(event(0xFF, 9));

        let report = evtq.drain_all(&regs, 0);
        assert!(!report.aborted);
        assert!(!report.overflowed);
        assert_eq!(report.events.len(), 2);
        assert_eq!(report.events[0].kind, FaultKind::BadSte);
        assert_eq!(report.events[0].entry.stream_id(), 3);
        assert_eq!(report.events[1].kind, FaultKind::Invalid(0xFF));
        assert_eq!(regs.read32(SMMU_EVENTQ_CONS), 2);
        assert!(evtq.ring().is_empty());

        // Nothing new: second drain is empty
        assert!(evtq.drain_all(&regs, 0).events.is_empty());
        evtq.release(&dma);
    }

    #[test]
    fn test_drain_wraps_ring() {
        let dma = MockDma::new();
        let regs = MockRegs::new();
        let mut evtq = EventQueue::new(&dma, 1).unwrap();
        evtq.program(&regs);

        for round in 0..3u32 {
            regs.inject_event(event(0x10, round));
            regs.inject_event(event(0x11, round));
            let report = evtq.drain_all(&regs, 0);
            assert_eq!(report.events.len(), 2);
            assert_eq!(report.events[1].kind, FaultKind::AddressSize);
            assert_eq!(report.events[1].entry.stream_id(), round);
        }
        evtq.release(&dma);
    }

    #[test]
    fn test_overflow_reported_and_acknowledged() {
        let dma = MockDma::new();
        let regs = MockRegs::new();
        let mut evtq = EventQueue::new(&dma, 2).unwrap();
        evtq.program(&regs);

        regs.inject_event(event(0x10, 1));
        regs.toggle_event_overflow();

        let report = evtq.drain_all(&regs, 0);
        assert!(report.overflowed);
        assert_eq!(report.events.len(), 1);
        let cons = regs.read32(SMMU_EVENTQ_CONS);
        assert_eq!(cons & OVERFLOW_FLAG, OVERFLOW_FLAG);
        assert_eq!(cons & !OVERFLOW_FLAG, 1);

        // Flag already acknowledged: no second report
        assert!(!evtq.drain_all(&regs, 0).overflowed);
        evtq.release(&dma);
    }

    #[test]
    fn test_gerror_abort_skips_drain() {
        let dma = MockDma::new();
        let regs = MockRegs::new();
        let mut evtq = EventQueue::new(&dma, 2).unwrap();
        evtq.program(&regs);

        regs.inject_event(event(0x10, 1));
        regs.raise_gerror(1 << 2);

        let report = evtq.drain_all(&regs, 0);
        assert!(report.aborted);
        assert!(report.events.is_empty());
        assert_eq!(regs.read32(SMMU_EVENTQ_CONS), 0);
        assert_eq!(regs.read32(SMMU_GERRORN), 0);
        evtq.release(&dma);
    }

    #[test]
    fn test_other_gerror_bits_acknowledged() {
        let dma = MockDma::new();
        let regs = MockRegs::new();
        let mut evtq = EventQueue::new(&dma, 2).unwrap();
        evtq.program(&regs);

        regs.raise_gerror(1);
        regs.inject_event(event(0x10, 1));

        let report = evtq.drain_all(&regs, 0);
        assert!(!report.aborted);
        assert_eq!(report.events.len(), 1);
        assert_eq!(regs.read32(SMMU_GERRORN), 1);
        evtq.release(&dma);
    }
}
