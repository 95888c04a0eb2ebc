//! ARM SMMUv3 device
//!
//! One [`SmmuDevice`] per physical SMMU. It owns the device's command
//! queue, event queue and stream table, and drives the control registers.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialised -> Probed -> QueuesReady -> TablesReady -> Enabled <-> Disabled
//! ```
//!
//! [`SmmuDevice::init`] walks the first four states and finishes with
//! [`SmmuDevice::reset`]; any failure on the way releases what was
//! allocated and the device is not created. Every CR0 write waits for
//! CR0ACK to reflect it before continuing.

use core::time::Duration;

use acs_mmio::{Clock, RegisterIo};
use tock_registers::{
    interfaces::{Readable, ReadWriteable, Writeable},
    registers::InMemoryRegister,
};

use crate::cmdq::CommandQueue;
use crate::config::SmmuConfig;
use crate::error::SmmuError;
use crate::evtq::{DrainReport, EventQueue};
use crate::registers::*;
use crate::strtab::StreamTable;
use crate::traits::DmaAllocator;

/// Position in the device lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Uninitialised,
    /// Capabilities read and accepted
    Probed,
    /// Command and event queues allocated
    QueuesReady,
    /// Stream table allocated
    TablesReady,
    /// Queues running and translation enabled
    Enabled,
    /// Queues running, translation disabled
    Disabled,
}

/// Features reported by IDR0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    pub two_level_strtab: bool,
    pub two_level_cdtab: bool,
    /// EL2 StreamWorld (TLBI_EL2_ALL is issued)
    pub hyp: bool,
    pub s1p: bool,
    pub s2p: bool,
}

/// Probed capabilities of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub features: Features,
    /// Input address size in bits
    pub ias: u8,
    /// Output address size in bits
    pub oas: u8,
    pub sid_bits: u8,
    pub ssid_bits: u8,
    /// Command queue size (log2 entries), clamped to the configured cap
    pub cmdq_log2: u8,
    /// Event queue size (log2 entries), clamped to the configured cap
    pub evtq_log2: u8,
}

/// Read and validate the identification registers.
pub fn probe<R: RegisterIo + ?Sized>(
    regs: &R,
    config: &SmmuConfig,
) -> Result<Capabilities, SmmuError> {
    let idr0 = InMemoryRegister::<u32, IDR0::Register>::new(regs.read32(SMMU_IDR0));
    let idr1 = InMemoryRegister::<u32, IDR1::Register>::new(regs.read32(SMMU_IDR1));
    let idr5 = InMemoryRegister::<u32, IDR5::Register>::new(regs.read32(SMMU_IDR5));

    let st_level: Option<IDR0::ST_LEVEL::Value> = idr0.read_as_enum(IDR0::ST_LEVEL);
    let mut features = Features {
        two_level_strtab: matches!(st_level, Some(IDR0::ST_LEVEL::Value::TwoLevel)),
        two_level_cdtab: idr0.is_set(IDR0::CD2L),
        hyp: idr0.is_set(IDR0::HYP),
        s1p: idr0.is_set(IDR0::S1P),
        s2p: idr0.is_set(IDR0::S2P),
    };

    if !features.s1p && !features.s2p {
        log::error!("SMMU: no translation stage supported");
        return Err(SmmuError::NoTranslationStage);
    }

    let ttf: Option<IDR0::TTF::Value> = idr0.read_as_enum(IDR0::TTF);
    let mut ias = match ttf {
        Some(IDR0::TTF::Value::AArch32AArch64) => 40,
        Some(IDR0::TTF::Value::AArch64) => 0,
        _ => {
            let raw = idr0.read(IDR0::TTF);
            log::error!("SMMU: AArch64 table format not supported (TTF={:#x})", raw);
            return Err(SmmuError::UnknownTranslationFormat(raw));
        }
    };

    if idr1.is_set(IDR1::TABLES_PRESET) {
        log::error!("SMMU: fixed table base address not supported");
        return Err(SmmuError::PresetTables);
    }
    if idr1.is_set(IDR1::QUEUES_PRESET) {
        log::error!("SMMU: fixed queue base address not supported");
        return Err(SmmuError::PresetQueues);
    }

    let sid_bits = (idr1.read(IDR1::SIDSIZE) as u8).min(config.max_sid_bits);
    let ssid_bits = idr1.read(IDR1::SSIDSIZE) as u8;
    if sid_bits <= config.strtab_split {
        features.two_level_strtab = false;
    }

    let oas_index = idr5.read(IDR5::OAS);
    let oas = *OAS_BITS.get(oas_index as usize).ok_or_else(|| {
        log::error!("SMMU: unknown output address size {:#x}", oas_index);
        SmmuError::OutputSizeOutOfRange(oas_index)
    })?;
    ias = ias.max(oas);

    Ok(Capabilities {
        features,
        ias,
        oas,
        sid_bits,
        ssid_bits,
        cmdq_log2: (idr1.read(IDR1::CMDQS) as u8).min(config.cmdq_max_log2),
        evtq_log2: (idr1.read(IDR1::EVENTQS) as u8).min(config.evtq_max_log2),
    })
}

/// One initialised SMMUv3.
pub struct SmmuDevice<R: RegisterIo> {
    index: usize,
    base: u64,
    regs: R,
    caps: Capabilities,
    state: DeviceState,
    cmdq: CommandQueue,
    evtq: EventQueue,
    strtab: StreamTable,
    poll_timeout: Duration,
    ack_timeout: Duration,
}

impl<R: RegisterIo> SmmuDevice<R> {
    /// Probe, allocate queues and tables, and reset the device at `base`.
    pub fn init<D, C>(
        index: usize,
        base: u64,
        regs: R,
        dma: &D,
        clock: &C,
        config: &SmmuConfig,
    ) -> Result<Self, SmmuError>
    where
        D: DmaAllocator + ?Sized,
        C: Clock + ?Sized,
    {
        let mut state = DeviceState::Uninitialised;

        let caps = probe(&regs, config)?;
        log::debug!(
            "SMMU{}: {:?} ias={} oas={} sid_bits={} ssid_bits={}",
            index,
            caps.features,
            caps.ias,
            caps.oas,
            caps.sid_bits,
            caps.ssid_bits
        );
        state = transition(index, state, DeviceState::Probed);

        let cmdq = CommandQueue::new(dma, caps.cmdq_log2)?;
        let evtq = match EventQueue::new(dma, caps.evtq_log2) {
            Ok(evtq) => evtq,
            Err(e) => {
                cmdq.release(dma);
                return Err(e);
            }
        };
        state = transition(index, state, DeviceState::QueuesReady);

        let strtab = match StreamTable::new(
            dma,
            caps.sid_bits,
            caps.features.two_level_strtab,
            config.strtab_split,
        ) {
            Ok(strtab) => strtab,
            Err(e) => {
                cmdq.release(dma);
                evtq.release(dma);
                return Err(e);
            }
        };
        state = transition(index, state, DeviceState::TablesReady);

        let mut device = Self {
            index,
            base,
            regs,
            caps,
            state,
            cmdq,
            evtq,
            strtab,
            poll_timeout: config.poll_timeout,
            ack_timeout: config.ack_timeout,
        };

        if let Err(e) = device.reset(clock) {
            device.release(dma);
            return Err(e);
        }
        Ok(device)
    }

    /// Program tables and queues and bring the device up with translation
    /// enabled.
    pub fn reset<C: Clock + ?Sized>(&mut self, clock: &C) -> Result<(), SmmuError> {
        self.write_cr0_sync(clock, 0).inspect_err(|_| {
            log::error!("SMMU{}: failed to clear CR0", self.index);
        })?;

        let cr1 = InMemoryRegister::<u32, CR1::Register>::new(0);
        cr1.write(
            CR1::TABLE_SH::InnerShareable
                + CR1::TABLE_OC::WriteBack
                + CR1::TABLE_IC::WriteBack
                + CR1::QUEUE_SH::InnerShareable
                + CR1::QUEUE_OC::WriteBack
                + CR1::QUEUE_IC::WriteBack,
        );
        self.regs.write32(SMMU_CR1, cr1.get());
        self.regs.write32(SMMU_CR2, 0);

        self.regs
            .write64(SMMU_STRTAB_BASE, self.strtab.base_register_value());
        self.regs
            .write32(SMMU_STRTAB_BASE_CFG, self.strtab.base_cfg_value());

        self.cmdq.program(&self.regs);
        let cr0 = InMemoryRegister::<u32, CR0::Register>::new(0);
        cr0.write(CR0::CMDQEN::SET);
        self.write_cr0_sync(clock, cr0.get()).inspect_err(|_| {
            log::error!("SMMU{}: failed to enable command queue", self.index);
        })?;

        self.invalidate_all(clock)?;

        self.evtq.program(&self.regs);
        cr0.modify(CR0::EVENTQEN::SET);
        self.write_cr0_sync(clock, cr0.get()).inspect_err(|_| {
            log::error!("SMMU{}: failed to enable event queue", self.index);
        })?;

        cr0.modify(CR0::SMMUEN::SET);
        self.write_cr0_sync(clock, cr0.get()).inspect_err(|_| {
            log::error!("SMMU{}: failed to enable translation", self.index);
        })?;

        self.state = transition(self.index, self.state, DeviceState::Enabled);
        Ok(())
    }

    /// Write CR0 and wait for CR0ACK to match.
    fn write_cr0_sync<C: Clock + ?Sized>(&self, clock: &C, value: u32) -> Result<(), SmmuError> {
        self.regs.write32(SMMU_CR0, value);
        if self
            .regs
            .poll32(SMMU_CR0ACK, |ack| ack == value, clock, self.ack_timeout)
        {
            Ok(())
        } else {
            log::error!(
                "SMMU{}: CR0ACK timeout (CR0={:#x} CR0ACK={:#x})",
                self.index,
                value,
                self.regs.read32(SMMU_CR0ACK)
            );
            Err(SmmuError::AckTimeout)
        }
    }

    fn set_translation<C: Clock + ?Sized>(
        &mut self,
        clock: &C,
        enable: bool,
    ) -> Result<(), SmmuError> {
        let cr0 = InMemoryRegister::<u32, CR0::Register>::new(self.regs.read32(SMMU_CR0));
        if enable {
            cr0.modify(CR0::SMMUEN::SET);
        } else {
            cr0.modify(CR0::SMMUEN::CLEAR);
        }
        self.write_cr0_sync(clock, cr0.get())?;

        let next = if enable {
            DeviceState::Enabled
        } else {
            DeviceState::Disabled
        };
        self.state = transition(self.index, self.state, next);
        Ok(())
    }

    /// Turn translation on, leaving the queues running.
    pub fn enable<C: Clock + ?Sized>(&mut self, clock: &C) -> Result<(), SmmuError> {
        self.set_translation(clock, true)
    }

    /// Turn translation off, leaving the queues running.
    pub fn disable<C: Clock + ?Sized>(&mut self, clock: &C) -> Result<(), SmmuError> {
        self.set_translation(clock, false)
    }

    /// Run the invalidation sequence after a table update.
    pub fn invalidate_all<C: Clock + ?Sized>(&mut self, clock: &C) -> Result<(), SmmuError> {
        self.cmdq
            .invalidate_all(&self.regs, clock, self.poll_timeout, self.caps.features.hyp)
    }

    /// Consume and report every pending event.
    pub fn drain_events(&mut self) -> DrainReport {
        self.evtq.drain_all(&self.regs, self.index)
    }

    /// Clear CR0, stopping translation and both queues.
    pub fn shutdown<C: Clock + ?Sized>(&mut self, clock: &C) {
        if self.write_cr0_sync(clock, 0).is_err() {
            log::error!("SMMU{}: failed to clear CR0", self.index);
        }
        self.state = transition(self.index, self.state, DeviceState::Disabled);
    }

    /// Return queues and tables to the allocator.
    pub fn release<D>(self, dma: &D)
    where
        D: DmaAllocator + ?Sized,
    {
        self.cmdq.release(dma);
        self.evtq.release(dma);
        self.strtab.teardown(dma);
    }

    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Physical base of the register frame.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    #[inline]
    #[must_use]
    pub const fn state(&self) -> DeviceState {
        self.state
    }

    #[inline]
    #[must_use]
    pub const fn regs(&self) -> &R {
        &self.regs
    }

    #[inline]
    #[must_use]
    pub const fn strtab(&self) -> &StreamTable {
        &self.strtab
    }

    #[inline]
    pub fn strtab_mut(&mut self) -> &mut StreamTable {
        &mut self.strtab
    }
}

fn transition(index: usize, from: DeviceState, to: DeviceState) -> DeviceState {
    log::debug!("SMMU{}: {:?} -> {:?}", index, from, to);
    to
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdq::opcode;
    use crate::mock::{MockDma, MockIdr, MockRegs};
    use crate::sparse::TableLayout;
    use acs_mmio::TickClock;
    use alloc::vec;

    fn clock() -> TickClock {
        TickClock::new(Duration::from_micros(10))
    }

    fn config() -> SmmuConfig {
        SmmuConfig {
            strtab_split: 6,
            ..SmmuConfig::default()
        }
    }

    #[test]
    fn test_probe_full_featured() {
        let regs = MockRegs::with_idr(MockIdr::full().sid_bits(10));
        let caps = probe(&regs, &config()).unwrap();
        assert!(caps.features.two_level_strtab);
        assert!(caps.features.two_level_cdtab);
        assert!(caps.features.s1p && caps.features.s2p);
        assert_eq!(caps.sid_bits, 10);
        assert_eq!(caps.oas, 48);
        assert_eq!(caps.ias, 48);
    }

    #[test]
    fn test_probe_clamps_and_drops_two_level() {
        let regs = MockRegs::with_idr(MockIdr::full().sid_bits(20));
        let caps = probe(&regs, &config()).unwrap();
        assert_eq!(caps.sid_bits, 16);
        assert_eq!(caps.cmdq_log2, 8);
        assert_eq!(caps.evtq_log2, 7);

        let regs = MockRegs::with_idr(MockIdr::full().sid_bits(6));
        assert!(!probe(&regs, &config()).unwrap().features.two_level_strtab);
    }

    #[test]
    fn test_probe_aarch32_tables_raise_ias() {
        let regs = MockRegs::with_idr(MockIdr::full().ttf(3).oas(0));
        let caps = probe(&regs, &config()).unwrap();
        assert_eq!(caps.oas, 32);
        assert_eq!(caps.ias, 40);
    }

    #[test]
    fn test_probe_rejections() {
        let none = MockRegs::with_idr(MockIdr::full().no_stage1().no_stage2());
        assert_eq!(probe(&none, &config()), Err(SmmuError::NoTranslationStage));

        let aarch32 = MockRegs::with_idr(MockIdr::full().ttf(1));
        assert_eq!(
            probe(&aarch32, &config()),
            Err(SmmuError::UnknownTranslationFormat(1))
        );

        let preset = MockRegs::with_idr(MockIdr::full().tables_preset());
        assert_eq!(probe(&preset, &config()), Err(SmmuError::PresetTables));

        let preset = MockRegs::with_idr(MockIdr::full().queues_preset());
        assert_eq!(probe(&preset, &config()), Err(SmmuError::PresetQueues));

        let oas = MockRegs::with_idr(MockIdr::full().oas(7));
        assert_eq!(probe(&oas, &config()), Err(SmmuError::OutputSizeOutOfRange(7)));
    }

    #[test]
    fn test_init_runs_reset_sequence() {
        let dma = MockDma::new();
        let regs = MockRegs::with_idr(MockIdr::full().sid_bits(10));
        let device =
            SmmuDevice::init(0, 0x2b40_0000, regs.clone(), &dma, &clock(), &config()).unwrap();

        assert_eq!(device.state(), DeviceState::Enabled);
        assert_eq!(regs.read32(SMMU_CR0), 0b1101);
        assert_eq!(regs.read32(SMMU_CR1), 0xD75);
        assert_eq!(regs.read32(SMMU_CR2), 0);
        assert_eq!(regs.read32(SMMU_STRTAB_BASE_CFG), (1 << 16) | (6 << 6) | 10);
        assert_eq!(regs.read64(SMMU_STRTAB_BASE), device.strtab().base_register_value());
        assert_eq!(device.strtab().layout(), TableLayout::TwoLevel { split: 6 });
        assert_eq!(
            regs.commands(),
            vec![
                opcode::CFGI_ALL,
                opcode::TLBI_EL2_ALL,
                opcode::TLBI_NSNH_ALL,
                opcode::CMD_SYNC
            ]
        );
        assert_ne!(regs.read64(SMMU_EVENTQ_BASE), 0);

        device.release(&dma);
        assert_eq!(dma.live(), 0);
    }

    #[test]
    fn test_ack_timeout_releases_everything() {
        let dma = MockDma::new();
        let regs = MockRegs::with_idr(MockIdr::full().sid_bits(8));
        regs.set_ack(false);
        let result = SmmuDevice::init(0, 0, regs.clone(), &dma, &clock(), &config());
        assert!(matches!(result, Err(SmmuError::AckTimeout)));
        assert_eq!(dma.live(), 0);
    }

    #[test]
    fn test_alloc_failure_rolls_back() {
        // Fail the command queue, event queue and stream table in turn
        for successes in 0..3 {
            let dma = MockDma::new();
            let regs = MockRegs::with_idr(MockIdr::full().sid_bits(8));
            dma.fail_after(successes);
            let result = SmmuDevice::init(0, 0, regs, &dma, &clock(), &config());
            assert!(matches!(result, Err(SmmuError::AllocFailed)));
            assert_eq!(dma.live(), 0);
        }
    }

    #[test]
    fn test_enable_disable() {
        let dma = MockDma::new();
        let regs = MockRegs::with_idr(MockIdr::full().sid_bits(8));
        let mut device = SmmuDevice::init(0, 0, regs.clone(), &dma, &clock(), &config()).unwrap();

        device.disable(&clock()).unwrap();
        assert_eq!(device.state(), DeviceState::Disabled);
        assert_eq!(regs.read32(SMMU_CR0), 0b1100);

        device.enable(&clock()).unwrap();
        assert_eq!(device.state(), DeviceState::Enabled);
        assert_eq!(regs.read32(SMMU_CR0ACK), 0b1101);

        regs.set_ack(false);
        assert_eq!(device.disable(&clock()), Err(SmmuError::AckTimeout));
        assert_eq!(device.state(), DeviceState::Enabled);

        device.release(&dma);
    }
}
