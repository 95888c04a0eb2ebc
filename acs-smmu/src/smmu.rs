//! SMMU context
//!
//! [`Smmu`] owns every discovered device and the master registry, and
//! exposes the operations test payloads drive: lifecycle (`init`/`stop`),
//! per-device translation toggles, per-stream mapping, capability queries,
//! event queue dumps and the STE DCP probe.
//!
//! # Example
//!
//! ```ignore
//! let mut smmu = Smmu::new(platform, allocator, GenericTimer, SmmuConfig::default())?;
//! smmu.init()?;
//!
//! let attrs = MasterAttributes {
//!     smmu_index: 0,
//!     streamid: 0x10,
//!     substreamid: 0,
//!     ssid_bits: 0,
//!     stage: TranslationStage::Stage2,
//! };
//! smmu.map(&attrs, &pgt)?;
//! // ... DMA through the mapping ...
//! smmu.unmap(&attrs)?;
//! smmu.stop();
//! ```

use alloc::vec::Vec;

use acs_mmio::{Clock, DmaAllocator, RegisterIo};

use crate::cdtab::CdTable;
use crate::config::{SMMUV3_ARCH_MAJOR, SmmuConfig};
use crate::descriptors::{Stage1Context, Stage2Context};
use crate::device::SmmuDevice;
use crate::error::SmmuError;
use crate::evtq::DrainReport;
use crate::master::{
    MasterAttributes, MasterRegistry, PageTableDescriptor, Stage1Config, TranslationStage,
};
use crate::traits::{SmmuInfo, Topology};

/// All SMMUs of a platform and the masters mapped through them.
pub struct Smmu<T: Topology, D: DmaAllocator, C: Clock> {
    topology: T,
    dma: D,
    clock: C,
    config: SmmuConfig,
    /// One slot per platform SMMU; `None` for skipped or failed devices
    devices: Vec<Option<SmmuDevice<T::Io>>>,
    masters: MasterRegistry,
    initialised: bool,
}

impl<T: Topology, D: DmaAllocator, C: Clock> Smmu<T, D, C> {
    /// Create an uninitialised context.
    pub fn new(topology: T, dma: D, clock: C, config: SmmuConfig) -> Result<Self, SmmuError> {
        config.validate()?;
        Ok(Self {
            topology,
            dma,
            clock,
            config,
            devices: Vec::new(),
            masters: MasterRegistry::new(),
            initialised: false,
        })
    }

    /// Discover and initialise every SMMUv3 on the platform.
    ///
    /// Devices with another architecture revision are skipped. The first
    /// device that fails to initialise stops discovery and its error is
    /// returned; devices initialised before it stay up until [`stop`].
    ///
    /// [`stop`]: Self::stop
    pub fn init(&mut self) -> Result<(), SmmuError> {
        if self.initialised {
            return Err(SmmuError::AlreadyInitialised);
        }

        let count = self.topology.smmu_count();
        if count == 0 {
            log::error!("SMMU: platform reports no SMMU");
            return Err(SmmuError::NoSmmu);
        }

        self.initialised = true;
        self.devices.reserve(count);

        for index in 0..count {
            let arch = self.topology.arch_major_rev(index);
            if arch != SMMUV3_ARCH_MAJOR {
                log::warn!("SMMU{}: version {} not supported, skipping", index, arch);
                self.devices.push(None);
                continue;
            }

            let base = self.topology.base_address(index);
            let regs = self.topology.map_registers(base);
            match SmmuDevice::init(index, base, regs, &self.dma, &self.clock, &self.config) {
                Ok(device) => {
                    log::info!("SMMU{}: initialised at {:#x}", index, base);
                    self.devices.push(Some(device));
                }
                Err(e) => {
                    log::error!("SMMU{}: init failed: {}", index, e);
                    self.devices.push(None);
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Disable every device and free all queues, tables and masters.
    pub fn stop(&mut self) {
        for mut device in self.devices.drain(..).flatten() {
            device.shutdown(&self.clock);
            device.release(&self.dma);
        }
        self.masters.clear(&self.dma);
        self.initialised = false;
    }

    /// Enable translation on device `index`.
    pub fn enable(&mut self, index: usize) -> Result<(), SmmuError> {
        self.ensure_initialised()?;
        device_at(&mut self.devices, index)?.enable(&self.clock)
    }

    /// Disable translation on device `index`.
    pub fn disable(&mut self, index: usize) -> Result<(), SmmuError> {
        self.ensure_initialised()?;
        device_at(&mut self.devices, index)?.disable(&self.clock)
    }

    /// Configure translation for a master.
    ///
    /// Request validation happens before any state changes: an error from
    /// it leaves no mapped master behind.
    pub fn map(
        &mut self,
        attrs: &MasterAttributes,
        pgt: &PageTableDescriptor,
    ) -> Result<(), SmmuError> {
        self.ensure_initialised()?;
        let index = attrs.smmu_index;
        let sid = attrs.streamid;
        let device = device_at(&mut self.devices, index)?;
        let caps = *device.capabilities();

        match attrs.stage {
            TranslationStage::Nested => {
                log::error!("SMMU{}: stage-1 and stage-2 in one STE not supported", index);
                return Err(SmmuError::MixedStageUnsupported);
            }
            TranslationStage::Stage1 if !caps.features.s1p => {
                log::error!("SMMU{}: stage-1 translation not supported", index);
                return Err(SmmuError::StageUnsupported(TranslationStage::Stage1));
            }
            TranslationStage::Stage2 if !caps.features.s2p => {
                log::error!("SMMU{}: stage-2 translation not supported", index);
                return Err(SmmuError::StageUnsupported(TranslationStage::Stage2));
            }
            _ => {}
        }

        if !device.strtab().contains(sid) {
            log::error!("SMMU{}: sid {:#x} out of range", index, sid);
            return Err(SmmuError::StreamIdOutOfRange(sid));
        }
        if let Some(owner) = self.masters.get(sid).and_then(|m| m.smmu()) {
            if owner != index {
                log::error!("SMMU{}: sid {:#x} already mapped on SMMU{}", index, sid, owner);
                return Err(SmmuError::StreamIdInUse(sid));
            }
        }

        let ssid_bits = match self.masters.get(sid) {
            Some(master) if master.is_mapped() => master.ssid_bits,
            _ => attrs.ssid_bits,
        };
        if attrs.stage == TranslationStage::Stage1 {
            if ssid_bits > caps.ssid_bits {
                log::error!("SMMU{}: {} ssid bits exceed device", index, ssid_bits);
                return Err(SmmuError::SsidBitsExceedDevice(ssid_bits));
            }
            if u64::from(attrs.substreamid) >= 1u64 << ssid_bits {
                return Err(SmmuError::SubstreamIdOutOfRange(attrs.substreamid));
            }
        }

        device.strtab_mut().ensure_leaf(&self.dma, sid)?;

        let master = self.masters.lookup_or_create(sid);
        let was_mapped = master.is_mapped();
        let prior = (master.stage, master.ssid_bits, master.smmu, master.s2);
        let mut stale = None;
        match attrs.stage {
            TranslationStage::Stage2 => {
                master.s2 = Stage2Context {
                    vmid: 0,
                    vttbr: pgt.pgt_base,
                    vtcr: pgt.tcr.vtcr(),
                };
                stale = master.s1.take();
            }
            _ => {
                let context = Stage1Context {
                    asid: 0,
                    ttbr: pgt.pgt_base,
                    tcr: pgt.tcr.cd_tcr(),
                    mair: pgt.mair,
                };
                if master.s1.is_none() {
                    let cdtab =
                        CdTable::alloc(&self.dma, ssid_bits, caps.features.two_level_cdtab)?;
                    master.s1 = Some(Stage1Config { cdtab, context });
                }
                let written = match master.s1.as_mut() {
                    Some(s1) => s1
                        .cdtab
                        .write(&self.dma, attrs.substreamid, &context)
                        .map(|()| s1.context = context),
                    None => Ok(()),
                };
                if let Err(e) = written {
                    if !was_mapped {
                        master.reset(&self.dma);
                    }
                    return Err(e);
                }
                master.ssid = attrs.substreamid;
            }
        }

        master.stage = Some(attrs.stage);
        master.ssid_bits = ssid_bits;
        master.smmu = Some(index);

        let committed = device
            .strtab_mut()
            .write_master(sid, Some(&*master))
            .and_then(|()| device.invalidate_all(&self.clock));
        if let Err(e) = committed {
            log::error!("SMMU{}: sid {:#x} map failed: {}", index, sid, e);
            if was_mapped {
                (master.stage, master.ssid_bits, master.smmu, master.s2) = prior;
                if stale.is_some() {
                    master.s1 = stale;
                }
            } else {
                master.reset(&self.dma);
            }
            // Put back the entry the device saw before this call
            if device.strtab_mut().write_master(sid, Some(&*master)).is_err() {
                log::error!("SMMU{}: sid {:#x} STE restore failed", index, sid);
            }
            return Err(e);
        }

        if let Some(s1) = stale {
            s1.cdtab.free(&self.dma);
        }
        log::debug!("SMMU{}: sid {:#x} mapped {:?}", index, sid, attrs.stage);
        Ok(())
    }

    /// Remove a master's translation, leaving its STE aborting.
    ///
    /// Does nothing for a stream ID that was never mapped.
    pub fn unmap(&mut self, attrs: &MasterAttributes) -> Result<(), SmmuError> {
        let sid = attrs.streamid;
        let Some(master) = self.masters.get_mut(sid) else {
            return Ok(());
        };
        let Some(index) = master.smmu() else {
            return Ok(());
        };

        let device = device_at(&mut self.devices, index)?;
        device.strtab_mut().write_master(sid, None)?;
        device.invalidate_all(&self.clock)?;
        master.reset(&self.dma);

        log::debug!("SMMU{}: sid {:#x} unmapped", index, sid);
        Ok(())
    }

    /// Query a device attribute.
    ///
    /// Probed widths are answered from the device; everything else comes
    /// from the platform topology. Unknown devices read as zero.
    pub fn get_info(&self, field: SmmuInfo, index: usize) -> u64 {
        if field == SmmuInfo::Count {
            return self.topology.info(field, index);
        }
        if index >= self.topology.smmu_count() {
            log::error!("SMMU: get_info: invalid SMMU index {}", index);
            return 0;
        }

        let caps = self
            .devices
            .get(index)
            .and_then(Option::as_ref)
            .map(|device| *device.capabilities());
        match field {
            SmmuInfo::SsidBits => caps.map_or(0, |c| c.ssid_bits.into()),
            SmmuInfo::InputAddressSize => caps.map_or(0, |c| c.ias.into()),
            SmmuInfo::OutputAddressSize => caps.map_or(0, |c| c.oas.into()),
            _ => self.topology.info(field, index),
        }
    }

    /// Drain and log the event queue of every SMMUv3.
    pub fn dump_event_queue(&mut self) -> Vec<(usize, DrainReport)> {
        log::info!("SMMU: event queue dump starting");
        let mut reports = Vec::new();

        for (index, slot) in self.devices.iter_mut().enumerate() {
            if self.topology.arch_major_rev(index) != SMMUV3_ARCH_MAJOR {
                log::warn!("SMMU{}: not an SMMUv3, skipping", index);
                continue;
            }
            if let Some(device) = slot {
                log::info!("SMMU{}: event queue", index);
                reports.push((index, device.drain_events()));
            }
        }

        log::info!("SMMU: event queue dump finished");
        reports
    }

    /// Set or clear STE.DCP for a stream and return the resulting bit.
    pub fn config_ste_dcp(
        &mut self,
        attrs: &MasterAttributes,
        enable: bool,
    ) -> Result<bool, SmmuError> {
        self.ensure_initialised()?;
        let index = attrs.smmu_index;
        let sid = attrs.streamid;
        let device = device_at(&mut self.devices, index)?;
        if !device.strtab().contains(sid) {
            return Err(SmmuError::StreamIdOutOfRange(sid));
        }

        let ste = device.strtab_mut().update(sid, |ste| ste.set_dcp(enable))?;
        log::info!(
            "SMMU{}: STE[{:#x}] {:#018x} {:#018x} {:#018x} {:#018x}",
            index,
            sid,
            ste.dwords[0],
            ste.dwords[1],
            ste.dwords[2],
            ste.dwords[3]
        );
        device.invalidate_all(&self.clock)?;
        Ok(ste.dcp())
    }

    /// Device `index`, if it was initialised.
    #[must_use]
    pub fn device(&self, index: usize) -> Option<&SmmuDevice<T::Io>> {
        self.devices.get(index).and_then(Option::as_ref)
    }

    #[inline]
    #[must_use]
    pub const fn masters(&self) -> &MasterRegistry {
        &self.masters
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &SmmuConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub const fn allocator(&self) -> &D {
        &self.dma
    }

    #[inline]
    #[must_use]
    pub const fn is_initialised(&self) -> bool {
        self.initialised
    }

    fn ensure_initialised(&self) -> Result<(), SmmuError> {
        if self.initialised {
            Ok(())
        } else {
            Err(SmmuError::NotInitialised)
        }
    }
}

fn device_at<R: RegisterIo>(
    devices: &mut [Option<SmmuDevice<R>>],
    index: usize,
) -> Result<&mut SmmuDevice<R>, SmmuError> {
    match devices.get_mut(index) {
        Some(Some(device)) => Ok(device),
        Some(None) => {
            log::error!("SMMU{}: device unsupported", index);
            Err(SmmuError::Unsupported)
        }
        None => {
            log::error!("SMMU: invalid SMMU index {}", index);
            Err(SmmuError::InvalidIndex(index))
        }
    }
}
