//! Error types for the SMMU engine

use core::fmt;

use crate::master::TranslationStage;

/// Broad category of an [`SmmuError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The device lacks a feature; permanent for that device
    Unsupported,
    /// A DMA allocation failed
    ResourceExhausted,
    /// A bounded wait on the hardware ran out
    Timeout,
    /// The caller asked for something out of range; nothing was changed
    InvalidArgument,
}

/// Errors that can occur during SMMU operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmmuError {
    /// Platform reports no SMMU
    NoSmmu,
    /// Device is not an SMMUv3
    NotV3,
    /// Device failed probe or initialisation and is not usable
    Unsupported,
    /// Neither stage-1 nor stage-2 translation is implemented
    NoTranslationStage,
    /// Translation table format is not AArch64
    UnknownTranslationFormat(u32),
    /// IDR5.OAS encoding outside the architected range
    OutputSizeOutOfRange(u32),
    /// Table base addresses are fixed by hardware
    PresetTables,
    /// Queue base addresses are fixed by hardware
    PresetQueues,
    /// Requested translation stage not implemented by the device
    StageUnsupported(TranslationStage),
    /// Combined stage-1 and stage-2 translation in one STE
    MixedStageUnsupported,
    /// DMA memory allocation failed
    AllocFailed,
    /// CR0ACK did not reflect a CR0 write in time
    AckTimeout,
    /// Command queue stayed full until the deadline
    QueueFull,
    /// SMMU index beyond the discovered devices
    InvalidIndex(usize),
    /// Stream ID beyond the device's stream table
    StreamIdOutOfRange(u32),
    /// Substream ID beyond the master's context descriptor table
    SubstreamIdOutOfRange(u32),
    /// Requested substream width wider than the device implements
    SsidBitsExceedDevice(u8),
    /// Stream ID already mapped through a different SMMU
    StreamIdInUse(u32),
    /// Table index beyond the table's entry count
    IndexOutOfRange(usize),
    /// Level-2 table for the index has not been allocated
    LeafNotPresent(usize),
    /// Command opcode the encoder does not know
    UnsupportedCommand(u8),
    /// Configuration values rejected
    InvalidConfig,
    /// Operation needs a prior successful `init`
    NotInitialised,
    /// `init` called twice without `stop`
    AlreadyInitialised,
}

impl SmmuError {
    /// Which class of failure this is.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::NoSmmu
            | Self::NotV3
            | Self::Unsupported
            | Self::NoTranslationStage
            | Self::UnknownTranslationFormat(_)
            | Self::OutputSizeOutOfRange(_)
            | Self::PresetTables
            | Self::PresetQueues
            | Self::StageUnsupported(_)
            | Self::MixedStageUnsupported => ErrorClass::Unsupported,
            Self::AllocFailed => ErrorClass::ResourceExhausted,
            Self::AckTimeout | Self::QueueFull => ErrorClass::Timeout,
            Self::InvalidIndex(_)
            | Self::StreamIdOutOfRange(_)
            | Self::SubstreamIdOutOfRange(_)
            | Self::SsidBitsExceedDevice(_)
            | Self::StreamIdInUse(_)
            | Self::IndexOutOfRange(_)
            | Self::LeafNotPresent(_)
            | Self::UnsupportedCommand(_)
            | Self::InvalidConfig
            | Self::NotInitialised
            | Self::AlreadyInitialised => ErrorClass::InvalidArgument,
        }
    }
}

impl fmt::Display for SmmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSmmu => write!(f, "no SMMU found"),
            Self::NotV3 => write!(f, "not an SMMUv3"),
            Self::Unsupported => write!(f, "SMMU not supported"),
            Self::NoTranslationStage => write!(f, "no translation stage supported"),
            Self::UnknownTranslationFormat(ttf) => {
                write!(f, "AArch64 table format not supported (TTF={ttf:#x})")
            }
            Self::OutputSizeOutOfRange(oas) => write!(f, "unknown output address size {oas:#x}"),
            Self::PresetTables => write!(f, "fixed table base address not supported"),
            Self::PresetQueues => write!(f, "fixed queue base address not supported"),
            Self::StageUnsupported(stage) => write!(f, "{stage:?} translation not supported"),
            Self::MixedStageUnsupported => write!(f, "mixed stage-1/stage-2 STE not supported"),
            Self::AllocFailed => write!(f, "DMA allocation failed"),
            Self::AckTimeout => write!(f, "timed out waiting for CR0ACK"),
            Self::QueueFull => write!(f, "command queue full"),
            Self::InvalidIndex(index) => write!(f, "invalid SMMU index {index}"),
            Self::StreamIdOutOfRange(sid) => write!(f, "stream ID {sid:#x} out of range"),
            Self::SubstreamIdOutOfRange(ssid) => write!(f, "substream ID {ssid:#x} out of range"),
            Self::SsidBitsExceedDevice(bits) => {
                write!(f, "{bits} substream ID bits exceed the device")
            }
            Self::StreamIdInUse(sid) => write!(f, "stream ID {sid:#x} mapped on another SMMU"),
            Self::IndexOutOfRange(index) => write!(f, "table index {index:#x} out of range"),
            Self::LeafNotPresent(index) => write!(f, "no level-2 table for index {index:#x}"),
            Self::UnsupportedCommand(op) => write!(f, "unsupported command opcode {op:#x}"),
            Self::InvalidConfig => write!(f, "invalid configuration"),
            Self::NotInitialised => write!(f, "SMMU not initialised"),
            Self::AlreadyInitialised => write!(f, "SMMU already initialised"),
        }
    }
}
