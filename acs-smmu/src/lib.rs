//! ARM SMMUv3 Engine for Compliance Testing
//!
//! Brings SMMUv3 devices up from reset and drives them through their
//! memory-resident interfaces: the command queue, the event queue, the
//! stream table and per-master context descriptor tables.
//!
//! # Modules
//!
//! - [`registers`]: Register offsets and bitfields
//! - [`descriptors`]: STE, CD and level-1 descriptor encodings
//! - [`cmdq`] / [`evtq`]: Command and event queues
//! - [`sparse`]: Lazily allocated one- or two-level tables
//! - [`strtab`] / [`cdtab`]: Stream and context descriptor tables
//! - [`master`]: Per-stream configuration and the master registry
//! - [`device`]: Probe, reset and enable of one SMMU
//! - [`smmu`]: The context object exposing the engine's operations
//!
//! # Example
//!
//! ```ignore
//! use acs_smmu::{Smmu, SmmuConfig, SmmuInfo};
//!
//! let mut smmu = Smmu::new(platform, allocator, GenericTimer, SmmuConfig::default())?;
//! smmu.init()?;
//! let ssid_bits = smmu.get_info(SmmuInfo::SsidBits, 0);
//! for (index, report) in smmu.dump_event_queue() {
//!     // ...
//! }
//! smmu.stop();
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod cdtab;
pub mod cmdq;
pub mod config;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod evtq;
pub mod master;
pub mod registers;
pub mod smmu;
pub mod sparse;
pub mod strtab;
pub mod traits;

#[cfg(test)]
mod mock;

// Re-exports for convenience
pub use config::SmmuConfig;
pub use descriptors::TcrAttributes;
pub use error::{ErrorClass, SmmuError};
pub use evtq::{DrainReport, FaultKind};
pub use master::{MasterAttributes, PageTableDescriptor, TranslationStage};
pub use smmu::Smmu;
pub use traits::{SmmuInfo, Topology};
