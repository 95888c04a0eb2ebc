//! Engine configuration and architectural limits

use core::time::Duration;

use crate::error::SmmuError;

/// Architecture major revision this engine drives
pub const SMMUV3_ARCH_MAJOR: u32 = 3;

/// Stream ID width cap (64K stream table entries)
pub const MAX_SID_BITS: u8 = 16;

/// Default log2 of STEs per level-2 stream table
pub const DEFAULT_STRTAB_SPLIT: u8 = 8;

/// Log2 of CDs per level-2 context descriptor table (64KB leaves)
pub const CDTAB_SPLIT: u8 = 10;

/// Smallest command queue allocation in bytes
pub const CMDQ_MIN_BYTES: usize = 32;

/// Smallest event queue allocation in bytes
pub const EVTQ_MIN_BYTES: usize = 64;

/// Default cap on log2 command queue entries
pub const DEFAULT_CMDQ_MAX_LOG2: u8 = 8;

/// Default cap on log2 event queue entries
pub const DEFAULT_EVTQ_MAX_LOG2: u8 = 7;

/// Default budget for queue space and command completion
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Default budget for CR0 acknowledgement
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(100);

/// Widest SPLIT the STRTAB_BASE_CFG field can hold
const MAX_STRTAB_SPLIT: u8 = 24;

/// Tunables for an [`Smmu`](crate::Smmu) context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmmuConfig {
    /// Log2 of STEs per level-2 stream table
    pub strtab_split: u8,
    /// Cap on the probed stream ID width
    pub max_sid_bits: u8,
    /// Cap on the probed command queue size (log2 entries)
    pub cmdq_max_log2: u8,
    /// Cap on the probed event queue size (log2 entries)
    pub evtq_max_log2: u8,
    /// Budget for queue space and command completion polls
    pub poll_timeout: Duration,
    /// Budget for CR0 acknowledgement polls
    pub ack_timeout: Duration,
}

impl Default for SmmuConfig {
    fn default() -> Self {
        Self {
            strtab_split: DEFAULT_STRTAB_SPLIT,
            max_sid_bits: MAX_SID_BITS,
            cmdq_max_log2: DEFAULT_CMDQ_MAX_LOG2,
            evtq_max_log2: DEFAULT_EVTQ_MAX_LOG2,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

impl SmmuConfig {
    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), SmmuError> {
        if self.strtab_split == 0 || self.strtab_split > MAX_STRTAB_SPLIT {
            return Err(SmmuError::InvalidConfig);
        }
        if self.max_sid_bits == 0 || self.max_sid_bits > 32 {
            return Err(SmmuError::InvalidConfig);
        }
        // IDR1.CMDQS/EVENTQS are 5-bit fields
        if self.cmdq_max_log2 > 19 || self.evtq_max_log2 > 19 {
            return Err(SmmuError::InvalidConfig);
        }
        if self.poll_timeout.is_zero() || self.ack_timeout.is_zero() {
            return Err(SmmuError::InvalidConfig);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SmmuConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.strtab_split, 8);
        assert_eq!(config.max_sid_bits, 16);
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad_split = SmmuConfig {
            strtab_split: 0,
            ..SmmuConfig::default()
        };
        assert_eq!(bad_split.validate(), Err(SmmuError::InvalidConfig));

        let wide_split = SmmuConfig {
            strtab_split: 25,
            ..SmmuConfig::default()
        };
        assert_eq!(wide_split.validate(), Err(SmmuError::InvalidConfig));

        let no_timeout = SmmuConfig {
            ack_timeout: Duration::ZERO,
            ..SmmuConfig::default()
        };
        assert_eq!(no_timeout.validate(), Err(SmmuError::InvalidConfig));
    }
}
