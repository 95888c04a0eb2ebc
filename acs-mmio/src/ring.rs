//! Producer/Consumer Ring Indices
//!
//! SMMUv3 queues are power-of-two rings whose producer and consumer indices
//! carry one extra "wrap" bit above the index bits. The wrap bit toggles on
//! every lap, so full and empty are told apart without a separate counter:
//!
//! ```text
//!   31      log2+1   log2   log2-1          0
//! +-----+---------+------+------------------+
//! | OVF |   RES0  | WRAP |      INDEX       |
//! +-----+---------+------+------------------+
//! ```
//!
//! - empty: index and wrap bits both equal
//! - full: index bits equal, wrap bits differ
//!
//! Bit 31 is the overflow flag on the event queue producer (and its
//! acknowledgement on the consumer). Advancing an index preserves it.
//!
//! Both the command queue (driver produces) and the event queue (SMMU
//! produces) use the same arithmetic.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Queue overflow flag (producer) / overflow acknowledge (consumer).
pub const OVERFLOW_FLAG: u32 = 1 << 31;

/// Trait for queue records that can be safely placed in DMA memory.
///
/// Records must be POD types that can be copied to and from device-visible
/// memory as raw bytes.
pub trait QueueEntry:
    Copy + Default + Sized + FromBytes + IntoBytes + Immutable + KnownLayout
{
    /// Size of this entry type in bytes.
    const SIZE: usize = core::mem::size_of::<Self>();
}

// Blanket implementation for any type meeting the requirements
impl<T> QueueEntry for T where
    T: Copy + Default + Sized + FromBytes + IntoBytes + Immutable + KnownLayout
{
}

/// Mask of the index bits.
#[inline]
#[must_use]
pub const fn index_mask(log2size: u8) -> u32 {
    (1 << log2size) - 1
}

/// The wrap bit.
#[inline]
#[must_use]
pub const fn wrap_bit(log2size: u8) -> u32 {
    1 << log2size
}

/// Mask of the index bits plus the wrap bit.
#[inline]
#[must_use]
pub const fn wrap_mask(log2size: u8) -> u32 {
    (1 << (log2size + 1)) - 1
}

/// Slot in the ring addressed by `index`.
#[inline]
#[must_use]
pub const fn slot(index: u32, log2size: u8) -> usize {
    (index & index_mask(log2size)) as usize
}

/// Advance an index by one, wrapping at twice the capacity.
#[inline]
#[must_use]
pub const fn advance(index: u32, log2size: u8) -> u32 {
    (index & OVERFLOW_FLAG) | (((index & wrap_mask(log2size)) + 1) & wrap_mask(log2size))
}

/// Advance a producer index.
#[inline]
#[must_use]
pub const fn advance_producer(prod: u32, log2size: u8) -> u32 {
    advance(prod, log2size)
}

/// Advance a consumer index.
#[inline]
#[must_use]
pub const fn advance_consumer(cons: u32, log2size: u8) -> u32 {
    advance(cons, log2size)
}

/// The ring holds `2^log2size` unconsumed entries.
#[inline]
#[must_use]
pub const fn is_full(prod: u32, cons: u32, log2size: u8) -> bool {
    (prod & index_mask(log2size)) == (cons & index_mask(log2size))
        && (prod & wrap_bit(log2size)) != (cons & wrap_bit(log2size))
}

/// The ring holds no unconsumed entries.
#[inline]
#[must_use]
pub const fn is_empty(prod: u32, cons: u32, log2size: u8) -> bool {
    (prod & wrap_mask(log2size)) == (cons & wrap_mask(log2size))
}

/// Locally tracked state of one ring.
///
/// The raw register values are stored as-is (including the overflow flag
/// and any error field above the wrap bit); comparisons only look at the
/// index and wrap bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ring {
    log2size: u8,
    prod: u32,
    cons: u32,
}

impl Ring {
    /// Create an empty ring of `2^log2size` entries.
    #[inline]
    #[must_use]
    pub const fn new(log2size: u8) -> Self {
        Self {
            log2size,
            prod: 0,
            cons: 0,
        }
    }

    /// Log2 of the number of entries.
    #[inline]
    #[must_use]
    pub const fn log2size(&self) -> u8 {
        self.log2size
    }

    /// Number of entries.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        1 << self.log2size
    }

    /// Current producer index.
    #[inline]
    #[must_use]
    pub const fn prod(&self) -> u32 {
        self.prod
    }

    /// Current consumer index.
    #[inline]
    #[must_use]
    pub const fn cons(&self) -> u32 {
        self.cons
    }

    /// Overwrite the producer index (e.g. from the hardware register).
    #[inline]
    pub fn set_prod(&mut self, prod: u32) {
        self.prod = prod;
    }

    /// Overwrite the consumer index (e.g. from the hardware register).
    #[inline]
    pub fn set_cons(&mut self, cons: u32) {
        self.cons = cons;
    }

    /// Slot the producer index points at.
    #[inline]
    #[must_use]
    pub const fn prod_slot(&self) -> usize {
        slot(self.prod, self.log2size)
    }

    /// Slot the consumer index points at.
    #[inline]
    #[must_use]
    pub const fn cons_slot(&self) -> usize {
        slot(self.cons, self.log2size)
    }

    /// Check if the ring is full.
    #[inline]
    #[must_use]
    pub const fn is_full(&self) -> bool {
        is_full(self.prod, self.cons, self.log2size)
    }

    /// Check if the ring is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        is_empty(self.prod, self.cons, self.log2size)
    }

    /// Advance the producer index, returning the new value.
    #[inline]
    pub fn advance_prod(&mut self) -> u32 {
        self.prod = advance_producer(self.prod, self.log2size);
        self.prod
    }

    /// Advance the consumer index, returning the new value.
    #[inline]
    pub fn advance_cons(&mut self) -> u32 {
        self.cons = advance_consumer(self.cons, self.log2size);
        self.cons
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_wraps_at_twice_capacity() {
        // Capacity 4: indices run 0..8 with bit 2 as the wrap bit
        let mut idx = 0;
        let mut seen = [0u32; 9];
        for s in seen.iter_mut() {
            *s = idx;
            idx = advance(idx, 2);
        }
        assert_eq!(seen, [0, 1, 2, 3, 4, 5, 6, 7, 0]);
    }

    #[test]
    fn test_advance_preserves_overflow_flag() {
        assert_eq!(advance(OVERFLOW_FLAG | 7, 2), OVERFLOW_FLAG);
        assert_eq!(advance(OVERFLOW_FLAG | 3, 2), OVERFLOW_FLAG | 4);
    }

    #[test]
    fn test_full_after_capacity_enqueues() {
        let mut ring = Ring::new(2);
        assert!(ring.is_empty());
        for _ in 0..3 {
            ring.advance_prod();
            assert!(!ring.is_full());
        }
        ring.advance_prod();
        assert!(ring.is_full());
        assert_eq!(ring.prod_slot(), ring.cons_slot());
    }

    #[test]
    fn test_empty_after_consumer_catches_up() {
        let mut ring = Ring::new(3);
        for _ in 0..5 {
            ring.advance_prod();
        }
        for _ in 0..5 {
            assert!(!ring.is_empty());
            ring.advance_cons();
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_full_and_empty_never_both_hold() {
        // Deterministic pseudo-random mix of produce/consume steps
        for log2size in 0..6u8 {
            let mut ring = Ring::new(log2size);
            let mut outstanding = 0usize;
            let mut seed = 0x2545_f491u32;
            for _ in 0..2000 {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
                let produce = (seed >> 16) & 1 == 1;
                if produce && !ring.is_full() {
                    ring.advance_prod();
                    outstanding += 1;
                } else if !ring.is_empty() {
                    ring.advance_cons();
                    outstanding -= 1;
                }
                assert!(!(ring.is_full() && ring.is_empty()));
                assert_eq!(ring.is_empty(), outstanding == 0);
                assert_eq!(ring.is_full(), outstanding == ring.capacity());
            }
        }
    }

    #[test]
    fn test_comparisons_ignore_high_bits() {
        // CMDQ_CONS carries an error code in bits [30:24]
        let cons_with_err = (0x2 << 24) | 5;
        assert!(is_empty(5, cons_with_err, 2));
        assert!(is_full(1, cons_with_err, 2));
        assert!(is_empty(OVERFLOW_FLAG | 3, 3, 2));
    }
}
