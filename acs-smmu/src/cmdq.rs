//! Command Queue
//!
//! Software produces 16-byte commands into a DMA ring; the SMMU consumes
//! them and advances SMMU_CMDQ_CONS. A command becomes visible to the
//! device only when the new producer index is written to SMMU_CMDQ_PROD,
//! after a barrier that orders the entry write before it.

use core::time::Duration;

use acs_mmio::{Clock, RegisterIo, Ring, poll_until};
use tock_registers::{
    interfaces::{Readable, Writeable},
    register_bitfields,
    registers::InMemoryRegister,
};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::CMDQ_MIN_BYTES;
use crate::error::SmmuError;
use crate::registers::{QUEUE_BASE, SMMU_CMDQ_BASE, SMMU_CMDQ_CONS, SMMU_CMDQ_PROD, SMMU_GERROR};
use crate::traits::{DmaAllocator, DmaRegion, dma_alloc};

register_bitfields![u64,
    /// Command word 0
    CMD0 [
        OPCODE OFFSET(0) NUMBITS(8) []
    ],

    /// Command word 1
    CMD1 [
        /// CFGI_ALL range selector (31 = all stream IDs)
        RANGE OFFSET(0) NUMBITS(5) []
    ]
];

/// Command opcodes the engine issues.
pub mod opcode {
    /// Invalidate all configuration cache entries
    pub const CFGI_ALL: u8 = 0x04;
    /// Invalidate all EL2 TLB entries
    pub const TLBI_EL2_ALL: u8 = 0x20;
    /// Invalidate all non-secure, non-hypervisor TLB entries
    pub const TLBI_NSNH_ALL: u8 = 0x30;
    /// Wait for prior commands to complete
    pub const CMD_SYNC: u8 = 0x46;
}

/// Command Queue Entry - 16 bytes
#[repr(C, align(16))]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct CommandEntry {
    pub dwords: [u64; 2],
}

impl CommandEntry {
    /// Size of a command entry in bytes.
    pub const SIZE: usize = 16;

    /// Encode a command with no operands beyond those `op` implies.
    pub fn build(op: u8) -> Result<Self, SmmuError> {
        let w0 = InMemoryRegister::<u64, CMD0::Register>::new(0);
        let w1 = InMemoryRegister::<u64, CMD1::Register>::new(0);

        match op {
            opcode::CFGI_ALL => w1.write(CMD1::RANGE.val(31)),
            opcode::TLBI_EL2_ALL | opcode::TLBI_NSNH_ALL | opcode::CMD_SYNC => {}
            _ => return Err(SmmuError::UnsupportedCommand(op)),
        }
        w0.write(CMD0::OPCODE.val(op.into()));

        Ok(Self {
            dwords: [w0.get(), w1.get()],
        })
    }

    /// Opcode field.
    #[inline]
    #[must_use]
    pub fn opcode(&self) -> u8 {
        InMemoryRegister::<u64, CMD0::Register>::new(self.dwords[0]).read(CMD0::OPCODE) as u8
    }
}

/// A device's command queue.
pub struct CommandQueue {
    region: DmaRegion,
    ring: Ring,
}

impl CommandQueue {
    /// Allocate a queue of `2^log2size` commands.
    pub fn new<D>(dma: &D, log2size: u8) -> Result<Self, SmmuError>
    where
        D: DmaAllocator + ?Sized,
    {
        let bytes = ((1usize << log2size) * CommandEntry::SIZE).max(CMDQ_MIN_BYTES);
        let region = dma_alloc(dma, bytes, bytes)?;

        log::debug!(
            "SMMU: command queue at {:#x}, {} entries",
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

    /// Value for SMMU_CMDQ_BASE.
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
        regs.write64(SMMU_CMDQ_BASE, self.base_register_value());
        regs.write32(SMMU_CMDQ_PROD, 0);
        regs.write32(SMMU_CMDQ_CONS, 0);
    }

    /// Place `cmd` in the ring and publish it to the device.
    ///
    /// Waits up to `timeout` for a free slot, refreshing the consumer index
    /// from the device. A queue that stays full fails with
    /// [`SmmuError::QueueFull`] and nothing is written.
    pub fn enqueue<R, C>(
        &mut self,
        regs: &R,
        clock: &C,
        timeout: Duration,
        cmd: CommandEntry,
    ) -> Result<(), SmmuError>
    where
        R: RegisterIo + ?Sized,
        C: Clock + ?Sized,
    {
        let ring = &mut self.ring;
        let has_space = poll_until(clock, timeout, || {
            ring.set_cons(regs.read32(SMMU_CMDQ_CONS));
            !ring.is_full()
        });
        if !has_space {
            log::error!(
                "SMMU: command queue full (prod={:#x} cons={:#x})",
                self.ring.prod(),
                self.ring.cons()
            );
            return Err(SmmuError::QueueFull);
        }

        self.region.write_entry(self.ring.prod_slot(), cmd);
        let prod = self.ring.advance_prod();

        // Entry must be visible before the device sees the new index
        regs.barrier();
        regs.write32(SMMU_CMDQ_PROD, prod);
        Ok(())
    }

    /// Build and enqueue `op`.
    pub fn issue<R, C>(
        &mut self,
        regs: &R,
        clock: &C,
        timeout: Duration,
        op: u8,
    ) -> Result<(), SmmuError>
    where
        R: RegisterIo + ?Sized,
        C: Clock + ?Sized,
    {
        let cmd = CommandEntry::build(op)?;
        self.enqueue(regs, clock, timeout, cmd)
    }

    /// Wait for the device to consume everything produced so far.
    ///
    /// Best effort: on timeout the queue registers are logged and `false`
    /// is returned, but nothing is rolled back.
    pub fn drain<R, C>(&mut self, regs: &R, clock: &C, timeout: Duration) -> bool
    where
        R: RegisterIo + ?Sized,
        C: Clock + ?Sized,
    {
        let ring = &mut self.ring;
        let drained = poll_until(clock, timeout, || {
            ring.set_cons(regs.read32(SMMU_CMDQ_CONS));
            ring.is_empty()
        });
        if !drained {
            log::warn!(
                "SMMU: command queue drain timed out: PROD={:#x} CONS={:#x} GERROR={:#x}",
                regs.read32(SMMU_CMDQ_PROD),
                regs.read32(SMMU_CMDQ_CONS),
                regs.read32(SMMU_GERROR)
            );
        }
        drained
    }

    /// Invalidate cached configuration and TLBs, then wait for completion.
    ///
    /// Must follow every stream table or CD table update.
    pub fn invalidate_all<R, C>(
        &mut self,
        regs: &R,
        clock: &C,
        timeout: Duration,
        hyp: bool,
    ) -> Result<(), SmmuError>
    where
        R: RegisterIo + ?Sized,
        C: Clock + ?Sized,
    {
        self.issue(regs, clock, timeout, opcode::CFGI_ALL)?;
        if hyp {
            self.issue(regs, clock, timeout, opcode::TLBI_EL2_ALL)?;
        }
        self.issue(regs, clock, timeout, opcode::TLBI_NSNH_ALL)?;
        self.issue(regs, clock, timeout, opcode::CMD_SYNC)?;
        self.drain(regs, clock, timeout);
        Ok(())
    }

    /// Return the queue memory to the allocator.
    pub fn release<D>(self, dma: &D)
    where
        D: DmaAllocator + ?Sized,
    {
        // SAFETY: The caller has disabled the queue, so the device no longer
        // reads it
        unsafe { dma.free(self.region) };
    }
}
