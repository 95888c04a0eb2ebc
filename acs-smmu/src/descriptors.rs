//! Stream Table Entry and Context Descriptor layouts
//!
//! Both records are eight 64-bit words in memory. The engine programs words
//! 0-3 of an STE and words 0-3 of a CD; the rest stay zero.
//!
//! STE word 0 (the word the SMMU checks first):
//! ```text
//! +---------+---------------------------------+-------+--------+---+
//! | S1CDMAX |      S1ContextPtr [51:6]        | S1FMT | CONFIG | V |
//! +---------+---------------------------------+-------+--------+---+
//!  63     59 51                             6  5   4  3      1  0
//! ```
//!
//! Field values come from [`register_bitfields!`] definitions, one per word,
//! so every bit position is written down exactly once.

use tock_registers::{
    interfaces::{Readable, ReadWriteable, Writeable},
    register_bitfields,
    registers::InMemoryRegister,
};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

register_bitfields![u64,
    /// STE word 0
    pub STE0 [
        /// Entry valid
        V OFFSET(0) NUMBITS(1) [],
        /// Stream configuration
        CONFIG OFFSET(1) NUMBITS(3) [
            Abort = 0,
            Bypass = 4,
            Stage1 = 5,
            Stage2 = 6,
            Nested = 7
        ],
        /// Context descriptor table format
        S1FMT OFFSET(4) NUMBITS(2) [
            Linear = 0,
            TwoLevel4K = 1,
            TwoLevel64K = 2
        ],
        /// Context descriptor table address [51:6]
        S1CONTEXTPTR OFFSET(6) NUMBITS(46) [],
        /// Log2 of the number of context descriptors
        S1CDMAX OFFSET(59) NUMBITS(5) []
    ],

    /// STE word 1
    pub STE1 [
        /// Default substream behaviour
        S1DSS OFFSET(0) NUMBITS(2) [
            Terminate = 0,
            Bypass = 1,
            Ssid0 = 2
        ],
        /// CD table inner cacheability
        S1CIR OFFSET(2) NUMBITS(2) [
            NonCacheable = 0,
            WriteBackRA = 1,
            WriteThrough = 2,
            WriteBack = 3
        ],
        /// CD table outer cacheability
        S1COR OFFSET(4) NUMBITS(2) [
            NonCacheable = 0,
            WriteBackRA = 1,
            WriteThrough = 2,
            WriteBack = 3
        ],
        /// CD table shareability
        S1CSH OFFSET(6) NUMBITS(2) [
            NonShareable = 0,
            OuterShareable = 2,
            InnerShareable = 3
        ],
        /// Directed cache prefetch
        DCP OFFSET(17) NUMBITS(1) [],
        /// ATS behaviour
        EATS OFFSET(28) NUMBITS(2) [
            Abort = 0,
            Translate = 1,
            Split = 2
        ],
        /// StreamWorld
        STRW OFFSET(30) NUMBITS(2) [
            NsEl1 = 0,
            El2 = 2
        ],
        /// Shareability override
        SHCFG OFFSET(44) NUMBITS(2) [
            NonShareable = 0,
            Incoming = 1,
            OuterShareable = 2,
            InnerShareable = 3
        ]
    ],

    /// STE word 2
    pub STE2 [
        /// Stage-2 VMID
        S2VMID OFFSET(0) NUMBITS(16) [],
        /// Stage-2 translation control (VTCR_EL2 subset)
        VTCR OFFSET(32) NUMBITS(19) [],
        /// Stage-2 tables are AArch64
        S2AA64 OFFSET(51) NUMBITS(1) [],
        /// Stage-2 big-endian walks
        S2ENDI OFFSET(52) NUMBITS(1) [],
        /// Protected table walk
        S2PTW OFFSET(54) NUMBITS(1) [],
        /// Record stage-2 faults
        S2R OFFSET(58) NUMBITS(1) []
    ],

    /// STE word 3
    pub STE3 [
        /// Stage-2 translation table base [51:4]
        S2TTB OFFSET(4) NUMBITS(48) []
    ],

    /// Stage-2 translation control as held in STE2.VTCR
    pub VTCR [
        S2T0SZ OFFSET(0) NUMBITS(6) [],
        S2SL0 OFFSET(6) NUMBITS(2) [],
        S2IR0 OFFSET(8) NUMBITS(2) [],
        S2OR0 OFFSET(10) NUMBITS(2) [],
        S2SH0 OFFSET(12) NUMBITS(2) [],
        S2TG OFFSET(14) NUMBITS(2) [],
        S2PS OFFSET(16) NUMBITS(3) []
    ],

    /// CD word 0
    pub CD0 [
        T0SZ OFFSET(0) NUMBITS(6) [],
        TG0 OFFSET(6) NUMBITS(2) [],
        IRGN0 OFFSET(8) NUMBITS(2) [],
        ORGN0 OFFSET(10) NUMBITS(2) [],
        SH0 OFFSET(12) NUMBITS(2) [],
        /// Disable TTB0 walks
        EPD0 OFFSET(14) NUMBITS(1) [],
        /// Disable TTB1 walks
        EPD1 OFFSET(30) NUMBITS(1) [],
        /// Descriptor valid
        V OFFSET(31) NUMBITS(1) [],
        /// Intermediate physical address size
        IPS OFFSET(32) NUMBITS(3) [],
        /// AArch64 tables
        AA64 OFFSET(41) NUMBITS(1) [],
        /// Record faults
        R OFFSET(45) NUMBITS(1) [],
        /// Abort on fault
        A OFFSET(46) NUMBITS(1) [],
        /// ASID set (non-shared)
        ASET OFFSET(47) NUMBITS(1) [],
        ASID OFFSET(48) NUMBITS(16) []
    ],

    /// CD word 1
    pub CD1 [
        /// Translation table base 0 [51:4]
        TTB0 OFFSET(4) NUMBITS(48) []
    ],

    /// Level-1 stream table descriptor
    pub L1_STD [
        /// Log2 of the level-2 table span plus one (0 means invalid)
        SPAN OFFSET(0) NUMBITS(5) [],
        /// Level-2 table address [51:6]
        L2PTR OFFSET(6) NUMBITS(46) []
    ],

    /// Level-1 context descriptor
    pub L1_CD [
        /// Descriptor valid
        V OFFSET(0) NUMBITS(1) [],
        /// Level-2 table address [51:12]
        L2PTR OFFSET(12) NUMBITS(40) []
    ]
];

/// Translation-control fields of a page-table descriptor.
///
/// The same fields feed both the stage-1 CD (TCR) and the stage-2 STE
/// (VTCR); they are raw architectural encodings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcrAttributes {
    /// Region size offset (T0SZ / S2T0SZ)
    pub tsz: u8,
    /// Starting level (stage-2 only)
    pub sl: u8,
    /// Inner cacheability of table walks
    pub irgn: u8,
    /// Outer cacheability of table walks
    pub orgn: u8,
    /// Shareability of table walks
    pub sh: u8,
    /// Translation granule
    pub tg: u8,
    /// Physical/intermediate address size
    pub ps: u8,
}

impl TcrAttributes {
    /// TCR bits of CD word 0 (everything but the control flags).
    #[must_use]
    pub fn cd_tcr(&self) -> u64 {
        let tcr = InMemoryRegister::<u64, CD0::Register>::new(0);
        tcr.write(
            CD0::T0SZ.val(self.tsz.into())
                + CD0::TG0.val(self.tg.into())
                + CD0::IRGN0.val(self.irgn.into())
                + CD0::ORGN0.val(self.orgn.into())
                + CD0::SH0.val(self.sh.into())
                + CD0::IPS.val(self.ps.into())
                + CD0::EPD1::SET
                + CD0::AA64::SET,
        );
        tcr.get()
    }

    /// Value of the STE VTCR field.
    #[must_use]
    pub fn vtcr(&self) -> u32 {
        let vtcr = InMemoryRegister::<u64, VTCR::Register>::new(0);
        vtcr.write(
            VTCR::S2T0SZ.val(self.tsz.into())
                + VTCR::S2SL0.val(self.sl.into())
                + VTCR::S2IR0.val(self.irgn.into())
                + VTCR::S2OR0.val(self.orgn.into())
                + VTCR::S2SH0.val(self.sh.into())
                + VTCR::S2TG.val(self.tg.into())
                + VTCR::S2PS.val(self.ps.into()),
        );
        vtcr.get() as u32
    }
}

/// Stage-1 translation context held in one CD.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stage1Context {
    pub asid: u16,
    /// Translation table base
    pub ttbr: u64,
    /// TCR bits from [`TcrAttributes::cd_tcr`]
    pub tcr: u64,
    /// Memory attribute indirection
    pub mair: u64,
}

/// Stage-2 translation configuration held in an STE.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stage2Context {
    pub vmid: u16,
    /// Stage-2 translation table base
    pub vttbr: u64,
    /// VTCR from [`TcrAttributes::vtcr`]
    pub vtcr: u32,
}

/// Layout of a context descriptor table, as encoded in STE0.S1FMT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CdTableFormat {
    Linear,
    /// Level-1 descriptors pointing at 64KB leaves of 1024 CDs
    TwoLevel64K,
}

/// Stream Table Entry - 64 bytes
#[repr(C)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct StreamTableEntry {
    pub dwords: [u64; 8],
}

impl StreamTableEntry {
    /// Size of an STE in bytes.
    pub const SIZE: usize = 64;

    /// An entry that aborts all traffic from the stream.
    #[must_use]
    pub fn abort() -> Self {
        let w0 = InMemoryRegister::<u64, STE0::Register>::new(0);
        w0.write(STE0::V::SET + STE0::CONFIG::Abort);
        let w1 = InMemoryRegister::<u64, STE1::Register>::new(0);
        w1.write(STE1::SHCFG::Incoming);

        Self {
            dwords: [w0.get(), w1.get(), 0, 0, 0, 0, 0, 0],
        }
    }

    /// An entry translating through stage 2 only.
    #[must_use]
    pub fn stage2(ctx: &Stage2Context) -> Self {
        let w1 = InMemoryRegister::<u64, STE1::Register>::new(0);
        w1.write(STE1::SHCFG::Incoming + STE1::STRW::El2 + STE1::EATS::Translate);

        let w2 = InMemoryRegister::<u64, STE2::Register>::new(0);
        w2.write(
            STE2::S2VMID.val(ctx.vmid.into())
                + STE2::VTCR.val(ctx.vtcr.into())
                + STE2::S2PTW::SET
                + STE2::S2AA64::SET
                + STE2::S2R::SET,
        );

        let w3 = InMemoryRegister::<u64, STE3::Register>::new(0);
        w3.write(STE3::S2TTB.val(ctx.vttbr >> 4));

        let w0 = InMemoryRegister::<u64, STE0::Register>::new(0);
        w0.write(STE0::V::SET + STE0::CONFIG::Stage2);

        Self {
            dwords: [w0.get(), w1.get(), w2.get(), w3.get(), 0, 0, 0, 0],
        }
    }

    /// An entry translating through stage 1 using a CD table.
    #[must_use]
    pub fn stage1(cdtab_phys: u64, s1cdmax: u8, format: CdTableFormat) -> Self {
        let w1 = InMemoryRegister::<u64, STE1::Register>::new(0);
        w1.write(
            STE1::S1DSS::Ssid0
                + STE1::S1CIR::WriteBackRA
                + STE1::S1COR::WriteBackRA
                + STE1::S1CSH::InnerShareable
                + STE1::EATS::Translate,
        );

        let w0 = InMemoryRegister::<u64, STE0::Register>::new(0);
        w0.write(
            STE0::V::SET
                + STE0::CONFIG::Stage1
                + STE0::S1CONTEXTPTR.val(cdtab_phys >> 6)
                + STE0::S1CDMAX.val(s1cdmax.into()),
        );
        match format {
            CdTableFormat::Linear => w0.modify(STE0::S1FMT::Linear),
            CdTableFormat::TwoLevel64K => w0.modify(STE0::S1FMT::TwoLevel64K),
        }

        Self {
            dwords: [w0.get(), w1.get(), 0, 0, 0, 0, 0, 0],
        }
    }

    #[inline]
    fn word0(&self) -> InMemoryRegister<u64, STE0::Register> {
        InMemoryRegister::new(self.dwords[0])
    }

    /// Entry valid bit.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.word0().is_set(STE0::V)
    }

    /// Decoded CONFIG field, `None` for reserved encodings.
    #[must_use]
    pub fn config(&self) -> Option<STE0::CONFIG::Value> {
        self.word0().read_as_enum(STE0::CONFIG)
    }

    /// Whether the entry aborts all traffic.
    #[must_use]
    pub fn is_abort(&self) -> bool {
        self.is_valid() && matches!(self.config(), Some(STE0::CONFIG::Value::Abort))
    }

    /// CD table address from word 0.
    #[must_use]
    pub fn s1_context_ptr(&self) -> u64 {
        self.word0().read(STE0::S1CONTEXTPTR) << 6
    }

    /// S1CDMAX from word 0.
    #[must_use]
    pub fn s1cdmax(&self) -> u8 {
        self.word0().read(STE0::S1CDMAX) as u8
    }

    /// Stage-2 table base from word 3.
    #[must_use]
    pub fn s2_ttb(&self) -> u64 {
        InMemoryRegister::<u64, STE3::Register>::new(self.dwords[3]).read(STE3::S2TTB) << 4
    }

    /// VTCR from word 2.
    #[must_use]
    pub fn vtcr(&self) -> u32 {
        InMemoryRegister::<u64, STE2::Register>::new(self.dwords[2]).read(STE2::VTCR) as u32
    }

    /// Directed cache prefetch bit.
    #[must_use]
    pub fn dcp(&self) -> bool {
        InMemoryRegister::<u64, STE1::Register>::new(self.dwords[1]).is_set(STE1::DCP)
    }

    /// Set or clear the directed cache prefetch bit, leaving word 1 otherwise intact.
    pub fn set_dcp(&mut self, enable: bool) {
        let w1 = InMemoryRegister::<u64, STE1::Register>::new(self.dwords[1]);
        if enable {
            w1.modify(STE1::DCP::SET);
        } else {
            w1.modify(STE1::DCP::CLEAR);
        }
        self.dwords[1] = w1.get();
    }
}

/// Context Descriptor - 64 bytes
#[repr(C)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct ContextDescriptor {
    pub dwords: [u64; 8],
}

impl ContextDescriptor {
    /// Size of a CD in bytes.
    pub const SIZE: usize = 64;

    /// Create an invalid CD.
    #[inline]
    #[must_use]
    pub const fn invalid() -> Self {
        Self { dwords: [0; 8] }
    }

    /// A valid CD for a stage-1 context.
    #[must_use]
    pub fn stage1(ctx: &Stage1Context) -> Self {
        let w0 = InMemoryRegister::<u64, CD0::Register>::new(ctx.tcr);
        w0.modify(
            CD0::R::SET
                + CD0::A::SET
                + CD0::ASET::SET
                + CD0::AA64::SET
                + CD0::ASID.val(ctx.asid.into())
                + CD0::V::SET,
        );

        let w1 = InMemoryRegister::<u64, CD1::Register>::new(0);
        w1.write(CD1::TTB0.val(ctx.ttbr >> 4));

        Self {
            dwords: [w0.get(), w1.get(), 0, ctx.mair, 0, 0, 0, 0],
        }
    }

    /// Descriptor valid bit.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        InMemoryRegister::<u64, CD0::Register>::new(self.dwords[0]).is_set(CD0::V)
    }

    /// ASID from word 0.
    #[must_use]
    pub fn asid(&self) -> u16 {
        InMemoryRegister::<u64, CD0::Register>::new(self.dwords[0]).read(CD0::ASID) as u16
    }

    /// TTB0 from word 1.
    #[must_use]
    pub fn ttb0(&self) -> u64 {
        InMemoryRegister::<u64, CD1::Register>::new(self.dwords[1]).read(CD1::TTB0) << 4
    }

    /// MAIR from word 3.
    #[must_use]
    pub const fn mair(&self) -> u64 {
        self.dwords[3]
    }
}

/// Level-1 stream table descriptor for a leaf of `2^split` STEs.
#[must_use]
pub fn l1_stream_descriptor(leaf_phys: u64, split: u8) -> u64 {
    let desc = InMemoryRegister::<u64, L1_STD::Register>::new(0);
    desc.write(L1_STD::SPAN.val(u64::from(split) + 1) + L1_STD::L2PTR.val(leaf_phys >> 6));
    desc.get()
}

/// Level-1 context descriptor for a leaf of CDs.
#[must_use]
pub fn l1_cd_descriptor(leaf_phys: u64) -> u64 {
    let desc = InMemoryRegister::<u64, L1_CD::Register>::new(0);
    desc.write(L1_CD::V::SET + L1_CD::L2PTR.val(leaf_phys >> 12));
    desc.get()
}
