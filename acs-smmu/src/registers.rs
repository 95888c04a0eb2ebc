//! ARM SMMUv3 register definitions
//!
//! Based on ARM System Memory Management Unit Architecture Specification
//! SMMU v3.0 to v3.3 (ARM IHI 0070).
//!
//! The register frame is two 64K pages. Page 0 holds identification,
//! control and table/queue base registers; page 1 holds the event queue
//! indices.

use tock_registers::register_bitfields;

// -- Register Offsets

/// Identification Register 0
pub const SMMU_IDR0: usize = 0x000;
/// Identification Register 1
pub const SMMU_IDR1: usize = 0x004;
/// Identification Register 5
pub const SMMU_IDR5: usize = 0x014;
/// Control Register 0
pub const SMMU_CR0: usize = 0x020;
/// Control Register 0 Acknowledgement
pub const SMMU_CR0ACK: usize = 0x024;
/// Control Register 1 (table and queue memory attributes)
pub const SMMU_CR1: usize = 0x028;
/// Control Register 2
pub const SMMU_CR2: usize = 0x02C;
/// Global Error
pub const SMMU_GERROR: usize = 0x060;
/// Global Error Acknowledge
pub const SMMU_GERRORN: usize = 0x064;
/// Stream Table Base
pub const SMMU_STRTAB_BASE: usize = 0x080;
/// Stream Table Base Configuration
pub const SMMU_STRTAB_BASE_CFG: usize = 0x088;
/// Command Queue Base
pub const SMMU_CMDQ_BASE: usize = 0x090;
/// Command Queue Producer Index
pub const SMMU_CMDQ_PROD: usize = 0x098;
/// Command Queue Consumer Index
pub const SMMU_CMDQ_CONS: usize = 0x09C;
/// Event Queue Base
pub const SMMU_EVENTQ_BASE: usize = 0x0A0;

/// Offset of register page 1 from the frame base
pub const SMMU_PAGE1_OFFSET: usize = 0x1_0000;

/// Event Queue Producer Index (page 1)
pub const SMMU_EVENTQ_PROD: usize = SMMU_PAGE1_OFFSET + 0x0A8;
/// Event Queue Consumer Index (page 1)
pub const SMMU_EVENTQ_CONS: usize = SMMU_PAGE1_OFFSET + 0x0AC;

/// Number of IDR5.OAS encodings
pub const OAS_ENCODINGS: usize = 7;

/// Output address size in bits for each IDR5.OAS encoding.
pub const OAS_BITS: [u8; OAS_ENCODINGS] = [32, 36, 40, 42, 44, 48, 52];

register_bitfields![u32,
    /// Identification Register 0
    pub IDR0 [
        /// Stage-2 translation implemented
        S2P OFFSET(0) NUMBITS(1) [],
        /// Stage-1 translation implemented
        S1P OFFSET(1) NUMBITS(1) [],
        /// Translation table formats
        TTF OFFSET(2) NUMBITS(2) [
            AArch32 = 1,
            AArch64 = 2,
            AArch32AArch64 = 3
        ],
        /// Coherent access to tables and queues
        COHACC OFFSET(4) NUMBITS(1) [],
        /// Hypervisor stage-1 contexts (EL2 StreamWorld)
        HYP OFFSET(9) NUMBITS(1) [],
        /// ATS implemented
        ATS OFFSET(10) NUMBITS(1) [],
        /// 16-bit ASIDs
        ASID16 OFFSET(12) NUMBITS(1) [],
        /// 16-bit VMIDs
        VMID16 OFFSET(18) NUMBITS(1) [],
        /// Two-level context descriptor tables
        CD2L OFFSET(19) NUMBITS(1) [],
        /// Stream table formats
        ST_LEVEL OFFSET(27) NUMBITS(2) [
            Linear = 0,
            TwoLevel = 1
        ]
    ],

    /// Identification Register 1
    pub IDR1 [
        /// Log2 of the number of stream ID bits
        SIDSIZE OFFSET(0) NUMBITS(6) [],
        /// Log2 of the number of substream ID bits
        SSIDSIZE OFFSET(6) NUMBITS(5) [],
        /// Log2 of the maximum PRI queue entries
        PRIQS OFFSET(11) NUMBITS(5) [],
        /// Log2 of the maximum event queue entries
        EVENTQS OFFSET(16) NUMBITS(5) [],
        /// Log2 of the maximum command queue entries
        CMDQS OFFSET(21) NUMBITS(5) [],
        /// Queue base addresses fixed by hardware
        QUEUES_PRESET OFFSET(29) NUMBITS(1) [],
        /// Table base addresses fixed by hardware
        TABLES_PRESET OFFSET(30) NUMBITS(1) []
    ],

    /// Identification Register 5
    pub IDR5 [
        /// Output address size
        OAS OFFSET(0) NUMBITS(3) [],
        /// 4KB translation granule
        GRAN4K OFFSET(4) NUMBITS(1) [],
        /// 16KB translation granule
        GRAN16K OFFSET(5) NUMBITS(1) [],
        /// 64KB translation granule
        GRAN64K OFFSET(6) NUMBITS(1) []
    ],

    /// Control Register 0 (and its acknowledgement)
    pub CR0 [
        /// Translation enable
        SMMUEN OFFSET(0) NUMBITS(1) [],
        /// PRI queue enable
        PRIQEN OFFSET(1) NUMBITS(1) [],
        /// Event queue enable
        EVENTQEN OFFSET(2) NUMBITS(1) [],
        /// Command queue enable
        CMDQEN OFFSET(3) NUMBITS(1) []
    ],

    /// Control Register 1
    pub CR1 [
        /// Queue inner cacheability
        QUEUE_IC OFFSET(0) NUMBITS(2) [
            NonCacheable = 0,
            WriteBack = 1,
            WriteThrough = 2
        ],
        /// Queue outer cacheability
        QUEUE_OC OFFSET(2) NUMBITS(2) [
            NonCacheable = 0,
            WriteBack = 1,
            WriteThrough = 2
        ],
        /// Queue shareability
        QUEUE_SH OFFSET(4) NUMBITS(2) [
            NonShareable = 0,
            OuterShareable = 2,
            InnerShareable = 3
        ],
        /// Table inner cacheability
        TABLE_IC OFFSET(6) NUMBITS(2) [
            NonCacheable = 0,
            WriteBack = 1,
            WriteThrough = 2
        ],
        /// Table outer cacheability
        TABLE_OC OFFSET(8) NUMBITS(2) [
            NonCacheable = 0,
            WriteBack = 1,
            WriteThrough = 2
        ],
        /// Table shareability
        TABLE_SH OFFSET(10) NUMBITS(2) [
            NonShareable = 0,
            OuterShareable = 2,
            InnerShareable = 3
        ]
    ],

    /// Global Error (active bits are those differing from GERRORN)
    pub GERROR [
        /// Command queue error
        CMDQ_ERR OFFSET(0) NUMBITS(1) [],
        /// Event queue write aborted
        EVTQ_ABT_ERR OFFSET(2) NUMBITS(1) [],
        /// PRI queue write aborted
        PRIQ_ABT_ERR OFFSET(3) NUMBITS(1) [],
        /// CMD_SYNC MSI write aborted
        MSI_CMDQ_ABT_ERR OFFSET(4) NUMBITS(1) [],
        /// Event queue MSI write aborted
        MSI_EVTQ_ABT_ERR OFFSET(5) NUMBITS(1) [],
        /// PRI queue MSI write aborted
        MSI_PRIQ_ABT_ERR OFFSET(6) NUMBITS(1) [],
        /// GERROR MSI write aborted
        MSI_GERROR_ABT_ERR OFFSET(7) NUMBITS(1) [],
        /// Service failure mode entered
        SFM_ERR OFFSET(8) NUMBITS(1) []
    ],

    /// Stream Table Base Configuration
    pub STRTAB_BASE_CFG [
        /// Log2 of the stream table size in entries
        LOG2SIZE OFFSET(0) NUMBITS(6) [],
        /// Stream ID bits resolved by the level-2 table
        SPLIT OFFSET(6) NUMBITS(5) [],
        /// Table format
        FMT OFFSET(16) NUMBITS(2) [
            Linear = 0,
            TwoLevel = 1
        ]
    ]
];

register_bitfields![u64,
    /// Stream Table Base
    pub STRTAB_BASE [
        /// Physical address [51:6]
        ADDR OFFSET(6) NUMBITS(46) [],
        /// Read-allocate hint
        RA OFFSET(62) NUMBITS(1) []
    ],

    /// Command/Event Queue Base
    pub QUEUE_BASE [
        /// Log2 of the queue size in entries
        LOG2SIZE OFFSET(0) NUMBITS(5) [],
        /// Physical address [51:5]
        ADDR OFFSET(5) NUMBITS(47) [],
        /// Read/write-allocate hint
        RWA OFFSET(62) NUMBITS(1) []
    ]
];
