//! Wire layouts of the HWRM requests and responses used by the driver.
//!
//! Every request begins with a [`RequestHeader`] and every response with a [`ResponseHeader`].
//! Responses always end with a one-byte `valid` field that firmware writes last.
//! All multi-byte fields are little-endian.

use byteorder::LittleEndian;
use core::mem::size_of;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::byteorder::{U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub type Le16 = U16<LittleEndian>;
pub type Le32 = U32<LittleEndian>;
pub type Le64 = U64<LittleEndian>;

/// HWRM request type codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum RequestType {
    VerGet                  = 0x0000,
    FuncQcaps               = 0x0015,
    FuncQcfg                = 0x0016,
    FuncCfg                 = 0x0017,
    FuncDrvUnrgtr           = 0x001A,
    FuncDrvRgtr             = 0x001D,
    VnicAlloc               = 0x0040,
    VnicFree                = 0x0041,
    RingAlloc               = 0x0050,
    RingFree                = 0x0051,
    RingGrpAlloc            = 0x0060,
    RingGrpFree             = 0x0061,
    StatCtxAlloc            = 0x00B0,
    StatCtxFree             = 0x00B1,
    FwReset                 = 0x00C0,
    FuncResourceQcaps       = 0x0190,
    FuncBackingStoreCfg     = 0x0193,
    FuncBackingStoreQcaps   = 0x0194,
    ErrorRecoveryQcfg       = 0x019C,
    FuncBackingStoreCfgV2   = 0x01A6,
    FuncBackingStoreQcapsV2 = 0x01A8,
    NvmInstallUpdate        = 0xFFF3,
    NvmRead                 = 0xFFF5,
    NvmWrite                = 0xFFFA,
}

/// A request structure that can be sent over the HWRM channel.
pub trait HwrmRequest: AsBytes + FromBytes + FromZeroes {
    const REQ_TYPE: RequestType;
    type Response: AsBytes + FromBytes + FromZeroes;
}

macro_rules! hwrm_request {
    ($req:ty, $req_type:expr, $resp:ty) => {
        impl HwrmRequest for $req {
            const REQ_TYPE: RequestType = $req_type;
            type Response = $resp;
        }
    };
}

/// The header at the start of every request. The channel fills it in; callers leave it zeroed.
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct RequestHeader {
    pub req_type: Le16,
    pub cmpl_ring: Le16,
    pub seq_id: Le16,
    pub target_id: Le16,
    pub resp_addr: Le64,
}
const_assert_eq!(size_of::<RequestHeader>(), 16);

/// The header at the start of every response.
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct ResponseHeader {
    pub error_code: Le16,
    pub req_type: Le16,
    pub seq_id: Le16,
    pub resp_len: Le16,
}
const_assert_eq!(size_of::<ResponseHeader>(), 8);

/// Byte offset of [`ResponseHeader::resp_len`].
pub const RESP_LEN_OFFSET: usize = 6;

/// The envelope sent through the mailbox instead of a request that lives in a side buffer.
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct ShortRequest {
    pub req_type: Le16,
    pub signature: Le16,
    pub unused: Le16,
    pub size: Le16,
    pub req_addr: Le64,
}
const_assert_eq!(size_of::<ShortRequest>(), 16);

/// Response of commands that return nothing but a status.
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct EmptyOutput {
    pub hdr: ResponseHeader,
    pub unused: [u8; 7],
    pub valid: u8,
}
const_assert_eq!(size_of::<EmptyOutput>(), 16);

// ---------------------------------------------------------------------------------------------
// Version and function capabilities
// ---------------------------------------------------------------------------------------------

/// The HWRM interface version this driver was written against.
pub const HWRM_VERSION_MAJOR: u8 = 1;
pub const HWRM_VERSION_MINOR: u8 = 10;
pub const HWRM_VERSION_UPDATE: u8 = 2;

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct VerGetInput {
    pub hdr: RequestHeader,
    pub hwrm_intf_maj: u8,
    pub hwrm_intf_min: u8,
    pub hwrm_intf_upd: u8,
    pub unused: [u8; 5],
}
const_assert_eq!(size_of::<VerGetInput>(), 24);

/// Firmware is still booting and cannot take commands other than `VER_GET`.
pub const VER_GET_FLAGS_DEV_NOT_RDY: u8 = 0x2;
pub const VER_GET_DEV_CAPS_SHORT_CMD_SUPPORTED: u32 = 0x4;
pub const VER_GET_DEV_CAPS_SHORT_CMD_REQUIRED: u32 = 0x8;

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct VerGetOutput {
    pub hdr: ResponseHeader,
    pub hwrm_intf_maj: u8,
    pub hwrm_intf_min: u8,
    pub hwrm_intf_upd: u8,
    pub hwrm_intf_rsvd: u8,
    pub fw_maj: u8,
    pub fw_min: u8,
    pub fw_bld: u8,
    pub fw_rsvd: u8,
    pub chip_num: Le16,
    pub chip_rev: u8,
    pub chip_metal: u8,
    pub max_req_win_len: Le16,
    pub max_resp_len: Le16,
    /// Default command timeout in milliseconds; zero means "use the driver's default".
    pub def_req_timeout: Le16,
    pub flags: u8,
    pub unused_0: u8,
    pub dev_caps_cfg: Le32,
    pub max_ext_req_len: Le16,
    pub unused_1: [u8; 5],
    pub valid: u8,
}
const_assert_eq!(size_of::<VerGetOutput>(), 40);

hwrm_request!(VerGetInput, RequestType::VerGet, VerGetOutput);

/// `fid` value meaning "the function sending the request".
pub const FID_SELF: u16 = 0xFFFF;

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FuncQcapsInput {
    pub hdr: RequestHeader,
    pub fid: Le16,
    pub unused: [u8; 6],
}
const_assert_eq!(size_of::<FuncQcapsInput>(), 24);

pub const FUNC_QCAPS_FLAGS_HOT_RESET_CAPABLE: u32 = 0x0080_0000;
pub const FUNC_QCAPS_FLAGS_ERROR_RECOVERY_CAPABLE: u32 = 0x0100_0000;
pub const FUNC_QCAPS_FLAGS_ERR_RECOVER_RELOAD: u32 = 0x0200_0000;
pub const FUNC_QCAPS_FLAGS_EXT_BS_V2_SUPPORTED: u32 = 0x0000_0001;
pub const FUNC_QCAPS_FLAGS_EXT_RESOURCE_QCAPS: u32 = 0x0000_0002;

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FuncQcapsOutput {
    pub hdr: ResponseHeader,
    pub fid: Le16,
    pub port_id: Le16,
    pub flags: Le32,
    pub mac_address: [u8; 6],
    pub max_rsscos_ctx: Le16,
    pub max_cmpl_rings: Le16,
    pub max_tx_rings: Le16,
    pub max_rx_rings: Le16,
    pub max_l2_ctxs: Le16,
    pub max_vnics: Le16,
    pub max_stat_ctx: Le16,
    pub max_nqs: Le16,
    pub max_hw_ring_grps: Le16,
    pub flags_ext: Le32,
    pub unused: [u8; 3],
    pub valid: u8,
}
const_assert_eq!(size_of::<FuncQcapsOutput>(), 48);

hwrm_request!(FuncQcapsInput, RequestType::FuncQcaps, FuncQcapsOutput);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FuncQcfgInput {
    pub hdr: RequestHeader,
    pub fid: Le16,
    pub unused: [u8; 6],
}
const_assert_eq!(size_of::<FuncQcfgInput>(), 24);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FuncQcfgOutput {
    pub hdr: ResponseHeader,
    pub fid: Le16,
    pub port_id: Le16,
    pub alloc_tx_rings: Le16,
    pub alloc_rx_rings: Le16,
    pub alloc_cmpl_rings: Le16,
    pub alloc_vnics: Le16,
    pub alloc_stat_ctx: Le16,
    pub alloc_hw_ring_grps: Le16,
    pub mtu: Le16,
    pub flags: Le16,
    pub unused: [u8; 3],
    pub valid: u8,
}
const_assert_eq!(size_of::<FuncQcfgOutput>(), 32);

hwrm_request!(FuncQcfgInput, RequestType::FuncQcfg, FuncQcfgOutput);

pub const FUNC_CFG_ENABLES_NUM_TX_RINGS: u32 = 0x01;
pub const FUNC_CFG_ENABLES_NUM_RX_RINGS: u32 = 0x02;
pub const FUNC_CFG_ENABLES_NUM_CMPL_RINGS: u32 = 0x04;
pub const FUNC_CFG_ENABLES_NUM_STAT_CTXS: u32 = 0x08;
pub const FUNC_CFG_ENABLES_NUM_VNICS: u32 = 0x10;
pub const FUNC_CFG_ENABLES_NUM_HW_RING_GRPS: u32 = 0x20;
pub const FUNC_CFG_ENABLES_ASYNC_EVENT_CR: u32 = 0x40;

/// Reserves resources for this function and selects the ring that receives async events.
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FuncCfgInput {
    pub hdr: RequestHeader,
    pub fid: Le16,
    pub async_event_cr: Le16,
    pub enables: Le32,
    pub num_tx_rings: Le16,
    pub num_rx_rings: Le16,
    pub num_cmpl_rings: Le16,
    pub num_stat_ctxs: Le16,
    pub num_vnics: Le16,
    pub num_hw_ring_grps: Le16,
    pub unused: [u8; 4],
}
const_assert_eq!(size_of::<FuncCfgInput>(), 40);

hwrm_request!(FuncCfgInput, RequestType::FuncCfg, EmptyOutput);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FuncResourceQcapsInput {
    pub hdr: RequestHeader,
    pub fid: Le16,
    pub unused: [u8; 6],
}
const_assert_eq!(size_of::<FuncResourceQcapsInput>(), 24);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FuncResourceQcapsOutput {
    pub hdr: ResponseHeader,
    pub min_tx_rings: Le16,
    pub max_tx_rings: Le16,
    pub min_rx_rings: Le16,
    pub max_rx_rings: Le16,
    pub min_cmpl_rings: Le16,
    pub max_cmpl_rings: Le16,
    pub min_stat_ctx: Le16,
    pub max_stat_ctx: Le16,
    pub min_vnics: Le16,
    pub max_vnics: Le16,
    pub unused: [u8; 3],
    pub valid: u8,
}
const_assert_eq!(size_of::<FuncResourceQcapsOutput>(), 32);

hwrm_request!(FuncResourceQcapsInput, RequestType::FuncResourceQcaps, FuncResourceQcapsOutput);

// ---------------------------------------------------------------------------------------------
// Driver registration and error recovery
// ---------------------------------------------------------------------------------------------

pub const FUNC_DRV_RGTR_FLAGS_ERROR_RECOVERY_SUPPORT: u32 = 0x20;
pub const FUNC_DRV_RGTR_FLAGS_MASTER_SUPPORT: u32 = 0x40;
pub const FUNC_DRV_RGTR_ENABLES_OS_TYPE: u32 = 0x1;
pub const FUNC_DRV_RGTR_ENABLES_VER: u32 = 0x2;
pub const FUNC_DRV_RGTR_ENABLES_ASYNC_EVENT_FWD: u32 = 0x10;

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FuncDrvRgtrInput {
    pub hdr: RequestHeader,
    pub flags: Le32,
    pub enables: Le32,
    pub os_type: Le16,
    pub ver_maj: u8,
    pub ver_min: u8,
    pub ver_upd: u8,
    pub unused: [u8; 3],
    /// Bitmap of async event ids that firmware should forward to this function.
    pub async_event_fwd: [Le32; 8],
}
const_assert_eq!(size_of::<FuncDrvRgtrInput>(), 64);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FuncDrvRgtrOutput {
    pub hdr: ResponseHeader,
    pub flags: Le32,
    pub unused: [u8; 3],
    pub valid: u8,
}
const_assert_eq!(size_of::<FuncDrvRgtrOutput>(), 16);

hwrm_request!(FuncDrvRgtrInput, RequestType::FuncDrvRgtr, FuncDrvRgtrOutput);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FuncDrvUnrgtrInput {
    pub hdr: RequestHeader,
    pub flags: Le32,
    pub unused: [u8; 4],
}
const_assert_eq!(size_of::<FuncDrvUnrgtrInput>(), 24);

hwrm_request!(FuncDrvUnrgtrInput, RequestType::FuncDrvUnrgtr, EmptyOutput);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct ErrorRecoveryQcfgInput {
    pub hdr: RequestHeader,
    pub unused: [u8; 8],
}
const_assert_eq!(size_of::<ErrorRecoveryQcfgInput>(), 24);

/// The host driver owns the reset sequence.
pub const ERROR_RECOVERY_QCFG_FLAGS_HOST: u32 = 0x1;
/// A co-processor on the card resets the firmware.
pub const ERROR_RECOVERY_QCFG_FLAGS_CO_CPU: u32 = 0x2;

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct ErrorRecoveryQcfgOutput {
    pub hdr: ResponseHeader,
    pub flags: Le32,
    /// All periods are in deciseconds.
    pub driver_polling_freq: Le32,
    pub master_func_wait_period: Le32,
    pub normal_func_wait_period: Le32,
    pub master_func_wait_period_after_reset: Le32,
    pub max_bailout_time_after_reset: Le32,
    pub fw_health_status_reg: Le32,
    pub fw_heartbeat_reg: Le32,
    pub fw_reset_cnt_reg: Le32,
    pub reset_inprogress_reg: Le32,
    pub reset_inprogress_reg_mask: Le32,
    pub unused_0: [u8; 3],
    pub reg_array_cnt: u8,
    pub reset_reg: [Le32; 16],
    pub reset_reg_val: [Le32; 16],
    /// Milliseconds to wait after each reset register write.
    pub delay_after_reset: [u8; 16],
    pub unused_1: [u8; 7],
    pub valid: u8,
}
const_assert_eq!(size_of::<ErrorRecoveryQcfgOutput>(), 208);

hwrm_request!(ErrorRecoveryQcfgInput, RequestType::ErrorRecoveryQcfg, ErrorRecoveryQcfgOutput);

pub const FW_RESET_EMBEDDED_PROC_TYPE_CHIP: u8 = 0x4;
pub const FW_RESET_SELFRST_STATUS_SELFRSTASAP: u8 = 0x2;
pub const FW_RESET_FLAGS_RESET_GRACEFUL: u8 = 0x1;

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FwResetInput {
    pub hdr: RequestHeader,
    pub embedded_proc_type: u8,
    pub selfrst_status: u8,
    pub host_resp_timeout: u8,
    pub flags: u8,
    pub unused: [u8; 4],
}
const_assert_eq!(size_of::<FwResetInput>(), 24);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FwResetOutput {
    pub hdr: ResponseHeader,
    pub selfrst_status: u8,
    pub unused: [u8; 6],
    pub valid: u8,
}
const_assert_eq!(size_of::<FwResetOutput>(), 16);

hwrm_request!(FwResetInput, RequestType::FwReset, FwResetOutput);

// ---------------------------------------------------------------------------------------------
// Rings, ring groups, stat contexts and vnics
// ---------------------------------------------------------------------------------------------

pub const RING_ALLOC_ENABLES_STAT_CTX_ID_VALID: u32 = 0x1;
pub const RING_ALLOC_ENABLES_NQ_RING_ID_VALID: u32 = 0x2;
pub const RING_ALLOC_ENABLES_RX_BUF_SIZE_VALID: u32 = 0x4;
/// `page_size` value for 4 KiB pages (log2 of the page size).
pub const RING_ALLOC_PAGE_SIZE_4K: u8 = 12;
pub const RING_ALLOC_INT_MODE_MSIX: u8 = 2;

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct RingAllocInput {
    pub hdr: RequestHeader,
    pub enables: Le32,
    pub ring_type: u8,
    pub page_size: u8,
    pub page_tbl_depth: u8,
    pub unused_0: u8,
    pub page_tbl_addr: Le64,
    pub fbo: Le32,
    pub logical_id: Le16,
    pub cmpl_ring_id: Le16,
    pub queue_id: Le16,
    pub rx_buf_size: Le16,
    /// Number of entries in the ring.
    pub length: Le32,
    pub stat_ctx_id: Le32,
    pub nq_ring_id: Le16,
    pub int_mode: u8,
    pub unused_1: u8,
}
const_assert_eq!(size_of::<RingAllocInput>(), 56);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct RingAllocOutput {
    pub hdr: ResponseHeader,
    pub ring_id: Le16,
    pub logical_ring_id: Le16,
    pub push_buffer_index: u8,
    pub unused: [u8; 2],
    pub valid: u8,
}
const_assert_eq!(size_of::<RingAllocOutput>(), 16);

hwrm_request!(RingAllocInput, RequestType::RingAlloc, RingAllocOutput);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct RingFreeInput {
    pub hdr: RequestHeader,
    pub ring_type: u8,
    pub unused_0: u8,
    pub ring_id: Le16,
    pub unused_1: [u8; 4],
}
const_assert_eq!(size_of::<RingFreeInput>(), 24);

hwrm_request!(RingFreeInput, RequestType::RingFree, EmptyOutput);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct RingGrpAllocInput {
    pub hdr: RequestHeader,
    /// Completion ring id.
    pub cr: Le16,
    /// Receive ring id.
    pub rr: Le16,
    /// Aggregation ring id.
    pub ar: Le16,
    /// Stat context id.
    pub sc: Le16,
}
const_assert_eq!(size_of::<RingGrpAllocInput>(), 24);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct RingGrpAllocOutput {
    pub hdr: ResponseHeader,
    pub ring_group_id: Le32,
    pub unused: [u8; 3],
    pub valid: u8,
}
const_assert_eq!(size_of::<RingGrpAllocOutput>(), 16);

hwrm_request!(RingGrpAllocInput, RequestType::RingGrpAlloc, RingGrpAllocOutput);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct RingGrpFreeInput {
    pub hdr: RequestHeader,
    pub ring_group_id: Le32,
    pub unused: [u8; 4],
}
const_assert_eq!(size_of::<RingGrpFreeInput>(), 24);

hwrm_request!(RingGrpFreeInput, RequestType::RingGrpFree, EmptyOutput);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct StatCtxAllocInput {
    pub hdr: RequestHeader,
    pub stats_dma_addr: Le64,
    pub update_period_ms: Le32,
    pub stat_ctx_flags: u8,
    pub unused: u8,
    pub stats_dma_length: Le16,
}
const_assert_eq!(size_of::<StatCtxAllocInput>(), 32);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct StatCtxAllocOutput {
    pub hdr: ResponseHeader,
    pub stat_ctx_id: Le32,
    pub unused: [u8; 3],
    pub valid: u8,
}
const_assert_eq!(size_of::<StatCtxAllocOutput>(), 16);

hwrm_request!(StatCtxAllocInput, RequestType::StatCtxAlloc, StatCtxAllocOutput);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct StatCtxFreeInput {
    pub hdr: RequestHeader,
    pub stat_ctx_id: Le32,
    pub unused: [u8; 4],
}
const_assert_eq!(size_of::<StatCtxFreeInput>(), 24);

hwrm_request!(StatCtxFreeInput, RequestType::StatCtxFree, EmptyOutput);

pub const VNIC_ALLOC_FLAGS_DEFAULT: u32 = 0x1;

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct VnicAllocInput {
    pub hdr: RequestHeader,
    pub flags: Le32,
    pub unused: [u8; 4],
}
const_assert_eq!(size_of::<VnicAllocInput>(), 24);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct VnicAllocOutput {
    pub hdr: ResponseHeader,
    pub vnic_id: Le32,
    pub unused: [u8; 3],
    pub valid: u8,
}
const_assert_eq!(size_of::<VnicAllocOutput>(), 16);

hwrm_request!(VnicAllocInput, RequestType::VnicAlloc, VnicAllocOutput);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct VnicFreeInput {
    pub hdr: RequestHeader,
    pub vnic_id: Le32,
    pub unused: [u8; 4],
}
const_assert_eq!(size_of::<VnicFreeInput>(), 24);

hwrm_request!(VnicFreeInput, RequestType::VnicFree, EmptyOutput);

// ---------------------------------------------------------------------------------------------
// Backing store (context memory)
// ---------------------------------------------------------------------------------------------

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FuncBackingStoreQcapsInput {
    pub hdr: RequestHeader,
}
const_assert_eq!(size_of::<FuncBackingStoreQcapsInput>(), 16);

/// Bits of [`FuncBackingStoreQcapsOutput::ctx_init_mask`].
pub const BS_QCAPS_INIT_MASK_QP: u8 = 0x01;
pub const BS_QCAPS_INIT_MASK_SRQ: u8 = 0x02;
pub const BS_QCAPS_INIT_MASK_CQ: u8 = 0x04;
pub const BS_QCAPS_INIT_MASK_VNIC: u8 = 0x08;
pub const BS_QCAPS_INIT_MASK_STAT: u8 = 0x10;
pub const BS_QCAPS_INIT_MASK_MRAV: u8 = 0x20;

/// Legacy backing store requirements, a fixed set of well-known context types.
/// Initializer offsets are in units of 4 bytes.
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FuncBackingStoreQcapsOutput {
    pub hdr: ResponseHeader,
    pub qp_max_entries: Le32,
    pub qp_min_qp1_entries: Le16,
    pub qp_max_l2_entries: Le16,
    pub qp_entry_size: Le16,
    pub srq_max_l2_entries: Le16,
    pub srq_max_entries: Le32,
    pub srq_entry_size: Le16,
    pub cq_max_l2_entries: Le16,
    pub cq_max_entries: Le32,
    pub cq_entry_size: Le16,
    pub vnic_max_vnic_entries: Le16,
    pub vnic_max_ring_table_entries: Le16,
    pub vnic_entry_size: Le16,
    pub stat_max_entries: Le32,
    pub stat_entry_size: Le16,
    pub tqm_entry_size: Le16,
    pub tqm_min_entries_per_ring: Le32,
    pub tqm_max_entries_per_ring: Le32,
    pub mrav_max_entries: Le32,
    pub mrav_entry_size: Le16,
    pub tim_entry_size: Le16,
    pub tim_max_entries: Le32,
    pub tqm_entries_multiple: u8,
    pub tqm_fp_rings_count: u8,
    pub ctx_kind_initializer: u8,
    pub ctx_init_mask: u8,
    pub qp_init_offset: u8,
    pub srq_init_offset: u8,
    pub cq_init_offset: u8,
    pub vnic_init_offset: u8,
    pub stat_init_offset: u8,
    pub mrav_init_offset: u8,
    pub unused: u8,
    pub valid: u8,
}
const_assert_eq!(size_of::<FuncBackingStoreQcapsOutput>(), 80);

hwrm_request!(FuncBackingStoreQcapsInput, RequestType::FuncBackingStoreQcaps, FuncBackingStoreQcapsOutput);

/// Page-table attributes and page directory of one context type in the legacy
/// [`FuncBackingStoreCfgInput`].
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct BackingStoreCfgEntry {
    pub num_entries: Le32,
    pub entry_size: Le16,
    /// Page table depth in bits 0..4, page size code in bits 4..8.
    pub pg_attr: u8,
    pub unused: u8,
    pub page_dir: Le64,
}
const_assert_eq!(size_of::<BackingStoreCfgEntry>(), 16);

/// Number of fast-path TQM rings the legacy configuration command has room for.
pub const BS_CFG_MAX_TQM_RINGS: usize = 8;

/// Bits of [`FuncBackingStoreCfgInput::enables`].
pub const BS_CFG_ENABLES_QP: u32 = 0x0001;
pub const BS_CFG_ENABLES_SRQ: u32 = 0x0002;
pub const BS_CFG_ENABLES_CQ: u32 = 0x0004;
pub const BS_CFG_ENABLES_VNIC: u32 = 0x0008;
pub const BS_CFG_ENABLES_STAT: u32 = 0x0010;
pub const BS_CFG_ENABLES_TQM_SP: u32 = 0x0020;
/// Fast-path TQM ring `n` is enabled by `BS_CFG_ENABLES_TQM_RING0 << n`.
pub const BS_CFG_ENABLES_TQM_RING0: u32 = 0x0040;
pub const BS_CFG_ENABLES_MRAV: u32 = 0x4000;
pub const BS_CFG_ENABLES_TIM: u32 = 0x8000;

/// The legacy, monolithic backing store configuration.
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FuncBackingStoreCfgInput {
    pub hdr: RequestHeader,
    pub flags: Le32,
    pub enables: Le32,
    pub qp: BackingStoreCfgEntry,
    pub srq: BackingStoreCfgEntry,
    pub cq: BackingStoreCfgEntry,
    pub vnic: BackingStoreCfgEntry,
    pub stat: BackingStoreCfgEntry,
    pub tqm_sp: BackingStoreCfgEntry,
    pub tqm_ring: [BackingStoreCfgEntry; BS_CFG_MAX_TQM_RINGS],
    pub mrav: BackingStoreCfgEntry,
    pub tim: BackingStoreCfgEntry,
    pub qp_num_qp1_entries: Le16,
    pub qp_num_l2_entries: Le16,
    pub srq_num_l2_entries: Le16,
    pub cq_num_l2_entries: Le16,
    pub vnic_num_vnic_entries: Le16,
    pub vnic_num_ring_table_entries: Le16,
    pub unused: [u8; 4],
}
const_assert_eq!(size_of::<FuncBackingStoreCfgInput>(), 296);

hwrm_request!(FuncBackingStoreCfgInput, RequestType::FuncBackingStoreCfg, EmptyOutput);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FuncBackingStoreQcapsV2Input {
    pub hdr: RequestHeader,
    pub type_: Le16,
    pub unused: [u8; 6],
}
const_assert_eq!(size_of::<FuncBackingStoreQcapsV2Input>(), 24);

pub const BS_QCAPS_V2_FLAGS_ENABLE_CTX_KIND_INIT: u32 = 0x1;
pub const BS_QCAPS_V2_FLAGS_TYPE_VALID: u32 = 0x2;
/// `next_valid_type` value that ends the iteration.
pub const BS_QCAPS_V2_TYPE_INVALID: u16 = 0xFFFF;
/// `ctx_init_offset` value meaning "initialize the whole entry".
pub const BS_CTX_INIT_OFFSET_INVALID: u8 = 0xFF;

/// Requirements of one context type, from the versioned query.
/// The initializer offset is in units of 4 bytes.
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FuncBackingStoreQcapsV2Output {
    pub hdr: ResponseHeader,
    pub type_: Le16,
    pub entry_size: Le16,
    pub flags: Le32,
    pub instance_bit_map: Le32,
    pub ctx_init_value: u8,
    pub ctx_init_offset: u8,
    pub entry_multiple: u8,
    pub unused_0: u8,
    pub max_num_entries: Le32,
    pub min_num_entries: Le32,
    pub next_valid_type: Le16,
    pub subtype_valid_cnt: u8,
    pub unused_1: u8,
    pub split_entry: [Le32; 4],
    pub unused_2: [u8; 3],
    pub valid: u8,
}
const_assert_eq!(size_of::<FuncBackingStoreQcapsV2Output>(), 56);

hwrm_request!(FuncBackingStoreQcapsV2Input, RequestType::FuncBackingStoreQcapsV2, FuncBackingStoreQcapsV2Output);

/// Set on the last configuration command of the sequence.
pub const BS_CFG_V2_FLAGS_BS_CFG_ALL_DONE: u32 = 0x2;

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FuncBackingStoreCfgV2Input {
    pub hdr: RequestHeader,
    pub type_: Le16,
    pub instance: Le16,
    pub flags: Le32,
    pub page_dir: Le64,
    pub num_entries: Le32,
    pub entry_size: Le16,
    /// Page table depth in bits 0..4, page size code in bits 4..8.
    pub page_size_pbl_level: u8,
    pub subtype_valid_cnt: u8,
    pub split_entry: [Le32; 4],
}
const_assert_eq!(size_of::<FuncBackingStoreCfgV2Input>(), 56);

hwrm_request!(FuncBackingStoreCfgV2Input, RequestType::FuncBackingStoreCfgV2, EmptyOutput);

// ---------------------------------------------------------------------------------------------
// NVRAM
// ---------------------------------------------------------------------------------------------

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct NvmReadInput {
    pub hdr: RequestHeader,
    pub host_dest_addr: Le64,
    pub dir_idx: Le16,
    pub unused_0: [u8; 2],
    pub offset: Le32,
    pub len: Le32,
    pub unused_1: [u8; 4],
}
const_assert_eq!(size_of::<NvmReadInput>(), 40);

hwrm_request!(NvmReadInput, RequestType::NvmRead, EmptyOutput);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct NvmWriteInput {
    pub hdr: RequestHeader,
    pub host_src_addr: Le64,
    pub dir_type: Le16,
    pub dir_ordinal: Le16,
    pub dir_ext: Le16,
    pub dir_attr: Le16,
    pub dir_data_length: Le32,
    pub option: Le16,
    pub flags: Le16,
    pub dir_item_length: Le32,
    pub unused: [u8; 4],
}
const_assert_eq!(size_of::<NvmWriteInput>(), 48);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct NvmWriteOutput {
    pub hdr: ResponseHeader,
    pub dir_item_length: Le32,
    pub dir_idx: Le16,
    pub unused: u8,
    pub valid: u8,
}
const_assert_eq!(size_of::<NvmWriteOutput>(), 16);

hwrm_request!(NvmWriteInput, RequestType::NvmWrite, NvmWriteOutput);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct NvmInstallUpdateInput {
    pub hdr: RequestHeader,
    pub install_type: Le32,
    pub flags: Le16,
    pub unused: [u8; 2],
}
const_assert_eq!(size_of::<NvmInstallUpdateInput>(), 24);

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct NvmInstallUpdateOutput {
    pub hdr: ResponseHeader,
    pub installed_items: Le64,
    pub result: u8,
    pub problem_item: u8,
    pub reset_required: u8,
    pub unused: [u8; 4],
    pub valid: u8,
}
const_assert_eq!(size_of::<NvmInstallUpdateOutput>(), 24);

hwrm_request!(NvmInstallUpdateInput, RequestType::NvmInstallUpdate, NvmInstallUpdateOutput);

/// Returns the request bytes that follow the [`RequestHeader`].
pub fn payload_of<R: HwrmRequest>(req: &R) -> &[u8] {
    &req.as_bytes()[size_of::<RequestHeader>()..]
}
