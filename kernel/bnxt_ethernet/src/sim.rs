//! A simulated bnxt function: BAR0 with the HWRM mailbox and GRC windows, a doorbell BAR,
//! PCI config space, and a firmware model that answers HWRM requests by DMA.
//!
//! Requests are decoded when the driver rings the trigger register, so a response is always
//! in host memory before the channel starts polling for it. Async events are written into
//! the completion ring that `FUNC_CFG` selected, with the valid bit of the current lap.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::size_of;
use nic_hal::sim::{HeapDmaAllocator, ManualClock, SimPciFunction, SimRegisters};
use nic_hal::{Clock, RegisterSpace, PAGE_SIZE};
use spin::Mutex;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::async_event::FW_STATUS_HEALTHY;
use crate::completion::{AsyncEventCompletion, CompletionType, CMPL_ENTRY_SIZE, CMPL_VALID_OFFSET};
use crate::context_memory::ContextType;
use crate::error::fw_code;
use crate::health::{
    DeviceIo, FW_HEALTH_WIN_BASE, FW_HEALTH_WIN_MAP_OFF, FW_RESET_WIN_BASE, FW_RESET_WIN_MAP_OFF,
    FW_STATUS_SHUTDOWN, GRCPF_REG_WINDOW_BASE_OUT, GRC_BASE_MASK, GRC_OFFSET_MASK,
};
use crate::hwrm::{HWRM_BUF_LEN, HWRM_SHORT_REQ_SIGNATURE, HWRM_TRIGGER_OFFSET};
use crate::messages::*;
use crate::page_table::PTU_PTE_VALID;
use crate::ring::RING_ENTRY_SIZE;

pub const SIM_VENDOR_ID: u16 = 0x14E4;
pub const SIM_SUBSYSTEM_ID: u16 = 0x1234;
const SIM_BAR_LEN: usize = 0x10000;

/// GRC addresses of the simulated health registers; all share one 4 KiB page.
pub const SIM_GRC_FW_STATUS: u32 = 0x0031_A100;
pub const SIM_GRC_FW_HEARTBEAT: u32 = 0x0031_A104;
pub const SIM_GRC_FW_RESET_CNT: u32 = 0x0031_A108;
/// The host reset sequence: the write to the second register resets the chip.
pub const SIM_GRC_RESET_REG0: u32 = 0x0052_0010;
pub const SIM_GRC_RESET_REG1: u32 = 0x0052_0014;
const GRC_REG_TAG: u32 = 1;

/// How the simulated firmware supports short commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShortCmdSupport {
    None,
    Supported,
    Required,
}

/// The backing store interface the simulated firmware offers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimBackingStore {
    None,
    Legacy,
    V2,
}

#[derive(Clone, Debug)]
pub struct SimDeviceConfig {
    pub chip_num: u16,
    pub def_req_timeout_ms: u16,
    pub max_req_win_len: u16,
    pub short_cmd: ShortCmdSupport,
    pub backing_store: SimBackingStore,
    /// `ERROR_RECOVERY_QCFG` flags; `None` if firmware has no error recovery.
    pub recovery_flags: Option<u32>,
    /// Firmware reloads itself after a reset.
    pub err_recover_reload: bool,
    pub resource_qcaps: bool,
    /// How long firmware stays down after a reset, in milliseconds.
    pub reset_downtime_ms: u64,
    pub max_rings: u16,
    pub max_vnics: u16,
    pub max_stat_ctx: u16,
}

impl SimDeviceConfig {
    pub fn legacy() -> SimDeviceConfig {
        SimDeviceConfig {
            chip_num: 0x16D7,
            def_req_timeout_ms: 500,
            max_req_win_len: 128,
            short_cmd: ShortCmdSupport::None,
            backing_store: SimBackingStore::None,
            recovery_flags: None,
            err_recover_reload: false,
            resource_qcaps: false,
            reset_downtime_ms: 1000,
            max_rings: 64,
            max_vnics: 8,
            max_stat_ctx: 64,
        }
    }

    pub fn p5() -> SimDeviceConfig {
        SimDeviceConfig {
            chip_num: 0x1750,
            short_cmd: ShortCmdSupport::Supported,
            backing_store: SimBackingStore::Legacy,
            resource_qcaps: true,
            ..SimDeviceConfig::legacy()
        }
    }

    pub fn p7() -> SimDeviceConfig {
        SimDeviceConfig {
            chip_num: 0x1760,
            backing_store: SimBackingStore::V2,
            ..SimDeviceConfig::p5()
        }
    }

    /// Enables firmware error recovery with the given `ERROR_RECOVERY_QCFG` flags.
    pub fn with_recovery(mut self, flags: u32) -> SimDeviceConfig {
        self.recovery_flags = Some(flags);
        self
    }
}

/// One request as the firmware saw it.
#[derive(Clone, Debug)]
pub struct SimRequest {
    pub req_type: u16,
    pub seq_id: u16,
    pub cmpl_ring: u16,
    pub target_id: u16,
    /// Whether it arrived as a short command envelope.
    pub short: bool,
    /// Bytes of the mailbox that carried the request or the envelope.
    pub mailbox_len: usize,
    /// The full request, header included.
    pub body: Vec<u8>,
}

#[derive(Clone, Copy, Debug)]
struct SimRing {
    ring_type: u8,
    page_tbl_addr: u64,
    depth: u8,
    length: u32,
    /// Next slot firmware writes into, for completion rings.
    prod: u32,
}

/// Requirements the simulated firmware reports per backing store type.
struct SimCtxCaps {
    ctx_type: ContextType,
    entry_size: u16,
    min: u32,
    max: u32,
    multiple: u8,
    instance_bmap: u32,
    init_value: u8,
    init_offset: u8,
}

const V2_CAPS: &[SimCtxCaps] = &[
    SimCtxCaps { ctx_type: ContextType::Qp, entry_size: 64, min: 0, max: 4096, multiple: 0, instance_bmap: 0, init_value: 0xA5, init_offset: 2 },
    SimCtxCaps { ctx_type: ContextType::Srq, entry_size: 64, min: 0, max: 1024, multiple: 0, instance_bmap: 0, init_value: 0, init_offset: 0xFF },
    SimCtxCaps { ctx_type: ContextType::Cq, entry_size: 64, min: 0, max: 4096, multiple: 0, instance_bmap: 0, init_value: 0xA5, init_offset: 0xFF },
    SimCtxCaps { ctx_type: ContextType::Vnic, entry_size: 128, min: 0, max: 64, multiple: 0, instance_bmap: 0, init_value: 0, init_offset: 0xFF },
    SimCtxCaps { ctx_type: ContextType::Stat, entry_size: 64, min: 0, max: 256, multiple: 0, instance_bmap: 0, init_value: 0, init_offset: 0xFF },
    SimCtxCaps { ctx_type: ContextType::Stqm, entry_size: 32, min: 64, max: 4096, multiple: 32, instance_bmap: 0, init_value: 0, init_offset: 0xFF },
    SimCtxCaps { ctx_type: ContextType::Ftqm, entry_size: 32, min: 64, max: 4096, multiple: 32, instance_bmap: 0b11, init_value: 0, init_offset: 0xFF },
];

struct SimState {
    bar0: BTreeMap<usize, u32>,
    requests: Vec<SimRequest>,
    fail_next: BTreeMap<u16, u16>,
    firmware_down: bool,
    withhold_valid: bool,
    dev_not_ready: bool,
    down_until: Option<u64>,
    rings: BTreeMap<u16, SimRing>,
    next_ring_id: u16,
    next_id: u32,
    ring_groups: BTreeSet<u32>,
    stat_ctxs: BTreeSet<u32>,
    vnics: BTreeSet<u32>,
    async_event_cr: Option<u16>,
    registered: bool,
    async_event_fwd: [u32; 8],
    reserved: FuncCfgInput,
    bs_types: BTreeSet<u16>,
    bs_committed: bool,
    grc: BTreeMap<u32, u32>,
    heartbeat: u32,
    reset_count: u32,
    reset_writes: Vec<(u32, u32)>,
    fw_resets: u32,
    nvm: BTreeMap<u16, Vec<u8>>,
}

/// The simulated device. BAR0 is the device itself; see [`SimDevice::doorbells()`] for BAR1.
pub struct SimDevice {
    config: SimDeviceConfig,
    dma: HeapDmaAllocator,
    clock: Arc<ManualClock>,
    pci: Arc<SimPciFunction>,
    bar1: Arc<SimRegisters>,
    state: Mutex<SimState>,
}

impl SimDevice {
    pub fn new(config: SimDeviceConfig) -> Arc<SimDevice> {
        let pci = Arc::new(SimPciFunction::new(SIM_VENDOR_ID, config.chip_num, SIM_SUBSYSTEM_ID));
        let state = SimState {
            bar0: BTreeMap::new(),
            requests: Vec::new(),
            fail_next: BTreeMap::new(),
            firmware_down: false,
            withhold_valid: false,
            dev_not_ready: false,
            down_until: None,
            rings: BTreeMap::new(),
            next_ring_id: 1,
            next_id: 1,
            ring_groups: BTreeSet::new(),
            stat_ctxs: BTreeSet::new(),
            vnics: BTreeSet::new(),
            async_event_cr: None,
            registered: false,
            async_event_fwd: [0; 8],
            reserved: FuncCfgInput::new_zeroed(),
            bs_types: BTreeSet::new(),
            bs_committed: false,
            grc: BTreeMap::new(),
            heartbeat: 0,
            reset_count: 0,
            reset_writes: Vec::new(),
            fw_resets: 0,
            nvm: BTreeMap::new(),
        };
        let sim = SimDevice {
            config,
            dma: HeapDmaAllocator::new(),
            clock: Arc::new(ManualClock::new()),
            pci,
            bar1: Arc::new(SimRegisters::new(SIM_BAR_LEN)),
            state: Mutex::new(state),
        };
        sim.state.lock().grc.insert(SIM_GRC_FW_STATUS, FW_STATUS_HEALTHY);
        Arc::new(sim)
    }

    pub fn config(&self) -> &SimDeviceConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<ManualClock> {
        self.clock.clone()
    }

    pub fn dma(&self) -> HeapDmaAllocator {
        self.dma.clone()
    }

    pub fn pci(&self) -> Arc<SimPciFunction> {
        self.pci.clone()
    }

    /// The doorbell BAR.
    pub fn doorbells(&self) -> Arc<SimRegisters> {
        self.bar1.clone()
    }

    pub fn io(self: &Arc<Self>) -> DeviceIo {
        DeviceIo { bar0: self.clone(), bar1: self.bar1.clone(), pci: self.pci.clone() }
    }

    pub fn requests(&self) -> Vec<SimRequest> {
        self.state.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    /// Request types received so far, in order.
    pub fn request_types(&self) -> Vec<u16> {
        self.state.lock().requests.iter().map(|r| r.req_type).collect()
    }

    pub fn count_requests(&self, req_type: RequestType) -> usize {
        let t = u16::from(req_type);
        self.state.lock().requests.iter().filter(|r| r.req_type == t).count()
    }

    /// The current contents of the request mailbox.
    pub fn mailbox(&self) -> Vec<u8> {
        let st = self.state.lock();
        let mut out = Vec::with_capacity(self.config.max_req_win_len as usize);
        for off in (0..self.config.max_req_win_len as usize).step_by(4) {
            out.extend_from_slice(&st.bar0.get(&off).copied().unwrap_or(0).to_le_bytes());
        }
        out
    }

    /// Makes the next request of `req_type` fail with firmware error `code`.
    pub fn fail_next(&self, req_type: RequestType, code: u16) {
        self.state.lock().fail_next.insert(u16::from(req_type), code);
    }

    /// A down firmware never answers and its heartbeat stops, until the next reset.
    pub fn set_firmware_down(&self, down: bool) {
        self.state.lock().firmware_down = down;
    }

    pub fn set_withhold_valid_marker(&self, withhold: bool) {
        self.state.lock().withhold_valid = withhold;
    }

    /// Makes `VER_GET` report that firmware is still booting.
    pub fn set_dev_not_ready(&self, not_ready: bool) {
        self.state.lock().dev_not_ready = not_ready;
    }

    pub fn set_fw_status(&self, status: u32) {
        self.state.lock().grc.insert(SIM_GRC_FW_STATUS, status);
    }

    pub fn set_reset_count(&self, count: u32) {
        self.state.lock().reset_count = count;
    }

    pub fn reset_count(&self) -> u32 {
        self.state.lock().reset_count
    }

    /// Starts a firmware reset: firmware shuts down for the configured downtime,
    /// forgets every ring and all context memory, then comes back healthy.
    pub fn begin_firmware_reset(&self) {
        let mut st = self.state.lock();
        self.reset_locked(&mut st);
    }

    pub fn firmware_resets(&self) -> u32 {
        self.state.lock().fw_resets
    }

    /// GRC writes made through the reset window, as (GRC address, value).
    pub fn reset_writes(&self) -> Vec<(u32, u32)> {
        self.state.lock().reset_writes.clone()
    }

    pub fn is_registered(&self) -> bool {
        self.state.lock().registered
    }

    pub fn async_event_fwd(&self) -> [u32; 8] {
        self.state.lock().async_event_fwd
    }

    pub fn backing_store_committed(&self) -> bool {
        self.state.lock().bs_committed
    }

    pub fn ring_count(&self) -> usize {
        self.state.lock().rings.len()
    }

    pub fn has_ring(&self, fw_ring_id: u16) -> bool {
        self.state.lock().rings.contains_key(&fw_ring_id)
    }

    pub fn async_event_ring(&self) -> Option<u16> {
        self.state.lock().async_event_cr
    }

    pub fn nvm_item(&self, dir_type: u16) -> Option<Vec<u8>> {
        self.state.lock().nvm.get(&dir_type).cloned()
    }

    pub fn set_nvm_item(&self, dir_type: u16, data: &[u8]) {
        self.state.lock().nvm.insert(dir_type, data.to_vec());
    }

    /// Writes an async event into the ring `FUNC_CFG` chose for them.
    pub fn post_async_event(&self, event_id: u16, data1: u32, data2: u32, timestamp_lo: u8, timestamp_hi: u16) -> Result<(), &'static str> {
        let ring = self.state.lock().async_event_cr.ok_or("sim: no async event completion ring configured")?;
        let mut ev = AsyncEventCompletion::new_zeroed();
        ev.type_ = Le16::new(CompletionType::HwrmAsyncEvent as u16);
        ev.event_id = Le16::new(event_id);
        ev.event_data1 = Le32::new(data1);
        ev.event_data2 = Le32::new(data2);
        ev.timestamp_lo = timestamp_lo;
        ev.timestamp_hi = Le16::new(timestamp_hi);
        let mut raw = [0u8; CMPL_ENTRY_SIZE];
        raw.copy_from_slice(ev.as_bytes());
        self.post_completion(ring, raw)
    }

    /// Writes a completion record into firmware ring `fw_ring_id`, setting its valid bit
    /// for the current lap.
    pub fn post_completion(&self, fw_ring_id: u16, mut entry: [u8; CMPL_ENTRY_SIZE]) -> Result<(), &'static str> {
        let mut st = self.state.lock();
        let ring = st.rings.get_mut(&fw_ring_id).ok_or("sim: completion for an unknown ring")?;
        let slot = ring.prod % ring.length;
        let lap_is_odd = (ring.prod / ring.length) % 2 == 1;
        if lap_is_odd {
            entry[CMPL_VALID_OFFSET] &= !1;
        } else {
            entry[CMPL_VALID_OFFSET] |= 1;
        }
        let addr = slot_addr(&self.dma, ring, slot)?;
        ring.prod = ring.prod.wrapping_add(1);
        self.dma.write_phys(addr, &entry)
    }

    fn reset_locked(&self, st: &mut SimState) {
        st.down_until = Some(self.clock.now_ms() + self.config.reset_downtime_ms);
        st.firmware_down = false;
        st.reset_count = st.reset_count.wrapping_add(1);
        st.grc.insert(SIM_GRC_FW_STATUS, FW_STATUS_SHUTDOWN);
        st.rings.clear();
        st.ring_groups.clear();
        st.stat_ctxs.clear();
        st.vnics.clear();
        st.bs_types.clear();
        st.bs_committed = false;
        st.registered = false;
        st.async_event_cr = None;
        debug!("sim: firmware reset #{} for {} ms", st.reset_count, self.config.reset_downtime_ms);
    }

    fn firmware_up(&self, st: &mut SimState) -> bool {
        if let Some(until) = st.down_until {
            if self.clock.now_ms() < until {
                return false;
            }
            st.down_until = None;
            st.grc.insert(SIM_GRC_FW_STATUS, FW_STATUS_HEALTHY);
        }
        !st.firmware_down
    }

    fn grc_read(&self, st: &mut SimState, addr: u32) -> u32 {
        let up = self.firmware_up(st);
        match addr {
            SIM_GRC_FW_HEARTBEAT => {
                if up {
                    st.heartbeat = st.heartbeat.wrapping_add(1);
                }
                st.heartbeat
            }
            SIM_GRC_FW_RESET_CNT => st.reset_count,
            _ => st.grc.get(&addr).copied().unwrap_or(0),
        }
    }

    fn window_base(st: &SimState, map_off: usize) -> u32 {
        st.bar0.get(&(GRCPF_REG_WINDOW_BASE_OUT + map_off)).copied().unwrap_or(0) & GRC_BASE_MASK
    }

    fn process_mailbox(&self, st: &mut SimState) {
        let mut mailbox = Vec::with_capacity(self.config.max_req_win_len as usize);
        for off in (0..self.config.max_req_win_len as usize).step_by(4) {
            mailbox.extend_from_slice(&st.bar0.get(&off).copied().unwrap_or(0).to_le_bytes());
        }

        let signature = u16::from_le_bytes([mailbox[2], mailbox[3]]);
        let (short, mailbox_len, body) = if signature == HWRM_SHORT_REQ_SIGNATURE {
            let env = ShortRequest::read_from_prefix(&mailbox[..]).unwrap_or_else(ShortRequest::new_zeroed);
            let mut body = alloc::vec![0u8; env.size.get() as usize];
            if self.dma.read_phys(env.req_addr.get(), &mut body).is_err() {
                error!("sim: short command points at unmapped memory {:#X}", env.req_addr.get());
                return;
            }
            (true, size_of::<ShortRequest>(), body)
        } else {
            let req_type = u16::from_le_bytes([mailbox[0], mailbox[1]]);
            let len = request_len(req_type).min(mailbox.len());
            (false, (len + 3) & !3, mailbox[..len].to_vec())
        };

        let hdr = RequestHeader::read_from_prefix(&body[..]).unwrap_or_default();
        let req_type = hdr.req_type.get();
        let seq_id = hdr.seq_id.get();
        st.requests.push(SimRequest {
            req_type,
            seq_id,
            cmpl_ring: hdr.cmpl_ring.get(),
            target_id: hdr.target_id.get(),
            short,
            mailbox_len,
            body: body.clone(),
        });

        if !self.firmware_up(st) {
            trace!("sim: firmware down, dropping request {:#X}", req_type);
            return;
        }

        let is_fw_reset = req_type == u16::from(RequestType::FwReset);
        let result = match st.fail_next.remove(&req_type) {
            Some(code) => Err(code),
            None => self.execute(st, req_type, &body),
        };
        let succeeded = result.is_ok();
        let mut resp = match result {
            Ok(resp) => resp,
            Err(code) => {
                let mut out = EmptyOutput::new_zeroed();
                out.hdr.error_code = Le16::new(code);
                out.as_bytes().to_vec()
            }
        };

        let len = resp.len();
        let out_hdr = ResponseHeader {
            error_code: Le16::new(u16::from_le_bytes([resp[0], resp[1]])),
            req_type: Le16::new(req_type),
            seq_id: Le16::new(seq_id),
            resp_len: Le16::new(len as u16),
        };
        resp[..size_of::<ResponseHeader>()].copy_from_slice(out_hdr.as_bytes());
        resp[len - 1] = if st.withhold_valid { 0 } else { 1 };
        if self.dma.write_phys(hdr.resp_addr.get(), &resp).is_err() {
            error!("sim: response address {:#X} is not mapped", hdr.resp_addr.get());
        }

        if is_fw_reset && succeeded {
            st.fw_resets += 1;
            self.reset_locked(st);
        }
    }

    fn execute(&self, st: &mut SimState, req_type: u16, body: &[u8]) -> Result<Vec<u8>, u16> {
        let cfg = &self.config;
        let generation_needs_bs = cfg.backing_store != SimBackingStore::None;
        let req_type = RequestType::try_from(req_type).map_err(|_e| fw_code::CMD_NOT_SUPPORTED)?;
        match req_type {
            RequestType::VerGet => {
                let mut out = VerGetOutput::new_zeroed();
                out.hwrm_intf_maj = HWRM_VERSION_MAJOR;
                out.hwrm_intf_min = HWRM_VERSION_MINOR;
                out.hwrm_intf_upd = HWRM_VERSION_UPDATE;
                out.fw_maj = 224;
                out.fw_min = 1;
                out.fw_bld = 60;
                out.chip_num = Le16::new(cfg.chip_num);
                out.max_req_win_len = Le16::new(cfg.max_req_win_len);
                out.max_resp_len = Le16::new(HWRM_BUF_LEN as u16);
                out.def_req_timeout = Le16::new(cfg.def_req_timeout_ms);
                out.max_ext_req_len = Le16::new(HWRM_BUF_LEN as u16);
                if st.dev_not_ready {
                    out.flags = VER_GET_FLAGS_DEV_NOT_RDY;
                }
                out.dev_caps_cfg = Le32::new(match cfg.short_cmd {
                    ShortCmdSupport::None => 0,
                    ShortCmdSupport::Supported => VER_GET_DEV_CAPS_SHORT_CMD_SUPPORTED,
                    ShortCmdSupport::Required => VER_GET_DEV_CAPS_SHORT_CMD_SUPPORTED | VER_GET_DEV_CAPS_SHORT_CMD_REQUIRED,
                });
                Ok(out.as_bytes().to_vec())
            }
            RequestType::FuncQcaps => {
                let mut out = FuncQcapsOutput::new_zeroed();
                out.fid = Le16::new(0);
                out.mac_address = [0x00, 0x0A, 0xF7, 0x12, 0x34, 0x56];
                let mut flags = 0;
                if cfg.recovery_flags.is_some() {
                    flags |= FUNC_QCAPS_FLAGS_ERROR_RECOVERY_CAPABLE | FUNC_QCAPS_FLAGS_HOT_RESET_CAPABLE;
                }
                if cfg.err_recover_reload {
                    flags |= FUNC_QCAPS_FLAGS_ERR_RECOVER_RELOAD;
                }
                out.flags = Le32::new(flags);
                let mut flags_ext = 0;
                if cfg.backing_store == SimBackingStore::V2 {
                    flags_ext |= FUNC_QCAPS_FLAGS_EXT_BS_V2_SUPPORTED;
                }
                if cfg.resource_qcaps {
                    flags_ext |= FUNC_QCAPS_FLAGS_EXT_RESOURCE_QCAPS;
                }
                out.flags_ext = Le32::new(flags_ext);
                out.max_cmpl_rings = Le16::new(cfg.max_rings);
                out.max_tx_rings = Le16::new(cfg.max_rings);
                out.max_rx_rings = Le16::new(cfg.max_rings);
                out.max_nqs = Le16::new(cfg.max_rings);
                out.max_hw_ring_grps = Le16::new(cfg.max_rings);
                out.max_rsscos_ctx = Le16::new(cfg.max_vnics);
                out.max_l2_ctxs = Le16::new(cfg.max_vnics);
                out.max_vnics = Le16::new(cfg.max_vnics);
                out.max_stat_ctx = Le16::new(cfg.max_stat_ctx);
                Ok(out.as_bytes().to_vec())
            }
            RequestType::FuncQcfg => {
                let r = &st.reserved;
                let mut out = FuncQcfgOutput::new_zeroed();
                out.alloc_tx_rings = r.num_tx_rings;
                out.alloc_rx_rings = r.num_rx_rings;
                out.alloc_cmpl_rings = r.num_cmpl_rings;
                out.alloc_vnics = r.num_vnics;
                out.alloc_stat_ctx = r.num_stat_ctxs;
                out.alloc_hw_ring_grps = r.num_hw_ring_grps;
                out.mtu = Le16::new(1500);
                Ok(out.as_bytes().to_vec())
            }
            RequestType::FuncCfg => {
                let req: FuncCfgInput = parse(body);
                let enables = req.enables.get();
                if enables & FUNC_CFG_ENABLES_ASYNC_EVENT_CR != 0 {
                    let ring = req.async_event_cr.get();
                    if !st.rings.contains_key(&ring) {
                        return Err(fw_code::INVALID_PARAMS);
                    }
                    st.async_event_cr = Some(ring);
                }
                let limit = |v: Le16, max: u16| v.get() <= max;
                if !limit(req.num_tx_rings, cfg.max_rings)
                    || !limit(req.num_rx_rings, cfg.max_rings)
                    || !limit(req.num_cmpl_rings, cfg.max_rings)
                    || !limit(req.num_vnics, cfg.max_vnics)
                    || !limit(req.num_stat_ctxs, cfg.max_stat_ctx)
                {
                    return Err(fw_code::RESOURCE_ALLOC_ERROR);
                }
                let r = &mut st.reserved;
                if enables & FUNC_CFG_ENABLES_NUM_TX_RINGS != 0 { r.num_tx_rings = req.num_tx_rings; }
                if enables & FUNC_CFG_ENABLES_NUM_RX_RINGS != 0 { r.num_rx_rings = req.num_rx_rings; }
                if enables & FUNC_CFG_ENABLES_NUM_CMPL_RINGS != 0 { r.num_cmpl_rings = req.num_cmpl_rings; }
                if enables & FUNC_CFG_ENABLES_NUM_STAT_CTXS != 0 { r.num_stat_ctxs = req.num_stat_ctxs; }
                if enables & FUNC_CFG_ENABLES_NUM_VNICS != 0 { r.num_vnics = req.num_vnics; }
                if enables & FUNC_CFG_ENABLES_NUM_HW_RING_GRPS != 0 { r.num_hw_ring_grps = req.num_hw_ring_grps; }
                Ok(EmptyOutput::new_zeroed().as_bytes().to_vec())
            }
            RequestType::FuncResourceQcaps => {
                if !cfg.resource_qcaps {
                    return Err(fw_code::FAIL);
                }
                let mut out = FuncResourceQcapsOutput::new_zeroed();
                out.min_tx_rings = Le16::new(1);
                out.max_tx_rings = Le16::new(cfg.max_rings);
                out.min_rx_rings = Le16::new(1);
                out.max_rx_rings = Le16::new(cfg.max_rings);
                out.min_cmpl_rings = Le16::new(1);
                out.max_cmpl_rings = Le16::new(cfg.max_rings);
                out.min_stat_ctx = Le16::new(1);
                out.max_stat_ctx = Le16::new(cfg.max_stat_ctx);
                out.min_vnics = Le16::new(1);
                out.max_vnics = Le16::new(cfg.max_vnics);
                Ok(out.as_bytes().to_vec())
            }
            RequestType::FuncDrvRgtr => {
                let req: FuncDrvRgtrInput = parse(body);
                st.registered = true;
                for (dst, src) in st.async_event_fwd.iter_mut().zip(req.async_event_fwd.iter()) {
                    *dst = src.get();
                }
                Ok(FuncDrvRgtrOutput::new_zeroed().as_bytes().to_vec())
            }
            RequestType::FuncDrvUnrgtr => {
                st.registered = false;
                Ok(EmptyOutput::new_zeroed().as_bytes().to_vec())
            }
            RequestType::ErrorRecoveryQcfg => {
                let flags = cfg.recovery_flags.ok_or(fw_code::CMD_NOT_SUPPORTED)?;
                Ok(recovery_qcfg(flags).as_bytes().to_vec())
            }
            RequestType::FwReset => {
                let req: FwResetInput = parse(body);
                if req.embedded_proc_type != FW_RESET_EMBEDDED_PROC_TYPE_CHIP {
                    return Err(fw_code::INVALID_PARAMS);
                }
                Ok(FwResetOutput::new_zeroed().as_bytes().to_vec())
            }
            RequestType::RingAlloc => {
                let req: RingAllocInput = parse(body);
                let needs_ctx = match req.ring_type {
                    1 | 2 | 4 => Some(ContextType::Qp),
                    0 | 5 => Some(ContextType::Cq),
                    _ => return Err(fw_code::INVALID_PARAMS),
                };
                if generation_needs_bs {
                    if let Some(ctx) = needs_ctx {
                        if !st.bs_committed || !st.bs_types.contains(&(ctx as u16)) {
                            return Err(fw_code::RESOURCE_ALLOC_ERROR);
                        }
                    }
                }
                let length = req.length.get();
                if length == 0 || !length.is_power_of_two() || req.page_tbl_depth > 1 {
                    return Err(fw_code::INVALID_PARAMS);
                }
                if st.rings.len() >= cfg.max_rings as usize * 4 {
                    return Err(fw_code::RESOURCE_ALLOC_ERROR);
                }
                let id = st.next_ring_id;
                st.next_ring_id = st.next_ring_id.wrapping_add(1);
                st.rings.insert(id, SimRing {
                    ring_type: req.ring_type,
                    page_tbl_addr: req.page_tbl_addr.get(),
                    depth: req.page_tbl_depth,
                    length,
                    prod: 0,
                });
                let mut out = RingAllocOutput::new_zeroed();
                out.ring_id = Le16::new(id);
                out.logical_ring_id = req.logical_id;
                Ok(out.as_bytes().to_vec())
            }
            RequestType::RingFree => {
                let req: RingFreeInput = parse(body);
                match st.rings.get(&req.ring_id.get()) {
                    Some(ring) if ring.ring_type == req.ring_type => {}
                    _ => return Err(fw_code::INVALID_PARAMS),
                }
                let id = req.ring_id.get();
                st.rings.remove(&id);
                if st.async_event_cr == Some(id) {
                    st.async_event_cr = None;
                }
                Ok(EmptyOutput::new_zeroed().as_bytes().to_vec())
            }
            RequestType::RingGrpAlloc => {
                let req: RingGrpAllocInput = parse(body);
                if !st.rings.contains_key(&req.cr.get()) || !st.rings.contains_key(&req.rr.get()) {
                    return Err(fw_code::INVALID_PARAMS);
                }
                let id = next_id(st);
                st.ring_groups.insert(id);
                let mut out = RingGrpAllocOutput::new_zeroed();
                out.ring_group_id = Le32::new(id);
                Ok(out.as_bytes().to_vec())
            }
            RequestType::RingGrpFree => {
                let req: RingGrpFreeInput = parse(body);
                if !st.ring_groups.remove(&req.ring_group_id.get()) {
                    return Err(fw_code::INVALID_PARAMS);
                }
                Ok(EmptyOutput::new_zeroed().as_bytes().to_vec())
            }
            RequestType::StatCtxAlloc => {
                let id = next_id(st);
                st.stat_ctxs.insert(id);
                let mut out = StatCtxAllocOutput::new_zeroed();
                out.stat_ctx_id = Le32::new(id);
                Ok(out.as_bytes().to_vec())
            }
            RequestType::StatCtxFree => {
                let req: StatCtxFreeInput = parse(body);
                if !st.stat_ctxs.remove(&req.stat_ctx_id.get()) {
                    return Err(fw_code::INVALID_PARAMS);
                }
                Ok(EmptyOutput::new_zeroed().as_bytes().to_vec())
            }
            RequestType::VnicAlloc => {
                if st.vnics.len() >= cfg.max_vnics as usize {
                    return Err(fw_code::RESOURCE_ALLOC_ERROR);
                }
                let id = next_id(st);
                st.vnics.insert(id);
                let mut out = VnicAllocOutput::new_zeroed();
                out.vnic_id = Le32::new(id);
                Ok(out.as_bytes().to_vec())
            }
            RequestType::VnicFree => {
                let req: VnicFreeInput = parse(body);
                if !st.vnics.remove(&req.vnic_id.get()) {
                    return Err(fw_code::INVALID_PARAMS);
                }
                Ok(EmptyOutput::new_zeroed().as_bytes().to_vec())
            }
            RequestType::FuncBackingStoreQcaps => {
                if cfg.backing_store == SimBackingStore::None {
                    return Err(fw_code::CMD_NOT_SUPPORTED);
                }
                Ok(legacy_bs_qcaps().as_bytes().to_vec())
            }
            RequestType::FuncBackingStoreCfg => {
                if cfg.backing_store == SimBackingStore::None {
                    return Err(fw_code::CMD_NOT_SUPPORTED);
                }
                let req: FuncBackingStoreCfgInput = parse(body);
                let enables = req.enables.get();
                let bits = [
                    (BS_CFG_ENABLES_QP, ContextType::Qp),
                    (BS_CFG_ENABLES_SRQ, ContextType::Srq),
                    (BS_CFG_ENABLES_CQ, ContextType::Cq),
                    (BS_CFG_ENABLES_VNIC, ContextType::Vnic),
                    (BS_CFG_ENABLES_STAT, ContextType::Stat),
                    (BS_CFG_ENABLES_TQM_SP, ContextType::Stqm),
                    (BS_CFG_ENABLES_TQM_RING0, ContextType::Ftqm),
                    (BS_CFG_ENABLES_MRAV, ContextType::Mrav),
                    (BS_CFG_ENABLES_TIM, ContextType::Tim),
                ];
                for (bit, ctx) in bits {
                    if enables & bit != 0 {
                        st.bs_types.insert(ctx as u16);
                    }
                }
                if enables & BS_CFG_ENABLES_QP != 0 && req.qp.page_dir.get() == 0 {
                    return Err(fw_code::INVALID_PARAMS);
                }
                st.bs_committed = true;
                Ok(EmptyOutput::new_zeroed().as_bytes().to_vec())
            }
            RequestType::FuncBackingStoreQcapsV2 => {
                if cfg.backing_store != SimBackingStore::V2 {
                    return Err(fw_code::CMD_NOT_SUPPORTED);
                }
                let req: FuncBackingStoreQcapsV2Input = parse(body);
                let pos = V2_CAPS.iter().position(|c| c.ctx_type as u16 == req.type_.get()).ok_or(fw_code::INVALID_PARAMS)?;
                let caps = &V2_CAPS[pos];
                let mut out = FuncBackingStoreQcapsV2Output::new_zeroed();
                out.type_ = Le16::new(caps.ctx_type as u16);
                out.entry_size = Le16::new(caps.entry_size);
                let mut flags = BS_QCAPS_V2_FLAGS_TYPE_VALID;
                if caps.init_value != 0 {
                    flags |= BS_QCAPS_V2_FLAGS_ENABLE_CTX_KIND_INIT;
                }
                out.flags = Le32::new(flags);
                out.instance_bit_map = Le32::new(caps.instance_bmap);
                out.ctx_init_value = caps.init_value;
                out.ctx_init_offset = caps.init_offset;
                out.entry_multiple = caps.multiple;
                out.min_num_entries = Le32::new(caps.min);
                out.max_num_entries = Le32::new(caps.max);
                out.next_valid_type = Le16::new(V2_CAPS.get(pos + 1).map_or(BS_QCAPS_V2_TYPE_INVALID, |c| c.ctx_type as u16));
                Ok(out.as_bytes().to_vec())
            }
            RequestType::FuncBackingStoreCfgV2 => {
                if cfg.backing_store != SimBackingStore::V2 {
                    return Err(fw_code::CMD_NOT_SUPPORTED);
                }
                let req: FuncBackingStoreCfgV2Input = parse(body);
                if req.page_dir.get() == 0 {
                    return Err(fw_code::INVALID_PARAMS);
                }
                st.bs_types.insert(req.type_.get());
                if req.flags.get() & BS_CFG_V2_FLAGS_BS_CFG_ALL_DONE != 0 {
                    st.bs_committed = true;
                }
                Ok(EmptyOutput::new_zeroed().as_bytes().to_vec())
            }
            RequestType::NvmRead => {
                let req: NvmReadInput = parse(body);
                let item = st.nvm.get(&req.dir_idx.get()).ok_or(fw_code::INVALID_PARAMS)?;
                let start = req.offset.get() as usize;
                let end = start + req.len.get() as usize;
                if end > item.len() {
                    return Err(fw_code::INVALID_PARAMS);
                }
                self.dma.write_phys(req.host_dest_addr.get(), &item[start..end]).map_err(|_e| fw_code::INVALID_PARAMS)?;
                Ok(EmptyOutput::new_zeroed().as_bytes().to_vec())
            }
            RequestType::NvmWrite => {
                let req: NvmWriteInput = parse(body);
                let mut data = alloc::vec![0u8; req.dir_data_length.get() as usize];
                self.dma.read_phys(req.host_src_addr.get(), &mut data).map_err(|_e| fw_code::INVALID_PARAMS)?;
                let dir_type = req.dir_type.get();
                st.nvm.insert(dir_type, data);
                let mut out = NvmWriteOutput::new_zeroed();
                out.dir_item_length = req.dir_data_length;
                out.dir_idx = Le16::new(dir_type);
                Ok(out.as_bytes().to_vec())
            }
            RequestType::NvmInstallUpdate => {
                let mut out = NvmInstallUpdateOutput::new_zeroed();
                out.installed_items = Le64::new(st.nvm.len() as u64);
                Ok(out.as_bytes().to_vec())
            }
        }
    }
}

impl RegisterSpace for SimDevice {
    fn read32(&self, offset: usize) -> u32 {
        let mut st = self.state.lock();
        if (FW_HEALTH_WIN_BASE..FW_HEALTH_WIN_BASE + PAGE_SIZE).contains(&offset) {
            let addr = SimDevice::window_base(&st, FW_HEALTH_WIN_MAP_OFF) + (offset as u32 & GRC_OFFSET_MASK);
            return self.grc_read(&mut st, addr);
        }
        st.bar0.get(&offset).copied().unwrap_or(0)
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut st = self.state.lock();
        if (FW_RESET_WIN_BASE..FW_RESET_WIN_BASE + PAGE_SIZE).contains(&offset) {
            let addr = SimDevice::window_base(&st, FW_RESET_WIN_MAP_OFF) + (offset as u32 & GRC_OFFSET_MASK);
            st.reset_writes.push((addr, value));
            st.grc.insert(addr, value);
            if addr == SIM_GRC_RESET_REG1 {
                self.reset_locked(&mut st);
            }
            return;
        }
        st.bar0.insert(offset, value);
        if offset == HWRM_TRIGGER_OFFSET && value != 0 {
            self.process_mailbox(&mut st);
        }
    }

    fn write64(&self, offset: usize, value: u64) {
        let mut st = self.state.lock();
        st.bar0.insert(offset, value as u32);
        st.bar0.insert(offset + 4, (value >> 32) as u32);
    }

    fn len(&self) -> usize {
        SIM_BAR_LEN
    }
}

fn next_id(st: &mut SimState) -> u32 {
    let id = st.next_id;
    st.next_id += 1;
    id
}

fn parse<T: FromBytes + FromZeroes>(body: &[u8]) -> T {
    T::read_from_prefix(body).unwrap_or_else(T::new_zeroed)
}

/// The size of the request structure of each type, so direct requests can be cut from the mailbox.
fn request_len(req_type: u16) -> usize {
    match RequestType::try_from(req_type) {
        Ok(RequestType::VerGet) => size_of::<VerGetInput>(),
        Ok(RequestType::FuncQcaps) => size_of::<FuncQcapsInput>(),
        Ok(RequestType::FuncQcfg) => size_of::<FuncQcfgInput>(),
        Ok(RequestType::FuncCfg) => size_of::<FuncCfgInput>(),
        Ok(RequestType::FuncDrvUnrgtr) => size_of::<FuncDrvUnrgtrInput>(),
        Ok(RequestType::FuncDrvRgtr) => size_of::<FuncDrvRgtrInput>(),
        Ok(RequestType::VnicAlloc) => size_of::<VnicAllocInput>(),
        Ok(RequestType::VnicFree) => size_of::<VnicFreeInput>(),
        Ok(RequestType::RingAlloc) => size_of::<RingAllocInput>(),
        Ok(RequestType::RingFree) => size_of::<RingFreeInput>(),
        Ok(RequestType::RingGrpAlloc) => size_of::<RingGrpAllocInput>(),
        Ok(RequestType::RingGrpFree) => size_of::<RingGrpFreeInput>(),
        Ok(RequestType::StatCtxAlloc) => size_of::<StatCtxAllocInput>(),
        Ok(RequestType::StatCtxFree) => size_of::<StatCtxFreeInput>(),
        Ok(RequestType::FwReset) => size_of::<FwResetInput>(),
        Ok(RequestType::FuncResourceQcaps) => size_of::<FuncResourceQcapsInput>(),
        Ok(RequestType::FuncBackingStoreCfg) => size_of::<FuncBackingStoreCfgInput>(),
        Ok(RequestType::FuncBackingStoreQcaps) => size_of::<FuncBackingStoreQcapsInput>(),
        Ok(RequestType::ErrorRecoveryQcfg) => size_of::<ErrorRecoveryQcfgInput>(),
        Ok(RequestType::FuncBackingStoreCfgV2) => size_of::<FuncBackingStoreCfgV2Input>(),
        Ok(RequestType::FuncBackingStoreQcapsV2) => size_of::<FuncBackingStoreQcapsV2Input>(),
        Ok(RequestType::NvmInstallUpdate) => size_of::<NvmInstallUpdateInput>(),
        Ok(RequestType::NvmRead) => size_of::<NvmReadInput>(),
        Ok(RequestType::NvmWrite) => size_of::<NvmWriteInput>(),
        Err(_) => size_of::<RequestHeader>(),
    }
}

/// The device address of ring slot `slot`, walking the ring's page table if it has one.
fn slot_addr(dma: &HeapDmaAllocator, ring: &SimRing, slot: u32) -> Result<u64, &'static str> {
    let offset = slot as usize * RING_ENTRY_SIZE;
    match ring.depth {
        0 => Ok(ring.page_tbl_addr + offset as u64),
        _ => {
            let pte = dma.read_phys_u64(ring.page_tbl_addr + (offset / PAGE_SIZE * 8) as u64)?;
            if pte & PTU_PTE_VALID == 0 {
                return Err("sim: ring page table entry is not valid");
            }
            Ok((pte & !(PAGE_SIZE as u64 - 1)) + (offset % PAGE_SIZE) as u64)
        }
    }
}

fn legacy_bs_qcaps() -> FuncBackingStoreQcapsOutput {
    let mut out = FuncBackingStoreQcapsOutput::new_zeroed();
    out.qp_max_entries = Le32::new(4096);
    out.qp_min_qp1_entries = Le16::new(0);
    out.qp_max_l2_entries = Le16::new(1024);
    out.qp_entry_size = Le16::new(64);
    out.srq_max_l2_entries = Le16::new(512);
    out.srq_max_entries = Le32::new(1024);
    out.srq_entry_size = Le16::new(64);
    out.cq_max_l2_entries = Le16::new(1024);
    out.cq_max_entries = Le32::new(4096);
    out.cq_entry_size = Le16::new(64);
    out.vnic_max_vnic_entries = Le16::new(32);
    out.vnic_max_ring_table_entries = Le16::new(32);
    out.vnic_entry_size = Le16::new(128);
    out.stat_max_entries = Le32::new(256);
    out.stat_entry_size = Le16::new(64);
    out.tqm_entry_size = Le16::new(32);
    out.tqm_min_entries_per_ring = Le32::new(64);
    out.tqm_max_entries_per_ring = Le32::new(4096);
    out.mrav_max_entries = Le32::new(1024);
    out.mrav_entry_size = Le16::new(64);
    out.tim_entry_size = Le16::new(16);
    out.tim_max_entries = Le32::new(1024);
    out.tqm_entries_multiple = 32;
    out.tqm_fp_rings_count = 2;
    out.ctx_kind_initializer = 0xA5;
    out.ctx_init_mask = BS_QCAPS_INIT_MASK_QP | BS_QCAPS_INIT_MASK_CQ;
    out.qp_init_offset = 2;
    out.cq_init_offset = BS_CTX_INIT_OFFSET_INVALID;
    out
}

fn recovery_qcfg(flags: u32) -> ErrorRecoveryQcfgOutput {
    let mut out = ErrorRecoveryQcfgOutput::new_zeroed();
    out.flags = Le32::new(flags);
    out.driver_polling_freq = Le32::new(10);
    out.master_func_wait_period = Le32::new(2);
    out.normal_func_wait_period = Le32::new(5);
    out.master_func_wait_period_after_reset = Le32::new(10);
    out.max_bailout_time_after_reset = Le32::new(60);
    out.fw_health_status_reg = Le32::new(SIM_GRC_FW_STATUS | GRC_REG_TAG);
    out.fw_heartbeat_reg = Le32::new(SIM_GRC_FW_HEARTBEAT | GRC_REG_TAG);
    out.fw_reset_cnt_reg = Le32::new(SIM_GRC_FW_RESET_CNT | GRC_REG_TAG);
    out.reset_inprogress_reg = Le32::new(SIM_GRC_FW_STATUS | GRC_REG_TAG);
    out.reset_inprogress_reg_mask = Le32::new(FW_STATUS_SHUTDOWN);
    out.reg_array_cnt = 2;
    out.reset_reg[0] = Le32::new(SIM_GRC_RESET_REG0 | GRC_REG_TAG);
    out.reset_reg_val[0] = Le32::new(0x1);
    out.delay_after_reset[0] = 2;
    out.reset_reg[1] = Le32::new(SIM_GRC_RESET_REG1 | GRC_REG_TAG);
    out.reset_reg_val[1] = Le32::new(0x1);
    out
}
