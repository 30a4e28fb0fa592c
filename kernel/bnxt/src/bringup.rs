//! Bring-up and teardown of one function: HWRM version negotiation, capability discovery,
//! driver registration, resource reservation, and opening and closing the data path.

use alloc::sync::Arc;
use alloc::vec::Vec;
use bnxt_ethernet::async_event::AsyncEventId;
use bnxt_ethernet::capabilities::{ChipGeneration, FwCapabilities};
use bnxt_ethernet::health::{DeviceIo, FwHealth, RecoveryConfig};
use bnxt_ethernet::hwrm::new_request;
use bnxt_ethernet::messages::*;
use bnxt_ethernet::ring::RingKind;
use bnxt_ethernet::HwrmChannel;
use nic_hal::{Clock, DmaAllocator};
use spin::Mutex;

use crate::dispatcher::{AsyncEventDispatcher, EventMask};
use crate::reset::ResetSession;
use crate::ring_manager::{RingLinks, RingManager};
use crate::{BnxtConfig, BnxtError, BnxtNic, DeviceState, ServiceEvents};

/// The driver version reported to firmware.
const DRV_VERSION: (u8, u8, u8) = (0, 1, 0);

/// Events this driver acts on itself; subscribers may add more.
const DRIVER_EVENTS: [AsyncEventId; 6] = [
    AsyncEventId::LinkStatusChange,
    AsyncEventId::LinkSpeedChange,
    AsyncEventId::LinkSpeedCfgChange,
    AsyncEventId::ResetNotify,
    AsyncEventId::ErrorRecovery,
    AsyncEventId::ErrorReport,
];

/// Firmware and HWRM interface versions reported by `VER_GET`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FwVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u8,
    /// The HWRM interface version firmware speaks.
    pub hwrm_intf: (u8, u8, u8),
    pub chip_num: u16,
}

/// How many rings and contexts firmware lets this function have.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub max_tx_rings: u16,
    pub max_rx_rings: u16,
    pub max_cmpl_rings: u16,
    pub max_stat_ctx: u16,
    pub max_vnics: u16,
    pub max_ring_grps: u16,
    pub max_nqs: u16,
}

impl BnxtNic {
    /// Negotiates with the firmware of the function behind `io` and registers this driver.
    ///
    /// The function is left registered but closed; call [`BnxtNic::open()`] to create rings.
    pub fn probe(
        io: DeviceIo,
        clock: Arc<dyn Clock>,
        dma: Arc<dyn DmaAllocator>,
        config: BnxtConfig,
    ) -> Result<BnxtNic, BnxtError> {
        io.pci.enable_device().map_err(BnxtError::Pci)?;
        // set the bus mastering bit for this function, which allows it to use DMA
        io.pci.set_bus_master(true);

        let hwrm = HwrmChannel::new(io.bar0.clone(), clock.clone(), &*dma)?;
        let generation = ChipGeneration::Legacy;
        let mut nic = BnxtNic {
            io,
            clock,
            dma,
            config,
            hwrm: Mutex::new(hwrm),
            generation,
            doorbells: generation.doorbell_ops(),
            caps: FwCapabilities::empty(),
            fw_version: FwVersion::default(),
            limits: ResourceLimits::default(),
            mac_address: [0; 6],
            state: DeviceState::empty(),
            events: ServiceEvents::empty(),
            rings: RingManager::new(),
            backing_store: None,
            dispatcher: AsyncEventDispatcher::new(),
            health: None,
            reset: ResetSession::new(),
            default_cmpl: None,
            default_nq: None,
            queues: Vec::new(),
            vnic_id: None,
            link_generation: 0,
        };
        nic.bring_up_firmware()?;
        let v = nic.fw_version;
        info!("bnxt: chip {:#X} ({:?}), firmware {}.{}.{}, HWRM {}.{}.{}, caps {:?}, MAC {:X?}",
            v.chip_num, nic.generation, v.major, v.minor, v.build,
            v.hwrm_intf.0, v.hwrm_intf.1, v.hwrm_intf.2, nic.caps, nic.mac_address);
        Ok(nic)
    }

    /// Everything probing asks of firmware. The reset orchestrator runs it again after a reset.
    pub(crate) fn bring_up_firmware(&mut self) -> Result<(), BnxtError> {
        self.query_version()?;
        self.query_capabilities()?;
        if self.caps.contains(FwCapabilities::ERROR_RECOVERY) {
            self.query_error_recovery();
        } else {
            self.health = None;
        }
        self.register_driver()
    }

    fn query_version(&mut self) -> Result<(), BnxtError> {
        let mut req: VerGetInput = new_request();
        req.hwrm_intf_maj = HWRM_VERSION_MAJOR;
        req.hwrm_intf_min = HWRM_VERSION_MINOR;
        req.hwrm_intf_upd = HWRM_VERSION_UPDATE;

        let caps = {
            let mut hwrm = self.hwrm.lock();
            let ver = hwrm.send(&req)?;
            if ver.flags & VER_GET_FLAGS_DEV_NOT_RDY != 0 {
                warn!("bnxt: firmware reports it is not ready yet");
                return Err(BnxtError::FirmwareNotReady);
            }
            hwrm.apply_version(&ver);
            let caps = FwCapabilities::from_version(&ver);
            if caps.contains(FwCapabilities::SHORT_CMD) && !hwrm.short_commands_enabled() {
                hwrm.enable_short_commands(&*self.dma, caps.contains(FwCapabilities::SHORT_CMD_REQUIRED))?;
            }
            self.fw_version = FwVersion {
                major: ver.fw_maj,
                minor: ver.fw_min,
                build: ver.fw_bld,
                hwrm_intf: (ver.hwrm_intf_maj, ver.hwrm_intf_min, ver.hwrm_intf_upd),
                chip_num: ver.chip_num.get(),
            };
            caps
        };
        // the rest of the capability set comes from FUNC_QCAPS
        self.caps = caps;
        self.generation = ChipGeneration::from_chip_num(self.fw_version.chip_num);
        self.doorbells = self.generation.doorbell_ops();
        Ok(())
    }

    fn query_capabilities(&mut self) -> Result<(), BnxtError> {
        let mut req: FuncQcapsInput = new_request();
        req.fid = Le16::new(FID_SELF);
        let qcaps = self.send(&req)?;
        self.caps |= FwCapabilities::from_func_qcaps(&qcaps);
        self.mac_address = qcaps.mac_address;
        self.limits = ResourceLimits {
            max_tx_rings: qcaps.max_tx_rings.get(),
            max_rx_rings: qcaps.max_rx_rings.get(),
            max_cmpl_rings: qcaps.max_cmpl_rings.get(),
            max_stat_ctx: qcaps.max_stat_ctx.get(),
            max_vnics: qcaps.max_vnics.get(),
            max_ring_grps: qcaps.max_hw_ring_grps.get(),
            max_nqs: qcaps.max_nqs.get(),
        };

        if self.caps.contains(FwCapabilities::RESOURCE_QCAPS) {
            let mut req: FuncResourceQcapsInput = new_request();
            req.fid = Le16::new(FID_SELF);
            match self.send(&req) {
                Ok(res) => {
                    self.limits.max_tx_rings = res.max_tx_rings.get();
                    self.limits.max_rx_rings = res.max_rx_rings.get();
                    self.limits.max_cmpl_rings = res.max_cmpl_rings.get();
                    self.limits.max_stat_ctx = res.max_stat_ctx.get();
                    self.limits.max_vnics = res.max_vnics.get();
                }
                Err(BnxtError::Hwrm(e)) if e.is_generic_failure() => {
                    debug!("bnxt: FUNC_RESOURCE_QCAPS unavailable, keeping the FUNC_QCAPS limits");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Reads the error recovery configuration. Firmware that cannot describe it loses the capability.
    fn query_error_recovery(&mut self) {
        let req: ErrorRecoveryQcfgInput = new_request();
        let config = self.send(&req).and_then(|resp| Ok(RecoveryConfig::from_qcfg(&resp)?));
        match config {
            Ok(config) => {
                let health = match self.health.take() {
                    Some(mut health) => {
                        health.set_config(config);
                        health
                    }
                    None => FwHealth::new(config),
                };
                let health = self.health.insert(health);
                health.map_registers(&self.io);
            }
            Err(e) => {
                warn!("bnxt: error recovery query failed ({}), recovery disabled", e);
                self.caps.remove(FwCapabilities::ERROR_RECOVERY);
                self.health = None;
            }
        }
    }

    /// The async events firmware should forward to this function.
    pub(crate) fn forwarded_events(&self) -> EventMask {
        let mut mask = self.dispatcher.subscribed_events();
        for id in DRIVER_EVENTS {
            mask.insert(id as u16);
        }
        mask
    }

    pub(crate) fn register_driver(&mut self) -> Result<(), BnxtError> {
        let mut req: FuncDrvRgtrInput = new_request();
        if self.caps.contains(FwCapabilities::ERROR_RECOVERY) {
            req.flags = Le32::new(FUNC_DRV_RGTR_FLAGS_ERROR_RECOVERY_SUPPORT | FUNC_DRV_RGTR_FLAGS_MASTER_SUPPORT);
        }
        req.enables = Le32::new(FUNC_DRV_RGTR_ENABLES_OS_TYPE | FUNC_DRV_RGTR_ENABLES_VER | FUNC_DRV_RGTR_ENABLES_ASYNC_EVENT_FWD);
        req.os_type = Le16::new(self.config.os_type);
        (req.ver_maj, req.ver_min, req.ver_upd) = DRV_VERSION;
        req.async_event_fwd = self.forwarded_events().words().map(Le32::new);
        self.send(&req)?;
        debug!("bnxt: driver registered with firmware");
        Ok(())
    }

    pub(crate) fn unregister_driver(&mut self) -> Result<(), BnxtError> {
        let req: FuncDrvUnrgtrInput = new_request();
        self.send(&req)?;
        Ok(())
    }

    /// Creates the data path: backing store, reserved resources, the default completion ring,
    /// the queue pairs and the default VNIC. Does nothing if the device is already open.
    pub fn open(&mut self) -> Result<(), BnxtError> {
        self.ensure_not_in_reset()?;
        if self.is_open() {
            return Ok(());
        }
        self.open_inner()
    }

    /// Opens the device; on failure everything created so far is torn down again.
    pub(crate) fn open_inner(&mut self) -> Result<(), BnxtError> {
        if let Err(e) = self.try_open() {
            error!("bnxt: open failed: {}", e);
            self.close_inner();
            return Err(e);
        }
        self.state.insert(DeviceState::OPEN);
        self.state.remove(DeviceState::ABORT_ERR);
        info!("bnxt: opened with {} queue pair(s)", self.queues.len());
        Ok(())
    }

    fn try_open(&mut self) -> Result<(), BnxtError> {
        self.check_resources()?;
        if self.generation.needs_backing_store() && !self.backing_store.as_ref().map_or(false, |t| t.is_committed()) {
            self.setup_backing_store()?;
        }
        self.reserve_resources()?;

        if self.generation.has_notification_rings() {
            let nq = self.alloc_ring(RingKind::Notification, self.config.nq_ring_size, RingLinks::default())?;
            self.default_nq = Some(nq);
        }
        let links = RingLinks { nq: self.default_nq, ..RingLinks::default() };
        let cmpl = self.alloc_ring(RingKind::Completion, self.config.default_cmpl_ring_size, links)?;
        self.default_cmpl = Some(cmpl);
        self.set_async_event_ring(cmpl)?;

        for _ in 0..self.config.num_queue_pairs {
            let qp = self.create_queue_pair()?;
            self.queues.push(qp);
        }
        self.vnic_id = Some(self.allocate_vnic()?);
        self.arm_completion_rings();
        Ok(())
    }

    /// Rejects configurations firmware cannot satisfy before anything is allocated.
    fn check_resources(&self) -> Result<(), BnxtError> {
        let qps = self.config.num_queue_pairs;
        let l = &self.limits;
        let fits = qps > 0
            && qps <= l.max_tx_rings
            && qps <= l.max_rx_rings
            && qps < l.max_cmpl_rings
            && qps <= l.max_stat_ctx
            && l.max_vnics >= 1
            && (!self.generation.needs_ring_groups() || qps <= l.max_ring_grps);
        if !fits {
            error!("bnxt: {} queue pair(s) requested, but firmware limits are {:?}", qps, l);
            return Err(BnxtError::InsufficientResources);
        }
        Ok(())
    }

    /// Asks firmware to set aside the rings and contexts `open` is about to create,
    /// and checks that it did.
    fn reserve_resources(&mut self) -> Result<(), BnxtError> {
        let qps = self.config.num_queue_pairs;
        let cmpl_rings = qps + 1;
        let mut req: FuncCfgInput = new_request();
        req.fid = Le16::new(FID_SELF);
        let mut enables = FUNC_CFG_ENABLES_NUM_TX_RINGS
            | FUNC_CFG_ENABLES_NUM_RX_RINGS
            | FUNC_CFG_ENABLES_NUM_CMPL_RINGS
            | FUNC_CFG_ENABLES_NUM_STAT_CTXS
            | FUNC_CFG_ENABLES_NUM_VNICS;
        req.num_tx_rings = Le16::new(qps);
        req.num_rx_rings = Le16::new(qps);
        req.num_cmpl_rings = Le16::new(cmpl_rings);
        req.num_stat_ctxs = Le16::new(qps);
        req.num_vnics = Le16::new(1);
        if self.generation.needs_ring_groups() {
            enables |= FUNC_CFG_ENABLES_NUM_HW_RING_GRPS;
            req.num_hw_ring_grps = Le16::new(qps);
        }
        req.enables = Le32::new(enables);
        self.send(&req)?;

        let mut req: FuncQcfgInput = new_request();
        req.fid = Le16::new(FID_SELF);
        let qcfg = self.send(&req)?;
        if qcfg.alloc_tx_rings.get() < qps
            || qcfg.alloc_rx_rings.get() < qps
            || qcfg.alloc_cmpl_rings.get() < cmpl_rings
            || qcfg.alloc_stat_ctx.get() < qps
            || qcfg.alloc_vnics.get() < 1
        {
            error!("bnxt: firmware reserved fewer resources than requested: {:?}", qcfg);
            return Err(BnxtError::InsufficientResources);
        }
        Ok(())
    }

    /// Points firmware's async event completions at `ring`.
    fn set_async_event_ring(&mut self, ring: crate::RingHandle) -> Result<(), BnxtError> {
        let fw_id = self.rings.ring(ring).ok_or(BnxtError::InvalidHandle)?.fw_ring_id();
        let mut req: FuncCfgInput = new_request();
        req.fid = Le16::new(FID_SELF);
        req.enables = Le32::new(FUNC_CFG_ENABLES_ASYNC_EVENT_CR);
        req.async_event_cr = Le16::new(fw_id);
        self.send(&req)?;
        Ok(())
    }

    fn allocate_vnic(&mut self) -> Result<u32, BnxtError> {
        let mut req: VnicAllocInput = new_request();
        req.flags = Le32::new(VNIC_ALLOC_FLAGS_DEFAULT);
        Ok(self.send(&req)?.vnic_id.get())
    }

    /// Tears the data path down. The backing store and the registration stay.
    pub fn close(&mut self) -> Result<(), BnxtError> {
        self.ensure_not_in_reset()?;
        if self.is_open() {
            self.close_inner();
            info!("bnxt: closed");
        }
        Ok(())
    }

    /// Frees everything `open` created, telling firmware only if it can still answer.
    pub(crate) fn close_inner(&mut self) {
        let notify_fw = self.fw_accessible();
        if let Some(vnic_id) = self.vnic_id.take() {
            if notify_fw {
                let mut req: VnicFreeInput = new_request();
                req.vnic_id = Le32::new(vnic_id);
                if let Err(e) = self.send(&req) {
                    warn!("bnxt: failed to free VNIC {}: {}", vnic_id, e);
                }
            }
        }
        self.queues.clear();
        self.default_cmpl = None;
        self.default_nq = None;
        self.free_all_rings(notify_fw);
        self.state.remove(DeviceState::OPEN);
    }

    /// Closes the device and hands the function back: the driver unregisters, DMA stops and the
    /// backing store is released.
    pub fn shutdown(&mut self) -> Result<(), BnxtError> {
        self.ensure_not_in_reset()?;
        self.close_inner();
        self.release_function();
        Ok(())
    }

    /// Unregisters from firmware (if it can still answer), disables the PCI function and frees
    /// the backing store firmware was using.
    pub(crate) fn release_function(&mut self) {
        if self.fw_accessible() {
            if let Err(e) = self.unregister_driver() {
                warn!("bnxt: failed to unregister driver: {}", e);
            }
        }
        self.io.pci.disable_device();
        if let Some(mut table) = self.backing_store.take() {
            table.release_all();
        }
    }
}
