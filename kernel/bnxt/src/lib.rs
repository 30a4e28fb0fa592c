//! Driver core for Broadcom NetXtreme-C/E (bnxt) NICs.
//!
//! A [`BnxtNic`] is the single context of one PCI function. It owns the HWRM channel,
//! every ring, the context memory (backing store) and the firmware health record, and
//! everything it owns is reached through `&mut BnxtNic`.
//!
//! The life cycle is:
//! 1. [`BnxtNic::probe()`] negotiates the HWRM interface, learns the chip generation and
//!    firmware capabilities, and registers the driver with firmware.
//! 2. [`BnxtNic::open()`] hands firmware its backing store, reserves and creates the rings,
//!    and arms the default completion ring that receives firmware async events.
//! 3. [`BnxtNic::service_default_completions()`], [`BnxtNic::health_check()`] and
//!    [`BnxtNic::service_task()`] run periodically; when firmware needs to be reset they
//!    hand over to the reset orchestrator, driven by [`reset::run_fw_reset_task()`].

#![cfg_attr(not(test), no_std)]

#[macro_use] extern crate log;
extern crate alloc;
extern crate bitflags;
extern crate bnxt_ethernet;
extern crate nic_hal;
extern crate spin;
extern crate zerocopy;

mod admin;
mod backing_store;
mod bringup;
pub mod dispatcher;
mod health_monitor;
pub mod reset;
pub mod ring_manager;

use alloc::sync::Arc;
use bitflags::bitflags;
use bnxt_ethernet::async_event::{DFLT_FW_RST_MAX_DSECS, DFLT_FW_RST_MIN_DSECS};
use bnxt_ethernet::capabilities::{ChipGeneration, FwCapabilities};
use bnxt_ethernet::context_memory::{ContextTable, ContextType};
use bnxt_ethernet::doorbell::DoorbellOps;
use bnxt_ethernet::health::{DeviceIo, FwHealth};
use bnxt_ethernet::messages::HwrmRequest;
use bnxt_ethernet::page_table::MAX_CTX_PAGES;
use bnxt_ethernet::{ContextMemError, HealthError, HwrmChannel, HwrmError, RingError};
use core::fmt;
use nic_hal::{Clock, DmaAllocator};
use spin::{Mutex, Once};

pub use admin::InstallResult;
pub use bringup::{FwVersion, ResourceLimits};
pub use dispatcher::{AsyncEventDispatcher, AsyncEventListener, EventMask, SubscriberId};
pub use reset::{FwResetState, ResetKind, ResetStep};
pub use ring_manager::{RingGroupHandle, RingHandle, StatCtxHandle};

use reset::ResetSession;
use ring_manager::RingManager;

/// The OS type this driver reports in `FUNC_DRV_RGTR` ("other").
pub const OS_TYPE_OTHER: u16 = 0x1;

/// Only one bnxt function is driven through the global instance for now.
static BNXT_NIC: Once<Mutex<BnxtNic>> = Once::new();

/// Returns the NIC set up by [`init()`], if any.
pub fn get_bnxt_nic() -> Option<&'static Mutex<BnxtNic>> {
    BNXT_NIC.get()
}

/// Probes and opens the bnxt function reachable through `io`, and keeps it as the global instance.
pub fn init(
    io: DeviceIo,
    clock: Arc<dyn Clock>,
    dma: Arc<dyn DmaAllocator>,
    config: BnxtConfig,
) -> Result<&'static Mutex<BnxtNic>, BnxtError> {
    if BNXT_NIC.get().is_some() {
        error!("bnxt::init(): a bnxt NIC was already initialized");
        return Err(BnxtError::AlreadyInitialized);
    }
    let mut nic = BnxtNic::probe(io, clock, dma, config)?;
    nic.open()?;
    Ok(BNXT_NIC.call_once(|| Mutex::new(nic)))
}

/// Runtime tunables of one NIC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BnxtConfig {
    /// Transmit/receive ring pairs created by [`BnxtNic::open()`].
    pub num_queue_pairs: u16,
    pub tx_ring_size: u32,
    pub rx_ring_size: u32,
    /// Size of each queue pair's completion ring.
    pub cmpl_ring_size: u32,
    /// Size of the completion ring that receives firmware async events.
    pub default_cmpl_ring_size: u32,
    /// Size of the notification rings of P5 and newer chips.
    pub nq_ring_size: u32,
    /// Page table fan-out used for context memory.
    pub ctx_fanout: usize,
    pub os_type: u16,
    /// How often firmware refreshes statistics contexts, in milliseconds.
    pub stats_update_ms: u32,
    /// Reset waits used when firmware does not supply its own, in deciseconds.
    pub fw_reset_min_dsecs: u16,
    pub fw_reset_max_dsecs: u16,
}

impl Default for BnxtConfig {
    fn default() -> Self {
        BnxtConfig {
            num_queue_pairs: 1,
            tx_ring_size: 512,
            rx_ring_size: 512,
            cmpl_ring_size: 1024,
            default_cmpl_ring_size: 512,
            nq_ring_size: 256,
            ctx_fanout: MAX_CTX_PAGES,
            os_type: OS_TYPE_OTHER,
            stats_update_ms: 1000,
            fw_reset_min_dsecs: DFLT_FW_RST_MIN_DSECS,
            fw_reset_max_dsecs: DFLT_FW_RST_MAX_DSECS,
        }
    }
}

bitflags! {
    /// Device state, checked by every entry point.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DeviceState: u32 {
        /// Rings, VNIC and backing store are set up.
        const OPEN              = 1 << 0;
        /// The reset orchestrator owns the device.
        const IN_FW_RESET       = 1 << 1;
        /// Firmware reported, or we detected, a fatal condition.
        const FW_FATAL_COND     = 1 << 2;
        const FW_NON_FATAL_COND = 1 << 3;
        /// The last recovery attempt failed; the device stays down.
        const ABORT_ERR         = 1 << 4;
    }
}

bitflags! {
    /// Work recorded by the event handlers for the next [`BnxtNic::service_task()`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ServiceEvents: u32 {
        const LINK_CHANGE    = 1 << 0;
        const RESET_NOTIFY   = 1 << 1;
        const FW_EXCEPTION   = 1 << 2;
        const ERROR_RECOVERY = 1 << 3;
    }
}

/// Possible reasons for a driver operation to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BnxtError {
    Hwrm(HwrmError),
    Ring(RingError),
    ContextMem(ContextMemError),
    Health(HealthError),
    /// A firmware reset is in progress; try again once it has finished.
    InReset,
    /// The operation needs an open device.
    NotOpen,
    /// A ring was requested before firmware received backing store for its context type.
    BackingStoreMissing(ContextType),
    /// `VER_GET` reported that firmware is still initializing.
    FirmwareNotReady,
    /// The handle does not name a live ring, ring group or stat context.
    InvalidHandle,
    /// Firmware offers fewer rings or contexts than the configuration asks for.
    InsufficientResources,
    AlreadyInitialized,
    Dma(&'static str),
    Pci(&'static str),
}

impl From<HwrmError> for BnxtError {
    fn from(e: HwrmError) -> Self {
        BnxtError::Hwrm(e)
    }
}

impl From<RingError> for BnxtError {
    fn from(e: RingError) -> Self {
        BnxtError::Ring(e)
    }
}

impl From<ContextMemError> for BnxtError {
    fn from(e: ContextMemError) -> Self {
        BnxtError::ContextMem(e)
    }
}

impl From<HealthError> for BnxtError {
    fn from(e: HealthError) -> Self {
        BnxtError::Health(e)
    }
}

impl From<BnxtError> for &'static str {
    fn from(value: BnxtError) -> Self {
        match value {
            BnxtError::Hwrm(e) => e.into(),
            BnxtError::Ring(e) => e.into(),
            BnxtError::ContextMem(e) => e.into(),
            BnxtError::Health(e) => e.into(),
            BnxtError::InReset => "firmware reset in progress",
            BnxtError::NotOpen => "device is not open",
            BnxtError::BackingStoreMissing(_) => "no backing store committed for the ring's context type",
            BnxtError::FirmwareNotReady => "firmware is not ready",
            BnxtError::InvalidHandle => "invalid ring, ring group or stat context handle",
            BnxtError::InsufficientResources => "firmware cannot provide the configured resources",
            BnxtError::AlreadyInitialized => "bnxt NIC was already initialized",
            BnxtError::Dma(e) => e,
            BnxtError::Pci(e) => e,
        }
    }
}

impl fmt::Display for BnxtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BnxtError::Hwrm(e) => write!(f, "{}", e),
            BnxtError::BackingStoreMissing(t) => write!(f, "no backing store committed for {:?} contexts", t),
            other => f.write_str(<&'static str>::from(*other)),
        }
    }
}

/// One bnxt PCI function.
pub struct BnxtNic {
    io: DeviceIo,
    clock: Arc<dyn Clock>,
    dma: Arc<dyn DmaAllocator>,
    config: BnxtConfig,
    hwrm: Mutex<HwrmChannel>,
    generation: ChipGeneration,
    /// Chosen from `generation` once the chip is known.
    doorbells: &'static dyn DoorbellOps,
    caps: FwCapabilities,
    fw_version: FwVersion,
    limits: ResourceLimits,
    mac_address: [u8; 6],
    state: DeviceState,
    events: ServiceEvents,
    rings: RingManager,
    backing_store: Option<ContextTable>,
    dispatcher: AsyncEventDispatcher,
    health: Option<FwHealth>,
    reset: ResetSession,
    /// The completion ring firmware posts async events to.
    default_cmpl: Option<RingHandle>,
    /// The notification ring every completion ring reports to, on P5 and newer.
    default_nq: Option<RingHandle>,
    queues: alloc::vec::Vec<QueuePair>,
    vnic_id: Option<u32>,
    /// Bumped whenever firmware reports a link change; the link is re-read on demand.
    link_generation: u32,
}

/// The rings and contexts of one transmit/receive queue pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueuePair {
    pub tx: RingHandle,
    pub rx: RingHandle,
    pub cmpl: RingHandle,
    pub stat_ctx: StatCtxHandle,
    /// Legacy chips only.
    pub ring_group: Option<RingGroupHandle>,
}

impl BnxtNic {
    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state.contains(DeviceState::OPEN)
    }

    pub fn in_reset(&self) -> bool {
        self.state.contains(DeviceState::IN_FW_RESET)
    }

    pub fn generation(&self) -> ChipGeneration {
        self.generation
    }

    pub fn capabilities(&self) -> FwCapabilities {
        self.caps
    }

    pub fn config(&self) -> &BnxtConfig {
        &self.config
    }

    pub fn fw_version(&self) -> FwVersion {
        self.fw_version
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        self.limits
    }

    pub fn mac_address(&self) -> [u8; 6] {
        self.mac_address
    }

    pub fn queues(&self) -> &[QueuePair] {
        &self.queues
    }

    pub fn default_completion_ring(&self) -> Option<RingHandle> {
        self.default_cmpl
    }

    pub fn default_notification_ring(&self) -> Option<RingHandle> {
        self.default_nq
    }

    pub fn vnic_id(&self) -> Option<u32> {
        self.vnic_id
    }

    pub fn link_generation(&self) -> u32 {
        self.link_generation
    }

    pub fn pending_events(&self) -> ServiceEvents {
        self.events
    }

    pub fn health(&self) -> Option<&FwHealth> {
        self.health.as_ref()
    }

    pub fn backing_store(&self) -> Option<&ContextTable> {
        self.backing_store.as_ref()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Rejects calls made while the reset orchestrator owns the device.
    fn ensure_not_in_reset(&self) -> Result<(), BnxtError> {
        if self.in_reset() {
            return Err(BnxtError::InReset);
        }
        Ok(())
    }

    /// Whether firmware can be expected to answer commands.
    fn fw_accessible(&self) -> bool {
        !self.state.contains(DeviceState::FW_FATAL_COND)
            && !self.health.as_ref().map_or(false, |h| h.firmware_is_shut_down(&self.io))
    }

    fn send<R: HwrmRequest>(&self, req: &R) -> Result<R::Response, BnxtError> {
        Ok(self.hwrm.lock().send(req)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bnxt_ethernet::sim::{SimDevice, SimDeviceConfig};

    /// Probes the function of `sim` with `config`.
    pub(crate) fn probe(sim: &Arc<SimDevice>, config: BnxtConfig) -> Result<BnxtNic, BnxtError> {
        BnxtNic::probe(sim.io(), sim.clock(), Arc::new(sim.dma()), config)
    }

    /// A simulated device of configuration `cfg` and a probed, still closed NIC on it.
    pub(crate) fn sim_nic(cfg: SimDeviceConfig) -> (Arc<SimDevice>, BnxtNic) {
        let sim = SimDevice::new(cfg);
        let nic = probe(&sim, BnxtConfig::default()).unwrap();
        (sim, nic)
    }

    #[test]
    fn test_error_strings() {
        assert_eq!(<&'static str>::from(BnxtError::InReset), "firmware reset in progress");
        let e = BnxtError::BackingStoreMissing(ContextType::Qp);
        assert_eq!(alloc::format!("{}", e), "no backing store committed for Qp contexts");
    }

    #[test]
    fn test_init_keeps_one_global_nic() {
        let sim = SimDevice::new(SimDeviceConfig::legacy());
        let nic = init(sim.io(), sim.clock(), Arc::new(sim.dma()), BnxtConfig::default()).unwrap();
        assert!(nic.lock().is_open());
        assert!(get_bnxt_nic().is_some());
        let other = SimDevice::new(SimDeviceConfig::legacy());
        let again = init(other.io(), other.clock(), Arc::new(other.dma()), BnxtConfig::default());
        assert!(matches!(again, Err(BnxtError::AlreadyInitialized)));
    }
}
