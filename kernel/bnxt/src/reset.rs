//! The firmware reset orchestrator.
//!
//! A reset is a sequence of steps, each run with the NIC locked by [`run_fw_reset_task()`].
//! A step that has to wait for firmware returns [`ResetStep::Requeue`] with a delay instead of
//! spinning, so the lock is free in between and other entry points can see `IN_FW_RESET`
//! and back off with [`BnxtError::InReset`].
//!
//! ```text
//! Idle -> PollFwDown -> ResetFw -> EnableDev -> PollFw -> Opening -> Idle
//!               \____________________/    \_______________________/
//!                 (skipped when firmware      (any timeout or failure
//!                  reloads itself)             ends in Aborted)
//! ```

use bnxt_ethernet::async_event::ResetNotify;
use bnxt_ethernet::capabilities::FwCapabilities;
use bnxt_ethernet::health::RecoveryFlags;
use bnxt_ethernet::hwrm::{new_request, SHORT_HWRM_CMD_TIMEOUT_MS};
use bnxt_ethernet::messages::*;
use nic_hal::PCI_SUBSYSTEM_ID;
use spin::Mutex;

use crate::{BnxtError, BnxtNic, DeviceState};

/// How long to wait between checks whether firmware has shut down.
const POLL_FW_DOWN_INTERVAL_MS: u64 = 200;
/// How long to wait between `VER_GET` probes while firmware comes back.
const POLL_FW_INTERVAL_MS: u64 = 200;
/// How long to wait between config space probes while the function is unreachable.
const POLL_PCI_INTERVAL_MS: u64 = 1;
/// The first step of a planned reset that waits for firmware to go down.
const POLL_FW_DOWN_FIRST_MS: u64 = 100;

fn dsecs_to_ms(dsecs: u32) -> u64 {
    dsecs as u64 * 100
}

/// Where a firmware reset currently stands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FwResetState {
    #[default]
    Idle,
    /// Waiting for firmware to report that it has shut down.
    PollFwDown,
    /// The primary function resets the chip.
    ResetFw,
    /// Re-enabling the PCI function once config space is reachable again.
    EnableDev,
    /// Waiting for firmware to answer `VER_GET`.
    PollFw,
    /// Bringing the function back up.
    Opening,
    /// The last reset failed; the device stays closed.
    Aborted,
}

/// The result of one orchestrator step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetStep {
    /// Run the next step after this many milliseconds.
    Requeue(u64),
    Completed,
    Aborted,
}

/// What started a reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetKind {
    /// Firmware announced the reset and told us how long it will take, in deciseconds.
    Planned { min_dsecs: u16, max_dsecs: u16 },
    /// The driver decided firmware must be reset, following the error recovery configuration.
    Forced,
}

/// State of the reset in progress, if any.
#[derive(Debug)]
pub(crate) struct ResetSession {
    state: FwResetState,
    min_wait_dsecs: u32,
    max_wait_dsecs: u32,
    /// When the current wait started, in clock milliseconds.
    timestamp_ms: u64,
    /// Whether the device was open when the reset began and must be reopened.
    was_open: bool,
    last_error: Option<BnxtError>,
    /// The last reset notification, consumed by the service task.
    pub(crate) pending_notify: Option<ResetNotify>,
}

impl ResetSession {
    pub(crate) const fn new() -> ResetSession {
        ResetSession {
            state: FwResetState::Idle,
            min_wait_dsecs: 0,
            max_wait_dsecs: 0,
            timestamp_ms: 0,
            was_open: false,
            last_error: None,
            pending_notify: None,
        }
    }

    fn requeue(&mut self, state: FwResetState, delay_ms: u64) -> ResetStep {
        self.state = state;
        ResetStep::Requeue(delay_ms)
    }
}

impl BnxtNic {
    pub fn fw_reset_state(&self) -> FwResetState {
        self.reset.state
    }

    /// The error that aborted the last reset, if it was aborted.
    pub fn fw_reset_error(&self) -> Option<BnxtError> {
        self.reset.last_error
    }

    /// Starts a firmware reset: every dependent is told, the data path is closed and the
    /// function released. Returns the delay before [`BnxtNic::fw_reset_step()`] should run.
    ///
    /// Does nothing and returns `None` if a reset is already in progress.
    pub fn begin_fw_reset(&mut self, kind: ResetKind) -> Option<u64> {
        if self.in_reset() {
            debug!("bnxt: firmware reset already in progress ({:?})", self.reset.state);
            return None;
        }
        warn!("bnxt: starting {:?} firmware reset", kind);
        self.state.insert(DeviceState::IN_FW_RESET);
        self.state.remove(DeviceState::ABORT_ERR);
        self.reset.last_error = None;
        self.reset.timestamp_ms = self.clock.now_ms();
        self.dispatcher.notify_reset_begin();

        let (next, delay_ms) = match kind {
            ResetKind::Planned { min_dsecs, max_dsecs } => {
                self.reset.min_wait_dsecs = min_dsecs as u32;
                self.reset.max_wait_dsecs = max_dsecs as u32;
                self.fw_reset_close();
                if self.caps.contains(FwCapabilities::ERR_RECOVER_RELOAD) {
                    (FwResetState::PollFwDown, POLL_FW_DOWN_FIRST_MS)
                } else {
                    (FwResetState::EnableDev, dsecs_to_ms(self.reset.min_wait_dsecs))
                }
            }
            ResetKind::Forced => {
                let (min, max, primary, wait) = match self.health.as_ref() {
                    Some(h) => {
                        let cfg = h.config();
                        let wait = if !h.is_primary() {
                            cfg.normal_func_wait_dsecs
                        } else if cfg.flags.contains(RecoveryFlags::CO_CPU) {
                            0
                        } else {
                            cfg.master_func_wait_dsecs
                        };
                        (cfg.post_reset_wait_dsecs, cfg.post_reset_max_wait_dsecs, h.is_primary(), wait)
                    }
                    None => (
                        self.config.fw_reset_min_dsecs as u32,
                        self.config.fw_reset_max_dsecs as u32,
                        false,
                        0,
                    ),
                };
                self.reset.min_wait_dsecs = min;
                self.reset.max_wait_dsecs = max;
                self.fw_reset_close();
                let next = if primary { FwResetState::ResetFw } else { FwResetState::EnableDev };
                (next, dsecs_to_ms(wait))
            }
        };
        self.reset.requeue(next, delay_ms);
        Some(delay_ms)
    }

    /// Closes the data path and releases the function ahead of a reset.
    fn fw_reset_close(&mut self) {
        if self.state.contains(DeviceState::FW_FATAL_COND) && self.pci_unreachable() {
            // the function is already gone; waiting for firmware to finish is pointless
            self.reset.min_wait_dsecs = 0;
        }
        self.reset.was_open = self.is_open();
        self.close_inner();
        self.release_function();
    }

    fn pci_unreachable(&self) -> bool {
        self.io.pci.read_config_u16(PCI_SUBSYSTEM_ID) == u16::MAX
    }

    fn reset_timed_out(&self) -> bool {
        self.clock.now_ms() > self.reset.timestamp_ms + dsecs_to_ms(self.reset.max_wait_dsecs)
    }

    /// Runs the current step of the reset in progress.
    pub fn fw_reset_step(&mut self) -> ResetStep {
        match self.reset.state {
            FwResetState::Idle => ResetStep::Completed,
            FwResetState::Aborted => ResetStep::Aborted,
            FwResetState::PollFwDown => self.poll_fw_down(),
            FwResetState::ResetFw => self.reset_firmware(),
            FwResetState::EnableDev => self.enable_device(),
            FwResetState::PollFw => self.poll_firmware(),
            FwResetState::Opening => self.reopen(),
        }
    }

    fn poll_fw_down(&mut self) -> ResetStep {
        let shut_down = self.health.as_ref().map_or(true, |h| h.firmware_is_shut_down(&self.io));
        if !shut_down && !self.reset_timed_out() {
            return self.reset.requeue(FwResetState::PollFwDown, POLL_FW_DOWN_INTERVAL_MS);
        }
        let role = self.health.as_ref().map(|h| (h.is_primary(), h.config().normal_func_wait_dsecs));
        match role {
            Some((true, _)) => self.reset_firmware(),
            Some((false, wait)) => self.reset.requeue(FwResetState::EnableDev, dsecs_to_ms(wait)),
            None => self.reset.requeue(FwResetState::EnableDev, 0),
        }
    }

    /// Resets the chip, either by replaying the host reset sequence or by asking the
    /// co-processor through `FW_RESET`.
    fn reset_firmware(&mut self) -> ResetStep {
        self.reset.state = FwResetState::ResetFw;
        let host_owned = self.health.as_ref().map_or(false, |h| h.config().flags.contains(RecoveryFlags::HOST));
        if host_owned {
            info!("bnxt: replaying the host reset sequence");
            if let Some(health) = self.health.as_ref() {
                health.replay_reset_sequence(&self.io, &*self.clock);
            }
        } else {
            let mut req: FwResetInput = new_request();
            req.embedded_proc_type = FW_RESET_EMBEDDED_PROC_TYPE_CHIP;
            req.selfrst_status = FW_RESET_SELFRST_STATUS_SELFRSTASAP;
            req.flags = FW_RESET_FLAGS_RESET_GRACEFUL;
            if let Err(e) = self.send(&req) {
                error!("bnxt: FW_RESET failed: {}", e);
                return self.abort_fw_reset(e);
            }
        }
        self.reset.timestamp_ms = self.clock.now_ms();
        let wait = dsecs_to_ms(self.reset.min_wait_dsecs);
        self.reset.requeue(FwResetState::EnableDev, wait)
    }

    fn enable_device(&mut self) -> ResetStep {
        if let Some(health) = self.health.as_mut() {
            health.invalidate_grc();
        }
        if self.state.contains(DeviceState::FW_FATAL_COND) && self.reset.min_wait_dsecs == 0 && self.pci_unreachable() {
            if self.reset_timed_out() {
                error!("bnxt: function did not come back on the bus");
                return self.abort_fw_reset(BnxtError::Pci("config space unreachable after reset"));
            }
            return self.reset.requeue(FwResetState::EnableDev, POLL_PCI_INTERVAL_MS);
        }
        self.state.remove(DeviceState::FW_FATAL_COND | DeviceState::FW_NON_FATAL_COND);
        if let Err(e) = self.io.pci.enable_device() {
            error!("bnxt: cannot re-enable the PCI function: {}", e);
            return self.abort_fw_reset(BnxtError::Pci(e));
        }
        self.io.pci.set_bus_master(true);
        self.poll_firmware()
    }

    fn poll_firmware(&mut self) -> ResetStep {
        self.reset.state = FwResetState::PollFw;
        let req: VerGetInput = new_request();
        let result = self.hwrm.lock().send_with_timeout(&req, SHORT_HWRM_CMD_TIMEOUT_MS);
        match result {
            Ok(ver) if ver.flags & VER_GET_FLAGS_DEV_NOT_RDY == 0 => self.reopen(),
            Ok(_) | Err(_) if !self.reset_timed_out() => self.reset.requeue(FwResetState::PollFw, POLL_FW_INTERVAL_MS),
            Ok(_) => self.abort_fw_reset(BnxtError::FirmwareNotReady),
            Err(e) => {
                error!("bnxt: firmware did not come back within {} ds", self.reset.max_wait_dsecs);
                self.abort_fw_reset(e.into())
            }
        }
    }

    /// Runs the whole bring-up again and reopens the data path if it was open.
    fn reopen(&mut self) -> ResetStep {
        self.reset.state = FwResetState::Opening;
        let result = match self.bring_up_firmware() {
            Ok(()) if self.reset.was_open => self.open_inner(),
            other => other,
        };
        if let Err(e) = result {
            error!("bnxt: reopening after firmware reset failed: {}", e);
            return self.abort_fw_reset(e);
        }
        if let Some(health) = self.health.as_mut() {
            health.snapshot_reset_count(&self.io);
        }
        self.reset.state = FwResetState::Idle;
        self.state.remove(DeviceState::IN_FW_RESET);
        self.dispatcher.notify_reset_complete(Ok(()));
        info!("bnxt: firmware reset complete");
        ResetStep::Completed
    }

    fn abort_fw_reset(&mut self, error: BnxtError) -> ResetStep {
        if self.is_open() {
            self.close_inner();
        }
        self.state.remove(DeviceState::IN_FW_RESET);
        self.state.insert(DeviceState::ABORT_ERR);
        self.reset.state = FwResetState::Aborted;
        self.reset.last_error = Some(error);
        self.dispatcher.notify_reset_complete(Err(error));
        error!("bnxt: firmware reset aborted: {}", error);
        ResetStep::Aborted
    }
}

/// Drives the reset in progress on `nic` to its end, sleeping between steps.
///
/// The NIC is locked for each step only, never across a sleep.
pub fn run_fw_reset_task(nic: &Mutex<BnxtNic>) -> Result<(), BnxtError> {
    let clock = nic.lock().clock();
    loop {
        let step = nic.lock().fw_reset_step();
        match step {
            ResetStep::Requeue(ms) => clock.sleep_ms(ms),
            ResetStep::Completed => return Ok(()),
            ResetStep::Aborted => {
                return Err(nic.lock().fw_reset_error().unwrap_or(BnxtError::NotOpen));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{AsyncEventListener, EventMask};
    use crate::tests::{probe, sim_nic};
    use crate::BnxtConfig;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use bnxt_ethernet::async_event::AsyncEventId;
    use bnxt_ethernet::completion::AsyncEventCompletion;
    use bnxt_ethernet::health::{HealthStatus, FW_STATUS_SHUTDOWN};
    use bnxt_ethernet::sim::{SimDevice, SimDeviceConfig};
    use nic_hal::Clock;

    #[derive(Default)]
    struct ResetLog {
        begun: u32,
        completed: Vec<Result<(), BnxtError>>,
    }

    struct Watcher(Arc<Mutex<ResetLog>>);

    impl AsyncEventListener for Watcher {
        fn on_event(&mut self, _event: &AsyncEventCompletion) {}

        fn on_reset_begin(&mut self) {
            self.0.lock().begun += 1;
        }

        fn on_reset_complete(&mut self, result: Result<(), BnxtError>) {
            self.0.lock().completed.push(result);
        }
    }

    fn watch(nic: &mut BnxtNic) -> Arc<Mutex<ResetLog>> {
        let log = Arc::new(Mutex::new(ResetLog::default()));
        nic.subscribe(EventMask::empty(), Box::new(Watcher(log.clone()))).unwrap();
        log
    }

    /// Opens a NIC on a host-recovery device and lets firmware enable error recovery for it.
    fn recovering_nic(primary: bool) -> (Arc<SimDevice>, BnxtNic) {
        let sim = SimDevice::new(SimDeviceConfig::p5().with_recovery(ERROR_RECOVERY_QCFG_FLAGS_HOST));
        let mut nic = probe(&sim, BnxtConfig::default()).unwrap();
        nic.open().unwrap();
        let data1 = if primary { 0b11 } else { 0b10 };
        sim.post_async_event(AsyncEventId::ErrorRecovery as u16, data1, 0, 0, 0).unwrap();
        nic.service_default_completions().unwrap();
        assert!(nic.health().unwrap().is_enabled());
        (sim, nic)
    }

    #[test]
    fn test_forced_reset_recovers_dead_firmware() {
        let (sim, mut nic) = recovering_nic(true);
        let log = watch(&mut nic);
        sim.set_firmware_down(true);
        nic.state.insert(DeviceState::FW_FATAL_COND);

        assert!(nic.begin_fw_reset(ResetKind::Forced).is_some());
        assert!(nic.in_reset());
        assert_eq!(nic.fw_reset_state(), FwResetState::ResetFw);
        assert_eq!(nic.open(), Err(BnxtError::InReset));
        assert_eq!(log.lock().begun, 1);

        let nic = Mutex::new(nic);
        run_fw_reset_task(&nic).unwrap();
        let nic = nic.into_inner();
        // the host sequence ends with the write that resets the chip
        assert_eq!(sim.reset_writes().len(), 2);
        assert_eq!(sim.reset_count(), 1);
        assert_eq!(nic.fw_reset_state(), FwResetState::Idle);
        assert!(!nic.in_reset());
        assert!(nic.is_open());
        assert!(!nic.state().contains(DeviceState::FW_FATAL_COND));
        assert!(sim.is_registered());
        assert!(sim.backing_store_committed());
        assert_eq!(sim.ring_count(), 4 + 1);
        assert_eq!(log.lock().completed, [Ok(())]);
    }

    #[test]
    fn test_planned_reset_waits_for_firmware() {
        let (sim, mut nic) = sim_nic(SimDeviceConfig::legacy());
        nic.open().unwrap();
        let start = sim.clock().now_ms();
        nic.begin_fw_reset(ResetKind::Planned { min_dsecs: 5, max_dsecs: 30 });
        assert_eq!(nic.fw_reset_state(), FwResetState::EnableDev);
        sim.begin_firmware_reset();
        // a second trigger while resetting is ignored
        assert_eq!(nic.begin_fw_reset(ResetKind::Forced), None);

        let nic = Mutex::new(nic);
        run_fw_reset_task(&nic).unwrap();
        let nic = nic.into_inner();
        assert!(sim.clock().now_ms() - start >= sim.config().reset_downtime_ms);
        assert!(nic.is_open());
        assert_eq!(sim.ring_count(), 4);
        assert!(sim.count_requests(RequestType::VerGet) > 2);
    }

    #[test]
    fn test_reopen_rebuilds_every_queue_pair() {
        let (sim, mut nic) = sim_nic(SimDeviceConfig::legacy());
        nic.open().unwrap();
        let rings = sim.ring_count();
        let log = watch(&mut nic);
        nic.begin_fw_reset(ResetKind::Planned { min_dsecs: 1, max_dsecs: 30 });
        assert_eq!(sim.ring_count(), 0);
        assert!(nic.queues().is_empty());

        let nic = Mutex::new(nic);
        run_fw_reset_task(&nic).unwrap();
        let nic = nic.into_inner();
        assert_eq!(nic.fw_reset_state(), FwResetState::Idle);
        assert!(nic.is_open());
        assert_eq!(nic.queues().len(), nic.config().num_queue_pairs as usize);
        assert!(nic.queues()[0].ring_group.is_some());
        assert_eq!(sim.ring_count(), rings);
        assert_eq!(log.lock().completed, [Ok(())]);
    }

    #[test]
    fn test_reset_of_closed_device_stays_closed() {
        let (sim, mut nic) = sim_nic(SimDeviceConfig::legacy());
        nic.begin_fw_reset(ResetKind::Planned { min_dsecs: 1, max_dsecs: 30 });
        let nic = Mutex::new(nic);
        run_fw_reset_task(&nic).unwrap();
        let nic = nic.into_inner();
        assert!(!nic.is_open());
        assert!(sim.is_registered());
        assert_eq!(sim.ring_count(), 0);
    }

    #[test]
    fn test_firmware_that_never_returns_aborts() {
        let (sim, mut nic) = sim_nic(SimDeviceConfig::legacy());
        nic.open().unwrap();
        let log = watch(&mut nic);
        nic.begin_fw_reset(ResetKind::Planned { min_dsecs: 1, max_dsecs: 10 });
        sim.set_firmware_down(true);

        let nic = Mutex::new(nic);
        let err = run_fw_reset_task(&nic).unwrap_err();
        let nic = nic.into_inner();
        assert!(matches!(err, BnxtError::Hwrm(e) if e.is_timeout()));
        assert_eq!(nic.fw_reset_state(), FwResetState::Aborted);
        assert!(!nic.in_reset());
        assert!(!nic.is_open());
        assert!(nic.state().contains(DeviceState::ABORT_ERR));
        assert_eq!(log.lock().completed.len(), 1);
        assert!(log.lock().completed[0].is_err());
    }

    #[test]
    fn test_failed_reopen_aborts() {
        let (sim, mut nic) = sim_nic(SimDeviceConfig::legacy());
        nic.open().unwrap();
        nic.begin_fw_reset(ResetKind::Planned { min_dsecs: 1, max_dsecs: 30 });
        sim.fail_next(RequestType::VnicAlloc, bnxt_ethernet::error::fw_code::RESOURCE_ALLOC_ERROR);

        let nic = Mutex::new(nic);
        assert!(run_fw_reset_task(&nic).is_err());
        let mut nic = nic.into_inner();
        assert_eq!(nic.fw_reset_state(), FwResetState::Aborted);
        assert!(!nic.is_open());
        assert_eq!(sim.ring_count(), 0);
        // the device can be opened by hand afterwards
        nic.open().unwrap();
        assert!(!nic.state().contains(DeviceState::ABORT_ERR));
    }

    #[test]
    fn test_full_sequence_ends_aborted_when_reopen_fails() {
        let cfg = SimDeviceConfig { err_recover_reload: true, ..SimDeviceConfig::p5().with_recovery(ERROR_RECOVERY_QCFG_FLAGS_HOST) };
        let sim = SimDevice::new(cfg);
        let mut nic = probe(&sim, BnxtConfig::default()).unwrap();
        nic.open().unwrap();
        sim.post_async_event(AsyncEventId::ErrorRecovery as u16, 0b11, 0, 0, 0).unwrap();
        nic.service_default_completions().unwrap();
        let log = watch(&mut nic);

        // firmware shuts itself down for the announced reset
        sim.set_fw_status(FW_STATUS_SHUTDOWN);
        nic.begin_fw_reset(ResetKind::Planned { min_dsecs: 5, max_dsecs: 60 });
        sim.fail_next(RequestType::VnicAlloc, bnxt_ethernet::error::fw_code::RESOURCE_ALLOC_ERROR);

        let mut states = alloc::vec![nic.fw_reset_state()];
        let outcome = loop {
            match nic.fw_reset_step() {
                ResetStep::Requeue(ms) => sim.clock().advance(ms),
                other => break other,
            }
            if states.last() != Some(&nic.fw_reset_state()) {
                states.push(nic.fw_reset_state());
            }
        };
        assert_eq!(outcome, ResetStep::Aborted);
        assert_eq!(states, [FwResetState::PollFwDown, FwResetState::EnableDev, FwResetState::PollFw]);
        // the chip was reset and reopening got as far as the VNIC
        assert_eq!(sim.reset_writes().len(), 2);
        assert_eq!(sim.count_requests(RequestType::VnicAlloc), 2);
        assert_eq!(nic.fw_reset_state(), FwResetState::Aborted);
        assert!(!nic.in_reset());
        assert_eq!(log.lock().completed.len(), 1);
        assert!(log.lock().completed[0].is_err());
    }

    #[test]
    fn test_secondary_function_waits_instead_of_resetting() {
        let (sim, mut nic) = recovering_nic(false);
        sim.begin_firmware_reset();
        assert_eq!(nic.health.as_mut().unwrap().poll(&sim.io()), HealthStatus::ResetInProgress);
        nic.begin_fw_reset(ResetKind::Forced);
        assert_eq!(nic.fw_reset_state(), FwResetState::EnableDev);

        let nic = Mutex::new(nic);
        run_fw_reset_task(&nic).unwrap();
        assert!(sim.reset_writes().is_empty());
        assert_eq!(sim.count_requests(RequestType::FwReset), 0);
        assert!(nic.lock().is_open());
    }

    #[test]
    fn test_co_cpu_reset_uses_fw_reset_command() {
        let sim = SimDevice::new(SimDeviceConfig::p5().with_recovery(ERROR_RECOVERY_QCFG_FLAGS_CO_CPU));
        let mut nic = probe(&sim, BnxtConfig::default()).unwrap();
        nic.open().unwrap();
        sim.post_async_event(AsyncEventId::ErrorRecovery as u16, 0b11, 0, 0, 0).unwrap();
        nic.service_default_completions().unwrap();

        // a co-processor reset skips the primary function's wait
        assert_eq!(nic.begin_fw_reset(ResetKind::Forced), Some(0));
        let nic = Mutex::new(nic);
        run_fw_reset_task(&nic).unwrap();
        assert_eq!(sim.firmware_resets(), 1);
        let req = sim.requests().into_iter().find(|r| r.req_type == u16::from(RequestType::FwReset)).unwrap();
        assert_eq!(req.body[16], FW_RESET_EMBEDDED_PROC_TYPE_CHIP);
        assert_eq!(req.body[17], FW_RESET_SELFRST_STATUS_SELFRSTASAP);
        assert!(nic.lock().is_open());
    }
}
