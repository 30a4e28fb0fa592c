//! Periodic firmware health checks and the service task that turns recorded events
//! into work: link updates and the start of firmware resets.

use bnxt_ethernet::health::{HealthSeverity, HealthStatus};

use crate::reset::ResetKind;
use crate::{BnxtNic, DeviceState, ServiceEvents};

impl BnxtNic {
    /// Runs once per health timer tick (one second).
    ///
    /// Firmware is only sampled every few ticks, as often as the error recovery configuration
    /// asks, and only once firmware has enabled error recovery for this function.
    /// Returns what the poll found, if one was due.
    pub fn health_check(&mut self) -> Option<HealthStatus> {
        if self.in_reset() {
            return None;
        }
        let health = self.health.as_mut()?;
        if !health.tick() {
            return None;
        }
        let status = health.poll(&self.io);
        match status {
            HealthStatus::Healthy => {}
            HealthStatus::Restarted => {
                warn!("bnxt: firmware reset itself without notice ({} so far)", health.discoveries);
            }
            HealthStatus::ResetInProgress | HealthStatus::Dead | HealthStatus::Inaccessible => {
                error!("bnxt: firmware health check failed: {:?}", status);
                self.events.insert(ServiceEvents::FW_EXCEPTION);
            }
        }
        Some(status)
    }

    /// Handles the events recorded since the last run.
    ///
    /// Returns the delay before the first reset step if a firmware reset was started;
    /// the caller must then drive it with [`crate::reset::run_fw_reset_task()`].
    pub fn service_task(&mut self) -> Option<u64> {
        let events = core::mem::take(&mut self.events);
        if events.contains(ServiceEvents::LINK_CHANGE) {
            info!("bnxt: link changed (generation {})", self.link_generation);
        }
        if events.contains(ServiceEvents::ERROR_RECOVERY) {
            debug!("bnxt: firmware error recovery is now {}",
                if self.health.as_ref().map_or(false, |h| h.is_enabled()) { "enabled" } else { "disabled" });
        }

        if events.contains(ServiceEvents::FW_EXCEPTION) {
            // a reset notification that arrived alongside is kept for the next run
            self.events.insert(events & ServiceEvents::RESET_NOTIFY);
            return self.fw_exception();
        }
        if events.contains(ServiceEvents::RESET_NOTIFY) {
            let notify = self.reset.pending_notify.take()?;
            return self.begin_fw_reset(ResetKind::Planned {
                min_dsecs: notify.min_wait_dsecs,
                max_dsecs: notify.max_wait_dsecs,
            });
        }
        None
    }

    /// Reacts to a failed health check according to how bad it was.
    fn fw_exception(&mut self) -> Option<u64> {
        let severity = self.health.as_ref().map_or(HealthSeverity::Fatal, |h| h.severity);
        match severity {
            HealthSeverity::Normal | HealthSeverity::Warning => None,
            // firmware is already restarting; give it the usual time to come back
            HealthSeverity::Recoverable => {
                self.state.insert(DeviceState::FW_NON_FATAL_COND);
                self.begin_fw_reset(ResetKind::Planned {
                    min_dsecs: self.config.fw_reset_min_dsecs,
                    max_dsecs: self.config.fw_reset_max_dsecs,
                })
            }
            HealthSeverity::Fatal => {
                self.state.insert(DeviceState::FW_FATAL_COND);
                self.begin_fw_reset(ResetKind::Forced)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reset::{run_fw_reset_task, FwResetState};
    use crate::tests::{probe, sim_nic};
    use crate::BnxtConfig;
    use alloc::sync::Arc;
    use bnxt_ethernet::async_event::AsyncEventId;
    use bnxt_ethernet::messages::ERROR_RECOVERY_QCFG_FLAGS_HOST;
    use bnxt_ethernet::sim::{SimDevice, SimDeviceConfig};
    use spin::Mutex;

    fn monitored_nic(data1: u32) -> (Arc<SimDevice>, BnxtNic) {
        let sim = SimDevice::new(SimDeviceConfig::p5().with_recovery(ERROR_RECOVERY_QCFG_FLAGS_HOST));
        let mut nic = probe(&sim, BnxtConfig::default()).unwrap();
        nic.open().unwrap();
        sim.post_async_event(AsyncEventId::ErrorRecovery as u16, data1, 0, 0, 0).unwrap();
        nic.service_default_completions().unwrap();
        assert_eq!(nic.service_task(), None);
        (sim, nic)
    }

    /// Ticks the health timer until a poll happens.
    fn poll_health(nic: &mut BnxtNic) -> HealthStatus {
        (0..10).find_map(|_| nic.health_check()).unwrap()
    }

    #[test]
    fn test_no_checks_until_firmware_enables_recovery() {
        let sim = SimDevice::new(SimDeviceConfig::p5().with_recovery(ERROR_RECOVERY_QCFG_FLAGS_HOST));
        let mut nic = probe(&sim, BnxtConfig::default()).unwrap();
        assert!(nic.health().is_some());
        assert!((0..5).all(|_| nic.health_check().is_none()));

        let (_sim, mut nic) = sim_nic(SimDeviceConfig::legacy());
        assert!(nic.health().is_none());
        assert_eq!(nic.health_check(), None);
    }

    #[test]
    fn test_healthy_firmware_is_left_alone() {
        let (_sim, mut nic) = monitored_nic(0b11);
        assert_eq!(nic.health_check(), None);
        assert_eq!(nic.health_check(), Some(HealthStatus::Healthy));
        assert_eq!(nic.service_task(), None);
        assert!(!nic.in_reset());
    }

    #[test]
    fn test_dead_firmware_is_reset_and_recovers() {
        let (sim, mut nic) = monitored_nic(0b11);
        sim.set_firmware_down(true);
        assert_eq!(poll_health(&mut nic), HealthStatus::Dead);
        assert!(nic.pending_events().contains(ServiceEvents::FW_EXCEPTION));
        assert_eq!(nic.health().unwrap().arrests, 1);

        assert!(nic.service_task().is_some());
        assert!(nic.in_reset());
        assert!(nic.state().contains(DeviceState::FW_FATAL_COND));
        assert_eq!(nic.fw_reset_state(), FwResetState::ResetFw);
        // no health checks while the orchestrator owns the device
        assert_eq!(nic.health_check(), None);

        let nic = Mutex::new(nic);
        run_fw_reset_task(&nic).unwrap();
        let mut nic = nic.into_inner();
        assert!(nic.is_open());
        assert_eq!(sim.reset_count(), 1);
        // the reset counter moved on our own reset; that is not a new discovery
        assert_eq!(poll_health(&mut nic), HealthStatus::Healthy);
    }

    #[test]
    fn test_reset_in_progress_waits_for_firmware() {
        let (sim, mut nic) = monitored_nic(0b10);
        sim.begin_firmware_reset();
        assert_eq!(poll_health(&mut nic), HealthStatus::ResetInProgress);
        assert!(nic.service_task().is_some());
        assert!(nic.state().contains(DeviceState::FW_NON_FATAL_COND));
        assert_eq!(nic.fw_reset_state(), FwResetState::EnableDev);

        let nic = Mutex::new(nic);
        run_fw_reset_task(&nic).unwrap();
        assert!(nic.lock().is_open());
        assert!(!nic.lock().state().contains(DeviceState::FW_NON_FATAL_COND));
        assert!(sim.reset_writes().is_empty());
    }

    #[test]
    fn test_reset_notify_starts_planned_reset() {
        let (sim, mut nic) = sim_nic(SimDeviceConfig::legacy());
        nic.open().unwrap();
        sim.post_async_event(AsyncEventId::ResetNotify as u16, 0x0100, 0, 3, 40).unwrap();
        nic.service_default_completions().unwrap();
        assert_eq!(nic.service_task(), Some(300));
        assert_eq!(nic.fw_reset_state(), FwResetState::EnableDev);
        assert!(!nic.pending_events().contains(ServiceEvents::RESET_NOTIFY));
        assert!(!nic.is_open());
        assert_eq!(sim.ring_count(), 0);
    }

    #[test]
    fn test_reset_notify_survives_a_concurrent_exception() {
        let (sim, mut nic) = sim_nic(SimDeviceConfig::legacy());
        nic.open().unwrap();
        sim.post_async_event(AsyncEventId::ResetNotify as u16, 0x0100, 0, 3, 40).unwrap();
        nic.service_default_completions().unwrap();
        nic.events.insert(ServiceEvents::FW_EXCEPTION);

        assert!(nic.service_task().is_some());
        assert!(nic.pending_events().contains(ServiceEvents::RESET_NOTIFY));
        assert!(!nic.pending_events().contains(ServiceEvents::FW_EXCEPTION));
        assert!(nic.reset.pending_notify.is_some());

        let nic = Mutex::new(nic);
        run_fw_reset_task(&nic).unwrap();
        let mut nic = nic.into_inner();
        assert!(nic.is_open());
        // the notification is honoured once the first reset is over
        assert_eq!(nic.service_task(), Some(300));
        assert_eq!(nic.fw_reset_state(), FwResetState::EnableDev);
        assert!(nic.pending_events().is_empty());
    }

    #[test]
    fn test_link_events_are_consumed() {
        let (sim, mut nic) = sim_nic(SimDeviceConfig::legacy());
        nic.open().unwrap();
        sim.post_async_event(AsyncEventId::LinkStatusChange as u16, 1, 0, 0, 0).unwrap();
        nic.service_default_completions().unwrap();
        assert_eq!(nic.link_generation(), 1);
        assert_eq!(nic.service_task(), None);
        assert!(nic.pending_events().is_empty());
    }
}
