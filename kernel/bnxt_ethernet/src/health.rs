//! Firmware health monitoring: the registers firmware exposes for error recovery,
//! and the host-driven reset sequence.
//!
//! `ERROR_RECOVERY_QCFG` describes up to four health registers. Each is tagged in its low two
//! bits with the space it lives in: PCI config space, a GRC register reached through a BAR0
//! window, or a plain BAR0/BAR1 offset. GRC registers used for monitoring are all mapped
//! through one window, so they must share a 4 KiB base.

use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use nic_hal::{Clock, PciFunction, RegisterSpace};
use num_enum::TryFromPrimitive;

use crate::error::HealthError;
use crate::messages::*;

/// Low bits of a health register address that select its address space.
pub const FW_HEALTH_REG_TYPE_MASK: u32 = 0x3;

/// BAR0 registers that select which GRC page each BAR0 window shows.
pub const GRCPF_REG_WINDOW_BASE_OUT: usize = 0x400;
pub const GRC_BASE_MASK: u32 = 0xFFFF_F000;
pub const GRC_OFFSET_MASK: u32 = 0x0000_0FFC;
/// Window 3 is reserved for the health registers.
pub const FW_HEALTH_WIN_MAP_OFF: usize = 8;
pub const FW_HEALTH_WIN_BASE: usize = 0x3000;
/// Window 2 is used for the reset sequence writes.
pub const FW_RESET_WIN_MAP_OFF: usize = 4;
pub const FW_RESET_WIN_BASE: usize = 0x2000;

/// Status register bit set once firmware has shut down for a reset.
pub const FW_STATUS_SHUTDOWN: u32 = 0x0010_0000;

/// The most (register, value, delay) steps a reset sequence may contain.
pub const MAX_RESET_SEQ: usize = 16;

/// The driver's health check runs once per second; firmware polling periods are in deciseconds.
pub const HEALTH_TIMER_DSECS: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum HealthRegType {
    Cfg  = 0,
    Grc  = 1,
    Bar0 = 2,
    Bar1 = 3,
}

/// A type-tagged register address as reported by firmware.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HealthRegister(pub u32);

impl HealthRegister {
    pub fn reg_type(&self) -> HealthRegType {
        match self.0 & FW_HEALTH_REG_TYPE_MASK {
            0 => HealthRegType::Cfg,
            1 => HealthRegType::Grc,
            2 => HealthRegType::Bar0,
            _ => HealthRegType::Bar1,
        }
    }

    pub fn offset(&self) -> u32 {
        self.0 & !FW_HEALTH_REG_TYPE_MASK
    }

    fn grc_base(&self) -> u32 {
        self.0 & GRC_BASE_MASK
    }
}

/// The four monitored registers, in the order firmware reports them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthReg {
    Status          = 0,
    Heartbeat       = 1,
    ResetCount      = 2,
    ResetInProgress = 3,
}

/// Everything needed to reach the registers of one PCI function.
#[derive(Clone)]
pub struct DeviceIo {
    pub bar0: Arc<dyn RegisterSpace>,
    /// The doorbell BAR.
    pub bar1: Arc<dyn RegisterSpace>,
    pub pci: Arc<dyn PciFunction>,
}

impl DeviceIo {
    /// Config space reads return all ones while the device is unreachable.
    pub fn is_accessible(&self) -> bool {
        self.pci.read_config_u32(0) != u32::MAX
    }
}

bitflags! {
    /// Who owns the reset of the firmware.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct RecoveryFlags: u32 {
        /// The host driver replays the reset sequence.
        const HOST   = ERROR_RECOVERY_QCFG_FLAGS_HOST;
        /// A co-processor resets the chip when asked through `FW_RESET`.
        const CO_CPU = ERROR_RECOVERY_QCFG_FLAGS_CO_CPU;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResetSeqEntry {
    pub reg: HealthRegister,
    pub value: u32,
    /// Milliseconds to wait after the write; 0 means no wait.
    pub delay_ms: u8,
}

/// The error recovery configuration firmware reported through `ERROR_RECOVERY_QCFG`.
/// All waits are in deciseconds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryConfig {
    pub flags: RecoveryFlags,
    pub polling_dsecs: u32,
    pub master_func_wait_dsecs: u32,
    pub normal_func_wait_dsecs: u32,
    pub post_reset_wait_dsecs: u32,
    pub post_reset_max_wait_dsecs: u32,
    pub regs: [HealthRegister; 4],
    pub reset_inprog_mask: u32,
    pub reset_seq: Vec<ResetSeqEntry>,
}

impl RecoveryConfig {
    pub fn from_qcfg(resp: &ErrorRecoveryQcfgOutput) -> Result<RecoveryConfig, HealthError> {
        let count = resp.reg_array_cnt;
        if count as usize > MAX_RESET_SEQ {
            return Err(HealthError::ResetSequenceTooLong(count));
        }
        let regs = [
            HealthRegister(resp.fw_health_status_reg.get()),
            HealthRegister(resp.fw_heartbeat_reg.get()),
            HealthRegister(resp.fw_reset_cnt_reg.get()),
            HealthRegister(resp.reset_inprogress_reg.get()),
        ];
        let mut grc_base = None;
        for reg in regs.iter().filter(|r| r.reg_type() == HealthRegType::Grc) {
            match grc_base {
                None => grc_base = Some(reg.grc_base()),
                Some(base) if base != reg.grc_base() => return Err(HealthError::GrcBaseMismatch),
                Some(_) => {}
            }
        }
        let reset_seq = (0..count as usize)
            .map(|i| ResetSeqEntry {
                reg: HealthRegister(resp.reset_reg[i].get()),
                value: resp.reset_reg_val[i].get(),
                delay_ms: resp.delay_after_reset[i],
            })
            .collect();

        Ok(RecoveryConfig {
            flags: RecoveryFlags::from_bits_truncate(resp.flags.get()),
            polling_dsecs: resp.driver_polling_freq.get(),
            master_func_wait_dsecs: resp.master_func_wait_period.get(),
            normal_func_wait_dsecs: resp.normal_func_wait_period.get(),
            post_reset_wait_dsecs: resp.master_func_wait_period_after_reset.get(),
            post_reset_max_wait_dsecs: resp.max_bailout_time_after_reset.get(),
            regs,
            reset_inprog_mask: resp.reset_inprogress_reg_mask.get(),
            reset_seq,
        })
    }

    fn grc_base(&self) -> Option<u32> {
        self.regs.iter().find(|r| r.reg_type() == HealthRegType::Grc).map(|r| r.grc_base())
    }
}

/// What one health poll concluded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// The heartbeat is static but the reset counter advanced: firmware is restarting.
    ResetInProgress,
    /// Heartbeat and reset counter both advanced: firmware restarted behind our back.
    Restarted,
    /// The heartbeat is static and firmware has not reset.
    Dead,
    /// Config space reads return all ones.
    Inaccessible,
}

/// How bad the firmware's condition is, as recorded for the reset orchestrator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthSeverity {
    #[default]
    Normal,
    Warning,
    Recoverable,
    Fatal,
}

impl HealthStatus {
    pub fn severity(&self) -> HealthSeverity {
        match self {
            HealthStatus::Healthy => HealthSeverity::Normal,
            HealthStatus::Restarted => HealthSeverity::Warning,
            HealthStatus::ResetInProgress => HealthSeverity::Recoverable,
            HealthStatus::Dead | HealthStatus::Inaccessible => HealthSeverity::Fatal,
        }
    }
}

/// The firmware health record of one function.
#[derive(Debug)]
pub struct FwHealth {
    config: RecoveryConfig,
    /// Offsets in BAR0 through which GRC-typed registers are read.
    mapped: [usize; 4],
    status_reliable: bool,
    resets_reliable: bool,
    enabled: bool,
    primary: bool,
    tmr_multiplier: u32,
    tmr_counter: u32,
    last_heartbeat: u32,
    last_reset_count: u32,
    pub severity: HealthSeverity,
    /// Polls that found the heartbeat stopped.
    pub arrests: u32,
    /// Polls that found a reset nobody told us about.
    pub discoveries: u32,
}

impl FwHealth {
    pub fn new(config: RecoveryConfig) -> FwHealth {
        FwHealth {
            config,
            mapped: [0; 4],
            status_reliable: false,
            resets_reliable: false,
            enabled: false,
            primary: false,
            tmr_multiplier: 0,
            tmr_counter: 0,
            last_heartbeat: 0,
            last_reset_count: 0,
            severity: HealthSeverity::Normal,
            arrests: 0,
            discoveries: 0,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Replaces the configuration after firmware was queried again, keeping the monitoring state.
    pub fn set_config(&mut self, config: RecoveryConfig) {
        self.config = config;
        self.status_reliable = false;
        self.resets_reliable = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn status_reliable(&self) -> bool {
        self.status_reliable
    }

    pub fn resets_reliable(&self) -> bool {
        self.resets_reliable
    }

    pub fn tmr_multiplier(&self) -> u32 {
        self.tmr_multiplier
    }

    /// Points the health window at the GRC page holding the monitored registers.
    pub fn map_registers(&mut self, io: &DeviceIo) {
        for (i, reg) in self.config.regs.iter().enumerate() {
            if reg.reg_type() == HealthRegType::Grc {
                self.mapped[i] = FW_HEALTH_WIN_BASE + (reg.0 & GRC_OFFSET_MASK) as usize;
            }
        }
        if let Some(base) = self.config.grc_base() {
            io.bar0.write32(GRCPF_REG_WINDOW_BASE_OUT + FW_HEALTH_WIN_MAP_OFF, base);
        }
        self.status_reliable = true;
        self.resets_reliable = true;
    }

    /// A chip reset loses the GRC window mapping; GRC-typed registers cannot be trusted
    /// until [`FwHealth::map_registers()`] runs again.
    pub fn invalidate_grc(&mut self) {
        if self.config.regs[HealthReg::Status as usize].reg_type() == HealthRegType::Grc {
            self.status_reliable = false;
        }
        if self.config.regs[HealthReg::ResetCount as usize].reg_type() == HealthRegType::Grc {
            self.resets_reliable = false;
        }
    }

    pub fn read(&self, io: &DeviceIo, which: HealthReg) -> u32 {
        let reg = self.config.regs[which as usize];
        let val = match reg.reg_type() {
            HealthRegType::Cfg => io.pci.read_config_u32(reg.offset() as u16),
            HealthRegType::Grc => io.bar0.read32(self.mapped[which as usize]),
            HealthRegType::Bar0 => io.bar0.read32(reg.offset() as usize),
            HealthRegType::Bar1 => io.bar1.read32(reg.offset() as usize),
        };
        match which {
            HealthReg::ResetInProgress => val & self.config.reset_inprog_mask,
            _ => val,
        }
    }

    /// The firmware status word, or `None` while it cannot be trusted.
    pub fn status(&self, io: &DeviceIo) -> Option<u32> {
        if self.status_reliable {
            Some(self.read(io, HealthReg::Status))
        } else {
            None
        }
    }

    pub fn firmware_is_shut_down(&self, io: &DeviceIo) -> bool {
        self.status(io).map_or(false, |sts| sts & FW_STATUS_SHUTDOWN != 0)
    }

    pub fn snapshot_reset_count(&mut self, io: &DeviceIo) {
        self.last_reset_count = self.read(io, HealthReg::ResetCount);
    }

    /// Applies an `ERROR_RECOVERY` async event.
    pub fn set_recovery(&mut self, io: &DeviceIo, primary: bool, enabled: bool) {
        if !enabled {
            self.enabled = false;
            info!("firmware error recovery disabled");
            return;
        }
        self.primary = primary;
        self.tmr_multiplier = (self.config.polling_dsecs + HEALTH_TIMER_DSECS - 1) / HEALTH_TIMER_DSECS;
        self.tmr_counter = self.tmr_multiplier;
        if !self.enabled {
            self.last_heartbeat = self.read(io, HealthReg::Heartbeat);
        }
        self.snapshot_reset_count(io);
        info!("firmware error recovery enabled: {} function, polling every {} ds, status {:#X?}",
            if primary { "primary" } else { "secondary" }, self.config.polling_dsecs, self.status(io));
        self.enabled = true;
    }

    /// Counts down one timer tick; returns true when a poll is due.
    pub fn tick(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        if self.tmr_counter > 0 {
            self.tmr_counter -= 1;
            return false;
        }
        self.tmr_counter = self.tmr_multiplier;
        true
    }

    /// Samples the heartbeat and reset counter and classifies the firmware's condition.
    /// The samples become the baseline for the next poll.
    pub fn poll(&mut self, io: &DeviceIo) -> HealthStatus {
        if !io.is_accessible() {
            self.severity = HealthSeverity::Fatal;
            return HealthStatus::Inaccessible;
        }
        let heartbeat = self.read(io, HealthReg::Heartbeat);
        let reset_count = self.read(io, HealthReg::ResetCount);
        let beating = heartbeat != self.last_heartbeat;
        let has_reset = self.resets_reliable && reset_count != self.last_reset_count;
        self.last_heartbeat = heartbeat;
        self.last_reset_count = reset_count;

        let status = match (beating, has_reset) {
            (true, false) => HealthStatus::Healthy,
            (true, true) => HealthStatus::Restarted,
            (false, true) => HealthStatus::ResetInProgress,
            (false, false) => HealthStatus::Dead,
        };
        match status {
            HealthStatus::Healthy => {}
            HealthStatus::Dead => self.arrests += 1,
            _ => self.discoveries += 1,
        }
        self.severity = status.severity();
        status
    }

    /// Replays the host-owned reset sequence, waiting after each step as firmware asked.
    pub fn replay_reset_sequence(&self, io: &DeviceIo, clock: &dyn Clock) {
        for step in self.config.reset_seq.iter() {
            write_reset_reg(io, step.reg, step.value);
            if step.delay_ms != 0 {
                // flush the posted write before waiting
                let _ = io.pci.read_config_u32(0);
                clock.sleep_ms(step.delay_ms as u64);
            }
        }
    }
}

fn write_reset_reg(io: &DeviceIo, reg: HealthRegister, value: u32) {
    match reg.reg_type() {
        HealthRegType::Cfg => io.pci.write_config_u32(reg.offset() as u16, value),
        HealthRegType::Grc => {
            io.bar0.write32(GRCPF_REG_WINDOW_BASE_OUT + FW_RESET_WIN_MAP_OFF, reg.grc_base());
            io.bar0.write32(FW_RESET_WIN_BASE + (reg.0 & GRC_OFFSET_MASK) as usize, value);
        }
        HealthRegType::Bar0 => io.bar0.write32(reg.offset() as usize, value),
        HealthRegType::Bar1 => io.bar1.write32(reg.offset() as usize, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nic_hal::sim::{ManualClock, MmioWrite, SimPciFunction, SimRegisters};
    use zerocopy::FromZeroes;

    const HEARTBEAT: usize = 0x3104;
    const RESET_CNT: usize = 0x3108;

    struct Rig {
        bar0: Arc<SimRegisters>,
        bar1: Arc<SimRegisters>,
        pci: Arc<SimPciFunction>,
        io: DeviceIo,
    }

    fn rig() -> Rig {
        let bar0 = Arc::new(SimRegisters::new(0x10000));
        let bar1 = Arc::new(SimRegisters::new(0x10000));
        let pci = Arc::new(SimPciFunction::new(0x14E4, 0x1750, 0x1234));
        let io = DeviceIo { bar0: bar0.clone(), bar1: bar1.clone(), pci: pci.clone() };
        Rig { bar0, bar1, pci, io }
    }

    fn qcfg() -> ErrorRecoveryQcfgOutput {
        let mut resp = ErrorRecoveryQcfgOutput::new_zeroed();
        resp.flags = Le32::new(ERROR_RECOVERY_QCFG_FLAGS_HOST);
        resp.driver_polling_freq = Le32::new(15);
        resp.fw_health_status_reg = Le32::new(0x0031_A100 | 1);
        resp.fw_heartbeat_reg = Le32::new(0x0031_A104 | 1);
        resp.fw_reset_cnt_reg = Le32::new(0x0031_A108 | 1);
        resp.reset_inprogress_reg = Le32::new(0x0040 | 2);
        resp.reset_inprogress_reg_mask = Le32::new(0x1);
        resp.reg_array_cnt = 3;
        resp.reset_reg[0] = Le32::new(0x0000_0084);
        resp.reset_reg_val[0] = Le32::new(0xA);
        resp.reset_reg[1] = Le32::new(0x0052_0010 | 1);
        resp.reset_reg_val[1] = Le32::new(0xB);
        resp.delay_after_reset[1] = 5;
        resp.reset_reg[2] = Le32::new(0x0000_0200 | 3);
        resp.reset_reg_val[2] = Le32::new(0xC);
        resp
    }

    fn monitored(rig: &Rig) -> FwHealth {
        let mut health = FwHealth::new(RecoveryConfig::from_qcfg(&qcfg()).unwrap());
        health.map_registers(&rig.io);
        health
    }

    #[test]
    fn test_qcfg_parsing_and_limits() {
        let cfg = RecoveryConfig::from_qcfg(&qcfg()).unwrap();
        assert_eq!(cfg.flags, RecoveryFlags::HOST);
        assert_eq!(cfg.regs[HealthReg::Heartbeat as usize].reg_type(), HealthRegType::Grc);
        assert_eq!(cfg.regs[HealthReg::ResetInProgress as usize].reg_type(), HealthRegType::Bar0);
        assert_eq!(cfg.reset_seq.len(), 3);
        assert_eq!(cfg.reset_seq[1].delay_ms, 5);

        let mut resp = qcfg();
        resp.reg_array_cnt = 16;
        assert!(RecoveryConfig::from_qcfg(&resp).is_ok());
        resp.reg_array_cnt = 17;
        assert_eq!(RecoveryConfig::from_qcfg(&resp), Err(HealthError::ResetSequenceTooLong(17)));

        let mut resp = qcfg();
        resp.fw_reset_cnt_reg = Le32::new(0x0032_0108 | 1);
        assert_eq!(RecoveryConfig::from_qcfg(&resp), Err(HealthError::GrcBaseMismatch));
    }

    #[test]
    fn test_grc_registers_go_through_health_window() {
        let rig = rig();
        let health = monitored(&rig);
        assert!(rig.bar0.writes().contains(&MmioWrite::W32 { offset: 0x408, value: 0x0031_A000 }));
        rig.bar0.set32(HEARTBEAT, 77);
        rig.bar0.set32(0x40, 0xFF);
        assert_eq!(health.read(&rig.io, HealthReg::Heartbeat), 77);
        assert_eq!(health.read(&rig.io, HealthReg::ResetInProgress), 1);
    }

    #[test]
    fn test_static_heartbeat_with_advancing_reset_count_is_reset_in_progress() {
        let rig = rig();
        let mut health = monitored(&rig);
        rig.bar0.set32(HEARTBEAT, 40);
        rig.bar0.set32(RESET_CNT, 2);
        health.set_recovery(&rig.io, true, true);
        assert_eq!(health.tmr_multiplier(), 2);

        for n in 3..8 {
            rig.bar0.set32(RESET_CNT, n);
            assert_eq!(health.poll(&rig.io), HealthStatus::ResetInProgress);
            assert_eq!(health.severity, HealthSeverity::Recoverable);
        }
        assert_eq!(health.arrests, 0);

        // neither register moves
        assert_eq!(health.poll(&rig.io), HealthStatus::Dead);
        assert_eq!(health.severity, HealthSeverity::Fatal);
    }

    #[test]
    fn test_live_heartbeat_classification() {
        let rig = rig();
        let mut health = monitored(&rig);
        health.set_recovery(&rig.io, false, true);
        rig.bar0.set32(HEARTBEAT, 1);
        assert_eq!(health.poll(&rig.io), HealthStatus::Healthy);
        rig.bar0.set32(HEARTBEAT, 2);
        rig.bar0.set32(RESET_CNT, 1);
        assert_eq!(health.poll(&rig.io), HealthStatus::Restarted);

        rig.pci.set_inaccessible(true);
        assert_eq!(health.poll(&rig.io), HealthStatus::Inaccessible);
    }

    #[test]
    fn test_timer_multiplier() {
        let rig = rig();
        let mut health = monitored(&rig);
        assert!(!health.tick());
        health.set_recovery(&rig.io, true, true);
        let due: Vec<bool> = (0..6).map(|_| health.tick()).collect();
        assert_eq!(due, [false, false, true, false, false, true]);
        health.set_recovery(&rig.io, true, false);
        assert!(!health.is_enabled());
        assert!(!health.tick());
    }

    #[test]
    fn test_reset_sequence_replay() {
        let rig = rig();
        let health = monitored(&rig);
        rig.bar0.take_writes();
        let clock = ManualClock::new();
        health.replay_reset_sequence(&rig.io, &clock);

        assert_eq!(rig.pci.read_config_u32(0x84), 0xA);
        assert_eq!(rig.bar0.take_writes(), [
            MmioWrite::W32 { offset: 0x404, value: 0x0052_0000 },
            MmioWrite::W32 { offset: 0x2010, value: 0xB },
        ]);
        assert_eq!(rig.bar1.writes(), [MmioWrite::W32 { offset: 0x200, value: 0xC }]);
        assert_eq!(clock.now_ms(), 5);
    }

    #[test]
    fn test_grc_status_unreliable_after_invalidate() {
        let rig = rig();
        let mut health = monitored(&rig);
        rig.bar0.set32(0x3100, FW_STATUS_SHUTDOWN);
        assert!(health.firmware_is_shut_down(&rig.io));
        health.invalidate_grc();
        assert_eq!(health.status(&rig.io), None);
        assert!(!health.firmware_is_shut_down(&rig.io));
    }
}
