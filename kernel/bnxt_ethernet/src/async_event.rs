//! Decoding of the async events firmware posts to the default completion ring.

use bit_field::BitField;
use core::fmt;
use num_enum::TryFromPrimitive;

use crate::completion::AsyncEventCompletion;

/// Event ids fit in a byte; subscribers register interest in a 256-bit mask.
pub const MAX_ASYNC_EVENT_ID: usize = 256;

/// Firmware status word meaning "healthy"; also found in the low half of reset-notify `data2`.
pub const FW_STATUS_HEALTHY: u32 = 0x8000;
pub const FW_STATUS_CODE_MASK: u32 = 0xFFFF;

/// Fallback waits for reset notifications that leave them out, in deciseconds.
pub const DFLT_FW_RST_MIN_DSECS: u16 = 20;
pub const DFLT_FW_RST_MAX_DSECS: u16 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u16)]
pub enum AsyncEventId {
    LinkStatusChange        = 0x00,
    LinkMtuChange           = 0x01,
    LinkSpeedChange         = 0x02,
    DcbConfigChange         = 0x03,
    PortConnNotAllowed      = 0x04,
    LinkSpeedCfgNotAllowed  = 0x05,
    LinkSpeedCfgChange      = 0x06,
    PortPhyCfgChange        = 0x07,
    ResetNotify             = 0x08,
    ErrorRecovery           = 0x09,
    FuncDrvrUnload          = 0x10,
    FuncDrvrLoad            = 0x11,
    FuncFlrProcCompleted    = 0x12,
    PfDrvrUnload            = 0x20,
    PfDrvrLoad              = 0x21,
    VfFlr                   = 0x30,
    VfMacAddrChange         = 0x31,
    PfVfCommStatusChange    = 0x32,
    VfCfgChange             = 0x33,
    ErrorReport             = 0x45,
    HwrmError               = 0xFF,
}

/// Why firmware is about to reset, from bits 8..16 of reset-notify `data1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ResetReason {
    Management        = 1,
    FatalException    = 2,
    NonFatalException = 3,
    FastReset         = 4,
    Activation        = 5,
}

/// How the driver must treat a reset notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetSeverity {
    /// Solicited or management-initiated; the firmware is otherwise fine.
    Planned,
    /// A new firmware image is being activated.
    Activation,
    Fatal,
    /// Firmware hit an exception it survived, but reports itself unhealthy.
    NonFatal,
}

/// A decoded reset notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResetNotify {
    pub reason: Option<ResetReason>,
    pub severity: ResetSeverity,
    /// What firmware asks the driver to do, from the low byte of `data1`.
    pub driver_action: u8,
    pub min_wait_dsecs: u16,
    pub max_wait_dsecs: u16,
    pub fw_status: u32,
}

impl ResetNotify {
    pub fn decode(ev: &AsyncEventCompletion) -> ResetNotify {
        let data1 = ev.event_data1.get();
        let data2 = ev.event_data2.get();
        let reason = ResetReason::try_from(data1.get_bits(8..16) as u8).ok();
        let fw_status = data2 & FW_STATUS_CODE_MASK;
        let severity = match reason {
            Some(ResetReason::Activation) => ResetSeverity::Activation,
            Some(ResetReason::FatalException) => ResetSeverity::Fatal,
            Some(ResetReason::NonFatalException) => ResetSeverity::NonFatal,
            _ if data2 != 0 && fw_status != FW_STATUS_HEALTHY => ResetSeverity::NonFatal,
            _ => ResetSeverity::Planned,
        };
        let min_wait_dsecs = match ev.timestamp_lo {
            0 => DFLT_FW_RST_MIN_DSECS,
            dsecs => dsecs as u16,
        };
        let max_wait_dsecs = match ev.timestamp_hi.get() {
            0 => DFLT_FW_RST_MAX_DSECS,
            dsecs => dsecs,
        };
        ResetNotify {
            reason,
            severity,
            driver_action: data1.get_bits(0..8) as u8,
            min_wait_dsecs,
            max_wait_dsecs,
            fw_status,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThermalThreshold {
    Warning,
    Critical,
    Fatal,
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NvmErrorKind {
    Write,
    Erase,
    Unknown,
}

/// The sub-types of an `ERROR_REPORT` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorReport {
    PauseStorm,
    InvalidSignal { pin: u8 },
    Nvm { kind: NvmErrorKind, address: u32 },
    DoorbellDrop { epoch: u32 },
    Thermal { threshold: Option<ThermalThreshold>, increasing: bool, current_temp: u8, threshold_temp: u8 },
    DualRateNotSupported,
    Unknown { error_type: u8, data1: u32, data2: u32 },
}

impl ErrorReport {
    pub fn decode(data1: u32, data2: u32) -> ErrorReport {
        let error_type = data1.get_bits(0..8) as u8;
        match error_type {
            1 => ErrorReport::PauseStorm,
            2 => ErrorReport::InvalidSignal { pin: data2.get_bits(0..8) as u8 },
            3 => {
                let kind = match data1.get_bits(8..16) {
                    1 => NvmErrorKind::Write,
                    2 => NvmErrorKind::Erase,
                    _ => NvmErrorKind::Unknown,
                };
                ErrorReport::Nvm { kind, address: data2 }
            }
            4 => ErrorReport::DoorbellDrop { epoch: data1.get_bits(8..32) },
            5 => {
                let threshold = match data1.get_bits(8..11) {
                    0 => Some(ThermalThreshold::Warning),
                    1 => Some(ThermalThreshold::Critical),
                    2 => Some(ThermalThreshold::Fatal),
                    3 => Some(ThermalThreshold::Shutdown),
                    _ => None,
                };
                ErrorReport::Thermal {
                    threshold,
                    increasing: data1.get_bit(11),
                    current_temp: data2.get_bits(0..8) as u8,
                    threshold_temp: data2.get_bits(8..16) as u8,
                }
            }
            6 => ErrorReport::DualRateNotSupported,
            _ => ErrorReport::Unknown { error_type, data1, data2 },
        }
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorReport::PauseStorm => write!(f, "pause storm detected"),
            ErrorReport::InvalidSignal { pin } => write!(f, "invalid 1PPS signal on pin {}", pin),
            ErrorReport::Nvm { kind, address } => write!(f, "NVM {:?} error at address {:#X}", kind, address),
            ErrorReport::DoorbellDrop { epoch } => write!(f, "MMIO doorbells dropped by the device, epoch {:#X}", epoch),
            ErrorReport::Thermal { threshold, increasing, current_temp, threshold_temp } => write!(
                f, "chip temperature went {} the {:?} threshold: {} C (threshold {} C)",
                if *increasing { "above" } else { "below" }, threshold, current_temp, threshold_temp
            ),
            ErrorReport::DualRateNotSupported => write!(f, "speed change is not supported with dual rate transceivers"),
            ErrorReport::Unknown { error_type, data1, data2 } =>
                write!(f, "unknown error type {} (data1 {:#X}, data2 {:#X})", error_type, data1, data2),
        }
    }
}

/// An async event, decoded as far as the driver itself cares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsyncEvent {
    /// Link status, speed or speed configuration changed; the link must be re-queried.
    LinkChange(AsyncEventId),
    ResetNotify(ResetNotify),
    ErrorRecovery { primary: bool, enabled: bool },
    ErrorReport(ErrorReport),
    /// Known events this driver takes no action on.
    Informational(AsyncEventId),
    Unknown(u16),
}

impl AsyncEvent {
    pub fn decode(ev: &AsyncEventCompletion) -> AsyncEvent {
        let id = ev.event_id.get();
        let data1 = ev.event_data1.get();
        match AsyncEventId::try_from(id) {
            Ok(eid @ (AsyncEventId::LinkStatusChange | AsyncEventId::LinkSpeedChange | AsyncEventId::LinkSpeedCfgChange)) =>
                AsyncEvent::LinkChange(eid),
            Ok(AsyncEventId::ResetNotify) => AsyncEvent::ResetNotify(ResetNotify::decode(ev)),
            Ok(AsyncEventId::ErrorRecovery) => AsyncEvent::ErrorRecovery {
                primary: data1.get_bit(0),
                enabled: data1.get_bit(1),
            },
            Ok(AsyncEventId::ErrorReport) => AsyncEvent::ErrorReport(ErrorReport::decode(data1, ev.event_data2.get())),
            Ok(other) => AsyncEvent::Informational(other),
            Err(_) => AsyncEvent::Unknown(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Le16, Le32};
    use zerocopy::FromZeroes;

    fn event(id: u16, data1: u32, data2: u32, ts_lo: u8, ts_hi: u16) -> AsyncEventCompletion {
        let mut ev = AsyncEventCompletion::new_zeroed();
        ev.type_ = Le16::new(0x2E);
        ev.event_id = Le16::new(id);
        ev.event_data1 = Le32::new(data1);
        ev.event_data2 = Le32::new(data2);
        ev.opaque_v = 1;
        ev.timestamp_lo = ts_lo;
        ev.timestamp_hi = Le16::new(ts_hi);
        ev
    }

    #[test]
    fn test_reset_notify_severities() {
        let fatal = ResetNotify::decode(&event(8, 0x0200, 0, 5, 100));
        assert_eq!(fatal.severity, ResetSeverity::Fatal);
        assert_eq!((fatal.min_wait_dsecs, fatal.max_wait_dsecs), (5, 100));

        let activation = ResetNotify::decode(&event(8, 0x0500, 0x1234, 0, 0));
        assert_eq!(activation.severity, ResetSeverity::Activation);
        assert_eq!((activation.min_wait_dsecs, activation.max_wait_dsecs), (DFLT_FW_RST_MIN_DSECS, DFLT_FW_RST_MAX_DSECS));

        let survived = ResetNotify::decode(&event(8, 0x0100, 0x0000_0001, 1, 1));
        assert_eq!(survived.reason, Some(ResetReason::Management));
        assert_eq!(survived.severity, ResetSeverity::NonFatal);

        let solicited = ResetNotify::decode(&event(8, 0x0101, FW_STATUS_HEALTHY, 1, 1));
        assert_eq!(solicited.severity, ResetSeverity::Planned);
        assert_eq!(solicited.driver_action, 1);
    }

    #[test]
    fn test_decode_dispatch() {
        assert_eq!(AsyncEvent::decode(&event(0, 0, 0, 0, 0)), AsyncEvent::LinkChange(AsyncEventId::LinkStatusChange));
        assert_eq!(AsyncEvent::decode(&event(9, 0b11, 0, 0, 0)), AsyncEvent::ErrorRecovery { primary: true, enabled: true });
        assert_eq!(AsyncEvent::decode(&event(9, 0b10, 0, 0, 0)), AsyncEvent::ErrorRecovery { primary: false, enabled: true });
        assert_eq!(AsyncEvent::decode(&event(0x33, 0, 0, 0, 0)), AsyncEvent::Informational(AsyncEventId::VfCfgChange));
        assert_eq!(AsyncEvent::decode(&event(0x77, 0, 0, 0, 0)), AsyncEvent::Unknown(0x77));
    }

    #[test]
    fn test_error_reports() {
        assert_eq!(ErrorReport::decode(0x0012_3404, 0), ErrorReport::DoorbellDrop { epoch: 0x1234 });
        assert_eq!(ErrorReport::decode(0x0203, 0xBEEF), ErrorReport::Nvm { kind: NvmErrorKind::Erase, address: 0xBEEF });
        assert_eq!(
            ErrorReport::decode(0x0905, 0x5A60),
            ErrorReport::Thermal { threshold: Some(ThermalThreshold::Critical), increasing: true, current_temp: 0x60, threshold_temp: 0x5A }
        );
        assert_eq!(ErrorReport::decode(0x09, 1, ), ErrorReport::Unknown { error_type: 9, data1: 9, data2: 1 });
    }
}
