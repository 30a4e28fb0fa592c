//! Errors returned by the HWRM channel and the ring/context helpers.

use core::fmt;

/// HWRM error codes reported by firmware in [`crate::messages::ResponseHeader::error_code`].
pub mod fw_code {
    pub const SUCCESS: u16 = 0x0;
    pub const FAIL: u16 = 0x1;
    pub const INVALID_PARAMS: u16 = 0x2;
    pub const RESOURCE_ACCESS_DENIED: u16 = 0x3;
    pub const RESOURCE_ALLOC_ERROR: u16 = 0x4;
    pub const INVALID_FLAGS: u16 = 0x5;
    pub const INVALID_ENABLES: u16 = 0x6;
    pub const UNSUPPORTED_TLV: u16 = 0x7;
    pub const NO_BUFFER: u16 = 0x8;
    pub const UNSUPPORTED_OPTION_ERR: u16 = 0x9;
    pub const HOT_RESET_PROGRESS: u16 = 0xA;
    pub const CMD_NOT_SUPPORTED: u16 = 0xFFFF;
}

/// The classes that firmware error codes fall into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    PermissionDenied,
    OutOfMemory,
    NotImplemented,
    /// Firmware declined without saying why.
    /// This is the expected answer to many capability probes, so it is never logged.
    GenericFailure,
    Unknown,
}

impl ErrorKind {
    /// Classifies a nonzero firmware error code.
    pub const fn from_fw_code(code: u16) -> ErrorKind {
        match code {
            fw_code::FAIL => ErrorKind::GenericFailure,
            fw_code::INVALID_PARAMS | fw_code::INVALID_FLAGS | fw_code::INVALID_ENABLES => ErrorKind::InvalidArgument,
            fw_code::RESOURCE_ACCESS_DENIED => ErrorKind::PermissionDenied,
            fw_code::RESOURCE_ALLOC_ERROR | fw_code::NO_BUFFER => ErrorKind::OutOfMemory,
            fw_code::UNSUPPORTED_TLV | fw_code::UNSUPPORTED_OPTION_ERR | fw_code::CMD_NOT_SUPPORTED => ErrorKind::NotImplemented,
            _ => ErrorKind::Unknown,
        }
    }
}

/// Which half of completion detection ran out of time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Firmware never wrote a plausible response length.
    ResponseLength,
    /// Firmware wrote a length, but never the trailing valid marker.
    ValidMarker,
}

/// Possible reasons for an HWRM command to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HwrmError {
    /// Firmware completed the command with a nonzero error code.
    Firmware { req_type: u16, code: u16, kind: ErrorKind },
    /// Firmware did not complete the command in time.
    Timeout { req_type: u16, seq_id: u16, phase: TimeoutPhase },
    /// The request is longer than anything the channel can deliver.
    RequestTooLarge { len: usize, max: usize },
    /// The response was too short to hold a response header.
    InvalidResponse { req_type: u16, len: usize },
    /// A DMA buffer for the channel could not be allocated.
    DmaAllocationFailed,
}

impl HwrmError {
    /// The taxonomy class of this error, if it came from firmware or was rejected as malformed.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            HwrmError::Firmware { kind, .. } => Some(*kind),
            HwrmError::RequestTooLarge { .. } => Some(ErrorKind::InvalidArgument),
            HwrmError::DmaAllocationFailed => Some(ErrorKind::OutOfMemory),
            HwrmError::Timeout { .. } | HwrmError::InvalidResponse { .. } => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HwrmError::Timeout { .. })
    }

    /// True for the silent "generic failure" answer used during capability probing.
    pub fn is_generic_failure(&self) -> bool {
        self.kind() == Some(ErrorKind::GenericFailure)
    }
}

impl fmt::Display for HwrmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HwrmError::Firmware { req_type, code, kind } =>
                write!(f, "HWRM request {:#X} failed with firmware error {:#X} ({:?})", req_type, code, kind),
            HwrmError::Timeout { req_type, seq_id, phase } =>
                write!(f, "HWRM request {:#X} (seq {}) timed out waiting for {:?}", req_type, seq_id, phase),
            HwrmError::RequestTooLarge { len, max } =>
                write!(f, "HWRM request of {} bytes exceeds the maximum of {}", len, max),
            HwrmError::InvalidResponse { req_type, len } =>
                write!(f, "HWRM request {:#X} returned a malformed response of {} bytes", req_type, len),
            HwrmError::DmaAllocationFailed => write!(f, "failed to allocate an HWRM DMA buffer"),
        }
    }
}

impl From<HwrmError> for &'static str {
    fn from(error: HwrmError) -> Self {
        match error {
            HwrmError::Firmware { kind: ErrorKind::InvalidArgument, .. } => "Firmware rejected an invalid argument",
            HwrmError::Firmware { kind: ErrorKind::PermissionDenied, .. } => "Firmware denied access to the resource",
            HwrmError::Firmware { kind: ErrorKind::OutOfMemory, .. } => "Firmware ran out of resources",
            HwrmError::Firmware { kind: ErrorKind::NotImplemented, .. } => "Firmware does not support the command",
            HwrmError::Firmware { kind: ErrorKind::GenericFailure, .. } => "Firmware command failed",
            HwrmError::Firmware { kind: ErrorKind::Unknown, .. } => "Firmware returned an unknown error",
            HwrmError::Timeout { .. } => "HWRM command timed out",
            HwrmError::RequestTooLarge { .. } => "HWRM request is too large",
            HwrmError::InvalidResponse { .. } => "HWRM response is malformed",
            HwrmError::DmaAllocationFailed => "Failed to allocate an HWRM DMA buffer",
        }
    }
}

/// Possible reasons for failure when creating or using a ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingError {
    /// The requested size was zero or larger than the ring kind allows.
    InvalidSize,
    /// Every usable slot of the ring holds an unconsumed descriptor.
    RingFull,
    /// The descriptor is not exactly one ring entry long.
    InvalidDescriptor,
    /// The operation does not apply to this kind of ring.
    WrongKind,
    /// Allocating the ring's DMA memory failed.
    DmaAllocationFailed,
}

impl From<RingError> for &'static str {
    fn from(error: RingError) -> Self {
        match error {
            RingError::InvalidSize => "Invalid ring size",
            RingError::RingFull => "Ring is full",
            RingError::InvalidDescriptor => "Descriptor length does not match the ring entry size",
            RingError::WrongKind => "Operation is not valid for this kind of ring",
            RingError::DmaAllocationFailed => "Failed to allocate ring memory",
        }
    }
}

/// Possible reasons for failure when provisioning context memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextMemError {
    /// The memory needed does not fit in a two-level page table, or is empty.
    TooLarge,
    /// The requested fan-out does not fit in one page of page table entries.
    InvalidFanout,
    /// Firmware reported a context type this driver does not know about.
    UnknownType(u16),
    /// Allocating pages or page tables failed.
    DmaAllocationFailed,
}

impl From<ContextMemError> for &'static str {
    fn from(error: ContextMemError) -> Self {
        match error {
            ContextMemError::TooLarge => "Context memory does not fit in a two-level page table",
            ContextMemError::InvalidFanout => "Invalid page table fan-out",
            ContextMemError::UnknownType(_) => "Unknown context memory type",
            ContextMemError::DmaAllocationFailed => "Failed to allocate context memory",
        }
    }
}

/// Possible reasons for rejecting the error recovery configuration reported by firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthError {
    /// The host reset sequence has more steps than firmware may report.
    ResetSequenceTooLong(u8),
    /// GRC-typed health registers live in different 4 KiB windows and cannot be mapped together.
    GrcBaseMismatch,
}

impl From<HealthError> for &'static str {
    fn from(error: HealthError) -> Self {
        match error {
            HealthError::ResetSequenceTooLong(_) => "Firmware reported a reset sequence that is too long",
            HealthError::GrcBaseMismatch => "Firmware health registers do not share one GRC window",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping_table() {
        assert_eq!(ErrorKind::from_fw_code(fw_code::FAIL), ErrorKind::GenericFailure);
        assert_eq!(ErrorKind::from_fw_code(fw_code::INVALID_PARAMS), ErrorKind::InvalidArgument);
        assert_eq!(ErrorKind::from_fw_code(fw_code::INVALID_FLAGS), ErrorKind::InvalidArgument);
        assert_eq!(ErrorKind::from_fw_code(fw_code::INVALID_ENABLES), ErrorKind::InvalidArgument);
        assert_eq!(ErrorKind::from_fw_code(fw_code::RESOURCE_ACCESS_DENIED), ErrorKind::PermissionDenied);
        assert_eq!(ErrorKind::from_fw_code(fw_code::RESOURCE_ALLOC_ERROR), ErrorKind::OutOfMemory);
        assert_eq!(ErrorKind::from_fw_code(fw_code::NO_BUFFER), ErrorKind::OutOfMemory);
        assert_eq!(ErrorKind::from_fw_code(fw_code::UNSUPPORTED_TLV), ErrorKind::NotImplemented);
        assert_eq!(ErrorKind::from_fw_code(fw_code::UNSUPPORTED_OPTION_ERR), ErrorKind::NotImplemented);
        assert_eq!(ErrorKind::from_fw_code(fw_code::CMD_NOT_SUPPORTED), ErrorKind::NotImplemented);
        assert_eq!(ErrorKind::from_fw_code(fw_code::HOT_RESET_PROGRESS), ErrorKind::Unknown);
        assert_eq!(ErrorKind::from_fw_code(0x1234), ErrorKind::Unknown);
    }

    #[test]
    fn test_error_mapping_is_pure() {
        for code in 1..=u16::MAX {
            assert_eq!(ErrorKind::from_fw_code(code), ErrorKind::from_fw_code(code));
        }
    }

    #[test]
    fn test_timeout_has_no_firmware_kind() {
        let timeout = HwrmError::Timeout { req_type: 0, seq_id: 3, phase: TimeoutPhase::ValidMarker };
        assert!(timeout.is_timeout());
        assert_eq!(timeout.kind(), None);
        let fw = HwrmError::Firmware { req_type: 0, code: fw_code::FAIL, kind: ErrorKind::GenericFailure };
        assert!(!fw.is_timeout());
        assert!(fw.is_generic_failure());
    }
}
