//! Layouts of the 16-byte records written by hardware into completion and notification rings.

use bit_field::BitField;
use core::fmt;
use core::mem::size_of;
use num_enum::TryFromPrimitive;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::messages::{Le16, Le32};

/// Size of every completion and notification ring entry.
pub const CMPL_ENTRY_SIZE: usize = 16;
/// Byte offset, shared by all record formats, of the word whose bit 0 is the valid (parity) bit.
pub const CMPL_VALID_OFFSET: usize = 8;
pub const CMPL_BASE_TYPE_MASK: u16 = 0x3F;

/// The `type` field of a completion record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum CompletionType {
    TxL2            = 0x00,
    RxL2            = 0x11,
    RxAgg           = 0x12,
    HwrmDone        = 0x20,
    HwrmFwdReq      = 0x22,
    HwrmAsyncEvent  = 0x2E,
    CqNotification  = 0x30,
}

/// A completion record in its generic form.
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Default)]
#[repr(C)]
pub struct CompletionEntry {
    pub type_: Le16,
    pub info1: Le16,
    pub info2: Le32,
    pub info3_v: Le32,
    pub info4: Le32,
}
const_assert_eq!(size_of::<CompletionEntry>(), CMPL_ENTRY_SIZE);

impl CompletionEntry {
    pub fn from_bytes(bytes: [u8; CMPL_ENTRY_SIZE]) -> CompletionEntry {
        let mut entry = CompletionEntry::new_zeroed();
        entry.as_bytes_mut().copy_from_slice(&bytes);
        entry
    }

    /// The raw 6-bit completion type.
    pub fn raw_type(&self) -> u8 {
        (self.type_.get() & CMPL_BASE_TYPE_MASK) as u8
    }

    pub fn completion_type(&self) -> Option<CompletionType> {
        CompletionType::try_from(self.raw_type()).ok()
    }

    pub fn valid(&self) -> bool {
        self.info3_v.get().get_bit(0)
    }

    /// Reinterprets this record as an async event completion.
    pub fn as_async_event(&self) -> Option<AsyncEventCompletion> {
        if self.completion_type() != Some(CompletionType::HwrmAsyncEvent) {
            return None;
        }
        AsyncEventCompletion::read_from(self.as_bytes())
    }

    /// Reinterprets this record as a notification queue entry.
    pub fn as_notification(&self) -> Option<NqNotification> {
        if self.completion_type() != Some(CompletionType::CqNotification) {
            return None;
        }
        NqNotification::read_from(self.as_bytes())
    }
}

impl fmt::Debug for CompletionEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CompletionEntry")
            .field("type", &self.raw_type())
            .field("info1", &self.info1.get())
            .field("info2", &self.info2.get())
            .field("valid", &self.valid())
            .field("info4", &self.info4.get())
            .finish()
    }
}

/// An async event forwarded by firmware.
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Default)]
#[repr(C)]
pub struct AsyncEventCompletion {
    pub type_: Le16,
    pub event_id: Le16,
    pub event_data2: Le32,
    /// Bit 0 is the valid bit.
    pub opaque_v: u8,
    /// Event-specific; reset notifications put the minimum wait (deciseconds) here.
    pub timestamp_lo: u8,
    /// Event-specific; reset notifications put the maximum wait (deciseconds) here.
    pub timestamp_hi: Le16,
    pub event_data1: Le32,
}
const_assert_eq!(size_of::<AsyncEventCompletion>(), CMPL_ENTRY_SIZE);

impl fmt::Debug for AsyncEventCompletion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AsyncEventCompletion")
            .field("event_id", &self.event_id.get())
            .field("data1", &format_args!("{:#X}", self.event_data1.get()))
            .field("data2", &format_args!("{:#X}", self.event_data2.get()))
            .field("timestamp_lo", &self.timestamp_lo)
            .field("timestamp_hi", &self.timestamp_hi.get())
            .finish()
    }
}

/// A notification queue entry telling the driver that a completion ring has work.
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct NqNotification {
    /// Type in bits 0..6, completion ring toggle in bits 6..8.
    pub type_: Le16,
    pub reserved: Le16,
    pub cq_handle_low: Le32,
    pub v: Le32,
    pub cq_handle_high: Le32,
}
const_assert_eq!(size_of::<NqNotification>(), CMPL_ENTRY_SIZE);

impl NqNotification {
    /// The toggle value to echo when re-arming the notified completion ring.
    pub fn toggle(&self) -> u8 {
        self.type_.get().get_bits(6..8) as u8
    }

    pub fn cq_handle(&self) -> u64 {
        (self.cq_handle_high.get() as u64) << 32 | self.cq_handle_low.get() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_async_event_view() {
        let mut raw = [0u8; 16];
        raw[0] = CompletionType::HwrmAsyncEvent as u8;
        raw[2] = 0x08; // event id
        raw[4..8].copy_from_slice(&0x8000u32.to_le_bytes());
        raw[8] = 1;
        raw[9] = 5;
        raw[10..12].copy_from_slice(&60u16.to_le_bytes());
        raw[12..16].copy_from_slice(&0x0200u32.to_le_bytes());
        let entry = CompletionEntry::from_bytes(raw);
        assert!(entry.valid());
        assert_eq!(entry.completion_type(), Some(CompletionType::HwrmAsyncEvent));
        let ev = entry.as_async_event().unwrap();
        assert_eq!(ev.event_id.get(), 8);
        assert_eq!(ev.event_data2.get(), 0x8000);
        assert_eq!(ev.timestamp_lo, 5);
        assert_eq!(ev.timestamp_hi.get(), 60);
        assert_eq!(ev.event_data1.get(), 0x200);
        assert!(entry.as_notification().is_none());
    }

    #[test]
    fn test_notification_toggle() {
        let mut raw = [0u8; 16];
        raw[0] = CompletionType::CqNotification as u8 | (2 << 6);
        raw[4] = 0x34;
        raw[12] = 0x01;
        let nq = CompletionEntry::from_bytes(raw).as_notification().unwrap();
        assert_eq!(nq.toggle(), 2);
        assert_eq!(nq.cq_handle(), 0x1_0000_0034);
    }
}
