//! Descriptor and completion rings living in DMA memory.
//!
//! A [`Ring`] only tracks memory and indices; registering it with firmware and ringing its
//! doorbell are done by the driver through [`crate::hwrm`] and [`crate::doorbell`].
//!
//! Producer rings (transmit, receive, aggregation) are filled by the driver with [`Ring::post()`].
//! Completion and notification rings are filled by hardware, which marks each entry it writes
//! with the ring's current valid bit; that bit flips every time the ring wraps, so an entry left
//! over from the previous lap is never mistaken for a new one.

use alloc::vec::Vec;
use core::fmt;
use nic_hal::{read_barrier, DmaAllocator};
use num_enum::TryFromPrimitive;

use crate::completion::{CompletionEntry, CMPL_ENTRY_SIZE, CMPL_VALID_OFFSET};
use crate::error::{ContextMemError, RingError};
use crate::page_table::{PageTable, PageTableDepth, PageTableLayout, MAX_CTX_PAGES};

/// Every descriptor and completion record handled by this driver is 16 bytes.
pub const RING_ENTRY_SIZE: usize = 16;
/// Firmware's marker for "no ring".
pub const INVALID_HW_RING_ID: u16 = 0xFFFF;

/// The kinds of rings, valued as the `ring_type` of a `RING_ALLOC` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum RingKind {
    Completion   = 0,
    Tx           = 1,
    Rx           = 2,
    RxAgg        = 4,
    Notification = 5,
}

impl RingKind {
    /// The largest ring of this kind the hardware accepts.
    pub fn max_entries(&self) -> u32 {
        match self {
            RingKind::Tx => 4096,
            RingKind::Rx => 8192,
            RingKind::RxAgg => 32768,
            RingKind::Completion | RingKind::Notification => 65536,
        }
    }

    /// Whether the driver produces entries on this ring (as opposed to hardware).
    pub fn is_producer(&self) -> bool {
        matches!(self, RingKind::Tx | RingKind::Rx | RingKind::RxAgg)
    }
}

/// Rounds `requested` up to a power of two, with a minimum of two entries.
/// Zero, or anything above the kind's maximum after rounding, is rejected.
pub fn normalize_ring_size(kind: RingKind, requested: u32) -> Result<u32, RingError> {
    if requested == 0 {
        return Err(RingError::InvalidSize);
    }
    let size = requested.max(2).checked_next_power_of_two().ok_or(RingError::InvalidSize)?;
    if size > kind.max_entries() {
        return Err(RingError::InvalidSize);
    }
    Ok(size)
}

/// Where a ring's doorbell lives and the id that goes in its `xid` field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DoorbellTarget {
    /// Byte offset within the doorbell BAR.
    pub offset: usize,
    /// The firmware ring id (P5 and newer).
    pub xid: u32,
}

pub struct Ring {
    kind: RingKind,
    size: u32,
    mask: u32,
    mem: PageTable,
    /// Next slot the driver will write (producer rings).
    prod: u32,
    /// Next slot to be consumed: by hardware for producer rings, by the driver otherwise.
    cons: u32,
    /// Consumer counter that is never masked; its wrap parity is the completion epoch.
    raw_cons: u32,
    /// The valid bit that marks a completion entry as new on the current lap.
    v_bit: bool,
    /// Producer epoch, flipped whenever `prod` wraps.
    epoch: u8,
    /// The producer epoch in effect at each slot; only kept when the chip needs it.
    epoch_arr: Vec<u8>,
    /// The value from the last notification for this ring, echoed on re-arm.
    toggle: u8,
    doorbell: DoorbellTarget,
    fw_ring_id: u16,
}

impl Ring {
    /// Allocates the memory for a ring of `size` entries, which must already be a power of two.
    ///
    /// Multi-page rings are described through a one-level page table whose last two entries
    /// are tagged for firmware.
    pub fn new(dma: &dyn DmaAllocator, kind: RingKind, size: u32, track_epochs: bool) -> Result<Ring, RingError> {
        if !size.is_power_of_two() || size < 2 || size > kind.max_entries() {
            return Err(RingError::InvalidSize);
        }
        let bytes = size as usize * RING_ENTRY_SIZE;
        let layout = PageTableLayout::compute(bytes, MAX_CTX_PAGES, PageTableDepth::Level0).map_err(|e| match e {
            ContextMemError::DmaAllocationFailed => RingError::DmaAllocationFailed,
            _ => RingError::InvalidSize,
        })?;
        let mem = PageTable::allocate(dma, layout, true, None).map_err(|_e| RingError::DmaAllocationFailed)?;
        let epoch_arr = if track_epochs && kind.is_producer() {
            alloc::vec![0u8; size as usize]
        } else {
            Vec::new()
        };

        Ok(Ring {
            kind,
            size,
            mask: size - 1,
            mem,
            prod: 0,
            cons: 0,
            raw_cons: 0,
            v_bit: true,
            epoch: 0,
            epoch_arr,
            toggle: 0,
            doorbell: DoorbellTarget::default(),
            fw_ring_id: INVALID_HW_RING_ID,
        })
    }

    pub fn kind(&self) -> RingKind {
        self.kind
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn index_mask(&self) -> u32 {
        self.mask
    }

    pub fn prod(&self) -> u32 {
        self.prod
    }

    pub fn cons(&self) -> u32 {
        self.cons
    }

    pub fn raw_cons(&self) -> u32 {
        self.raw_cons
    }

    /// The valid bit expected on the next new completion entry.
    pub fn valid_bit(&self) -> bool {
        self.v_bit
    }

    /// The producer epoch recorded for `index`; always 0 when epochs are not tracked.
    pub fn epoch_at(&self, index: u32) -> u8 {
        self.epoch_arr.get((index & self.mask) as usize).copied().unwrap_or(0)
    }

    /// Wrap parity of the consumer, as completion doorbells encode it.
    pub fn cons_epoch(&self) -> u8 {
        ((self.raw_cons >> self.size.trailing_zeros()) & 1) as u8
    }

    pub fn toggle(&self) -> u8 {
        self.toggle
    }

    pub fn set_toggle(&mut self, toggle: u8) {
        self.toggle = toggle & 0x3;
    }

    pub fn doorbell(&self) -> DoorbellTarget {
        self.doorbell
    }

    pub fn set_doorbell(&mut self, target: DoorbellTarget) {
        self.doorbell = target;
    }

    pub fn fw_ring_id(&self) -> u16 {
        self.fw_ring_id
    }

    pub fn set_fw_ring_id(&mut self, id: u16) {
        self.fw_ring_id = id;
    }

    pub fn is_registered(&self) -> bool {
        self.fw_ring_id != INVALID_HW_RING_ID
    }

    /// The memory backing this ring, for handing its page table to firmware.
    pub fn memory(&self) -> &PageTable {
        &self.mem
    }

    /// Descriptors posted but not yet reclaimed.
    pub fn in_flight(&self) -> u32 {
        self.prod.wrapping_sub(self.cons) & self.mask
    }

    /// Writes one descriptor at the producer index and advances it.
    ///
    /// Returns the new producer index, which is what the doorbell must carry.
    /// One slot is always left empty so that a full ring can be told apart from an empty one.
    pub fn post(&mut self, desc: &[u8]) -> Result<u32, RingError> {
        if !self.kind.is_producer() {
            return Err(RingError::WrongKind);
        }
        if desc.len() != RING_ENTRY_SIZE {
            return Err(RingError::InvalidDescriptor);
        }
        if self.in_flight() == self.mask {
            return Err(RingError::RingFull);
        }
        self.mem.write(self.prod as usize * RING_ENTRY_SIZE, desc);
        self.prod = (self.prod + 1) & self.mask;
        if self.prod == 0 {
            self.epoch ^= 1;
        }
        if let Some(slot) = self.epoch_arr.get_mut(self.prod as usize) {
            *slot = self.epoch;
        }
        Ok(self.prod)
    }

    /// Marks `count` posted descriptors as consumed by hardware.
    pub fn reclaim(&mut self, count: u32) {
        let count = count.min(self.in_flight());
        self.cons = (self.cons + count) & self.mask;
    }

    /// Returns the new entries of a completion or notification ring, in order.
    ///
    /// The iterator stops at the first entry whose valid bit does not match,
    /// and advances the consumer index past every entry it yields.
    pub fn drain(&mut self) -> CompletionDrain<'_> {
        CompletionDrain { ring: self }
    }

    fn entry_is_new(&self) -> bool {
        let valid = self.mem.read_u8(self.cons as usize * RING_ENTRY_SIZE + CMPL_VALID_OFFSET) & 1 == 1;
        valid == self.v_bit
    }

    fn consume_one(&mut self) -> CompletionEntry {
        let mut raw = [0u8; CMPL_ENTRY_SIZE];
        self.mem.read(self.cons as usize * RING_ENTRY_SIZE, &mut raw);
        self.raw_cons = self.raw_cons.wrapping_add(1);
        self.cons = (self.cons + 1) & self.mask;
        if self.cons == 0 {
            self.v_bit = !self.v_bit;
        }
        CompletionEntry::from_bytes(raw)
    }
}

impl fmt::Debug for Ring {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Ring")
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("prod", &self.prod)
            .field("cons", &self.cons)
            .field("v_bit", &self.v_bit)
            .field("fw_ring_id", &self.fw_ring_id)
            .finish()
    }
}

/// Iterator over the new entries of a completion ring; see [`Ring::drain()`].
pub struct CompletionDrain<'r> {
    ring: &'r mut Ring,
}

impl Iterator for CompletionDrain<'_> {
    type Item = CompletionEntry;

    fn next(&mut self) -> Option<CompletionEntry> {
        if self.ring.kind.is_producer() || !self.ring.entry_is_new() {
            return None;
        }
        // the rest of the entry must not be read before its valid bit
        read_barrier();
        Some(self.ring.consume_one())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nic_hal::sim::HeapDmaAllocator;

    fn write_completion(ring: &mut Ring, slot: u32, tag: u8, valid: bool) {
        let mut raw = [0u8; 16];
        raw[2] = tag;
        raw[CMPL_VALID_OFFSET] = valid as u8;
        ring.mem.write(slot as usize * RING_ENTRY_SIZE, &raw);
    }

    #[test]
    fn test_sizes_are_powers_of_two() {
        for requested in 1..=4096u32 {
            let size = normalize_ring_size(RingKind::Tx, requested).unwrap();
            assert!(size.is_power_of_two());
            assert!(size >= requested);
        }
        assert_eq!(normalize_ring_size(RingKind::Tx, 0), Err(RingError::InvalidSize));
        assert_eq!(normalize_ring_size(RingKind::Tx, 4097), Err(RingError::InvalidSize));
        assert_eq!(normalize_ring_size(RingKind::Completion, 1000).unwrap(), 1024);

        let dma = HeapDmaAllocator::new();
        for &size in &[2u32, 64, 256, 1024] {
            let ring = Ring::new(&dma, RingKind::Completion, size, false).unwrap();
            assert_eq!(ring.index_mask(), size - 1);
        }
        assert_eq!(Ring::new(&dma, RingKind::Rx, 100, false).err(), Some(RingError::InvalidSize));
    }

    #[test]
    fn test_multi_page_ring_uses_tagged_table() {
        let dma = HeapDmaAllocator::new();
        let one_page = Ring::new(&dma, RingKind::Tx, 256, false).unwrap();
        assert_eq!(one_page.memory().depth(), PageTableDepth::Level0);

        let ring = Ring::new(&dma, RingKind::Completion, 1024, false).unwrap();
        assert_eq!(ring.memory().depth(), PageTableDepth::Level1);
        let table = ring.memory().base_addr().value();
        let pte = |i: u64| dma.read_phys_u64(table + i * 8).unwrap() & 0x7;
        assert_eq!(pte(0), 0x1);
        assert_eq!(pte(2), 0x5);
        assert_eq!(pte(3), 0x3);
    }

    #[test]
    fn test_post_until_full() {
        let dma = HeapDmaAllocator::new();
        let mut ring = Ring::new(&dma, RingKind::Tx, 4, false).unwrap();
        let desc = [0xAAu8; 16];
        assert_eq!(ring.post(&desc), Ok(1));
        assert_eq!(ring.post(&desc), Ok(2));
        assert_eq!(ring.post(&desc), Ok(3));
        assert_eq!(ring.post(&desc), Err(RingError::RingFull));
        assert_eq!(ring.post(&[0u8; 8]), Err(RingError::InvalidDescriptor));
        ring.reclaim(2);
        assert_eq!(ring.in_flight(), 1);
        assert_eq!(ring.post(&desc), Ok(0));
        assert_eq!(ring.memory().read_u8(3 * 16), 0xAA);

        let mut cq = Ring::new(&dma, RingKind::Completion, 4, false).unwrap();
        assert_eq!(cq.post(&desc), Err(RingError::WrongKind));
    }

    #[test]
    fn test_producer_epochs_flip_on_wrap() {
        let dma = HeapDmaAllocator::new();
        let mut ring = Ring::new(&dma, RingKind::Tx, 4, true).unwrap();
        let desc = [0u8; 16];
        for _ in 0..3 {
            ring.post(&desc).unwrap();
        }
        assert_eq!(ring.epoch_at(3), 0);
        ring.reclaim(3);
        assert_eq!(ring.post(&desc), Ok(0));
        assert_eq!(ring.epoch_at(0), 1);
        ring.post(&desc).unwrap();
        assert_eq!(ring.epoch_at(1), 1);

        let untracked = Ring::new(&dma, RingKind::Tx, 4, false).unwrap();
        assert_eq!(untracked.epoch_at(0), 0);
    }

    #[test]
    fn test_drain_stops_at_parity_mismatch() {
        let dma = HeapDmaAllocator::new();
        let mut ring = Ring::new(&dma, RingKind::Completion, 4, false).unwrap();
        assert_eq!(ring.drain().count(), 0);

        write_completion(&mut ring, 0, 10, true);
        write_completion(&mut ring, 1, 11, true);
        let tags: Vec<u8> = ring.drain().map(|c| c.info1.get() as u8).collect();
        assert_eq!(tags, [10, 11]);
        assert_eq!(ring.cons(), 2);
        // nothing new until hardware writes again
        assert_eq!(ring.drain().count(), 0);
    }

    #[test]
    fn test_no_slot_is_reported_twice_across_wraps() {
        let dma = HeapDmaAllocator::new();
        let mut ring = Ring::new(&dma, RingKind::Completion, 4, false).unwrap();
        let mut seen = Vec::new();
        let mut hw_valid = true;
        let mut hw_slot = 0u32;
        for tag in 0..11u8 {
            write_completion(&mut ring, hw_slot, tag, hw_valid);
            hw_slot = (hw_slot + 1) & 3;
            if hw_slot == 0 {
                hw_valid = !hw_valid;
            }
            // drain twice: the second pass must find nothing
            seen.extend(ring.drain().map(|c| c.info1.get() as u8));
            assert_eq!(ring.drain().count(), 0);
        }
        assert_eq!(seen, (0..11).collect::<Vec<u8>>());
        assert_eq!(ring.raw_cons(), 11);
        assert_eq!(ring.cons(), 3);
        // after two full laps the expected valid bit is back to its initial value
        assert!(ring.valid_bit());
        assert_eq!(ring.cons_epoch(), 0);
    }
}
