//! Doorbell encodings for the three bnxt chip generations.
//!
//! The driver picks one [`DoorbellOps`] implementation at attach, through
//! [`crate::capabilities::ChipGeneration::doorbell_ops()`], and uses it for the life of the device.
//! Each implementation only computes the value to write; the provided trait methods
//! surround the MMIO write with barriers so that ring contents (or a consumer index update)
//! are visible to the device before the doorbell is, and the doorbell before anything after it.

use bit_field::BitField;
use nic_hal::{write_barrier, RegisterSpace};

use crate::capabilities::ChipGeneration;
use crate::ring::{Ring, RingKind};

// Legacy 32-bit doorbells
pub const DB_KEY_TX: u32 = 0x0 << 28;
pub const DB_KEY_RX: u32 = 0x1 << 28;
pub const DB_KEY_CP: u32 = 0x2 << 28;
pub const DB_IDX_VALID: u32 = 1 << 26;
pub const DB_IRQ_DIS: u32 = 1 << 27;
pub const DB_LEGACY_IDX_MASK: u32 = 0x00FF_FFFF;

// P5/P7 64-bit doorbells
pub const DBR_INDEX_MASK: u64 = 0x00FF_FFFF;
pub const DBR_EPOCH_SFT: u64 = 24;
pub const DBR_TOGGLE_SFT: u64 = 25;
pub const DBR_TOGGLE_MASK: u64 = 0x0600_0000;
pub const DBR_XID_SFT: u64 = 32;
pub const DBR_XID_MASK: u64 = 0x000F_FFFF << DBR_XID_SFT;
pub const DBR_PATH_L2: u64 = 1 << 56;
pub const DBR_VALID: u64 = 1 << 58;
pub const DBR_TYPE_SFT: u64 = 60;
pub const DBR_TYPE_SQ: u64 = 0x0 << DBR_TYPE_SFT;
pub const DBR_TYPE_SRQ: u64 = 0x2 << DBR_TYPE_SFT;
pub const DBR_TYPE_CQ: u64 = 0x4 << DBR_TYPE_SFT;
pub const DBR_TYPE_CQ_ARMALL: u64 = 0x6 << DBR_TYPE_SFT;
pub const DBR_TYPE_NQ: u64 = 0xA << DBR_TYPE_SFT;
pub const DBR_TYPE_NQ_ARM: u64 = 0xB << DBR_TYPE_SFT;
pub const DBR_TYPE_NQ_MASK: u64 = 0xE << DBR_TYPE_SFT;

/// A single doorbell write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DoorbellValue {
    Db32(u32),
    Db64(u64),
    /// Nothing to write: the operation does not exist on this generation.
    Skip,
}

/// The doorbell protocol of one chip generation.
pub trait DoorbellOps: Send + Sync {
    fn generation(&self) -> ChipGeneration;

    /// Tells hardware that transmit descriptors up to (not including) `index` are ready.
    fn tx_value(&self, ring: &Ring, index: u32) -> DoorbellValue;
    /// Tells hardware that receive buffers up to (not including) `index` are ready.
    fn rx_value(&self, ring: &Ring, index: u32) -> DoorbellValue;
    /// Acknowledges a completion ring up to its consumer index, re-arming or masking its interrupt.
    fn cq_value(&self, ring: &Ring, enable: bool) -> DoorbellValue;
    /// Acknowledges a notification ring up to its consumer index, re-arming or masking it.
    fn nq_value(&self, ring: &Ring, enable: bool) -> DoorbellValue;

    fn ring_tx(&self, bar: &dyn RegisterSpace, ring: &Ring, index: u32) {
        if check_kind(ring, &[RingKind::Tx]) {
            write_doorbell(bar, ring, self.tx_value(ring, index));
        }
    }

    fn ring_rx(&self, bar: &dyn RegisterSpace, ring: &Ring, index: u32) {
        if check_kind(ring, &[RingKind::Rx, RingKind::RxAgg]) {
            write_doorbell(bar, ring, self.rx_value(ring, index));
        }
    }

    fn arm_rx_completion(&self, bar: &dyn RegisterSpace, ring: &Ring, enable: bool) {
        if check_kind(ring, &[RingKind::Completion]) {
            write_doorbell(bar, ring, self.cq_value(ring, enable));
        }
    }

    fn arm_tx_completion(&self, bar: &dyn RegisterSpace, ring: &Ring, enable: bool) {
        if check_kind(ring, &[RingKind::Completion]) {
            write_doorbell(bar, ring, self.cq_value(ring, enable));
        }
    }

    fn arm_notification(&self, bar: &dyn RegisterSpace, ring: &Ring, enable: bool) {
        if check_kind(ring, &[RingKind::Notification]) {
            write_doorbell(bar, ring, self.nq_value(ring, enable));
        }
    }
}

fn check_kind(ring: &Ring, allowed: &[RingKind]) -> bool {
    if allowed.contains(&ring.kind()) {
        true
    } else {
        error!("doorbell for {:?} rings rung on a {:?} ring", allowed, ring.kind());
        false
    }
}

fn write_doorbell(bar: &dyn RegisterSpace, ring: &Ring, value: DoorbellValue) {
    let offset = ring.doorbell().offset;
    match value {
        DoorbellValue::Db32(v) => {
            write_barrier();
            bar.write32(offset, v);
            write_barrier();
        }
        DoorbellValue::Db64(v) => {
            write_barrier();
            bar.write64(offset, v);
            write_barrier();
        }
        DoorbellValue::Skip => {}
    }
}

/// BCM573xx/574xx: one 32-bit doorbell per ring, keyed by ring type.
pub struct LegacyDoorbells;

impl DoorbellOps for LegacyDoorbells {
    fn generation(&self) -> ChipGeneration {
        ChipGeneration::Legacy
    }

    fn tx_value(&self, _ring: &Ring, index: u32) -> DoorbellValue {
        DoorbellValue::Db32(DB_KEY_TX | (index & DB_LEGACY_IDX_MASK))
    }

    fn rx_value(&self, _ring: &Ring, index: u32) -> DoorbellValue {
        DoorbellValue::Db32(DB_KEY_RX | (index & DB_LEGACY_IDX_MASK))
    }

    fn cq_value(&self, ring: &Ring, enable: bool) -> DoorbellValue {
        let mut value = DB_KEY_CP | DB_IDX_VALID | (ring.cons() & DB_LEGACY_IDX_MASK);
        if !enable {
            value |= DB_IRQ_DIS;
        }
        DoorbellValue::Db32(value)
    }

    fn nq_value(&self, _ring: &Ring, _enable: bool) -> DoorbellValue {
        // legacy chips deliver interrupts straight from completion rings
        DoorbellValue::Skip
    }
}

fn p5_base(ring: &Ring, db_type: u64) -> u64 {
    DBR_PATH_L2 | db_type | ((ring.doorbell().xid as u64) << DBR_XID_SFT & DBR_XID_MASK)
}

/// BCM575xx: 64-bit doorbells shared by all rings of the function, addressed by `xid`.
pub struct P5Doorbells;

impl DoorbellOps for P5Doorbells {
    fn generation(&self) -> ChipGeneration {
        ChipGeneration::P5
    }

    fn tx_value(&self, ring: &Ring, index: u32) -> DoorbellValue {
        DoorbellValue::Db64(p5_base(ring, DBR_TYPE_SQ) | (index as u64 & DBR_INDEX_MASK))
    }

    fn rx_value(&self, ring: &Ring, index: u32) -> DoorbellValue {
        DoorbellValue::Db64(p5_base(ring, DBR_TYPE_SRQ) | (index as u64 & DBR_INDEX_MASK))
    }

    fn cq_value(&self, ring: &Ring, enable: bool) -> DoorbellValue {
        let db_type = if enable { DBR_TYPE_CQ_ARMALL } else { DBR_TYPE_CQ };
        DoorbellValue::Db64(p5_base(ring, db_type) | (ring.cons() as u64 & DBR_INDEX_MASK))
    }

    fn nq_value(&self, ring: &Ring, enable: bool) -> DoorbellValue {
        let db_type = if enable { DBR_TYPE_NQ_ARM } else { DBR_TYPE_NQ };
        DoorbellValue::Db64(p5_base(ring, db_type) | (ring.cons() as u64 & DBR_INDEX_MASK))
    }
}

/// BCM576xx: the P5 layout plus a valid bit and an epoch bit, so that hardware can reject
/// a doorbell that refers to a previous lap of the ring.
pub struct P7Doorbells;

impl P7Doorbells {
    fn producer(ring: &Ring, db_type: u64, index: u32) -> DoorbellValue {
        if index >= ring.size() {
            error!("P7 doorbell index {} is out of range for a ring of {} entries", index, ring.size());
            return DoorbellValue::Skip;
        }
        let mut value = p5_base(ring, db_type) | DBR_VALID | index as u64;
        value.set_bit(DBR_EPOCH_SFT as usize, ring.epoch_at(index) & 1 == 1);
        DoorbellValue::Db64(value)
    }

    fn consumer(ring: &Ring, db_type: u64, with_toggle: bool) -> DoorbellValue {
        let mut value = p5_base(ring, db_type) | DBR_VALID | (ring.cons() as u64 & DBR_INDEX_MASK);
        value.set_bit(DBR_EPOCH_SFT as usize, ring.cons_epoch() == 1);
        if with_toggle {
            value |= ((ring.toggle() as u64) << DBR_TOGGLE_SFT) & DBR_TOGGLE_MASK;
        }
        DoorbellValue::Db64(value)
    }
}

impl DoorbellOps for P7Doorbells {
    fn generation(&self) -> ChipGeneration {
        ChipGeneration::P7
    }

    fn tx_value(&self, ring: &Ring, index: u32) -> DoorbellValue {
        P7Doorbells::producer(ring, DBR_TYPE_SQ, index)
    }

    fn rx_value(&self, ring: &Ring, index: u32) -> DoorbellValue {
        P7Doorbells::producer(ring, DBR_TYPE_SRQ, index)
    }

    fn cq_value(&self, ring: &Ring, enable: bool) -> DoorbellValue {
        if enable {
            P7Doorbells::consumer(ring, DBR_TYPE_CQ_ARMALL, true)
        } else {
            P7Doorbells::consumer(ring, DBR_TYPE_CQ, false)
        }
    }

    fn nq_value(&self, ring: &Ring, enable: bool) -> DoorbellValue {
        if enable {
            P7Doorbells::consumer(ring, DBR_TYPE_NQ_ARM, true)
        } else {
            P7Doorbells::consumer(ring, DBR_TYPE_NQ_MASK, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::DoorbellTarget;
    use nic_hal::sim::{HeapDmaAllocator, MmioWrite, SimRegisters};

    fn ring(dma: &HeapDmaAllocator, kind: RingKind, size: u32, epochs: bool, xid: u32) -> Ring {
        let mut ring = Ring::new(dma, kind, size, epochs).unwrap();
        ring.set_doorbell(DoorbellTarget { offset: 0x80, xid });
        ring
    }

    #[test]
    fn test_legacy_encodings() {
        let dma = HeapDmaAllocator::new();
        let tx = ring(&dma, RingKind::Tx, 256, false, 0);
        assert_eq!(LegacyDoorbells.tx_value(&tx, 5), DoorbellValue::Db32(0x0000_0005));
        assert_eq!(LegacyDoorbells.rx_value(&tx, 5), DoorbellValue::Db32(0x1000_0005));

        let cq = ring(&dma, RingKind::Completion, 256, false, 0);
        assert_eq!(LegacyDoorbells.cq_value(&cq, true), DoorbellValue::Db32(0x2400_0000));
        assert_eq!(LegacyDoorbells.cq_value(&cq, false), DoorbellValue::Db32(0x2C00_0000));
        assert_eq!(LegacyDoorbells.nq_value(&cq, true), DoorbellValue::Skip);
    }

    #[test]
    fn test_p5_encodings() {
        let dma = HeapDmaAllocator::new();
        let tx = ring(&dma, RingKind::Tx, 256, false, 0x12);
        assert_eq!(P5Doorbells.tx_value(&tx, 7), DoorbellValue::Db64(0x0100_0012_0000_0007));
        assert_eq!(P5Doorbells.rx_value(&tx, 7), DoorbellValue::Db64(0x2100_0012_0000_0007));

        let cq = ring(&dma, RingKind::Completion, 256, false, 0x3);
        assert_eq!(P5Doorbells.cq_value(&cq, true), DoorbellValue::Db64(0x6100_0003_0000_0000));
        assert_eq!(P5Doorbells.cq_value(&cq, false), DoorbellValue::Db64(0x4100_0003_0000_0000));
        let nq = ring(&dma, RingKind::Notification, 256, false, 0x3);
        assert_eq!(P5Doorbells.nq_value(&nq, true), DoorbellValue::Db64(0xB100_0003_0000_0000));
        assert_eq!(P5Doorbells.nq_value(&nq, false), DoorbellValue::Db64(0xA100_0003_0000_0000));
    }

    #[test]
    fn test_p7_epoch_and_toggle() {
        let dma = HeapDmaAllocator::new();
        let mut tx = ring(&dma, RingKind::Tx, 4, true, 0x1);
        for _ in 0..3 {
            tx.post(&[0u8; 16]).unwrap();
        }
        tx.reclaim(3);
        let index = tx.post(&[0u8; 16]).unwrap();
        assert_eq!(index, 0);
        // wrapped once: epoch bit set
        assert_eq!(P7Doorbells.tx_value(&tx, index), DoorbellValue::Db64(0x0500_0001_0100_0000));
        assert_eq!(P7Doorbells.tx_value(&tx, 3), DoorbellValue::Db64(0x0500_0001_0000_0003));
        assert_eq!(P7Doorbells.tx_value(&tx, 4), DoorbellValue::Skip);

        let mut nq = ring(&dma, RingKind::Notification, 4, true, 0x2);
        nq.set_toggle(3);
        assert_eq!(P7Doorbells.nq_value(&nq, true), DoorbellValue::Db64(0xB500_0002_0600_0000));
        assert_eq!(P7Doorbells.nq_value(&nq, false), DoorbellValue::Db64(0xE500_0002_0000_0000));
        assert_eq!(P7Doorbells.cq_value(&nq, false), DoorbellValue::Db64(0x4500_0002_0000_0000));
    }

    #[test]
    fn test_doorbell_written_at_ring_offset() {
        let dma = HeapDmaAllocator::new();
        let bar = SimRegisters::new(0x20000);
        let tx = ring(&dma, RingKind::Tx, 16, false, 0x9);
        let ops = ChipGeneration::P5.doorbell_ops();
        ops.ring_tx(&bar, &tx, 1);
        assert_eq!(bar.take_writes(), [MmioWrite::W64 { offset: 0x80, value: 0x0100_0009_0000_0001 }]);

        // wrong ring kind is refused without touching the BAR
        ops.arm_notification(&bar, &tx, true);
        assert!(bar.take_writes().is_empty());

        let legacy = ChipGeneration::Legacy.doorbell_ops();
        let cq = ring(&dma, RingKind::Completion, 16, false, 0);
        legacy.arm_rx_completion(&bar, &cq, false);
        assert_eq!(bar.take_writes(), [MmioWrite::W32 { offset: 0x80, value: 0x2C00_0000 }]);
        legacy.arm_notification(&bar, &cq, true);
        assert!(bar.take_writes().is_empty());
    }
}
