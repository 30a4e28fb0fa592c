//! Chip generations and the firmware capability set discovered at bring-up.

use bitflags::bitflags;
use crate::doorbell::{DoorbellOps, LegacyDoorbells, P5Doorbells, P7Doorbells};
use crate::messages::*;

/// The three doorbell/ring generations of the bnxt family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChipGeneration {
    /// BCM573xx/574xx ("Cumulus").
    Legacy,
    /// BCM575xx ("Thor").
    P5,
    /// BCM576xx ("Thor2").
    P7,
}

/// Doorbell BAR offset used by every ring of a P5+ physical function.
pub const DB_PF_OFFSET_P5: usize = 0x10000;
/// Spacing of the per-ring doorbells on legacy chips.
pub const DB_LEGACY_STRIDE: usize = 0x80;

impl ChipGeneration {
    /// Maps the `chip_num` reported by `VER_GET` to its generation.
    pub fn from_chip_num(chip_num: u16) -> ChipGeneration {
        match chip_num {
            0x1750..=0x1752 => ChipGeneration::P5,
            0x1760 => ChipGeneration::P7,
            _ => ChipGeneration::Legacy,
        }
    }

    /// The doorbell encoding of this generation. Chosen once at attach.
    pub fn doorbell_ops(&self) -> &'static dyn DoorbellOps {
        static LEGACY: LegacyDoorbells = LegacyDoorbells;
        static P5: P5Doorbells = P5Doorbells;
        static P7: P7Doorbells = P7Doorbells;
        match self {
            ChipGeneration::Legacy => &LEGACY,
            ChipGeneration::P5 => &P5,
            ChipGeneration::P7 => &P7,
        }
    }

    /// Only P5 and newer keep queue state in host backing store.
    pub fn needs_backing_store(&self) -> bool {
        *self != ChipGeneration::Legacy
    }

    /// Legacy chips steer receive traffic through firmware ring groups.
    pub fn needs_ring_groups(&self) -> bool {
        *self == ChipGeneration::Legacy
    }

    /// Notification queues exist on P5 and newer only.
    pub fn has_notification_rings(&self) -> bool {
        *self != ChipGeneration::Legacy
    }

    /// Whether producer rings carry a per-slot epoch array.
    pub fn tracks_epochs(&self) -> bool {
        *self == ChipGeneration::P7
    }

    /// The doorbell BAR offset for the ring with driver-assigned `logical_id`.
    pub fn doorbell_offset(&self, logical_id: u16) -> usize {
        match self {
            ChipGeneration::Legacy => logical_id as usize * DB_LEGACY_STRIDE,
            ChipGeneration::P5 | ChipGeneration::P7 => DB_PF_OFFSET_P5,
        }
    }
}

bitflags! {
    /// Firmware features, fixed once bring-up has finished querying firmware.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FwCapabilities: u32 {
        const SHORT_CMD             = 1 << 0;
        const SHORT_CMD_REQUIRED    = 1 << 1;
        const HOT_RESET             = 1 << 2;
        const ERROR_RECOVERY        = 1 << 3;
        /// Firmware reloads itself after a reset; the driver only waits for it.
        const ERR_RECOVER_RELOAD    = 1 << 4;
        const BACKING_STORE_V2      = 1 << 5;
        const RESOURCE_QCAPS        = 1 << 6;
    }
}

impl FwCapabilities {
    /// Capabilities advertised in the `VER_GET` response.
    pub fn from_version(ver: &VerGetOutput) -> FwCapabilities {
        let mut caps = FwCapabilities::empty();
        let dev_caps = ver.dev_caps_cfg.get();
        if dev_caps & VER_GET_DEV_CAPS_SHORT_CMD_SUPPORTED != 0 {
            caps |= FwCapabilities::SHORT_CMD;
        }
        if dev_caps & VER_GET_DEV_CAPS_SHORT_CMD_REQUIRED != 0 {
            caps |= FwCapabilities::SHORT_CMD | FwCapabilities::SHORT_CMD_REQUIRED;
        }
        caps
    }

    /// Capabilities advertised in the `FUNC_QCAPS` response.
    pub fn from_func_qcaps(qcaps: &FuncQcapsOutput) -> FwCapabilities {
        let flags = qcaps.flags.get();
        let flags_ext = qcaps.flags_ext.get();
        let mut caps = FwCapabilities::empty();
        caps.set(FwCapabilities::HOT_RESET, flags & FUNC_QCAPS_FLAGS_HOT_RESET_CAPABLE != 0);
        caps.set(FwCapabilities::ERROR_RECOVERY, flags & FUNC_QCAPS_FLAGS_ERROR_RECOVERY_CAPABLE != 0);
        caps.set(FwCapabilities::ERR_RECOVER_RELOAD, flags & FUNC_QCAPS_FLAGS_ERR_RECOVER_RELOAD != 0);
        caps.set(FwCapabilities::BACKING_STORE_V2, flags_ext & FUNC_QCAPS_FLAGS_EXT_BS_V2_SUPPORTED != 0);
        caps.set(FwCapabilities::RESOURCE_QCAPS, flags_ext & FUNC_QCAPS_FLAGS_EXT_RESOURCE_QCAPS != 0);
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromZeroes;

    #[test]
    fn test_generation_from_chip_num() {
        assert_eq!(ChipGeneration::from_chip_num(0x16D7), ChipGeneration::Legacy);
        assert_eq!(ChipGeneration::from_chip_num(0x1750), ChipGeneration::P5);
        assert_eq!(ChipGeneration::from_chip_num(0x1760), ChipGeneration::P7);
        assert_eq!(ChipGeneration::Legacy.doorbell_offset(3), 0x180);
        assert_eq!(ChipGeneration::P7.doorbell_offset(3), DB_PF_OFFSET_P5);
        assert_eq!(ChipGeneration::P7.doorbell_ops().generation(), ChipGeneration::P7);
    }

    #[test]
    fn test_capabilities_from_qcaps() {
        let mut qcaps = FuncQcapsOutput::new_zeroed();
        qcaps.flags = Le32::new(FUNC_QCAPS_FLAGS_ERROR_RECOVERY_CAPABLE | FUNC_QCAPS_FLAGS_HOT_RESET_CAPABLE);
        qcaps.flags_ext = Le32::new(FUNC_QCAPS_FLAGS_EXT_BS_V2_SUPPORTED);
        let caps = FwCapabilities::from_func_qcaps(&qcaps);
        assert!(caps.contains(FwCapabilities::ERROR_RECOVERY | FwCapabilities::HOT_RESET | FwCapabilities::BACKING_STORE_V2));
        assert!(!caps.contains(FwCapabilities::ERR_RECOVER_RELOAD));
    }
}
