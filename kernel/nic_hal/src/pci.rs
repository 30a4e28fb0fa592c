//! Configuration space access for a single PCI function.

/// Offset of the 16-bit command register.
pub const PCI_COMMAND: u16 = 0x04;
/// Offset of the 16-bit subsystem id register.
pub const PCI_SUBSYSTEM_ID: u16 = 0x2E;
/// Command register bit that lets the device respond to memory space accesses.
pub const PCI_COMMAND_MEMORY: u16 = 1 << 1;
/// Command register bit that lets the device initiate DMA.
pub const PCI_COMMAND_BUS_MASTER: u16 = 1 << 2;

/// A PCI function as seen by its driver.
///
/// Reads of an inaccessible device (e.g. one that is mid-reset or has fallen off the bus)
/// return all ones, which callers must treat as "not currently reachable".
pub trait PciFunction: Send + Sync {
    fn read_config_u32(&self, offset: u16) -> u32;
    fn write_config_u32(&self, offset: u16, value: u32);
    fn read_config_u16(&self, offset: u16) -> u16;
    fn write_config_u16(&self, offset: u16, value: u16);

    /// Enables memory space decoding.
    fn enable_device(&self) -> Result<(), &'static str> {
        let cmd = self.read_config_u16(PCI_COMMAND);
        if cmd == u16::MAX {
            return Err("PCI config space of the device is not accessible");
        }
        self.write_config_u16(PCI_COMMAND, cmd | PCI_COMMAND_MEMORY);
        Ok(())
    }

    /// Disables memory space decoding and bus mastering.
    fn disable_device(&self) {
        let cmd = self.read_config_u16(PCI_COMMAND);
        if cmd != u16::MAX {
            self.write_config_u16(PCI_COMMAND, cmd & !(PCI_COMMAND_MEMORY | PCI_COMMAND_BUS_MASTER));
        }
    }

    fn is_enabled(&self) -> bool {
        let cmd = self.read_config_u16(PCI_COMMAND);
        cmd != u16::MAX && cmd & PCI_COMMAND_MEMORY != 0
    }

    fn set_bus_master(&self, enable: bool) {
        let cmd = self.read_config_u16(PCI_COMMAND);
        if cmd == u16::MAX {
            return;
        }
        let cmd = if enable { cmd | PCI_COMMAND_BUS_MASTER } else { cmd & !PCI_COMMAND_BUS_MASTER };
        self.write_config_u16(PCI_COMMAND, cmd);
    }

    fn is_bus_master(&self) -> bool {
        let cmd = self.read_config_u16(PCI_COMMAND);
        cmd != u16::MAX && cmd & PCI_COMMAND_BUS_MASTER != 0
    }
}
