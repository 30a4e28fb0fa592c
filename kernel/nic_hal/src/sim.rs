//! Host-side stand-ins for DMA memory, register windows, PCI config space and time.
//!
//! These let a driver run against a simulated device: "physical" addresses are synthetic,
//! but the [`HeapDmaAllocator`] keeps a registry of them so that a device model can read
//! and write driver memory by physical address, exactly as real hardware would via DMA.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::{Clock, DmaAllocator, DmaBacking, DmaMemory, PciFunction, PhysicalAddress, RegisterSpace, PAGE_SIZE};

/// Where the synthetic physical address space starts.
const SIM_PHYS_BASE: u64 = 0x1_0000_0000;

struct Region {
    virt: usize,
    len: usize,
}

#[derive(Default)]
struct DmaRegistry {
    regions: Mutex<BTreeMap<u64, Region>>,
    next_phys: AtomicU64,
    allocations: AtomicUsize,
    /// Number of further allocations that will succeed; `usize::MAX` means unlimited.
    remaining: AtomicUsize,
}

impl DmaRegistry {
    fn lookup(&self, phys: u64, len: usize) -> Option<*mut u8> {
        let regions = self.regions.lock();
        let (start, region) = regions.range(..=phys).next_back()?;
        let offset = (phys - start) as usize;
        if offset + len > region.len {
            return None;
        }
        Some((region.virt + offset) as *mut u8)
    }
}

impl DmaBacking for DmaRegistry {
    fn release(&self, virt: NonNull<u8>, phys: PhysicalAddress, len: usize) {
        if let Some(region) = self.regions.lock().remove(&phys.value()) {
            let size = region.len.max(PAGE_SIZE);
            if let Ok(layout) = Layout::from_size_align(size, PAGE_SIZE) {
                unsafe { dealloc(virt.as_ptr(), layout) };
            }
        } else {
            error!("sim: released DMA region {:?} ({} bytes) that was never registered", phys, len);
        }
    }
}

/// A [`DmaAllocator`] backed by the heap, with synthetic physical addresses.
///
/// Cloning yields another handle to the same address space.
#[derive(Clone)]
pub struct HeapDmaAllocator {
    registry: Arc<DmaRegistry>,
}

impl Default for HeapDmaAllocator {
    fn default() -> Self {
        HeapDmaAllocator::new()
    }
}

impl HeapDmaAllocator {
    pub fn new() -> HeapDmaAllocator {
        let registry = DmaRegistry::default();
        registry.next_phys.store(SIM_PHYS_BASE, Ordering::SeqCst);
        registry.remaining.store(usize::MAX, Ordering::SeqCst);
        HeapDmaAllocator { registry: Arc::new(registry) }
    }

    /// Lets the next `count` allocations succeed and fails every one after that.
    pub fn fail_after(&self, count: usize) {
        self.registry.remaining.store(count, Ordering::SeqCst);
    }

    /// Removes any limit set by [`HeapDmaAllocator::fail_after()`].
    pub fn never_fail(&self) {
        self.registry.remaining.store(usize::MAX, Ordering::SeqCst);
    }

    /// Number of regions currently allocated and not yet dropped.
    pub fn live_regions(&self) -> usize {
        self.registry.regions.lock().len()
    }

    /// Total number of successful allocations so far.
    pub fn allocation_count(&self) -> usize {
        self.registry.allocations.load(Ordering::SeqCst)
    }

    /// Device-side read of driver memory.
    pub fn read_phys(&self, phys: u64, buf: &mut [u8]) -> Result<(), &'static str> {
        let ptr = self.registry.lookup(phys, buf.len()).ok_or("sim: DMA read from unmapped physical address")?;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = unsafe { core::ptr::read_volatile(ptr.add(i)) };
        }
        Ok(())
    }

    /// Device-side write of driver memory.
    pub fn write_phys(&self, phys: u64, data: &[u8]) -> Result<(), &'static str> {
        let ptr = self.registry.lookup(phys, data.len()).ok_or("sim: DMA write to unmapped physical address")?;
        for (i, b) in data.iter().enumerate() {
            unsafe { core::ptr::write_volatile(ptr.add(i), *b) };
        }
        Ok(())
    }

    pub fn read_phys_u64(&self, phys: u64) -> Result<u64, &'static str> {
        let mut b = [0u8; 8];
        self.read_phys(phys, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn read_phys_u8(&self, phys: u64) -> Result<u8, &'static str> {
        let mut b = [0u8; 1];
        self.read_phys(phys, &mut b)?;
        Ok(b[0])
    }
}

impl DmaAllocator for HeapDmaAllocator {
    fn allocate(&self, size: usize) -> Result<DmaMemory, &'static str> {
        if size == 0 {
            return Err("sim: zero-sized DMA allocation");
        }
        let granted = self.registry.remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| match r {
            usize::MAX => Some(usize::MAX),
            0 => None,
            r => Some(r - 1),
        });
        if granted.is_err() {
            return Err("sim: injected DMA allocation failure");
        }

        let rounded = crate::pages_for(size) * PAGE_SIZE;
        let layout = Layout::from_size_align(rounded, PAGE_SIZE).map_err(|_| "sim: invalid DMA layout")?;
        let virt = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or("sim: out of heap memory")?;
        // leave an unmapped guard page between regions
        let phys = self.registry.next_phys.fetch_add((rounded + PAGE_SIZE) as u64, Ordering::SeqCst);
        self.registry.regions.lock().insert(phys, Region { virt: virt.as_ptr() as usize, len: rounded });
        self.registry.allocations.fetch_add(1, Ordering::SeqCst);

        let backing: Arc<dyn DmaBacking> = self.registry.clone();
        Ok(unsafe { DmaMemory::from_raw_parts(virt, PhysicalAddress::new(phys), size, backing) })
    }
}

/// A clock that only moves when told to, or when someone sleeps on it.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> ManualClock {
        ManualClock::default()
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep_ms(&self, ms: u64) {
        self.advance(ms);
    }
}

/// One write observed by a [`SimRegisters`] window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmioWrite {
    W32 { offset: usize, value: u32 },
    W64 { offset: usize, value: u64 },
}

/// A plain RAM-backed register window that logs every write, e.g. a doorbell BAR.
pub struct SimRegisters {
    len: usize,
    values: Mutex<BTreeMap<usize, u32>>,
    log: Mutex<Vec<MmioWrite>>,
}

impl SimRegisters {
    pub fn new(len: usize) -> SimRegisters {
        SimRegisters { len, values: Mutex::new(BTreeMap::new()), log: Mutex::new(Vec::new()) }
    }

    /// Sets a register value without logging a write.
    pub fn set32(&self, offset: usize, value: u32) {
        self.values.lock().insert(offset, value);
    }

    pub fn writes(&self) -> Vec<MmioWrite> {
        self.log.lock().clone()
    }

    pub fn take_writes(&self) -> Vec<MmioWrite> {
        core::mem::take(&mut *self.log.lock())
    }
}

impl RegisterSpace for SimRegisters {
    fn read32(&self, offset: usize) -> u32 {
        self.values.lock().get(&offset).copied().unwrap_or(0)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.values.lock().insert(offset, value);
        self.log.lock().push(MmioWrite::W32 { offset, value });
    }

    fn write64(&self, offset: usize, value: u64) {
        {
            let mut values = self.values.lock();
            values.insert(offset, value as u32);
            values.insert(offset + 4, (value >> 32) as u32);
        }
        self.log.lock().push(MmioWrite::W64 { offset, value });
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// The configuration space of a simulated PCI function.
pub struct SimPciFunction {
    config: Mutex<[u32; 64]>,
    inaccessible: AtomicBool,
}

impl SimPciFunction {
    pub fn new(vendor_id: u16, device_id: u16, subsystem_id: u16) -> SimPciFunction {
        let mut config = [0u32; 64];
        config[0] = (device_id as u32) << 16 | vendor_id as u32;
        config[0x2C / 4] = (subsystem_id as u32) << 16 | vendor_id as u32;
        SimPciFunction { config: Mutex::new(config), inaccessible: AtomicBool::new(false) }
    }

    /// Makes every config read return all ones and drops every write, as for a device
    /// that is mid-reset or has fallen off the bus.
    pub fn set_inaccessible(&self, inaccessible: bool) {
        self.inaccessible.store(inaccessible, Ordering::SeqCst);
    }
}

impl PciFunction for SimPciFunction {
    fn read_config_u32(&self, offset: u16) -> u32 {
        if self.inaccessible.load(Ordering::SeqCst) {
            return u32::MAX;
        }
        self.config.lock().get(offset as usize / 4).copied().unwrap_or(u32::MAX)
    }

    fn write_config_u32(&self, offset: u16, value: u32) {
        if self.inaccessible.load(Ordering::SeqCst) {
            return;
        }
        if let Some(dword) = self.config.lock().get_mut(offset as usize / 4) {
            *dword = value;
        }
    }

    fn read_config_u16(&self, offset: u16) -> u16 {
        let shift = (offset & 2) * 8;
        (self.read_config_u32(offset & !3) >> shift) as u16
    }

    fn write_config_u16(&self, offset: u16, value: u16) {
        if self.inaccessible.load(Ordering::SeqCst) {
            return;
        }
        let shift = (offset & 2) * 8;
        if let Some(dword) = self.config.lock().get_mut(offset as usize / 4) {
            *dword = (*dword & !(0xFFFF << shift)) | ((value as u32) << shift);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PCI_COMMAND, PCI_SUBSYSTEM_ID};

    #[test]
    fn test_dma_visible_by_physical_address() {
        let dma = HeapDmaAllocator::new();
        let mut mem = dma.allocate(100).unwrap();
        assert_eq!(mem.len(), 100);
        assert_eq!(mem.phys_addr().value() % PAGE_SIZE as u64, 0);

        mem.write_u64_le(8, 0xDEAD_BEEF_0102_0304);
        assert_eq!(dma.read_phys_u64(mem.phys_addr().value() + 8).unwrap(), 0xDEAD_BEEF_0102_0304);

        dma.write_phys(mem.phys_addr().value() + 3, &[0xAB]).unwrap();
        assert_eq!(mem.read_u8(3), 0xAB);
    }

    #[test]
    fn test_dma_regions_are_released_on_drop() {
        let dma = HeapDmaAllocator::new();
        let a = dma.allocate(PAGE_SIZE).unwrap();
        let b = dma.allocate_pages(3).unwrap();
        assert_eq!(dma.live_regions(), 2);
        let phys = b.phys_addr().value();
        drop(b);
        assert_eq!(dma.live_regions(), 1);
        assert!(dma.read_phys_u8(phys).is_err());
        drop(a);
        assert_eq!(dma.live_regions(), 0);
    }

    #[test]
    fn test_injected_allocation_failure() {
        let dma = HeapDmaAllocator::new();
        dma.fail_after(1);
        let _first = dma.allocate(16).unwrap();
        assert!(dma.allocate(16).is_err());
        dma.never_fail();
        assert!(dma.allocate(16).is_ok());
    }

    #[test]
    fn test_pci_enable_and_inaccessible() {
        let pci = SimPciFunction::new(0x14E4, 0x1750, 0x1234);
        assert!(!pci.is_enabled());
        pci.enable_device().unwrap();
        pci.set_bus_master(true);
        assert!(pci.is_enabled());
        assert!(pci.is_bus_master());
        assert_eq!(pci.read_config_u16(PCI_SUBSYSTEM_ID), 0x1234);

        pci.set_inaccessible(true);
        assert_eq!(pci.read_config_u16(PCI_SUBSYSTEM_ID), 0xFFFF);
        assert!(pci.enable_device().is_err());
        pci.set_inaccessible(false);
        assert_eq!(pci.read_config_u16(PCI_COMMAND) & crate::PCI_COMMAND_BUS_MASTER, crate::PCI_COMMAND_BUS_MASTER);
    }
}
