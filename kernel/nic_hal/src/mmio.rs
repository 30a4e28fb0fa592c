//! Memory-mapped register windows (PCI BARs).

use core::ptr::NonNull;
use core::sync::atomic::{fence, Ordering};
use volatile::Volatile;

/// A window of device registers.
///
/// Accesses take `&self` because a BAR is shared by everything that talks to the device;
/// callers are responsible for serializing accesses that must not interleave.
pub trait RegisterSpace: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
    fn write64(&self, offset: usize, value: u64);
    /// Length of the window in bytes.
    fn len(&self) -> usize;
}

/// Orders all prior memory writes (including to DMA memory) before any subsequent write,
/// in particular before a doorbell write to MMIO space.
#[inline(always)]
pub fn write_barrier() {
    fence(Ordering::SeqCst);
}

/// Orders a read that observed a device "valid" indication before the reads of the
/// rest of the record it guards.
#[inline(always)]
pub fn read_barrier() {
    fence(Ordering::Acquire);
}

/// A real BAR mapping.
pub struct MmioRegion {
    base: NonNull<u8>,
    len: usize,
}

// All accesses are volatile, and the device registers themselves are the shared state.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Creates a register window over an existing uncached mapping.
    ///
    /// # Safety
    /// `base` must point to a device mapping that is valid for `len` bytes for the
    /// lifetime of the returned value.
    pub unsafe fn new(base: *mut u8, len: usize) -> Result<MmioRegion, &'static str> {
        let base = NonNull::new(base).ok_or("MMIO base address was null")?;
        if base.as_ptr() as usize % 8 != 0 {
            return Err("MMIO base address was not 8-byte aligned");
        }
        Ok(MmioRegion { base, len })
    }

    fn register<T: Copy>(&self, offset: usize) -> Option<*mut Volatile<T>> {
        let size = core::mem::size_of::<T>();
        if offset % size != 0 || offset + size > self.len {
            error!("MmioRegion: invalid {}-byte access at offset {:#X} (window len {:#X})", size, offset, self.len);
            return None;
        }
        Some(unsafe { self.base.as_ptr().add(offset) } as *mut Volatile<T>)
    }
}

impl RegisterSpace for MmioRegion {
    fn read32(&self, offset: usize) -> u32 {
        match self.register::<u32>(offset) {
            Some(reg) => unsafe { (*reg).read() },
            // the same value a master abort would return
            None => u32::MAX,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        if let Some(reg) = self.register::<u32>(offset) {
            unsafe { (*reg).write(value) }
        }
    }

    fn write64(&self, offset: usize, value: u64) {
        if let Some(reg) = self.register::<u64>(offset) {
            unsafe { (*reg).write(value) }
        }
    }

    fn len(&self) -> usize {
        self.len
    }
}
