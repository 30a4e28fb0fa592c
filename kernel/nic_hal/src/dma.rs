//! Physically contiguous memory shared between the driver and a device.

use alloc::sync::Arc;
use core::fmt;
use core::ptr::NonNull;

/// The page size that devices use when describing host memory in page tables.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

/// A physical (bus) address, as seen by the device.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> PhysicalAddress {
        PhysicalAddress(addr)
    }

    pub const fn zero() -> PhysicalAddress {
        PhysicalAddress(0)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the address `bytes` past this one.
    pub const fn offset(&self, bytes: usize) -> PhysicalAddress {
        PhysicalAddress(self.0 + bytes as u64)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "p{:#X}", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#X}", self.0)
    }
}

/// Returns the number of pages required to hold `bytes`.
pub const fn pages_for(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE
}

/// The owner of the memory behind a [`DmaMemory`] region.
///
/// It is told when a region is dropped so that the memory can be unmapped and returned.
pub trait DmaBacking: Send + Sync {
    fn release(&self, virt: NonNull<u8>, phys: PhysicalAddress, len: usize);
}

/// Hands out [`DmaMemory`] regions.
pub trait DmaAllocator: Send + Sync {
    /// Allocates `size` bytes of zeroed, page-aligned, physically contiguous memory.
    fn allocate(&self, size: usize) -> Result<DmaMemory, &'static str>;

    /// Allocates `num_pages` zeroed pages as one contiguous region.
    fn allocate_pages(&self, num_pages: usize) -> Result<DmaMemory, &'static str> {
        self.allocate(num_pages * PAGE_SIZE)
    }
}

/// A region of memory mapped into the driver's address space that the device can also reach
/// through [`DmaMemory::phys_addr()`].
///
/// All accesses are volatile because the device may write to the region at any time.
/// Accessors panic if the requested range lies outside the region, just like slice indexing.
pub struct DmaMemory {
    virt: NonNull<u8>,
    phys: PhysicalAddress,
    len: usize,
    backing: Arc<dyn DmaBacking>,
}

// The region is exclusively owned; the raw pointer is only dereferenced through `&self`/`&mut self`.
unsafe impl Send for DmaMemory {}
unsafe impl Sync for DmaMemory {}

impl DmaMemory {
    /// Wraps an existing mapping.
    ///
    /// # Safety
    /// `virt` must be valid for reads and writes of `len` bytes for as long as the returned
    /// value lives, and `phys` must be the device-visible address of the same memory.
    pub unsafe fn from_raw_parts(
        virt: NonNull<u8>,
        phys: PhysicalAddress,
        len: usize,
        backing: Arc<dyn DmaBacking>,
    ) -> DmaMemory {
        DmaMemory { virt, phys, len, backing }
    }

    pub fn phys_addr(&self) -> PhysicalAddress {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_in_pages(&self) -> usize {
        pages_for(self.len)
    }

    fn check_range(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).map_or(false, |end| end <= self.len),
            "DMA access at offset {:#X} (len {}) is outside a region of {} bytes", offset, len, self.len
        );
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.check_range(offset, 1);
        unsafe { core::ptr::read_volatile(self.virt.as_ptr().add(offset)) }
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.check_range(offset, 1);
        unsafe { core::ptr::write_volatile(self.virt.as_ptr().add(offset), value) }
    }

    /// Copies `buf.len()` bytes starting at `offset` out of the region.
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        self.check_range(offset, buf.len());
        for (i, b) in buf.iter_mut().enumerate() {
            *b = unsafe { core::ptr::read_volatile(self.virt.as_ptr().add(offset + i)) };
        }
    }

    /// Copies `data` into the region starting at `offset`.
    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) {
        self.check_range(offset, data.len());
        for (i, b) in data.iter().enumerate() {
            unsafe { core::ptr::write_volatile(self.virt.as_ptr().add(offset + i), *b) };
        }
    }

    pub fn read_u16_le(&self, offset: usize) -> u16 {
        let mut b = [0u8; 2];
        self.read_bytes(offset, &mut b);
        u16::from_le_bytes(b)
    }

    pub fn read_u32_le(&self, offset: usize) -> u32 {
        let mut b = [0u8; 4];
        self.read_bytes(offset, &mut b);
        u32::from_le_bytes(b)
    }

    pub fn read_u64_le(&self, offset: usize) -> u64 {
        let mut b = [0u8; 8];
        self.read_bytes(offset, &mut b);
        u64::from_le_bytes(b)
    }

    pub fn write_u64_le(&mut self, offset: usize, value: u64) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// Sets every byte of the region to `value`.
    pub fn fill(&mut self, value: u8) {
        for i in 0..self.len {
            unsafe { core::ptr::write_volatile(self.virt.as_ptr().add(i), value) };
        }
    }

    /// Zeroes `len` bytes starting at `offset`.
    pub fn zero_range(&mut self, offset: usize, len: usize) {
        self.check_range(offset, len);
        for i in offset..offset + len {
            unsafe { core::ptr::write_volatile(self.virt.as_ptr().add(i), 0) };
        }
    }
}

impl Drop for DmaMemory {
    fn drop(&mut self) {
        self.backing.release(self.virt, self.phys, self.len);
    }
}

impl fmt::Debug for DmaMemory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DmaMemory")
            .field("phys", &self.phys)
            .field("len", &self.len)
            .finish()
    }
}
