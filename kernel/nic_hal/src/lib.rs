//! Hardware access primitives used by the NIC drivers.
//!
//! A driver never touches raw pointers directly; it goes through the abstractions here:
//! * [`DmaMemory`] regions handed out by a [`DmaAllocator`], which pair a virtual mapping
//!   with the physical address the device uses to reach the same bytes.
//! * [`RegisterSpace`], a BAR (or any other MMIO window) that supports 32-bit and 64-bit accesses.
//! * [`PciFunction`], the configuration space and enable/bus-master controls of one PCI function.
//! * [`Clock`], a millisecond time source that can also put the caller to sleep.
//! * [`poll_until`], the one bounded retry loop that every driver wait is built on.
//!
//! With the `sim` feature (always on for this crate's own tests) the [`sim`] module provides
//! host-side implementations of all of the above so drivers can be exercised without hardware.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;
extern crate spin;
extern crate volatile;

mod dma;
mod mmio;
mod pci;
mod poll;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use dma::*;
pub use mmio::*;
pub use pci::*;
pub use poll::*;
