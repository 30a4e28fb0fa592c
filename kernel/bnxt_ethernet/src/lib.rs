//! This crate defines the software interface between a Broadcom NetXtreme-C/E (bnxt) NIC and its driver:
//! the layout of HWRM firmware commands and completion records, and the objects the driver builds on top of them.
//!
//! * [`hwrm`] sends commands to firmware through the BAR0 mailbox and waits for their DMA'd responses.
//! * [`ring`] and [`page_table`] hold descriptor and completion rings and context memory in DMA pages.
//! * [`doorbell`] encodes the doorbell writes of each chip generation.
//! * [`context_memory`] describes the backing store firmware needs on P5 and newer chips.
//! * [`async_event`] and [`health`] decode firmware events and read the firmware health registers.
//!
//! The field names and values follow the HWRM interface definitions published with the
//! upstream bnxt drivers.

#![cfg_attr(not(test), no_std)]

#[macro_use] extern crate log;
extern crate alloc;
#[macro_use] extern crate static_assertions;
extern crate bit_field;
extern crate bitflags;
extern crate byteorder;
extern crate nic_hal;
extern crate num_enum;
extern crate spin;
extern crate zerocopy;

pub mod messages;
pub mod error;
pub mod hwrm;
pub mod capabilities;
pub mod page_table;
pub mod completion;
pub mod ring;
pub mod doorbell;
pub mod context_memory;
pub mod async_event;
pub mod health;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use error::{ContextMemError, ErrorKind, HealthError, HwrmError, RingError};
pub use hwrm::HwrmChannel;
