//! Crate used to acquire SD and MMC cards and read from them in a bootloader
//!
//! The driver is split the same way the bus is: a command model, a host
//! transport (one per controller family), the acquisition state machine that
//! walks a card from power-on to ready, and a block engine that serves byte
//! ranges through a one-sector cache.
//!
//! *byte-addressed cards only: SDHC/SDXC block addressing and writes are not
//! supported.*

#![cfg_attr(not(test), no_std)]

pub mod acquire;
pub mod blockdev;
pub mod card;
pub mod command;
pub mod errors;
pub mod host;
pub mod mmc;
pub mod registers;
pub mod timing;

pub use blockdev::{Descriptor, Partition, SECTOR_LEN};
pub use card::{CardFamily, CardSession};
pub use errors::{FailureClass, MmcError};
pub use host::{Host, HostCaps};
pub use mmc::Mmc;
