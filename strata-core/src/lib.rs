//! Board-agnostic core of the Strata storage engine
//!
//! This crate contains the pieces that do not depend on a driver strategy or
//! on concrete hardware:
//!
//! - Flash adapter: page-write sequencing, erase rounding, write-feasibility
//!   analysis, cache coherency
//! - Append-only partition table parsing and extension
//! - The partition-driver capability trait and shared sector buffers
//! - The storage error type

#![no_std]
#![deny(unsafe_code)]

pub mod device;
pub mod driver;
pub mod error;
pub mod table;

pub use device::{Feasibility, Flash, FlashRegion};
pub use driver::{BufferPolicy, PartitionDriver, SectorScratch};
pub use error::{Result, StorageError};
