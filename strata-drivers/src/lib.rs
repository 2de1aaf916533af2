//! Partition driver implementations for the Strata storage engine
//!
//! Two strategies behind the same [`strata_core::PartitionDriver`] trait:
//!
//! - [`direct::DirectDriver`] - write-without-explicit-erase via the
//!   bit-clear feasibility test, with optional sector buffering for the
//!   cases that do need an erase
//! - [`ves::VesDriver`] - log-structured wear-leveling "virtual EEPROM"
//!   store with garbage collection and power-fail-safe recovery

#![no_std]
#![deny(unsafe_code)]

pub mod direct;
pub mod ves;

pub use direct::DirectDriver;
pub use ves::{GcPolicy, VesConfig, VesDriver};
