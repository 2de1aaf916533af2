//! Non-volatile memory service for the Strata storage subsystem
//!
//! The top of the stack: [`StorageManager`] owns the flash adapter, scans
//! (or bootstraps) the partition table, binds a driver to every live
//! partition and exposes the handle-based storage API. [`params`] layers the
//! tag-keyed parameter store on top of those handles.

#![no_std]
#![deny(unsafe_code)]

pub mod manager;
pub mod params;

pub use manager::{PartitionHandle, StorageConfig, StorageManager};
pub use params::{ParamHandle, ParamKind, ParameterArea, ParameterDescriptor};
