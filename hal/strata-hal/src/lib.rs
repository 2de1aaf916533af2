//! Strata Hardware Abstraction Layer
//!
//! This crate defines the raw flash device trait implemented by chip-specific
//! backends (QSPI NOR controllers, XIP windows, host mocks). Everything above
//! it is hardware-agnostic.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Service layer (strata-nvms)            │
//! └─────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────┐
//! │  Storage engine (strata-core/-drivers)  │
//! └─────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────┐
//! │  strata-hal (this crate - traits)       │
//! └─────────────────────────────────────────┘
//!                     │
//!         ┌───────────┴───────────┐
//!         ▼                       ▼
//! ┌───────────────┐       ┌───────────────┐
//! │  chip backend │       │   MockFlash   │
//! └───────────────┘       └───────────────┘
//! ```
//!
//! # Traits
//!
//! - [`flash::FlashDevice`] - page program / sector erase / raw read

#![no_std]
#![deny(unsafe_code)]

pub mod flash;
pub mod mock;

pub use flash::{FlashDevice, FlashError, FlashGeometry};
pub use mock::MockFlash;
