//! Shared platform layer for the Boombox nodes.
//!
//! Every microcontroller in the appliance runs the same 10 ms cooperative
//! main loop; this crate holds the pieces all of them share:
//!
//! ```text
//! Node drivers (firmware crate)
//!         ↓
//! Components (link, modules, dsp, poweramp, battery)
//!         ↓
//! Platform (this crate — timing, pins, persisted records, mocks)
//!         ↓
//! Vendor HAL (out of tree)
//! ```
//!
//! # Features
//!
//! - `std`: host-side testing support
//! - `defmt`: `defmt::Format` derives on public types

#![cfg_attr(not(test), no_std)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod pins;
pub mod record;
pub mod timing;

#[cfg(any(test, feature = "std"))]
pub mod mocks;

pub use record::{RecordError, RecordStore};
pub use timing::{cycles, Cycles, MAIN_LOOP_PERIOD_MS};
