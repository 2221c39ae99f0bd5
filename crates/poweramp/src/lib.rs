//! Power-amp node: output monitoring, safety supervision and the PVDD
//! tracking-rail controller.
//!
//! ```text
//! ADC batches ──▶ OutputMonitor ──▶ SafetySupervisor ──▶ amp reset line
//!                                        │
//! rail ADC ────▶ PvddController ─────────┴──▶ tracking DAC
//! ```
//!
//! Every ERR-threshold breach latches a shutdown; warnings are edge
//! reported. The supervisor never owns pins or buses — the node driver
//! mirrors [`SafetySupervisor::is_shutdown`] onto the reset line and
//! forwards [`pvdd::PvddAction::dac_code`] to the DAC.

#![cfg_attr(not(test), no_std)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod monitor;
pub mod pvdd;
pub mod registers;
pub mod safety;

pub use monitor::{ChannelStats, OutputMonitor, CHANNELS};
pub use pvdd::{PvddAction, PvddController, PvddError, PvddEvent};
pub use registers::{amp_layout, AmpRegisters, AMP_MODULE_ID, AMP_SHADOW_SIZE};
pub use safety::{
    SafetyEvent, SafetySupervisor, Severity, SourceBits, ThresholdError,
};
