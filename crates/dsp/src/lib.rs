//! Real-time audio pipeline of the processor node.
//!
//! ```text
//! I²S / USB / S-PDIF ──▶ InputRouter ──▶ SampleRateConverter (96 kHz)
//!                                              │
//!                              SignalProcessor (mixer → biquads → FIR → gain)
//!                                              │
//!                                        OutputFeeder ──▶ serial-audio DMA
//! ```
//!
//! All sample math is Q31 with 64-bit accumulation ([`q31`]); the filter
//! coefficient tables are generated at build time ([`ffir::coeffs`]). The
//! host controls the pipeline through the register bank in [`registers`].

#![cfg_attr(not(test), no_std)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod converter;
pub mod feeder;
pub mod ffir;
pub mod interp;
pub mod pipeline;
pub mod processor;
pub mod q31;
pub mod registers;
pub mod router;

pub use converter::{BatchOutcome, SampleRate, SampleRateConverter, BATCH};
pub use feeder::{Half, OutputFeeder};
pub use ffir::{AdaptiveFfir, Ffir160147, FractionalFir};
pub use pipeline::AudioPipeline;
pub use processor::SignalProcessor;
pub use registers::DapRegisters;
pub use router::{InputRouter, Source};
