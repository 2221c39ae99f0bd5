//! Per-node drivers: components wired into the 10 ms main loop.

mod amp;
mod audio;
mod battery_node;

pub use amp::{AmpNode, AmpOutputs, NodeInitError};
pub use audio::AudioNode;
pub use battery_node::BatteryNode;
