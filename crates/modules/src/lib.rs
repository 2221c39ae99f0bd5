//! Module-interface protocol: the register abstraction every node speaks.
//!
//! Each peripheral node exposes an 8-bit-addressed register map with
//! compile-time widths. The controller talks to it through one of two
//! transports — framed/escaped UART or CRC-protected I²C with an interrupt
//! line — using the same command vocabulary:
//!
//! ```text
//! master → slave   READ(reg) · WRITE(reg, data)
//! slave  → master  EVENT(kind, …) · CHANGE_NOTIFICATION(reg, data) · READ_DATA(reg, data)
//! ```
//!
//! The master side ([`UartMaster`], [`I2cMaster`]) keeps a byte-exact shadow
//! of the remote map, a FIFO transfer queue with at most one transfer in
//! flight, retry budgets, and an event queue consumed from the main loop.
//! The slave side ([`UartSlave`]) serves its [`RegisterBank`] and runs the
//! change-notification diff engine. Multi-step sequences (module init,
//! reset recovery) are explicit state machines in [`init`].

#![cfg_attr(not(test), no_std)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod i2c_master;
pub mod i2c_slave;
pub mod init;
pub mod interrupts;
pub mod protocol;
pub mod regmap;
pub mod transfer;
pub mod uart_master;
pub mod uart_slave;

pub use i2c_master::I2cMaster;
pub use i2c_slave::{BusDirection, I2cSlave, SlaveFault};
pub use init::{InitPlan, ModuleInit};
pub use interrupts::{IntController, INT_RESET};
pub use protocol::{ErrorCode, EventKind, ModuleEvent, MsgType};
pub use regmap::{total_size, RegisterLayout, RegisterShadow};
pub use transfer::{Completion, Direction, Token, Transfer};
pub use uart_master::UartMaster;
pub use uart_slave::{NotifyingBank, ReadAccess, ReadKind, RegisterBank, UartSlave, WriteOutcome};
