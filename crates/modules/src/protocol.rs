//! Wire vocabulary shared by both transports.

/// Message type byte.
///
/// The type spaces for the two directions overlap; which one applies is
/// determined by who sent the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MsgType {
    /// Master → slave register read request.
    Read,
    /// Master → slave register write.
    Write,
    /// Slave → master event.
    Event,
    /// Slave → master unsolicited register report.
    ChangeNotification,
    /// Slave → master read response.
    ReadData,
}

impl MsgType {
    /// Master → slave type codes.
    pub const READ: u8 = 0x00;
    /// See [`MsgType::READ`].
    pub const WRITE: u8 = 0x01;
    /// Slave → master type codes.
    pub const EVENT: u8 = 0x00;
    /// See [`MsgType::EVENT`].
    pub const CHANGE_NOTIFICATION: u8 = 0x01;
    /// See [`MsgType::EVENT`].
    pub const READ_DATA: u8 = 0x02;
}

/// Event subtype byte in an `EVENT` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum EventKind {
    /// Slave controller (re)started.
    McuReset = 0x00,
    /// Write acknowledged; parameter is the register address.
    WriteAck = 0x01,
    /// Error report; parameter is a 16-bit [`ErrorCode`].
    Error = 0x02,
    /// Bluetooth subsystem restarted (BT receiver module only).
    BtReset = 0x03,
}

/// 16-bit error code space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    /// Gauge-IC I²C communication or checksum error.
    pub const BMS_I2C: Self = Self(0x0010);
    /// Flash/EEPROM read or write error.
    pub const FLASH: Self = Self(0x3001);
    /// Received command is malformed.
    pub const UART_FORMAT: Self = Self(0x8001);
    /// Internal UART driver error.
    pub const INTERNAL_UART: Self = Self(0x8002);
    /// Command not allowed in the current state.
    pub const COMMAND_NOT_ALLOWED: Self = Self(0x8003);
    /// Received command failed the CRC check.
    pub const UART_CRC: Self = Self(0x8004);

    /// Whether a failed transfer with this code is worth retrying.
    ///
    /// Parameter and state errors are deterministic and fail immediately;
    /// everything else (CRC glitches, internal errors, unknown codes) gets
    /// its retry budget.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::UART_FORMAT | Self::COMMAND_NOT_ALLOWED)
    }
}

/// Events surfaced to the layer above a master client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModuleEvent {
    /// The remote module announced a reset; the client must be re-initialised.
    ModuleReset,
    /// The Bluetooth subsystem of the remote module restarted.
    BtReset,
    /// A register changed remotely (shadow already updated).
    RegisterChanged(u8),
    /// The remote module reported an error event.
    RemoteError(ErrorCode),
    /// Unmasked interrupt flags read from an I²C module.
    Interrupt(u8),
}
