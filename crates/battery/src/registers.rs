//! Register bank of the battery-monitor node (UART-attached).

use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};
use modules::{
    total_size, ErrorCode, NotifyingBank, ReadAccess, ReadKind, RegisterBank, RegisterLayout,
    WriteOutcome,
};
use platform::timing::MAIN_LOOP_PERIOD_MS;

use crate::health::HealthStore;
use crate::soc::confidence_wire;
use crate::supervisor::{
    BatterySupervisor, ShutdownType, MAX_CHG_CURRENT_MA, MAX_CHG_VOLTAGE_MV, MAX_DSG_CURRENT_MA,
    MIN_DSG_VOLTAGE_MV, PEAK_DSG_CURRENT_MA,
};

pub use crate::supervisor::{CELLS_PARALLEL, CELLS_SERIES};

/// General status (1 B bit field, r).
pub const REG_STATUS: u8 = 0x00;
/// Stack voltage in mV (2 B, r).
pub const REG_STACK_VOLTAGE: u8 = 0x01;
/// Cell voltages in mV (4 × 2 B signed, r).
pub const REG_CELL_VOLTAGES: u8 = 0x02;
/// Pack current in mA, positive = charge (4 B signed, r).
pub const REG_CURRENT: u8 = 0x03;
/// State of charge as a fraction (4 B f32 + 1 B confidence, r).
pub const REG_SOC_FRACTION: u8 = 0x04;
/// State of charge as pack energy in Wh (4 B f32 + 1 B confidence, r).
pub const REG_SOC_ENERGY: u8 = 0x05;
/// Battery health fraction (4 B f32, rw, persisted).
pub const REG_HEALTH: u8 = 0x06;
/// Pack temperature in °C (2 B signed, r).
pub const REG_BAT_TEMP: u8 = 0x07;
/// Gauge die temperature in °C (2 B signed, r).
pub const REG_INT_TEMP: u8 = 0x08;
/// Active safety alerts (2 B bit field, r).
pub const REG_ALERTS: u8 = 0x09;
/// Active safety faults (2 B bit field, r).
pub const REG_FAULTS: u8 = 0x0A;
/// Timed-shutdown information (1 B type + 2 B ms remaining, r).
pub const REG_SHUTDOWN: u8 = 0x0B;
/// Change-notification mask (2 B, rw; served by the slave host).
pub const REG_NOTIF_MASK: u8 = 0x20;
/// General control (1 B bit field, rw).
pub const REG_CONTROL: u8 = 0x30;
/// Series cell count (1 B, r, constant).
pub const REG_CELLS_SERIES: u8 = 0xE0;
/// Parallel cell count (1 B, r, constant).
pub const REG_CELLS_PARALLEL: u8 = 0xE1;
/// End-of-discharge cell voltage in mV (2 B, r, constant).
pub const REG_MIN_VOLTAGE: u8 = 0xE2;
/// Full-charge cell voltage in mV (2 B, r, constant).
pub const REG_MAX_VOLTAGE: u8 = 0xE3;
/// Maximum sustained discharge current in mA (4 B, r, constant).
pub const REG_MAX_DSG_CURRENT: u8 = 0xE4;
/// Maximum peak discharge current in mA (4 B, r, constant).
pub const REG_PEAK_DSG_CURRENT: u8 = 0xE5;
/// Maximum charge current in mA (4 B, r, constant).
pub const REG_MAX_CHG_CURRENT: u8 = 0xE6;
/// Module identity (1 B, r).
pub const REG_MODULE_ID: u8 = 0xFE;

/// MODULE_ID constant of the battery monitor.
pub const BMS_MODULE_ID: u8 = 0xBD;

/// STATUS bits.
pub mod status {
    /// Any safety fault present.
    pub const FAULT: u8 = 0x01;
    /// Any safety alert present.
    pub const ALERT: u8 = 0x02;
    /// Charge fault latched; host must clear before charging resumes.
    pub const CHG_FAULT: u8 = 0x04;
    /// A timed shutdown is scheduled.
    pub const SHUTDOWN: u8 = 0x08;
    /// Gauge communication/checksum error since last STATUS read.
    pub const BMS_I2C_ERR: u8 = 0x20;
    /// Flash/EEPROM error since last STATUS read.
    pub const FLASH_ERR: u8 = 0x40;
    /// Link error since last STATUS read.
    pub const UARTERR: u8 = 0x80;
}

/// CONTROL bits.
pub mod control {
    /// Clear a latched charge fault.
    pub const CLEAR_CHG_FAULT: u8 = 0x01;
    /// Request (1) or cancel (0) a host shutdown.
    pub const REQ_SHUTDOWN: u8 = 0x02;
    /// Request a full pack shutdown (not cancellable).
    pub const FULL_SHUTDOWN: u8 = 0x04;
    /// Reset nibble position; write [`RESET_VALUE`] to reboot.
    pub const RESET_POS: u8 = 4;
    /// Reset nibble magic.
    pub const RESET_VALUE: u8 = 0xA;
}

const fn widths() -> [u8; 256] {
    let mut w = [0u8; 256];
    w[REG_STATUS as usize] = 1;
    w[REG_STACK_VOLTAGE as usize] = 2;
    w[REG_CELL_VOLTAGES as usize] = (2 * CELLS_SERIES) as u8;
    w[REG_CURRENT as usize] = 4;
    w[REG_SOC_FRACTION as usize] = 5;
    w[REG_SOC_ENERGY as usize] = 5;
    w[REG_HEALTH as usize] = 4;
    w[REG_BAT_TEMP as usize] = 2;
    w[REG_INT_TEMP as usize] = 2;
    w[REG_ALERTS as usize] = 2;
    w[REG_FAULTS as usize] = 2;
    w[REG_SHUTDOWN as usize] = 3;
    w[REG_NOTIF_MASK as usize] = 2;
    w[REG_CONTROL as usize] = 1;
    w[REG_CELLS_SERIES as usize] = 1;
    w[REG_CELLS_PARALLEL as usize] = 1;
    w[REG_MIN_VOLTAGE as usize] = 2;
    w[REG_MAX_VOLTAGE as usize] = 2;
    w[REG_MAX_DSG_CURRENT as usize] = 4;
    w[REG_PEAK_DSG_CURRENT as usize] = 4;
    w[REG_MAX_CHG_CURRENT as usize] = 4;
    w[REG_MODULE_ID as usize] = 1;
    w
}

/// Width table of the battery-monitor map.
pub static BMS_WIDTHS: [u8; 256] = widths();
/// Packed shadow size of the battery-monitor map.
pub const BMS_SHADOW_SIZE: usize = total_size(&BMS_WIDTHS);

/// Layout handle for master-side clients.
#[must_use]
pub fn bms_layout() -> RegisterLayout {
    RegisterLayout::new(&BMS_WIDTHS)
}

/// The battery-monitor node's register bank.
pub struct BatteryRegisters<S> {
    /// Gauge supervisor.
    pub supervisor: BatterySupervisor,
    /// Persisted health value.
    pub health: HealthStore<S>,
    bms_error: bool,
    flash_error: bool,
    reset_requested: bool,
}

impl<S: ReadNorFlash + NorFlash> BatteryRegisters<S> {
    /// Wrap supervisor and health storage.
    #[must_use]
    pub fn new(supervisor: BatterySupervisor, health: HealthStore<S>) -> Self {
        Self {
            supervisor,
            health,
            bms_error: false,
            flash_error: false,
            reset_requested: false,
        }
    }

    /// Whether a host-commanded reset is pending (node driver consumes it).
    #[must_use]
    pub fn reset_requested(&self) -> bool {
        self.reset_requested
    }

    /// Record a flash error for the next STATUS read.
    pub fn note_flash_error(&mut self) {
        self.flash_error = true;
    }

    fn status_byte(&mut self, access: &mut ReadAccess<'_>) -> u8 {
        // pull the supervisor's sticky into ours (survives until reported)
        self.bms_error |= self.supervisor.take_comm_error();

        let mut s = 0u8;
        if self.supervisor.status.faults != 0 {
            s |= status::FAULT;
        }
        if self.supervisor.status.alerts != 0 {
            s |= status::ALERT;
        }
        if self.supervisor.status.chg_force_off {
            s |= status::CHG_FAULT;
        }
        if self.supervisor.shutdown_type() != ShutdownType::None {
            s |= status::SHUTDOWN;
        }
        if access.kind == ReadKind::Host {
            // error stickies are reported only to genuine reads and then
            // cleared; change notifications never consume them
            if self.bms_error {
                s |= status::BMS_I2C_ERR;
                self.bms_error = false;
            }
            if self.flash_error {
                s |= status::FLASH_ERR;
                self.flash_error = false;
            }
            if *access.link_error {
                s |= status::UARTERR;
                *access.link_error = false;
            }
        }
        s
    }

    fn soc_with_confidence(&self, energy: bool, out: &mut [u8]) -> usize {
        let soc = &self.supervisor.soc;
        let value = if energy {
            soc.energy_wh(self.health.value())
        } else {
            soc.fraction()
        };
        out[0..4].copy_from_slice(&value.to_le_bytes());
        out[4] = confidence_wire(soc.level(), soc.fraction());
        5
    }
}

impl<S: ReadNorFlash + NorFlash> RegisterBank for BatteryRegisters<S> {
    fn layout(&self) -> RegisterLayout {
        bms_layout()
    }

    fn read(
        &mut self,
        addr: u8,
        out: &mut [u8],
        mut access: ReadAccess<'_>,
    ) -> Result<usize, ErrorCode> {
        let m = &self.supervisor.measurements;
        match addr {
            REG_STATUS => {
                out[0] = self.status_byte(&mut access);
                Ok(1)
            }
            REG_STACK_VOLTAGE => {
                out.copy_from_slice(&m.stack_mv.to_le_bytes());
                Ok(2)
            }
            REG_CELL_VOLTAGES => {
                for (i, &cell) in m.cells_mv.iter().enumerate() {
                    out[2 * i..2 * i + 2].copy_from_slice(&cell.to_le_bytes());
                }
                Ok(2 * CELLS_SERIES)
            }
            REG_CURRENT => {
                out.copy_from_slice(&m.current_ma.to_le_bytes());
                Ok(4)
            }
            REG_SOC_FRACTION => Ok(self.soc_with_confidence(false, out)),
            REG_SOC_ENERGY => Ok(self.soc_with_confidence(true, out)),
            REG_HEALTH => {
                out.copy_from_slice(&self.health.value().to_le_bytes());
                Ok(4)
            }
            REG_BAT_TEMP => {
                out.copy_from_slice(&m.bat_temp_c.to_le_bytes());
                Ok(2)
            }
            REG_INT_TEMP => {
                out.copy_from_slice(&m.int_temp_c.to_le_bytes());
                Ok(2)
            }
            REG_ALERTS => {
                out.copy_from_slice(&self.supervisor.status.alerts.to_le_bytes());
                Ok(2)
            }
            REG_FAULTS => {
                out.copy_from_slice(&self.supervisor.status.faults.to_le_bytes());
                Ok(2)
            }
            REG_SHUTDOWN => {
                out[0] = self.supervisor.shutdown_type() as u8;
                let ms = self
                    .supervisor
                    .shutdown_remaining()
                    .saturating_mul(MAIN_LOOP_PERIOD_MS)
                    .min(u32::from(u16::MAX));
                #[allow(clippy::cast_possible_truncation)]
                out[1..3].copy_from_slice(&(ms as u16).to_le_bytes());
                Ok(3)
            }
            REG_CONTROL => {
                out[0] = if self.supervisor.host_shutdown_requested() {
                    control::REQ_SHUTDOWN
                } else {
                    0
                };
                Ok(1)
            }
            REG_CELLS_SERIES => {
                out[0] = CELLS_SERIES as u8;
                Ok(1)
            }
            REG_CELLS_PARALLEL => {
                out[0] = CELLS_PARALLEL as u8;
                Ok(1)
            }
            REG_MIN_VOLTAGE => {
                out.copy_from_slice(&MIN_DSG_VOLTAGE_MV.to_le_bytes());
                Ok(2)
            }
            REG_MAX_VOLTAGE => {
                out.copy_from_slice(&MAX_CHG_VOLTAGE_MV.to_le_bytes());
                Ok(2)
            }
            REG_MAX_DSG_CURRENT => {
                out.copy_from_slice(&MAX_DSG_CURRENT_MA.to_le_bytes());
                Ok(4)
            }
            REG_PEAK_DSG_CURRENT => {
                out.copy_from_slice(&PEAK_DSG_CURRENT_MA.to_le_bytes());
                Ok(4)
            }
            REG_MAX_CHG_CURRENT => {
                out.copy_from_slice(&MAX_CHG_CURRENT_MA.to_le_bytes());
                Ok(4)
            }
            REG_MODULE_ID => {
                out[0] = BMS_MODULE_ID;
                Ok(1)
            }
            _ => Err(ErrorCode::UART_FORMAT),
        }
    }

    fn write(&mut self, addr: u8, data: &[u8]) -> Result<WriteOutcome, ErrorCode> {
        match addr {
            REG_HEALTH if data.len() == 4 => {
                let value = f32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                self.health.set(value).map_err(|e| {
                    if matches!(e, crate::health::HealthError::Storage) {
                        self.flash_error = true;
                        ErrorCode::FLASH
                    } else {
                        ErrorCode::UART_FORMAT
                    }
                })?;
                Ok(WriteOutcome::Accepted)
            }
            REG_CONTROL if data.len() == 1 => {
                let value = data[0];
                let reset_code = value >> control::RESET_POS;
                if reset_code != 0 && reset_code != control::RESET_VALUE {
                    return Err(ErrorCode::UART_FORMAT);
                }

                if value & control::CLEAR_CHG_FAULT != 0 {
                    self.supervisor.status.chg_force_off = false;
                }
                if value & control::REQ_SHUTDOWN != 0 {
                    self.supervisor.arm_shutdown(ShutdownType::HostRequest);
                } else {
                    self.supervisor.cancel_shutdown(ShutdownType::HostRequest);
                }
                if value & control::FULL_SHUTDOWN != 0 {
                    self.supervisor.arm_shutdown(ShutdownType::FullShutdown);
                }
                if reset_code == control::RESET_VALUE {
                    self.reset_requested = true;
                    return Ok(WriteOutcome::ResetRequested);
                }
                Ok(WriteOutcome::Accepted)
            }
            _ => Err(ErrorCode::UART_FORMAT),
        }
    }
}

impl<S: ReadNorFlash + NorFlash> NotifyingBank for BatteryRegisters<S> {
    fn notified_registers(&self) -> &'static [u8] {
        &[
            REG_STATUS,
            REG_STACK_VOLTAGE,
            REG_CELL_VOLTAGES,
            REG_CURRENT,
            REG_SOC_FRACTION,
            REG_SOC_ENERGY,
            REG_HEALTH,
            REG_BAT_TEMP,
            REG_INT_TEMP,
            REG_ALERTS,
            REG_FAULTS,
            REG_SHUTDOWN,
        ]
    }

    fn notif_mask_addr(&self) -> u8 {
        REG_NOTIF_MASK
    }

    fn notif_mask_allowed(&self) -> u32 {
        0x0FFF
    }

    fn default_notif_mask(&self) -> u32 {
        (1 << REG_FAULTS) | (1 << REG_SHUTDOWN)
    }

    fn differs(&self, addr: u8, last: &[u8], current: &[u8]) -> bool {
        match addr {
            // floats are compared NaN-aware (both-NaN is unchanged);
            // the confidence byte participates bitwise
            REG_SOC_FRACTION | REG_SOC_ENERGY | REG_HEALTH => {
                let value = |b: &[u8]| {
                    f32::from_le_bytes([
                        b.first().copied().unwrap_or(0),
                        b.get(1).copied().unwrap_or(0),
                        b.get(2).copied().unwrap_or(0),
                        b.get(3).copied().unwrap_or(0),
                    ])
                };
                let (a, b) = (value(last), value(current));
                let float_changed = !(a == b || (a.is_nan() && b.is_nan()));
                float_changed || last.get(4) != current.get(4)
            }
            // STATUS and the rest already serve semantically-grouped bytes
            // (error stickies are excluded from notification reads), so the
            // bitwise default is the group comparison
            _ => last != current,
        }
    }
}
