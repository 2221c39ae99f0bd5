//! Battery supervisor: gauge state machine, reconciliation and shutdowns.
//!
//! The supervisor owns the gauge driver and keeps the IC in the state the
//! system wants: CRC mode detected, configuration reconciled, FETs enabled,
//! deepsleep tracking the power switch, autonomous sleep off. All bus work
//! happens from the 10 ms main loop; the alert ISR only latches a flag.

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use libm::{logf, roundf};
use platform::timing::{cycles, Cycles};

use crate::config::{
    CAL_CURR_GAIN, CONFIG_OFFSET, CURR_GAIN_OFFSET, DATA_REG_SIZES, EXPECTED_CONFIG,
};
use crate::gauge::{dircmd, subcmd, GaugeDriver, GaugeError, COMM_MAX_TRIES, DATA_MEM_BASE,
    EXPECTED_DEVICE_NUMBER};
use crate::soc::SocEstimator;

/// Init attempts before giving up.
pub const INIT_MAX_TRIES: u8 = 2;
/// Milliseconds to wait for the init-complete alert.
pub const INITCOMP_WAIT_MAX_MS: u32 = 5;

/// Measurement sentinels reported when a read fails.
pub mod sentinel {
    /// Cell voltage read failed.
    pub const VOLTAGE: i16 = i16::MIN;
    /// Stack voltage read failed.
    pub const STACK_VOLTAGE: u16 = 0;
    /// Current read failed.
    pub const CURRENT: i32 = i32::MIN;
    /// Temperature read failed.
    pub const TEMPERATURE: i16 = i16::MIN;
    /// Charge read failed.
    pub const CHARGE: i64 = i64::MIN;
    /// Integration-time read failed.
    pub const TIME: u32 = u32::MAX;
}

/// Series cells in the pack.
pub const CELLS_SERIES: usize = 4;
/// Parallel cells in the pack.
pub const CELLS_PARALLEL: usize = 4;

/// Current LSB in mA (matches the calibrated CC2 gain).
pub const CONV_MA_PER_CURRENT_LSB: i32 = 2;
/// Charge conversion: LSB·[`CONV_CHG_MULT`]/[`CONV_CHG_DIV`] mAs.
pub const CONV_CHG_MULT: i64 = 1;
/// See [`CONV_CHG_MULT`].
pub const CONV_CHG_DIV: i64 = 4;

/// Thermistor pull-up inside the gauge, in Ω.
pub const THERM_PULLUP: f32 = 20_000.0;
/// Thermistor LSB as a fraction of the pull-up reference.
pub const THERM_LSB: f32 = 5.0 / 3.0 / 32_768.0;
/// Steinhart–Hart coefficients of the pack thermistor.
pub const THERM_COEFF: [f32; 4] = [8.211_303e-4, 2.736_018e-4, -2.443_654e-6, 2.818_534e-7];

/// Status refresh period.
pub const LOOP_PERIOD_STATUS: Cycles = cycles(100);
/// Measurement refresh period.
pub const LOOP_PERIOD_MEASUREMENTS: Cycles = cycles(1000);
/// Temperature refresh period (multiple of the measurement period).
pub const LOOP_PERIOD_TEMPERATURES: Cycles = 2 * LOOP_PERIOD_MEASUREMENTS;

/// Maximum full-charge cell voltage (constant register), mV.
pub const MAX_CHG_VOLTAGE_MV: u16 = 4200;
/// End-of-discharge cell voltage, mV.
pub const MIN_DSG_VOLTAGE_MV: u16 = 3000;
/// Hysteresis above the EOD threshold that cancels the shutdown, mV.
pub const MIN_DSG_HYSTERESIS_MV: u16 = 50;
/// Maximum sustained discharge current, mA.
pub const MAX_DSG_CURRENT_MA: u32 = 11_000;
/// Maximum peak discharge current, mA.
pub const PEAK_DSG_CURRENT_MA: u32 = 32_000;
/// Maximum charge current, mA.
pub const MAX_CHG_CURRENT_MA: u32 = 6_000;

/// Charging-current hysteresis that suppresses the EOD shutdown, mA.
pub const CHARGING_CURRENT_ON_MA: i32 = 300;
/// See [`CHARGING_CURRENT_ON_MA`].
pub const CHARGING_CURRENT_OFF_MA: i32 = 150;

/// Timed-shutdown countdowns.
pub const SHUTDOWN_TIME_FULL: Cycles = cycles(8_500);
/// See [`SHUTDOWN_TIME_FULL`].
pub const SHUTDOWN_TIME_EOD: Cycles = cycles(30_100);
/// See [`SHUTDOWN_TIME_FULL`].
pub const SHUTDOWN_TIME_HOST: Cycles = cycles(10_100);

/// Gauge operating mode (shutdown is absent: this controller would be
/// unpowered in it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GaugeMode {
    /// Mode not yet determined (or invalid security state).
    #[default]
    Unknown,
    /// Normal measurement operation.
    Normal,
    /// Autonomous low-power sleep (configured off; transient only).
    Sleep,
    /// Deepsleep (measurement mostly off, FETs off).
    DeepSleep,
    /// Configuration-update mode (data memory writable).
    CfgUpdate,
}

/// Timed shutdown kinds (wire enum of the SHUTDOWN register).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ShutdownType {
    /// Nothing scheduled.
    #[default]
    None = 0,
    /// Whole-pack shutdown through the gauge (not cancellable).
    FullShutdown = 1,
    /// Preemptive end-of-discharge deepsleep.
    EndOfDischarge = 2,
    /// Host-requested deepsleep.
    HostRequest = 3,
}

/// Decoded gauge status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GaugeStatus {
    /// Operating mode.
    pub mode: GaugeMode,
    /// Security sealed state.
    pub sealed: bool,
    /// Safety alert bits (A in the low byte, B in the high byte).
    pub alerts: u16,
    /// Safety fault bits.
    pub faults: u16,
    /// Host FET control enabled.
    pub fets_enabled: bool,
    /// Discharge FET conducting.
    pub dsg_on: bool,
    /// Charge FET conducting.
    pub chg_on: bool,
    /// Charge fault latched by software until the host clears it.
    pub chg_force_off: bool,
    sleep_bit: bool,
    deepsleep_bit: bool,
    sleep_en_bit: bool,
    cfgupdate_bit: bool,
}

/// Decoded measurements (sentinels on read failure).
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Measurements {
    /// Cell voltages in mV.
    pub cells_mv: [i16; CELLS_SERIES],
    /// Stack voltage in mV.
    pub stack_mv: u16,
    /// Pack current in mA (positive = charge).
    pub current_ma: i32,
    /// Pack thermistor temperature in °C.
    pub bat_temp_c: i16,
    /// Gauge die temperature in °C.
    pub int_temp_c: i16,
    /// Accumulated charge in mAs.
    pub accumulated_mas: i64,
    /// Charge integration time in 250 ms units.
    pub accumulation_time: u32,
}

impl Default for Measurements {
    fn default() -> Self {
        Self {
            cells_mv: [sentinel::VOLTAGE; CELLS_SERIES],
            stack_mv: sentinel::STACK_VOLTAGE,
            current_ma: sentinel::CURRENT,
            bat_temp_c: sentinel::TEMPERATURE,
            int_temp_c: sentinel::TEMPERATURE,
            accumulated_mas: sentinel::CHARGE,
            accumulation_time: sentinel::TIME,
        }
    }
}

/// Fault bits (within [`GaugeStatus::faults`]) that latch the charge path
/// off until the host clears them. The gauge recovers these protections on
/// its own; the latch keeps a misbehaving charger from cycling.
pub const CHG_LATCH_FAULTS: u16 = (1 << 7) | (1 << 2) | (1 << 14) | (1 << 12); // COV, OCC, OTC, UTC

/// Supervisor-level events for the node driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SupervisorEvent {
    /// A timed shutdown countdown expired and its action was taken.
    ShutdownFired(ShutdownType),
}

/// The supervisor.
pub struct BatterySupervisor {
    /// Gauge bus driver (CRC mode inside).
    pub gauge: GaugeDriver,
    /// Last decoded status.
    pub status: GaugeStatus,
    /// Last decoded measurements.
    pub measurements: Measurements,
    /// State-of-charge fusion.
    pub soc: SocEstimator,
    /// Desired deepsleep state (power switch / host request).
    pub should_deepsleep: bool,
    /// Desired FET force-off state (power switch off).
    pub should_disable_fets: bool,

    detected_initcomp: bool,
    detected_shutdown_voltage: bool,
    detected_safety_event: bool,
    alert_pending: bool,

    shutdown_type: ShutdownType,
    shutdown_remaining: Cycles,
    host_shutdown_requested: bool,

    comm_error: bool,
    power_on: bool,
}

impl BatterySupervisor {
    /// Fresh supervisor around a gauge at `address`.
    #[must_use]
    pub fn new(address: u8) -> Self {
        Self {
            gauge: GaugeDriver::new(address),
            status: GaugeStatus::default(),
            measurements: Measurements::default(),
            soc: SocEstimator::new(),
            should_deepsleep: false,
            should_disable_fets: false,
            detected_initcomp: false,
            detected_shutdown_voltage: false,
            detected_safety_event: false,
            alert_pending: false,
            shutdown_type: ShutdownType::None,
            shutdown_remaining: 0,
            host_shutdown_requested: false,
            comm_error: false,
            power_on: true,
        }
    }

    /// Sticky gauge-communication error flag, cleared on read (feeds the
    /// STATUS register's error bit).
    pub fn take_comm_error(&mut self) -> bool {
        core::mem::replace(&mut self.comm_error, false)
    }

    /// Non-consuming view of the sticky error flag (event reporting).
    #[must_use]
    pub fn comm_error_pending(&self) -> bool {
        self.comm_error
    }

    /// Scheduled shutdown type.
    #[must_use]
    pub fn shutdown_type(&self) -> ShutdownType {
        self.shutdown_type
    }

    /// Remaining countdown in main-loop cycles.
    #[must_use]
    pub fn shutdown_remaining(&self) -> Cycles {
        self.shutdown_remaining
    }

    /// Whether the host has an active shutdown request.
    #[must_use]
    pub fn host_shutdown_requested(&self) -> bool {
        self.host_shutdown_requested
    }

    /// Note the alert line's falling edge (ISR-safe: flag only).
    pub fn on_alert_edge(&mut self) {
        self.alert_pending = true;
    }

    // ── CRC-mode detection ──────────────────────────────────────────────

    /// Determine whether the gauge expects CRC-protected transfers.
    ///
    /// Tries without CRC first; a wrong or failed DEVICE_NUMBER readback
    /// flips the mode and retries.
    ///
    /// # Errors
    ///
    /// [`GaugeError`] when neither mode yields the expected device number.
    pub fn detect_crc_mode<B: I2c>(&mut self, bus: &mut B) -> Result<(), GaugeError> {
        for crc in [false, true] {
            self.gauge.crc_active = crc;
            let mut raw = [0u8; 2];
            if self
                .gauge
                .subcommand_read(bus, subcmd::DEVICE_NUMBER, &mut raw, COMM_MAX_TRIES)
                .is_ok()
                && u16::from_le_bytes(raw) == EXPECTED_DEVICE_NUMBER
            {
                return Ok(());
            }
        }
        self.comm_error = true;
        Err(GaugeError::BadResponse)
    }

    // ── status / measurements ───────────────────────────────────────────

    /// Refresh [`BatterySupervisor::status`] from the gauge.
    ///
    /// # Errors
    ///
    /// [`GaugeError`] on bus failure (alert/fault bytes degrade to all-ones
    /// instead of failing the whole update).
    pub fn update_status<B: I2c>(&mut self, bus: &mut B) -> Result<(), GaugeError> {
        let mut raw = [0u8; 2];
        self.read_or_flag(bus, dircmd::BATTERY_STATUS, &mut raw)?;
        let word = u16::from_le_bytes(raw);

        self.status.sleep_bit = word & 0x8000 != 0;
        self.status.deepsleep_bit = word & 0x4000 != 0;
        self.status.cfgupdate_bit = word & 0x0020 != 0;
        self.status.sleep_en_bit = word & 0x0040 != 0;

        let security = (word >> 10) & 0x3;
        if security == 1 || security == 3 {
            self.status.sealed = security == 3;
            self.status.mode = if self.status.cfgupdate_bit {
                GaugeMode::CfgUpdate
            } else if self.status.deepsleep_bit {
                GaugeMode::DeepSleep
            } else if self.status.sleep_bit {
                GaugeMode::Sleep
            } else {
                GaugeMode::Normal
            };
        } else {
            self.status.sealed = false;
            self.status.mode = GaugeMode::Unknown;
        }

        self.status.fets_enabled = word & 0x0100 != 0;
        self.status.dsg_on = word & 0x0004 != 0;
        self.status.chg_on = word & 0x0008 != 0;

        let mut result = Ok(());
        self.status.alerts = if word & 0x2000 != 0 {
            match self.read_safety_pair(bus, dircmd::SAFETY_ALERT_A, dircmd::SAFETY_ALERT_B) {
                Ok(bits) => bits,
                Err(e) => {
                    result = Err(e);
                    0xFFFF
                }
            }
        } else {
            0
        };
        self.status.faults = if word & 0x1000 != 0 {
            match self.read_safety_pair(bus, dircmd::SAFETY_STATUS_A, dircmd::SAFETY_STATUS_B) {
                Ok(bits) => bits,
                Err(e) => {
                    result = Err(e);
                    0xFFFF
                }
            }
        } else {
            0
        };

        // implementer-defined fault policy: charge-path faults latch the
        // charge FET off until the host clears them
        if self.status.faults & CHG_LATCH_FAULTS != 0 {
            self.status.chg_force_off = true;
        }

        result
    }

    fn read_safety_pair<B: I2c>(
        &mut self,
        bus: &mut B,
        cmd_a: u8,
        cmd_b: u8,
    ) -> Result<u16, GaugeError> {
        let mut a = [0u8; 1];
        let mut b = [0u8; 1];
        self.read_or_flag(bus, cmd_a, &mut a)?;
        self.read_or_flag(bus, cmd_b, &mut b)?;
        Ok(u16::from_le_bytes([a[0], b[0]]))
    }

    /// Refresh measurements; temperatures only when `include_temps`.
    ///
    /// Failed reads leave their sentinel and the update continues.
    pub fn update_measurements<B: I2c>(&mut self, bus: &mut B, include_temps: bool) {
        let mut raw10 = [0u8; 2 * (CELLS_SERIES + 1)];
        if self
            .read_or_flag(bus, dircmd::CELL1_VOLTAGE, &mut raw10)
            .is_ok()
        {
            for (i, cell) in self.measurements.cells_mv.iter_mut().enumerate() {
                *cell = i16::from_le_bytes([raw10[2 * i], raw10[2 * i + 1]]);
            }
        } else {
            self.measurements.cells_mv = [sentinel::VOLTAGE; CELLS_SERIES];
        }

        let mut raw2 = [0u8; 2];
        if self
            .read_or_flag(bus, dircmd::STACK_VOLTAGE, &mut raw2)
            .is_ok()
        {
            self.measurements.stack_mv = u16::from_le_bytes(raw2);
        } else {
            self.measurements.stack_mv = sentinel::STACK_VOLTAGE;
        }

        if self.power_on {
            if self.read_or_flag(bus, dircmd::CURRENT, &mut raw2).is_ok() {
                self.measurements.current_ma =
                    CONV_MA_PER_CURRENT_LSB * i32::from(i16::from_le_bytes(raw2));
            } else {
                self.measurements.current_ma = sentinel::CURRENT;
            }

            let mut raw12 = [0u8; 12];
            if self
                .gauge
                .subcommand_read(bus, subcmd::PASSQ, &mut raw12, COMM_MAX_TRIES)
                .is_ok()
            {
                let charge = i64::from_le_bytes([
                    raw12[0], raw12[1], raw12[2], raw12[3], raw12[4], raw12[5], raw12[6],
                    raw12[7],
                ]);
                self.measurements.accumulated_mas = charge * CONV_CHG_MULT / CONV_CHG_DIV;
                self.measurements.accumulation_time =
                    u32::from_le_bytes([raw12[8], raw12[9], raw12[10], raw12[11]]);
            } else {
                self.comm_error = true;
                self.measurements.accumulated_mas = sentinel::CHARGE;
                self.measurements.accumulation_time = sentinel::TIME;
            }
        }

        if include_temps {
            if self
                .read_or_flag(bus, dircmd::TS_MEASUREMENT, &mut raw2)
                .is_ok()
            {
                self.measurements.bat_temp_c =
                    thermistor_temp(i16::from_le_bytes(raw2));
            } else {
                self.measurements.bat_temp_c = sentinel::TEMPERATURE;
            }
            if self.read_or_flag(bus, dircmd::INT_TEMP, &mut raw2).is_ok() {
                self.measurements.int_temp_c = i16::from_le_bytes(raw2);
            } else {
                self.measurements.int_temp_c = sentinel::TEMPERATURE;
            }
        }

        // feed the estimator when the inputs are usable
        if self.measurements.current_ma != sentinel::CURRENT
            && self.measurements.accumulated_mas != sentinel::CHARGE
        {
            self.soc.update(
                &self.measurements.cells_mv,
                self.measurements.current_ma,
                self.measurements.accumulated_mas,
                self.status.chg_on && self.measurements.current_ma > 0,
            );
        }
    }

    fn read_or_flag<B: I2c>(
        &mut self,
        bus: &mut B,
        cmd: u8,
        out: &mut [u8],
    ) -> Result<(), GaugeError> {
        match self.gauge.direct_read(bus, cmd, out, COMM_MAX_TRIES) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.comm_error = true;
                Err(e)
            }
        }
    }

    // ── FET and mode control ────────────────────────────────────────────

    /// Set the gauge's host FET-control enable, verified by readback.
    ///
    /// # Errors
    ///
    /// [`GaugeError::BadResponse`] when the readback disagrees.
    pub fn set_fet_control<B: I2c>(
        &mut self,
        bus: &mut B,
        enabled: bool,
    ) -> Result<(), GaugeError> {
        self.update_status(bus)?;
        if self.status.fets_enabled == enabled {
            return Ok(());
        }
        self.gauge.subcommand_only(bus, subcmd::FET_ENABLE, COMM_MAX_TRIES)?;
        self.update_status(bus)?;
        if self.status.fets_enabled != enabled {
            self.comm_error = true;
            return Err(GaugeError::BadResponse);
        }
        Ok(())
    }

    /// Force the discharge/charge FETs off (or release them), verified by
    /// readback.
    ///
    /// # Errors
    ///
    /// See [`BatterySupervisor::set_fet_control`].
    pub fn set_fet_force_off<B: I2c>(
        &mut self,
        bus: &mut B,
        dsg_off: bool,
        chg_off: bool,
    ) -> Result<(), GaugeError> {
        let desired = (u8::from(dsg_off) << 2) | (u8::from(chg_off) << 3);
        let mut read = [0u8; 1];
        self.read_or_flag(bus, dircmd::FET_CONTROL, &mut read)?;
        if read[0] == desired {
            return Ok(());
        }
        self.gauge
            .direct_write(bus, dircmd::FET_CONTROL, &[desired], COMM_MAX_TRIES)?;
        self.read_or_flag(bus, dircmd::FET_CONTROL, &mut read)?;
        if read[0] != desired {
            self.comm_error = true;
            return Err(GaugeError::BadResponse);
        }
        self.update_status(bus)
    }

    /// Enter deepsleep (double command + status verification).
    ///
    /// # Errors
    ///
    /// See [`BatterySupervisor::set_fet_control`].
    pub fn enter_deepsleep<B: I2c>(&mut self, bus: &mut B) -> Result<(), GaugeError> {
        self.update_status(bus)?;
        if self.status.deepsleep_bit {
            return Ok(());
        }
        self.gauge.subcommand_only(bus, subcmd::DEEPSLEEP, COMM_MAX_TRIES)?;
        self.gauge.subcommand_only(bus, subcmd::DEEPSLEEP, COMM_MAX_TRIES)?;
        self.update_status(bus)?;
        if !self.status.deepsleep_bit {
            self.comm_error = true;
            return Err(GaugeError::BadResponse);
        }
        Ok(())
    }

    /// Exit deepsleep and wait for the init-complete alert.
    ///
    /// # Errors
    ///
    /// See [`BatterySupervisor::set_fet_control`].
    pub fn exit_deepsleep<B: I2c, D: DelayNs>(
        &mut self,
        bus: &mut B,
        delay: &mut D,
        alert_low: impl Fn() -> bool,
    ) -> Result<(), GaugeError> {
        self.update_status(bus)?;
        if !self.status.deepsleep_bit {
            return Ok(());
        }
        self.detected_initcomp = false;
        self.gauge
            .subcommand_only(bus, subcmd::EXIT_DEEPSLEEP, COMM_MAX_TRIES)?;
        self.wait_for_initcomp(bus, delay, &alert_low);
        self.update_status(bus)?;
        if self.status.deepsleep_bit {
            self.comm_error = true;
            return Err(GaugeError::BadResponse);
        }
        Ok(())
    }

    /// Command a pack shutdown. `instant` sends the third confirmation and
    /// the caller must then halt; otherwise the gauge's internal delay
    /// applies.
    ///
    /// # Errors
    ///
    /// [`GaugeError`] when the command fails in both CRC modes.
    pub fn enter_shutdown<B: I2c>(&mut self, bus: &mut B, instant: bool) -> Result<(), GaugeError> {
        if self
            .gauge
            .subcommand_only(bus, subcmd::SHUTDOWN, COMM_MAX_TRIES)
            .is_err()
        {
            // a reset may have flipped the CRC mode: try the other one once
            self.gauge.crc_active = !self.gauge.crc_active;
            if let Err(e) = self.gauge.subcommand_only(bus, subcmd::SHUTDOWN, COMM_MAX_TRIES) {
                self.gauge.crc_active = !self.gauge.crc_active;
                self.comm_error = true;
                return Err(e);
            }
        }
        self.gauge.subcommand_only(bus, subcmd::SHUTDOWN, COMM_MAX_TRIES)?;
        if instant {
            self.gauge.subcommand_only(bus, subcmd::SHUTDOWN, COMM_MAX_TRIES)?;
        }
        Ok(())
    }

    // ── alerts ──────────────────────────────────────────────────────────

    /// Service the alert line: read and clear ALARM_STATUS, latch the
    /// interesting bits.
    pub fn service_alert<B: I2c>(&mut self, bus: &mut B) {
        let mut raw = [0u8; 2];
        if self
            .gauge
            .direct_read(bus, dircmd::ALARM_STATUS, &mut raw, COMM_MAX_TRIES)
            .is_err()
        {
            return;
        }
        let alarm = u16::from_le_bytes(raw);
        if alarm & 0x0004 != 0 {
            self.detected_initcomp = true;
        }
        if alarm & 0x0200 != 0 {
            self.detected_shutdown_voltage = true;
        }
        if alarm & 0xF000 != 0 {
            self.detected_safety_event = true;
        }
        // write-1-to-clear
        let _ = self
            .gauge
            .direct_write(bus, dircmd::ALARM_STATUS, &raw, COMM_MAX_TRIES);
    }

    fn wait_for_initcomp<B: I2c, D: DelayNs>(
        &mut self,
        bus: &mut B,
        delay: &mut D,
        alert_low: &impl Fn() -> bool,
    ) {
        for _ in 0..INITCOMP_WAIT_MAX_MS {
            if alert_low() {
                self.service_alert(bus);
            }
            if self.detected_initcomp {
                return;
            }
            delay.delay_ms(1);
        }
    }

    // ── CFGUPDATE + reconciliation ──────────────────────────────────────

    fn enter_cfgupdate<B: I2c, D: DelayNs>(
        &mut self,
        bus: &mut B,
        delay: &mut D,
    ) -> Result<(), GaugeError> {
        self.gauge
            .subcommand_only(bus, subcmd::SET_CFGUPDATE, COMM_MAX_TRIES)?;
        for _ in 0..COMM_MAX_TRIES {
            delay.delay_ms(1);
            self.update_status(bus)?;
            if self.status.cfgupdate_bit {
                return Ok(());
            }
        }
        self.comm_error = true;
        Err(GaugeError::BadResponse)
    }

    fn exit_cfgupdate<B: I2c, D: DelayNs>(
        &mut self,
        bus: &mut B,
        delay: &mut D,
        alert_low: &impl Fn() -> bool,
    ) -> Result<(), GaugeError> {
        self.detected_initcomp = false;
        self.gauge
            .subcommand_only(bus, subcmd::EXIT_CFGUPDATE, COMM_MAX_TRIES)?;
        for _ in 0..COMM_MAX_TRIES {
            delay.delay_ms(1);
            if self.update_status(bus).is_err() {
                // exiting CFGUPDATE may flip the CRC mode under us
                self.detect_crc_mode(bus)?;
                continue;
            }
            if !self.status.cfgupdate_bit {
                self.detect_crc_mode(bus)?;
                self.wait_for_initcomp(bus, delay, alert_low);
                return Ok(());
            }
        }
        self.comm_error = true;
        Err(GaugeError::BadResponse)
    }

    /// Reconcile the gauge's data-memory configuration with the expected
    /// image: read, compare, rewrite differing registers inside CFGUPDATE,
    /// re-read and verify.
    ///
    /// # Errors
    ///
    /// [`GaugeError`] when a transfer fails or the readback still differs.
    pub fn check_and_apply_config<B: I2c, D: DelayNs>(
        &mut self,
        bus: &mut B,
        delay: &mut D,
        alert_low: &impl Fn() -> bool,
    ) -> Result<(), GaugeError> {
        let mut image = [0u8; 0x5E];
        self.gauge
            .data_memory_read(bus, DATA_MEM_BASE, &mut image, COMM_MAX_TRIES)?;

        if config_matches(&image) {
            return Ok(());
        }

        self.enter_cfgupdate(bus, delay)?;
        let mut write_result = Ok(());

        // current gain is calibration-adjacent and checked separately
        let gain = u16::from_le_bytes([image[CURR_GAIN_OFFSET], image[CURR_GAIN_OFFSET + 1]]);
        if gain != CAL_CURR_GAIN {
            write_result = self.gauge.data_memory_write(
                bus,
                DATA_MEM_BASE + CURR_GAIN_OFFSET as u16,
                &CAL_CURR_GAIN.to_le_bytes(),
                COMM_MAX_TRIES,
            );
        }

        let mut i = 0usize;
        while i < EXPECTED_CONFIG.len() && write_result.is_ok() {
            let mut mem_index = CONFIG_OFFSET + i;
            let mut config_index = i;
            if image[mem_index] != EXPECTED_CONFIG[config_index] {
                let Some((start, size)) = register_window(mem_index) else {
                    write_result = Err(GaugeError::BadResponse);
                    break;
                };
                config_index -= mem_index - start;
                mem_index = start;
                #[allow(clippy::cast_possible_truncation)]
                let address = DATA_MEM_BASE + mem_index as u16;
                write_result = self.gauge.data_memory_write(
                    bus,
                    address,
                    &EXPECTED_CONFIG[config_index..config_index + size],
                    COMM_MAX_TRIES,
                );
            }
            i += 1;
        }

        self.exit_cfgupdate(bus, delay, alert_low)?;
        if write_result.is_err() {
            self.detect_crc_mode(bus)?;
            self.comm_error = true;
            return write_result;
        }

        // verify the rewrite took
        self.gauge
            .data_memory_read(bus, DATA_MEM_BASE, &mut image, COMM_MAX_TRIES)?;
        if !config_matches(&image) {
            self.comm_error = true;
            return Err(GaugeError::BadResponse);
        }
        Ok(())
    }

    // ── init ────────────────────────────────────────────────────────────

    fn init_attempt<B: I2c, D: DelayNs>(
        &mut self,
        bus: &mut B,
        delay: &mut D,
        alert_low: &impl Fn() -> bool,
    ) -> Result<(), GaugeError> {
        self.detected_initcomp = false;
        self.detected_safety_event = false;
        self.detected_shutdown_voltage = false;

        self.detect_crc_mode(bus)?;
        self.check_and_apply_config(bus, delay, alert_low)?;
        self.update_measurements(bus, true);

        self.set_fet_force_off(bus, self.should_disable_fets, self.should_disable_fets)?;
        self.set_fet_control(bus, true)?;

        if self.should_deepsleep && !self.status.deepsleep_bit {
            self.enter_deepsleep(bus)?;
        } else if !self.should_deepsleep && self.status.deepsleep_bit {
            self.exit_deepsleep(bus, delay, alert_low)?;
        }
        Ok(())
    }

    /// Full initialisation with retries (gauge reset between attempts).
    ///
    /// # Errors
    ///
    /// [`GaugeError`] when every attempt failed.
    pub fn init<B: I2c, D: DelayNs>(
        &mut self,
        bus: &mut B,
        delay: &mut D,
        alert_low: impl Fn() -> bool,
    ) -> Result<(), GaugeError> {
        let mut last = GaugeError::Bus;
        for _ in 0..INIT_MAX_TRIES {
            match self.init_attempt(bus, delay, &alert_low) {
                Ok(()) => return Ok(()),
                Err(e) => last = e,
            }
            // reset the gauge before retrying, trying both CRC modes
            if self
                .gauge
                .subcommand_only(bus, subcmd::RESET, COMM_MAX_TRIES)
                .is_err()
            {
                self.gauge.crc_active = !self.gauge.crc_active;
                self.gauge.subcommand_only(bus, subcmd::RESET, COMM_MAX_TRIES)?;
            }
        }
        self.comm_error = true;
        Err(last)
    }

    // ── timed shutdowns ─────────────────────────────────────────────────

    /// Arm a timed shutdown. Arming the already-armed type does not restart
    /// its countdown; a FULL shutdown preempts the deepsleep flavours.
    pub fn arm_shutdown(&mut self, kind: ShutdownType) {
        if kind == ShutdownType::None || kind == self.shutdown_type {
            return;
        }
        // full shutdown wins over everything; deepsleep flavours never
        // preempt an armed full shutdown
        if self.shutdown_type == ShutdownType::FullShutdown {
            return;
        }
        if kind == ShutdownType::HostRequest {
            self.host_shutdown_requested = true;
        }
        self.shutdown_type = kind;
        self.shutdown_remaining = match kind {
            ShutdownType::FullShutdown => SHUTDOWN_TIME_FULL,
            ShutdownType::EndOfDischarge => SHUTDOWN_TIME_EOD,
            ShutdownType::HostRequest => SHUTDOWN_TIME_HOST,
            ShutdownType::None => 0,
        };
    }

    /// Cancel a timed shutdown of the given type (FULL is not cancellable).
    pub fn cancel_shutdown(&mut self, kind: ShutdownType) {
        if kind == ShutdownType::HostRequest {
            self.host_shutdown_requested = false;
        }
        if kind == self.shutdown_type && kind != ShutdownType::FullShutdown {
            self.shutdown_type = ShutdownType::None;
            self.shutdown_remaining = 0;
        }
    }

    /// Reset all timed-shutdown state (user flipped the power switch off).
    pub fn reset_shutdown_state(&mut self) {
        if self.shutdown_type != ShutdownType::FullShutdown {
            self.shutdown_type = ShutdownType::None;
            self.shutdown_remaining = 0;
            self.host_shutdown_requested = false;
        }
    }

    fn poll_shutdown<B: I2c>(&mut self, bus: &mut B) -> Option<SupervisorEvent> {
        if self.shutdown_type == ShutdownType::None {
            return None;
        }
        if self.shutdown_remaining > 0 {
            self.shutdown_remaining -= 1;
            return None;
        }
        let fired = self.shutdown_type;
        self.shutdown_type = ShutdownType::None;
        match fired {
            ShutdownType::FullShutdown => {
                let _ = self.enter_shutdown(bus, false);
            }
            ShutdownType::EndOfDischarge | ShutdownType::HostRequest => {
                self.should_deepsleep = true;
            }
            ShutdownType::None => {}
        }
        Some(SupervisorEvent::ShutdownFired(fired))
    }

    // ── main loop ───────────────────────────────────────────────────────

    /// Set whether pack power consumers are on (gates the current reads).
    pub fn set_power_on(&mut self, on: bool) {
        self.power_on = on;
    }

    /// One main-loop cycle.
    pub fn poll<B: I2c, D: DelayNs>(
        &mut self,
        bus: &mut B,
        delay: &mut D,
        loop_count: u32,
        alert_low: bool,
    ) -> Option<SupervisorEvent> {
        if alert_low || self.alert_pending {
            self.alert_pending = false;
            self.service_alert(bus);
        }

        if self.detected_safety_event {
            self.detected_safety_event = false;
            // status refresh below picks up the fault bits and the charge
            // latch policy
        }
        if self.detected_shutdown_voltage {
            self.detected_shutdown_voltage = false;
            self.arm_shutdown(ShutdownType::EndOfDischarge);
        }

        if loop_count % LOOP_PERIOD_MEASUREMENTS == 0 {
            let temps = loop_count % LOOP_PERIOD_TEMPERATURES == 0;
            self.update_measurements(bus, temps);
            self.check_end_of_discharge();
        }

        if loop_count % LOOP_PERIOD_STATUS == 0 {
            if self.update_status(bus).is_err() {
                // a gauge reset may have flipped the CRC mode under us
                let _ = self.detect_crc_mode(bus);
            }

            if self.status.cfgupdate_bit {
                // a stray CFGUPDATE resets the coulomb counter; leave it
                let _ = self.exit_cfgupdate(bus, delay, &|| false);
            }

            if self.should_disable_fets {
                let _ = self.set_fet_force_off(bus, true, true);
            }

            if self.should_deepsleep && !self.status.deepsleep_bit {
                let _ = self.enter_deepsleep(bus);
            } else if !self.should_deepsleep && self.status.deepsleep_bit {
                let _ = self.exit_deepsleep(bus, delay, || false);
            }

            // charge latch forces the charge FET off while discharging stays
            // allowed; releasing happens only via the host
            if !self.should_disable_fets {
                let chg_off = self.status.chg_force_off;
                if (!self.status.dsg_on || !self.status.chg_on) || chg_off {
                    let _ = self.set_fet_force_off(bus, false, chg_off);
                }
            }

            if !self.status.fets_enabled {
                let _ = self.set_fet_control(bus, true);
            }

            if self.status.sleep_en_bit {
                let _ = self
                    .gauge
                    .subcommand_only(bus, subcmd::SLEEP_DISABLE, COMM_MAX_TRIES);
            }
        }

        self.poll_shutdown(bus)
    }

    /// End-of-discharge detection with voltage and charging hysteresis.
    fn check_end_of_discharge(&mut self) {
        let min_cell = self
            .measurements
            .cells_mv
            .iter()
            .copied()
            .filter(|&v| v != sentinel::VOLTAGE)
            .min();
        let Some(min_cell) = min_cell else {
            return;
        };

        let charging = self.measurements.current_ma != sentinel::CURRENT
            && self.measurements.current_ma > CHARGING_CURRENT_ON_MA;
        let discharging_stopped = self.measurements.current_ma != sentinel::CURRENT
            && self.measurements.current_ma > CHARGING_CURRENT_OFF_MA;

        #[allow(clippy::cast_possible_wrap)]
        if min_cell < MIN_DSG_VOLTAGE_MV as i16 && !charging {
            self.arm_shutdown(ShutdownType::EndOfDischarge);
        } else if self.shutdown_type == ShutdownType::EndOfDischarge
            && (min_cell > (MIN_DSG_VOLTAGE_MV + MIN_DSG_HYSTERESIS_MV) as i16
                || discharging_stopped)
        {
            self.cancel_shutdown(ShutdownType::EndOfDischarge);
        }
    }
}

/// Resolve the whole-register write window covering data-memory offset
/// `mem_index`: the size map gives each register's width, with a zero entry
/// marking the second byte of the preceding 2-byte register (step back one).
fn register_window(mem_index: usize) -> Option<(usize, usize)> {
    let size = usize::from(*DATA_REG_SIZES.get(mem_index)?);
    if size != 0 {
        return Some((mem_index, size));
    }
    let start = mem_index.checked_sub(1)?;
    if DATA_REG_SIZES[start] == 2 {
        Some((start, 2))
    } else {
        None
    }
}

/// Whether a data-memory image matches the expected configuration.
fn config_matches(image: &[u8; 0x5E]) -> bool {
    let gain = u16::from_le_bytes([image[CURR_GAIN_OFFSET], image[CURR_GAIN_OFFSET + 1]]);
    gain == CAL_CURR_GAIN
        && image[CONFIG_OFFSET..CONFIG_OFFSET + EXPECTED_CONFIG.len()] == EXPECTED_CONFIG
}

/// Thermistor ADC reading → °C via Steinhart–Hart.
#[must_use]
pub fn thermistor_temp(adc_value: i16) -> i16 {
    if adc_value <= 0 {
        return sentinel::TEMPERATURE;
    }
    let ratio = THERM_LSB * f32::from(adc_value);
    let resistance = THERM_PULLUP / (1.0 / ratio - 1.0);
    let ln_r = logf(resistance);
    let [a, b, c, d] = THERM_COEFF;
    let temp_k = 1.0 / (a + ln_r * (b + ln_r * (c + ln_r * d)));
    #[allow(clippy::cast_possible_truncation)]
    let temp = roundf(temp_k - 273.15) as i16;
    temp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arming_same_type_does_not_restart_countdown() {
        let mut s = BatterySupervisor::new(0x08);
        s.arm_shutdown(ShutdownType::HostRequest);
        let initial = s.shutdown_remaining();
        // burn a few cycles off the counter without a bus (drain manually)
        s.shutdown_remaining -= 5;
        s.arm_shutdown(ShutdownType::HostRequest);
        assert_eq!(s.shutdown_remaining(), initial - 5);
    }

    #[test]
    fn full_shutdown_is_not_cancellable_or_preemptable() {
        let mut s = BatterySupervisor::new(0x08);
        s.arm_shutdown(ShutdownType::FullShutdown);
        s.cancel_shutdown(ShutdownType::FullShutdown);
        assert_eq!(s.shutdown_type(), ShutdownType::FullShutdown);
        s.arm_shutdown(ShutdownType::HostRequest);
        assert_eq!(s.shutdown_type(), ShutdownType::FullShutdown);
        s.reset_shutdown_state();
        assert_eq!(s.shutdown_type(), ShutdownType::FullShutdown);
    }

    #[test]
    fn cancel_only_affects_the_named_type() {
        let mut s = BatterySupervisor::new(0x08);
        s.arm_shutdown(ShutdownType::EndOfDischarge);
        s.cancel_shutdown(ShutdownType::HostRequest);
        assert_eq!(s.shutdown_type(), ShutdownType::EndOfDischarge);
        s.cancel_shutdown(ShutdownType::EndOfDischarge);
        assert_eq!(s.shutdown_type(), ShutdownType::None);
    }

    #[test]
    fn register_window_walks_the_size_map() {
        // one-byte register maps to itself
        assert_eq!(register_window(0x04), Some((0x04, 1)));
        // first byte of a two-byte register
        assert_eq!(register_window(0x00), Some((0x00, 2)));
        // second byte steps back to the register start
        assert_eq!(register_window(0x01), Some((0x00, 2)));
        assert_eq!(register_window(0x07), Some((0x06, 2)));
        // unmapped region yields no window
        assert_eq!(register_window(0x60), None);
        assert_eq!(register_window(0x200), None);
    }

    #[test]
    fn thermistor_conversion_is_plausible() {
        // mid-range reading lands in a sane temperature band
        let t = thermistor_temp(8000);
        assert!((-40..=120).contains(&t), "temp {t}");
        assert_eq!(thermistor_temp(0), sentinel::TEMPERATURE);
        assert_eq!(thermistor_temp(-5), sentinel::TEMPERATURE);
    }

    #[test]
    fn chg_latch_policy_sets_force_off() {
        let mut s = BatterySupervisor::new(0x08);
        s.status.faults = 1 << 7; // cell overvoltage
        // policy applied on status decode; emulate the decode tail
        if s.status.faults & CHG_LATCH_FAULTS != 0 {
            s.status.chg_force_off = true;
        }
        assert!(s.status.chg_force_off);
    }
}
