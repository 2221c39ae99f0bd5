//! Gauge-IC configuration: the expected data-memory image and its layout.
//!
//! The gauge keeps its configuration in data memory starting at the
//! calibration base. Calibration words (current gains at offsets 0x06 and
//! 0x0A, cell deltas at the top) are factory-programmed and handled
//! separately; everything else is reconciled against [`EXPECTED_CONFIG`] at
//! offset [`CONFIG_OFFSET`].

// ── calibration ─────────────────────────────────────────────────────────
/// CC2 current gain targeting 2 mA per user-unit (calibrated).
pub const CAL_CURR_GAIN: u16 = 105;
/// CC1 charge-integrator gain targeting 1 mA per user-unit (calibrated).
pub const CAL_CC1_GAIN: u16 = 210;
/// Offset of the CC2 current-gain word inside the data-memory image.
pub const CURR_GAIN_OFFSET: usize = 0x06;

// ── general settings ────────────────────────────────────────────────────
/// Power config: full loop speeds, shutdown on HW OT and LFO fault,
/// deepsleep LFO on, sleep disabled.
pub const SET_POWER_CONFIG: u8 = 0x0E;
/// REGOUT enabled at 3.3 V.
pub const SET_REGOUT_CONFIG: u8 = 0x0E;
/// 7-bit bus address of the gauge.
pub const SET_I2C_ADDRESS: u8 = 0x08;
/// I²C config: 2 s timeouts, CRC mode on.
pub const SET_I2C_CONFIG: u16 = 0x3403;
/// Data acquisition: thermistor mode, continuous CC, full resolution.
pub const SET_DA_CONFIG: u16 = 0x0000;
/// Four series cells.
pub const SET_VCELL_MODE: u8 = 0x04;
/// Alarm mask: safety faults/alerts, shutdown voltage, init complete.
pub const SET_DEFAULT_ALARM_MASK: u16 = 0xF204;
/// FET options: host-driven FETs, series topology, recovery allowed.
pub const SET_FET_OPTIONS: u8 = 0x59;
/// Charge-detector time (disabled detector; keep the default step).
pub const SET_CHGDET_TIME: u8 = 1;
/// Balancing: host command allowed, 1 ms measurement delay.
pub const SET_BAL_CONFIG: u8 = 0x02;
/// Balancing TS window (≈ 0…45 °C with the 103AT thermistor).
pub const SET_BAL_MINTEMP_TS: u8 = 44;
/// See [`SET_BAL_MINTEMP_TS`].
pub const SET_BAL_MAXTEMP_TS: u8 = 15;
/// Balancing internal-temperature ceiling in °C.
pub const SET_BAL_MAXTEMP_INT: u8 = 85;

// ── protections ─────────────────────────────────────────────────────────
/// All current/voltage protections enabled.
pub const PROT_ENABLE_A: u8 = 0xFF;
/// All temperature/diagnostic protections enabled.
pub const PROT_ENABLE_B: u8 = 0x3F;
/// Discharge-FET protection triggers.
pub const PROT_DSGFET_A: u8 = 0xFF;
/// Charge-FET protection triggers.
pub const PROT_CHGFET_A: u8 = 0xEF;
/// Both-FET diagnostic triggers.
pub const PROT_BOTHFET_B: u8 = 0x07;
/// Body-diode threshold in user units (2 mA each).
pub const PROT_BODYDIODE_THRESHOLD: u16 = 32;
/// Open-wire check period in full-scan cycles.
pub const PROT_COW_NORMAL_TIME: u8 = 32;
/// Open-wire sleep config (sleep unused).
pub const PROT_COW_SLEEP_CONFIG: u8 = 0x10;
/// Host watchdog ≈ 20 s.
pub const PROT_HWD_TIMEOUT: u8 = 16;
/// Cell undervoltage: 2550 mV, 10 scan delay, 100 mV hysteresis.
pub const PROT_CUV_THRESHOLD: u16 = 2550;
/// See [`PROT_CUV_THRESHOLD`].
pub const PROT_CUV_DELAY: u8 = 10;
/// See [`PROT_CUV_THRESHOLD`].
pub const PROT_CUV_HYSTERESIS: u8 = 0x2;
/// Cell overvoltage: 4230 mV, 10 scan delay, 100 mV hysteresis.
pub const PROT_COV_THRESHOLD: u16 = 4230;
/// See [`PROT_COV_THRESHOLD`].
pub const PROT_COV_DELAY: u8 = 10;
/// See [`PROT_COV_THRESHOLD`].
pub const PROT_COV_HYSTERESIS: u8 = 0x2;
/// Overcurrent in charge: 10 A, ≈ 18.6 ms.
pub const PROT_OCC_THRESHOLD: u8 = 5;
/// See [`PROT_OCC_THRESHOLD`].
pub const PROT_OCC_DELAY: u8 = 58;
/// Overcurrent in discharge 1: 50 A, ≈ 2.7 ms.
pub const PROT_OCD1_THRESHOLD: u8 = 25;
/// See [`PROT_OCD1_THRESHOLD`].
pub const PROT_OCD1_DELAY: u8 = 6;
/// Overcurrent in discharge 2: 32 A, ≈ 201 ms.
pub const PROT_OCD2_THRESHOLD: u8 = 16;
/// See [`PROT_OCD2_THRESHOLD`].
pub const PROT_OCD2_DELAY: u8 = 133;
/// Short circuit in discharge: 100 A, 31 µs.
pub const PROT_SCD_THRESHOLD: u8 = 5;
/// See [`PROT_SCD_THRESHOLD`].
pub const PROT_SCD_DELAY: u8 = 2;
/// Four auto-recoveries before latching, 5 s retry.
pub const PROT_CURR_LATCH_LIMIT: u8 = 2;
/// See [`PROT_CURR_LATCH_LIMIT`].
pub const PROT_CURR_RECOVERY_TIME: u8 = 5;
/// Temperature protections (thermistor-step units, see the gauge TRM).
pub const PROT_OTC_THRESHOLD: u8 = 72;
/// See [`PROT_OTC_THRESHOLD`].
pub const PROT_OTC_DELAY: u8 = 15;
/// See [`PROT_OTC_THRESHOLD`].
pub const PROT_OTC_RECOVERY: u8 = 82;
/// See [`PROT_OTC_THRESHOLD`].
pub const PROT_UTC_THRESHOLD: u8 = 147;
/// See [`PROT_OTC_THRESHOLD`].
pub const PROT_UTC_DELAY: u8 = 15;
/// See [`PROT_OTC_THRESHOLD`].
pub const PROT_UTC_RECOVERY: u8 = 134;
/// See [`PROT_OTC_THRESHOLD`].
pub const PROT_OTD_THRESHOLD: u8 = 48;
/// See [`PROT_OTC_THRESHOLD`].
pub const PROT_OTD_DELAY: u8 = 15;
/// See [`PROT_OTC_THRESHOLD`].
pub const PROT_OTD_RECOVERY: u8 = 55;
/// See [`PROT_OTC_THRESHOLD`].
pub const PROT_UTD_THRESHOLD: u8 = 197;
/// See [`PROT_OTC_THRESHOLD`].
pub const PROT_UTD_DELAY: u8 = 15;
/// See [`PROT_OTC_THRESHOLD`].
pub const PROT_UTD_RECOVERY: u8 = 186;
/// Internal overtemperature: 105 °C, recover at 100 °C.
pub const PROT_OTINT_THRESHOLD: u8 = 105;
/// See [`PROT_OTINT_THRESHOLD`].
pub const PROT_OTINT_DELAY: u8 = 15;
/// See [`PROT_OTINT_THRESHOLD`].
pub const PROT_OTINT_RECOVERY: u8 = 100;

// ── power ───────────────────────────────────────────────────────────────
/// Sleep settings (sleep is disabled; defaults kept).
pub const PWR_SLEEP_CURRENT: u16 = 64;
/// See [`PWR_SLEEP_CURRENT`].
pub const PWR_SLEEP_VOLTAGE_TIME: u8 = 5;
/// See [`PWR_SLEEP_CURRENT`].
pub const PWR_WAKEUP_CURRENT: u8 = 1;
/// Hardware shutdown voltage thresholds (below the software EOD limits).
pub const PWR_SHUTDOWN_CELL_VOLTAGE: u16 = 2490;
/// See [`PWR_SHUTDOWN_CELL_VOLTAGE`].
pub const PWR_SHUTDOWN_STACK_VOLTAGE: u16 = 10_000;
/// Backup internal-temperature shutdown in °C.
pub const PWR_SHUTDOWN_INT_TEMP: u8 = 130;
/// Auto-shutdown disabled.
pub const PWR_SHUTDOWN_AUTO_TIME: u8 = 0;

// ── security ────────────────────────────────────────────────────────────
/// Unsealed operation.
pub const SEC_CONFIG: u8 = 0x00;
/// Default full-access keys.
pub const SEC_FULLACCESS_KEY_1: u16 = 0x0414;
/// See [`SEC_FULLACCESS_KEY_1`].
pub const SEC_FULLACCESS_KEY_2: u16 = 0x3672;

/// Offset of [`EXPECTED_CONFIG`] within the data-memory image read from the
/// calibration base.
pub const CONFIG_OFFSET: usize = 0x14;

/// Expected state of the contiguous configuration block (calibration
/// excluded).
pub static EXPECTED_CONFIG: [u8; 74] = build_expected_config();

// statement-expanding helpers for the builder below
macro_rules! put8 {
    ($c:ident, $i:ident, $v:expr) => {
        $c[$i] = $v;
        $i += 1;
    };
}
macro_rules! put16 {
    ($c:ident, $i:ident, $v:expr) => {
        $c[$i] = ($v & 0xFF) as u8;
        $i += 1;
        $c[$i] = (($v >> 8) & 0xFF) as u8;
        $i += 1;
    };
}

const fn build_expected_config() -> [u8; 74] {
    let mut c = [0u8; 74];
    let mut i = 0;
    put8!(c, i, SET_POWER_CONFIG);
    put8!(c, i, SET_REGOUT_CONFIG);
    put8!(c, i, SET_I2C_ADDRESS);
    put16!(c, i, SET_I2C_CONFIG);
    put16!(c, i, SET_DA_CONFIG);
    put8!(c, i, SET_VCELL_MODE);
    put16!(c, i, SET_DEFAULT_ALARM_MASK);
    put8!(c, i, SET_FET_OPTIONS);
    put8!(c, i, SET_CHGDET_TIME);
    put8!(c, i, SET_BAL_CONFIG);
    put8!(c, i, SET_BAL_MINTEMP_TS);
    put8!(c, i, SET_BAL_MAXTEMP_TS);
    put8!(c, i, SET_BAL_MAXTEMP_INT);
    put8!(c, i, PROT_ENABLE_A);
    put8!(c, i, PROT_ENABLE_B);
    put8!(c, i, PROT_DSGFET_A);
    put8!(c, i, PROT_CHGFET_A);
    put8!(c, i, PROT_BOTHFET_B);
    put16!(c, i, PROT_BODYDIODE_THRESHOLD);
    put8!(c, i, PROT_COW_NORMAL_TIME);
    put8!(c, i, PROT_COW_SLEEP_CONFIG);
    put8!(c, i, PROT_HWD_TIMEOUT);
    put16!(c, i, PROT_CUV_THRESHOLD);
    put8!(c, i, PROT_CUV_DELAY);
    put8!(c, i, PROT_CUV_HYSTERESIS);
    put16!(c, i, PROT_COV_THRESHOLD);
    put8!(c, i, PROT_COV_DELAY);
    put8!(c, i, PROT_COV_HYSTERESIS);
    put8!(c, i, PROT_OCC_THRESHOLD);
    put8!(c, i, PROT_OCC_DELAY);
    put8!(c, i, PROT_OCD1_THRESHOLD);
    put8!(c, i, PROT_OCD1_DELAY);
    put8!(c, i, PROT_OCD2_THRESHOLD);
    put8!(c, i, PROT_OCD2_DELAY);
    put8!(c, i, PROT_SCD_THRESHOLD);
    put8!(c, i, PROT_SCD_DELAY);
    put8!(c, i, PROT_CURR_LATCH_LIMIT);
    put8!(c, i, PROT_CURR_RECOVERY_TIME);
    put8!(c, i, PROT_OTC_THRESHOLD);
    put8!(c, i, PROT_OTC_DELAY);
    put8!(c, i, PROT_OTC_RECOVERY);
    put8!(c, i, PROT_UTC_THRESHOLD);
    put8!(c, i, PROT_UTC_DELAY);
    put8!(c, i, PROT_UTC_RECOVERY);
    put8!(c, i, PROT_OTD_THRESHOLD);
    put8!(c, i, PROT_OTD_DELAY);
    put8!(c, i, PROT_OTD_RECOVERY);
    put8!(c, i, PROT_UTD_THRESHOLD);
    put8!(c, i, PROT_UTD_DELAY);
    put8!(c, i, PROT_UTD_RECOVERY);
    put8!(c, i, PROT_OTINT_THRESHOLD);
    put8!(c, i, PROT_OTINT_DELAY);
    put8!(c, i, PROT_OTINT_RECOVERY);
    put16!(c, i, PWR_SLEEP_CURRENT);
    put8!(c, i, PWR_SLEEP_VOLTAGE_TIME);
    put8!(c, i, PWR_WAKEUP_CURRENT);
    put16!(c, i, PWR_SHUTDOWN_CELL_VOLTAGE);
    put16!(c, i, PWR_SHUTDOWN_STACK_VOLTAGE);
    put8!(c, i, PWR_SHUTDOWN_INT_TEMP);
    put8!(c, i, PWR_SHUTDOWN_AUTO_TIME);
    put8!(c, i, SEC_CONFIG);
    put16!(c, i, SEC_FULLACCESS_KEY_1);
    put16!(c, i, SEC_FULLACCESS_KEY_2);
    let _ = i;
    c
}

/// Sizes of the data-memory registers in bytes, indexed by data-memory
/// offset; 0 marks the second byte of the preceding 2-byte register. Config
/// writes must target whole registers, so a differing byte at a 0-entry
/// steps back to the register start.
#[rustfmt::skip]
pub static DATA_REG_SIZES: [u8; 115] = [
 // _0 _1 _2 _3 _4 _5 _6 _7 _8 _9 _A _B _C _D _E _F
    2, 0, 2, 0, 1, 1, 2, 0, 2, 0, 2, 0, 2, 0, 2, 0, // 0_
    2, 0, 2, 0, 1, 1, 1, 2, 0, 2, 0, 1, 2, 0, 1, 1, // 1_
    1, 1, 1, 1, 1, 1, 1, 1, 1, 2, 0, 1, 1, 1, 2, 0, // 2_
    1, 1, 2, 0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 3_
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 2, // 4_
    0, 1, 1, 2, 0, 2, 0, 1, 1, 1, 2, 0, 2, 0, 0, 0, // 5_
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 6_
    0, 1, 1,                                        // 7_
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_block_spans_the_mapped_registers() {
        assert_eq!(EXPECTED_CONFIG.len(), 74);
        // every config byte falls on a mapped data-memory offset
        for i in 0..EXPECTED_CONFIG.len() {
            let mem = CONFIG_OFFSET + i;
            assert!(mem < DATA_REG_SIZES.len());
        }
        // two-byte registers are followed by their 0 marker
        for (i, &size) in DATA_REG_SIZES.iter().enumerate() {
            if size == 2 {
                assert_eq!(DATA_REG_SIZES.get(i + 1), Some(&0));
            }
        }
    }
}
