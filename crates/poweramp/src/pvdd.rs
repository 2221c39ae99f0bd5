//! PVDD tracking-supply controller.
//!
//! The amplifier rail follows a DAC-programmed tracking supply. Increases
//! apply in one step; decreases walk down in 3 %-of-measured stages, each
//! stage settling inside a sliding window before the next, with a 30 s hard
//! timeout. A small adaptive offset trims steady-state error, and a
//! measured-vs-target fail check invalidates the rail on real faults while
//! tolerating the expected-overvoltage case (supply input at or above the
//! requested rail).

use libm::{fabsf, floorf};
use platform::timing::{cycles, Cycles};

/// Lowest requestable rail voltage.
pub const MIN_VOLTAGE: f32 = 18.7;
/// Highest requestable rail voltage.
pub const MAX_VOLTAGE: f32 = 53.5;

/// Tracking slope of the supply (V per DAC volt).
pub const TRK_SLOPE: f32 = 10.873;
/// Tracking intercept: rail voltage at DAC code 0.
pub const TRK_INTERCEPT: f32 = 17.918;
/// DAC reference voltage.
pub const DAC_VREF: f32 = 3.3;
/// Requested volts above intercept → 12-bit DAC code.
pub const DAC_FACTOR: f32 = 4095.99 / (TRK_SLOPE * DAC_VREF);

/// Measured voltage above this never raises an error (expected overvoltage
/// with the supply input at/above the requested rail).
pub const MAX_NOERROR_VOLTAGE: f32 = 25.0;
/// Fail margin in normal operation.
pub const FAIL_MARGIN: f32 = 2.0;
/// Widened fail margin during reduction.
pub const FAIL_MARGIN_REDUCTION: f32 = 4.0;
/// Error magnitude that triggers an offset correction step.
pub const CORRECT_MARGIN: f32 = 0.1;
/// Offset correction step size.
pub const OFFSET_STEP: f32 = 0.1;
/// Offset correction magnitude limit.
pub const OFFSET_MAX: f32 = 1.0;

/// Reduction step floor as a fraction of the measured voltage (keeps the
/// request above the supply's overvoltage-protection threshold).
pub const REDUCTION_FACTOR: f32 = 0.97;
/// Settle criterion: window spread below this ends a reduction step.
pub const REDUCTION_MARGIN: f32 = 0.2;
/// Samples in the settling window.
pub const REDUCTION_WINDOW: usize = 10;
/// Lock-out after each reduction step.
pub const REDUCTION_LOCKOUT: Cycles = 10;
/// Reduction gives up after this long; the last reached step becomes the
/// target.
pub const REDUCTION_TIMEOUT: Cycles = cycles(30_000);

/// Lock-out after a direct (increase) request.
pub const REQUEST_LOCKOUT: Cycles = cycles(400) + 10;
/// Short lock-out after an offset correction.
pub const SHORT_LOCKOUT: Cycles = 3;

/// Measurement smoothing in normal operation (≈ 500 ms time constant at the
/// 10 ms loop).
const EMA_ALPHA: f32 = 0.02;

/// Requested-target errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PvddError {
    /// Target NaN or outside `[MIN_VOLTAGE, MAX_VOLTAGE]`.
    InvalidTarget,
    /// Computed DAC code out of range (configuration fault).
    DacRange,
}

/// Interrupt-worthy controller events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PvddEvent {
    /// Voltage fail: controller reset itself and re-targeted the measured
    /// voltage.
    Error,
    /// A reduction finished (or timed out onto its last step).
    ReductionDone,
    /// The adaptive offset hit its limit.
    OffsetLimit,
}

/// Output of one controller step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PvddAction {
    /// New DAC code to program, if it changed.
    pub dac_code: Option<u16>,
    /// Event to raise, if any.
    pub event: Option<PvddEvent>,
}

/// The tracking-rail controller.
pub struct PvddController {
    target: f32,
    requested: f32,
    measured: f32,
    valid: bool,
    offset: f32,
    lockout: Cycles,

    reduction_ongoing: bool,
    reduction_cycles: Cycles,
    reduction_window: [f32; REDUCTION_WINDOW],
    reduction_index: usize,
}

impl PvddController {
    /// Boot state; the first action must be
    /// [`PvddController::set_target`] with the maximum voltage (going up is
    /// always safe after a spurious reset).
    #[must_use]
    pub fn new() -> Self {
        Self {
            target: 0.0,
            requested: 0.0,
            measured: 0.0,
            valid: false,
            offset: 0.0,
            lockout: 0,
            reduction_ongoing: false,
            reduction_cycles: 0,
            reduction_window: [0.0; REDUCTION_WINDOW],
            reduction_index: 0,
        }
    }

    /// Target voltage.
    #[must_use]
    pub fn target(&self) -> f32 {
        self.target
    }

    /// Currently requested voltage (target + offset, or the active reduction
    /// step).
    #[must_use]
    pub fn requested(&self) -> f32 {
        self.requested
    }

    /// Smoothed measured voltage.
    #[must_use]
    pub fn measured(&self) -> f32 {
        self.measured
    }

    /// Whether the measured rail currently matches the request.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Whether a staged reduction is in progress.
    #[must_use]
    pub fn reduction_ongoing(&self) -> bool {
        self.reduction_ongoing
    }

    /// Current adaptive offset.
    #[must_use]
    pub fn offset(&self) -> f32 {
        self.offset
    }

    /// Request a new target voltage.
    ///
    /// Increases (and decreases within the reduction factor) apply
    /// directly; larger decreases start the staged reduction.
    ///
    /// # Errors
    ///
    /// [`PvddError::InvalidTarget`] for NaN/out-of-range voltages,
    /// [`PvddError::DacRange`] if the conversion overflows (never with the
    /// compiled-in calibration).
    pub fn set_target(&mut self, voltage: f32) -> Result<PvddAction, PvddError> {
        if voltage.is_nan() || !(MIN_VOLTAGE..=MAX_VOLTAGE).contains(&voltage) {
            return Err(PvddError::InvalidTarget);
        }

        self.target = voltage;
        self.offset = 0.0;

        if voltage >= self.measured * REDUCTION_FACTOR {
            // increase or very small decrease: single step
            self.lockout = REQUEST_LOCKOUT;
            self.reduction_ongoing = false;
        } else {
            // larger decrease: staged reduction from the measured voltage
            self.reduction_ongoing = true;
            self.reduction_cycles = 0;
            self.reduction_window = [0.0; REDUCTION_WINDOW];
            self.reduction_index = 0;
            self.requested = (self.measured * REDUCTION_FACTOR).max(self.target);
            self.lockout = REDUCTION_LOCKOUT;
        }

        let code = self.write_dac()?;
        Ok(PvddAction {
            dac_code: Some(code),
            event: None,
        })
    }

    /// Per-cycle update with the raw measured rail voltage.
    pub fn poll(&mut self, direct_measurement: f32) -> PvddAction {
        // target sanity: out-of-range means corrupted state, reset
        if !(MIN_VOLTAGE..=MAX_VOLTAGE).contains(&self.target) {
            return self.reset_after_fail();
        }

        let locked_out = if self.lockout > 0 {
            self.lockout -= 1;
            true
        } else {
            false
        };

        if self.reduction_ongoing {
            self.poll_reduction(direct_measurement, locked_out)
        } else if locked_out {
            // rapid change expected: staged smoothing toward the new level
            if self.lockout > 10 {
                self.measured = direct_measurement;
            } else if self.lockout > 5 {
                self.measured = 0.5 * self.measured + 0.5 * direct_measurement;
            } else {
                self.measured = 0.9 * self.measured + 0.1 * direct_measurement;
            }
            PvddAction::default()
        } else {
            self.poll_normal(direct_measurement)
        }
    }

    // ── internals ───────────────────────────────────────────────────────

    fn write_dac(&mut self) -> Result<u16, PvddError> {
        if !self.reduction_ongoing {
            self.requested = self.target + self.offset;
        }
        // the request can never go below the intercept or meaningfully above
        // the maximum target
        self.requested = self.requested.clamp(TRK_INTERCEPT, MAX_VOLTAGE + 1.0);

        let code = floorf(DAC_FACTOR * (self.requested - TRK_INTERCEPT));
        if !(0.0..4096.0).contains(&code) {
            return Err(PvddError::DacRange);
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Ok(code as u16)
    }

    fn reset_after_fail(&mut self) -> PvddAction {
        self.valid = false;
        self.reduction_ongoing = false;
        let fallback = self.measured.clamp(MIN_VOLTAGE, MAX_VOLTAGE);
        let action = self.set_target(fallback).unwrap_or_default();
        PvddAction {
            dac_code: action.dac_code,
            event: Some(PvddEvent::Error),
        }
    }

    /// Fail check against `reference`; true means the controller reset.
    fn voltage_failed(&mut self, reference: f32, margin: f32) -> Option<PvddAction> {
        if fabsf(self.measured - reference) > margin
            && (self.measured < reference || self.measured > MAX_NOERROR_VOLTAGE)
        {
            return Some(self.reset_after_fail());
        }
        None
    }

    fn poll_reduction(&mut self, direct: f32, locked_out: bool) -> PvddAction {
        // faster smoothing: the rail is expected to move
        self.measured = 0.8 * self.measured + 0.2 * direct;
        self.reduction_cycles += 1;

        if !locked_out {
            if let Some(failed) = self.voltage_failed(self.requested, FAIL_MARGIN_REDUCTION) {
                return failed;
            }
            self.valid = true;
        }

        self.reduction_window[self.reduction_index] = direct;
        self.reduction_index = (self.reduction_index + 1) % REDUCTION_WINDOW;

        let spread = self.window_spread();
        if !locked_out && spread < REDUCTION_MARGIN {
            if self.requested == self.target {
                // target reached
                self.reduction_ongoing = false;
                self.lockout = SHORT_LOCKOUT;
                return PvddAction {
                    dac_code: None,
                    event: Some(PvddEvent::ReductionDone),
                };
            }
            // next step down, based on the measured voltage
            self.requested = (self.measured * REDUCTION_FACTOR).max(self.target);
            self.lockout = REDUCTION_LOCKOUT;
            let dac_code = self.write_dac().ok();
            return PvddAction {
                dac_code,
                event: None,
            };
        }

        if self.reduction_cycles > REDUCTION_TIMEOUT {
            // give up: the reached step becomes the target
            self.target = self.requested;
            self.reduction_ongoing = false;
            self.lockout = SHORT_LOCKOUT;
            return PvddAction {
                dac_code: None,
                event: Some(PvddEvent::ReductionDone),
            };
        }

        PvddAction::default()
    }

    fn poll_normal(&mut self, direct: f32) -> PvddAction {
        self.measured = (1.0 - EMA_ALPHA) * self.measured + EMA_ALPHA * direct;

        if let Some(failed) = self.voltage_failed(self.target, FAIL_MARGIN) {
            return failed;
        }
        self.valid = true;

        let error = self.measured - self.target;
        if error < -CORRECT_MARGIN && self.offset < OFFSET_MAX {
            let mut event = None;
            if self.offset + OFFSET_STEP >= OFFSET_MAX {
                self.offset = OFFSET_MAX;
                event = Some(PvddEvent::OffsetLimit);
            } else {
                self.offset += OFFSET_STEP;
            }
            self.lockout = SHORT_LOCKOUT;
            let dac_code = self.write_dac().ok();
            return PvddAction { dac_code, event };
        }
        if error > CORRECT_MARGIN && self.offset > -OFFSET_MAX {
            let mut event = None;
            if self.offset - OFFSET_STEP <= -OFFSET_MAX {
                self.offset = -OFFSET_MAX;
                event = Some(PvddEvent::OffsetLimit);
            } else {
                self.offset -= OFFSET_STEP;
            }
            self.lockout = SHORT_LOCKOUT;
            let dac_code = self.write_dac().ok();
            return PvddAction { dac_code, event };
        }

        PvddAction::default()
    }

    fn window_spread(&self) -> f32 {
        let mut min = self.reduction_window[0];
        let mut max = min;
        for &v in &self.reduction_window[1..] {
            min = min.min(v);
            max = max.max(v);
        }
        max - min
    }
}

impl Default for PvddController {
    fn default() -> Self {
        Self::new()
    }
}
