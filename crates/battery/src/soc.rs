//! State-of-charge fusion.
//!
//! Three precision levels, promoted as better anchors become available:
//!
//! | level | anchor | precision |
//! |-------|--------|-----------|
//! | voltage-only | OCV lookup | coarse |
//! | charge-estimated | coulomb counter anchored at an OCV estimate | good relative |
//! | charge-full | coulomb counter anchored at a detected full charge | good absolute |
//!
//! Voltage anchors are only adopted at rest: a first-order smoothed current
//! must decay below the rest threshold first (the smoother starts biased so
//! a fresh boot waits ~10 measurement cycles). A divergence between counted
//! and voltage-estimated charge demotes the level.

use crate::supervisor::{CELLS_PARALLEL, CELLS_SERIES};

/// Cell voltages outside this window invalidate voltage estimation (mV).
pub const CELL_VOLTAGE_MIN: i16 = 2500;
/// See [`CELL_VOLTAGE_MIN`].
pub const CELL_VOLTAGE_MAX: i16 = 4250;
/// Cells above this count as fully charged (mV).
pub const FULL_CHARGE_VOLTAGE_MIN: i16 = 4150;

/// Current smoothing coefficient (≈ 30 s time constant at 1 Hz updates).
pub const SMOOTHING_ALPHA: f32 = 0.03;
/// Start bias factor of the smoothed current: delays rest detection by
/// roughly ten cycles after boot.
pub const CURRENT_INIT_FACTOR: f32 = 1.4;
/// Smoothed current below this counts as "at rest" (mA).
pub const REST_CURRENT_MA: f32 = 50.0;
/// Tracked-vs-estimated divergence that demotes the level (mAh).
pub const CHARGE_DIFFERENCE_MAX_MAH: f32 = 150.0;

/// Nominal cell capacity (mAh).
pub const CELL_CAPACITY_MAH: f32 = 3450.0;
/// Nominal pack capacity (mAh).
pub const PACK_CAPACITY_MAH: f32 = CELL_CAPACITY_MAH * CELLS_PARALLEL as f32;
/// Nominal pack energy (Wh), at the 3.6 V/cell average discharge voltage.
pub const PACK_ENERGY_WH: f32 =
    PACK_CAPACITY_MAH * 1e-3 * 3.6 * CELLS_SERIES as f32;

/// Open-circuit-voltage curve: (cell mV, state-of-charge fraction).
static OCV_CURVE: [(f32, f32); 13] = [
    (3000.0, 0.00),
    (3300.0, 0.05),
    (3450.0, 0.10),
    (3550.0, 0.20),
    (3630.0, 0.30),
    (3690.0, 0.40),
    (3750.0, 0.50),
    (3820.0, 0.60),
    (3900.0, 0.70),
    (3980.0, 0.80),
    (4080.0, 0.90),
    (4150.0, 0.97),
    (4200.0, 1.00),
];

/// Precision level of the estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SocLevel {
    /// OCV lookup only.
    VoltageOnly,
    /// Coulomb counting from an OCV-estimated reference.
    ChargeEstimated,
    /// Coulomb counting from a detected full charge.
    ChargeFull,
}

/// Wire encoding of the confidence byte (level + 1; 0 = invalid).
#[must_use]
pub fn confidence_wire(level: SocLevel, fraction: f32) -> u8 {
    if fraction.is_nan() {
        return 0;
    }
    match level {
        SocLevel::VoltageOnly => 1,
        SocLevel::ChargeEstimated => 2,
        SocLevel::ChargeFull => 3,
    }
}

struct Reference {
    /// Accumulated charge at the anchor (mAs).
    charge_mas: i64,
    /// Fraction at the anchor.
    fraction: f32,
    /// Whether the anchor came from a full-charge event.
    full: bool,
}

/// The fusion estimator.
pub struct SocEstimator {
    smoothed_current_ma: f32,
    reference: Option<Reference>,
    fraction: f32,
    level: SocLevel,
}

impl SocEstimator {
    /// Fresh estimator with the biased current smoother.
    #[must_use]
    pub fn new() -> Self {
        Self {
            smoothed_current_ma: CURRENT_INIT_FACTOR * REST_CURRENT_MA,
            reference: None,
            fraction: f32::NAN,
            level: SocLevel::VoltageOnly,
        }
    }

    /// Current estimate as a fraction of full (NaN while invalid).
    #[must_use]
    pub fn fraction(&self) -> f32 {
        self.fraction
    }

    /// Current estimate as pack energy in Wh, derated by `health`.
    #[must_use]
    pub fn energy_wh(&self, health: f32) -> f32 {
        self.fraction * PACK_ENERGY_WH * health
    }

    /// Current precision level.
    #[must_use]
    pub fn level(&self) -> SocLevel {
        self.level
    }

    /// Feed one measurement cycle (nominally 1 Hz).
    ///
    /// `accumulated_mas` is the gauge's coulomb counter; `charging` is the
    /// charge-FET-conducting state.
    pub fn update(
        &mut self,
        cells_mv: &[i16; CELLS_SERIES],
        current_ma: i32,
        accumulated_mas: i64,
        charging: bool,
    ) {
        self.smoothed_current_ma = (1.0 - SMOOTHING_ALPHA) * self.smoothed_current_ma
            + SMOOTHING_ALPHA * current_ma as f32;
        let at_rest = self.smoothed_current_ma.abs() < REST_CURRENT_MA;

        let voltage_estimate = Self::voltage_estimate(cells_mv);

        // full-charge promotion: every cell above the full threshold with the
        // tail current decayed away
        let full = charging
            && at_rest
            && cells_mv.iter().all(|&v| v >= FULL_CHARGE_VOLTAGE_MIN);
        if full {
            self.reference = Some(Reference {
                charge_mas: accumulated_mas,
                fraction: 1.0,
                full: true,
            });
        }

        if let Some(reference) = &self.reference {
            let delta_mah = (accumulated_mas - reference.charge_mas) as f32 / 3600.0;
            let tracked = reference.fraction + delta_mah / PACK_CAPACITY_MAH;

            // divergence check against the voltage estimate, only meaningful
            // at rest where the OCV curve applies
            if at_rest {
                if let Some(estimate) = voltage_estimate {
                    let divergence_mah = (tracked - estimate).abs() * PACK_CAPACITY_MAH;
                    if divergence_mah > CHARGE_DIFFERENCE_MAX_MAH {
                        if reference.full {
                            // demote full → estimated, re-anchored on voltage
                            self.reference = Some(Reference {
                                charge_mas: accumulated_mas,
                                fraction: estimate,
                                full: false,
                            });
                            self.level = SocLevel::ChargeEstimated;
                            self.fraction = estimate;
                        } else {
                            // demote estimated → voltage only
                            self.reference = None;
                            self.level = SocLevel::VoltageOnly;
                            self.fraction = estimate;
                        }
                        return;
                    }
                }
            }

            self.level = if reference.full {
                SocLevel::ChargeFull
            } else {
                SocLevel::ChargeEstimated
            };
            self.fraction = tracked.clamp(0.0, 1.0);
            return;
        }

        // no reference yet: voltage-only output, adopt an anchor at rest
        match voltage_estimate {
            Some(estimate) => {
                self.fraction = estimate;
                self.level = SocLevel::VoltageOnly;
                if at_rest {
                    self.reference = Some(Reference {
                        charge_mas: accumulated_mas,
                        fraction: estimate,
                        full: false,
                    });
                    self.level = SocLevel::ChargeEstimated;
                }
            }
            None => {
                self.fraction = f32::NAN;
                self.level = SocLevel::VoltageOnly;
            }
        }
    }

    /// OCV estimate from the weakest cell, `None` outside the valid window.
    fn voltage_estimate(cells_mv: &[i16; CELLS_SERIES]) -> Option<f32> {
        let mut min = i16::MAX;
        for &v in cells_mv {
            if !(CELL_VOLTAGE_MIN..=CELL_VOLTAGE_MAX).contains(&v) {
                return None;
            }
            min = min.min(v);
        }
        Some(ocv_lookup(f32::from(min)))
    }
}

impl Default for SocEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Piecewise-linear interpolation over [`OCV_CURVE`].
fn ocv_lookup(cell_mv: f32) -> f32 {
    let (first_v, first_soc) = OCV_CURVE[0];
    if cell_mv <= first_v {
        return first_soc;
    }
    for pair in OCV_CURVE.windows(2) {
        let (v0, s0) = pair[0];
        let (v1, s1) = pair[1];
        if cell_mv <= v1 {
            return s0 + (s1 - s0) * (cell_mv - v0) / (v1 - v0);
        }
    }
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const REST: [i16; 4] = [3750, 3755, 3752, 3748];

    fn settle(soc: &mut SocEstimator, cells: &[i16; 4], charge_mas: i64) {
        // run past the boot bias so rest detection can engage
        for _ in 0..20 {
            soc.update(cells, 0, charge_mas, false);
        }
    }

    #[test]
    fn boot_bias_delays_reference_adoption() {
        let mut soc = SocEstimator::new();
        soc.update(&REST, 0, 0, false);
        // valid voltage estimate immediately, but still voltage-only
        assert!(!soc.fraction().is_nan());
        assert_eq!(soc.level(), SocLevel::VoltageOnly);

        settle(&mut soc, &REST, 0);
        assert_eq!(soc.level(), SocLevel::ChargeEstimated);
    }

    #[test]
    fn counted_charge_moves_the_estimate() {
        let mut soc = SocEstimator::new();
        settle(&mut soc, &REST, 0);
        let start = soc.fraction();

        // discharge 10% of the pack (in mAs), under load
        let delta = (-0.10 * PACK_CAPACITY_MAH * 3600.0) as i64;
        soc.update(&REST, -2000, delta, false);
        assert_eq!(soc.level(), SocLevel::ChargeEstimated);
        assert!((soc.fraction() - (start - 0.10)).abs() < 0.01);
    }

    #[test]
    fn full_charge_event_promotes_to_full_level() {
        let mut soc = SocEstimator::new();
        let full_cells = [4180i16, 4175, 4182, 4179];
        settle(&mut soc, &full_cells, 0);
        soc.update(&full_cells, 0, 0, true);
        assert_eq!(soc.level(), SocLevel::ChargeFull);
        assert!((soc.fraction() - 1.0).abs() < 1e-6);
        assert_eq!(confidence_wire(soc.level(), soc.fraction()), 3);
    }

    #[test]
    fn divergence_demotes_the_level() {
        let mut soc = SocEstimator::new();
        settle(&mut soc, &REST, 0);
        assert_eq!(soc.level(), SocLevel::ChargeEstimated);

        // cells sag far below what the counter believes
        let sagged = [3450i16, 3450, 3450, 3450];
        soc.update(&sagged, 0, 0, false);
        assert_eq!(soc.level(), SocLevel::VoltageOnly);

        // the next rest cycle re-anchors on the new estimate
        soc.update(&sagged, 0, 0, false);
        assert_eq!(soc.level(), SocLevel::ChargeEstimated);
        assert!((soc.fraction() - 0.10).abs() < 0.02);
    }

    #[test]
    fn invalid_cells_yield_invalid_estimate() {
        let mut soc = SocEstimator::new();
        let dead = [2100i16, 3700, 3700, 3700];
        soc.update(&dead, 0, 0, false);
        assert!(soc.fraction().is_nan());
        assert_eq!(confidence_wire(soc.level(), soc.fraction()), 0);
    }

    #[test]
    fn ocv_curve_is_monotonic() {
        let mut last = -1.0f32;
        for mv in (3000..=4200).step_by(10) {
            let soc = ocv_lookup(mv as f32);
            assert!(soc >= last);
            last = soc;
        }
        assert_eq!(ocv_lookup(2800.0), 0.0);
        assert_eq!(ocv_lookup(4300.0), 1.0);
    }
}
