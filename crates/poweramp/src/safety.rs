//! Safety supervisor: threshold engine over three time scales.
//!
//! For each of {I_rms, P_avg, P_app} × {inst, fast, slow} × {A–D, sum} two
//! thresholds exist: ERR (latching shutdown) and WARN (edge-reported).
//! Error thresholds are clamped to the compile-time ceilings on every
//! accepted write and sanity-checked before every use; a failed sanity check
//! restores the defaults and latches a shutdown with the special
//! "all types, no channel" source.

use crate::monitor::{ChannelStats, OutputMonitor, CHANNELS};

/// Threshold measurement kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Kind {
    /// RMS output current.
    Current,
    /// Average real power.
    RealPower,
    /// Apparent power.
    ApparentPower,
}

/// Threshold time scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Scale {
    /// Single ADC batch.
    Inst,
    /// 0.1 s EMA.
    Fast,
    /// 1 s EMA.
    Slow,
}

/// Threshold severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Severity {
    /// Breach latches a safety shutdown.
    Error,
    /// Breach is reported but not latched.
    Warning,
}

/// Entries per threshold row: channels A–D plus the channel sum.
pub const THRESHOLD_SLOTS: usize = CHANNELS + 1;

const INF: f32 = f32::INFINITY;

/// Absolute ceilings defined by the output stage design: the per-channel
/// limits protect inductors and traces, the sum limits the switching IC's
/// thermal budget. Apparent power is advisory and unbounded.
pub const CEILING_CURRENT: [[f32; THRESHOLD_SLOTS]; 3] = [
    [12.0, 12.0, 12.0, 12.0, 15.0],
    [9.5, 9.5, 9.5, 9.5, 11.0],
    [7.5, 7.5, 7.5, 7.5, 9.0],
];
/// See [`CEILING_CURRENT`].
pub const CEILING_REAL_POWER: [[f32; THRESHOLD_SLOTS]; 3] = [
    [300.0, 300.0, 300.0, 300.0, 500.0],
    [230.0, 230.0, 230.0, 230.0, 350.0],
    [200.0, 200.0, 200.0, 200.0, 270.0],
];
/// See [`CEILING_CURRENT`].
pub const CEILING_APPARENT_POWER: [[f32; THRESHOLD_SLOTS]; 3] = [
    [INF, INF, INF, INF, INF],
    [INF, INF, INF, INF, INF],
    [INF, INF, INF, INF, INF],
];

/// Maximum quiescent current accepted during init, in A.
pub const MAX_INIT_CURRENT: f32 = 0.05;
/// Maximum quiescent voltage accepted during init, in V.
pub const MAX_INIT_VOLTAGE: f32 = 0.5;

fn ceiling(kind: Kind) -> &'static [[f32; THRESHOLD_SLOTS]; 3] {
    match kind {
        Kind::Current => &CEILING_CURRENT,
        Kind::RealPower => &CEILING_REAL_POWER,
        Kind::ApparentPower => &CEILING_APPARENT_POWER,
    }
}

/// Error/warning source word (SERR_SOURCE / SWARN_SOURCE registers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SourceBits(pub u16);

impl SourceBits {
    /// Channel-sum bit.
    pub const CHAN_SUM: u16 = 1 << 0;
    const CHAN: [u16; CHANNELS] = [1 << 4, 1 << 3, 1 << 2, 1 << 1];
    const MTYPE: [[u16; 3]; 3] = [
        // [kind][scale]: current, real power, apparent power × inst/fast/slow
        [1 << 13, 1 << 12, 1 << 11],
        [1 << 10, 1 << 9, 1 << 8],
        [1 << 7, 1 << 6, 1 << 5],
    ];
    /// All measurement-type bits with no channel: the failed-sanity marker.
    pub const MTYPE_ALL: u16 = 0x3FE0;

    fn mtype(kind: Kind, scale: Scale) -> u16 {
        let k = match kind {
            Kind::Current => 0,
            Kind::RealPower => 1,
            Kind::ApparentPower => 2,
        };
        let s = match scale {
            Scale::Inst => 0,
            Scale::Fast => 1,
            Scale::Slow => 2,
        };
        Self::MTYPE[k][s]
    }

    fn channel(index: usize) -> u16 {
        if index < CHANNELS {
            Self::CHAN[index]
        } else {
            Self::CHAN_SUM
        }
    }
}

/// Threshold write errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ThresholdError {
    /// Thresholds may only change while manual shutdown is asserted.
    NotInShutdown,
    /// Value is NaN or negative.
    InvalidValue,
}

/// Interrupt-worthy supervisor events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SafetyEvent {
    /// An ERR threshold was breached; shutdown latched.
    Error,
    /// A WARN threshold was breached this tick.
    Warning,
}

/// One severity's full threshold block.
#[derive(Debug, Clone, Copy)]
struct Block {
    /// `[kind][scale][slot]`.
    values: [[[f32; THRESHOLD_SLOTS]; 3]; 3],
}

impl Block {
    fn defaults_for(severity: Severity) -> Self {
        let values = match severity {
            Severity::Error => [CEILING_CURRENT, CEILING_REAL_POWER, CEILING_APPARENT_POWER],
            Severity::Warning => [[[INF; THRESHOLD_SLOTS]; 3]; 3],
        };
        Self { values }
    }

    fn row(&self, kind: Kind, scale: Scale) -> &[f32; THRESHOLD_SLOTS] {
        &self.values[kind_index(kind)][scale_index(scale)]
    }

    fn row_mut(&mut self, kind: Kind, scale: Scale) -> &mut [f32; THRESHOLD_SLOTS] {
        &mut self.values[kind_index(kind)][scale_index(scale)]
    }
}

fn kind_index(kind: Kind) -> usize {
    match kind {
        Kind::Current => 0,
        Kind::RealPower => 1,
        Kind::ApparentPower => 2,
    }
}

fn scale_index(scale: Scale) -> usize {
    match scale {
        Scale::Inst => 0,
        Scale::Fast => 1,
        Scale::Slow => 2,
    }
}

/// The supervisor state machine.
pub struct SafetySupervisor {
    errors: Block,
    warnings: Block,
    safety_shutdown: bool,
    manual_shutdown: bool,
    err_source: SourceBits,
    warn_inst: SourceBits,
    warn_loop: SourceBits,
}

impl SafetySupervisor {
    /// Boot state: shutdown latched until init completes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            errors: Block::defaults_for(Severity::Error),
            warnings: Block::defaults_for(Severity::Warning),
            safety_shutdown: true,
            manual_shutdown: true,
            err_source: SourceBits::default(),
            warn_inst: SourceBits::default(),
            warn_loop: SourceBits::default(),
        }
    }

    /// Whether the safety latch is set.
    #[must_use]
    pub fn safety_shutdown(&self) -> bool {
        self.safety_shutdown
    }

    /// Whether the host holds the amp in manual shutdown.
    #[must_use]
    pub fn manual_shutdown(&self) -> bool {
        self.manual_shutdown
    }

    /// Combined shutdown rule; the amp reset line mirrors this.
    #[must_use]
    pub fn is_shutdown(&self, pvdd_valid: bool) -> bool {
        self.safety_shutdown || self.manual_shutdown || !pvdd_valid
    }

    /// Latched error source bits.
    #[must_use]
    pub fn err_source(&self) -> SourceBits {
        self.err_source
    }

    /// Warning source bits (union of both check cadences).
    #[must_use]
    pub fn warn_source(&self) -> SourceBits {
        SourceBits(self.warn_inst.0 | self.warn_loop.0)
    }

    /// Host control of manual shutdown. Entering manual shutdown also clears
    /// a latched safety shutdown so the amp can run again on release.
    pub fn set_manual_shutdown(&mut self, shutdown: bool) {
        self.manual_shutdown = shutdown;
        if shutdown {
            self.safety_shutdown = false;
            self.err_source = SourceBits::default();
        }
    }

    /// Finish initialisation after the EMA settle delay: quiescence check,
    /// then release the boot latch.
    ///
    /// # Errors
    ///
    /// `Err(())` when the output is not quiet; the latch stays set.
    #[allow(clippy::result_unit_err)] // quiet-or-not is the whole answer
    pub fn finish_init(&mut self, monitor: &OutputMonitor) -> Result<(), ()> {
        let fast = monitor.fast();
        let mut max_i = 0.0f32;
        let mut max_v = 0.0f32;
        for ch in 0..CHANNELS {
            max_i = max_i.max(fast.rms_current[ch]);
            max_v = max_v.max(fast.rms_voltage[ch]);
        }
        if max_i > MAX_INIT_CURRENT || max_v > MAX_INIT_VOLTAGE {
            return Err(());
        }
        self.err_source = SourceBits::default();
        self.warn_inst = SourceBits::default();
        self.warn_loop = SourceBits::default();
        self.safety_shutdown = false;
        Ok(())
    }

    /// Read one threshold.
    #[must_use]
    pub fn threshold(&self, severity: Severity, kind: Kind, scale: Scale, slot: usize) -> f32 {
        let block = match severity {
            Severity::Error => &self.errors,
            Severity::Warning => &self.warnings,
        };
        block.row(kind, scale).get(slot).copied().unwrap_or(INF)
    }

    /// Write one threshold, gated on manual shutdown. Error thresholds are
    /// clamped to their ceiling; warnings only need to be non-negative.
    ///
    /// # Errors
    ///
    /// [`ThresholdError::NotInShutdown`] outside the gate,
    /// [`ThresholdError::InvalidValue`] for NaN/negative values.
    pub fn write_threshold(
        &mut self,
        severity: Severity,
        kind: Kind,
        scale: Scale,
        slot: usize,
        value: f32,
    ) -> Result<(), ThresholdError> {
        if !self.manual_shutdown {
            return Err(ThresholdError::NotInShutdown);
        }
        if value.is_nan() || value <= 0.0 || slot >= THRESHOLD_SLOTS {
            return Err(ThresholdError::InvalidValue);
        }
        match severity {
            Severity::Error => {
                let limit = ceiling(kind)[scale_index(scale)][slot];
                self.errors.row_mut(kind, scale)[slot] = value.min(limit);
            }
            Severity::Warning => {
                self.warnings.row_mut(kind, scale)[slot] = value;
            }
        }
        Ok(())
    }

    /// Check the latest ADC batch (instantaneous scale). Call after every
    /// monitor feed.
    pub fn check_inst(&mut self, monitor: &OutputMonitor) -> Option<SafetyEvent> {
        if !self.sanity_check(&[Scale::Inst]) {
            return Some(self.sanity_failure());
        }
        self.warn_inst = SourceBits::default();
        let stats = monitor.inst();
        self.check_scale(&stats, Scale::Inst)
    }

    /// Check the smoothed scales; call once per main-loop cycle.
    pub fn check_loop(&mut self, monitor: &OutputMonitor) -> Option<SafetyEvent> {
        if !self.sanity_check(&[Scale::Inst, Scale::Fast, Scale::Slow]) {
            return Some(self.sanity_failure());
        }
        self.warn_loop = SourceBits::default();
        let fast = monitor.fast();
        if let Some(event) = self.check_scale(&fast, Scale::Fast) {
            if event == SafetyEvent::Error {
                return Some(event);
            }
            let slow_event = self.check_scale(&monitor.slow(), Scale::Slow);
            return slow_event.or(Some(event));
        }
        self.check_scale(&monitor.slow(), Scale::Slow)
    }

    // ── internals ───────────────────────────────────────────────────────

    fn sanity_check(&self, scales: &[Scale]) -> bool {
        for kind in [Kind::Current, Kind::RealPower, Kind::ApparentPower] {
            for &scale in scales {
                let limits = &ceiling(kind)[scale_index(scale)];
                let row = self.errors.row(kind, scale);
                for slot in 0..THRESHOLD_SLOTS {
                    let v = row[slot];
                    if v.is_nan() || v < 0.0 || v > limits[slot] {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn sanity_failure(&mut self) -> SafetyEvent {
        self.err_source = SourceBits(SourceBits::MTYPE_ALL);
        self.safety_shutdown = true;
        self.errors = Block::defaults_for(Severity::Error);
        self.warnings = Block::defaults_for(Severity::Warning);
        SafetyEvent::Error
    }

    fn check_scale(&mut self, stats: &ChannelStats, scale: Scale) -> Option<SafetyEvent> {
        let mut sums = [0.0f32; 3];
        let mut warned = false;

        for ch in 0..CHANNELS {
            let values = [
                stats.rms_current[ch],
                stats.real_power[ch],
                stats.apparent_power[ch],
            ];
            for (k, &v) in values.iter().enumerate() {
                sums[k] += v;
            }

            if self.breach(&values, scale, ch, Severity::Error) {
                self.safety_shutdown = true;
                return Some(SafetyEvent::Error);
            }
            warned |= self.breach(&values, scale, ch, Severity::Warning);
        }

        if self.breach(&sums, scale, CHANNELS, Severity::Error) {
            self.safety_shutdown = true;
            return Some(SafetyEvent::Error);
        }
        warned |= self.breach(&sums, scale, CHANNELS, Severity::Warning);

        if warned {
            Some(SafetyEvent::Warning)
        } else {
            None
        }
    }

    /// Compare one slot's three measurement kinds against one severity's
    /// thresholds, recording source bits. Returns whether anything breached.
    fn breach(&mut self, values: &[f32; 3], scale: Scale, slot: usize, severity: Severity) -> bool {
        let kinds = [Kind::Current, Kind::RealPower, Kind::ApparentPower];
        let mut bits = 0u16;
        for (k, kind) in kinds.into_iter().enumerate() {
            let limit = match severity {
                Severity::Error => self.errors.row(kind, scale)[slot],
                Severity::Warning => self.warnings.row(kind, scale)[slot],
            };
            if values[k] > limit {
                bits |= SourceBits::mtype(kind, scale);
            }
        }
        if bits == 0 {
            return false;
        }
        bits |= SourceBits::channel(slot);
        match severity {
            Severity::Error => self.err_source.0 |= bits,
            Severity::Warning => match scale {
                Scale::Inst => self.warn_inst.0 |= bits,
                _ => self.warn_loop.0 |= bits,
            },
        }
        true
    }
}

impl Default for SafetySupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // tests use unwrap() for readable assertions
mod tests {
    use super::*;

    fn quiet_monitor() -> OutputMonitor {
        OutputMonitor::new(1000)
    }

    fn loud_monitor(current: f32) -> OutputMonitor {
        let mut m = OutputMonitor::new(1000);
        let v = [1.0f32; 32];
        let i = [current; 32];
        m.feed_batch(0, &v, &i);
        m
    }

    fn armed() -> SafetySupervisor {
        let mut s = SafetySupervisor::new();
        s.finish_init(&quiet_monitor()).unwrap();
        s.set_manual_shutdown(false);
        s
    }

    #[test]
    fn err_breach_latches_with_source_bits() {
        let mut s = SafetySupervisor::new();
        s.set_manual_shutdown(true);
        s.write_threshold(Severity::Error, Kind::Current, Scale::Inst, 0, 8.0)
            .unwrap();
        s.finish_init(&quiet_monitor()).unwrap();
        s.set_manual_shutdown(false);

        // channel A at 10 A against an 8 A limit
        let m = loud_monitor(10.0);
        assert_eq!(s.check_inst(&m), Some(SafetyEvent::Error));
        assert!(s.safety_shutdown());
        assert!(s.is_shutdown(true));
        let bits = s.err_source().0;
        assert_ne!(bits & SourceBits::mtype(Kind::Current, Scale::Inst), 0);
        assert_ne!(bits & SourceBits::CHAN[0], 0);
        assert_eq!(bits & SourceBits::CHAN_SUM, 0);
    }

    #[test]
    fn warnings_edge_report_without_latching() {
        let mut s = SafetySupervisor::new();
        s.set_manual_shutdown(true);
        s.write_threshold(Severity::Warning, Kind::Current, Scale::Inst, 0, 1.0)
            .unwrap();
        s.finish_init(&quiet_monitor()).unwrap();
        s.set_manual_shutdown(false);

        let m = loud_monitor(2.0);
        assert_eq!(s.check_inst(&m), Some(SafetyEvent::Warning));
        assert!(!s.safety_shutdown());
        assert_ne!(s.warn_source().0, 0);

        // quiet batch: the warning clears on the next check (edge, not latch)
        let quiet = loud_monitor(0.0);
        assert_eq!(s.check_inst(&quiet), None);
        assert_eq!(s.warn_source().0 & SourceBits::mtype(Kind::Current, Scale::Inst), 0);
    }

    #[test]
    fn threshold_writes_gated_on_manual_shutdown() {
        let mut s = armed();
        assert_eq!(
            s.write_threshold(Severity::Error, Kind::Current, Scale::Inst, 0, 5.0),
            Err(ThresholdError::NotInShutdown)
        );
        s.set_manual_shutdown(true);
        s.write_threshold(Severity::Error, Kind::Current, Scale::Inst, 0, 5.0)
            .unwrap();
        assert_eq!(s.threshold(Severity::Error, Kind::Current, Scale::Inst, 0), 5.0);
    }

    #[test]
    fn error_thresholds_clamp_to_ceiling() {
        let mut s = SafetySupervisor::new();
        s.set_manual_shutdown(true);
        s.write_threshold(Severity::Error, Kind::Current, Scale::Inst, 0, 99.0)
            .unwrap();
        assert_eq!(
            s.threshold(Severity::Error, Kind::Current, Scale::Inst, 0),
            CEILING_CURRENT[0][0]
        );
        // warnings are unconstrained upward
        s.write_threshold(Severity::Warning, Kind::Current, Scale::Inst, 0, 99.0)
            .unwrap();
        assert_eq!(s.threshold(Severity::Warning, Kind::Current, Scale::Inst, 0), 99.0);
    }

    #[test]
    fn sum_breach_reports_sum_channel() {
        let mut s = SafetySupervisor::new();
        s.set_manual_shutdown(true);
        s.write_threshold(Severity::Error, Kind::Current, Scale::Inst, 4, 10.0)
            .unwrap();
        s.finish_init(&quiet_monitor()).unwrap();
        s.set_manual_shutdown(false);

        // 4 channels × 3 A = 12 A sum against a 10 A sum limit
        let mut m = OutputMonitor::new(1000);
        for ch in 0..CHANNELS {
            m.feed_batch(ch, &[1.0f32; 16], &[3.0f32; 16]);
        }
        assert_eq!(s.check_inst(&m), Some(SafetyEvent::Error));
        assert_ne!(s.err_source().0 & SourceBits::CHAN_SUM, 0);
    }

    #[test]
    fn manual_shutdown_clears_latched_fault() {
        let mut s = armed();
        let m = loud_monitor(20.0);
        assert_eq!(s.check_inst(&m), Some(SafetyEvent::Error));
        assert!(s.safety_shutdown());

        s.set_manual_shutdown(true);
        assert!(!s.safety_shutdown());
        assert_eq!(s.err_source().0, 0);
        assert!(s.is_shutdown(true)); // still manually down
    }

    #[test]
    fn is_shutdown_includes_pvdd_validity() {
        let s = armed();
        assert!(!s.is_shutdown(true));
        assert!(s.is_shutdown(false));
    }
}
