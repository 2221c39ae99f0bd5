//! Input source tracking and selection.
//!
//! Five sources feed the pipeline; each is *available* once samples arrive
//! and drops back to unavailable after a full main-loop cycle of silence.
//! When the active source disappears the router falls to the next available
//! source in enum order (or none), and the node reconfigures the converter.

use crate::converter::SampleRate;

/// Audio input sources, in fall-back priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Source {
    /// No input selected.
    #[default]
    None = 0,
    /// First I²S input.
    I2s1 = 1,
    /// Second I²S input.
    I2s2 = 2,
    /// Third I²S input.
    I2s3 = 3,
    /// USB audio.
    Usb = 4,
    /// S/PDIF receiver.
    Spdif = 5,
}

/// Number of sources including [`Source::None`].
pub const SOURCE_COUNT: usize = 6;

impl Source {
    /// Decode a wire value.
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::I2s1),
            2 => Some(Self::I2s2),
            3 => Some(Self::I2s3),
            4 => Some(Self::Usb),
            5 => Some(Self::Spdif),
            _ => None,
        }
    }

    fn from_index(i: usize) -> Self {
        Self::from_u8(i as u8).unwrap_or(Self::None)
    }
}

/// Router actions the node driver must carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RouterEvent {
    /// The active source changed; query its rate, reconfigure the converter
    /// and reset the signal processor (atomically wrt the audio ISR).
    ActiveChanged(Source),
}

/// Errors from explicit activation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RouterError {
    /// The requested source is not currently available.
    NotAvailable,
}

/// Tracks availability, silence and the active selection.
pub struct InputRouter {
    available: [bool; SOURCE_COUNT],
    silent: [bool; SOURCE_COUNT],
    active: Source,
    i2s_rates: [SampleRate; 3],
}

impl InputRouter {
    /// All sources unavailable, nothing active.
    #[must_use]
    pub fn new() -> Self {
        Self {
            available: [false; SOURCE_COUNT],
            silent: [false; SOURCE_COUNT],
            active: Source::None,
            i2s_rates: [SampleRate::Hz48000; 3],
        }
    }

    /// Currently active source.
    #[must_use]
    pub fn active(&self) -> Source {
        self.active
    }

    /// Availability bitmap (bit = source discriminant).
    #[must_use]
    pub fn available_mask(&self) -> u8 {
        let mut mask = 0u8;
        for (i, &a) in self.available.iter().enumerate().skip(1) {
            if a {
                mask |= 1 << (i - 1);
            }
        }
        mask
    }

    /// Whether `source` currently counts as available.
    #[must_use]
    pub fn is_available(&self, source: Source) -> bool {
        self.available[source as usize]
    }

    /// Host-configured nominal rate of one I²S input.
    #[must_use]
    pub fn i2s_rate(&self, index: usize) -> SampleRate {
        self.i2s_rates.get(index).copied().unwrap_or_default()
    }

    /// Set the nominal rate of one I²S input (host register write).
    pub fn set_i2s_rate(&mut self, index: usize, rate: SampleRate) {
        if let Some(slot) = self.i2s_rates.get_mut(index) {
            *slot = rate;
        }
    }

    /// Note that samples arrived from `source`. Returns `true` when those
    /// samples belong to the active source and should reach the converter.
    pub fn note_activity(&mut self, source: Source) -> bool {
        if source == Source::None {
            return false;
        }
        let idx = source as usize;
        self.available[idx] = true;
        self.silent[idx] = false;
        self.active == source
    }

    /// Explicit host selection. `Source::None` always succeeds and stops
    /// routing.
    ///
    /// # Errors
    ///
    /// [`RouterError::NotAvailable`] when the source has no signal.
    pub fn activate(&mut self, source: Source) -> Result<Option<RouterEvent>, RouterError> {
        if source != Source::None && !self.available[source as usize] {
            return Err(RouterError::NotAvailable);
        }
        if source == self.active {
            return Ok(None);
        }
        self.active = source;
        Ok(Some(RouterEvent::ActiveChanged(source)))
    }

    /// Mark a source dead (silence timeout or error) and fall back if it was
    /// active.
    pub fn stop(&mut self, source: Source) -> Option<RouterEvent> {
        if source == Source::None {
            return None;
        }
        let idx = source as usize;
        self.available[idx] = false;
        self.silent[idx] = false;
        if self.active != source {
            return None;
        }
        self.active = self.next_available();
        Some(RouterEvent::ActiveChanged(self.active))
    }

    fn next_available(&self) -> Source {
        for i in 1..SOURCE_COUNT {
            if self.available[i] {
                return Source::from_index(i);
            }
        }
        Source::None
    }

    /// Per-cycle silence sweep: a source whose silent flag survived a whole
    /// cycle is dropped; everything else is re-armed for the next cycle.
    pub fn poll(&mut self) -> Option<RouterEvent> {
        let mut event = None;
        for i in 1..SOURCE_COUNT {
            if !self.available[i] {
                continue;
            }
            if self.silent[i] {
                let ev = self.stop(Source::from_index(i));
                if ev.is_some() {
                    event = ev;
                }
            } else {
                self.silent[i] = true;
            }
        }
        event
    }
}

impl Default for InputRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // tests use unwrap() for readable assertions
mod tests {
    use super::*;

    #[test]
    fn activity_marks_available_and_silence_drops() {
        let mut r = InputRouter::new();
        assert!(!r.note_activity(Source::Usb));
        assert!(r.is_available(Source::Usb));

        // one full cycle without samples: still armed
        assert_eq!(r.poll(), None);
        // second cycle: dropped
        assert_eq!(r.poll(), None);
        assert!(!r.is_available(Source::Usb));
    }

    #[test]
    fn active_source_samples_are_forwarded() {
        let mut r = InputRouter::new();
        r.note_activity(Source::I2s1);
        r.activate(Source::I2s1).unwrap();
        assert!(r.note_activity(Source::I2s1));
        assert!(!r.note_activity(Source::Usb));
    }

    #[test]
    fn silent_active_source_falls_back_in_enum_order() {
        let mut r = InputRouter::new();
        r.note_activity(Source::I2s2);
        r.note_activity(Source::Spdif);
        r.activate(Source::I2s2).unwrap();

        // I2S2 goes quiet, SPDIF keeps playing
        r.poll();
        r.note_activity(Source::Spdif);
        let ev = r.poll();
        assert_eq!(ev, Some(RouterEvent::ActiveChanged(Source::Spdif)));
        assert_eq!(r.active(), Source::Spdif);
    }

    #[test]
    fn last_source_dying_selects_none() {
        let mut r = InputRouter::new();
        r.note_activity(Source::Usb);
        r.activate(Source::Usb).unwrap();
        assert_eq!(
            r.stop(Source::Usb),
            Some(RouterEvent::ActiveChanged(Source::None))
        );
    }

    #[test]
    fn activating_unavailable_source_is_rejected() {
        let mut r = InputRouter::new();
        assert_eq!(r.activate(Source::Spdif), Err(RouterError::NotAvailable));
        assert_eq!(r.activate(Source::None).unwrap(), None);
    }
}
