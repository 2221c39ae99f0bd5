//! GPIO helpers shared by the nodes.

use embedded_hal::digital::{InputPin, OutputPin};

use crate::timing::Cycles;

/// Open-drain, active-low host interrupt line.
///
/// The line is asserted (driven low) while any unmasked flag is pending and
/// released otherwise. Wraps a plain [`OutputPin`]; the open-drain
/// configuration itself is pin setup and lives with the vendor HAL.
pub struct InterruptLine<P: OutputPin> {
    pin: P,
}

impl<P: OutputPin> InterruptLine<P> {
    /// Take ownership of the (already configured) pin, released.
    ///
    /// # Errors
    ///
    /// Propagates the HAL error if the initial release fails.
    pub fn new(mut pin: P) -> Result<Self, P::Error> {
        pin.set_high()?;
        Ok(Self { pin })
    }

    /// Drive the line to match `asserted` (true = pulled low).
    ///
    /// # Errors
    ///
    /// Propagates the HAL pin error.
    pub fn set_asserted(&mut self, asserted: bool) -> Result<(), P::Error> {
        if asserted {
            self.pin.set_low()
        } else {
            self.pin.set_high()
        }
    }
}

/// State of the latching power switch after debouncing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SwitchState {
    /// Switch closed (pin low): the user wants the system on.
    On,
    /// Switch open (pin high): the user wants the system off.
    Off,
}

/// Debouncer for the main power switch.
///
/// An edge interrupt arms the debounce counter; [`PowerSwitch::poll`] is then
/// called once per main-loop cycle and commits the new state only after the
/// pin has been stable for the full debounce window. A level change that was
/// never announced by an interrupt re-arms the counter instead of being taken
/// at face value.
pub struct PowerSwitch<P: InputPin> {
    pin: P,
    debounce_cycles: Cycles,
    remaining: Cycles,
    last_level_low: bool,
    state: SwitchState,
}

impl<P: InputPin> PowerSwitch<P> {
    /// Create the debouncer, sampling the pin for the initial state.
    ///
    /// # Errors
    ///
    /// Propagates the HAL error of the initial pin read.
    pub fn new(mut pin: P, debounce_cycles: Cycles) -> Result<Self, P::Error> {
        let low = pin.is_low()?;
        Ok(Self {
            pin,
            debounce_cycles,
            remaining: 0,
            last_level_low: low,
            state: if low { SwitchState::On } else { SwitchState::Off },
        })
    }

    /// Note an edge interrupt on the switch pin.
    pub fn on_edge(&mut self) {
        self.remaining = self.debounce_cycles;
    }

    /// Debounced switch state as of the last completed window.
    #[must_use]
    pub fn state(&self) -> SwitchState {
        self.state
    }

    /// `true` while a debounce window is still running.
    #[must_use]
    pub fn is_settling(&self) -> bool {
        self.remaining > 0
    }

    /// Per-cycle update; returns the new state when a change commits.
    ///
    /// # Errors
    ///
    /// Propagates the HAL error of the pin read.
    pub fn poll(&mut self) -> Result<Option<SwitchState>, P::Error> {
        let low = self.pin.is_low()?;
        if self.remaining > 0 {
            if low != self.last_level_low {
                // level changed mid-window: restart the debounce
                self.last_level_low = low;
                self.remaining = self.debounce_cycles;
            } else {
                self.remaining -= 1;
                if self.remaining == 0 {
                    let new_state = if low { SwitchState::On } else { SwitchState::Off };
                    if new_state != self.state {
                        self.state = new_state;
                        return Ok(Some(new_state));
                    }
                }
            }
        } else if (self.state == SwitchState::On) != low {
            // change that was never announced by an interrupt: debounce it anyway
            self.last_level_low = low;
            self.remaining = self.debounce_cycles;
        }
        Ok(None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // tests use unwrap() for readable assertions
mod tests {
    use super::*;
    use crate::mocks::MockLevelPin;

    #[test]
    fn switch_commits_after_stable_window() {
        let pin = MockLevelPin::new(false);
        let mut sw = PowerSwitch::new(pin, 3).unwrap();
        assert_eq!(sw.state(), SwitchState::Off);

        sw.pin.set_level(true); // pressed (active low)
        sw.on_edge();
        assert_eq!(sw.poll().unwrap(), None);
        assert_eq!(sw.poll().unwrap(), None);
        assert_eq!(sw.poll().unwrap(), Some(SwitchState::On));
        assert_eq!(sw.state(), SwitchState::On);
    }

    #[test]
    fn bounce_restarts_window() {
        let pin = MockLevelPin::new(false);
        let mut sw = PowerSwitch::new(pin, 2).unwrap();

        sw.pin.set_level(true);
        sw.on_edge();
        assert_eq!(sw.poll().unwrap(), None);
        sw.pin.set_level(false); // bounce back
        assert_eq!(sw.poll().unwrap(), None);
        sw.pin.set_level(true);
        assert_eq!(sw.poll().unwrap(), None);
        assert_eq!(sw.poll().unwrap(), None);
        assert_eq!(sw.poll().unwrap(), Some(SwitchState::On));
    }

    #[test]
    fn unannounced_change_is_debounced_not_committed() {
        let pin = MockLevelPin::new(false);
        let mut sw = PowerSwitch::new(pin, 2).unwrap();

        sw.pin.set_level(true); // no on_edge() call
        assert_eq!(sw.poll().unwrap(), None);
        assert!(sw.is_settling());
        assert_eq!(sw.poll().unwrap(), None);
        assert_eq!(sw.poll().unwrap(), Some(SwitchState::On));
    }
}
