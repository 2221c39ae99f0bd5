//! Main-loop scheduling and ISR-safe sharing.
//!
//! The cooperative model: one async task per node runs the 10 ms loop off a
//! [`LoopTicker`]; hardware ISRs deposit data through the node's entry
//! points, which the binaries reach via a [`Shared`] cell (a
//! critical-section mutex, masking interrupts for the duration of the
//! closure — the atomicity guarantee the pipeline's reconfigure paths rely
//! on).

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Ticker};
use platform::timing::MAIN_LOOP_PERIOD_MS;

/// A node driver shared between its main-loop task and its ISRs.
pub struct Shared<T> {
    inner: Mutex<CriticalSectionRawMutex, RefCell<T>>,
}

impl<T> Shared<T> {
    /// Wrap a driver.
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(value)),
        }
    }

    /// Run `f` with exclusive access (interrupts masked).
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.inner.lock(|cell| f(&mut cell.borrow_mut()))
    }
}

/// Fixed-period main-loop ticker with a wrapping cycle counter.
pub struct LoopTicker {
    ticker: Ticker,
    loop_count: u32,
}

impl LoopTicker {
    /// Ticker at the shared [`MAIN_LOOP_PERIOD_MS`] period.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ticker: Ticker::every(Duration::from_millis(u64::from(MAIN_LOOP_PERIOD_MS))),
            loop_count: 0,
        }
    }

    /// Wait for the next cycle; returns the cycle number.
    pub async fn next(&mut self) -> u32 {
        self.ticker.next().await;
        let count = self.loop_count;
        self.loop_count = self.loop_count.wrapping_add(1);
        count
    }
}

impl Default for LoopTicker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ticker_counts_cycles() {
        let mut ticker = LoopTicker::new();
        let first = ticker.next().await;
        let second = ticker.next().await;
        assert_eq!(second, first + 1);
    }

    #[test]
    fn shared_gives_exclusive_access() {
        let shared = Shared::new(0u32);
        shared.with(|v| *v += 3);
        assert_eq!(shared.with(|v| *v), 3);
    }
}
