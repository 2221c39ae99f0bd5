//! Persisted battery-health estimate.
//!
//! The sole persisted value of the whole appliance: a fraction in
//! `(0.1, 1.0]` describing remaining capacity relative to factory-new,
//! written by the host and stored behind the CRC-guarded record layer.

use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};
use platform::record::RecordStore;
use serde::{Deserialize, Serialize};

/// Lowest accepted health fraction.
pub const HEALTH_MIN: f32 = 0.1;
/// Default when nothing (valid) is stored.
pub const HEALTH_DEFAULT: f32 = 1.0;

#[derive(Debug, Serialize, Deserialize)]
struct HealthRecord {
    fraction: f32,
}

/// Write errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HealthError {
    /// Value NaN or outside `(HEALTH_MIN, 1.0]`.
    InvalidValue,
    /// Underlying storage failed (reported to the host as a flash error).
    Storage,
}

/// Cached health value over its backing record slot.
pub struct HealthStore<S> {
    store: RecordStore<S>,
    cached: f32,
}

impl<S: ReadNorFlash + NorFlash> HealthStore<S> {
    /// Load the stored value (falling back to [`HEALTH_DEFAULT`] when the
    /// slot is missing or corrupt).
    pub fn load(flash: S) -> Self {
        let mut store = RecordStore::new(flash);
        let cached = match store.load::<HealthRecord>() {
            Ok(record) if record.fraction > HEALTH_MIN && record.fraction <= 1.0 => {
                record.fraction
            }
            // missing, corrupt or out-of-range: treat the pack as new
            _ => HEALTH_DEFAULT,
        };
        Self { store, cached }
    }

    /// Current health fraction.
    #[must_use]
    pub fn value(&self) -> f32 {
        self.cached
    }

    /// Validate and persist a new value (write-through).
    ///
    /// # Errors
    ///
    /// [`HealthError::InvalidValue`] for out-of-range values,
    /// [`HealthError::Storage`] when the flash write fails (the cached value
    /// is left unchanged).
    pub fn set(&mut self, fraction: f32) -> Result<(), HealthError> {
        if fraction.is_nan() || fraction <= HEALTH_MIN || fraction > 1.0 {
            return Err(HealthError::InvalidValue);
        }
        self.store
            .save(&HealthRecord { fraction })
            .map_err(|_| HealthError::Storage)?;
        self.cached = fraction;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // tests use unwrap() for readable assertions
mod tests {
    use super::*;
    use platform::mocks::MockFlash;

    #[test]
    fn defaults_to_new_pack_on_empty_flash() {
        let store = HealthStore::load(MockFlash::<256>::new());
        assert_eq!(store.value(), HEALTH_DEFAULT);
    }

    #[test]
    fn set_persists_across_reload() {
        let mut flash = MockFlash::<256>::new();
        {
            let mut store = HealthStore::load(&mut flash);
            store.set(0.83).unwrap();
            assert_eq!(store.value(), 0.83);
        }
        let store = HealthStore::load(&mut flash);
        assert_eq!(store.value(), 0.83);
    }

    #[test]
    fn corrupt_record_falls_back_to_default() {
        let mut flash = MockFlash::<256>::new();
        {
            let mut store = HealthStore::load(&mut flash);
            store.set(0.6).unwrap();
        }
        flash.mem[13] ^= 0xFF; // inside the payload, breaks the CRC guard
        let store = HealthStore::load(&mut flash);
        assert_eq!(store.value(), HEALTH_DEFAULT);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut store = HealthStore::load(MockFlash::<256>::new());
        assert_eq!(store.set(0.05), Err(HealthError::InvalidValue));
        assert_eq!(store.set(1.5), Err(HealthError::InvalidValue));
        assert_eq!(store.set(f32::NAN), Err(HealthError::InvalidValue));
        assert_eq!(store.value(), HEALTH_DEFAULT);
    }
}
