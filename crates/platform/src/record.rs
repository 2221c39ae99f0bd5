//! Persisted configuration records.
//!
//! The appliance persists very little (currently a single battery-health
//! value), but what it does persist must survive partial writes and flash
//! wear. Records are postcard-encoded behind a fixed header with a CRC-32
//! guard:
//!
//! ```text
//! [0..4]   magic       b"BBXR"
//! [4]      version     u8 = 1
//! [5]      _pad
//! [6..8]   payload_len u16 le
//! [8..12]  payload_crc u32 le  (CRC32 of the postcard payload)
//! [12..64] payload + pad
//! ```
//!
//! A record that fails any of the checks is reported as [`RecordError::Corrupt`]
//! and the caller falls back to its default value.

use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};
use serde::{de::DeserializeOwned, Serialize};

/// Total on-flash record size, header included.
pub const RECORD_SIZE: usize = 64;
/// Maximum postcard payload size.
pub const MAX_PAYLOAD: usize = RECORD_SIZE - HEADER_SIZE;

const HEADER_SIZE: usize = 12;
const MAGIC: &[u8; 4] = b"BBXR";
const VERSION: u8 = 1;

/// Error variants for record load/save operations.
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RecordError<E> {
    /// Underlying flash driver error.
    Flash(E),
    /// No record present (erased magic).
    Missing,
    /// Header, length or CRC check failed.
    Corrupt,
    /// Value does not fit in [`MAX_PAYLOAD`] bytes.
    TooLarge,
}

/// One fixed-slot record store at offset 0 of the given flash region.
pub struct RecordStore<S> {
    flash: S,
}

impl<S: ReadNorFlash + NorFlash> RecordStore<S> {
    /// Wrap a flash region. The region must be at least one erase sector.
    pub fn new(flash: S) -> Self {
        Self { flash }
    }

    /// Load and decode the stored record.
    ///
    /// # Errors
    ///
    /// [`RecordError::Missing`] when the slot is erased, [`RecordError::Corrupt`]
    /// on any header/CRC/decode mismatch, [`RecordError::Flash`] on driver
    /// errors.
    pub fn load<T: DeserializeOwned>(&mut self) -> Result<T, RecordError<S::Error>> {
        let mut buf = [0u8; RECORD_SIZE];
        self.flash.read(0, &mut buf).map_err(RecordError::Flash)?;

        if buf[0..4] == [0xFF; 4] {
            return Err(RecordError::Missing);
        }
        if &buf[0..4] != MAGIC || buf[4] != VERSION {
            return Err(RecordError::Corrupt);
        }

        let len = usize::from(u16::from_le_bytes([buf[6], buf[7]]));
        if len > MAX_PAYLOAD {
            return Err(RecordError::Corrupt);
        }
        let stored_crc = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let payload = &buf[HEADER_SIZE..HEADER_SIZE + len];

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != stored_crc {
            return Err(RecordError::Corrupt);
        }

        postcard::from_bytes(payload).map_err(|_| RecordError::Corrupt)
    }

    /// Encode and store a record, replacing any previous one.
    ///
    /// # Errors
    ///
    /// [`RecordError::TooLarge`] when the encoded value exceeds
    /// [`MAX_PAYLOAD`], [`RecordError::Flash`] on driver errors.
    pub fn save<T: Serialize>(&mut self, value: &T) -> Result<(), RecordError<S::Error>> {
        let mut buf = [0u8; RECORD_SIZE];

        let len = {
            let payload_buf = &mut buf[HEADER_SIZE..];
            let used = postcard::to_slice(value, payload_buf)
                .map_err(|_| RecordError::TooLarge)?
                .len();
            used
        };

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[HEADER_SIZE..HEADER_SIZE + len]);
        let crc = hasher.finalize();

        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = VERSION;
        #[allow(clippy::cast_possible_truncation)] // len <= MAX_PAYLOAD < 64
        let len16 = len as u16;
        buf[6..8].copy_from_slice(&len16.to_le_bytes());
        buf[8..12].copy_from_slice(&crc.to_le_bytes());

        #[allow(clippy::cast_possible_truncation)] // erase size is a small constant
        self.flash
            .erase(0, S::ERASE_SIZE as u32)
            .map_err(RecordError::Flash)?;
        self.flash.write(0, &buf).map_err(RecordError::Flash)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // tests use unwrap() for readable assertions
mod tests {
    use super::*;
    use crate::mocks::MockFlash;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Health {
        fraction: f32,
    }

    #[test]
    fn save_then_load_round_trips() {
        let mut store = RecordStore::new(MockFlash::<256>::new());
        store.save(&Health { fraction: 0.87 }).unwrap();
        let loaded: Health = store.load().unwrap();
        assert_eq!(loaded, Health { fraction: 0.87 });
    }

    #[test]
    fn erased_flash_reports_missing() {
        let mut store = RecordStore::new(MockFlash::<256>::new());
        assert_eq!(store.load::<Health>().unwrap_err(), RecordError::Missing);
    }

    #[test]
    fn corrupted_payload_is_rejected() {
        let mut flash = MockFlash::<256>::new();
        {
            let mut store = RecordStore::new(&mut flash);
            store.save(&Health { fraction: 0.5 }).unwrap();
        }
        // flip one payload bit
        flash.mem[HEADER_SIZE] ^= 0x01;
        let mut store = RecordStore::new(&mut flash);
        assert_eq!(store.load::<Health>().unwrap_err(), RecordError::Corrupt);
    }
}
