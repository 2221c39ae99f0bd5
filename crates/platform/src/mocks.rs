//! Host-side mock peripherals for unit and integration tests.

use core::convert::Infallible;

use embedded_hal::digital::{ErrorType as PinErrorType, InputPin, OutputPin};
use embedded_storage::nor_flash::{
    ErrorType as FlashErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

/// Input pin with a directly settable level.
#[derive(Debug)]
pub struct MockLevelPin {
    low: bool,
}

impl MockLevelPin {
    /// Create with the given initial level (`low = true` means pin low).
    #[must_use]
    pub fn new(low: bool) -> Self {
        Self { low }
    }

    /// Set the simulated pin level.
    pub fn set_level(&mut self, low: bool) {
        self.low = low;
    }
}

impl PinErrorType for MockLevelPin {
    type Error = Infallible;
}

impl InputPin for MockLevelPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.low)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(self.low)
    }
}

/// Output pin recording its last driven level.
#[derive(Debug, Default)]
pub struct MockOutPin {
    /// `true` while the pin is driven low.
    pub low: bool,
}

impl PinErrorType for MockOutPin {
    type Error = Infallible;
}

impl OutputPin for MockOutPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.low = true;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.low = false;
        Ok(())
    }
}

/// Error type of [`MockFlash`].
#[derive(Debug, PartialEq, Eq)]
pub struct MockFlashError;

impl NorFlashError for MockFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

/// RAM-backed NOR flash with 1-byte writes and whole-region erase sectors.
#[derive(Debug)]
pub struct MockFlash<const N: usize> {
    /// Raw memory image, starts erased (0xFF).
    pub mem: [u8; N],
}

impl<const N: usize> MockFlash<N> {
    /// Create an erased flash image.
    #[must_use]
    pub fn new() -> Self {
        Self { mem: [0xFF; N] }
    }
}

impl<const N: usize> Default for MockFlash<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> FlashErrorType for MockFlash<N> {
    type Error = MockFlashError;
}

impl<const N: usize> ReadNorFlash for MockFlash<N> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        let end = start.checked_add(bytes.len()).ok_or(MockFlashError)?;
        let src = self.mem.get(start..end).ok_or(MockFlashError)?;
        bytes.copy_from_slice(src);
        Ok(())
    }

    fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> NorFlash for MockFlash<N> {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = 256;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        let (from, to) = (from as usize, to as usize);
        let region = self.mem.get_mut(from..to.min(N)).ok_or(MockFlashError)?;
        region.fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        let end = start.checked_add(bytes.len()).ok_or(MockFlashError)?;
        let dst = self.mem.get_mut(start..end).ok_or(MockFlashError)?;
        dst.copy_from_slice(bytes);
        Ok(())
    }
}
