//! Flash capability over `embedded-storage` NOR devices
//!
//! Chip HALs that already expose [`NorFlash`] (embassy-rp, embassy-stm32,
//! esp-storage, ...) get the persistence capability for free. Addresses
//! passed to the engine are absolute; the adapter subtracts `base` before
//! calling into the device, which works in offsets.

use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};

use crate::flash::{
    word_at, FlashError, FlashProperty, Margin, PersistFlash, SecurityState, FLASH_ERASED_BYTE,
    FLASH_ERASE_KEY,
};

/// Chunk size used when reading back for verification
const VERIFY_CHUNK: usize = 64;

/// [`PersistFlash`] implementation for any [`NorFlash`] device
pub struct NorFlashAdapter<F> {
    flash: F,
    base: u32,
}

impl<F: NorFlash> NorFlashAdapter<F> {
    /// Wrap a NOR device whose offset 0 lives at absolute address `base`
    pub fn new(flash: F, base: u32) -> Self {
        Self { flash, base }
    }

    /// Get the wrapped device for low-level access
    pub fn inner(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Release the wrapped device
    pub fn into_inner(self) -> F {
        self.flash
    }

    fn offset(&self, address: u32, length: usize) -> Result<u32, FlashError> {
        let offset = address.checked_sub(self.base).ok_or(FlashError::OutOfBounds)?;
        let end = (offset as usize)
            .checked_add(length)
            .ok_or(FlashError::OutOfBounds)?;
        if end > self.flash.capacity() {
            return Err(FlashError::OutOfBounds);
        }
        Ok(offset)
    }
}

fn map_error<E: NorFlashError>(error: E, fallback: FlashError) -> FlashError {
    match error.kind() {
        NorFlashErrorKind::NotAligned => FlashError::Alignment,
        NorFlashErrorKind::OutOfBounds => FlashError::OutOfBounds,
        _ => fallback,
    }
}

impl<F: NorFlash> PersistFlash for NorFlashAdapter<F> {
    fn init(&mut self) -> Result<(), FlashError> {
        Ok(())
    }

    fn security_state(&mut self) -> Result<SecurityState, FlashError> {
        // NOR devices behind embedded-storage have no security lock
        Ok(SecurityState::NotSecure)
    }

    fn property(&self, property: FlashProperty) -> Result<u32, FlashError> {
        Ok(match property {
            FlashProperty::SectorSize => F::ERASE_SIZE as u32,
            FlashProperty::TotalSize => self.flash.capacity() as u32,
            FlashProperty::BlockBase => self.base,
            FlashProperty::WriteSize => F::WRITE_SIZE as u32,
        })
    }

    fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        let offset = self.offset(address, buffer.len())?;
        self.flash
            .read(offset, buffer)
            .map_err(|e| map_error(e, FlashError::Read))
    }

    fn erase(&mut self, address: u32, length: u32, key: u32) -> Result<(), FlashError> {
        if key != FLASH_ERASE_KEY {
            return Err(FlashError::InvalidKey);
        }
        let offset = self.offset(address, length as usize)?;
        self.flash
            .erase(offset, offset + length)
            .map_err(|e| map_error(e, FlashError::Erase))
    }

    fn verify_erase(
        &mut self,
        address: u32,
        length: u32,
        _margin: Margin,
    ) -> Result<(), FlashError> {
        let mut offset = self.offset(address, length as usize)?;
        let end = offset + length;
        let mut chunk = [0u8; VERIFY_CHUNK];
        while offset < end {
            let len = ((end - offset) as usize).min(VERIFY_CHUNK);
            self.flash
                .read(offset, &mut chunk[..len])
                .map_err(|e| map_error(e, FlashError::Read))?;
            if chunk[..len].iter().any(|&b| b != FLASH_ERASED_BYTE) {
                return Err(FlashError::EraseVerify);
            }
            offset += len as u32;
        }
        Ok(())
    }

    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let offset = self.offset(address, data.len())?;
        self.flash
            .write(offset, data)
            .map_err(|e| map_error(e, FlashError::Program))
    }

    fn verify_program(
        &mut self,
        address: u32,
        data: &[u8],
        _margin: Margin,
    ) -> Result<(), FlashError> {
        let start = self.offset(address, data.len())?;
        let mut chunk = [0u8; VERIFY_CHUNK];
        for (index, expected) in data.chunks(VERIFY_CHUNK).enumerate() {
            let offset = start + (index * VERIFY_CHUNK) as u32;
            let stored = &mut chunk[..expected.len()];
            self.flash
                .read(offset, stored)
                .map_err(|e| map_error(e, FlashError::Read))?;
            if let Some(at) = stored.iter().zip(expected).position(|(a, b)| a != b) {
                let word_start = at & !3;
                return Err(FlashError::ProgramVerify {
                    address: self.base + offset + word_start as u32,
                    data: word_at(&stored[word_start..]),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_storage::nor_flash::{ErrorType, ReadNorFlash};

    /// Minimal NOR device backed by an array
    struct TestNor {
        cells: [u8; 512],
    }

    impl ErrorType for TestNor {
        type Error = NorFlashErrorKind;
    }

    impl ReadNorFlash for TestNor {
        const READ_SIZE: usize = 1;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            let start = offset as usize;
            let end = start + bytes.len();
            if end > self.cells.len() {
                return Err(NorFlashErrorKind::OutOfBounds);
            }
            bytes.copy_from_slice(&self.cells[start..end]);
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.cells.len()
        }
    }

    impl NorFlash for TestNor {
        const WRITE_SIZE: usize = 4;
        const ERASE_SIZE: usize = 128;

        fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            if from as usize % Self::ERASE_SIZE != 0 || to as usize % Self::ERASE_SIZE != 0 {
                return Err(NorFlashErrorKind::NotAligned);
            }
            self.cells[from as usize..to as usize].fill(0xFF);
            Ok(())
        }

        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            if offset as usize % Self::WRITE_SIZE != 0 {
                return Err(NorFlashErrorKind::NotAligned);
            }
            for (cell, byte) in self.cells[offset as usize..].iter_mut().zip(bytes) {
                *cell &= *byte;
            }
            Ok(())
        }
    }

    const BASE: u32 = 0x1000_0000;

    fn adapter() -> NorFlashAdapter<TestNor> {
        NorFlashAdapter::new(TestNor { cells: [0xFF; 512] }, BASE)
    }

    #[test]
    fn test_properties() {
        let a = adapter();
        assert_eq!(a.property(FlashProperty::SectorSize), Ok(128));
        assert_eq!(a.property(FlashProperty::TotalSize), Ok(512));
        assert_eq!(a.property(FlashProperty::BlockBase), Ok(BASE));
        assert_eq!(a.property(FlashProperty::WriteSize), Ok(4));
    }

    #[test]
    fn test_program_and_verify() {
        let mut a = adapter();
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        a.program(BASE + 128, &data).unwrap();
        assert!(a.verify_program(BASE + 128, &data, Margin::Normal).is_ok());
        let mut buf = [0u8; 8];
        a.read(BASE + 128, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_verify_program_mismatch() {
        let mut a = adapter();
        a.program(BASE, &[0u8; 8]).unwrap();
        let result = a.verify_program(BASE, &[0, 0, 0, 0, 0, 0, 1, 0], Margin::Normal);
        assert_eq!(
            result,
            Err(FlashError::ProgramVerify {
                address: BASE + 4,
                data: 0,
            })
        );
    }

    #[test]
    fn test_erase_and_verify() {
        let mut a = adapter();
        a.program(BASE, &[0u8; 4]).unwrap();
        assert_eq!(
            a.verify_erase(BASE, 128, Margin::Normal),
            Err(FlashError::EraseVerify)
        );
        assert_eq!(a.erase(BASE, 128, 0), Err(FlashError::InvalidKey));
        a.erase(BASE, 128, FLASH_ERASE_KEY).unwrap();
        assert!(a.verify_erase(BASE, 128, Margin::Normal).is_ok());
    }

    #[test]
    fn test_error_mapping() {
        let mut a = adapter();
        assert_eq!(
            a.erase(BASE + 8, 128, FLASH_ERASE_KEY),
            Err(FlashError::Alignment)
        );
        assert_eq!(a.program(BASE - 4, &[0; 4]), Err(FlashError::OutOfBounds));
        let mut buf = [0u8; 8];
        assert_eq!(a.read(BASE + 508, &mut buf), Err(FlashError::OutOfBounds));
    }
}
