//! RAM-backed NOR flash simulation
//!
//! Behaves like a phrase-programmed NOR part: erase sets whole sectors to
//! `0xFF`, program can only clear bits, and both erase and program enforce
//! their granularity. A [`FaultPlan`] lets tests fail individual operations
//! or cut power after a number of program commands.

use crate::flash::{
    word_at, FlashError, FlashProperty, Margin, PersistFlash, SecurityState, FLASH_ERASED_BYTE,
    FLASH_ERASE_KEY,
};

/// Default program granularity of the simulated part (one phrase)
pub const RAM_FLASH_WRITE_SIZE: u32 = 8;

/// Faults to inject into a [`RamFlash`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FaultPlan {
    /// Fail `init`
    pub fail_init: bool,
    /// Fail every program command
    pub fail_program: bool,
    /// Report a mismatch on every program verify
    pub fail_verify: bool,
    /// Fail every erase command
    pub fail_erase: bool,
    /// Allow this many more program commands, then refuse all erase and
    /// program commands as if power had been removed
    pub power_cut_after: Option<usize>,
}

/// Simulated flash of `N` bytes starting at `base`
pub struct RamFlash<const N: usize> {
    base: u32,
    sector_size: u32,
    write_size: u32,
    cells: [u8; N],
    security: SecurityState,
    faults: FaultPlan,
    programs: usize,
    erases: usize,
}

impl<const N: usize> RamFlash<N> {
    /// Create a fully erased flash
    pub fn new(base: u32, sector_size: u32) -> Self {
        Self {
            base,
            sector_size,
            write_size: RAM_FLASH_WRITE_SIZE,
            cells: [FLASH_ERASED_BYTE; N],
            security: SecurityState::NotSecure,
            faults: FaultPlan::default(),
            programs: 0,
            erases: 0,
        }
    }

    /// Use a different program granularity
    pub fn with_write_size(mut self, write_size: u32) -> Self {
        self.write_size = write_size;
        self
    }

    /// Raw cell contents
    pub fn cells(&self) -> &[u8] {
        &self.cells
    }

    /// Change the reported security state
    pub fn set_security(&mut self, state: SecurityState) {
        self.security = state;
    }

    /// Replace the fault plan
    pub fn set_faults(&mut self, faults: FaultPlan) {
        self.faults = faults;
    }

    /// Clear all injected faults
    pub fn restore_power(&mut self) {
        self.faults = FaultPlan::default();
    }

    /// Flip bits at `address` directly, bypassing NOR program rules
    pub fn corrupt(&mut self, address: u32, mask: u8) -> Result<(), FlashError> {
        let index = self.index(address, 1)?;
        self.cells[index] ^= mask;
        Ok(())
    }

    /// Number of successful program commands so far
    pub fn program_count(&self) -> usize {
        self.programs
    }

    /// Number of successful erase commands so far
    pub fn erase_count(&self) -> usize {
        self.erases
    }

    fn index(&self, address: u32, length: usize) -> Result<usize, FlashError> {
        let offset = address.checked_sub(self.base).ok_or(FlashError::OutOfBounds)? as usize;
        let end = offset.checked_add(length).ok_or(FlashError::OutOfBounds)?;
        if end > N {
            return Err(FlashError::OutOfBounds);
        }
        Ok(offset)
    }

    fn powered(&self) -> bool {
        !matches!(self.faults.power_cut_after, Some(0))
    }

    fn check_writable(&self) -> Result<(), FlashError> {
        if !self.security.allows_writes() {
            return Err(FlashError::Security);
        }
        Ok(())
    }
}

impl<const N: usize> PersistFlash for RamFlash<N> {
    fn init(&mut self) -> Result<(), FlashError> {
        if self.faults.fail_init {
            return Err(FlashError::Init);
        }
        Ok(())
    }

    fn security_state(&mut self) -> Result<SecurityState, FlashError> {
        Ok(self.security)
    }

    fn property(&self, property: FlashProperty) -> Result<u32, FlashError> {
        Ok(match property {
            FlashProperty::SectorSize => self.sector_size,
            FlashProperty::TotalSize => N as u32,
            FlashProperty::BlockBase => self.base,
            FlashProperty::WriteSize => self.write_size,
        })
    }

    fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        let start = self.index(address, buffer.len())?;
        buffer.copy_from_slice(&self.cells[start..start + buffer.len()]);
        Ok(())
    }

    fn erase(&mut self, address: u32, length: u32, key: u32) -> Result<(), FlashError> {
        if key != FLASH_ERASE_KEY {
            return Err(FlashError::InvalidKey);
        }
        self.check_writable()?;
        let start = self.index(address, length as usize)?;
        if (address - self.base) % self.sector_size != 0 || length % self.sector_size != 0 {
            return Err(FlashError::Alignment);
        }
        if self.faults.fail_erase || !self.powered() {
            return Err(FlashError::Erase);
        }
        self.cells[start..start + length as usize].fill(FLASH_ERASED_BYTE);
        self.erases += 1;
        Ok(())
    }

    fn verify_erase(
        &mut self,
        address: u32,
        length: u32,
        _margin: Margin,
    ) -> Result<(), FlashError> {
        let start = self.index(address, length as usize)?;
        if self.cells[start..start + length as usize]
            .iter()
            .all(|&b| b == FLASH_ERASED_BYTE)
        {
            Ok(())
        } else {
            Err(FlashError::EraseVerify)
        }
    }

    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        self.check_writable()?;
        let start = self.index(address, data.len())?;
        if (address - self.base) % self.write_size != 0
            || data.len() as u32 % self.write_size != 0
        {
            return Err(FlashError::Alignment);
        }
        if self.faults.fail_program || !self.powered() {
            return Err(FlashError::Program);
        }
        for (cell, byte) in self.cells[start..start + data.len()].iter_mut().zip(data) {
            *cell &= *byte;
        }
        if let Some(remaining) = self.faults.power_cut_after.as_mut() {
            *remaining -= 1;
        }
        self.programs += 1;
        Ok(())
    }

    fn verify_program(
        &mut self,
        address: u32,
        data: &[u8],
        _margin: Margin,
    ) -> Result<(), FlashError> {
        let start = self.index(address, data.len())?;
        let stored = &self.cells[start..start + data.len()];
        let mismatch = if self.faults.fail_verify {
            Some(0)
        } else {
            stored.iter().zip(data).position(|(a, b)| a != b)
        };

        match mismatch {
            Some(at) => {
                let word_start = at & !3;
                Err(FlashError::ProgramVerify {
                    address: address + word_start as u32,
                    data: word_at(&stored[word_start..]),
                })
            }
            None => Ok(()),
        }
    }
}
