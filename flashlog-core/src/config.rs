//! Persistence configuration
//!
//! Compile-time constants fix the record format and the bounds of every
//! in-RAM index. [`RegionLayout`] places the region on a concrete flash
//! part at runtime and is validated against those bounds.

use core::ops::Range;

use flashlog_hal::{FlashProperty, PersistFlash};
use serde::{Deserialize, Serialize};

use crate::error::{PersistError, Result};
use crate::region::{Bank, BankId, HOUSEKEEPING_HEADER_SIZE};

/// Reference flash sector size
pub const SECTOR_SIZE: u32 = 4096;

/// Sectors in bank A in the reference configuration
pub const BANK_A_SECTORS: u32 = 2;

/// Sectors in bank B in the reference configuration
pub const BANK_B_SECTORS: u32 = 2;

/// Payload capacity of a record
pub const CONTAINER_BYTE_LENGTH: usize = 1024;

/// Program granularity every on-flash structure is padded to
pub const FLASH_MIN_WRITE_LENGTH: u32 = 8;

/// Smallest possible on-flash record (header, one padded phrase, trailer)
pub const FLASH_RECORD_MIN_SIZE: u32 = 32;

/// Largest bank the in-RAM indexes are sized for
pub const MAX_BANK_BYTES: u32 = SECTOR_SIZE * BANK_A_SECTORS;

/// Most records a bank can hold, bounding every per-bank list
pub const MAX_PERSIST_RECORDS: usize = (MAX_BANK_BYTES / FLASH_RECORD_MIN_SIZE) as usize;

/// Capacity of the delete-tag table (one `i32` per slot, one sector)
pub const DELETE_TABLE_SLOTS: usize = (SECTOR_SIZE / 4) as usize;

/// Default number of records kept per tag by a bank shift
pub const PERSIST_FLASH_MAX_HISTORY: u32 = 3;

/// Default fill threshold, in percent, for bank shifts
pub const PERSIST_FLASH_FILL_THRESHOLD: u8 = 75;

/// Depth of the persistence request queue
pub const PERSIST_QUEUE_DEPTH: usize = 4;

const _: () = assert!(SECTOR_SIZE % FLASH_MIN_WRITE_LENGTH == 0);
const _: () = assert!(BANK_A_SECTORS == BANK_B_SECTORS);

/// Placement of the persistence region on a flash part
///
/// ```text
/// [house-keeping sector][delete-tag sector][bank A][bank B]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegionLayout {
    window_start: u32,
    window_end: u32,
    region_base: u32,
    sector_size: u32,
    bank_a_sectors: u32,
    bank_b_sectors: u32,
}

impl RegionLayout {
    /// Create and validate a layout
    ///
    /// `window` is the addressable flash range; the region starts at
    /// `region_base`, which must be sector aligned.
    pub fn new(
        window: Range<u32>,
        region_base: u32,
        sector_size: u32,
        bank_a_sectors: u32,
        bank_b_sectors: u32,
    ) -> Result<Self> {
        let layout = Self {
            window_start: window.start,
            window_end: window.end,
            region_base,
            sector_size,
            bank_a_sectors,
            bank_b_sectors,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Derive the flash window and sector size from the driver
    ///
    /// Every program command the engine issues is a multiple of
    /// [`FLASH_MIN_WRITE_LENGTH`], so the part's write size must divide it.
    pub fn from_flash<F: PersistFlash>(
        flash: &F,
        region_base: u32,
        bank_a_sectors: u32,
        bank_b_sectors: u32,
    ) -> Result<Self> {
        let start = flash.property(FlashProperty::BlockBase)?;
        let total = flash.property(FlashProperty::TotalSize)?;
        let sector_size = flash.property(FlashProperty::SectorSize)?;
        let write_size = flash.property(FlashProperty::WriteSize)?;
        if write_size == 0 || FLASH_MIN_WRITE_LENGTH % write_size != 0 {
            return Err(PersistError::InvalidArgs);
        }
        let end = start.checked_add(total).ok_or(PersistError::OutOfRange)?;
        Self::new(start..end, region_base, sector_size, bank_a_sectors, bank_b_sectors)
    }

    /// Check alignment, bank symmetry and the compile-time bounds
    pub fn validate(&self) -> Result<()> {
        if self.sector_size == 0
            || self.sector_size % FLASH_MIN_WRITE_LENGTH != 0
            || (self.sector_size as usize) < HOUSEKEEPING_HEADER_SIZE
        {
            return Err(PersistError::InvalidArgs);
        }
        if self.bank_a_sectors == 0 || self.bank_a_sectors != self.bank_b_sectors {
            return Err(PersistError::InvalidArgs);
        }
        let bank_bytes = self
            .bank_a_sectors
            .checked_mul(self.sector_size)
            .ok_or(PersistError::OutOfRange)?;
        if bank_bytes > MAX_BANK_BYTES {
            return Err(PersistError::OutOfRange);
        }
        if self.region_base % self.sector_size != 0 {
            return Err(PersistError::OutOfRange);
        }
        let region_end = self
            .region_base
            .checked_add(self.region_size())
            .ok_or(PersistError::OutOfRange)?;
        if self.region_base < self.window_start || region_end > self.window_end {
            return Err(PersistError::OutOfRange);
        }
        Ok(())
    }

    /// Addressable flash range
    pub fn window(&self) -> Range<u32> {
        self.window_start..self.window_end
    }

    /// Erase granularity
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// First byte of the region (the house-keeping header)
    pub fn region_base(&self) -> u32 {
        self.region_base
    }

    /// Total bytes occupied by the region
    pub fn region_size(&self) -> u32 {
        self.sector_size * (2 + self.bank_a_sectors + self.bank_b_sectors)
    }

    /// Address of the house-keeping header
    pub fn housekeeping_address(&self) -> u32 {
        self.region_base
    }

    /// Address of the delete-tag table
    pub fn delete_sector_address(&self) -> u32 {
        self.region_base + self.sector_size
    }

    /// Number of slots in the delete-tag table
    pub fn delete_slots(&self) -> usize {
        ((self.sector_size / 4) as usize).min(DELETE_TABLE_SLOTS)
    }

    /// Descriptor of a bank
    pub fn bank(&self, id: BankId) -> Bank {
        let bank_a_base = self.region_base + 2 * self.sector_size;
        match id {
            BankId::A => Bank {
                id,
                base: bank_a_base,
                size: self.bank_a_sectors * self.sector_size,
            },
            BankId::B => Bank {
                id,
                base: bank_a_base + self.bank_a_sectors * self.sector_size,
                size: self.bank_b_sectors * self.sector_size,
            },
        }
    }

    /// The bank whose base address is `address`
    pub fn bank_at(&self, address: u32) -> Option<BankId> {
        [BankId::A, BankId::B]
            .into_iter()
            .find(|&id| self.bank(id).base == address)
    }
}

/// Layout plus bank-shift policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StoreConfig {
    /// Region placement
    pub layout: RegionLayout,
    /// Fill percentage that triggers a bank shift from the service
    pub fill_threshold: u8,
    /// Records kept per tag by a bank shift
    pub max_history: u32,
}

impl StoreConfig {
    /// Configuration with the default policy
    pub fn new(layout: RegionLayout) -> Self {
        Self {
            layout,
            fill_threshold: PERSIST_FLASH_FILL_THRESHOLD,
            max_history: PERSIST_FLASH_MAX_HISTORY,
        }
    }

    /// Validate the layout and policy knobs
    pub fn validate(&self) -> Result<()> {
        self.layout.validate()?;
        if self.fill_threshold > 100 || self.max_history == 0 {
            return Err(PersistError::InvalidArgs);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flashlog_hal::RamFlash;

    const WINDOW: Range<u32> = 0x0001_0000..0x0002_0000;

    #[test]
    fn test_reference_bounds() {
        assert_eq!(MAX_PERSIST_RECORDS, 256);
        assert_eq!(DELETE_TABLE_SLOTS, 1024);
    }

    #[test]
    fn test_layout_addresses() {
        let layout = RegionLayout::new(WINDOW, 0x0001_0000, 1024, 4, 4).unwrap();
        assert_eq!(layout.housekeeping_address(), 0x0001_0000);
        assert_eq!(layout.delete_sector_address(), 0x0001_0400);
        let a = layout.bank(BankId::A);
        let b = layout.bank(BankId::B);
        assert_eq!(a.base, 0x0001_0800);
        assert_eq!(a.size, 4096);
        assert_eq!(b.base, a.end());
        assert_eq!(b.size, 4096);
        assert_eq!(layout.region_size(), 10 * 1024);
        assert_eq!(layout.delete_slots(), 256);
        assert_eq!(layout.bank_at(b.base), Some(BankId::B));
        assert_eq!(layout.bank_at(b.base + 8), None);
    }

    #[test]
    fn test_layout_rejects_misalignment() {
        assert_eq!(
            RegionLayout::new(WINDOW, 0x0001_0100, 1024, 4, 4),
            Err(PersistError::OutOfRange)
        );
        assert_eq!(
            RegionLayout::new(WINDOW, 0x0001_0000, 1020, 4, 4),
            Err(PersistError::InvalidArgs)
        );
    }

    #[test]
    fn test_layout_rejects_unequal_banks() {
        assert_eq!(
            RegionLayout::new(WINDOW, 0x0001_0000, 1024, 4, 2),
            Err(PersistError::InvalidArgs)
        );
    }

    #[test]
    fn test_layout_must_fit_window() {
        assert_eq!(
            RegionLayout::new(WINDOW, 0x0001_E000, 1024, 4, 4),
            Err(PersistError::OutOfRange)
        );
        // Banks larger than the index bound
        assert_eq!(
            RegionLayout::new(0..0x0010_0000, 0, 4096, 4, 4),
            Err(PersistError::OutOfRange)
        );
    }

    #[test]
    fn test_layout_from_flash() {
        let flash: RamFlash<16384> = RamFlash::new(0x0002_0000, 2048);
        let layout = RegionLayout::from_flash(&flash, 0x0002_0000, 2, 2).unwrap();
        assert_eq!(layout.window(), 0x0002_0000..0x0002_4000);
        assert_eq!(layout.sector_size(), 2048);
        assert_eq!(layout.bank(BankId::B).end(), 0x0002_0000 + 6 * 2048);
    }

    #[test]
    fn test_layout_rejects_wide_write_size() {
        let flash: RamFlash<16384> = RamFlash::new(0x0002_0000, 2048).with_write_size(16);
        assert_eq!(
            RegionLayout::from_flash(&flash, 0x0002_0000, 2, 2),
            Err(PersistError::InvalidArgs)
        );
        let flash: RamFlash<16384> = RamFlash::new(0x0002_0000, 2048).with_write_size(4);
        assert!(RegionLayout::from_flash(&flash, 0x0002_0000, 2, 2).is_ok());
    }

    #[test]
    fn test_store_config_policy() {
        let layout = RegionLayout::new(WINDOW, 0x0001_0000, 1024, 4, 4).unwrap();
        let mut config = StoreConfig::new(layout);
        assert!(config.validate().is_ok());
        config.fill_threshold = 101;
        assert_eq!(config.validate(), Err(PersistError::InvalidArgs));
    }

    #[test]
    fn test_store_config_postcard() {
        let layout = RegionLayout::new(WINDOW, 0x0001_0000, 1024, 4, 4).unwrap();
        let mut config = StoreConfig::new(layout);
        config.max_history = 5;

        let mut buf = [0u8; 64];
        let bytes = postcard::to_slice(&config, &mut buf).unwrap();
        let decoded: StoreConfig = postcard::from_bytes(bytes).unwrap();
        assert_eq!(decoded, config);
        assert!(decoded.validate().is_ok());
    }
}
