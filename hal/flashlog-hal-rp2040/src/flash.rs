//! Persistence partition on the RP2040 QSPI flash

use embassy_rp::flash::{Blocking, Flash, ERASE_SIZE};
use embassy_rp::peripherals::FLASH;
use embassy_rp::Peri;
use flashlog_core::config::{BANK_A_SECTORS, BANK_B_SECTORS};
use flashlog_core::{RegionLayout, Result};
use flashlog_hal::NorFlashAdapter;

/// Flash size on the target board
pub const FLASH_SIZE: usize = 2 * 1024 * 1024; // 2MB

/// Bytes reserved for the persistence region
pub const PERSIST_PARTITION_SIZE: usize = 64 * 1024; // 64KB

/// Offset of the persistence region from the start of flash
pub const PERSIST_PARTITION_START: usize = FLASH_SIZE - PERSIST_PARTITION_SIZE;

/// Flash erase size for RP2040
pub const FLASH_ERASE_SIZE: usize = ERASE_SIZE;

const _: () = assert!(
    (2 + BANK_A_SECTORS as usize + BANK_B_SECTORS as usize) * FLASH_ERASE_SIZE
        <= PERSIST_PARTITION_SIZE
);

/// Blocking RP2040 flash seen through the persistence capability
///
/// Engine addresses are offsets from the start of flash (base 0), the
/// same addressing the embassy driver uses.
pub type Rp2040PersistFlash<'d> = NorFlashAdapter<Flash<'d, FLASH, Blocking, FLASH_SIZE>>;

/// Take the flash peripheral for persistence
pub fn new_persist_flash(flash: Peri<'_, FLASH>) -> Rp2040PersistFlash<'_> {
    NorFlashAdapter::new(Flash::new_blocking(flash), 0)
}

/// Region layout for the persistence partition
pub fn persist_layout(flash: &Rp2040PersistFlash<'_>) -> Result<RegionLayout> {
    RegionLayout::from_flash(
        flash,
        PERSIST_PARTITION_START as u32,
        BANK_A_SECTORS,
        BANK_B_SECTORS,
    )
}
