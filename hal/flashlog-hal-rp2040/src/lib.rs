//! RP2040 binding for the persistence engine
//!
//! The RP2040 executes from external QSPI flash. embassy-rp's blocking
//! `Flash` driver implements `embedded_storage::nor_flash::NorFlash`
//! (4 KiB erase, byte writes), so the engine runs on it through
//! `NorFlashAdapter`. The persistence region takes the last 64 KiB of
//! the 2 MB part; keep it out of the firmware image in `memory.x`.

#![no_std]

pub mod flash;

pub use flash::{
    new_persist_flash, persist_layout, Rp2040PersistFlash, FLASH_SIZE, PERSIST_PARTITION_START,
};
