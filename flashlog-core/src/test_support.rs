//! Fixtures shared by the store tests

use flashlog_hal::RamFlash;

use crate::config::{RegionLayout, StoreConfig};
use crate::record::{Record, RecordType, Tag};
use crate::scan::{RecordCursor, RecordRef};
use crate::store::PersistStore;
use crate::timestamp::TimestampSource;

pub const FLASH_BASE: u32 = 0x0001_0000;
pub const SECTOR: u32 = 1024;
pub const FLASH_SIZE: usize = 10 * SECTOR as usize;

/// Exactly one region: header, delete table and two 4 KiB banks
pub type TestFlash = RamFlash<FLASH_SIZE>;

pub fn test_config() -> StoreConfig {
    let window = FLASH_BASE..FLASH_BASE + FLASH_SIZE as u32;
    StoreConfig::new(RegionLayout::new(window, FLASH_BASE, SECTOR, 4, 4).unwrap())
}

/// Initialized store over blank flash
pub fn ready_store() -> PersistStore<TestFlash> {
    let flash = TestFlash::new(FLASH_BASE, SECTOR);
    let mut store = PersistStore::new(flash, test_config()).unwrap();
    store.initialize().unwrap();
    store
}

pub fn commit<T: TimestampSource>(
    store: &mut PersistStore<TestFlash, T>,
    tag: Tag,
    data: &[u8],
) -> RecordCursor {
    let mut record = Record::new(RecordType::Raw, tag, data).unwrap();
    store.write_record(&mut record).unwrap()
}

pub fn payload_of<T: TimestampSource>(
    store: &mut PersistStore<TestFlash, T>,
    found: RecordRef,
) -> Vec<u8> {
    store.copy_to_ram(found.cursor).unwrap().payload().to_vec()
}
