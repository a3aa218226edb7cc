//! The persistence store
//!
//! [`PersistStore`] owns the flash driver, the region layout, the timestamp
//! source and the primary-bank selection. There is no hidden global state:
//! every engine operation is a method taking `&mut self`.

use flashlog_hal::{FlashError, Margin, PersistFlash, FLASH_ERASE_KEY};

use crate::config::{RegionLayout, StoreConfig};
use crate::error::{PersistError, Result};
use crate::record::{Record, Tag};
use crate::region::{
    Bank, BankId, HousekeepingHeader, RegionState, HOUSEKEEPING_HEADER_SIZE,
};
use crate::scan::{
    self, HistoricalRecord, RecordCount, RecordCursor, RecordList, RecordRef, Scanner, TagList,
};
use crate::timestamp::{BasicCounter, TimestampSource};

/// Log-structured record store over two flash banks
pub struct PersistStore<F, T = BasicCounter> {
    pub(crate) flash: F,
    pub(crate) config: StoreConfig,
    pub(crate) clock: T,
    pub(crate) primary: BankId,
    pub(crate) state: RegionState,
}

impl<F: PersistFlash> PersistStore<F, BasicCounter> {
    /// Create a store using commit-counter timestamps
    pub fn new(flash: F, config: StoreConfig) -> Result<Self> {
        Self::with_clock(flash, config, BasicCounter)
    }
}

impl<F: PersistFlash, T: TimestampSource> PersistStore<F, T> {
    /// Create a store with a custom timestamp source
    ///
    /// Nothing is read from flash until [`initialize`](Self::initialize).
    pub fn with_clock(flash: F, config: StoreConfig, clock: T) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            flash,
            config,
            clock,
            primary: BankId::A,
            state: RegionState::Uninitialized,
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> RegionState {
        self.state
    }

    /// Region placement
    pub fn layout(&self) -> &RegionLayout {
        &self.config.layout
    }

    /// Layout and policy
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Descriptor of the primary bank
    pub fn primary_bank(&self) -> Bank {
        self.config.layout.bank(self.primary)
    }

    /// Descriptor of the non-primary bank
    pub fn secondary_bank(&self) -> Bank {
        self.config.layout.bank(self.primary.other())
    }

    /// Get the flash driver for low-level access
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Release the flash driver
    pub fn into_flash(self) -> F {
        self.flash
    }

    /// Absolute address of a cursor
    pub fn address_of(&self, cursor: RecordCursor) -> u32 {
        self.config.layout.bank(cursor.bank).base + cursor.offset
    }

    pub(crate) fn scanner(&mut self) -> Scanner<'_, F> {
        let window = self.config.layout.window();
        Scanner::new(&mut self.flash, window)
    }

    pub(crate) fn ensure_ready(&self) -> Result<()> {
        match self.state {
            RegionState::Ready => Ok(()),
            _ => Err(PersistError::NotInitialized),
        }
    }

    /// Refuse to modify a secured flash
    pub(crate) fn check_security(&mut self) -> Result<()> {
        if self.flash.security_state()?.allows_writes() {
            Ok(())
        } else {
            error!("flash is secured, refusing to modify it");
            Err(PersistError::SecurityStateError)
        }
    }

    // ---- Raw flash helpers ----

    /// Erase and erase-verify `[base, base + bounds)`
    pub fn erase_range(&mut self, base: u32, bounds: u32) -> Result<()> {
        self.range_check(base, bounds)?;
        self.check_security()?;
        self.flash.erase(base, bounds, FLASH_ERASE_KEY)?;
        self.flash.verify_erase(base, bounds, Margin::Normal)?;
        Ok(())
    }

    pub(crate) fn erase_bank(&mut self, bank: Bank) -> Result<()> {
        debug!("erasing bank {}", bank.id);
        self.erase_range(bank.base, bank.size)
    }

    /// Erase the target of a copy unless it is already blank
    pub(crate) fn prepare_bank(&mut self, bank: Bank) -> Result<()> {
        match self.flash.verify_erase(bank.base, bank.size, Margin::Normal) {
            Ok(()) => Ok(()),
            Err(FlashError::EraseVerify) => self.erase_bank(bank),
            Err(e) => Err(e.into()),
        }
    }

    /// Erase both banks
    pub fn erase_all_banks(&mut self) -> Result<()> {
        let a = self.config.layout.bank(BankId::A);
        let b = self.config.layout.bank(BankId::B);
        self.erase_bank(a)?;
        self.erase_bank(b)
    }

    /// Erase the whole region, header and delete table included
    pub(crate) fn erase_region(&mut self) -> Result<()> {
        let base = self.config.layout.region_base();
        let size = self.config.layout.region_size();
        self.erase_range(base, size)
    }

    /// Erase the region and initialize it again
    pub fn clear(&mut self) -> Result<BankId> {
        self.check_security()?;
        info!("clearing persistence region");
        self.erase_region()?;
        self.state = RegionState::Uninitialized;
        self.initialize()
    }

    /// Program `data` at `address` and verify it
    pub(crate) fn program_verified(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.flash.program(address, data)?;
        self.flash
            .verify_program(address, data, Margin::User)
            .map_err(|_| PersistError::WriteVerifyFailed)
    }

    pub(crate) fn read_housekeeping(&mut self) -> Result<HousekeepingHeader> {
        let mut bytes = [0u8; HOUSEKEEPING_HEADER_SIZE];
        let address = self.config.layout.housekeeping_address();
        self.flash.read(address, &mut bytes)?;
        Ok(HousekeepingHeader::from_bytes(&bytes))
    }

    /// Replace the house-keeping header
    pub(crate) fn write_housekeeping(&mut self, primary: BankId, confirmed: bool) -> Result<()> {
        let header = HousekeepingHeader::new(self.config.layout.bank(primary).base, confirmed);
        let address = self.config.layout.housekeeping_address();
        let sector = self.config.layout.sector_size();
        trace!("house-keeping header: bank {} confirmed {}", primary, confirmed);
        self.erase_range(address, sector)?;
        self.program_verified(address, &header.to_bytes())
    }

    // ---- Queries ----

    /// Count the valid records of the primary bank
    pub fn valid_record_count(&mut self) -> Result<RecordCount> {
        self.ensure_ready()?;
        let bank = self.primary_bank();
        self.scanner().valid_record_count(bank)
    }

    /// Most recent valid record of `tag` in the primary bank
    pub fn get_recent_record(&mut self, tag: Tag) -> Result<Option<RecordRef>> {
        self.ensure_ready()?;
        let bank = self.primary_bank();
        self.scanner().recent(bank, tag)
    }

    /// The `n`-th most recent record of `tag` (1 is the newest)
    ///
    /// `n == 0` selects nothing; `n` beyond the number of records selects
    /// the oldest.
    pub fn get_historical_record(&mut self, tag: Tag, n: u32) -> Result<HistoricalRecord> {
        self.ensure_ready()?;
        let bank = self.primary_bank();
        let mut list = RecordList::new();
        self.scanner().history(bank, tag, &mut list)?;

        let record = match (n as usize).min(list.len()) {
            0 => None,
            index => list.get(index - 1).copied(),
        };
        Ok(HistoricalRecord {
            record,
            count: list.len(),
        })
    }

    /// Fill `out` with the records of `tag`, newest first
    pub fn get_record_history(&mut self, tag: Tag, out: &mut [RecordRef]) -> Result<usize> {
        self.ensure_ready()?;
        if out.is_empty() {
            return Err(PersistError::InvalidArgs);
        }
        let bank = self.primary_bank();
        let mut list = RecordList::new();
        self.scanner().history(bank, tag, &mut list)?;

        let count = list.len().min(out.len());
        out[..count].copy_from_slice(&list[..count]);
        Ok(count)
    }

    /// Distinct tags among the valid records of `[base, base + bounds)`
    ///
    /// Fills `out` in scan order and returns how many tags it holds.
    pub fn unique_tags_get(&mut self, base: u32, bounds: u32, out: &mut [Tag]) -> Result<usize> {
        if out.is_empty() {
            return Err(PersistError::InvalidArgs);
        }
        let mut scanner = self.scanner();
        scanner.range_check(base, bounds)?;
        let mut tags = TagList::new();
        scanner.unique_tags(base, base + bounds, &mut tags)?;

        let count = tags.len().min(out.len());
        out[..count].copy_from_slice(&tags[..count]);
        Ok(count)
    }

    pub(crate) fn bank_tags(&mut self, bank: Bank) -> Result<TagList> {
        let mut tags = TagList::new();
        self.scanner().unique_tags(bank.base, bank.end(), &mut tags)?;
        Ok(tags)
    }

    /// Whether the erased-byte ratio of the range has reached `percent`
    pub fn threshold_check(&mut self, base: u32, bounds: u32, percent: u8) -> Result<bool> {
        self.scanner().threshold_check(base, bounds, percent)
    }

    /// Percentage of programmed bytes in the range
    pub fn fill_percent(&mut self, base: u32, bounds: u32) -> Result<u8> {
        self.scanner().fill_percent(base, bounds)
    }

    /// Validate an address range against the flash window
    pub fn range_check(&self, base: u32, bounds: u32) -> Result<()> {
        scan::range_check(&self.config.layout.window(), base, bounds)
    }

    /// Whether a record magic sits at `address`
    pub fn record_exists(&mut self, address: u32) -> Result<bool> {
        let end = self.config.layout.window().end;
        self.scanner().record_exists(address, end)
    }

    /// Whether a valid record sits at `address`
    pub fn record_valid(&mut self, address: u32) -> Result<bool> {
        let end = self.config.layout.window().end;
        Ok(self.scanner().record_valid(address, end)?.is_some())
    }

    /// Copy a record into RAM, validating magic and checksum
    pub fn copy_to_ram(&mut self, cursor: RecordCursor) -> Result<Record> {
        let bank = self.config.layout.bank(cursor.bank);
        if cursor.offset >= bank.size {
            return Err(PersistError::SectorBoundaryError);
        }
        self.scanner().read_record(bank.base + cursor.offset, bank.end())
    }

    /// All valid records of the primary bank in scan order
    pub fn current_bank_records(&mut self, out: &mut [RecordRef]) -> Result<usize> {
        self.ensure_ready()?;
        let bank = self.primary_bank();
        self.scanner().records(bank, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordType;
    use crate::test_support::*;
    use flashlog_hal::SecurityState;
    use proptest::prelude::*;

    #[test]
    fn test_empty_bank_invariants() {
        let mut store = ready_store();
        assert_eq!(
            store.valid_record_count(),
            Ok(RecordCount {
                count: 0,
                last: None
            })
        );
        assert_eq!(store.get_recent_record(1), Ok(None));
        let mut out = [RecordRef::default(); 4];
        assert_eq!(store.get_record_history(1, &mut out), Ok(0));
        assert_eq!(
            store.get_record_history(1, &mut []),
            Err(PersistError::InvalidArgs)
        );
        assert_eq!(store.get_historical_record(1, 1).unwrap().record, None);
    }

    #[test]
    fn test_historical_record_selection() {
        let mut store = ready_store();
        for value in 0u8..4 {
            commit(&mut store, 6, &[value]);
        }
        commit(&mut store, 7, b"other");

        let recent = store.get_recent_record(6).unwrap();
        let first = store.get_historical_record(6, 1).unwrap();
        assert_eq!(first.record, recent);
        assert_eq!(first.count, 4);

        assert_eq!(store.get_historical_record(6, 0).unwrap().record, None);
        // Past the end selects the oldest
        let oldest = store.get_historical_record(6, 99).unwrap().record.unwrap();
        assert_eq!(oldest.timestamp(), 0);
        assert_eq!(payload_of(&mut store, oldest), [0u8]);
    }

    #[test]
    fn test_record_history_truncates() {
        let mut store = ready_store();
        for value in 0u8..5 {
            commit(&mut store, 2, &[value; 3]);
        }
        let mut out = [RecordRef::default(); 2];
        assert_eq!(store.get_record_history(2, &mut out), Ok(2));
        assert_eq!(out[0].timestamp(), 4);
        assert_eq!(out[1].timestamp(), 3);
    }

    #[test]
    fn test_range_check_alignment() {
        let store = ready_store();
        assert_eq!(
            store.range_check(FLASH_BASE + 1, 8),
            Err(PersistError::OutOfRange)
        );
        assert_eq!(
            store.range_check(FLASH_BASE, 7),
            Err(PersistError::OutOfRange)
        );
        assert_eq!(store.range_check(FLASH_BASE, 8), Ok(()));
        assert_eq!(
            store.range_check(FLASH_BASE + FLASH_SIZE as u32 - 8, 16),
            Err(PersistError::OutOfRange)
        );
    }

    #[test]
    fn test_unique_tags_get() {
        let mut store = ready_store();
        commit(&mut store, 4, b"a");
        commit(&mut store, 5, b"b");
        commit(&mut store, 4, b"c");
        let bank = store.primary_bank();

        let mut out = [0 as Tag; 8];
        assert_eq!(store.unique_tags_get(bank.base, bank.size, &mut out), Ok(2));
        assert_eq!(&out[..2], &[4, 5]);

        let mut small = [0 as Tag; 1];
        assert_eq!(store.unique_tags_get(bank.base, bank.size, &mut small), Ok(1));
        assert_eq!(
            store.unique_tags_get(bank.base, bank.size, &mut []),
            Err(PersistError::InvalidArgs)
        );
    }

    #[test]
    fn test_record_probes() {
        let mut store = ready_store();
        let cursor = commit(&mut store, 8, b"probe");
        let address = store.address_of(cursor);
        assert_eq!(store.record_exists(address), Ok(true));
        assert_eq!(store.record_valid(address), Ok(true));
        assert_eq!(store.record_exists(address + 8), Ok(false));

        store.flash_mut().corrupt(address + 16, 0x01).unwrap();
        assert_eq!(store.record_exists(address), Ok(true));
        assert_eq!(store.record_valid(address), Ok(false));
        assert_eq!(store.copy_to_ram(cursor), Err(PersistError::InvalidRamRecord));
        assert_eq!(store.get_recent_record(8), Ok(None));
    }

    #[test]
    fn test_copy_to_ram_outside_bank() {
        let mut store = ready_store();
        let cursor = RecordCursor {
            bank: BankId::A,
            offset: store.primary_bank().size,
        };
        assert_eq!(
            store.copy_to_ram(cursor),
            Err(PersistError::SectorBoundaryError)
        );
    }

    #[test]
    fn test_current_bank_records() {
        let mut store = ready_store();
        commit(&mut store, 1, b"x");
        commit(&mut store, 2, b"y");
        commit(&mut store, 1, b"z");
        let mut out = [RecordRef::default(); 8];
        assert_eq!(store.current_bank_records(&mut out), Ok(3));
        let tags: [Tag; 3] = [out[0].tag(), out[1].tag(), out[2].tag()];
        assert_eq!(tags, [1, 2, 1]);
    }

    #[test]
    fn test_threshold_and_fill() {
        let mut store = ready_store();
        let bank = store.primary_bank();
        assert_eq!(store.fill_percent(bank.base, bank.size), Ok(0));
        assert_eq!(store.threshold_check(bank.base, bank.size, 75), Ok(true));
        assert_eq!(
            store.threshold_check(bank.base, bank.size, 101),
            Err(PersistError::InvalidArgs)
        );

        commit(&mut store, 1, &[0u8; 1000]);
        commit(&mut store, 2, &[0u8; 1000]);
        // 2048 of 4096 bytes programmed, a few of them may read back as 0xFF
        let fill = store.fill_percent(bank.base, bank.size).unwrap();
        assert!((45..=50).contains(&fill));
        assert_eq!(store.threshold_check(bank.base, bank.size, 75), Ok(false));
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut store = ready_store();
        commit(&mut store, 1, b"gone");
        store.mark_for_deletion(5).unwrap();
        store.garbage_collect().unwrap();

        assert_eq!(store.clear(), Ok(BankId::A));
        assert_eq!(store.primary_bank().id, BankId::A);
        assert_eq!(store.valid_record_count().unwrap().count, 0);
        assert_eq!(store.get_marked_for_deletion().unwrap().count(), 0);
        assert!(store.flash_mut().cells().iter().skip(16).all(|&b| b == 0xFF));
    }

    #[test]
    fn test_erase_all_banks() {
        let mut store = ready_store();
        commit(&mut store, 1, b"gone");
        store.erase_all_banks().unwrap();
        assert_eq!(store.valid_record_count().unwrap().count, 0);
        assert!(store.read_housekeeping().unwrap().is_valid());
    }

    #[test]
    fn test_erase_range_checks() {
        let mut store = ready_store();
        assert_eq!(
            store.erase_range(FLASH_BASE + 4, SECTOR),
            Err(PersistError::OutOfRange)
        );
        store.flash_mut().set_security(SecurityState::Backdoor);
        let bank = store.primary_bank();
        assert_eq!(
            store.erase_range(bank.base, bank.size),
            Err(PersistError::SecurityStateError)
        );
    }

    #[test]
    fn test_typed_record_round_trip() {
        let mut store = ready_store();
        let mut record = Record::from_value(30, &(7u16, -3i32)).unwrap();
        store.write_record(&mut record).unwrap();
        let found = store.get_recent_record(30).unwrap().unwrap();
        let copy = store.copy_to_ram(found.cursor).unwrap();
        assert_eq!(copy.value::<(u16, i32)>(), Ok((7, -3)));
        assert_eq!(copy.record_type(), RecordType::Postcard.as_u8());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_round_trip_and_history_order(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..12)
        ) {
            let mut store = ready_store();
            for data in &payloads {
                commit(&mut store, 21, data);
            }

            let recent = store.get_recent_record(21).unwrap().unwrap();
            prop_assert_eq!(&payload_of(&mut store, recent), payloads.last().unwrap());

            let mut out = [RecordRef::default(); 16];
            let count = store.get_record_history(21, &mut out).unwrap();
            prop_assert_eq!(count, payloads.len());
            for pair in out[..count].windows(2) {
                prop_assert!(pair[0].timestamp() >= pair[1].timestamp());
            }
        }
    }
}
