//! Linear scans over flash
//!
//! Every scan walks `[base, base + bounds)` one byte at a time, testing
//! each position for a valid record. This tolerates corruption and
//! misalignment: a torn record simply fails validation and the walk moves
//! on. Only the unique-tag enumeration and the free-span search skip over
//! valid records by their exact size.
//!
//! Results carry a [`RecordCursor`] (bank plus offset) instead of an
//! address. Cursors are invalidated by garbage collection.

use core::ops::{ControlFlow, Range};

use flashlog_hal::{PersistFlash, FLASH_ERASED_BYTE};
use heapless::Vec;

use crate::config::{CONTAINER_BYTE_LENGTH, FLASH_MIN_WRITE_LENGTH, MAX_PERSIST_RECORDS};
use crate::error::{PersistError, Result};
use crate::record::{
    padding, Record, RecordHeader, Tag, RECORD_HEADER_SIZE, RECORD_STRUCT_ID,
};
use crate::region::{Bank, BankId};

/// Chunk size for bulk reads
const SCAN_CHUNK: usize = 64;

/// Position of a record inside a bank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RecordCursor {
    /// Bank holding the record
    pub bank: BankId,
    /// Byte offset from the bank base
    pub offset: u32,
}

/// A valid record found by a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RecordRef {
    /// Where the record lives
    pub cursor: RecordCursor,
    /// Its header
    pub header: RecordHeader,
}

impl RecordRef {
    /// Logical key
    pub fn tag(&self) -> Tag {
        self.header.record_tag
    }

    /// Commit timestamp
    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    /// On-flash size
    pub fn size(&self) -> usize {
        self.header.size()
    }
}

/// Result of [`valid_record_count`](crate::PersistStore::valid_record_count)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RecordCount {
    /// Number of valid records
    pub count: usize,
    /// Last valid record in scan order
    pub last: Option<RecordRef>,
}

/// Result of [`get_historical_record`](crate::PersistStore::get_historical_record)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HistoricalRecord {
    /// The selected record, if any
    pub record: Option<RecordRef>,
    /// Number of valid records of the tag
    pub count: usize,
}

/// Records of one bank, bounded by what a bank can hold
pub(crate) type RecordList = Vec<RecordRef, MAX_PERSIST_RECORDS>;

/// Distinct tags of one bank
pub(crate) type TagList = Vec<Tag, MAX_PERSIST_RECORDS>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Stride {
    /// Advance one byte after every position
    Byte,
    /// Jump over valid records
    Record,
}

/// Read-only view of the flash window
pub(crate) struct Scanner<'a, F> {
    flash: &'a mut F,
    window: Range<u32>,
}

impl<'a, F: PersistFlash> Scanner<'a, F> {
    pub fn new(flash: &'a mut F, window: Range<u32>) -> Self {
        Self { flash, window }
    }

    /// Base and bounds must be 8-byte aligned and inside the window
    pub fn range_check(&self, base: u32, bounds: u32) -> Result<()> {
        range_check(&self.window, base, bounds)
    }

    /// Whether a record magic starts at `address`
    pub fn record_exists(&mut self, address: u32, end: u32) -> Result<bool> {
        if address < self.window.start || address.saturating_add(4) > end.min(self.window.end) {
            return Ok(false);
        }
        let mut magic = [0u8; 4];
        self.flash.read(address, &mut magic)?;
        Ok(u32::from_le_bytes(magic) == RECORD_STRUCT_ID)
    }

    /// Header of the valid record at `address`, if there is one
    pub fn record_valid(&mut self, address: u32, end: u32) -> Result<Option<RecordHeader>> {
        Ok(self.load(address, end)?.filter(Record::is_valid).map(|r| r.header))
    }

    /// Copy the record at `address` into RAM and validate it
    pub fn read_record(&mut self, address: u32, end: u32) -> Result<Record> {
        self.load(address, end)?
            .filter(Record::is_valid)
            .ok_or(PersistError::InvalidRamRecord)
    }

    /// Read a record that exists and fits before `end`, without validating it
    fn load(&mut self, address: u32, end: u32) -> Result<Option<Record>> {
        if !self.record_exists(address, end)? {
            return Ok(None);
        }

        let mut bytes = [0u8; RECORD_HEADER_SIZE];
        if address.saturating_add(RECORD_HEADER_SIZE as u32) > end {
            return Ok(None);
        }
        self.flash.read(address, &mut bytes)?;
        let header = RecordHeader::from_bytes(&bytes);

        let len = header.data_length();
        if len > CONTAINER_BYTE_LENGTH {
            return Ok(None);
        }
        match address.checked_add(header.size() as u32) {
            Some(record_end) if record_end <= end => {}
            _ => return Ok(None),
        }

        let mut record = Record {
            header,
            ..Record::default()
        };
        let padded = len + padding(len);
        let payload_address = address + RECORD_HEADER_SIZE as u32;
        self.flash
            .read(payload_address, &mut record.container[..padded])?;
        let mut trailer = [0u8; 8];
        self.flash
            .read(payload_address + padded as u32, &mut trailer)?;
        record.checksum = u64::from_le_bytes(trailer);
        Ok(Some(record))
    }

    /// Visit every valid record in `[base, end)`
    fn walk(
        &mut self,
        base: u32,
        end: u32,
        stride: Stride,
        mut visit: impl FnMut(u32, RecordHeader) -> ControlFlow<()>,
    ) -> Result<()> {
        let mut address = base;
        while address < end {
            match self.record_valid(address, end)? {
                Some(header) => {
                    if visit(address, header).is_break() {
                        break;
                    }
                    address += match stride {
                        Stride::Byte => 1,
                        Stride::Record => header.size() as u32,
                    };
                }
                None => address += 1,
            }
        }
        Ok(())
    }

    /// Count valid records and remember the last one
    pub fn valid_record_count(&mut self, bank: Bank) -> Result<RecordCount> {
        let mut result = RecordCount::default();
        self.walk(bank.base, bank.end(), Stride::Byte, |address, header| {
            result.count += 1;
            result.last = Some(locate(bank, address, header));
            ControlFlow::Continue(())
        })?;
        Ok(result)
    }

    /// Newest valid record accepted by `filter`; ties go to the last seen
    pub fn newest(
        &mut self,
        bank: Bank,
        filter: impl Fn(&RecordHeader) -> bool,
    ) -> Result<Option<RecordRef>> {
        let mut newest: Option<RecordRef> = None;
        self.walk(bank.base, bank.end(), Stride::Byte, |address, header| {
            if filter(&header) && newest.map_or(true, |n| header.timestamp >= n.timestamp()) {
                newest = Some(locate(bank, address, header));
            }
            ControlFlow::Continue(())
        })?;
        Ok(newest)
    }

    /// Most recent valid record of `tag`
    pub fn recent(&mut self, bank: Bank, tag: Tag) -> Result<Option<RecordRef>> {
        self.newest(bank, |header| header.record_tag == tag)
    }

    /// All valid records of `tag`, newest first
    pub fn history(&mut self, bank: Bank, tag: Tag, list: &mut RecordList) -> Result<()> {
        list.clear();
        self.walk(bank.base, bank.end(), Stride::Byte, |address, header| {
            if header.record_tag != tag {
                return ControlFlow::Continue(());
            }
            match list.push(locate(bank, address, header)) {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            }
        })?;
        sort_newest_first(list);
        Ok(())
    }

    /// All valid records in scan order
    pub fn records(&mut self, bank: Bank, out: &mut [RecordRef]) -> Result<usize> {
        let mut count = 0;
        self.walk(bank.base, bank.end(), Stride::Byte, |address, header| {
            match out.get_mut(count) {
                Some(slot) => {
                    *slot = locate(bank, address, header);
                    count += 1;
                    ControlFlow::Continue(())
                }
                None => ControlFlow::Break(()),
            }
        })?;
        Ok(count)
    }

    /// Distinct tags of the valid records in `[base, end)`, in scan order
    pub fn unique_tags(&mut self, base: u32, end: u32, tags: &mut TagList) -> Result<()> {
        tags.clear();
        self.walk(base, end, Stride::Record, |_, header| {
            if tags.contains(&header.record_tag) {
                return ControlFlow::Continue(());
            }
            match tags.push(header.record_tag) {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            }
        })
    }

    /// Number of erased bytes in `[base, base + bounds)`
    pub fn erased_bytes(&mut self, base: u32, bounds: u32) -> Result<u32> {
        let mut erased = 0;
        let mut chunk = [0u8; SCAN_CHUNK];
        let mut address = base;
        let end = base + bounds;
        while address < end {
            let len = ((end - address) as usize).min(SCAN_CHUNK);
            self.flash.read(address, &mut chunk[..len])?;
            erased += chunk[..len]
                .iter()
                .filter(|&&b| b == FLASH_ERASED_BYTE)
                .count() as u32;
            address += len as u32;
        }
        Ok(erased)
    }

    /// Whether the erased-byte ratio has reached `percent`
    ///
    /// Computes `floor(100 * erased / bounds)` and reports "exceeded" when
    /// that is at least `percent`. A blank range therefore always exceeds
    /// any threshold.
    pub fn threshold_check(&mut self, base: u32, bounds: u32, percent: u8) -> Result<bool> {
        self.range_check(base, bounds)?;
        if percent > 100 {
            return Err(PersistError::InvalidArgs);
        }
        let erased = self.erased_bytes(base, bounds)?;
        let ratio = 100 * erased as u64 / bounds as u64;
        Ok(ratio >= percent as u64)
    }

    /// Percentage of non-erased bytes, rounded down
    pub fn fill_percent(&mut self, base: u32, bounds: u32) -> Result<u8> {
        self.range_check(base, bounds)?;
        let used = bounds - self.erased_bytes(base, bounds)?;
        Ok((100 * used as u64 / bounds as u64) as u8)
    }

    /// Length of the run of erased bytes at `address`, capped at `max`
    fn erased_run(&mut self, address: u32, max: u32, end: u32) -> Result<u32> {
        let mut run = 0;
        let mut chunk = [0u8; SCAN_CHUNK];
        let limit = end.min(address.saturating_add(max));
        let mut cursor = address;
        while cursor < limit {
            let len = ((limit - cursor) as usize).min(SCAN_CHUNK);
            self.flash.read(cursor, &mut chunk[..len])?;
            match chunk[..len].iter().position(|&b| b != FLASH_ERASED_BYTE) {
                Some(at) => return Ok(run + at as u32),
                None => run += len as u32,
            }
            cursor += len as u32;
        }
        Ok(run)
    }

    /// First 8-aligned run of at least `size` erased bytes in `bank`
    pub fn find_free_span(&mut self, bank: Bank, size: u32) -> Result<Option<u32>> {
        let mut address = bank.base;
        let mut byte = [0u8; 1];
        while address < bank.end() {
            if let Some(header) = self.record_valid(address, bank.end())? {
                address += header.size() as u32;
                continue;
            }
            if (address - bank.base) % FLASH_MIN_WRITE_LENGTH == 0 {
                self.flash.read(address, &mut byte)?;
                if byte[0] == FLASH_ERASED_BYTE {
                    let run = self.erased_run(address, size, bank.end())?;
                    if run >= size {
                        return Ok(Some(address));
                    }
                    address += run;
                    continue;
                }
            }
            address += 1;
        }
        Ok(None)
    }
}

/// Base and bounds must be 8-byte aligned and `[base, base + bounds)`
/// must lie inside `window`
pub(crate) fn range_check(window: &Range<u32>, base: u32, bounds: u32) -> Result<()> {
    if base % FLASH_MIN_WRITE_LENGTH != 0 || bounds % FLASH_MIN_WRITE_LENGTH != 0 {
        return Err(PersistError::OutOfRange);
    }
    if bounds == 0 || base < window.start {
        return Err(PersistError::OutOfRange);
    }
    match base.checked_add(bounds) {
        Some(end) if end <= window.end => Ok(()),
        _ => Err(PersistError::OutOfRange),
    }
}

fn locate(bank: Bank, address: u32, header: RecordHeader) -> RecordRef {
    RecordRef {
        cursor: RecordCursor {
            bank: bank.id,
            offset: address - bank.base,
        },
        header,
    }
}

/// Selection-style swap sort, newest first; ties in no particular order
pub(crate) fn sort_newest_first(list: &mut [RecordRef]) {
    for i in 0..list.len() {
        for j in (i + 1)..list.len() {
            if list[j].timestamp() > list[i].timestamp() {
                list.swap(i, j);
            }
        }
    }
}
