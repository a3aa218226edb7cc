//! Write/commit path
//!
//! A commit resolves the record's timestamp against the newest record in
//! the bank, seals the checksum, finds the first large-enough free span and
//! programs header, payload and checksum as three program+verify steps. A
//! torn commit leaves a record that fails validation and is skipped by
//! every later scan.

use flashlog_hal::PersistFlash;

use crate::config::CONTAINER_BYTE_LENGTH;
use crate::error::{PersistError, Result};
use crate::record::{Record, RecordId, RECORD_HEADER_SIZE};
use crate::region::Bank;
use crate::scan::RecordCursor;
use crate::store::PersistStore;
use crate::timestamp::{TimestampConfig, TimestampSource};

/// Commits per write: the first attempt plus one after garbage collection
const WRITE_ATTEMPTS: usize = 2;

/// How a commit treats the record's header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitMode {
    /// New record: assign timestamp and timeconfig, reseal
    Fresh,
    /// Copy of a committed record: keep header and checksum untouched
    Relocate,
}

impl<F: PersistFlash, T: TimestampSource> PersistStore<F, T> {
    /// Commit a staged record to the primary bank
    ///
    /// The record's timestamp, record ID and checksum are written back into
    /// `record`. If the bank has no free span large enough, garbage
    /// collection runs once and the commit is retried.
    pub fn write_record(&mut self, record: &mut Record) -> Result<RecordCursor> {
        self.ensure_ready()?;

        for attempt in 1..=WRITE_ATTEMPTS {
            let bank = self.primary_bank();
            if let Some(cursor) = self.commit(record, bank, CommitMode::Fresh)? {
                return Ok(cursor);
            }
            if attempt < WRITE_ATTEMPTS {
                info!(
                    "bank {} has no room for {} bytes, collecting garbage",
                    bank.id,
                    record.size()
                );
                self.garbage_collect()?;
            }
        }

        warn!("no room for record of tag {} after garbage collection", record.tag());
        Err(PersistError::WriteRecordFailed)
    }

    /// Commit into `bank`; `Ok(None)` when no free span is large enough
    pub(crate) fn commit(
        &mut self,
        record: &mut Record,
        bank: Bank,
        mode: CommitMode,
    ) -> Result<Option<RecordCursor>> {
        if !record.header.exists() || record.header.data_length() > CONTAINER_BYTE_LENGTH {
            return Err(PersistError::InvalidRamRecord);
        }

        match mode {
            CommitMode::Fresh => self.stamp(record, bank)?,
            CommitMode::Relocate => {
                if !record.is_valid() {
                    return Err(PersistError::InvalidRamRecord);
                }
            }
        }

        let size = record.size() as u32;
        let address = match self.scanner().find_free_span(bank, size)? {
            Some(address) => address,
            None => return Ok(None),
        };

        self.check_security()?;
        self.program_record(address, record).map_err(|e| {
            error!("commit of tag {} at {:#x} failed: {}", record.tag(), address, e);
            e
        })?;

        trace!("committed tag {} at {:#x}", record.tag(), address);
        Ok(Some(RecordCursor {
            bank: bank.id,
            offset: address - bank.base,
        }))
    }

    /// Assign the next timestamp for `bank` and reseal
    fn stamp(&mut self, record: &mut Record, bank: Bank) -> Result<()> {
        let newest = self.scanner().newest(bank, |_| true)?;
        let timestamp = match newest {
            Some(newest) => {
                let timeconfig = newest.header.record_id.timeconfig();
                if timeconfig != self.clock.mode().as_u8() {
                    warn!(
                        "bank {} uses timestamp mode {}, firmware uses {}",
                        bank.id,
                        timeconfig,
                        self.clock.mode()
                    );
                    return Err(PersistError::TimestampModeMismatch);
                }
                let current = TimestampConfig {
                    mode: self.clock.mode(),
                    value: newest.timestamp(),
                };
                self.clock.advance(current)
            }
            None => self.clock.seed(),
        };

        record.header.record_id = RecordId::new(
            record.record_type(),
            timestamp.mode.as_u8(),
            record.header.data_length(),
        );
        record.header.timestamp = timestamp.value;
        record.seal();
        Ok(())
    }

    /// Program header, payload and checksum, verifying each
    fn program_record(&mut self, address: u32, record: &Record) -> Result<()> {
        let payload = record.padded_payload();
        let payload_address = address + RECORD_HEADER_SIZE as u32;

        self.program_verified(address, &record.header.to_bytes())?;
        if !payload.is_empty() {
            self.program_verified(payload_address, payload)?;
        }
        self.program_verified(
            payload_address + payload.len() as u32,
            &record.checksum.to_le_bytes(),
        )
    }

    /// Copy a committed record into `bank` unchanged
    pub(crate) fn relocate(&mut self, record: &Record, bank: Bank) -> Result<()> {
        let mut copy = record.clone();
        match self.commit(&mut copy, bank, CommitMode::Relocate)? {
            Some(_) => Ok(()),
            None => {
                warn!("bank {} cannot hold relocated tag {}", bank.id, record.tag());
                Err(PersistError::TooManyLargeRecords)
            }
        }
    }
}
