//! Boot and crash recovery
//!
//! [`PersistStore::initialize`] brings the region to `Ready`. A header
//! whose checksum fails means first boot or corruption and resets the
//! whole region, unless the header sector is blank while a bank still
//! holds records: that is a header rewrite cut between erase and program.
//! That case, and a valid header left unconfirmed by an interrupted bank
//! shift, hand the decision to [`PersistStore::determine_primary_and_recover`],
//! which picks the primary bank from what each bank holds.

use core::cmp::Ordering;

use flashlog_hal::PersistFlash;

use crate::error::{PersistError, Result};
use crate::record::Tag;
use crate::region::{Bank, BankId, RegionState};
use crate::store::PersistStore;
use crate::timestamp::TimestampSource;

/// Outcome of comparing the two banks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Keep this bank as primary and erase the other
    Keep(BankId),
    /// Trust neither bank
    Reset,
}

impl<F: PersistFlash, T: TimestampSource> PersistStore<F, T> {
    /// Bring up the flash and the region, recovering if needed
    ///
    /// Returns the primary bank.
    pub fn initialize(&mut self) -> Result<BankId> {
        self.flash.init()?;
        self.check_security()?;
        self.state = RegionState::Recovering;

        let primary = self.region_initialize()?;
        let header = self.read_housekeeping()?;
        let primary = if header.confirmed() {
            primary
        } else {
            warn!("bank shift to bank {} was interrupted, recovering", primary);
            self.determine_primary_and_recover()?
        };

        self.state = RegionState::Ready;
        info!("persistence ready, primary bank {}", primary);
        Ok(primary)
    }

    /// Load the primary bank from the house-keeping header
    ///
    /// A header that fails its checksum resets the region: everything is
    /// erased, bank A becomes primary and a confirmed header is written.
    /// An erased header with records left in either bank is recovered from
    /// bank contents instead.
    pub fn region_initialize(&mut self) -> Result<BankId> {
        let header = self.read_housekeeping()?;
        if header.is_valid() {
            let primary = self
                .config
                .layout
                .bank_at(header.primary_bank_ptr)
                .ok_or_else(|| {
                    error!("header names {:#x}, not a bank", header.primary_bank_ptr);
                    PersistError::SectorBoundaryError
                })?;
            self.primary = primary;
            return Ok(primary);
        }

        if header.is_erased() && self.banks_hold_records()? {
            warn!("house-keeping header erased with records present, recovering");
            return self.determine_primary_and_recover();
        }

        warn!("house-keeping header invalid, resetting persistence region");
        self.erase_region()?;
        self.primary = BankId::A;
        self.write_housekeeping(BankId::A, true)?;
        Ok(BankId::A)
    }

    /// Pick the primary bank from bank contents and erase the other
    ///
    /// The bank with more distinct tags wins. Equal counts with differing
    /// tag sets, or two empty banks, reset both banks to bank A. Equal sets
    /// go to the bank holding the newer most recent record for more tags,
    /// then to the bank with more valid records, then to bank A.
    pub fn determine_primary_and_recover(&mut self) -> Result<BankId> {
        let a = self.config.layout.bank(BankId::A);
        let b = self.config.layout.bank(BankId::B);
        let tags_a = self.bank_tags(a)?;
        let tags_b = self.bank_tags(b)?;

        let verdict = match tags_a.len().cmp(&tags_b.len()) {
            Ordering::Greater => Verdict::Keep(BankId::A),
            Ordering::Less => Verdict::Keep(BankId::B),
            Ordering::Equal if tags_a.is_empty() => Verdict::Reset,
            Ordering::Equal if !tags_a.iter().all(|t| tags_b.contains(t)) => Verdict::Reset,
            Ordering::Equal => {
                let newer_a = self.newer_tags(a, b, &tags_a)?;
                let newer_b = self.newer_tags(b, a, &tags_a)?;
                match newer_a.cmp(&newer_b) {
                    Ordering::Greater => Verdict::Keep(BankId::A),
                    Ordering::Less => Verdict::Keep(BankId::B),
                    Ordering::Equal => {
                        let count_a = self.scanner().valid_record_count(a)?.count;
                        let count_b = self.scanner().valid_record_count(b)?.count;
                        if count_b > count_a {
                            Verdict::Keep(BankId::B)
                        } else {
                            Verdict::Keep(BankId::A)
                        }
                    }
                }
            }
        };

        match verdict {
            Verdict::Keep(winner) => {
                let loser = self.config.layout.bank(winner.other());
                info!("recovery keeps bank {}, erasing bank {}", winner, loser.id);
                self.prepare_bank(loser)?;
                self.primary = winner;
                self.write_housekeeping(winner, true)?;
                Ok(winner)
            }
            Verdict::Reset => {
                warn!("banks disagree, erasing both");
                self.erase_all_banks()?;
                self.primary = BankId::A;
                self.write_housekeeping(BankId::A, true)?;
                Ok(BankId::A)
            }
        }
    }

    fn banks_hold_records(&mut self) -> Result<bool> {
        for id in [BankId::A, BankId::B] {
            let bank = self.config.layout.bank(id);
            if self.scanner().valid_record_count(bank)?.count > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Number of `tags` whose most recent record in `x` is strictly newer
    /// than the one in `y`
    fn newer_tags(&mut self, x: Bank, y: Bank, tags: &[Tag]) -> Result<usize> {
        let mut newer = 0;
        for &tag in tags {
            let in_x = self.scanner().recent(x, tag)?;
            let in_y = self.scanner().recent(y, tag)?;
            match (in_x, in_y) {
                (Some(rx), Some(ry)) if rx.timestamp() > ry.timestamp() => newer += 1,
                (Some(_), Some(_)) => {}
                _ => return Err(PersistError::CorruptTagWithoutRecord),
            }
        }
        Ok(newer)
    }
}
