//! Garbage collection and the bank shift
//!
//! Both entry points copy live records from the primary bank into the
//! other bank and swap roles:
//!
//! 1. write the house-keeping header naming the target, unconfirmed
//! 2. copy the preserved records, keeping their original headers
//! 3. confirm the header
//! 4. erase the old bank
//!
//! A power loss before step 3 leaves an unconfirmed header, which makes
//! the next [`initialize`](crate::PersistStore::initialize) decide the
//! primary bank from bank contents. Tags marked for deletion are not
//! copied and are unmarked once the shift is confirmed.

use flashlog_hal::PersistFlash;

use crate::delete::MarkedTags;
use crate::error::{PersistError, Result};
use crate::record::Tag;
use crate::region::{Bank, RegionState};
use crate::scan::{RecordList, TagList};
use crate::store::PersistStore;
use crate::timestamp::TimestampSource;

/// Result of [`primary_sector_clean_and_shift`](PersistStore::primary_sector_clean_and_shift)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ShiftOutcome {
    /// Threshold not reached, nothing done
    NotRequired,
    /// Banks swapped, keeping up to `history` records per tag
    Shifted { history: u32 },
    /// The bank held no valid records and was erased in place
    CorruptionErased,
}

/// Bank shift control flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShiftPhase {
    /// Sum the size of `history` records per surviving tag
    Tabulate { history: u32 },
    /// The sum overflowed the target threshold at `history`
    Reattempt { history: u32 },
    /// The sum fits; copy `history` records per tag
    Copy { history: u32 },
}

impl<F: PersistFlash, T: TimestampSource> PersistStore<F, T> {
    /// Copy the most recent record of every live tag into the other bank
    pub fn garbage_collect(&mut self) -> Result<()> {
        self.ensure_ready()?;
        let source = self.primary_bank();
        let target = self.secondary_bank();
        info!("garbage collection: bank {} -> bank {}", source.id, target.id);

        let tags = self.bank_tags(source)?;
        let marked = self.get_marked_for_deletion()?;
        let (survivors, expunged) = partition(&tags, &marked);

        self.begin_shift(target)?;
        for &tag in survivors.iter() {
            let recent = self
                .scanner()
                .recent(source, tag)?
                .ok_or(PersistError::CorruptTagWithoutRecord)?;
            let record = self.copy_to_ram(recent.cursor)?;
            self.relocate(&record, target)?;
        }
        self.finish_shift(source, target, &expunged)?;

        info!(
            "garbage collection done: {} tags kept, {} expunged",
            survivors.len(),
            expunged.len()
        );
        Ok(())
    }

    /// Threshold-aware bank shift keeping up to `history` records per tag
    ///
    /// Without `force`, nothing happens unless
    /// [`threshold_check`](Self::threshold_check) reports the primary bank
    /// at or past `threshold`. Before copying, the cost of `history` records
    /// per tag is compared against `threshold` percent of the target bank;
    /// `history` is lowered until it fits. If even one record per tag does
    /// not fit, the shift fails with
    /// [`TooManyLargeRecords`](PersistError::TooManyLargeRecords) and flash
    /// is left untouched.
    pub fn primary_sector_clean_and_shift(
        &mut self,
        force: bool,
        threshold: u8,
        history: u32,
    ) -> Result<ShiftOutcome> {
        self.ensure_ready()?;
        if history == 0 || threshold > 100 {
            return Err(PersistError::InvalidArgs);
        }

        let source = self.primary_bank();
        let target = self.secondary_bank();
        if !force && !self.threshold_check(source.base, source.size, threshold)? {
            return Ok(ShiftOutcome::NotRequired);
        }

        let tags = self.bank_tags(source)?;
        if tags.is_empty() {
            warn!("bank {} reached its threshold without valid records, erasing", source.id);
            self.erase_bank(source)?;
            return Ok(ShiftOutcome::CorruptionErased);
        }

        let marked = self.get_marked_for_deletion()?;
        let (survivors, expunged) = partition(&tags, &marked);
        let limit = threshold as u64 * target.size as u64 / 100;

        let mut phase = ShiftPhase::Tabulate { history };
        let history = loop {
            phase = match phase {
                ShiftPhase::Tabulate { history } => {
                    let cost = self.shift_cost(source, &survivors, history)?;
                    trace!("shift cost at history {}: {} of {} bytes", history, cost, limit);
                    if cost >= limit {
                        ShiftPhase::Reattempt { history }
                    } else {
                        ShiftPhase::Copy { history }
                    }
                }
                ShiftPhase::Reattempt { history } if history <= 1 => {
                    warn!("one record per tag overflows bank {}, delete data", target.id);
                    return Err(PersistError::TooManyLargeRecords);
                }
                ShiftPhase::Reattempt { history } => {
                    debug!("reducing shift history to {}", history - 1);
                    ShiftPhase::Tabulate {
                        history: history - 1,
                    }
                }
                ShiftPhase::Copy { history } => break history,
            };
        };

        info!(
            "bank shift: bank {} -> bank {}, history {}",
            source.id, target.id, history
        );
        self.begin_shift(target)?;
        let mut list = RecordList::new();
        for &tag in survivors.iter() {
            self.scanner().history(source, tag, &mut list)?;
            if list.is_empty() {
                return Err(PersistError::CorruptTagWithoutRecord);
            }
            let keep = (history as usize).min(list.len());
            // Oldest first so the copies keep their relative order
            for entry in list[..keep].iter().rev() {
                let record = self.copy_to_ram(entry.cursor)?;
                self.relocate(&record, target)?;
            }
        }
        self.finish_shift(source, target, &expunged)?;

        Ok(ShiftOutcome::Shifted { history })
    }

    /// Bytes needed to copy `history` records of every tag in `tags`
    fn shift_cost(&mut self, source: Bank, tags: &[Tag], history: u32) -> Result<u64> {
        let mut list = RecordList::new();
        let mut cost = 0u64;
        for &tag in tags {
            self.scanner().history(source, tag, &mut list)?;
            cost += list
                .iter()
                .take(history as usize)
                .map(|r| r.size() as u64)
                .sum::<u64>();
        }
        Ok(cost)
    }

    /// Record the intent to move to `target` and make sure it is blank
    fn begin_shift(&mut self, target: Bank) -> Result<()> {
        self.state = RegionState::Recovering;
        self.write_housekeeping(target.id, false)?;
        self.prepare_bank(target)?;
        self.primary = target.id;
        Ok(())
    }

    /// Confirm the move, erase the old bank and unmark expunged tags
    fn finish_shift(&mut self, source: Bank, target: Bank, expunged: &[Tag]) -> Result<()> {
        self.write_housekeeping(target.id, true)?;
        self.erase_bank(source)?;
        if !expunged.is_empty() {
            self.unmark_tags(expunged)?;
        }
        self.state = RegionState::Ready;
        Ok(())
    }
}

/// Split `tags` into those to keep and those marked for deletion
fn partition(tags: &TagList, marked: &MarkedTags) -> (TagList, TagList) {
    let mut keep = TagList::new();
    let mut expunged = TagList::new();
    for &tag in tags.iter() {
        let list = if marked.contains(tag) {
            &mut expunged
        } else {
            &mut keep
        };
        // Both lists have the capacity of `tags`
        let _ = list.push(tag);
    }
    (keep, expunged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::BankId;
    use crate::test_support::*;
    use flashlog_hal::{FaultPlan, Margin};

    #[test]
    fn test_gc_preserves_most_recent() {
        let mut store = ready_store();
        commit(&mut store, 1, b"one-a");
        commit(&mut store, 2, b"two-a");
        commit(&mut store, 1, b"one-b");
        commit(&mut store, 1, b"one-c");
        let before = store.get_recent_record(1).unwrap().unwrap();

        store.garbage_collect().unwrap();

        assert_eq!(store.primary_bank().id, BankId::B);
        assert_eq!(store.valid_record_count().unwrap().count, 2);
        let after = store.get_recent_record(1).unwrap().unwrap();
        assert_eq!(after.cursor.bank, BankId::B);
        assert_eq!(after.timestamp(), before.timestamp());
        assert_eq!(payload_of(&mut store, after), b"one-c");
        let two = store.get_recent_record(2).unwrap().unwrap();
        assert_eq!(payload_of(&mut store, two), b"two-a");

        // Old bank erased, header confirmed on the new one
        let a = store.layout().bank(BankId::A);
        assert!(store.flash_mut().verify_erase(a.base, a.size, Margin::Normal).is_ok());
        let header = store.read_housekeeping().unwrap();
        assert!(header.is_valid());
        assert!(header.confirmed());
        assert_eq!(header.primary_bank_ptr, store.primary_bank().base);
    }

    #[test]
    fn test_gc_twice_returns_to_bank_a() {
        let mut store = ready_store();
        commit(&mut store, 9, b"nine");
        store.garbage_collect().unwrap();
        store.garbage_collect().unwrap();
        assert_eq!(store.primary_bank().id, BankId::A);
        let recent = store.get_recent_record(9).unwrap().unwrap();
        assert_eq!(payload_of(&mut store, recent), b"nine");
    }

    #[test]
    fn test_gc_expunges_marked_tags() {
        let mut store = ready_store();
        commit(&mut store, 1, b"keep");
        commit(&mut store, 2, b"drop");
        store.mark_for_deletion(2).unwrap();

        store.garbage_collect().unwrap();

        assert!(store.get_recent_record(2).unwrap().is_none());
        assert!(store.get_recent_record(1).unwrap().is_some());
        assert_eq!(store.get_marked_for_deletion().unwrap().count(), 0);
    }

    #[test]
    fn test_unmark_before_gc_survives() {
        let mut store = ready_store();
        commit(&mut store, 2, b"saved");
        store.mark_for_deletion(2).unwrap();
        assert!(store.unmark_for_deletion(2).unwrap());

        store.garbage_collect().unwrap();

        let recent = store.get_recent_record(2).unwrap().unwrap();
        assert_eq!(payload_of(&mut store, recent), b"saved");
    }

    #[test]
    fn test_failed_gc_requires_initialize() {
        let mut store = ready_store();
        commit(&mut store, 1, b"x");
        store.flash_mut().set_faults(FaultPlan {
            fail_erase: true,
            ..FaultPlan::default()
        });
        assert_eq!(store.garbage_collect(), Err(PersistError::EraseFailed));
        assert_eq!(store.state(), RegionState::Recovering);
        assert_eq!(
            store.valid_record_count(),
            Err(PersistError::NotInitialized)
        );
    }

    #[test]
    fn test_shift_not_required_for_busy_bank() {
        let mut store = ready_store();
        // Half the bank programmed: the erased ratio is below 75%
        commit(&mut store, 1, &[0u8; 1000]);
        commit(&mut store, 2, &[0u8; 1000]);
        assert_eq!(
            store.primary_sector_clean_and_shift(false, 75, 3),
            Ok(ShiftOutcome::NotRequired)
        );
        assert_eq!(store.primary_bank().id, BankId::A);
    }

    #[test]
    fn test_shift_erases_bank_without_records() {
        let mut store = ready_store();
        // A blank bank counts as past any threshold
        assert_eq!(
            store.primary_sector_clean_and_shift(false, 75, 3),
            Ok(ShiftOutcome::CorruptionErased)
        );
        assert_eq!(store.primary_bank().id, BankId::A);
    }

    #[test]
    fn test_shift_keeps_history() {
        let mut store = ready_store();
        for value in 0u8..5 {
            commit(&mut store, 1, &[value; 4]);
        }
        commit(&mut store, 2, b"single");

        assert_eq!(
            store.primary_sector_clean_and_shift(true, 75, 3),
            Ok(ShiftOutcome::Shifted { history: 3 })
        );
        assert_eq!(store.primary_bank().id, BankId::B);

        let mut out = [crate::scan::RecordRef::default(); 8];
        let count = store.get_record_history(1, &mut out).unwrap();
        assert_eq!(count, 3);
        let stamps: [u32; 3] = [out[0].timestamp(), out[1].timestamp(), out[2].timestamp()];
        assert_eq!(stamps, [4, 3, 2]);
        assert_eq!(payload_of(&mut store, out[0]), &[4u8; 4]);
        assert_eq!(store.get_record_history(2, &mut out).unwrap(), 1);

        // Next commit continues from the preserved timestamps
        let cursor = commit(&mut store, 1, b"next");
        let newest = store.get_recent_record(1).unwrap().unwrap();
        assert_eq!(newest.cursor, cursor);
        assert_eq!(newest.timestamp(), 6);
    }

    #[test]
    fn test_shift_lowers_history_to_fit() {
        let mut store = ready_store();
        // 624-byte records: three per tag cost 3744 bytes, over 75% of 4096
        for _ in 0..3 {
            commit(&mut store, 1, &[1u8; 600]);
            commit(&mut store, 2, &[2u8; 600]);
        }
        assert_eq!(
            store.primary_sector_clean_and_shift(true, 75, 3),
            Ok(ShiftOutcome::Shifted { history: 2 })
        );
        assert_eq!(store.valid_record_count().unwrap().count, 4);
    }

    #[test]
    fn test_shift_too_many_large_records() {
        let mut store = ready_store();
        // 1024-byte records; one per tag already reaches 75% of the bank
        for tag in 0..3 {
            commit(&mut store, tag, &[0xC3; 1000]);
        }
        assert_eq!(
            store.primary_sector_clean_and_shift(true, 75, 3),
            Err(PersistError::TooManyLargeRecords)
        );
        // Nothing moved
        assert_eq!(store.state(), RegionState::Ready);
        assert_eq!(store.primary_bank().id, BankId::A);
        assert_eq!(store.valid_record_count().unwrap().count, 3);
    }

    #[test]
    fn test_shift_skips_marked_tags() {
        let mut store = ready_store();
        commit(&mut store, 1, b"keep");
        commit(&mut store, 2, b"drop");
        store.mark_for_deletion(2).unwrap();

        assert_eq!(
            store.primary_sector_clean_and_shift(true, 75, 3),
            Ok(ShiftOutcome::Shifted { history: 3 })
        );
        assert!(store.get_recent_record(2).unwrap().is_none());
        assert!(store.get_recent_record(1).unwrap().is_some());
        assert!(!store.get_marked_for_deletion().unwrap().contains(2));
    }

    #[test]
    fn test_shift_rejects_bad_arguments() {
        let mut store = ready_store();
        assert_eq!(
            store.primary_sector_clean_and_shift(true, 75, 0),
            Err(PersistError::InvalidArgs)
        );
        assert_eq!(
            store.primary_sector_clean_and_shift(true, 101, 1),
            Err(PersistError::InvalidArgs)
        );
    }
}
