//! Delete-tag table
//!
//! The sector after the house-keeping header is a flat array of `i32`
//! slots, `-1` meaning free. A tag listed here is not carried over by the
//! next bank shift. The sector is small and rewritten whole on every
//! change: erase, then program all slots.

use flashlog_hal::PersistFlash;
use heapless::Vec;

use crate::config::DELETE_TABLE_SLOTS;
use crate::error::{PersistError, Result};
use crate::record::Tag;
use crate::store::PersistStore;
use crate::timestamp::TimestampSource;

/// Value of an unused slot
const FREE_SLOT: i32 = -1;

/// Slots programmed per flash command
const SLOTS_PER_CHUNK: usize = 16;

type SlotTable = Vec<i32, DELETE_TABLE_SLOTS>;

/// Result of [`mark_for_deletion`](PersistStore::mark_for_deletion)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeleteMark {
    /// The tag was already in the table
    AlreadyMarked,
    /// The tag was written to `slot`
    Marked { slot: usize },
}

/// Snapshot of the delete-tag table
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MarkedTags {
    slots: SlotTable,
}

impl MarkedTags {
    /// Number of marked tags
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|&&s| s != FREE_SLOT).count()
    }

    /// Whether `tag` is marked
    pub fn contains(&self, tag: Tag) -> bool {
        self.slots.iter().any(|&s| s != FREE_SLOT && s as Tag == tag)
    }

    /// Marked tags in slot order
    pub fn tags(&self) -> impl Iterator<Item = Tag> + '_ {
        self.slots
            .iter()
            .filter(|&&s| s != FREE_SLOT)
            .map(|&s| s as Tag)
    }

    /// Raw slot values, `-1` for free slots
    pub fn slots(&self) -> &[i32] {
        &self.slots
    }
}

impl<F: PersistFlash, T: TimestampSource> PersistStore<F, T> {
    /// Add `tag` to the delete table
    ///
    /// `Tag::MAX` collides with the free-slot marker and is rejected.
    pub fn mark_for_deletion(&mut self, tag: Tag) -> Result<DeleteMark> {
        self.ensure_ready()?;
        if tag as i32 == FREE_SLOT {
            return Err(PersistError::InvalidArgs);
        }

        let mut table = self.get_marked_for_deletion()?;
        if table.contains(tag) {
            return Ok(DeleteMark::AlreadyMarked);
        }
        let slot = table
            .slots
            .iter()
            .position(|&s| s == FREE_SLOT)
            .ok_or_else(|| {
                warn!("delete table full, cannot mark tag {}", tag);
                PersistError::TooManyDeletedTags
            })?;

        table.slots[slot] = tag as i32;
        self.write_delete_table(&table.slots)?;
        debug!("tag {} marked for deletion in slot {}", tag, slot);
        Ok(DeleteMark::Marked { slot })
    }

    /// Remove `tag` from the delete table; `false` if it was not marked
    pub fn unmark_for_deletion(&mut self, tag: Tag) -> Result<bool> {
        self.ensure_ready()?;
        let removed = self.unmark_tags(&[tag])?;
        Ok(removed > 0)
    }

    /// Read the delete table
    pub fn get_marked_for_deletion(&mut self) -> Result<MarkedTags> {
        let slots = self.config.layout.delete_slots();
        let mut address = self.config.layout.delete_sector_address();
        let mut table = SlotTable::new();
        let mut word = [0u8; 4];
        for _ in 0..slots {
            self.flash.read(address, &mut word)?;
            // `slots` never exceeds the table capacity
            let _ = table.push(i32::from_le_bytes(word));
            address += 4;
        }
        Ok(MarkedTags { slots: table })
    }

    /// Reset every slot to free
    pub fn initialize_delete_sector(&mut self) -> Result<()> {
        let mut table = SlotTable::new();
        for _ in 0..self.config.layout.delete_slots() {
            let _ = table.push(FREE_SLOT);
        }
        self.write_delete_table(&table)?;
        debug!("delete table initialized");
        Ok(())
    }

    /// Free every slot holding one of `tags` with a single rewrite
    pub(crate) fn unmark_tags(&mut self, tags: &[Tag]) -> Result<usize> {
        let mut table = self.get_marked_for_deletion()?;
        let mut removed = 0;
        for slot in table.slots.iter_mut() {
            if *slot != FREE_SLOT && tags.contains(&(*slot as Tag)) {
                *slot = FREE_SLOT;
                removed += 1;
            }
        }
        if removed > 0 {
            self.write_delete_table(&table.slots)?;
            debug!("{} tags unmarked for deletion", removed);
        }
        Ok(removed)
    }

    fn write_delete_table(&mut self, slots: &[i32]) -> Result<()> {
        let base = self.config.layout.delete_sector_address();
        let sector = self.config.layout.sector_size();
        self.erase_range(base, sector)?;

        let mut bytes = [0u8; SLOTS_PER_CHUNK * 4];
        let mut address = base;
        for chunk in slots.chunks(SLOTS_PER_CHUNK) {
            for (dst, slot) in bytes.chunks_exact_mut(4).zip(chunk) {
                dst.copy_from_slice(&slot.to_le_bytes());
            }
            let len = chunk.len() * 4;
            self.program_verified(address, &bytes[..len])?;
            address += len as u32;
        }
        Ok(())
    }
}
