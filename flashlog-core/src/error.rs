//! Persistence error taxonomy
//!
//! Every failure mode of the engine is a return value. Low-level flash
//! errors are converted into the engine's kinds and propagated untouched,
//! except for the single write -> garbage collect -> retry cycle.

use flashlog_hal::FlashError;

/// Errors from persistence operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PersistError {
    /// Missing, zero-sized or otherwise unusable input
    InvalidArgs,
    /// Address or bounds outside the flash window, or misaligned
    OutOfRange,
    /// Payload exceeds the record container
    DataTooLarge,
    /// Bank was written with a different timestamp mode
    TimestampModeMismatch,
    /// Flash program command failed
    WriteRecordFailed,
    /// Flash program verify failed
    WriteVerifyFailed,
    /// Bank shift cannot fit even one record per tag; data must be deleted
    TooManyLargeRecords,
    /// A tag was enumerated but none of its records could be retrieved
    CorruptTagWithoutRecord,
    /// Flash reports a secure state, writes refused
    SecurityStateError,
    /// Bank pointer does not name a known bank
    SectorBoundaryError,
    /// Erase or erase verify failed
    EraseFailed,
    /// Flash read failed
    ReadFailed,
    /// Flash driver initialization failed
    FlashInit,
    /// Store used before `initialize` completed
    NotInitialized,
    /// Delete-tag table has no free slot
    TooManyDeletedTags,
    /// RAM record does not carry the record magic or fails its checksum
    InvalidRamRecord,
    /// Request queue is full
    QueueFull,
    /// Typed payload could not be encoded
    Encode,
    /// Typed payload could not be decoded
    Decode,
}

impl From<FlashError> for PersistError {
    fn from(e: FlashError) -> Self {
        match e {
            FlashError::Init => PersistError::FlashInit,
            FlashError::Security => PersistError::SecurityStateError,
            FlashError::Alignment | FlashError::OutOfBounds => PersistError::OutOfRange,
            FlashError::InvalidKey | FlashError::Erase | FlashError::EraseVerify => {
                PersistError::EraseFailed
            }
            FlashError::Program => PersistError::WriteRecordFailed,
            FlashError::ProgramVerify { .. } => PersistError::WriteVerifyFailed,
            FlashError::Read => PersistError::ReadFailed,
            FlashError::Unsupported => PersistError::InvalidArgs,
        }
    }
}

/// Result alias used throughout the engine
pub type Result<T> = core::result::Result<T, PersistError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flash_error_mapping() {
        assert_eq!(
            PersistError::from(FlashError::Program),
            PersistError::WriteRecordFailed
        );
        assert_eq!(
            PersistError::from(FlashError::ProgramVerify {
                address: 0x100,
                data: 0
            }),
            PersistError::WriteVerifyFailed
        );
        assert_eq!(
            PersistError::from(FlashError::Security),
            PersistError::SecurityStateError
        );
        assert_eq!(
            PersistError::from(FlashError::EraseVerify),
            PersistError::EraseFailed
        );
        assert_eq!(
            PersistError::from(FlashError::OutOfBounds),
            PersistError::OutOfRange
        );
    }
}
