//! Banks and the house-keeping header
//!
//! The region holds two equal-size banks. At most one is primary, the
//! active write target. Which one is recorded in the house-keeping header,
//! together with a flag saying whether the last bank shift completed.

use flashlog_hal::FLASH_ERASED_BYTE;

use crate::checksum::fletcher64;

/// Size of the house-keeping header on flash
pub const HOUSEKEEPING_HEADER_SIZE: usize = 16;

/// Bytes of the header covered by its checksum
const HOUSEKEEPING_CHECKED_BYTES: usize = 8;

/// One of the two ping-pong banks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BankId {
    /// First bank, the default primary
    #[default]
    A,
    /// Second bank, immediately following bank A
    B,
}

impl BankId {
    /// The opposite bank
    pub fn other(self) -> Self {
        match self {
            BankId::A => BankId::B,
            BankId::B => BankId::A,
        }
    }
}

/// Address range of a bank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Bank {
    /// Which bank this is
    pub id: BankId,
    /// Absolute address of the first byte
    pub base: u32,
    /// Size in bytes
    pub size: u32,
}

impl Bank {
    /// One past the last byte
    pub fn end(&self) -> u32 {
        self.base + self.size
    }

    /// Whether `address` lies inside the bank
    pub fn contains(&self, address: u32) -> bool {
        address >= self.base && address < self.end()
    }
}

/// Persisted pointer to the authoritative bank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HousekeepingHeader {
    /// Base address of the primary bank
    pub primary_bank_ptr: u32,
    /// 0 while a bank shift is in flight, 1 once complete
    pub last_operation_valid: u32,
    /// Fletcher-64 over the two fields above
    pub checksum: u64,
}

impl HousekeepingHeader {
    /// Build a sealed header
    pub fn new(primary_bank_ptr: u32, confirmed: bool) -> Self {
        let mut header = Self {
            primary_bank_ptr,
            last_operation_valid: confirmed as u32,
            checksum: 0,
        };
        header.checksum = header.compute_checksum();
        header
    }

    /// Checksum over the pointer and flag
    pub fn compute_checksum(&self) -> u64 {
        let bytes = self.to_bytes();
        fletcher64(&bytes[..HOUSEKEEPING_CHECKED_BYTES])
    }

    /// Whether the stored checksum matches
    pub fn is_valid(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Whether the header reads back as erased flash
    pub fn is_erased(&self) -> bool {
        self.to_bytes().iter().all(|&b| b == FLASH_ERASED_BYTE)
    }

    /// Whether the last bank shift completed
    pub fn confirmed(&self) -> bool {
        self.last_operation_valid == 1
    }

    /// Encode to the on-flash layout
    pub fn to_bytes(&self) -> [u8; HOUSEKEEPING_HEADER_SIZE] {
        let mut bytes = [0u8; HOUSEKEEPING_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.primary_bank_ptr.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.last_operation_valid.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Decode from the on-flash layout
    pub fn from_bytes(bytes: &[u8; HOUSEKEEPING_HEADER_SIZE]) -> Self {
        let word =
            |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let mut checksum = [0u8; 8];
        checksum.copy_from_slice(&bytes[8..16]);
        Self {
            primary_bank_ptr: word(0),
            last_operation_valid: word(4),
            checksum: u64::from_le_bytes(checksum),
        }
    }
}

/// Lifecycle of the persistence region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegionState {
    /// Nothing read from flash yet
    #[default]
    Uninitialized,
    /// Primary bank being established, or a bank shift in flight
    Recovering,
    /// Primary bank known and consistent
    Ready,
}
