//! Flash capability abstractions
//!
//! The persistence engine never touches flash through raw pointers. Every
//! access goes through [`PersistFlash`], addressed by absolute flash
//! addresses inside the window the driver reports via [`FlashProperty`].

/// Value of an erased flash byte
pub const FLASH_ERASED_BYTE: u8 = 0xFF;

/// Key that must accompany every erase request
///
/// Mirrors the API erase key of flash controllers that refuse erase
/// commands without it ("kefk").
pub const FLASH_ERASE_KEY: u32 = 0x6B65_666B;

/// Flash security state reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecurityState {
    /// Flash is open for erase and program
    NotSecure,
    /// Flash is secured, all modifications refused
    Secure,
    /// Secured, but the backdoor key is enabled
    Backdoor,
}

impl SecurityState {
    /// Whether erase and program commands are allowed
    pub fn allows_writes(self) -> bool {
        matches!(self, SecurityState::NotSecure)
    }
}

/// Read margin used for verify commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Margin {
    /// Normal read level
    #[default]
    Normal,
    /// User margin read level
    User,
    /// Factory margin read level
    Factory,
}

/// Flash geometry properties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashProperty {
    /// Erase granularity in bytes
    SectorSize,
    /// Total size of the addressable flash in bytes
    TotalSize,
    /// Address of the first flash byte
    BlockBase,
    /// Program granularity in bytes
    WriteSize,
}

/// Errors from flash operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// Driver initialization failed
    Init,
    /// Flash is secured
    Security,
    /// Erase requested without the erase key
    InvalidKey,
    /// Address or length violates erase/program granularity
    Alignment,
    /// Address range outside the flash window
    OutOfBounds,
    /// Erase command failed
    Erase,
    /// Erase verify found a non-erased byte
    EraseVerify,
    /// Program command failed
    Program,
    /// Program verify mismatch
    ProgramVerify {
        /// First failing address
        address: u32,
        /// Data read back at that address
        data: u32,
    },
    /// Read failed
    Read,
    /// Operation not supported by this device
    Unsupported,
}

/// Flash capability consumed by the persistence engine
///
/// All addresses are absolute. Erase works on whole sectors; program only
/// clears bits, so programming a location twice without an erase is
/// undefined from the engine's point of view.
pub trait PersistFlash {
    /// Initialize the flash driver
    fn init(&mut self) -> Result<(), FlashError>;

    /// Current security state of the flash
    fn security_state(&mut self) -> Result<SecurityState, FlashError>;

    /// Query a geometry property
    fn property(&self, property: FlashProperty) -> Result<u32, FlashError>;

    /// Read `buffer.len()` bytes starting at `address`
    fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError>;

    /// Erase `length` bytes starting at `address`
    ///
    /// `key` must be [`FLASH_ERASE_KEY`].
    fn erase(&mut self, address: u32, length: u32, key: u32) -> Result<(), FlashError>;

    /// Check that `length` bytes starting at `address` are erased
    fn verify_erase(&mut self, address: u32, length: u32, margin: Margin)
        -> Result<(), FlashError>;

    /// Program `data` at `address`
    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Check that flash at `address` holds `data`
    ///
    /// Fails with [`FlashError::ProgramVerify`] carrying the first failing
    /// address and the word read back there.
    fn verify_program(&mut self, address: u32, data: &[u8], margin: Margin)
        -> Result<(), FlashError>;
}

impl<T: PersistFlash + ?Sized> PersistFlash for &mut T {
    fn init(&mut self) -> Result<(), FlashError> {
        (**self).init()
    }

    fn security_state(&mut self) -> Result<SecurityState, FlashError> {
        (**self).security_state()
    }

    fn property(&self, property: FlashProperty) -> Result<u32, FlashError> {
        (**self).property(property)
    }

    fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        (**self).read(address, buffer)
    }

    fn erase(&mut self, address: u32, length: u32, key: u32) -> Result<(), FlashError> {
        (**self).erase(address, length, key)
    }

    fn verify_erase(
        &mut self,
        address: u32,
        length: u32,
        margin: Margin,
    ) -> Result<(), FlashError> {
        (**self).verify_erase(address, length, margin)
    }

    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        (**self).program(address, data)
    }

    fn verify_program(
        &mut self,
        address: u32,
        data: &[u8],
        margin: Margin,
    ) -> Result<(), FlashError> {
        (**self).verify_program(address, data, margin)
    }
}

/// Pack up to four bytes read back from flash into a little-endian word
pub(crate) fn word_at(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    let len = bytes.len().min(4);
    word[..len].copy_from_slice(&bytes[..len]);
    u32::from_le_bytes(word)
}
