//! Record codec
//!
//! On-flash layout (little endian):
//!
//! ```text
//! offset 0   struct_id    u32   RECORD_STRUCT_ID
//! offset 4   record_id    u32   type | timeconfig | data_length | tag
//! offset 8   timestamp    u32
//! offset 12  record_tag   u32   canonical lookup key
//! offset 16  payload      data_length bytes, zero padded to 8
//! ...        checksum     u64   Fletcher-64 over header + payload + padding
//! ```
//!
//! In RAM the payload lives in a fixed [`CONTAINER_BYTE_LENGTH`] container;
//! only `data_length + padding` bytes of it ever reach flash.

use serde::{Deserialize, Serialize};

use crate::checksum::fletcher64;
use crate::config::{CONTAINER_BYTE_LENGTH, FLASH_MIN_WRITE_LENGTH};
use crate::error::{PersistError, Result};

/// Logical record key
pub type Tag = u32;

/// Marks the start of a record on flash
pub const RECORD_STRUCT_ID: u32 = 0x9658_83AE;

/// Size of the record header
pub const RECORD_HEADER_SIZE: usize = 16;

/// Size of the checksum trailer
pub const RECORD_CHECKSUM_SIZE: usize = 8;

/// Largest on-flash record
pub const RECORD_MAX_SIZE: usize = record_size(CONTAINER_BYTE_LENGTH);

/// Width of the type field
pub const RECORD_TYPE_BITS: u32 = 8;
/// Width of the timeconfig field
pub const RECORD_TIMECONFIG_BITS: u32 = 4;
/// Width of the data length field
pub const RECORD_DATA_LENGTH_BITS: u32 = 12;
/// Width of the packed tag field
pub const RECORD_TAG_BITS: u32 =
    32 - RECORD_TYPE_BITS - RECORD_TIMECONFIG_BITS - RECORD_DATA_LENGTH_BITS;

const RECORD_TAG_SHIFT: u32 = 0;
const RECORD_DATA_LENGTH_SHIFT: u32 = RECORD_TAG_SHIFT + RECORD_TAG_BITS;
const RECORD_TIMECONFIG_SHIFT: u32 = RECORD_DATA_LENGTH_SHIFT + RECORD_DATA_LENGTH_BITS;
const RECORD_TYPE_SHIFT: u32 = RECORD_TIMECONFIG_SHIFT + RECORD_TIMECONFIG_BITS;

const _: () = assert!(
    RECORD_TYPE_BITS + RECORD_TIMECONFIG_BITS + RECORD_DATA_LENGTH_BITS + RECORD_TAG_BITS == 32
);
const _: () = assert!(CONTAINER_BYTE_LENGTH < (1 << RECORD_DATA_LENGTH_BITS));

const fn mask(bits: u32) -> u32 {
    (1 << bits) - 1
}

/// Zero bytes appended to `data_length` bytes of payload
pub const fn padding(data_length: usize) -> usize {
    let align = FLASH_MIN_WRITE_LENGTH as usize;
    (align - data_length % align) % align
}

/// On-flash size of a record with `data_length` bytes of payload
pub const fn record_size(data_length: usize) -> usize {
    RECORD_HEADER_SIZE + data_length + padding(data_length) + RECORD_CHECKSUM_SIZE
}

/// Pack the four record ID fields, masking each to its width
pub fn build_record_id(record_type: u32, timeconfig: u32, data_length: u32, tag: u32) -> u32 {
    ((record_type & mask(RECORD_TYPE_BITS)) << RECORD_TYPE_SHIFT)
        | ((timeconfig & mask(RECORD_TIMECONFIG_BITS)) << RECORD_TIMECONFIG_SHIFT)
        | ((data_length & mask(RECORD_DATA_LENGTH_BITS)) << RECORD_DATA_LENGTH_SHIFT)
        | ((tag & mask(RECORD_TAG_BITS)) << RECORD_TAG_SHIFT)
}

/// Packed record ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RecordId(u32);

impl RecordId {
    /// Pack the fields
    ///
    /// The packed tag bits are always written as zero; lookups use the
    /// wide `record_tag` header field.
    pub fn new(record_type: u8, timeconfig: u8, data_length: usize) -> Self {
        Self(build_record_id(
            record_type as u32,
            timeconfig as u32,
            data_length as u32,
            0,
        ))
    }

    /// Wrap a raw value read from flash
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw packed value
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Record type field
    pub fn record_type(self) -> u8 {
        ((self.0 >> RECORD_TYPE_SHIFT) & mask(RECORD_TYPE_BITS)) as u8
    }

    /// Timestamp mode bits
    pub fn timeconfig(self) -> u8 {
        ((self.0 >> RECORD_TIMECONFIG_SHIFT) & mask(RECORD_TIMECONFIG_BITS)) as u8
    }

    /// Payload length in bytes
    pub fn data_length(self) -> usize {
        ((self.0 >> RECORD_DATA_LENGTH_SHIFT) & mask(RECORD_DATA_LENGTH_BITS)) as usize
    }

    /// Packed (narrow) tag field
    pub fn packed_tag(self) -> u8 {
        ((self.0 >> RECORD_TAG_SHIFT) & mask(RECORD_TAG_BITS)) as u8
    }
}

/// Payload interpretation stored in the type field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RecordType {
    /// Opaque bytes
    Raw = 0,
    U8 = 1,
    U16 = 2,
    U32 = 3,
    I8 = 4,
    Char = 5,
    I16 = 6,
    I32 = 7,
    Integer = 8,
    Float = 9,
    Double = 10,
    /// `postcard`-encoded value
    Postcard = 11,
}

impl RecordType {
    /// Get the type as its field value
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode the type field
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RecordType::Raw),
            1 => Some(RecordType::U8),
            2 => Some(RecordType::U16),
            3 => Some(RecordType::U32),
            4 => Some(RecordType::I8),
            5 => Some(RecordType::Char),
            6 => Some(RecordType::I16),
            7 => Some(RecordType::I32),
            8 => Some(RecordType::Integer),
            9 => Some(RecordType::Float),
            10 => Some(RecordType::Double),
            11 => Some(RecordType::Postcard),
            _ => None,
        }
    }
}

/// Fixed-size record header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RecordHeader {
    /// [`RECORD_STRUCT_ID`] when a record exists here
    pub struct_id: u32,
    /// Packed type, timeconfig and length
    pub record_id: RecordId,
    /// Commit timestamp
    pub timestamp: u32,
    /// Canonical lookup key
    pub record_tag: Tag,
}

impl RecordHeader {
    /// Whether the header carries the record magic
    pub fn exists(&self) -> bool {
        self.struct_id == RECORD_STRUCT_ID
    }

    /// Payload length
    pub fn data_length(&self) -> usize {
        self.record_id.data_length()
    }

    /// On-flash size of the record
    pub fn size(&self) -> usize {
        record_size(self.data_length())
    }

    /// Encode to the on-flash layout
    pub fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut bytes = [0u8; RECORD_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.struct_id.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.record_id.raw().to_le_bytes());
        bytes[8..12].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.record_tag.to_le_bytes());
        bytes
    }

    /// Decode from the on-flash layout
    pub fn from_bytes(bytes: &[u8; RECORD_HEADER_SIZE]) -> Self {
        let word =
            |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            struct_id: word(0),
            record_id: RecordId::from_raw(word(4)),
            timestamp: word(8),
            record_tag: word(12),
        }
    }
}

/// A record staged in RAM
#[derive(Clone, PartialEq, Eq)]
pub struct Record {
    /// Header fields
    pub header: RecordHeader,
    /// Payload container, zero beyond `data_length`
    pub container: [u8; CONTAINER_BYTE_LENGTH],
    /// Fletcher-64 over header + payload + padding
    pub checksum: u64,
}

impl Default for Record {
    fn default() -> Self {
        Self {
            header: RecordHeader::default(),
            container: [0; CONTAINER_BYTE_LENGTH],
            checksum: 0,
        }
    }
}

impl core::fmt::Debug for Record {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Record")
            .field("header", &self.header)
            .field("payload", &self.payload())
            .field("checksum", &self.checksum)
            .finish()
    }
}

impl Record {
    /// Stage a new record
    ///
    /// The timestamp and timeconfig are resolved at commit time.
    pub fn new(record_type: RecordType, tag: Tag, data: &[u8]) -> Result<Self> {
        let mut record = Self::default();
        create_record(&mut record, record_type.as_u8(), tag, data)?;
        Ok(record)
    }

    /// Stage a record holding `value` encoded with `postcard`
    pub fn from_value<T: Serialize>(tag: Tag, value: &T) -> Result<Self> {
        let mut buffer = [0u8; CONTAINER_BYTE_LENGTH];
        let used = postcard::to_slice(value, &mut buffer).map_err(|e| match e {
            postcard::Error::SerializeBufferFull => PersistError::DataTooLarge,
            _ => PersistError::Encode,
        })?;
        Self::new(RecordType::Postcard, tag, used)
    }

    /// Decode a `postcard` payload
    pub fn value<'a, T: Deserialize<'a>>(&'a self) -> Result<T> {
        if self.header.record_id.record_type() != RecordType::Postcard.as_u8() {
            return Err(PersistError::Decode);
        }
        postcard::from_bytes(self.payload()).map_err(|_| PersistError::Decode)
    }

    /// Logical key
    pub fn tag(&self) -> Tag {
        self.header.record_tag
    }

    /// Commit timestamp
    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    /// Payload type field
    pub fn record_type(&self) -> u8 {
        self.header.record_id.record_type()
    }

    /// Used payload bytes
    pub fn payload(&self) -> &[u8] {
        let len = self.header.data_length().min(CONTAINER_BYTE_LENGTH);
        &self.container[..len]
    }

    /// On-flash size
    pub fn size(&self) -> usize {
        self.header.size()
    }

    /// Payload plus padding, exactly as programmed
    pub(crate) fn padded_payload(&self) -> &[u8] {
        let len = self.header.data_length().min(CONTAINER_BYTE_LENGTH);
        let padded = (len + padding(len)).min(CONTAINER_BYTE_LENGTH);
        &self.container[..padded]
    }

    /// Checksum over header, payload and padding
    pub fn compute_checksum(&self) -> u64 {
        let mut buffer = [0u8; RECORD_HEADER_SIZE + CONTAINER_BYTE_LENGTH];
        let payload = self.padded_payload();
        buffer[..RECORD_HEADER_SIZE].copy_from_slice(&self.header.to_bytes());
        buffer[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        fletcher64(&buffer[..RECORD_HEADER_SIZE + payload.len()])
    }

    /// Recompute and store the checksum
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Magic present, length in range and checksum matching
    pub fn is_valid(&self) -> bool {
        self.header.exists()
            && self.header.data_length() <= CONTAINER_BYTE_LENGTH
            && self.checksum == self.compute_checksum()
    }
}

/// Stage a record in `dst`
///
/// Zeroes `dst`, sets the magic, packs the record ID with a zero timeconfig
/// and copies `data` into the container. Returns the number of records
/// created, which is always 1.
pub fn create_record(dst: &mut Record, record_type: u8, tag: Tag, data: &[u8]) -> Result<usize> {
    if data.len() > CONTAINER_BYTE_LENGTH {
        return Err(PersistError::DataTooLarge);
    }

    *dst = Record::default();
    dst.header.struct_id = RECORD_STRUCT_ID;
    dst.header.record_id = RecordId::new(record_type, 0, data.len());
    dst.header.record_tag = tag;
    dst.container[..data.len()].copy_from_slice(data);
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding() {
        assert_eq!(padding(0), 0);
        assert_eq!(padding(1), 7);
        assert_eq!(padding(5), 3);
        assert_eq!(padding(8), 0);
        assert_eq!(padding(1023), 1);
    }

    #[test]
    fn test_record_size() {
        assert_eq!(record_size(5), 16 + 5 + 3 + 8);
        assert_eq!(record_size(8), 32);
        assert_eq!(RECORD_MAX_SIZE, 16 + 1024 + 8);
    }

    #[test]
    fn test_field_widths() {
        assert_eq!(RECORD_TAG_BITS, 8);
        assert_eq!(RECORD_DATA_LENGTH_SHIFT, 8);
        assert_eq!(RECORD_TIMECONFIG_SHIFT, 20);
        assert_eq!(RECORD_TYPE_SHIFT, 24);
    }

    #[test]
    fn test_build_record_id_packs_fields() {
        let id = build_record_id(0xAB, 0x2, 0x3FF, 0x15);
        assert_eq!(id, 0xAB23_FF15);
        let id = RecordId::from_raw(id);
        assert_eq!(id.record_type(), 0xAB);
        assert_eq!(id.timeconfig(), 2);
        assert_eq!(id.data_length(), 0x3FF);
        assert_eq!(id.packed_tag(), 0x15);
    }

    #[test]
    fn test_build_record_id_masks_fields() {
        // Oversized fields must not bleed into their neighbours
        let id = build_record_id(0x1FF, 0x1F, 0x1FFF, 0x1FF);
        assert_eq!(id, 0xFFFF_FFFF);
        assert_eq!(build_record_id(0, 0x10, 0, 0), 0);
        assert_eq!(build_record_id(0, 0, 0x1000, 0), 0);
    }

    #[test]
    fn test_create_record() {
        let mut record = Record::default();
        record.container[100] = 0xEE;
        assert_eq!(create_record(&mut record, 3, 15, b"hello"), Ok(1));
        assert!(record.header.exists());
        assert_eq!(record.tag(), 15);
        assert_eq!(record.payload(), b"hello");
        assert_eq!(record.header.record_id.timeconfig(), 0);
        assert_eq!(record.header.record_id.packed_tag(), 0);
        assert_eq!(record.record_type(), 3);
        // Rest of the container is zeroed
        assert!(record.container[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_create_record_too_large() {
        let mut record = Record::default();
        let data = [0u8; CONTAINER_BYTE_LENGTH + 1];
        assert_eq!(
            create_record(&mut record, 0, 1, &data),
            Err(PersistError::DataTooLarge)
        );
        let data = [0u8; CONTAINER_BYTE_LENGTH];
        assert_eq!(create_record(&mut record, 0, 1, &data), Ok(1));
        assert_eq!(record.size(), RECORD_MAX_SIZE);
    }

    #[test]
    fn test_seal_and_validate() {
        let mut record = Record::new(RecordType::Raw, 7, b"abc").unwrap();
        assert!(!record.is_valid());
        record.seal();
        assert!(record.is_valid());
        record.container[0] ^= 1;
        assert!(!record.is_valid());
    }

    #[test]
    fn test_checksum_includes_padding() {
        let mut record = Record::new(RecordType::Raw, 7, b"abc").unwrap();
        record.seal();
        record.container[5] = 0x01;
        assert!(!record.is_valid());
    }

    #[test]
    fn test_default_record_is_not_valid() {
        assert!(!Record::default().is_valid());
    }

    #[test]
    fn test_header_bytes() {
        let header = RecordHeader {
            struct_id: RECORD_STRUCT_ID,
            record_id: RecordId::new(1, 1, 5),
            timestamp: 9,
            record_tag: 15,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &[0xAE, 0x83, 0x58, 0x96]);
        assert_eq!(RecordHeader::from_bytes(&bytes), header);
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct GpsFix {
        lat_e7: i32,
        lon_e7: i32,
        sats: u8,
    }

    #[test]
    fn test_typed_payload() {
        let fix = GpsFix {
            lat_e7: 473_977_000,
            lon_e7: 85_449_000,
            sats: 9,
        };
        let record = Record::from_value(42, &fix).unwrap();
        assert_eq!(record.record_type(), RecordType::Postcard.as_u8());
        assert_eq!(record.value::<GpsFix>().unwrap(), fix);
    }

    #[test]
    fn test_typed_payload_wrong_type() {
        let record = Record::new(RecordType::Raw, 1, &[1, 2, 3]).unwrap();
        assert_eq!(record.value::<u8>(), Err(PersistError::Decode));
    }

    #[test]
    fn test_typed_payload_too_large() {
        let big = [7u8; CONTAINER_BYTE_LENGTH];
        // The length prefix pushes the encoding past the container
        let result = Record::from_value(1, &&big[..]);
        assert_eq!(result.err(), Some(PersistError::DataTooLarge));
    }
}
