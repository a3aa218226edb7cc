//! Log-structured record persistence for raw NOR flash
//!
//! This crate contains the persistence engine that sits directly on top of
//! flash sectors, with no filesystem beneath it:
//!
//! - Fletcher-64 checksum engine
//! - Record codec (binary layout, packed record ID, validity predicates)
//! - Region and bank management with crash recovery
//! - Byte-granular scanner and per-tag history index
//! - Write path with free-span discovery and a single GC retry
//! - Garbage collection and the threshold-aware bank shift
//! - Delete-tag sector
//! - Queue/service adapter for a single background writer
//!
//! # Flash layout
//!
//! ```text
//! region_base
//! ┌──────────────────┬──────────────────┬───────────────┬───────────────┐
//! │ house-keeping    │ delete-tag table │    bank A     │    bank B     │
//! │ header (1 sector)│    (1 sector)    │ (N sectors)   │ (N sectors)   │
//! └──────────────────┴──────────────────┴───────────────┴───────────────┘
//! ```
//!
//! The engine is not reentrant. Callers serialize access, typically by
//! routing every mutation through [`service::PersistService`].

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

// Must come first so the logging macros are visible to every module
#[macro_use]
mod fmt;

pub mod checksum;
pub mod config;
pub mod delete;
pub mod error;
mod gc;
mod recovery;
pub mod record;
pub mod region;
mod scan;
pub mod service;
pub mod store;
pub mod timestamp;
mod write;

#[cfg(test)]
mod test_support;

pub use config::{RegionLayout, StoreConfig};
pub use delete::{DeleteMark, MarkedTags};
pub use error::{PersistError, Result};
pub use gc::ShiftOutcome;
pub use record::{create_record, Record, RecordHeader, RecordId, RecordType, Tag};
pub use region::{Bank, BankId, HousekeepingHeader, RegionState};
pub use scan::{HistoricalRecord, RecordCount, RecordCursor, RecordRef};
pub use service::{PersistQueue, PersistRequest, PersistService, ServiceReport};
pub use store::PersistStore;
pub use timestamp::{BasicCounter, TimestampConfig, TimestampMode, TimestampSource};
