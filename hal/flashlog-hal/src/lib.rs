//! Flashlog Hardware Abstraction Layer
//!
//! This crate defines the flash capability that the persistence engine
//! consumes. Chip-specific HALs implement [`PersistFlash`] on top of their
//! flash controller so the same engine runs on different parts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  flashlog-core (persistence engine)     │
//! └─────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────┐
//! │  flashlog-hal (this crate - traits)     │
//! └─────────────────────────────────────────┘
//!                     │
//!         ┌───────────┴───────────┐
//!         ▼                       ▼
//! ┌───────────────┐       ┌───────────────┐
//! │ flashlog-hal- │       │   RamFlash    │
//! │    rp2040     │       │ (host tests)  │
//! └───────────────┘       └───────────────┘
//! ```
//!
//! # Modules
//!
//! - [`flash::PersistFlash`] - Erase/program/verify capability
//! - [`nor::NorFlashAdapter`] - Capability over any `embedded-storage` NOR device
//! - [`ram::RamFlash`] - RAM-backed NOR simulation with fault injection

#![no_std]
#![deny(unsafe_code)]

pub mod flash;
pub mod nor;
pub mod ram;

// Re-export key types at crate root for convenience
pub use flash::{
    FlashError, FlashProperty, Margin, PersistFlash, SecurityState, FLASH_ERASE_KEY,
    FLASH_ERASED_BYTE,
};
pub use nor::NorFlashAdapter;
pub use ram::{FaultPlan, RamFlash};
