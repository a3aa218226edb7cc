//! Persistence task
//!
//! Owns the store. Every flash mutation in the firmware runs here, one
//! request at a time.

use defmt::*;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use flashlog_core::config::PERSIST_QUEUE_DEPTH;
use flashlog_core::{BasicCounter, PersistService};
use flashlog_hal_rp2040::Rp2040PersistFlash;

/// The service as run by this firmware
pub type FirmwareService = PersistService<
    'static,
    Rp2040PersistFlash<'static>,
    BasicCounter,
    CriticalSectionRawMutex,
    PERSIST_QUEUE_DEPTH,
>;

#[embassy_executor::task]
pub async fn persist_task(mut service: FirmwareService) {
    info!("Persist task started");
    service.run().await;
}
