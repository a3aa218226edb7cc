//! Flashlog - persistence demo firmware
//!
//! Brings up the persistence region at the end of the RP2040 flash, runs
//! the persistence service as its own task and records a boot counter on
//! every start.

#![no_std]
#![no_main]

use defmt::*;
use embassy_executor::Spawner;
use serde::{Deserialize, Serialize};
use {defmt_rtt as _, panic_probe as _};

use flashlog_core::{
    PersistRequest, PersistService, PersistStore, Record, StoreConfig, Tag, TimestampSource,
};
use flashlog_hal::PersistFlash;
use flashlog_hal_rp2040::{new_persist_flash, persist_layout};

mod channels;
mod tasks;

use channels::PERSIST_QUEUE;

/// Tag of the boot counter record
const BOOT_INFO_TAG: Tag = 1;

/// Payload of the boot counter record
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Format)]
struct BootInfo {
    /// Number of boots, this one included
    count: u32,
}

/// Main entry point
#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("Flashlog firmware starting...");

    let p = embassy_rp::init(Default::default());

    let flash = new_persist_flash(p.FLASH);
    let layout = match persist_layout(&flash) {
        Ok(layout) => layout,
        Err(e) => {
            error!("Invalid persistence layout: {}", e);
            return;
        }
    };
    let mut store = match PersistStore::new(flash, StoreConfig::new(layout)) {
        Ok(store) => store,
        Err(e) => {
            error!("Invalid persistence config: {}", e);
            return;
        }
    };

    match store.initialize() {
        Ok(bank) => info!("Persistence ready, primary bank {}", bank),
        Err(e) => {
            error!("Persistence init failed: {}", e);
            return;
        }
    }

    let boot = BootInfo {
        count: last_boot(&mut store).count.wrapping_add(1),
    };
    info!("Boot #{}", boot.count);
    match Record::from_value(BOOT_INFO_TAG, &boot) {
        Ok(record) => {
            if let Err(e) = PERSIST_QUEUE.submit(PersistRequest::Commit(record)) {
                warn!("Boot record not queued: {}", e);
            }
        }
        Err(e) => warn!("Boot record not encoded: {}", e),
    }

    let service = PersistService::new(store, &PERSIST_QUEUE);
    spawner.spawn(tasks::persist_task(service)).unwrap();
    spawner.spawn(tasks::idle_task()).unwrap();

    info!("All tasks spawned");
}

/// Boot info from the most recent boot record, or zero
fn last_boot<F: PersistFlash, T: TimestampSource>(store: &mut PersistStore<F, T>) -> BootInfo {
    let found = match store.get_recent_record(BOOT_INFO_TAG) {
        Ok(Some(found)) => found,
        Ok(None) => return BootInfo::default(),
        Err(e) => {
            warn!("Boot record lookup failed: {}", e);
            return BootInfo::default();
        }
    };
    match store.copy_to_ram(found.cursor) {
        Ok(record) => record.value().unwrap_or_else(|e| {
            warn!("Boot record unreadable: {}", e);
            BootInfo::default()
        }),
        Err(e) => {
            warn!("Boot record unreadable: {}", e);
            BootInfo::default()
        }
    }
}
