//! Idle notification for the persistence task
//!
//! Embassy has no idle callback, so a slow ticker stands in for one: when
//! nothing else is due it pokes the queue, which wakes the persistence
//! task only if requests are waiting.

use defmt::*;
use embassy_time::{Duration, Ticker};

use crate::channels::PERSIST_QUEUE;

/// Poll interval in milliseconds
pub const IDLE_POLL_MS: u64 = 50;

#[embassy_executor::task]
pub async fn idle_task() {
    info!("Idle task started");

    let mut ticker = Ticker::every(Duration::from_millis(IDLE_POLL_MS));
    loop {
        ticker.next().await;
        PERSIST_QUEUE.idle_hook();
    }
}
