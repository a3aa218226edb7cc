//! Inter-task communication
//!
//! The persistence queue is the only way other tasks reach flash.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use flashlog_core::config::PERSIST_QUEUE_DEPTH;
use flashlog_core::PersistQueue;

/// Requests for the persistence task, woken by the idle task
pub static PERSIST_QUEUE: PersistQueue<CriticalSectionRawMutex, PERSIST_QUEUE_DEPTH> =
    PersistQueue::new();
