//! Single-writer service adapter
//!
//! The engine is not reentrant, so every mutation goes through one owner.
//! Producers push [`PersistRequest`]s into a bounded [`PersistQueue`];
//! an idle hook wakes the [`PersistService`], which drains the queue into
//! its [`PersistStore`] and then applies the fill-threshold shift policy.
//!
//! ```text
//! producers ──submit──► PersistQueue ──idle_hook──► PersistService ──► PersistStore
//! ```

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use flashlog_hal::PersistFlash;

use crate::error::{PersistError, Result};
use crate::gc::ShiftOutcome;
use crate::record::{Record, Tag};
use crate::region::RegionState;
use crate::store::PersistStore;
use crate::timestamp::TimestampSource;

/// Work for the persistence service
#[derive(Debug, Clone)]
pub enum PersistRequest {
    /// Commit a staged record
    Commit(Record),
    /// Run garbage collection
    GarbageCollect,
    /// Run the threshold-aware bank shift
    CleanAndShift {
        force: bool,
        threshold: u8,
        history: u32,
    },
    /// Add a tag to the delete table
    MarkForDeletion(Tag),
    /// Remove a tag from the delete table
    UnmarkForDeletion(Tag),
}

/// Bounded request queue plus the idle wake-up
pub struct PersistQueue<M: RawMutex, const N: usize> {
    requests: Channel<M, PersistRequest, N>,
    pending: Signal<M, ()>,
}

impl<M: RawMutex, const N: usize> PersistQueue<M, N> {
    /// Create an empty queue
    pub const fn new() -> Self {
        Self {
            requests: Channel::new(),
            pending: Signal::new(),
        }
    }

    /// Queue a request without waiting
    pub fn submit(&self, request: PersistRequest) -> Result<()> {
        self.requests.try_send(request).map_err(|_| {
            warn!("persist queue full");
            PersistError::QueueFull
        })
    }

    /// Queue a request, waiting for room
    pub async fn send(&self, request: PersistRequest) {
        self.requests.send(request).await;
    }

    /// Call when the system is idle; wakes the service if work is queued
    pub fn idle_hook(&self) -> bool {
        if self.requests.is_empty() {
            return false;
        }
        self.pending.signal(());
        true
    }

    /// Wait for the idle hook
    pub async fn wait(&self) {
        self.pending.wait().await;
    }

    /// Queued requests
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn take(&self) -> Option<PersistRequest> {
        self.requests.try_receive().ok()
    }
}

impl<M: RawMutex, const N: usize> Default for PersistQueue<M, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// What one service pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServiceReport {
    /// Requests that succeeded
    pub completed: usize,
    /// Requests that returned an error
    pub failed: usize,
    /// Result of the fill-threshold policy, if it ran a shift
    pub shift: Option<ShiftOutcome>,
}

/// Owner of the store, fed from a [`PersistQueue`]
pub struct PersistService<'q, F, T, M: RawMutex, const N: usize> {
    store: PersistStore<F, T>,
    queue: &'q PersistQueue<M, N>,
}

impl<'q, F, T, M, const N: usize> PersistService<'q, F, T, M, N>
where
    F: PersistFlash,
    T: TimestampSource,
    M: RawMutex,
{
    pub fn new(store: PersistStore<F, T>, queue: &'q PersistQueue<M, N>) -> Self {
        Self { store, queue }
    }

    /// Get the store for direct reads
    pub fn store(&mut self) -> &mut PersistStore<F, T> {
        &mut self.store
    }

    /// Execute one request
    pub fn handle(&mut self, request: PersistRequest) -> Result<()> {
        match request {
            PersistRequest::Commit(mut record) => self.store.write_record(&mut record).map(|_| ()),
            PersistRequest::GarbageCollect => self.store.garbage_collect(),
            PersistRequest::CleanAndShift {
                force,
                threshold,
                history,
            } => self
                .store
                .primary_sector_clean_and_shift(force, threshold, history)
                .map(|_| ()),
            PersistRequest::MarkForDeletion(tag) => self.store.mark_for_deletion(tag).map(|_| ()),
            PersistRequest::UnmarkForDeletion(tag) => {
                self.store.unmark_for_deletion(tag).map(|_| ())
            }
        }
    }

    /// Drain the queue, then run the shift policy
    pub fn service_pending(&mut self) -> ServiceReport {
        let mut report = ServiceReport::default();
        while let Some(request) = self.queue.take() {
            match self.handle(request) {
                Ok(()) => report.completed += 1,
                Err(e) => {
                    error!("persist request failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        match self.maintain() {
            Ok(shift) => report.shift = shift,
            Err(e) => error!("bank shift policy failed: {}", e),
        }
        report
    }

    /// Shift banks once the primary bank is filled past the configured threshold
    fn maintain(&mut self) -> Result<Option<ShiftOutcome>> {
        if self.store.state() != RegionState::Ready {
            return Ok(None);
        }
        let bank = self.store.primary_bank();
        let fill = self.store.fill_percent(bank.base, bank.size)?;
        let threshold = self.store.config().fill_threshold;
        if fill < threshold {
            return Ok(None);
        }

        let history = self.store.config().max_history;
        info!("bank {} is {}% full, shifting", bank.id, fill);
        self.store
            .primary_sector_clean_and_shift(true, threshold, history)
            .map(Some)
    }

    /// Serve requests forever, one pass per idle wake-up
    pub async fn run(&mut self) {
        loop {
            self.queue.wait().await;
            let report = self.service_pending();
            trace!(
                "persist pass: {} done, {} failed",
                report.completed,
                report.failed
            );
        }
    }
}
