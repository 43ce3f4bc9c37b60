//! Concurrency ceiling for in-flight evaluations.

use sledo_types::{internal_error, SledoResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Default)]
struct SlotStats {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Bounds the number of simultaneously dispatched trials.
///
/// Waiters are served in FIFO order (tokio's semaphore is fair), so queued
/// dispatches cannot be starved when slots free up.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    stats: Arc<SlotStats>,
}

/// One held concurrency slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
    stats: Arc<SlotStats>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            stats: Arc::new(SlotStats::default()),
        }
    }

    /// Wait until a slot is free.
    pub async fn acquire(&self) -> SledoResult<SlotPermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| internal_error!("concurrency limiter closed"))?;
        Ok(self.track(permit))
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<SlotPermit> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        Some(self.track(permit))
    }

    fn track(&self, permit: OwnedSemaphorePermit) -> SlotPermit {
        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(now, Ordering::SeqCst);
        SlotPermit {
            _permit: permit,
            stats: Arc::clone(&self.stats),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.stats.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of slots held at once since creation.
    pub fn peak_in_flight(&self) -> usize {
        self.stats.peak.load(Ordering::SeqCst)
    }
}
