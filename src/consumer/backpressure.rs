//! Bounded in-flight window for the consumer
//!
//! The window is a counting admission gate: a message may only be read from a
//! partition claim after a [`Slot`] has been acquired, and the slot is held
//! until the message reaches a terminal outcome (delivery result or rejection).
//! Dropping the slot returns it to the window.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::consumer::error::{ConsumerError, ConsumerResult};

/// Counting admission gate with a fixed capacity
#[derive(Debug, Clone)]
pub struct InFlightWindow {
    /// Maximum number of outstanding slots
    capacity: usize,
    /// Outstanding slot count (mirrors the semaphore for cheap status reads)
    outstanding: Arc<AtomicUsize>,
    /// Semaphore for limiting concurrency
    semaphore: Arc<Semaphore>,
}

impl InFlightWindow {
    /// Create a new window. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            warn!("In-flight window capacity of 0 requested, using 1");
            1
        } else {
            capacity
        };

        Self {
            capacity,
            outstanding: Arc::new(AtomicUsize::new(0)),
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Acquire a slot, waiting until one is free or `cancel` fires.
    ///
    /// Cancellation wins over a free slot: once the token is cancelled no
    /// further slot is handed out.
    pub async fn acquire(&self, cancel: &CancellationToken) -> ConsumerResult<Slot> {
        if cancel.is_cancelled() {
            return Err(ConsumerError::Cancelled);
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConsumerError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => permit.map_err(|_| {
                ConsumerError::ChannelError("in-flight window closed".to_string())
            })?,
        };

        Ok(self.slot_from(permit))
    }

    /// Try to acquire a slot without blocking
    pub fn try_acquire(&self) -> Option<Slot> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(self.slot_from(permit)),
            Err(_) => None,
        }
    }

    fn slot_from(&self, permit: OwnedSemaphorePermit) -> Slot {
        let count = self.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Acquired slot, in flight: {}/{}", count, self.capacity);
        Slot {
            outstanding: self.outstanding.clone(),
            _permit: permit,
        }
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently held
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Number of slots that can be acquired without waiting
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// A reserved place in the window; released on drop
#[derive(Debug)]
pub struct Slot {
    outstanding: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl Slot {
    /// Return the slot to the window
    pub fn release(self) {}
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}
