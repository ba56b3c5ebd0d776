//! Delivery tracker
//!
//! Correlates tracking ids handed out by the sink with the message they came
//! from, so that a delivery confirmation can mark the right offset on the
//! right session. Each entry owns its in-flight [`Slot`]; removing the entry
//! is what frees capacity.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::consumer::backpressure::{InFlightWindow, Slot};
use crate::consumer::error::ConsumerResult;
use crate::consumer::group::GroupSession;
use crate::consumer::message::RawMessage;
use crate::consumer::metrics::ConsumerMetrics;
use crate::consumer::sink::TrackingId;

/// A message awaiting its delivery result
pub struct TrackingEntry {
    session: Arc<dyn GroupSession>,
    message: RawMessage,
    slot: Slot,
}

impl TrackingEntry {
    /// Bind a message to the session that will commit it and the slot it holds
    pub fn new(session: Arc<dyn GroupSession>, message: RawMessage, slot: Slot) -> Self {
        Self {
            session,
            message,
            slot,
        }
    }

    /// The tracked message
    pub fn message(&self) -> &RawMessage {
        &self.message
    }

    fn complete(self, delivered: bool) {
        if delivered {
            self.session.mark_message(&self.message);
        }
        self.slot.release();
    }
}

impl fmt::Debug for TrackingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingEntry")
            .field("topic", &self.message.topic)
            .field("partition", &self.message.partition)
            .field("offset", &self.message.offset)
            .finish_non_exhaustive()
    }
}

/// Bounded map of undelivered messages
#[derive(Debug)]
pub struct DeliveryTracker {
    window: InFlightWindow,
    undelivered: Mutex<HashMap<TrackingId, TrackingEntry>>,
    metrics: ConsumerMetrics,
}

impl DeliveryTracker {
    /// Create a tracker allowing `capacity` undelivered messages
    pub fn new(capacity: usize, metrics: ConsumerMetrics) -> Self {
        Self {
            window: InFlightWindow::new(capacity),
            undelivered: Mutex::new(HashMap::with_capacity(capacity)),
            metrics,
        }
    }

    /// Wait for a free slot. Fails with `Cancelled` once `cancel` fires.
    pub async fn admit(&self, cancel: &CancellationToken) -> ConsumerResult<Slot> {
        self.window.acquire(cancel).await
    }

    /// Store `entry` under `id`
    pub fn register(&self, id: TrackingId, entry: TrackingEntry) {
        let mut undelivered = self.undelivered.lock();
        Self::insert(&mut undelivered, id, entry);
    }

    /// Submit a message through `submit` and register it under the returned id.
    ///
    /// Submission and registration happen under the tracker lock, so a
    /// confirmation for the new id cannot be processed before the entry exists.
    pub fn track<F>(
        &self,
        slot: Slot,
        session: Arc<dyn GroupSession>,
        message: RawMessage,
        submit: F,
    ) -> TrackingId
    where
        F: FnOnce() -> TrackingId,
    {
        let mut undelivered = self.undelivered.lock();
        let id = submit();
        Self::insert(&mut undelivered, id, TrackingEntry::new(session, message, slot));
        self.metrics.increment_submitted();
        id
    }

    fn insert(map: &mut HashMap<TrackingId, TrackingEntry>, id: TrackingId, entry: TrackingEntry) {
        if let Some(displaced) = map.insert(id, entry) {
            warn!(
                %id,
                topic = %displaced.message.topic,
                partition = displaced.message.partition,
                offset = displaced.message.offset,
                "Duplicate tracking id, releasing displaced entry"
            );
            displaced.complete(false);
        }
    }

    /// Apply a delivery result.
    ///
    /// A delivered message is marked on its session before its slot is
    /// released. Returns `false` when `id` is not tracked.
    pub fn on_delivery_result(&self, id: TrackingId, delivered: bool) -> bool {
        let entry = self.undelivered.lock().remove(&id);

        match entry {
            Some(entry) => {
                debug!(
                    %id,
                    delivered,
                    topic = %entry.message.topic,
                    partition = entry.message.partition,
                    offset = entry.message.offset,
                    "Delivery result"
                );
                self.metrics.record_delivery(delivered);
                entry.complete(delivered);
                true
            }
            None => {
                error!(%id, delivered, "Delivery result for unknown tracking id");
                self.metrics.increment_unknown_deliveries();
                false
            }
        }
    }

    /// Number of held slots
    pub fn outstanding(&self) -> usize {
        self.window.outstanding()
    }

    /// Window capacity
    pub fn capacity(&self) -> usize {
        self.window.capacity()
    }

    /// Free slots
    pub fn available(&self) -> usize {
        self.window.available()
    }

    /// Number of registered entries
    pub fn pending(&self) -> usize {
        self.undelivered.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSession {
        marked: Mutex<Vec<i64>>,
        token: CancellationToken,
    }

    impl GroupSession for RecordingSession {
        fn mark_message(&self, message: &RawMessage) {
            self.marked.lock().push(message.offset);
        }

        fn context(&self) -> &CancellationToken {
            &self.token
        }
    }

    fn message(offset: i64) -> RawMessage {
        RawMessage::new("events", 0, offset, &b"{}"[..])
    }

    #[tokio::test]
    async fn test_delivered_marks_and_releases() {
        let tracker = DeliveryTracker::new(2, ConsumerMetrics::new());
        let session = Arc::new(RecordingSession::default());
        let cancel = CancellationToken::new();

        let slot = tracker.admit(&cancel).await.unwrap();
        let id = tracker.track(slot, session.clone(), message(7), || TrackingId(1));
        assert_eq!(tracker.outstanding(), 1);
        assert_eq!(tracker.pending(), 1);

        assert!(tracker.on_delivery_result(id, true));
        assert_eq!(*session.marked.lock(), vec![7]);
        assert_eq!(tracker.outstanding(), 0);
        assert_eq!(tracker.pending(), 0);
    }

    struct WindowObservingSession {
        tracker: Arc<DeliveryTracker>,
        available_at_mark: Mutex<Vec<usize>>,
        token: CancellationToken,
    }

    impl GroupSession for WindowObservingSession {
        fn mark_message(&self, _message: &RawMessage) {
            self.available_at_mark.lock().push(self.tracker.available());
        }

        fn context(&self) -> &CancellationToken {
            &self.token
        }
    }

    #[tokio::test]
    async fn test_mark_happens_before_slot_release() {
        let tracker = Arc::new(DeliveryTracker::new(1, ConsumerMetrics::new()));
        let session = Arc::new(WindowObservingSession {
            tracker: tracker.clone(),
            available_at_mark: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
        });

        let slot = tracker.admit(&CancellationToken::new()).await.unwrap();
        let id = tracker.track(slot, session.clone(), message(4), || TrackingId(1));
        assert_eq!(tracker.available(), 0);

        assert!(tracker.on_delivery_result(id, true));
        assert_eq!(*session.available_at_mark.lock(), vec![0]);
        assert_eq!(tracker.available(), 1);
    }

    #[tokio::test]
    async fn test_undelivered_releases_without_marking() {
        let tracker = DeliveryTracker::new(1, ConsumerMetrics::new());
        let session = Arc::new(RecordingSession::default());
        let cancel = CancellationToken::new();

        let slot = tracker.admit(&cancel).await.unwrap();
        tracker.register(TrackingId(3), TrackingEntry::new(session.clone(), message(1), slot));

        assert!(tracker.on_delivery_result(TrackingId(3), false));
        assert!(session.marked.lock().is_empty());
        assert_eq!(tracker.available(), 1);
    }

    #[tokio::test]
    async fn test_unknown_id_is_counted() {
        let metrics = ConsumerMetrics::new();
        let tracker = DeliveryTracker::new(1, metrics.clone());

        assert!(!tracker.on_delivery_result(TrackingId(99), true));
        assert_eq!(metrics.snapshot().unknown_deliveries, 1);
    }

    #[tokio::test]
    async fn test_second_result_for_same_id_is_unknown() {
        let tracker = DeliveryTracker::new(1, ConsumerMetrics::new());
        let session = Arc::new(RecordingSession::default());
        let slot = tracker.admit(&CancellationToken::new()).await.unwrap();
        let id = tracker.track(slot, session.clone(), message(0), || TrackingId(5));

        assert!(tracker.on_delivery_result(id, true));
        assert!(!tracker.on_delivery_result(id, true));
        assert_eq!(session.marked.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_releases_displaced_slot() {
        let tracker = DeliveryTracker::new(2, ConsumerMetrics::new());
        let session = Arc::new(RecordingSession::default());
        let cancel = CancellationToken::new();

        let first = tracker.admit(&cancel).await.unwrap();
        tracker.register(TrackingId(1), TrackingEntry::new(session.clone(), message(1), first));
        let second = tracker.admit(&cancel).await.unwrap();
        tracker.register(TrackingId(1), TrackingEntry::new(session.clone(), message(2), second));

        assert_eq!(tracker.outstanding(), 1);
        assert_eq!(tracker.pending(), 1);
        assert!(session.marked.lock().is_empty());
    }

    #[tokio::test]
    async fn test_admit_blocks_at_capacity() {
        let tracker = Arc::new(DeliveryTracker::new(1, ConsumerMetrics::new()));
        let session = Arc::new(RecordingSession::default());
        let cancel = CancellationToken::new();

        let slot = tracker.admit(&cancel).await.unwrap();
        let id = tracker.track(slot, session, message(0), || TrackingId(1));

        let blocked = tokio::time::timeout(Duration::from_millis(50), tracker.admit(&cancel)).await;
        assert!(blocked.is_err());

        tracker.on_delivery_result(id, true);
        let slot = tokio::time::timeout(Duration::from_millis(200), tracker.admit(&cancel))
            .await
            .expect("slot should be free")
            .unwrap();
        drop(slot);
    }
}
