//! Downstream delivery sink
//!
//! Records are handed to the sink as a tracked group; the sink later emits a
//! [`DeliveryEvent`] for that group saying whether it was durably delivered.
//! [`ChannelSink`] is the in-process implementation: submitted batches come
//! out of a [`SinkHandle`], which is also where delivery is confirmed.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};

use crate::consumer::error::{ConsumerError, ErrorSeverity};
use crate::consumer::parser::Record;

/// Opaque handle correlating a submitted record group with its delivery result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackingId(pub u64);

impl fmt::Display for TrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Asynchronous delivery result for one tracked group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryEvent {
    /// Group the result is for
    pub id: TrackingId,
    /// Whether the group was durably delivered
    pub delivered: bool,
}

/// Downstream collaborator receiving records and errors
#[async_trait]
pub trait DeliverySink: Send + Sync + 'static {
    /// Submit a record group for tracked delivery
    fn submit_tracked(&self, records: Vec<Record>) -> TrackingId;

    /// Wait for the next delivery result. Cancel-safe.
    async fn next_delivery(&self) -> Option<DeliveryEvent>;

    /// Next delivery result if one is already queued
    fn try_next_delivery(&self) -> Option<DeliveryEvent>;

    /// Surface an error to the operator
    fn report_error(&self, error: &ConsumerError);
}

/// A record group handed to the sink
#[derive(Debug, Clone)]
pub struct TrackedBatch {
    /// Tracking id minted for this group
    pub id: TrackingId,
    /// The records
    pub records: Vec<Record>,
}

/// An error reported through [`DeliverySink::report_error`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedError {
    /// Rendered error message
    pub message: String,
    /// Error severity
    pub severity: ErrorSeverity,
}

/// Channel-backed [`DeliverySink`]
pub struct ChannelSink {
    next_id: AtomicU64,
    batches: mpsc::UnboundedSender<TrackedBatch>,
    deliveries_tx: mpsc::UnboundedSender<DeliveryEvent>,
    deliveries: Mutex<mpsc::UnboundedReceiver<DeliveryEvent>>,
    errors: mpsc::UnboundedSender<ReportedError>,
}

impl fmt::Debug for ChannelSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSink")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ChannelSink {
    /// Create a sink and the handle that drives it
    pub fn new() -> (Self, SinkHandle) {
        let (batches_tx, batches_rx) = mpsc::unbounded_channel();
        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        let sink = Self {
            next_id: AtomicU64::new(1),
            batches: batches_tx,
            deliveries_tx: deliveries_tx.clone(),
            deliveries: Mutex::new(deliveries_rx),
            errors: errors_tx,
        };
        let handle = SinkHandle {
            batches: batches_rx,
            errors: errors_rx,
            acknowledger: Acknowledger { tx: deliveries_tx },
        };
        (sink, handle)
    }
}

#[async_trait]
impl DeliverySink for ChannelSink {
    fn submit_tracked(&self, records: Vec<Record>) -> TrackingId {
        let id = TrackingId(self.next_id.fetch_add(1, Ordering::Relaxed));

        // Nothing to deliver: the group is complete as soon as it exists.
        if records.is_empty() {
            let _ = self.deliveries_tx.send(DeliveryEvent {
                id,
                delivered: true,
            });
            return id;
        }

        if self.batches.send(TrackedBatch { id, records }).is_err() {
            warn!(%id, "Sink output closed, reporting group as undelivered");
            let _ = self.deliveries_tx.send(DeliveryEvent {
                id,
                delivered: false,
            });
        }
        id
    }

    async fn next_delivery(&self) -> Option<DeliveryEvent> {
        self.deliveries.lock().await.recv().await
    }

    fn try_next_delivery(&self) -> Option<DeliveryEvent> {
        self.deliveries.try_lock().ok()?.try_recv().ok()
    }

    fn report_error(&self, err: &ConsumerError) {
        error!(severity = ?err.severity(), "{}", err);
        let _ = self.errors.send(ReportedError {
            message: err.to_string(),
            severity: err.severity(),
        });
    }
}

/// Cloneable handle for confirming delivery of tracked groups
#[derive(Debug, Clone)]
pub struct Acknowledger {
    tx: mpsc::UnboundedSender<DeliveryEvent>,
}

impl Acknowledger {
    /// Report the outcome for `id`
    pub fn confirm(&self, id: TrackingId, delivered: bool) {
        if self.tx.send(DeliveryEvent { id, delivered }).is_err() {
            warn!(%id, "Delivery stream closed, dropping confirmation");
        }
    }
}

/// Downstream end of a [`ChannelSink`]
#[derive(Debug)]
pub struct SinkHandle {
    /// Submitted record groups
    pub batches: mpsc::UnboundedReceiver<TrackedBatch>,
    /// Reported errors
    pub errors: mpsc::UnboundedReceiver<ReportedError>,
    acknowledger: Acknowledger,
}

impl SinkHandle {
    /// Report the outcome for `id`
    pub fn confirm(&self, id: TrackingId, delivered: bool) {
        self.acknowledger.confirm(id, delivered);
    }

    /// A cloneable acknowledger for use from other tasks
    pub fn acknowledger(&self) -> Acknowledger {
        self.acknowledger.clone()
    }

    /// All errors reported so far
    pub fn drain_errors(&mut self) -> Vec<ReportedError> {
        let mut out = Vec::new();
        while let Ok(err) = self.errors.try_recv() {
            out.push(err);
        }
        out
    }
}
