//! Session handler
//!
//! One [`SessionHandler`] serves exactly one consumer-group session:
//!
//! ```text
//! Idle --setup--> Active --cleanup--> Draining --> Closed
//! ```
//!
//! `setup` starts the confirmation task that feeds the sink's delivery
//! results into the [`DeliveryTracker`]. Every partition claim runs
//! [`GroupHandler::consume_claim`], which admits a slot before reading each
//! message, so a session never has more than `max_undelivered_messages`
//! messages between the claim and a delivery result.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::consumer::backpressure::Slot;
use crate::consumer::config::ConsumerSettings;
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::group::{GroupHandler, GroupSession};
use crate::consumer::message::{Claim, RawMessage};
use crate::consumer::metrics::ConsumerMetrics;
use crate::consumer::parser::RecordParser;
use crate::consumer::sink::DeliverySink;
use crate::consumer::tracker::DeliveryTracker;

/// Lifecycle of a session handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, setup not called yet
    Idle,
    /// Claims are being consumed
    Active,
    /// Cleanup in progress
    Draining,
    /// Cleanup finished
    Closed,
}

/// Group handler for one session
pub struct SessionHandler {
    settings: Arc<ConsumerSettings>,
    parser: Arc<dyn RecordParser>,
    sink: Arc<dyn DeliverySink>,
    tracker: Arc<DeliveryTracker>,
    metrics: ConsumerMetrics,
    state: Mutex<SessionState>,
    confirmations: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SessionHandler {
    /// Create a handler with a fresh in-flight window
    pub fn new(
        settings: Arc<ConsumerSettings>,
        parser: Arc<dyn RecordParser>,
        sink: Arc<dyn DeliverySink>,
        metrics: ConsumerMetrics,
    ) -> Self {
        let tracker = Arc::new(DeliveryTracker::new(
            settings.max_undelivered_messages,
            metrics.clone(),
        ));
        Self {
            settings,
            parser,
            sink,
            tracker,
            metrics,
            state: Mutex::new(SessionState::Idle),
            confirmations: Mutex::new(None),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// The tracker owning this session's in-flight window
    pub fn tracker(&self) -> &Arc<DeliveryTracker> {
        &self.tracker
    }

    /// Route one admitted message to exactly one outcome
    fn handle_message(&self, session: &Arc<dyn GroupSession>, slot: Slot, message: RawMessage) {
        self.metrics.increment_received();

        let max = self.settings.max_message_len;
        if max > 0 && message.len() > max {
            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                len = message.len(),
                "Rejecting oversize message"
            );
            session.mark_message(&message);
            slot.release();
            self.metrics.increment_oversize();
            self.sink.report_error(&ConsumerError::MessageTooLarge {
                actual: message.len(),
                max,
            });
            return;
        }

        let mut records = match self.parser.parse(&message.payload) {
            Ok(records) => records,
            Err(e) => {
                slot.release();
                self.metrics.increment_parse_failures();
                self.sink.report_error(&e);
                return;
            }
        };

        if let Some(tag) = &self.settings.topic_tag {
            for record in records.iter_mut() {
                record.add_tag(tag.clone(), message.topic.clone());
            }
        }

        let sink = &self.sink;
        self.tracker
            .track(slot, session.clone(), message, move || sink.submit_tracked(records));
    }
}

async fn run_confirmations(
    tracker: Arc<DeliveryTracker>,
    sink: Arc<dyn DeliverySink>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            event = sink.next_delivery() => match event {
                Some(event) => {
                    tracker.on_delivery_result(event.id, event.delivered);
                }
                None => {
                    debug!("Delivery stream closed");
                    return;
                }
            },
        }
    }

    // Results already queued when cleanup started still commit.
    while let Some(event) = sink.try_next_delivery() {
        tracker.on_delivery_result(event.id, event.delivered);
    }
}

#[async_trait]
impl GroupHandler for SessionHandler {
    async fn setup(&self, _session: Arc<dyn GroupSession>) -> ConsumerResult<()> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Idle {
                return Err(ConsumerError::SessionError(format!(
                    "setup called in state {:?}",
                    *state
                )));
            }
            *state = SessionState::Active;
        }

        let stop = CancellationToken::new();
        let task = tokio::spawn(run_confirmations(
            self.tracker.clone(),
            self.sink.clone(),
            stop.clone(),
        ));
        *self.confirmations.lock() = Some((stop, task));

        self.metrics.increment_sessions();
        info!(
            capacity = self.tracker.capacity(),
            parser = self.parser.name(),
            "Session started"
        );
        Ok(())
    }

    async fn consume_claim(&self, session: Arc<dyn GroupSession>, mut claim: Claim) -> ConsumerResult<()> {
        let cancel = session.context().clone();
        debug!(topic = claim.topic(), partition = claim.partition(), "Claim started");

        loop {
            let slot = match self.tracker.admit(&cancel).await {
                Ok(slot) => slot,
                Err(ConsumerError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            };

            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                item = claim.next() => item,
            };

            match item {
                Some(Ok(message)) => self.handle_message(&session, slot, message),
                Some(Err(e)) => {
                    warn!(
                        topic = claim.topic(),
                        partition = claim.partition(),
                        error = %e,
                        "Claim aborted by broker error"
                    );
                    return Err(e);
                }
                None => {
                    debug!(topic = claim.topic(), partition = claim.partition(), "Claim closed");
                    return Ok(());
                }
            }
        }
    }

    async fn cleanup(&self, _session: Arc<dyn GroupSession>) -> ConsumerResult<()> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Active {
                return Err(ConsumerError::SessionError(format!(
                    "cleanup called in state {:?}",
                    *state
                )));
            }
            *state = SessionState::Draining;
        }

        let confirmations = self.confirmations.lock().take();
        if let Some((stop, task)) = confirmations {
            stop.cancel();
            if let Err(e) = task.await {
                warn!(error = %e, "Confirmation task ended abnormally");
            }
        }

        *self.state.lock() = SessionState::Closed;
        info!(
            outstanding = self.tracker.outstanding(),
            pending = self.tracker.pending(),
            "Session closed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::config::ConsumerConfig;
    use crate::consumer::parser::{JsonParser, Record};
    use crate::consumer::sink::{ChannelSink, SinkHandle};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct TestSession {
        marked: Mutex<Vec<i64>>,
        token: CancellationToken,
    }

    impl GroupSession for TestSession {
        fn mark_message(&self, message: &RawMessage) {
            self.marked.lock().push(message.offset);
        }

        fn context(&self) -> &CancellationToken {
            &self.token
        }
    }

    #[derive(Debug, Default)]
    struct CountingParser {
        calls: AtomicUsize,
    }

    impl RecordParser for CountingParser {
        fn parse(&self, _payload: &[u8]) -> ConsumerResult<Vec<Record>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Record::new("counted")])
        }
    }

    fn settings(capacity: usize, max_len: usize, tag: Option<&str>) -> Arc<ConsumerSettings> {
        let mut builder = ConsumerConfig::builder()
            .topic_pattern(".*")
            .topics_refresh_interval("1m")
            .max_undelivered_messages(capacity)
            .max_message_len(max_len);
        if let Some(tag) = tag {
            builder = builder.topic_tag(tag);
        }
        Arc::new(builder.build().validate().unwrap())
    }

    fn handler(
        settings: Arc<ConsumerSettings>,
        parser: Arc<dyn RecordParser>,
    ) -> (SessionHandler, SinkHandle) {
        let (sink, handle) = ChannelSink::new();
        (
            SessionHandler::new(settings, parser, Arc::new(sink), ConsumerMetrics::new()),
            handle,
        )
    }

    fn claim(items: Vec<crate::consumer::message::ClaimItem>) -> Claim {
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            tx.try_send(item).unwrap();
        }
        Claim::new("events", 0, rx)
    }

    fn message(offset: i64, payload: &'static [u8]) -> crate::consumer::message::ClaimItem {
        Ok(RawMessage::new("events", 0, offset, payload))
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (handler, _handle) = handler(settings(4, 0, None), Arc::new(JsonParser::default()));
        let session: Arc<dyn GroupSession> = Arc::new(TestSession::default());

        assert_eq!(handler.state(), SessionState::Idle);
        assert!(handler.cleanup(session.clone()).await.is_err());

        handler.setup(session.clone()).await.unwrap();
        assert_eq!(handler.state(), SessionState::Active);
        assert!(matches!(
            handler.setup(session.clone()).await,
            Err(ConsumerError::SessionError(_))
        ));

        handler.cleanup(session.clone()).await.unwrap();
        assert_eq!(handler.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_delivery_commits_offset() {
        let (handler, mut handle) = handler(settings(4, 0, Some("topic")), Arc::new(JsonParser::default()));
        let test_session = Arc::new(TestSession::default());
        let session: Arc<dyn GroupSession> = test_session.clone();

        handler.setup(session.clone()).await.unwrap();
        handler
            .consume_claim(session.clone(), claim(vec![message(10, br#"{"v": 1}"#)]))
            .await
            .unwrap();

        let batch = handle.batches.recv().await.unwrap();
        assert_eq!(batch.records[0].tags.get("topic").map(String::as_str), Some("events"));
        assert!(test_session.marked.lock().is_empty());

        handle.confirm(batch.id, true);
        tokio::time::timeout(Duration::from_secs(1), async {
            while test_session.marked.lock().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*test_session.marked.lock(), vec![10]);
        assert_eq!(handler.tracker().outstanding(), 0);

        handler.cleanup(session).await.unwrap();
    }

    #[tokio::test]
    async fn test_oversize_message_is_marked_and_never_parsed() {
        let parser = Arc::new(CountingParser::default());
        let (handler, mut handle) = handler(settings(4, 100, None), parser.clone());
        let test_session = Arc::new(TestSession::default());
        let session: Arc<dyn GroupSession> = test_session.clone();

        let payload: &'static [u8] = &[b'x'; 101];
        handler.setup(session.clone()).await.unwrap();
        handler
            .consume_claim(session.clone(), claim(vec![message(3, payload)]))
            .await
            .unwrap();

        assert_eq!(parser.calls.load(Ordering::SeqCst), 0);
        assert_eq!(*test_session.marked.lock(), vec![3]);
        assert_eq!(handler.tracker().outstanding(), 0);
        let errors = handle.drain_errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("max_message_len"));
        assert!(handle.batches.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_parse_failure_releases_slot_without_marking() {
        let (handler, mut handle) = handler(settings(2, 0, None), Arc::new(JsonParser::default()));
        let test_session = Arc::new(TestSession::default());
        let session: Arc<dyn GroupSession> = test_session.clone();

        handler.setup(session.clone()).await.unwrap();
        handler
            .consume_claim(
                session.clone(),
                claim(vec![message(0, b"not json"), message(1, br#"{"ok": true}"#)]),
            )
            .await
            .unwrap();

        let batch = handle.batches.recv().await.unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(handler.tracker().outstanding(), 1);
        assert!(test_session.marked.lock().is_empty());
        assert_eq!(handle.drain_errors().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_error_aborts_claim() {
        let (handler, _handle) = handler(settings(4, 0, None), Arc::new(JsonParser::default()));
        let session: Arc<dyn GroupSession> = Arc::new(TestSession::default());

        handler.setup(session.clone()).await.unwrap();
        let result = handler
            .consume_claim(
                session.clone(),
                claim(vec![Err(ConsumerError::ConsumeError("broker gone".into()))]),
            )
            .await;

        assert!(matches!(result, Err(ConsumerError::ConsumeError(_))));
        assert_eq!(handler.tracker().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_ends_blocked_claim() {
        let (handler, _handle) = handler(settings(1, 0, None), Arc::new(JsonParser::default()));
        let handler = Arc::new(handler);
        let test_session = Arc::new(TestSession::default());
        let session: Arc<dyn GroupSession> = test_session.clone();

        handler.setup(session.clone()).await.unwrap();

        // Sender kept alive: the claim never closes on its own.
        let (tx, rx) = mpsc::channel(4);
        tx.send(message(0, br#"{"a": 1}"#)).await.unwrap();
        tx.send(message(1, br#"{"a": 2}"#)).await.unwrap();

        let task = {
            let handler = handler.clone();
            let session = session.clone();
            tokio::spawn(async move { handler.consume_claim(session, Claim::new("events", 0, rx)).await })
        };

        // The first message holds the only slot; the loop is blocked in admission.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        test_session.token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("claim should return after cancellation")
            .unwrap();
        assert!(result.is_ok());
        drop(tx);
    }
}
