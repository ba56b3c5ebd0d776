//! In-process fake broker for tests
//!
//! [`FakeBroker`] implements every broker interface in memory: a topic
//! catalog, an append-only log per partition and the committed position of
//! the consumer group. Sessions replay each partition from its committed
//! position, so a message that was never marked is delivered again by the
//! next session.
//!
//! Failures are scripted from the test side:
//!
//! ```text
//! fail_next_list_topics(n)    next n catalog reads fail
//! fail_next_group_connects(n) next n group connections fail
//! fail_next_consumes(n)       next n `consume` calls fail immediately
//! inject_claim_error()        the next claim starts with a broker error
//! trigger_rebalance()         every running session ends
//! push_group_error(msg)       background error on the newest group
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::consumer::config::ConsumerSettings;
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::group::{
    ConsumerGroup, GroupConnector, GroupHandler, GroupSession, MetadataClient, MetadataConnector,
};
use crate::consumer::message::{Claim, ClaimItem, RawMessage};
use crate::consumer::offset_manager::OffsetManager;
use crate::consumer::supervisor::BrokerConnectors;

const CLAIM_BUFFER: usize = 16;

#[derive(Default)]
struct BrokerState {
    /// Topic name to partition count, in creation order
    catalog: Mutex<Vec<(String, i32)>>,
    logs: Mutex<HashMap<(String, i32), Vec<RawMessage>>>,
    appended: Notify,
    committed: OffsetManager,
    sessions: Mutex<Vec<CancellationToken>>,
    group_errors: Mutex<Vec<mpsc::Sender<ConsumerError>>>,

    list_failures: AtomicUsize,
    connect_failures: AtomicUsize,
    consume_failures: AtomicUsize,
    claim_errors: AtomicUsize,

    metadata_connects: AtomicUsize,
    metadata_closes: AtomicUsize,
    group_connects: AtomicUsize,
    group_closes: AtomicUsize,
    consume_calls: AtomicUsize,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl BrokerState {
    fn read_from(&self, topic: &str, partition: i32, offset: i64) -> Vec<RawMessage> {
        self.logs
            .lock()
            .get(&(topic.to_string(), partition))
            .map(|log| {
                log.iter()
                    .filter(|m| m.offset >= offset)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn partitions(&self, topic: &str) -> Option<i32> {
        self.catalog
            .lock()
            .iter()
            .find(|(name, _)| name == topic)
            .map(|(_, partitions)| *partitions)
    }
}

/// Scriptable in-memory broker
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<BrokerState>,
}

impl FakeBroker {
    /// Empty broker with no topics
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a topic with `partitions` partitions (at least one)
    pub fn create_topic(&self, name: impl Into<String>, partitions: i32) {
        let name = name.into();
        let mut catalog = self.state.catalog.lock();
        if !catalog.iter().any(|(existing, _)| *existing == name) {
            catalog.push((name, partitions.max(1)));
        }
    }

    /// Remove a topic from the catalog; its log is kept
    pub fn delete_topic(&self, name: &str) {
        self.state.catalog.lock().retain(|(existing, _)| existing != name);
    }

    /// Topic names in creation order
    pub fn topics(&self) -> Vec<String> {
        self.state
            .catalog
            .lock()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Append a message and return its offset
    pub fn produce(&self, topic: &str, partition: i32, payload: impl Into<bytes::Bytes>) -> i64 {
        let offset = {
            let mut logs = self.state.logs.lock();
            let log = logs.entry((topic.to_string(), partition)).or_default();
            let offset = log.len() as i64;
            log.push(RawMessage::new(topic, partition, offset, payload));
            offset
        };
        self.state.appended.notify_waiters();
        offset
    }

    /// Committed position (next offset to read) of a partition
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.state.committed.marked_offset(topic, partition)
    }

    /// Wait until the committed position of a partition reaches `position`
    pub async fn wait_for_committed(
        &self,
        topic: &str,
        partition: i32,
        position: i64,
        timeout: Duration,
    ) -> bool {
        tokio::time::timeout(timeout, async {
            while self.committed(topic, partition).unwrap_or(0) < position {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Fail the next `n` catalog reads
    pub fn fail_next_list_topics(&self, n: usize) {
        self.state.list_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` group connections
    pub fn fail_next_group_connects(&self, n: usize) {
        self.state.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` `consume` calls before a session starts
    pub fn fail_next_consumes(&self, n: usize) {
        self.state.consume_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next claim start with a broker error
    pub fn inject_claim_error(&self) {
        self.state.claim_errors.fetch_add(1, Ordering::SeqCst);
    }

    /// End every running session, as a rebalance would
    pub fn trigger_rebalance(&self) {
        for token in self.state.sessions.lock().drain(..) {
            token.cancel();
        }
    }

    /// Emit a background error on the most recently connected group
    pub fn push_group_error(&self, message: &str) -> bool {
        let sender = self.state.group_errors.lock().last().cloned();
        match sender {
            Some(tx) => tx
                .try_send(ConsumerError::ConnectionError(message.to_string()))
                .is_ok(),
            None => false,
        }
    }

    /// Metadata clients opened so far
    pub fn metadata_connects(&self) -> usize {
        self.state.metadata_connects.load(Ordering::SeqCst)
    }

    /// Metadata clients closed so far
    pub fn metadata_closes(&self) -> usize {
        self.state.metadata_closes.load(Ordering::SeqCst)
    }

    /// Consumer groups connected so far
    pub fn group_connects(&self) -> usize {
        self.state.group_connects.load(Ordering::SeqCst)
    }

    /// Consumer groups closed so far
    pub fn group_closes(&self) -> usize {
        self.state.group_closes.load(Ordering::SeqCst)
    }

    /// `consume` calls so far, including failed ones
    pub fn consume_calls(&self) -> usize {
        self.state.consume_calls.load(Ordering::SeqCst)
    }

    /// Catalog connector backed by this broker
    pub fn metadata_connector(&self) -> FakeMetadataConnector {
        FakeMetadataConnector {
            state: self.state.clone(),
        }
    }

    /// Group connector backed by this broker
    pub fn group_connector(&self) -> FakeGroupConnector {
        FakeGroupConnector {
            state: self.state.clone(),
        }
    }

    /// Both connectors, ready for a supervisor
    pub fn connectors(&self) -> BrokerConnectors {
        BrokerConnectors::new(
            Arc::new(self.metadata_connector()),
            Arc::new(self.group_connector()),
        )
    }
}

/// [`MetadataConnector`] of a [`FakeBroker`]
pub struct FakeMetadataConnector {
    state: Arc<BrokerState>,
}

#[async_trait]
impl MetadataConnector for FakeMetadataConnector {
    async fn connect(&self, _settings: &ConsumerSettings) -> ConsumerResult<Box<dyn MetadataClient>> {
        self.state.metadata_connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeMetadataClient {
            state: self.state.clone(),
            closed: false,
        }))
    }
}

struct FakeMetadataClient {
    state: Arc<BrokerState>,
    closed: bool,
}

#[async_trait]
impl MetadataClient for FakeMetadataClient {
    async fn list_topics(&self) -> ConsumerResult<Vec<String>> {
        if self.closed {
            return Err(ConsumerError::MetadataError("client closed".to_string()));
        }
        if take_one(&self.state.list_failures) {
            return Err(ConsumerError::MetadataError("injected metadata failure".to_string()));
        }
        Ok(self
            .state
            .catalog
            .lock()
            .iter()
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.metadata_closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// [`GroupConnector`] of a [`FakeBroker`]
pub struct FakeGroupConnector {
    state: Arc<BrokerState>,
}

#[async_trait]
impl GroupConnector for FakeGroupConnector {
    async fn connect(&self, _settings: &ConsumerSettings) -> ConsumerResult<Arc<dyn ConsumerGroup>> {
        if take_one(&self.state.connect_failures) {
            return Err(ConsumerError::ConnectionError(
                "injected connection failure".to_string(),
            ));
        }

        let (errors_tx, errors_rx) = mpsc::channel(64);
        self.state.group_errors.lock().push(errors_tx);
        let id = self.state.group_connects.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(group = id, "Fake consumer group connected");

        Ok(Arc::new(FakeConsumerGroup {
            id,
            state: self.state.clone(),
            errors: Mutex::new(Some(errors_rx)),
            closed: CancellationToken::new(),
        }))
    }
}

/// In-memory consumer group member
pub struct FakeConsumerGroup {
    id: usize,
    state: Arc<BrokerState>,
    errors: Mutex<Option<mpsc::Receiver<ConsumerError>>>,
    closed: CancellationToken,
}

async fn feed_claim(
    state: Arc<BrokerState>,
    topic: String,
    partition: i32,
    token: CancellationToken,
    tx: mpsc::Sender<ClaimItem>,
) {
    if take_one(&state.claim_errors) {
        let _ = tx
            .send(Err(ConsumerError::ConsumeError("injected claim error".to_string())))
            .await;
        return;
    }

    let mut next = state.committed.marked_offset(&topic, partition).unwrap_or(0);
    loop {
        let appended = state.appended.notified();
        let batch = state.read_from(&topic, partition, next);

        if batch.is_empty() {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = appended => {}
            }
            continue;
        }

        for message in batch {
            next = message.offset + 1;
            tokio::select! {
                _ = token.cancelled() => return,
                sent = tx.send(Ok(message)) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ConsumerGroup for FakeConsumerGroup {
    async fn consume(
        &self,
        cancel: CancellationToken,
        topics: &[String],
        handler: Arc<dyn GroupHandler>,
    ) -> ConsumerResult<()> {
        if self.closed.is_cancelled() {
            return Err(ConsumerError::GroupClosed);
        }
        self.state.consume_calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.state.consume_failures) {
            return Err(ConsumerError::ConsumeError("injected consume failure".to_string()));
        }

        let token = cancel.child_token();
        self.state.sessions.lock().push(token.clone());
        let session: Arc<dyn GroupSession> = Arc::new(FakeSession {
            state: self.state.clone(),
            token: token.clone(),
        });

        if let Err(e) = handler.setup(session.clone()).await {
            token.cancel();
            self.state.sessions.lock().retain(|t| !t.is_cancelled());
            return Err(e);
        }
        debug!(group = self.id, topics = ?topics, "Fake session started");

        let mut claims = JoinSet::new();
        let mut feeders = JoinSet::new();
        for topic in topics {
            let Some(partitions) = self.state.partitions(topic) else {
                continue;
            };
            for partition in 0..partitions {
                let (tx, rx) = mpsc::channel(CLAIM_BUFFER);
                feeders.spawn(feed_claim(
                    self.state.clone(),
                    topic.clone(),
                    partition,
                    token.clone(),
                    tx,
                ));
                let handler = handler.clone();
                let session = session.clone();
                let claim = Claim::new(topic.clone(), partition, rx);
                claims.spawn(async move { handler.consume_claim(session, claim).await });
            }
        }

        let result = loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => break Err(ConsumerError::GroupClosed),
                _ = token.cancelled() => break Ok(()),
                Some(joined) = claims.join_next(), if !claims.is_empty() => match joined {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => break Err(e),
                    Err(e) => break Err(ConsumerError::SessionError(format!("claim task failed: {}", e))),
                },
            }
        };

        token.cancel();
        while feeders.join_next().await.is_some() {}
        while claims.join_next().await.is_some() {}

        let cleanup = handler.cleanup(session).await;
        self.state.sessions.lock().retain(|t| !t.is_cancelled());
        debug!(group = self.id, "Fake session ended");

        result.and(cleanup)
    }

    fn errors(&self) -> Option<mpsc::Receiver<ConsumerError>> {
        self.errors.lock().take()
    }

    async fn close(&self) -> ConsumerResult<()> {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            self.state.group_closes.fetch_add(1, Ordering::SeqCst);
            debug!(group = self.id, "Fake consumer group closed");
        }
        Ok(())
    }
}

struct FakeSession {
    state: Arc<BrokerState>,
    token: CancellationToken,
}

impl GroupSession for FakeSession {
    fn mark_message(&self, message: &RawMessage) {
        self.state
            .committed
            .mark_offset(&message.topic, message.partition, message.offset);
    }

    fn context(&self) -> &CancellationToken {
        &self.token
    }
}
