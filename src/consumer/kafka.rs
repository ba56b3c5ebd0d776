//! rdkafka binding of the broker interfaces
//!
//! [`KafkaMetadataConnector`] reads the topic catalog with a plain
//! `BaseConsumer`. [`KafkaGroupConnector`] creates a [`KafkaConsumerGroup`]
//! around a `StreamConsumer`; each call to `consume` is one session that
//! lasts until the next partition revocation.
//!
//! Offsets are stored explicitly (`enable.auto.offset.store=false`) when a
//! message is marked and committed by librdkafka's auto-commit, plus a final
//! synchronous commit on close.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{ClientConfig, ClientContext, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::consumer::config::ConsumerSettings;
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::group::{
    ConsumerGroup, GroupConnector, GroupHandler, GroupSession, MetadataClient, MetadataConnector,
};
use crate::consumer::message::{Claim, ClaimItem, RawMessage};
use crate::consumer::offset_manager::OffsetManager;

/// Capacity of a group's background error stream
const ERROR_CHANNEL_CAPACITY: usize = 64;

fn base_client_config(settings: &ConsumerSettings) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", settings.bootstrap_servers())
        .set("client.id", &settings.client_id);

    for (key, value) in &settings.kafka_properties {
        client_config.set(key, value);
    }
    client_config
}

fn group_client_config(settings: &ConsumerSettings) -> ClientConfig {
    let mut client_config = base_client_config(settings);
    client_config
        .set("group.id", &settings.consumer_group)
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set("enable.partition.eof", "false")
        .set("auto.offset.reset", settings.offset.as_auto_offset_reset())
        .set(
            "partition.assignment.strategy",
            settings.balance_strategy.as_assignment_strategy(),
        );

    if let Some(bytes) = settings.consumer_fetch_default {
        client_config.set("max.partition.fetch.bytes", bytes.to_string());
    }
    client_config.set_log_level(RDKafkaLogLevel::Info);
    client_config
}

fn to_raw_message(message: &BorrowedMessage<'_>) -> RawMessage {
    let mut raw = RawMessage::new(
        message.topic(),
        message.partition(),
        message.offset(),
        bytes::Bytes::copy_from_slice(message.payload().unwrap_or_default()),
    );
    if let Some(key) = message.key() {
        raw = raw.with_key(bytes::Bytes::copy_from_slice(key));
    }
    if let Some(millis) = message.timestamp().to_millis() {
        raw = raw.with_timestamp(millis);
    }
    raw
}

/// Opens metadata-only connections
#[derive(Debug, Default, Clone)]
pub struct KafkaMetadataConnector;

#[async_trait]
impl MetadataConnector for KafkaMetadataConnector {
    async fn connect(&self, settings: &ConsumerSettings) -> ConsumerResult<Box<dyn MetadataClient>> {
        let consumer: BaseConsumer = base_client_config(settings).create().map_err(|e| {
            ConsumerError::ConnectionError(format!("Failed to create metadata client: {}", e))
        })?;

        Ok(Box::new(KafkaMetadataClient {
            consumer: Some(Arc::new(consumer)),
            timeout: settings.metadata_timeout,
        }))
    }
}

/// Short-lived catalog connection
pub struct KafkaMetadataClient {
    consumer: Option<Arc<BaseConsumer>>,
    timeout: Duration,
}

#[async_trait]
impl MetadataClient for KafkaMetadataClient {
    async fn list_topics(&self) -> ConsumerResult<Vec<String>> {
        let consumer = self
            .consumer
            .clone()
            .ok_or_else(|| ConsumerError::MetadataError("metadata client closed".to_string()))?;
        let timeout = self.timeout;

        let metadata = tokio::task::spawn_blocking(move || consumer.fetch_metadata(None, timeout))
            .await
            .map_err(|e| ConsumerError::MetadataError(format!("metadata task failed: {}", e)))?
            .map_err(|e| ConsumerError::MetadataError(format!("Failed to fetch metadata: {}", e)))?;

        Ok(metadata
            .topics()
            .iter()
            .map(|topic| topic.name().to_string())
            .collect())
    }

    fn close(&mut self) {
        self.consumer = None;
    }
}

/// Client context of a consumer group
pub struct RelayConsumerContext {
    session: Mutex<Option<CancellationToken>>,
    errors: mpsc::Sender<ConsumerError>,
}

impl RelayConsumerContext {
    fn push_error(&self, err: ConsumerError) {
        if let Err(mpsc::error::TrySendError::Full(err)) = self.errors.try_send(err) {
            warn!(error = %err, "Error stream full, dropping error");
        }
    }
}

impl ClientContext for RelayConsumerContext {
    fn error(&self, error: KafkaError, reason: &str) {
        error!(error = %error, reason, "Kafka client error");
        self.push_error(ConsumerError::KafkaError(error));
    }
}

impl ConsumerContext for RelayConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                info!(partitions_revoked = tpl.count(), "Partitions revoked, ending session");
                if let Some(token) = self.session.lock().as_ref() {
                    token.cancel();
                }
            }
            Rebalance::Assign(tpl) => {
                info!(partitions_assigned = tpl.count(), "Partitions assigned");
            }
            Rebalance::Error(e) => {
                warn!(error = %e, "Rebalance error");
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!("Offsets committed"),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => {
                warn!(error = %e, "Offset commit failed");
                self.push_error(ConsumerError::KafkaError(e));
            }
        }
    }
}

type RelayConsumer = StreamConsumer<RelayConsumerContext>;

/// Joins consumer groups through librdkafka
#[derive(Debug, Default, Clone)]
pub struct KafkaGroupConnector;

#[async_trait]
impl GroupConnector for KafkaGroupConnector {
    async fn connect(&self, settings: &ConsumerSettings) -> ConsumerResult<Arc<dyn ConsumerGroup>> {
        Ok(Arc::new(KafkaConsumerGroup::new(settings)?))
    }
}

/// One librdkafka consumer-group member
pub struct KafkaConsumerGroup {
    consumer: Arc<RelayConsumer>,
    subscription: Mutex<Vec<String>>,
    errors: Mutex<Option<mpsc::Receiver<ConsumerError>>>,
    closed: CancellationToken,
    channel_buffer_size: usize,
    max_processing_time: Duration,
}

impl KafkaConsumerGroup {
    /// Create the consumer; joining happens on the first `consume`
    pub fn new(settings: &ConsumerSettings) -> ConsumerResult<Self> {
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let context = RelayConsumerContext {
            session: Mutex::new(None),
            errors: errors_tx,
        };

        let consumer: RelayConsumer = group_client_config(settings)
            .create_with_context(context)
            .map_err(|e| ConsumerError::ConnectionError(format!("Failed to create consumer: {}", e)))?;

        Ok(Self {
            consumer: Arc::new(consumer),
            subscription: Mutex::new(Vec::new()),
            errors: Mutex::new(Some(errors_rx)),
            closed: CancellationToken::new(),
            channel_buffer_size: settings.channel_buffer_size,
            max_processing_time: settings.max_processing_time,
        })
    }

    fn ensure_subscribed(&self, topics: &[String]) -> ConsumerResult<()> {
        let mut subscription = self.subscription.lock();
        if subscription.as_slice() == topics {
            return Ok(());
        }

        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&names)
            .map_err(|e| ConsumerError::ConnectionError(format!("Failed to subscribe: {}", e)))?;
        info!(topics = ?topics, "Subscribed to topics");
        *subscription = topics.to_vec();
        Ok(())
    }

    fn set_paused(&self, topic: &str, partition: i32, paused: bool) {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(topic, partition);
        let result = if paused {
            self.consumer.pause(&tpl)
        } else {
            self.consumer.resume(&tpl)
        };
        if let Err(e) = result {
            warn!(topic, partition, paused, error = %e, "Failed to change partition state");
        }
    }

    /// Hand `message` to its claim, pausing the partition while the claim
    /// is slower than `max_processing_time`.
    async fn forward(
        &self,
        tx: &mpsc::Sender<ClaimItem>,
        message: RawMessage,
        token: &CancellationToken,
    ) -> Forward {
        let permit = match tokio::time::timeout(self.max_processing_time, tx.reserve()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Forward::ClaimClosed,
            Err(_) => {
                debug!(
                    topic = %message.topic,
                    partition = message.partition,
                    "Claim busy, pausing partition"
                );
                self.set_paused(&message.topic, message.partition, true);
                let reserved = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    _ = self.closed.cancelled() => None,
                    permit = tx.reserve() => Some(permit),
                };
                self.set_paused(&message.topic, message.partition, false);
                match reserved {
                    Some(Ok(permit)) => permit,
                    Some(Err(_)) => return Forward::ClaimClosed,
                    None => return Forward::Stopped,
                }
            }
        };
        permit.send(Ok(message));
        Forward::Sent
    }

    async fn dispatch(
        &self,
        token: &CancellationToken,
        session: Arc<dyn GroupSession>,
        handler: Arc<dyn GroupHandler>,
    ) -> ConsumerResult<()> {
        let mut claims: HashMap<(String, i32), mpsc::Sender<ClaimItem>> = HashMap::new();
        let mut tasks: JoinSet<ConsumerResult<()>> = JoinSet::new();
        let mut stream = self.consumer.stream();

        let result = loop {
            let polled = tokio::select! {
                biased;
                _ = token.cancelled() => break Ok(()),
                _ = self.closed.cancelled() => break Err(ConsumerError::GroupClosed),
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok(Ok(())) => continue,
                        Ok(Err(e)) => break Err(e),
                        Err(e) => break Err(ConsumerError::SessionError(format!("claim task failed: {}", e))),
                    }
                }
                polled = stream.next() => match polled {
                    Some(Ok(message)) => Ok(to_raw_message(&message)),
                    Some(Err(e)) => Err(e),
                    None => break Err(ConsumerError::GroupClosed),
                },
            };

            let message = match polled {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Consume error");
                    self.consumer.context().push_error(ConsumerError::KafkaError(e));
                    continue;
                }
            };

            let key = (message.topic.clone(), message.partition);
            let tx = match claims.get(&key) {
                Some(tx) => tx.clone(),
                None => {
                    let (tx, rx) = mpsc::channel(self.channel_buffer_size);
                    let claim = Claim::new(key.0.clone(), key.1, rx);
                    let handler = handler.clone();
                    let session = session.clone();
                    tasks.spawn(async move { handler.consume_claim(session, claim).await });
                    claims.insert(key.clone(), tx.clone());
                    tx
                }
            };

            match self.forward(&tx, message, token).await {
                Forward::Sent => {}
                Forward::ClaimClosed => {
                    debug!(topic = %key.0, partition = key.1, "Claim closed, dropping message");
                    claims.remove(&key);
                }
                Forward::Stopped if self.closed.is_cancelled() => break Err(ConsumerError::GroupClosed),
                Forward::Stopped => break Ok(()),
            }
        };

        drop(stream);
        drop(claims);
        token.cancel();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Claim ended with error during shutdown"),
                Err(e) => warn!(error = %e, "Claim task failed"),
            }
        }
        result
    }

    async fn commit_stored(&self) -> ConsumerResult<()> {
        let consumer = self.consumer.clone();
        let committed = tokio::task::spawn_blocking(move || consumer.commit_consumer_state(CommitMode::Sync))
            .await
            .map_err(|e| ConsumerError::SessionError(format!("commit task failed: {}", e)))?;

        match committed {
            Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(e) => Err(ConsumerError::KafkaError(e)),
        }
    }
}

enum Forward {
    Sent,
    ClaimClosed,
    Stopped,
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    async fn consume(
        &self,
        cancel: CancellationToken,
        topics: &[String],
        handler: Arc<dyn GroupHandler>,
    ) -> ConsumerResult<()> {
        if self.closed.is_cancelled() {
            return Err(ConsumerError::GroupClosed);
        }
        self.ensure_subscribed(topics)?;

        let token = cancel.child_token();
        *self.consumer.context().session.lock() = Some(token.clone());
        let session: Arc<dyn GroupSession> = Arc::new(KafkaSession {
            consumer: self.consumer.clone(),
            offsets: OffsetManager::new(),
            token: token.clone(),
        });

        if let Err(e) = handler.setup(session.clone()).await {
            *self.consumer.context().session.lock() = None;
            return Err(e);
        }

        let result = self.dispatch(&token, session.clone(), handler.clone()).await;
        let cleanup = handler.cleanup(session).await;
        *self.consumer.context().session.lock() = None;

        result.and(cleanup)
    }

    fn errors(&self) -> Option<mpsc::Receiver<ConsumerError>> {
        self.errors.lock().take()
    }

    async fn close(&self) -> ConsumerResult<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();

        let committed = self.commit_stored().await;
        self.consumer.unsubscribe();
        info!("Consumer group closed");
        committed
    }
}

struct KafkaSession {
    consumer: Arc<RelayConsumer>,
    offsets: OffsetManager,
    token: CancellationToken,
}

impl GroupSession for KafkaSession {
    fn mark_message(&self, message: &RawMessage) {
        let Some(next) = self
            .offsets
            .mark_offset(&message.topic, message.partition, message.offset)
        else {
            return;
        };

        if let Err(e) = self.consumer.store_offset(&message.topic, message.partition, next) {
            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = next,
                error = %e,
                "Failed to store offset"
            );
        }
    }

    fn context(&self) -> &CancellationToken {
        &self.token
    }
}
