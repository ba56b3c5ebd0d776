//! Kafka consumer pipeline with at-least-once delivery
//!
//! This module provides:
//! - Topic selection by regular expression, refreshed periodically
//! - A bounded in-flight window between the broker and the sink
//! - Offset commits only after the sink confirmed delivery
//! - A session state machine per consumer-group session
//! - A supervisor that reconnects after failures and follows topic changes
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use topic_relay::consumer::{
//!     kafka_connectors, ChannelSink, ConsumerConfig, JsonParser, Supervisor,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ConsumerConfig::builder()
//!     .brokers(vec!["localhost:9092".to_string()])
//!     .consumer_group("relay")
//!     .topic_pattern(r"^tenant\..*\.device-data$")
//!     .topics_refresh_interval("30s")
//!     .build();
//!
//! let (sink, mut handle) = ChannelSink::new();
//! let supervisor = Supervisor::start(
//!     &config,
//!     kafka_connectors(),
//!     Arc::new(JsonParser::default()),
//!     Arc::new(sink),
//! )
//! .await?;
//!
//! while let Some(batch) = handle.batches.recv().await {
//!     // write batch.records somewhere durable, then:
//!     handle.confirm(batch.id, true);
//! }
//!
//! supervisor.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backpressure;
pub mod config;
pub mod error;
pub mod fake;
pub mod group;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod message;
pub mod metrics;
pub mod offset_manager;
pub mod parser;
pub mod retry;
pub mod selector;
pub mod session;
pub mod shutdown;
pub mod sink;
pub mod supervisor;
pub mod tracker;

pub use backpressure::{InFlightWindow, Slot};
pub use config::{
    parse_duration, BalanceStrategy, ConsumerConfig, ConsumerConfigBuilder, ConsumerSettings,
    OffsetPolicy,
};
pub use error::{ConsumerError, ConsumerResult, ErrorSeverity};
pub use group::{
    ConsumerGroup, GroupConnector, GroupHandler, GroupSession, MetadataClient, MetadataConnector,
};
pub use message::{Claim, ClaimItem, RawMessage};
pub use metrics::{ConsumerMetrics, MetricsSnapshot};
pub use offset_manager::OffsetManager;
pub use parser::{JsonParser, JsonParserConfig, Record, RecordParser};
pub use retry::sleep_or_cancelled;
pub use selector::{SelectedTopicSet, TopicSelector};
pub use session::{SessionHandler, SessionState};
pub use sink::{
    Acknowledger, ChannelSink, DeliveryEvent, DeliverySink, SinkHandle, TrackedBatch, TrackingId,
};
pub use supervisor::{BrokerConnectors, Supervisor};
pub use tracker::{DeliveryTracker, TrackingEntry};

/// Connectors backed by librdkafka
#[cfg(feature = "kafka")]
pub fn kafka_connectors() -> BrokerConnectors {
    use std::sync::Arc;

    BrokerConnectors::new(
        Arc::new(kafka::KafkaMetadataConnector),
        Arc::new(kafka::KafkaGroupConnector),
    )
}
