//! Consumer configuration structures
//!
//! [`ConsumerConfig`] is the user-facing, serde-deserializable shape (YAML
//! file or builder). [`ConsumerConfig::validate`] turns it into
//! [`ConsumerSettings`], the checked form the pipeline runs on. Every fatal
//! configuration error is raised there, before anything connects.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::parser::JsonParserConfig;

/// Default bound on messages awaiting delivery
pub const DEFAULT_MAX_UNDELIVERED_MESSAGES: usize = 1000;
/// Default maximum time a claim may take to accept a message
pub const DEFAULT_MAX_PROCESSING_TIME: Duration = Duration::from_millis(100);
/// Default consumer group
pub const DEFAULT_CONSUMER_GROUP: &str = "topic_relay_consumers";
/// Default delay between consume attempts after an error
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// librdkafka properties that may be passed through `kafka_properties`
pub const ALLOWED_KAFKA_PROPS: &[&str] = &[
    // Security settings
    "security.protocol",
    "sasl.mechanism",
    "sasl.mechanisms",
    "sasl.username",
    "sasl.password",
    "ssl.ca.location",
    "ssl.certificate.location",
    "ssl.key.location",
    "ssl.key.password",
    "ssl.endpoint.identification.algorithm",
    // Fetch settings
    "fetch.min.bytes",
    "fetch.wait.max.ms",
    "fetch.max.bytes",
    "fetch.error.backoff.ms",
    "fetch.message.max.bytes",
    // Group settings
    "session.timeout.ms",
    "heartbeat.interval.ms",
    "max.poll.interval.ms",
    "auto.commit.interval.ms",
    // Request settings
    "request.timeout.ms",
    "metadata.max.age.ms",
    "topic.metadata.refresh.interval.ms",
    "socket.receive.buffer.bytes",
    "socket.send.buffer.bytes",
    // Consumer queue settings
    "queued.min.messages",
    "queued.max.messages.kbytes",
    // Connection settings
    "reconnect.backoff.ms",
    "reconnect.backoff.max.ms",
    "connections.max.idle.ms",
    "socket.keepalive.enable",
    // Monitoring
    "statistics.interval.ms",
];

/// Where a new consumer group starts reading when it has no committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetPolicy {
    /// Start from the earliest retained message
    Oldest,
    /// Start from the next produced message
    Newest,
}

impl OffsetPolicy {
    /// Parse a policy name; empty selects the default
    pub fn parse(value: &str) -> ConsumerResult<Self> {
        match value.trim().to_lowercase().as_str() {
            "oldest" | "" => Ok(OffsetPolicy::Oldest),
            "newest" => Ok(OffsetPolicy::Newest),
            _ => Err(ConsumerError::ConfigError(format!(
                "invalid offset {:?}",
                value
            ))),
        }
    }

    /// librdkafka `auto.offset.reset` value
    pub fn as_auto_offset_reset(&self) -> &'static str {
        match self {
            OffsetPolicy::Oldest => "earliest",
            OffsetPolicy::Newest => "latest",
        }
    }
}

/// How partitions are spread across group members
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceStrategy {
    /// Contiguous partition ranges per member
    Range,
    /// Partitions dealt out in turn
    RoundRobin,
    /// Keep previous assignments across rebalances
    Sticky,
}

impl BalanceStrategy {
    /// Parse a strategy name; empty selects the default
    pub fn parse(value: &str) -> ConsumerResult<Self> {
        match value.trim().to_lowercase().as_str() {
            "range" | "" => Ok(BalanceStrategy::Range),
            "roundrobin" => Ok(BalanceStrategy::RoundRobin),
            "sticky" => Ok(BalanceStrategy::Sticky),
            _ => Err(ConsumerError::ConfigError(format!(
                "invalid balance strategy {:?}",
                value
            ))),
        }
    }

    /// librdkafka `partition.assignment.strategy` value
    pub fn as_assignment_strategy(&self) -> &'static str {
        match self {
            BalanceStrategy::Range => "range",
            BalanceStrategy::RoundRobin => "roundrobin",
            BalanceStrategy::Sticky => "cooperative-sticky",
        }
    }
}

/// Relay consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Kafka broker addresses
    pub brokers: Vec<String>,

    /// Consumer group ID
    pub consumer_group: String,

    /// Topic selection patterns; only the first one is used
    pub topics: Vec<String>,

    /// Tag name that receives the source topic on every record
    pub topic_tag: Option<String>,

    /// Maximum number of messages read but not yet delivered (0 = default)
    pub max_undelivered_messages: usize,

    /// Maximum payload length in bytes (0 = unlimited)
    pub max_message_len: usize,

    /// Maximum time a claim may take to accept a message (e.g. "100ms")
    pub max_processing_time: String,

    /// Initial offset policy (oldest, newest)
    pub offset: String,

    /// Partition balance strategy (range, roundrobin, sticky)
    pub balance_strategy: String,

    /// How often the topic catalog is re-read (e.g. "30s"); required
    pub topics_refresh_interval: Option<String>,

    /// Per-partition fetch size in bytes (0 = client default)
    pub consumer_fetch_default: u64,

    /// Delay before consuming again after an error (e.g. "5s")
    pub reconnect_delay: String,

    /// Per-claim queue depth
    pub channel_buffer_size: usize,

    /// Client identifier sent to the broker
    pub client_id: String,

    /// Timeout for metadata requests (e.g. "10s")
    pub metadata_timeout: String,

    /// Additional Kafka properties
    pub kafka_properties: HashMap<String, String>,

    /// Payload parser settings
    pub parser: JsonParserConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            topics: Vec::new(),
            topic_tag: None,
            max_undelivered_messages: DEFAULT_MAX_UNDELIVERED_MESSAGES,
            max_message_len: 0,
            max_processing_time: "100ms".to_string(),
            offset: "oldest".to_string(),
            balance_strategy: "range".to_string(),
            topics_refresh_interval: None,
            consumer_fetch_default: 0,
            reconnect_delay: "5s".to_string(),
            channel_buffer_size: 256,
            client_id: "topic-relay".to_string(),
            metadata_timeout: "10s".to_string(),
            kafka_properties: HashMap::new(),
            parser: JsonParserConfig::default(),
        }
    }
}

/// Validated configuration the pipeline runs on
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Kafka broker addresses
    pub brokers: Vec<String>,
    /// Consumer group ID
    pub consumer_group: String,
    /// Compiled topic selection pattern
    pub topic_pattern: Regex,
    /// Tag name that receives the source topic
    pub topic_tag: Option<String>,
    /// In-flight window capacity
    pub max_undelivered_messages: usize,
    /// Maximum payload length (0 = unlimited)
    pub max_message_len: usize,
    /// Maximum time a claim may take to accept a message
    pub max_processing_time: Duration,
    /// Initial offset policy
    pub offset: OffsetPolicy,
    /// Partition balance strategy
    pub balance_strategy: BalanceStrategy,
    /// Topic catalog refresh period
    pub topic_refresh_interval: Duration,
    /// Per-partition fetch size override
    pub consumer_fetch_default: Option<u64>,
    /// Delay before consuming again after an error
    pub reconnect_delay: Duration,
    /// Per-claim queue depth
    pub channel_buffer_size: usize,
    /// Client identifier
    pub client_id: String,
    /// Timeout for metadata requests
    pub metadata_timeout: Duration,
    /// Additional Kafka properties (already checked against the allow-list)
    pub kafka_properties: HashMap<String, String>,
    /// Payload parser settings
    pub parser: JsonParserConfig,
}

impl ConsumerSettings {
    /// Broker list in the comma-separated form Kafka clients expect
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

/// Builder for ConsumerConfig
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    /// Create a new consumer config builder
    pub fn new() -> Self {
        Self {
            config: ConsumerConfig::default(),
        }
    }

    /// Set the broker addresses
    pub fn brokers(mut self, brokers: Vec<String>) -> Self {
        self.config.brokers = brokers;
        self
    }

    /// Set the consumer group ID
    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.config.consumer_group = group.into();
        self
    }

    /// Set the topic selection pattern
    pub fn topic_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.topics = vec![pattern.into()];
        self
    }

    /// Tag every record with its source topic under `tag`
    pub fn topic_tag(mut self, tag: impl Into<String>) -> Self {
        self.config.topic_tag = Some(tag.into());
        self
    }

    /// Set the maximum number of undelivered messages
    pub fn max_undelivered_messages(mut self, max: usize) -> Self {
        self.config.max_undelivered_messages = max;
        self
    }

    /// Set the maximum payload length
    pub fn max_message_len(mut self, max: usize) -> Self {
        self.config.max_message_len = max;
        self
    }

    /// Set the maximum time a claim may take to accept a message
    pub fn max_processing_time(mut self, duration: impl Into<String>) -> Self {
        self.config.max_processing_time = duration.into();
        self
    }

    /// Set the initial offset policy
    pub fn offset(mut self, offset: impl Into<String>) -> Self {
        self.config.offset = offset.into();
        self
    }

    /// Set the balance strategy
    pub fn balance_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.config.balance_strategy = strategy.into();
        self
    }

    /// Set the topic refresh interval
    pub fn topics_refresh_interval(mut self, interval: impl Into<String>) -> Self {
        self.config.topics_refresh_interval = Some(interval.into());
        self
    }

    /// Set the default fetch size in bytes
    pub fn consumer_fetch_default(mut self, bytes: u64) -> Self {
        self.config.consumer_fetch_default = bytes;
        self
    }

    /// Set the reconnect delay
    pub fn reconnect_delay(mut self, delay: impl Into<String>) -> Self {
        self.config.reconnect_delay = delay.into();
        self
    }

    /// Set the channel buffer size
    pub fn channel_buffer_size(mut self, size: usize) -> Self {
        self.config.channel_buffer_size = size;
        self
    }

    /// Set the client ID reported to the brokers
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    /// Add a custom Kafka property
    pub fn kafka_property(mut self, key: String, value: String) -> Self {
        self.config.kafka_properties.insert(key, value);
        self
    }

    /// Set the parser configuration
    pub fn parser(mut self, parser: JsonParserConfig) -> Self {
        self.config.parser = parser;
        self
    }

    /// Build the consumer configuration
    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}

impl Default for ConsumerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerConfig {
    /// Create a new consumer config builder
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new()
    }

    /// Load a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> ConsumerResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Parse a YAML configuration document
    pub fn from_yaml(contents: &str) -> ConsumerResult<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConsumerResult<ConsumerSettings> {
        let brokers: Vec<String> = self
            .brokers
            .iter()
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .collect();
        if brokers.is_empty() {
            return Err(config_error("Brokers cannot be empty"));
        }

        let consumer_group = if self.consumer_group.trim().is_empty() {
            DEFAULT_CONSUMER_GROUP.to_string()
        } else {
            self.consumer_group.clone()
        };

        let pattern = self
            .topics
            .first()
            .ok_or_else(|| config_error("At least one topic pattern is required"))?;
        if self.topics.len() > 1 {
            debug!(
                ignored = self.topics.len() - 1,
                "Only the first topic pattern is used"
            );
        }
        let topic_pattern = Regex::new(pattern).map_err(|e| {
            ConsumerError::ConfigError(format!("invalid topic pattern {:?}: {}", pattern, e))
        })?;

        let max_undelivered_messages = if self.max_undelivered_messages == 0 {
            DEFAULT_MAX_UNDELIVERED_MESSAGES
        } else {
            self.max_undelivered_messages
        };

        let max_processing_time = match parse_duration(&self.max_processing_time) {
            Ok(d) if d.is_zero() => DEFAULT_MAX_PROCESSING_TIME,
            Ok(d) => d,
            Err(e) => return Err(config_error(format!("invalid max_processing_time: {}", e))),
        };

        let offset = OffsetPolicy::parse(&self.offset)?;
        let balance_strategy = BalanceStrategy::parse(&self.balance_strategy)?;

        let interval = self
            .topics_refresh_interval
            .as_deref()
            .ok_or_else(|| config_error("topics_refresh_interval is required"))?;
        let topic_refresh_interval = parse_duration(interval)
            .map_err(|e| config_error(format!("invalid topics_refresh_interval: {}", e)))?;
        if topic_refresh_interval.is_zero() {
            return Err(config_error("topics_refresh_interval must be greater than 0"));
        }

        let reconnect_delay = parse_duration(&self.reconnect_delay)
            .map_err(|e| config_error(format!("invalid reconnect_delay: {}", e)))?;
        let metadata_timeout = parse_duration(&self.metadata_timeout)
            .map_err(|e| config_error(format!("invalid metadata_timeout: {}", e)))?;
        if metadata_timeout.is_zero() {
            return Err(config_error("metadata_timeout must be greater than 0"));
        }

        if self.channel_buffer_size == 0 {
            return Err(config_error("Channel buffer size must be greater than 0"));
        }

        for key in self.kafka_properties.keys() {
            if !ALLOWED_KAFKA_PROPS.contains(&key.as_str()) {
                return Err(config_error(format!(
                    "Disallowed Kafka property '{}'. Allowed properties: {:?}",
                    key, ALLOWED_KAFKA_PROPS
                )));
            }
        }

        Ok(ConsumerSettings {
            brokers,
            consumer_group,
            topic_pattern,
            topic_tag: self.topic_tag.clone().filter(|t| !t.is_empty()),
            max_undelivered_messages,
            max_message_len: self.max_message_len,
            max_processing_time,
            offset,
            balance_strategy,
            topic_refresh_interval,
            consumer_fetch_default: Some(self.consumer_fetch_default).filter(|b| *b > 0),
            reconnect_delay,
            channel_buffer_size: self.channel_buffer_size,
            client_id: self.client_id.clone(),
            metadata_timeout,
            kafka_properties: self.kafka_properties.clone(),
            parser: self.parser.clone(),
        })
    }
}

fn config_error(message: impl Into<String>) -> ConsumerError {
    ConsumerError::ConfigError(message.into())
}

/// Parse a duration such as `"300ms"`, `"30s"`, `"1.5h"` or `"1h30m"`.
///
/// Units: `ns`, `us` (or `µs`), `ms`, `s`, `m`, `h`. A bare `"0"` is accepted.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();

    if input.is_empty() {
        return Err("duration cannot be empty".to_string());
    }
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = input;

    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_end == 0 {
            return Err(format!("invalid duration '{}': expected a number", input));
        }
        let value: f64 = rest[..number_end]
            .parse()
            .map_err(|_| format!("invalid number in duration '{}'", input))?;
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            "" => return Err(format!("missing unit in duration '{}'", input)),
            unit => return Err(format!("unknown unit '{}' in duration '{}'", unit, input)),
        };
        total_nanos += value * scale;
        rest = &rest[unit_end..];
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(format!("duration '{}' is out of range", input));
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}
