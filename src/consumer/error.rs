//! Consumer error types

use std::io;
use thiserror::Error;

/// Result type for consumer operations
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Consumer error types
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Kafka client errors
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    KafkaError(#[from] rdkafka::error::KafkaError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Connection errors
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Topic catalog errors
    #[error("Metadata error: {0}")]
    MetadataError(String),

    /// Broker-side consumption errors
    #[error("Consume error: {0}")]
    ConsumeError(String),

    /// Message parsing errors
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Payload larger than `max_message_len`
    #[error("message exceeds max_message_len (actual {actual}, max {max})")]
    MessageTooLarge {
        /// Payload length in bytes
        actual: usize,
        /// Configured limit
        max: usize,
    },

    /// The consumer group was closed while in use
    #[error("consumer group closed")]
    GroupClosed,

    /// A cancellable wait observed cancellation
    #[error("operation cancelled")]
    Cancelled,

    /// Session lifecycle misuse
    #[error("Session error: {0}")]
    SessionError(String),

    /// Channel errors
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// IO errors
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    /// Configuration file errors
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

impl ConsumerError {
    /// Get error severity
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ConsumerError::ConfigError(_) | ConsumerError::YamlError(_) => ErrorSeverity::Fatal,
            ConsumerError::ParseError(_) | ConsumerError::MessageTooLarge { .. } => {
                ErrorSeverity::Warning
            }
            ConsumerError::Cancelled => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Per-message failures that don't stop processing
    Warning,
    /// Broker-level errors that are retried after the reconnect delay
    Error,
    /// Fatal errors that prevent startup
    Fatal,
}
