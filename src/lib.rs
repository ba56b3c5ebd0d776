//! Bounded, at-least-once relay from Kafka topics to an acknowledging sink
//!
//! The relay subscribes to every topic whose name matches a regular
//! expression, parses each message into records, hands them to a sink and
//! commits the message's offset only once the sink confirmed delivery. The
//! number of messages between the broker and a confirmation is bounded.
//!
//! See [`consumer`] for the pipeline and [`consumer::Supervisor`] for the
//! entry point.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]

/// Consumer pipeline for Kafka
pub mod consumer;

pub use consumer::{
    ChannelSink, ConsumerConfig, ConsumerError, ConsumerResult, DeliverySink, JsonParser,
    Record, RecordParser, Supervisor,
};
