#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use topic_relay::consumer::fake::FakeBroker;
use topic_relay::consumer::sink::ReportedError;
use topic_relay::consumer::{
    ChannelSink, ConsumerConfig, ConsumerConfigBuilder, JsonParser, SinkHandle, Supervisor,
    TrackedBatch,
};

pub const WAIT: Duration = Duration::from_secs(5);
pub const QUIET: Duration = Duration::from_millis(150);

/// Settings tuned for tests: fast reconnects, no automatic refresh
pub fn test_config(pattern: &str) -> ConsumerConfigBuilder {
    ConsumerConfig::builder()
        .brokers(vec!["fake:9092".to_string()])
        .consumer_group("relay-tests")
        .topic_pattern(pattern)
        .topics_refresh_interval("1h")
        .reconnect_delay("10ms")
}

pub async fn start(broker: &FakeBroker, config: &ConsumerConfig) -> (Supervisor, SinkHandle) {
    let (sink, handle) = ChannelSink::new();
    let supervisor = Supervisor::start(
        config,
        broker.connectors(),
        Arc::new(JsonParser::default()),
        Arc::new(sink),
    )
    .await
    .expect("supervisor should start");
    let connected = tokio::time::timeout(WAIT, supervisor.wait_connected()).await;
    assert_eq!(connected, Ok(true), "supervisor should join a consumer group");
    (supervisor, handle)
}

pub async fn next_batch(handle: &mut SinkHandle) -> TrackedBatch {
    tokio::time::timeout(WAIT, handle.batches.recv())
        .await
        .expect("timed out waiting for a batch")
        .expect("batch channel closed")
}

/// Assert that no batch arrives for a short while
pub async fn assert_no_batch(handle: &mut SinkHandle) {
    if let Ok(Some(batch)) = tokio::time::timeout(QUIET, handle.batches.recv()).await {
        panic!("unexpected batch {}: {:?}", batch.id, batch.records);
    }
}

pub async fn next_error(handle: &mut SinkHandle) -> ReportedError {
    tokio::time::timeout(WAIT, handle.errors.recv())
        .await
        .expect("timed out waiting for an error")
        .expect("error channel closed")
}

/// Wait for an error whose message contains `needle`, skipping others
pub async fn wait_for_error(handle: &mut SinkHandle, needle: &str) -> ReportedError {
    loop {
        let error = next_error(handle).await;
        if error.message.contains(needle) {
            return error;
        }
    }
}

pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
