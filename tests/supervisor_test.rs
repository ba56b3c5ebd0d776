//! Supervisor behavior: topic refresh, group swaps, reconnects and error
//! forwarding

mod common;

use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use topic_relay::consumer::fake::FakeBroker;
use topic_relay::consumer::{ChannelSink, ConsumerError, JsonParser, Supervisor};

#[tokio::test]
async fn test_start_selects_matching_topics() {
    let broker = FakeBroker::new();
    broker.create_topic("tenant.a.device-data", 1);
    broker.create_topic("tenant.b.audit", 1);
    broker.create_topic("tenant.c.device-data", 1);

    let config = test_config(r"^tenant\..*\.device-data$").build();
    let (supervisor, _handle) = start(&broker, &config).await;

    assert_eq!(
        supervisor.topics().topics(),
        &["tenant.a.device-data".to_string(), "tenant.c.device-data".to_string()]
    );
    assert_eq!(supervisor.generation(), 1);
    assert_eq!(broker.metadata_connects(), broker.metadata_closes());
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_start_retries_until_catalog_available() {
    let broker = FakeBroker::new();
    broker.create_topic("events.a", 1);
    broker.produce("events.a", 0, r#"{"after":"outage"}"#);
    broker.fail_next_list_topics(2);

    let config = test_config(r"^events\.").build();
    let (sink, mut handle) = ChannelSink::new();
    let supervisor = Supervisor::start(
        &config,
        broker.connectors(),
        Arc::new(JsonParser::default()),
        Arc::new(sink),
    )
    .await
    .expect("catalog failures must not prevent startup");

    wait_for_error(&mut handle, "injected metadata failure").await;
    wait_for_error(&mut handle, "injected metadata failure").await;

    let batch = next_batch(&mut handle).await;
    handle.confirm(batch.id, true);
    assert!(broker.wait_for_committed("events.a", 0, 1, WAIT).await);

    assert_eq!(supervisor.generation(), 1);
    assert_eq!(broker.group_connects(), 1);
    assert_eq!(broker.metadata_connects(), broker.metadata_closes());
    assert_eq!(supervisor.metrics().snapshot().consume_errors, 2);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_start_retries_until_group_available() {
    let broker = FakeBroker::new();
    broker.create_topic("events.a", 1);
    broker.produce("events.a", 0, r#"{"after":"outage"}"#);
    broker.fail_next_group_connects(2);

    let config = test_config(r"^events\.").build();
    let (sink, mut handle) = ChannelSink::new();
    let supervisor = Supervisor::start(
        &config,
        broker.connectors(),
        Arc::new(JsonParser::default()),
        Arc::new(sink),
    )
    .await
    .expect("connection failures must not prevent startup");

    let error = wait_for_error(&mut handle, "injected connection failure").await;
    assert!(error.message.starts_with("Connection error"));
    wait_for_error(&mut handle, "injected connection failure").await;

    let batch = next_batch(&mut handle).await;
    handle.confirm(batch.id, true);
    assert!(broker.wait_for_committed("events.a", 0, 1, WAIT).await);

    assert_eq!(supervisor.generation(), 1);
    assert_eq!(broker.group_connects(), 1);
    assert_eq!(broker.group_closes(), 0);
    supervisor.shutdown().await;
    assert_eq!(broker.group_closes(), 1);
}

#[tokio::test]
async fn test_shutdown_before_group_joined() {
    let broker = FakeBroker::new();
    broker.create_topic("events.a", 1);
    broker.fail_next_group_connects(usize::MAX);

    let config = test_config(r"^events\.").reconnect_delay("1h").build();
    let (sink, mut handle) = ChannelSink::new();
    let supervisor = Supervisor::start(
        &config,
        broker.connectors(),
        Arc::new(JsonParser::default()),
        Arc::new(sink),
    )
    .await
    .unwrap();

    wait_for_error(&mut handle, "injected connection failure").await;
    tokio::time::timeout(WAIT, supervisor.shutdown())
        .await
        .expect("shutdown must interrupt the reconnect delay");

    assert!(!supervisor.wait_connected().await);
    assert_eq!(supervisor.generation(), 0);
    assert_eq!(broker.group_closes(), 0);
}

#[tokio::test]
async fn test_start_rejects_invalid_config() {
    let broker = FakeBroker::new();
    let config = test_config("(unclosed").build();
    let (sink, _handle) = ChannelSink::new();

    let result = Supervisor::start(
        &config,
        broker.connectors(),
        Arc::new(JsonParser::default()),
        Arc::new(sink),
    )
    .await;

    assert!(matches!(result, Err(ConsumerError::ConfigError(_))));
    assert_eq!(broker.metadata_connects(), 0);
}

#[tokio::test]
async fn test_refresh_with_unchanged_topics_keeps_group() {
    let broker = FakeBroker::new();
    broker.create_topic("events.a", 1);
    broker.create_topic("other", 1);

    let config = test_config(r"^events\.").build();
    let (supervisor, _handle) = start(&broker, &config).await;

    // A new topic that does not match leaves the selection unchanged.
    broker.create_topic("audit.events", 1);
    assert!(!supervisor.refresh_now().await.unwrap());
    assert!(!supervisor.refresh_now().await.unwrap());

    assert_eq!(supervisor.generation(), 1);
    assert_eq!(broker.group_connects(), 1);
    assert_eq!(broker.group_closes(), 0);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_refresh_swaps_group_when_topics_change() {
    let broker = FakeBroker::new();
    broker.create_topic("events.a", 1);
    broker.produce("events.a", 0, r#"{"from":"a"}"#);

    let config = test_config(r"^events\.").build();
    let (supervisor, mut handle) = start(&broker, &config).await;

    let batch = next_batch(&mut handle).await;
    handle.confirm(batch.id, true);
    assert!(broker.wait_for_committed("events.a", 0, 1, WAIT).await);

    broker.create_topic("events.b", 1);
    broker.produce("events.b", 0, r#"{"from":"b"}"#);
    assert!(supervisor.refresh_now().await.unwrap());

    assert_eq!(supervisor.generation(), 2);
    assert_eq!(supervisor.topics().len(), 2);
    assert_eq!(broker.group_connects(), 2);
    assert_eq!(broker.group_closes(), 1);

    let batch = next_batch(&mut handle).await;
    assert_eq!(batch.records[0].fields["from"], json!("b"));
    handle.confirm(batch.id, true);
    assert!(broker.wait_for_committed("events.b", 0, 1, WAIT).await);

    // The replaced session restarted without a reconnect delay or error.
    assert_eq!(supervisor.metrics().snapshot().consume_errors, 0);
    assert_eq!(supervisor.metrics().snapshot().group_swaps, 1);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_refresh_follows_deleted_topics() {
    let broker = FakeBroker::new();
    broker.create_topic("events.a", 1);
    broker.create_topic("events.b", 1);

    let config = test_config(r"^events\.").build();
    let (supervisor, _handle) = start(&broker, &config).await;

    broker.delete_topic("events.a");
    assert!(supervisor.refresh_now().await.unwrap());
    assert_eq!(supervisor.topics().topics(), &["events.b".to_string()]);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_refresh_failure_keeps_current_group() {
    let broker = FakeBroker::new();
    broker.create_topic("events.a", 1);

    let config = test_config(r"^events\.").build();
    let (supervisor, _handle) = start(&broker, &config).await;

    broker.create_topic("events.b", 1);
    broker.fail_next_list_topics(1);
    assert!(supervisor.refresh_now().await.is_err());

    broker.fail_next_group_connects(1);
    assert!(supervisor.refresh_now().await.is_err());
    assert_eq!(supervisor.generation(), 1);
    assert_eq!(supervisor.topics().len(), 1);

    assert!(supervisor.refresh_now().await.unwrap());
    assert_eq!(supervisor.generation(), 2);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_periodic_refresh_picks_up_new_topics() {
    let broker = FakeBroker::new();
    broker.create_topic("events.a", 1);

    let config = test_config(r"^events\.")
        .topics_refresh_interval("20ms")
        .build();
    let (supervisor, mut handle) = start(&broker, &config).await;

    broker.create_topic("events.late", 1);
    broker.produce("events.late", 0, r#"{"late":1}"#);

    assert!(eventually(|| supervisor.topics().len() == 2).await);
    let batch = next_batch(&mut handle).await;
    handle.confirm(batch.id, true);
    assert!(broker.wait_for_committed("events.late", 0, 1, WAIT).await);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_no_matching_topics_waits_for_refresh() {
    let broker = FakeBroker::new();
    broker.create_topic("unrelated", 1);

    let config = test_config(r"^events\.").build();
    let (supervisor, mut handle) = start(&broker, &config).await;
    assert!(supervisor.topics().is_empty());

    broker.create_topic("events.a", 1);
    broker.produce("events.a", 0, r#"{"first":true}"#);
    assert!(supervisor.refresh_now().await.unwrap());

    let batch = next_batch(&mut handle).await;
    handle.confirm(batch.id, true);
    assert!(broker.wait_for_committed("events.a", 0, 1, WAIT).await);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_consume_failures_are_retried() {
    let broker = FakeBroker::new();
    broker.create_topic("events.a", 1);
    broker.produce("events.a", 0, r#"{"retry":1}"#);
    broker.fail_next_consumes(2);

    let config = test_config(r"^events\.").build();
    let (supervisor, mut handle) = start(&broker, &config).await;

    let batch = next_batch(&mut handle).await;
    handle.confirm(batch.id, true);
    assert!(broker.wait_for_committed("events.a", 0, 1, WAIT).await);

    assert!(broker.consume_calls() >= 3);
    assert_eq!(supervisor.metrics().snapshot().consume_errors, 2);

    let errors = handle.drain_errors();
    assert_eq!(
        errors
            .iter()
            .filter(|e| e.message.contains("injected consume failure"))
            .count(),
        2
    );
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_claim_error_restarts_session() {
    let broker = FakeBroker::new();
    broker.create_topic("events.a", 1);
    broker.inject_claim_error();

    let config = test_config(r"^events\.").build();
    let (supervisor, mut handle) = start(&broker, &config).await;

    wait_for_error(&mut handle, "injected claim error").await;

    broker.produce("events.a", 0, r#"{"after":"error"}"#);
    let batch = next_batch(&mut handle).await;
    handle.confirm(batch.id, true);
    assert!(broker.wait_for_committed("events.a", 0, 1, WAIT).await);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_group_errors_are_forwarded() {
    let broker = FakeBroker::new();
    broker.create_topic("events.a", 1);

    let config = test_config(r"^events\.").build();
    let (supervisor, mut handle) = start(&broker, &config).await;

    assert!(broker.push_group_error("broker went away"));
    let error = wait_for_error(&mut handle, "broker went away").await;
    assert!(error.message.starts_with("Connection error"));

    // After a swap, errors come from the new group.
    broker.create_topic("events.b", 1);
    assert!(supervisor.refresh_now().await.unwrap());
    assert!(broker.push_group_error("new group trouble"));
    wait_for_error(&mut handle, "new group trouble").await;

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_group_once() {
    let broker = FakeBroker::new();
    broker.create_topic("events.a", 1);

    let config = test_config(r"^events\.").build();
    let (supervisor, _handle) = start(&broker, &config).await;

    supervisor.shutdown().await;
    supervisor.shutdown().await;

    assert_eq!(broker.group_connects(), 1);
    assert_eq!(broker.group_closes(), 1);
    assert!(supervisor.cancellation_token().is_cancelled());
}

#[tokio::test]
async fn test_refresh_after_shutdown_does_not_swap() {
    let broker = FakeBroker::new();
    broker.create_topic("events.a", 1);

    let config = test_config(r"^events\.").build();
    let (supervisor, _handle) = start(&broker, &config).await;
    supervisor.shutdown().await;

    broker.create_topic("events.b", 1);
    assert!(!supervisor.refresh_now().await.unwrap());
    assert_eq!(supervisor.generation(), 1);

    // The group connected for the discarded swap is closed again.
    assert_eq!(broker.group_connects(), 2);
    assert_eq!(broker.group_closes(), 2);
}
