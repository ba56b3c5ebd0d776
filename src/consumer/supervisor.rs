//! Supervisor loop
//!
//! Owns group membership for the lifetime of the relay. Three tasks run
//! under one root [`CancellationToken`]:
//!
//! - the consume loop, which joins the first consumer group, then runs one
//!   session after another on the active group and waits `reconnect_delay`
//!   after a failure;
//! - the error forwarder, which reports the active group's background errors
//!   to the sink and follows group swaps;
//! - the refresh loop, which re-selects topics every
//!   `topic_refresh_interval` and swaps in a new group when the set changed.
//!
//! The topic set, the group and a generation counter are swapped together
//! under one lock. A session that fails because its group was replaced is
//! restarted immediately on the new group. Broker failures, including those
//! before the first group is joined, are reported to the sink and retried.

use parking_lot::Mutex;
use std::future::pending;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::consumer::config::{ConsumerConfig, ConsumerSettings};
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::group::{ConsumerGroup, GroupConnector, MetadataConnector};
use crate::consumer::metrics::ConsumerMetrics;
use crate::consumer::parser::RecordParser;
use crate::consumer::retry::sleep_or_cancelled;
use crate::consumer::selector::{SelectedTopicSet, TopicSelector};
use crate::consumer::session::SessionHandler;
use crate::consumer::sink::DeliverySink;

/// The broker connectors a supervisor uses
#[derive(Clone)]
pub struct BrokerConnectors {
    /// Opens short-lived catalog connections
    pub metadata: Arc<dyn MetadataConnector>,
    /// Joins consumer groups
    pub group: Arc<dyn GroupConnector>,
}

impl BrokerConnectors {
    /// Bundle a catalog and a group connector
    pub fn new(metadata: Arc<dyn MetadataConnector>, group: Arc<dyn GroupConnector>) -> Self {
        Self { metadata, group }
    }
}

struct Membership {
    topics: SelectedTopicSet,
    /// `None` until the first group was joined
    group: Option<Arc<dyn ConsumerGroup>>,
    /// Number of groups joined so far
    generation: u64,
}

struct Shared {
    settings: Arc<ConsumerSettings>,
    selector: TopicSelector,
    group_connector: Arc<dyn GroupConnector>,
    parser: Arc<dyn RecordParser>,
    sink: Arc<dyn DeliverySink>,
    metrics: ConsumerMetrics,
    membership: Mutex<Membership>,
    /// Serializes refreshes from the consume loop, the refresh loop and callers
    refreshing: tokio::sync::Mutex<()>,
    generation_tx: watch::Sender<u64>,
}

impl Shared {
    fn snapshot(&self) -> Option<(SelectedTopicSet, Arc<dyn ConsumerGroup>, u64)> {
        let membership = self.membership.lock();
        let group = membership.group.clone()?;
        Some((membership.topics.clone(), group, membership.generation))
    }

    fn generation(&self) -> u64 {
        self.membership.lock().generation
    }

    /// Re-select topics and join a new group if none was joined yet or the
    /// set changed.
    ///
    /// Returns whether a group was installed.
    async fn refresh(&self, cancel: &CancellationToken) -> ConsumerResult<bool> {
        let _refreshing = self.refreshing.lock().await;
        let selected = self.selector.select().await?;

        let unchanged = {
            let membership = self.membership.lock();
            membership.group.is_some() && membership.topics == selected
        };
        if unchanged {
            debug!(topics = selected.len(), "Topic set unchanged");
            return Ok(false);
        }

        let group = self.group_connector.connect(&self.settings).await?;

        let installed = {
            let mut membership = self.membership.lock();
            if cancel.is_cancelled() {
                None
            } else {
                let old = membership.group.replace(group.clone());
                membership.topics = selected.clone();
                membership.generation += 1;
                Some((old, membership.generation))
            }
        };

        let Some((old, generation)) = installed else {
            debug!("Shutting down, discarding new consumer group");
            if let Err(e) = group.close().await {
                debug!(error = %e, "Failed to close discarded consumer group");
            }
            return Ok(false);
        };

        self.generation_tx.send_replace(generation);

        match old {
            None => info!(
                generation,
                brokers = %self.settings.bootstrap_servers(),
                group = %self.settings.consumer_group,
                topics = ?selected.topics(),
                "Joined consumer group"
            ),
            Some(old) => {
                self.metrics.increment_group_swaps();
                info!(
                    generation,
                    topics = ?selected.topics(),
                    "Topic set changed, switched consumer group"
                );
                if let Err(e) = old.close().await {
                    warn!(error = %e, "Failed to close replaced consumer group");
                }
            }
        }
        Ok(true)
    }
}

/// Runs the relay until cancelled
pub struct Supervisor {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Validate `config` and start the background tasks.
    ///
    /// Only configuration errors are returned. Joining the consumer group
    /// happens in the background; its failures are reported to the sink and
    /// retried after `reconnect_delay`.
    pub async fn start(
        config: &ConsumerConfig,
        connectors: BrokerConnectors,
        parser: Arc<dyn RecordParser>,
        sink: Arc<dyn DeliverySink>,
    ) -> ConsumerResult<Self> {
        let settings = Arc::new(config.validate()?);
        Ok(Self::start_with_settings(settings, connectors, parser, sink))
    }

    /// Like [`Supervisor::start`] with already validated settings
    pub fn start_with_settings(
        settings: Arc<ConsumerSettings>,
        connectors: BrokerConnectors,
        parser: Arc<dyn RecordParser>,
        sink: Arc<dyn DeliverySink>,
    ) -> Self {
        let (generation_tx, generation_rx) = watch::channel(0);
        let shared = Arc::new(Shared {
            selector: TopicSelector::new(connectors.metadata, settings.clone()),
            settings,
            group_connector: connectors.group,
            parser,
            sink,
            metrics: ConsumerMetrics::new(),
            membership: Mutex::new(Membership {
                topics: SelectedTopicSet::default(),
                group: None,
                generation: 0,
            }),
            refreshing: tokio::sync::Mutex::new(()),
            generation_tx,
        });

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(run_consume_loop(shared.clone(), cancel.clone())),
            tokio::spawn(run_error_forwarder(shared.clone(), cancel.clone(), generation_rx)),
            tokio::spawn(run_refresh_loop(shared.clone(), cancel.clone())),
        ];

        Self {
            shared,
            cancel,
            tasks: Mutex::new(tasks),
        }
    }

    /// Root token; cancelling it stops every task
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel all tasks and wait for them to finish
    pub async fn shutdown(&self) {
        info!("Stopping supervisor");
        self.cancel.cancel();
        self.wait().await;
    }

    /// Wait for all tasks to finish without cancelling them
    pub async fn wait(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Supervisor task ended abnormally");
            }
        }
    }

    /// Wait until the first consumer group was joined.
    ///
    /// Returns `false` when the supervisor was cancelled first.
    pub async fn wait_connected(&self) -> bool {
        let mut generation_rx = self.shared.generation_tx.subscribe();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            joined = generation_rx.wait_for(|generation| *generation > 0) => joined.is_ok(),
        }
    }

    /// Currently subscribed topics
    pub fn topics(&self) -> SelectedTopicSet {
        self.shared.membership.lock().topics.clone()
    }

    /// Number of consumer groups joined so far
    pub fn generation(&self) -> u64 {
        self.shared.generation()
    }

    /// Validated settings in use
    pub fn settings(&self) -> &ConsumerSettings {
        &self.shared.settings
    }

    /// Pipeline metrics
    pub fn metrics(&self) -> &ConsumerMetrics {
        &self.shared.metrics
    }

    /// Run a topic refresh now, as the refresh loop would.
    ///
    /// Returns whether a consumer group was joined.
    pub async fn refresh_now(&self) -> ConsumerResult<bool> {
        self.shared.refresh(&self.cancel).await
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Report a broker failure and wait `reconnect_delay`.
///
/// Returns `false` when cancelled while waiting.
async fn report_and_wait(shared: &Shared, cancel: &CancellationToken, err: &ConsumerError) -> bool {
    shared.metrics.increment_consume_errors();
    shared.sink.report_error(err);
    sleep_or_cancelled(cancel, shared.settings.reconnect_delay).await
}

async fn run_consume_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        let Some((topics, group, generation)) = shared.snapshot() else {
            if let Err(e) = shared.refresh(&cancel).await {
                warn!(error = %e, "Failed to join consumer group, retrying");
                if !report_and_wait(&shared, &cancel, &e).await {
                    break;
                }
            }
            continue;
        };

        if topics.is_empty() {
            warn!(
                pattern = %shared.settings.topic_pattern,
                "No topics match the pattern, waiting for the next refresh"
            );
            if !sleep_or_cancelled(&cancel, shared.settings.reconnect_delay).await {
                break;
            }
            continue;
        }

        let handler = Arc::new(SessionHandler::new(
            shared.settings.clone(),
            shared.parser.clone(),
            shared.sink.clone(),
            shared.metrics.clone(),
        ));

        debug!(generation, topics = topics.len(), "Starting consumer group session");
        match group.consume(cancel.clone(), topics.topics(), handler).await {
            Ok(()) => debug!(generation, "Consumer group session ended"),
            Err(e) if shared.generation() != generation => {
                info!(error = %e, "Consumer group replaced, restarting session");
            }
            Err(_) if cancel.is_cancelled() => break,
            Err(e) => {
                if !report_and_wait(&shared, &cancel, &e).await {
                    break;
                }
            }
        }
    }

    let group = shared.membership.lock().group.clone();
    if let Some(group) = group {
        if let Err(e) = group.close().await {
            shared.sink.report_error(&e);
        }
    }
    info!("Consume loop stopped");
}

async fn next_error(errors: &mut Option<mpsc::Receiver<ConsumerError>>) -> Option<ConsumerError> {
    match errors {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn run_error_forwarder(
    shared: Arc<Shared>,
    cancel: CancellationToken,
    mut generation_rx: watch::Receiver<u64>,
) {
    let mut errors: Option<mpsc::Receiver<ConsumerError>> = None;
    let mut forwarding: Option<u64> = None;

    loop {
        generation_rx.borrow_and_update();
        let (group, generation) = {
            let membership = shared.membership.lock();
            (membership.group.clone(), membership.generation)
        };
        if let Some(group) = group {
            if forwarding != Some(generation) {
                forwarding = Some(generation);
                errors = group.errors();
                debug!(generation, "Forwarding consumer group errors");
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                changed = generation_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
                error = next_error(&mut errors) => match error {
                    Some(e) => shared.sink.report_error(&e),
                    None => errors = None,
                },
            }
        }
    }
}

async fn run_refresh_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let period = shared.settings.topic_refresh_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = shared.refresh(&cancel) => {
                if let Err(e) = result {
                    shared.sink.report_error(&e);
                }
            }
        }
    }
}
