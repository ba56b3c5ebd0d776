//! Capability interfaces for the broker collaborators
//!
//! The pipeline only talks to the broker through these traits. Two
//! implementations exist: the rdkafka binding in [`crate::consumer::kafka`]
//! and the scriptable in-process broker in [`crate::consumer::fake`].
//!
//! The consumer-group contract follows the claim model: a call to
//! [`ConsumerGroup::consume`] joins the group, runs one session, and returns
//! when the session ends (rebalance, error, close or cancellation). Within a
//! session the group calls [`GroupHandler::setup`] once, then
//! [`GroupHandler::consume_claim`] concurrently for every assigned partition,
//! and finally [`GroupHandler::cleanup`] after all claim loops have returned.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::consumer::config::ConsumerSettings;
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::message::{Claim, RawMessage};

/// Short-lived connection used to read the broker's topic catalog
#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// All topic names known to the broker, in broker enumeration order
    async fn list_topics(&self) -> ConsumerResult<Vec<String>>;

    /// Release the connection
    fn close(&mut self);
}

/// Opens [`MetadataClient`]s
#[async_trait]
pub trait MetadataConnector: Send + Sync {
    /// Connect to `settings.brokers`
    async fn connect(&self, settings: &ConsumerSettings) -> ConsumerResult<Box<dyn MetadataClient>>;
}

/// Membership in one consumer group
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Join the group for `topics` and run one session with `handler`.
    ///
    /// Blocks until the session ends. Returns `Ok(())` when the session ended
    /// because of a rebalance or because `cancel` fired, and an error when
    /// the broker failed or the group was closed.
    async fn consume(
        &self,
        cancel: CancellationToken,
        topics: &[String],
        handler: Arc<dyn GroupHandler>,
    ) -> ConsumerResult<()>;

    /// Background errors of this group. The receiver can be taken once.
    fn errors(&self) -> Option<mpsc::Receiver<ConsumerError>>;

    /// Leave the group; any running `consume` returns [`ConsumerError::GroupClosed`]
    async fn close(&self) -> ConsumerResult<()>;
}

/// Creates [`ConsumerGroup`]s
#[async_trait]
pub trait GroupConnector: Send + Sync {
    /// Connect to `settings.brokers` as a member of `settings.consumer_group`
    async fn connect(&self, settings: &ConsumerSettings) -> ConsumerResult<Arc<dyn ConsumerGroup>>;
}

/// One consumer-group session as seen by the handler
pub trait GroupSession: Send + Sync {
    /// Mark `message` as processed so its offset is committed
    fn mark_message(&self, message: &RawMessage);

    /// Token cancelled when the session ends
    fn context(&self) -> &CancellationToken;
}

/// Callbacks driven by [`ConsumerGroup::consume`]
#[async_trait]
pub trait GroupHandler: Send + Sync {
    /// Called once when a session opens, before any claim
    async fn setup(&self, session: Arc<dyn GroupSession>) -> ConsumerResult<()>;

    /// Called once per claim in its own task; runs until the claim closes
    async fn consume_claim(&self, session: Arc<dyn GroupSession>, claim: Claim) -> ConsumerResult<()>;

    /// Called once after every `consume_claim` returned
    async fn cleanup(&self, session: Arc<dyn GroupSession>) -> ConsumerResult<()>;
}
