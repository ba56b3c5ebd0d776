//! Topic selection
//!
//! Resolves the configured pattern against the broker's topic catalog.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::consumer::config::ConsumerSettings;
use crate::consumer::error::ConsumerResult;
use crate::consumer::group::MetadataConnector;

/// Topics matching the selection pattern, in broker enumeration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectedTopicSet(Vec<String>);

impl SelectedTopicSet {
    /// Wrap an already filtered list
    pub fn new(topics: Vec<String>) -> Self {
        Self(topics)
    }

    /// Topic names
    pub fn topics(&self) -> &[String] {
        &self.0
    }

    /// Number of selected topics
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no topic matched
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the topic names
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }
}

/// Keep the topics matching `settings.topic_pattern`, preserving order
pub fn filter_topics(settings: &ConsumerSettings, catalog: Vec<String>) -> SelectedTopicSet {
    SelectedTopicSet(
        catalog
            .into_iter()
            .filter(|topic| settings.topic_pattern.is_match(topic))
            .collect(),
    )
}

/// Reads the catalog through a short-lived metadata connection
pub struct TopicSelector {
    connector: Arc<dyn MetadataConnector>,
    settings: Arc<ConsumerSettings>,
}

impl TopicSelector {
    /// Create a selector reading the catalog through `connector`
    pub fn new(connector: Arc<dyn MetadataConnector>, settings: Arc<ConsumerSettings>) -> Self {
        Self {
            connector,
            settings,
        }
    }

    /// List the broker's topics and keep those matching the pattern.
    ///
    /// The metadata connection is closed whether or not listing succeeded.
    pub async fn select(&self) -> ConsumerResult<SelectedTopicSet> {
        let mut client = self.connector.connect(&self.settings).await?;
        let listed = client.list_topics().await;
        client.close();

        let catalog = listed.map_err(|e| {
            warn!(error = %e, "Failed to list topics");
            e
        })?;
        let total = catalog.len();
        let selected = filter_topics(&self.settings, catalog);

        for topic in selected.iter() {
            debug!(topic = %topic, "Selected topic");
        }
        debug!(
            pattern = %self.settings.topic_pattern,
            total,
            selected = selected.len(),
            "Topic selection complete"
        );

        Ok(selected)
    }
}
