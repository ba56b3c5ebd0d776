//! Per-partition offset marks
//!
//! Both session implementations record marks here before forwarding them to
//! the broker. A mark never moves a partition's position backwards: when
//! confirmations arrive out of order, the lower offset is ignored.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// Tracks the next offset to commit for each (topic, partition)
#[derive(Debug, Default)]
pub struct OffsetManager {
    /// Next offset to read, per partition
    marked: Mutex<HashMap<(String, i32), i64>>,
}

impl OffsetManager {
    /// Create an empty offset manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `offset` as processed.
    ///
    /// Returns the new position (`offset + 1`) when it advanced the
    /// partition, `None` when an equal or higher position was already marked.
    pub fn mark_offset(&self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let next = offset + 1;
        let mut marked = self.marked.lock();
        let key = (topic.to_string(), partition);
        match marked.get(&key) {
            Some(current) if *current >= next => {
                debug!(
                    topic,
                    partition,
                    offset,
                    current = *current,
                    "Ignoring mark below current position"
                );
                None
            }
            _ => {
                marked.insert(key, next);
                Some(next)
            }
        }
    }

    /// Position marked for a partition, if any
    pub fn marked_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.marked
            .lock()
            .get(&(topic.to_string(), partition))
            .copied()
    }
}
