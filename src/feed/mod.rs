//! Latest-value publish point consumed by the live plot.
//!
//! A mailbox, not a queue: each key holds only its most recent point plus an
//! unread flag. Uses `DashMap` so the aggregator can publish while a plot
//! renderer reads without external locking.

use dashmap::DashMap;

use crate::sensor::Value;

/// Feed key: a sensor id, plus the value column when a sensor publishes more
/// than one plotted column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedKey {
    pub sensor: String,
    pub index: Option<usize>,
}

impl FeedKey {
    /// Key for a sensor's single (primary) value.
    pub fn sensor(sensor: impl Into<String>) -> Self {
        Self {
            sensor: sensor.into(),
            index: None,
        }
    }

    /// Key for one of a sensor's plotted value columns.
    pub fn value(sensor: impl Into<String>, index: usize) -> Self {
        Self {
            sensor: sensor.into(),
            index: Some(index),
        }
    }
}

/// One published point: the representative sample's timestamp and value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedPoint {
    pub timestamp: f64,
    pub value: Value,
}

#[derive(Debug)]
struct FeedEntry {
    point: FeedPoint,
    unread: bool,
}

/// Keyed map of most-recent samples with per-key unread flags.
///
/// No history, no staleness bound: a reader can observe an arbitrarily old
/// point if the feed is not being updated.
#[derive(Debug, Default)]
pub struct LiveFeed {
    entries: DashMap<FeedKey, FeedEntry>,
}

impl LiveFeed {
    /// Creates an empty feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the current point for `key` and marks it unread. O(1).
    pub fn publish(&self, key: FeedKey, point: FeedPoint) {
        self.entries.insert(
            key,
            FeedEntry {
                point,
                unread: true,
            },
        );
    }

    /// Returns the current point for `key`, clearing the unread flag. O(1).
    pub fn read(&self, key: &FeedKey) -> Option<FeedPoint> {
        let mut entry = self.entries.get_mut(key)?;
        entry.unread = false;
        Some(entry.point)
    }

    /// True when `key` has been published since it was last read.
    pub fn has_new_data(&self, key: &FeedKey) -> bool {
        self.entries
            .get(key)
            .map(|entry| entry.unread)
            .unwrap_or(false)
    }

    /// All keys currently on the feed, for consumers that enumerate channels.
    pub fn keys(&self) -> Vec<FeedKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_then_read_clears_unread() {
        let feed = LiveFeed::new();
        let key = FeedKey::sensor("W");

        feed.publish(
            key.clone(),
            FeedPoint {
                timestamp: 1.5,
                value: Value::Float(6.0),
            },
        );
        assert!(feed.has_new_data(&key));

        let point = feed.read(&key).expect("published point");
        assert_eq!(point.value, Value::Float(6.0));
        assert!(!feed.has_new_data(&key));

        // A second read returns the same point, still read.
        let again = feed.read(&key).expect("point persists");
        assert_eq!(again, point);
        assert!(!feed.has_new_data(&key));
    }

    #[test]
    fn test_publish_overwrites_in_place() {
        let feed = LiveFeed::new();
        let key = FeedKey::sensor("W");

        feed.publish(
            key.clone(),
            FeedPoint {
                timestamp: 1.0,
                value: Value::Int(5),
            },
        );
        feed.read(&key);
        feed.publish(
            key.clone(),
            FeedPoint {
                timestamp: 2.0,
                value: Value::Int(7),
            },
        );

        assert!(feed.has_new_data(&key));
        let point = feed.read(&key).expect("latest point");
        assert_eq!(point.timestamp, 2.0);
        assert_eq!(point.value, Value::Int(7));
    }

    #[test]
    fn test_unknown_key_reads_nothing() {
        let feed = LiveFeed::new();
        assert_eq!(feed.read(&FeedKey::sensor("missing")), None);
        assert!(!feed.has_new_data(&FeedKey::sensor("missing")));
    }

    #[test]
    fn test_value_column_keys_are_independent() {
        let feed = LiveFeed::new();
        feed.publish(
            FeedKey::value("P", 0),
            FeedPoint {
                timestamp: 1.0,
                value: Value::Float(0.5),
            },
        );
        feed.publish(
            FeedKey::value("P", 1),
            FeedPoint {
                timestamp: 1.0,
                value: Value::Float(0.9),
            },
        );

        feed.read(&FeedKey::value("P", 0));
        assert!(!feed.has_new_data(&FeedKey::value("P", 0)));
        assert!(feed.has_new_data(&FeedKey::value("P", 1)));
    }
}
