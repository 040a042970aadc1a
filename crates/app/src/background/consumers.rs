//! Diagnostic registry of pages that are currently being fed spoofed data.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use geo_core::{GeoConsumer, PageId};

/// Seconds after which an entry that was not refreshed is dropped on read.
pub const CONSUMER_TTL_SECS: i64 = 5 * 60;

#[derive(Debug, Default)]
pub struct ConsumerTracker {
    entries: HashMap<PageId, GeoConsumer>,
}

impl ConsumerTracker {
    pub fn report(&mut self, page_id: PageId, url: String, title: String, now: DateTime<Utc>) {
        self.entries.insert(
            page_id,
            GeoConsumer {
                page_id,
                url,
                title,
                last_seen: now,
            },
        );
    }

    /// Prune stale entries and return the rest, most recently seen first.
    pub fn snapshot(&mut self, now: DateTime<Utc>) -> Vec<GeoConsumer> {
        let ttl = TimeDelta::seconds(CONSUMER_TTL_SECS);
        self.entries
            .retain(|_, consumer| now.signed_duration_since(consumer.last_seen) <= ttl);
        let mut consumers: Vec<_> = self.entries.values().cloned().collect();
        consumers.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.page_id.cmp(&b.page_id))
        });
        consumers
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_entries_are_pruned_on_read() {
        let now = Utc::now();
        let mut tracker = ConsumerTracker::default();
        tracker.report(PageId(1), "https://old.example".into(), "Old".into(), now - TimeDelta::minutes(6));
        tracker.report(PageId(2), "https://fresh.example".into(), "Fresh".into(), now - TimeDelta::minutes(1));

        let snapshot = tracker.snapshot(now);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].page_id, PageId(2));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn snapshot_is_sorted_newest_first_and_reports_refresh() {
        let now = Utc::now();
        let mut tracker = ConsumerTracker::default();
        tracker.report(PageId(1), "a".into(), "A".into(), now - TimeDelta::seconds(30));
        tracker.report(PageId(2), "b".into(), "B".into(), now - TimeDelta::seconds(10));
        tracker.report(PageId(3), "c".into(), "C".into(), now - TimeDelta::seconds(20));
        let order: Vec<_> = tracker.snapshot(now).iter().map(|c| c.page_id.0).collect();
        assert_eq!(order, [2, 3, 1]);

        tracker.report(PageId(1), "a2".into(), "A2".into(), now);
        let snapshot = tracker.snapshot(now);
        assert_eq!(snapshot[0].page_id, PageId(1));
        assert_eq!(snapshot[0].url, "a2");
        assert_eq!(snapshot.len(), 3);
    }
}
