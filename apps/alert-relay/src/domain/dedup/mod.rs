//! Alert Deduplication
//!
//! Decides which alerts in an upstream snapshot have not been accepted yet.
//!
//! The upstream exposes a rolling window of open alerts, so the same id shows
//! up on many consecutive polls, several new ids can appear at once, and the
//! window may rotate arbitrarily. Deduplication is therefore keyed on an
//! explicit set of known ids rather than a single "last id" scalar. The
//! scalar survives only as a hint for skipping an unchanged snapshot.
//!
//! The known-id set is bounded. Once ids have been evicted (or the store held
//! more history than fits at bootstrap) an id missing from memory is checked
//! against durable storage before it is offered as new.
//!
//! Ids are only added to the set through [`Deduplicator::mark_accepted`],
//! which the caller invokes after the alert is durable. An alert whose write
//! failed is therefore offered again on the next observation.

use std::collections::{HashSet, VecDeque};

use super::alert::Alert;

/// Default number of ids kept in memory.
pub const DEFAULT_KNOWN_ID_CAPACITY: usize = 1024;

/// Bounded known-id set with store fallback.
#[derive(Debug, Clone)]
pub struct Deduplicator {
    capacity: usize,
    known: HashSet<String>,
    order: VecDeque<String>,
    last_seen: Option<String>,
    window_exceeded: bool,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_KNOWN_ID_CAPACITY)
    }
}

impl Deduplicator {
    /// Create an empty deduplicator holding at most `capacity` ids in memory.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            known: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            last_seen: None,
            window_exceeded: false,
        }
    }

    /// Seed from durable storage.
    ///
    /// `recent_ids` must be ordered newest first; the first id becomes the
    /// last-seen marker. `stored_total` is the number of alerts in storage and
    /// decides whether ids outside the window must be checked against it.
    #[must_use]
    pub fn bootstrap(capacity: usize, recent_ids: Vec<String>, stored_total: u64) -> Self {
        let mut dedup = Self::new(capacity);
        let last_seen = recent_ids.first().cloned();

        for id in recent_ids.into_iter().rev() {
            dedup.remember(id);
        }

        let in_memory = u64::try_from(dedup.known.len()).unwrap_or(u64::MAX);
        if stored_total > in_memory {
            dedup.window_exceeded = true;
        }
        dedup.last_seen = last_seen;
        dedup
    }

    /// Return the alerts of `snapshot` that have not been accepted yet.
    ///
    /// Each id is offered at most once per call. `persisted` is consulted
    /// only for ids outside the in-memory window once that window has been
    /// exceeded; it should return `true` when storage already holds the id.
    pub fn filter<F>(&self, snapshot: Vec<Alert>, mut persisted: F) -> Vec<Alert>
    where
        F: FnMut(&str) -> bool,
    {
        if self.is_unchanged(&snapshot) {
            return Vec::new();
        }

        let mut offered: HashSet<String> = HashSet::new();
        let mut fresh = Vec::new();

        for alert in snapshot {
            if self.known.contains(&alert.id) || offered.contains(&alert.id) {
                continue;
            }
            if self.window_exceeded && persisted(&alert.id) {
                continue;
            }
            offered.insert(alert.id.clone());
            fresh.push(alert);
        }

        fresh
    }

    /// Record that `id` is durable. Updates the last-seen marker.
    pub fn mark_accepted(&mut self, id: &str) {
        if !self.known.contains(id) {
            self.remember(id.to_string());
        }
        self.last_seen = Some(id.to_string());
    }

    /// Whether `id` is in the in-memory window.
    #[must_use]
    pub fn is_known(&self, id: &str) -> bool {
        self.known.contains(id)
    }

    /// The most recently accepted id.
    #[must_use]
    pub fn last_seen(&self) -> Option<&str> {
        self.last_seen.as_deref()
    }

    /// Number of ids held in memory.
    #[must_use]
    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// Whether no ids are held in memory.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Maximum number of ids held in memory.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether lookups fall back to storage.
    #[must_use]
    pub const fn window_exceeded(&self) -> bool {
        self.window_exceeded
    }

    fn is_unchanged(&self, snapshot: &[Alert]) -> bool {
        match (snapshot, self.last_seen.as_deref()) {
            ([only], Some(last)) => only.id == last && self.known.contains(last),
            _ => false,
        }
    }

    fn remember(&mut self, id: String) {
        if !self.known.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.known.remove(&evicted);
                self.window_exceeded = true;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use chrono::Utc;
    use proptest::prelude::*;

    use super::*;

    fn alert(id: &str) -> Alert {
        Alert::new(id, 1, vec!["Ashkelon".to_string()], "t", Utc::now())
    }

    fn ids(alerts: &[Alert]) -> Vec<&str> {
        alerts.iter().map(|a| a.id.as_str()).collect()
    }

    #[test]
    fn new_ids_are_offered() {
        let dedup = Deduplicator::new(16);
        let fresh = dedup.filter(vec![alert("1"), alert("2")], |_| false);
        assert_eq!(ids(&fresh), vec!["1", "2"]);
    }

    #[test]
    fn accepted_ids_are_not_offered_again() {
        let mut dedup = Deduplicator::new(16);
        dedup.mark_accepted("1");

        let fresh = dedup.filter(vec![alert("1"), alert("2")], |_| false);
        assert_eq!(ids(&fresh), vec!["2"]);
        assert_eq!(dedup.last_seen(), Some("1"));
    }

    #[test]
    fn unaccepted_ids_are_offered_again() {
        let dedup = Deduplicator::new(16);
        let first = dedup.filter(vec![alert("1")], |_| false);
        let second = dedup.filter(vec![alert("1")], |_| false);
        assert_eq!(ids(&first), vec!["1"]);
        assert_eq!(ids(&second), vec!["1"]);
    }

    #[test]
    fn duplicates_within_snapshot_are_offered_once() {
        let dedup = Deduplicator::new(16);
        let fresh = dedup.filter(vec![alert("1"), alert("1"), alert("2")], |_| false);
        assert_eq!(ids(&fresh), vec!["1", "2"]);
    }

    #[test]
    fn empty_snapshot_yields_nothing() {
        let dedup = Deduplicator::new(16);
        assert!(dedup.filter(Vec::new(), |_| false).is_empty());
    }

    #[test]
    fn unchanged_snapshot_skips_store() {
        let mut dedup = Deduplicator::new(1);
        dedup.mark_accepted("0");
        dedup.mark_accepted("1");
        assert!(dedup.window_exceeded());

        let fresh = dedup.filter(vec![alert("1")], |_| panic!("store consulted"));
        assert!(fresh.is_empty());
    }

    #[test]
    fn window_evicts_oldest() {
        let mut dedup = Deduplicator::new(2);
        dedup.mark_accepted("a");
        dedup.mark_accepted("b");
        assert!(!dedup.window_exceeded());

        dedup.mark_accepted("c");
        assert_eq!(dedup.len(), 2);
        assert!(!dedup.is_known("a"));
        assert!(dedup.is_known("c"));
        assert!(dedup.window_exceeded());
    }

    #[test]
    fn evicted_ids_fall_back_to_store() {
        let mut dedup = Deduplicator::new(2);
        for id in ["a", "b", "c"] {
            dedup.mark_accepted(id);
        }

        let stored: BTreeSet<&str> = ["a", "b", "c"].into_iter().collect();
        let fresh = dedup.filter(vec![alert("a"), alert("d")], |id| stored.contains(id));
        assert_eq!(ids(&fresh), vec!["d"]);
    }

    #[test]
    fn store_not_consulted_within_window() {
        let mut dedup = Deduplicator::new(8);
        dedup.mark_accepted("a");
        let fresh = dedup.filter(vec![alert("b")], |_| panic!("store consulted"));
        assert_eq!(ids(&fresh), vec!["b"]);
    }

    #[test]
    fn bootstrap_seeds_known_ids_and_marker() {
        let recent = vec!["3".to_string(), "2".to_string(), "1".to_string()];
        let dedup = Deduplicator::bootstrap(16, recent, 3);

        assert_eq!(dedup.last_seen(), Some("3"));
        assert!(dedup.is_known("1"));
        assert!(!dedup.window_exceeded());
        assert!(dedup.filter(vec![alert("2")], |_| false).is_empty());
    }

    #[test]
    fn bootstrap_with_larger_store_enables_fallback() {
        let recent = vec!["3".to_string(), "2".to_string()];
        let dedup = Deduplicator::bootstrap(2, recent, 10);
        assert!(dedup.window_exceeded());

        let fresh = dedup.filter(vec![alert("old"), alert("new")], |id| id == "old");
        assert_eq!(ids(&fresh), vec!["new"]);
    }

    #[test]
    fn bootstrap_beyond_capacity_keeps_newest() {
        let recent = vec!["3".to_string(), "2".to_string(), "1".to_string()];
        let dedup = Deduplicator::bootstrap(2, recent, 3);
        assert!(dedup.is_known("3"));
        assert!(dedup.is_known("2"));
        assert!(!dedup.is_known("1"));
    }

    proptest! {
        // Every distinct id is offered exactly once when offered alerts are
        // accepted, however snapshots repeat ids and whatever the window size.
        #[test]
        fn each_distinct_id_offered_exactly_once(
            snapshots in prop::collection::vec(prop::collection::vec(0u8..24, 0..6), 0..40),
            capacity in 1usize..8,
        ) {
            let mut dedup = Deduplicator::new(capacity);
            let mut stored: BTreeSet<String> = BTreeSet::new();
            let mut offered: BTreeMap<String, usize> = BTreeMap::new();

            for snapshot in &snapshots {
                let batch: Vec<Alert> = snapshot.iter().map(|n| alert(&n.to_string())).collect();
                let fresh = dedup.filter(batch, |id| stored.contains(id));
                for a in fresh {
                    *offered.entry(a.id.clone()).or_default() += 1;
                    stored.insert(a.id.clone());
                    dedup.mark_accepted(&a.id);
                }
            }

            let distinct: BTreeSet<String> =
                snapshots.iter().flatten().map(ToString::to_string).collect();
            let offered_ids: BTreeSet<String> = offered.keys().cloned().collect();
            prop_assert_eq!(offered_ids, distinct);
            prop_assert!(offered.values().all(|&count| count == 1));
        }
    }
}
