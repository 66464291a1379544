//! Area Name Matching
//!
//! Filters alerts by one or more user-supplied place names. Each query is
//! matched in two stages:
//!
//! 1. Case-normalized substring containment in either direction against the
//!    known area names ("תל אביב" matches "תל אביב - מרכז העיר").
//! 2. Only if stage 1 finds nothing, the single best area whose normalized
//!    Levenshtein similarity reaches the threshold. Composite names are also
//!    scored segment by segment so a query for one part of
//!    "Tel Aviv - Yafo" is not penalized for the rest of the name.
//!
//! Queries are OR-combined. The sentinel [`MATCH_ALL`] disables filtering.

use std::collections::HashSet;

use super::alert::{Alert, normalize_area};

/// Query value that matches every alert.
pub const MATCH_ALL: &str = "all";

/// Default minimum similarity for approximate matches.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.75;

/// Two-stage area matcher.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CityMatcher {
    threshold: f64,
}

impl Default for CityMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl CityMatcher {
    /// Create a matcher accepting approximate matches at or above `threshold`
    /// (0.0 to 1.0).
    #[must_use]
    pub const fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// The approximate-match threshold.
    #[must_use]
    pub const fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Whether `queries` leaves alerts unfiltered: it contains the sentinel
    /// or has no non-blank entry.
    #[must_use]
    pub fn matches_everything<S: AsRef<str>>(queries: &[S]) -> bool {
        let mut any = false;
        for query in queries {
            let query = query.as_ref().trim();
            if query.eq_ignore_ascii_case(MATCH_ALL) {
                return true;
            }
            any |= !query.is_empty();
        }
        !any
    }

    /// Keep the alerts that match any of `queries`, preserving order.
    #[must_use]
    pub fn filter<S: AsRef<str>>(&self, queries: &[S], alerts: Vec<Alert>) -> Vec<Alert> {
        if Self::matches_everything(queries) {
            return alerts;
        }

        let known: Vec<String> = {
            let mut seen = HashSet::new();
            alerts
                .iter()
                .flat_map(Alert::area_keys)
                .filter(|key| seen.insert(key.clone()))
                .collect()
        };
        let accepted = self.resolve(queries, &known);

        alerts
            .into_iter()
            .filter(|alert| alert.area_keys().iter().any(|key| accepted.contains(key)))
            .collect()
    }

    /// Whether a single alert matches any of `queries`.
    #[must_use]
    pub fn matches<S: AsRef<str>>(&self, queries: &[S], alert: &Alert) -> bool {
        if Self::matches_everything(queries) {
            return true;
        }
        let keys = alert.area_keys();
        !self.resolve(queries, &keys).is_empty()
    }

    /// Resolve `queries` to the subset of `known` area keys they select.
    #[must_use]
    pub fn resolve<S: AsRef<str>>(&self, queries: &[S], known: &[String]) -> HashSet<String> {
        let mut accepted = HashSet::new();

        for query in queries {
            let query = normalize_area(query.as_ref());
            if query.is_empty() {
                continue;
            }

            let substring_hits: Vec<&String> = known
                .iter()
                .filter(|key| contains_either(key, &query))
                .collect();
            if !substring_hits.is_empty() {
                accepted.extend(substring_hits.into_iter().cloned());
                continue;
            }

            if let Some((best, score)) = self.best_match(&query, known) {
                tracing::trace!(query = %query, area = %best, score, "Approximate area match");
                accepted.insert(best);
            }
        }

        accepted
    }

    /// Best approximate match for a normalized `query`, if it reaches the
    /// threshold.
    #[must_use]
    pub fn best_match(&self, query: &str, known: &[String]) -> Option<(String, f64)> {
        known
            .iter()
            .map(|key| (key, similarity(query, key)))
            .filter(|(_, score)| *score >= self.threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(key, score)| (key.clone(), score))
    }
}

/// Similarity between a normalized query and a normalized area name in the
/// range 0.0 to 1.0.
#[must_use]
pub fn similarity(query: &str, area: &str) -> f64 {
    area.split(['-', ','])
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(|segment| strsim::normalized_levenshtein(query, segment))
        .fold(strsim::normalized_levenshtein(query, area), f64::max)
}

fn contains_either(key: &str, query: &str) -> bool {
    key.contains(query) || query.contains(key)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use test_case::test_case;

    use super::*;

    fn alert(id: &str, areas: &[&str]) -> Alert {
        Alert::new(
            id,
            1,
            areas.iter().map(ToString::to_string).collect(),
            "t",
            Utc::now(),
        )
    }

    fn ids(alerts: &[Alert]) -> Vec<&str> {
        alerts.iter().map(|a| a.id.as_str()).collect()
    }

    fn sample() -> Vec<Alert> {
        vec![
            alert("1", &["תל אביב - מרכז העיר"]),
            alert("2", &["חיפה - כרמל"]),
            alert("3", &["Ashkelon", "Sderot"]),
            alert("4", &["תל אביב - יפו", "חולון"]),
        ]
    }

    #[test]
    fn substring_matches_composite_names() {
        let matched = CityMatcher::default().filter(&["תל אביב"], sample());
        assert_eq!(ids(&matched), vec!["1", "4"]);
    }

    #[test]
    fn area_contained_in_query_matches() {
        let matched = CityMatcher::default().filter(&["sderot, south district"], sample());
        assert_eq!(ids(&matched), vec!["3"]);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let matched = CityMatcher::default().filter(&["ASHKELON"], sample());
        assert_eq!(ids(&matched), vec!["3"]);
    }

    #[test_case(&["all"] ; "sentinel")]
    #[test_case(&["ALL"] ; "sentinel any case")]
    #[test_case(&["Haifa", "all"] ; "sentinel among others")]
    #[test_case(&[] ; "empty query list")]
    #[test_case(&["", "  "] ; "blank queries")]
    fn unfiltered(queries: &[&str]) {
        let alerts = sample();
        let matched = CityMatcher::default().filter(queries, alerts.clone());
        assert_eq!(matched, alerts);
    }

    #[test]
    fn queries_are_or_combined() {
        let matched = CityMatcher::default().filter(&["חיפה", "Sderot"], sample());
        assert_eq!(ids(&matched), vec!["2", "3"]);
    }

    #[test]
    fn misspelling_matches_approximately() {
        let matched = CityMatcher::default().filter(&["Ashqelon"], sample());
        assert_eq!(ids(&matched), vec!["3"]);
    }

    #[test]
    fn approximate_match_picks_single_best_area() {
        let alerts = vec![alert("1", &["Sderot"]), alert("2", &["Sdeort"])];
        let matched = CityMatcher::default().filter(&["Sdarot"], alerts);
        assert_eq!(ids(&matched), vec!["1"]);
    }

    #[test]
    fn unrelated_query_matches_nothing() {
        let matched = CityMatcher::default().filter(&["Eilat"], sample());
        assert!(matched.is_empty());
    }

    #[test]
    fn segment_similarity_scores_composite_names() {
        assert!(similarity("yafo", "tel aviv - yafo") > 0.99);
        assert!(similarity("yaffo", "tel aviv - yafo") >= DEFAULT_SIMILARITY_THRESHOLD);
        assert!(similarity("haifa", "eilat") < DEFAULT_SIMILARITY_THRESHOLD);
    }

    #[test]
    fn threshold_is_respected() {
        let strict = CityMatcher::new(0.95);
        assert!(strict.filter(&["Ashqelon"], sample()).is_empty());
    }

    #[test]
    fn single_alert_match() {
        let matcher = CityMatcher::default();
        let alert = alert("1", &["תל אביב - מרכז העיר"]);
        assert!(matcher.matches(&["תל אביב"], &alert));
        assert!(matcher.matches(&["all"], &alert));
        assert!(!matcher.matches(&["Haifa"], &alert));
    }
}
