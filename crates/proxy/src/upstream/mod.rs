//! Upstream selection and pooling.
//!
//! HTTP/WS routes use smooth weighted round-robin with per-route cursor
//! state; stream servers use consistent hashing (see [`ring`]). Both paths
//! share one passive failure tracker: a member that fails a real connect or
//! forward is excluded until its `fail_timeout` elapses, with the
//! soonest-expiring member kept eligible so selection never starves.

pub mod pool;
pub mod ring;

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use portico_common::FailureTracker;
use portico_config::Upstream;

/// How long a failed member stays excluded.
const FAIL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct WrrEntry {
    url: String,
    weight: i64,
    current: i64,
}

#[derive(Debug, Default)]
struct WrrState {
    /// Sorted fingerprint of the member set the cursors were built for.
    signature: String,
    total_weight: i64,
    entries: Vec<WrrEntry>,
}

/// Weighted round-robin selector with passive failure accounting.
///
/// State is keyed by route id and survives config swaps as long as the
/// route's member set is unchanged; a changed set rebuilds the cursors.
pub struct Selector {
    states: DashMap<String, Arc<RwLock<WrrState>>>,
    failures: FailureTracker,
}

impl Selector {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
            failures: FailureTracker::new(FAIL_TIMEOUT),
        }
    }

    /// Pick the next upstream URL for `route_key`, skipping `exclude` (the
    /// members already tried this request) and passively failed members.
    pub fn pick(
        &self,
        route_key: &str,
        upstreams: &[Upstream],
        exclude: &[String],
    ) -> Option<String> {
        if upstreams.is_empty() {
            return None;
        }

        let urls: Vec<&str> = upstreams.iter().map(|u| u.url.as_str()).collect();
        let mut eligible = self.failures.eligible_indices(&urls);
        eligible.retain(|i| !exclude.iter().any(|e| e == urls[*i]));

        // Everything tried or excluded: fall back to anything not yet tried.
        if eligible.is_empty() {
            eligible = (0..urls.len())
                .filter(|i| !exclude.iter().any(|e| e == urls[*i]))
                .collect();
        }

        match eligible.len() {
            0 => None,
            1 => Some(upstreams[eligible[0]].url.clone()),
            _ => Some(self.pick_smooth(route_key, upstreams, &eligible)),
        }
    }

    /// Smooth weighted round-robin over the eligible subset.
    fn pick_smooth(&self, route_key: &str, upstreams: &[Upstream], eligible: &[usize]) -> String {
        let signature = {
            let mut parts: Vec<String> = eligible
                .iter()
                .map(|&i| format!("{}#{}", upstreams[i].url, upstreams[i].weight))
                .collect();
            parts.sort();
            parts.join("|")
        };

        let state = self
            .states
            .entry(route_key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(WrrState::default())))
            .clone();

        let mut state = state.write();

        if state.signature != signature {
            let entries: Vec<WrrEntry> = eligible
                .iter()
                .map(|&i| WrrEntry {
                    url: upstreams[i].url.clone(),
                    weight: i64::from(upstreams[i].weight.max(1)),
                    current: 0,
                })
                .collect();
            state.total_weight = entries.iter().map(|e| e.weight).sum::<i64>().max(1);
            state.signature = signature;
            state.entries = entries;
        }

        let mut best = 0;
        for i in 0..state.entries.len() {
            let w = state.entries[i].weight;
            state.entries[i].current = state.entries[i].current.saturating_add(w);
            if state.entries[i].current > state.entries[best].current {
                best = i;
            }
        }
        let total = state.total_weight;
        state.entries[best].current -= total;
        state.entries[best].url.clone()
    }

    /// Record a real failure against `member` (connect or forward error).
    pub fn record_failure(&self, member: &str) {
        self.failures.record_failure(member);
    }

    /// Record a success, lifting any exclusion.
    pub fn record_success(&self, member: &str) {
        self.failures.record_success(member);
    }

    /// Whether `member` is currently excluded by passive failure.
    pub fn is_excluded(&self, member: &str) -> bool {
        self.failures.is_excluded(member)
    }

    /// Filter stream candidates through the failure tracker, preserving
    /// ring order and the liveness bound.
    pub fn filter_stream_candidates<'a>(&self, ordered: &[&'a str]) -> Vec<&'a str> {
        let eligible = self.failures.eligible_indices(ordered);
        eligible.into_iter().map(|i| ordered[i]).collect()
    }

    /// Drop expired failure entries and cursor state for removed routes.
    pub fn sweep(&self, live_route_keys: &[&str]) {
        self.failures.sweep();
        self.states
            .retain(|key, _| live_route_keys.iter().any(|k| k == key));
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}
