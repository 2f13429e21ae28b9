//! Passive upstream failure tracking.
//!
//! Members are excluded only on real request failures (connect or forward
//! errors), never through synthetic probes. An exclusion lasts `fail_timeout`
//! from the most recent failure. The exclusion set is bounded for liveness:
//! when every candidate is excluded, the member whose ban expires soonest is
//! handed back as eligible, so selection always has at least one target.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Tracks failing members of an upstream group.
///
/// Keys are member addresses (`host:port` or origin URLs); the tracker does
/// not care which. All operations take short write locks and are safe to call
/// from the request hot path.
pub struct FailureTracker {
    fail_timeout: Duration,
    banned_until: RwLock<HashMap<String, Instant>>,
}

impl FailureTracker {
    pub fn new(fail_timeout: Duration) -> Self {
        Self {
            fail_timeout,
            banned_until: RwLock::new(HashMap::new()),
        }
    }

    /// Record a real failure against `member`, excluding it for
    /// `fail_timeout` from now. A repeated failure extends the ban.
    pub fn record_failure(&self, member: &str) {
        let until = Instant::now() + self.fail_timeout;
        self.banned_until.write().insert(member.to_string(), until);
    }

    /// Record a success, clearing any exclusion on `member`.
    pub fn record_success(&self, member: &str) {
        self.banned_until.write().remove(member);
    }

    /// Whether `member` is currently excluded. Expired entries are pruned on
    /// the way out.
    pub fn is_excluded(&self, member: &str) -> bool {
        let now = Instant::now();
        {
            let banned = self.banned_until.read();
            match banned.get(member) {
                None => return false,
                Some(until) if *until > now => return true,
                Some(_) => {}
            }
        }
        self.banned_until.write().remove(member);
        false
    }

    /// Return the indices of `members` that are eligible for selection.
    ///
    /// If every member is excluded, returns the single member whose ban
    /// expires soonest so selection can never starve.
    pub fn eligible_indices(&self, members: &[&str]) -> Vec<usize> {
        if members.is_empty() {
            return Vec::new();
        }

        let now = Instant::now();
        let banned = self.banned_until.read();

        let mut eligible = Vec::with_capacity(members.len());
        let mut soonest: Option<(usize, Instant)> = None;

        for (idx, member) in members.iter().enumerate() {
            match banned.get(*member) {
                Some(until) if *until > now => {
                    let replace = match soonest {
                        Some((_, best)) => *until < best,
                        None => true,
                    };
                    if replace {
                        soonest = Some((idx, *until));
                    }
                }
                _ => eligible.push(idx),
            }
        }

        if eligible.is_empty() {
            if let Some((idx, _)) = soonest {
                eligible.push(idx);
            }
        }

        eligible
    }

    /// Drop entries whose ban has expired. Called by periodic maintenance;
    /// correctness does not depend on it.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.banned_until.write().retain(|_, until| *until > now);
    }

    /// Number of currently tracked exclusions (expired entries included
    /// until the next sweep).
    pub fn len(&self) -> usize {
        self.banned_until.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.banned_until.read().is_empty()
    }
}
