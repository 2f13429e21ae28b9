//! Consistent hashing for stream upstreams.
//!
//! Members are replicated onto a virtual ring proportionally to their
//! weight; a client key hashes to a position and walks clockwise to the
//! first member. Membership changes therefore remap only the keys that
//! landed between the removed member's points and its successors, on the
//! order of K/N of all assignments.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Virtual nodes per unit of weight.
const POINTS_PER_WEIGHT: usize = 40;

/// A hash ring over weighted members.
pub struct HashRing {
    /// Sorted (point, member index) pairs.
    points: Vec<(u64, usize)>,
    members: Vec<String>,
}

fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

impl HashRing {
    /// Build a ring from `(addr, weight)` members. Zero weights count as one.
    pub fn new<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let members: Vec<(String, u32)> = members
            .into_iter()
            .map(|(addr, weight)| (addr.into(), weight.max(1)))
            .collect();

        let mut points = Vec::new();
        let mut addrs = Vec::with_capacity(members.len());

        for (idx, (addr, weight)) in members.iter().enumerate() {
            for replica in 0..(*weight as usize * POINTS_PER_WEIGHT) {
                points.push((hash_key(&format!("{addr}#{replica}")), idx));
            }
            addrs.push(addr.clone());
        }

        points.sort_unstable();

        Self {
            points,
            members: addrs,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// The member owning `key`'s position.
    pub fn pick(&self, key: &str) -> Option<&str> {
        self.member_at(hash_key(key)).map(|idx| self.members[idx].as_str())
    }

    /// All members in ring order starting at `key`'s position, deduplicated.
    ///
    /// The first element is the primary assignment; the rest are the
    /// failover order used when dials fail.
    pub fn ordered_candidates(&self, key: &str) -> Vec<&str> {
        if self.points.is_empty() {
            return Vec::new();
        }

        let start = self.point_index(hash_key(key));
        let mut seen = vec![false; self.members.len()];
        let mut ordered = Vec::with_capacity(self.members.len());

        for offset in 0..self.points.len() {
            let (_, member) = self.points[(start + offset) % self.points.len()];
            if !seen[member] {
                seen[member] = true;
                ordered.push(self.members[member].as_str());
                if ordered.len() == self.members.len() {
                    break;
                }
            }
        }

        ordered
    }

    fn member_at(&self, hash: u64) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        Some(self.points[self.point_index(hash)].1)
    }

    fn point_index(&self, hash: u64) -> usize {
        match self.points.binary_search_by_key(&hash, |(p, _)| *p) {
            Ok(idx) => idx,
            Err(idx) if idx == self.points.len() => 0,
            Err(idx) => idx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(addrs: &[&str]) -> HashRing {
        HashRing::new(addrs.iter().map(|a| (a.to_string(), 1)))
    }

    #[test]
    fn empty_ring_picks_nothing() {
        let r = HashRing::new(Vec::<(String, u32)>::new());
        assert!(r.pick("client").is_none());
        assert!(r.ordered_candidates("client").is_empty());
    }

    #[test]
    fn pick_is_stable() {
        let r = ring(&["a:1", "b:1", "c:1"]);
        let first = r.pick("10.1.2.3").unwrap().to_string();
        for _ in 0..10 {
            assert_eq!(r.pick("10.1.2.3").unwrap(), first);
        }
    }

    #[test]
    fn candidates_cover_all_members_starting_with_primary() {
        let r = ring(&["a:1", "b:1", "c:1"]);
        let candidates = r.ordered_candidates("10.1.2.3");
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0], r.pick("10.1.2.3").unwrap());
    }

    #[test]
    fn removal_remaps_a_bounded_fraction() {
        let full = ring(&["a:1", "b:1", "c:1", "d:1"]);
        let reduced = ring(&["a:1", "b:1", "c:1"]);

        let keys: Vec<String> = (0..400).map(|i| format!("10.0.{}.{}", i / 256, i % 256)).collect();

        let mut moved = 0;
        for key in &keys {
            let before = full.pick(key).unwrap();
            let after = reduced.pick(key).unwrap();
            if before != "d:1" && before != after {
                moved += 1;
            }
        }

        // Keys not owned by the removed member should overwhelmingly stay
        // put; allow some slack for virtual-node boundary shifts.
        assert!(moved * 10 < keys.len(), "{moved} of {} keys moved", keys.len());
    }

    #[test]
    fn weight_skews_distribution() {
        let r = HashRing::new(vec![("heavy".to_string(), 4), ("light".to_string(), 1)]);

        let mut heavy = 0;
        for i in 0..1000 {
            if r.pick(&format!("key-{i}")).unwrap() == "heavy" {
                heavy += 1;
            }
        }

        assert!(heavy > 600, "heavy member got only {heavy}/1000");
    }
}
