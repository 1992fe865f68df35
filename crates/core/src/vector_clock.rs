//! Vector clocks with per-entry timestamps.
//!
//! Each actor's entry carries, besides the event count, the time the entry
//! was first inserted and the time of its latest increment. The gossip layer
//! uses `insert` times for last-write-wins conflict resolution and `time`
//! for age-based trimming.

use crate::time::monotonic_us;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-actor clock entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockEntry {
    /// Number of events recorded for the actor.
    pub count: u64,
    /// Microsecond timestamp of the entry's first insertion.
    #[serde(rename = "insert")]
    pub insert_us: u64,
    /// Microsecond timestamp of the latest increment.
    #[serde(rename = "time")]
    pub time_us: u64,
}

/// Trim bounds, see [`VectorClock::trim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClockOpts {
    /// Never trim a clock at or below this many entries.
    #[serde(rename = "lowerBound")]
    pub lower_bound: usize,
    /// Skip trimming entirely while the oldest entry is younger than this.
    #[serde(rename = "youngBound")]
    pub young_bound: u64,
    /// Hard cap on the number of entries kept.
    #[serde(rename = "upperBound")]
    pub upper_bound: usize,
    /// Entries older than this are candidates for removal.
    #[serde(rename = "oldBound")]
    pub old_bound: u64,
}

impl Default for VectorClockOpts {
    fn default() -> Self {
        Self {
            lower_bound: 10,
            young_bound: 20_000,
            upper_bound: 50,
            old_bound: 86_400_000,
        }
    }
}

/// A mapping from actor id to [`ClockEntry`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<String, ClockEntry>,
}

impl VectorClock {
    /// Creates an empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of actors tracked.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Whether the clock tracks `actor`.
    pub fn has(&self, actor: &str) -> bool {
        self.entries.contains_key(actor)
    }

    /// The entry for `actor`, if any.
    pub fn get(&self, actor: &str) -> Option<&ClockEntry> {
        self.entries.get(actor)
    }

    /// Iterates over `(actor, entry)` pairs in actor order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ClockEntry)> {
        self.entries.iter()
    }

    /// Adds `actor` at count zero. No-op when already present.
    pub fn insert(&mut self, actor: &str) {
        if self.entries.contains_key(actor) {
            return;
        }
        let now = monotonic_us();
        self.entries.insert(
            actor.to_string(),
            ClockEntry {
                count: 0,
                insert_us: now,
                time_us: now,
            },
        );
    }

    /// Increments `actor`, inserting it first when absent.
    ///
    /// The entry's `time` advances monotonically between two increments on
    /// the origin node.
    pub fn increment(&mut self, actor: &str) {
        let now = monotonic_us();
        match self.entries.get_mut(actor) {
            Some(entry) => {
                entry.count += 1;
                entry.time_us = now;
            }
            None => {
                self.entries.insert(
                    actor.to_string(),
                    ClockEntry {
                        count: 1,
                        insert_us: now,
                        time_us: now,
                    },
                );
            }
        }
    }

    /// Sets `actor`'s count and time directly, preserving the insertion time
    /// when the entry already existed.
    pub fn update(&mut self, actor: &str, count: u64, time_us: Option<u64>) {
        let now = time_us.unwrap_or_else(monotonic_us);
        match self.entries.get_mut(actor) {
            Some(entry) => {
                entry.count = count;
                entry.time_us = now;
            }
            None => {
                self.entries.insert(
                    actor.to_string(),
                    ClockEntry {
                        count,
                        insert_us: now,
                        time_us: now,
                    },
                );
            }
        }
    }

    /// Per-actor union with `other`. On same-actor collisions the entry with
    /// the greater count wins; on equal counts the greater `time` wins.
    pub fn merge(&mut self, other: &VectorClock) {
        for (actor, theirs) in &other.entries {
            match self.entries.get_mut(actor) {
                Some(ours) => {
                    if theirs.count > ours.count
                        || (theirs.count == ours.count && theirs.time_us > ours.time_us)
                    {
                        *ours = *theirs;
                    }
                }
                None => {
                    self.entries.insert(actor.clone(), *theirs);
                }
            }
        }
    }

    /// Whether this clock descends `other`: for every actor in `other`, this
    /// clock's count is at least `other`'s. Actors absent here count as zero.
    pub fn descends(&self, other: &VectorClock) -> bool {
        other.entries.iter().all(|(actor, theirs)| {
            let count = self.entries.get(actor).map(|e| e.count).unwrap_or(0);
            count >= theirs.count
        })
    }

    /// Whether this clock strictly descends `other`: it descends `other` and
    /// `other` does not descend it.
    pub fn descends_strictly(&self, other: &VectorClock) -> bool {
        self.descends(other) && !other.descends(self)
    }

    /// Maximum `insert` time across all entries, zero when empty. Used for
    /// last-write-wins conflict resolution between divergent clocks.
    pub fn max_insert_time(&self) -> u64 {
        self.entries
            .values()
            .map(|e| e.insert_us)
            .max()
            .unwrap_or(0)
    }

    /// Removes entries to bound both the clock's size and the age of what it
    /// retains.
    ///
    /// No-op while the clock holds at most `lower_bound` entries, or while
    /// the oldest entry is younger than `young_bound`. Otherwise entries are
    /// visited newest to oldest and deleted while their position is at or
    /// beyond `upper_bound` or their age relative to `threshold_us` exceeds
    /// `old_bound`; the sweep stops at the first entry that satisfies
    /// neither condition.
    pub fn trim(&mut self, threshold_us: u64, opts: &VectorClockOpts) {
        if self.entries.len() <= opts.lower_bound {
            return;
        }

        let mut sorted: Vec<(String, ClockEntry)> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        sorted.sort_by_key(|(_, e)| e.time_us);

        let oldest = sorted[0].1.time_us;
        if threshold_us.saturating_sub(oldest) <= opts.young_bound {
            return;
        }

        for (i, (actor, entry)) in sorted.iter().enumerate().rev() {
            let stale = threshold_us.saturating_sub(entry.time_us) > opts.old_bound;
            if i >= opts.upper_bound || stale {
                self.entries.remove(actor);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_inserts_then_counts() {
        let mut clock = VectorClock::new();
        clock.increment("a");
        assert_eq!(clock.get("a").unwrap().count, 1);
        clock.increment("a");
        assert_eq!(clock.get("a").unwrap().count, 2);
        assert_eq!(clock.size(), 1);
    }

    #[test]
    fn increment_time_is_monotonic() {
        let mut clock = VectorClock::new();
        clock.increment("a");
        let first = clock.get("a").unwrap().time_us;
        clock.increment("a");
        let second = clock.get("a").unwrap().time_us;
        assert!(second > first);
    }

    #[test]
    fn insert_is_idempotent() {
        let mut clock = VectorClock::new();
        clock.insert("a");
        let entry = *clock.get("a").unwrap();
        clock.insert("a");
        assert_eq!(*clock.get("a").unwrap(), entry);
    }

    #[test]
    fn merge_keeps_higher_count() {
        let mut a = VectorClock::new();
        let mut b = VectorClock::new();
        a.increment("x");
        b.increment("x");
        b.increment("x");
        a.merge(&b);
        assert_eq!(a.get("x").unwrap().count, 2);
    }

    #[test]
    fn merge_result_descends_both() {
        let mut a = VectorClock::new();
        let mut b = VectorClock::new();
        a.increment("x");
        a.increment("y");
        b.increment("x");
        b.increment("x");
        b.increment("z");

        let mut merged = a.clone();
        merged.merge(&b);
        assert!(merged.descends(&a));
        assert!(merged.descends(&b));
    }

    #[test]
    fn descends_missing_actor_counts_as_zero() {
        let mut a = VectorClock::new();
        let mut b = VectorClock::new();
        a.increment("x");
        b.increment("y");
        assert!(!a.descends(&b));
        assert!(!b.descends(&a));
        let mut both = a.clone();
        both.merge(&b);
        assert!(both.descends(&a) && both.descends(&b));
    }

    #[test]
    fn strict_descent_excludes_equal() {
        let mut a = VectorClock::new();
        a.increment("x");
        let b = a.clone();
        assert!(a.descends(&b));
        assert!(!a.descends_strictly(&b));
        let mut c = a.clone();
        c.increment("x");
        assert!(c.descends_strictly(&a));
    }

    #[test]
    fn trim_respects_lower_bound() {
        let mut clock = VectorClock::new();
        for i in 0..5 {
            clock.increment(&format!("actor-{i}"));
        }
        let opts = VectorClockOpts {
            lower_bound: 10,
            ..Default::default()
        };
        clock.trim(monotonic_us() + 1_000_000_000, &opts);
        assert_eq!(clock.size(), 5);
    }

    #[test]
    fn trim_caps_entry_count() {
        let mut clock = VectorClock::new();
        for i in 0..20 {
            clock.increment(&format!("actor-{i}"));
        }
        let opts = VectorClockOpts {
            lower_bound: 2,
            young_bound: 0,
            upper_bound: 8,
            old_bound: u64::MAX,
        };
        clock.trim(monotonic_us(), &opts);
        assert_eq!(clock.size(), 8);
    }

    #[test]
    fn trim_skips_young_clocks() {
        let mut clock = VectorClock::new();
        for i in 0..20 {
            clock.increment(&format!("actor-{i}"));
        }
        let opts = VectorClockOpts {
            lower_bound: 2,
            young_bound: u64::MAX,
            upper_bound: 8,
            old_bound: 0,
        };
        clock.trim(monotonic_us(), &opts);
        assert_eq!(clock.size(), 20);
    }

    #[test]
    fn json_shape() {
        let mut clock = VectorClock::new();
        clock.increment("a");
        let value = serde_json::to_value(&clock).unwrap();
        let entry = &value["a"];
        assert!(entry["count"].is_u64());
        assert!(entry["insert"].is_u64());
        assert!(entry["time"].is_u64());
    }
}
