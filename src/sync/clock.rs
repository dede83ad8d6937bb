//! Vector clocks for causality tracking between devices
//!
//! Every task record and queued mutation carries a vector clock: a map of
//! device id to a monotonically non-decreasing counter. A device only ever
//! increments its own counter. Comparing two clocks over the union of their
//! device ids classifies the records as identical, causally ordered, or
//! concurrent (conflicting).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Result of comparing a local clock against a remote clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Every counter matches
    Identical,
    /// The local clock dominates (local has newer state)
    Newer,
    /// The remote clock dominates (remote has newer state)
    Older,
    /// Each side has counters the other lacks (concurrent edits)
    Concurrent,
}

impl fmt::Display for ClockOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockOrdering::Identical => write!(f, "identical"),
            ClockOrdering::Newer => write!(f, "newer"),
            ClockOrdering::Older => write!(f, "older"),
            ClockOrdering::Concurrent => write!(f, "concurrent"),
        }
    }
}

/// Per-device logical counters.
///
/// Uses a BTreeMap so serialization is deterministic regardless of
/// insertion order, which keeps clock bytes identical across devices.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: BTreeMap<String, u64>,
}

impl VectorClock {
    /// Create a new empty vector clock
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the counter for a device (0 if absent)
    pub fn get(&self, device_id: &str) -> u64 {
        self.counters.get(device_id).copied().unwrap_or(0)
    }

    /// Whether the clock has no counters at all
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Return a copy of this clock with the given device's counter
    /// incremented by one. The input clock is left untouched.
    pub fn incremented(&self, device_id: &str) -> Self {
        let mut next = self.clone();
        *next.counters.entry(device_id.to_string()).or_insert(0) += 1;
        next
    }

    /// Component-wise maximum of two clocks.
    ///
    /// Commutative and associative, so the order in which pulled records
    /// are folded into the device clock does not matter.
    pub fn merged(&self, other: &VectorClock) -> Self {
        let mut merged = self.clone();
        for (device, &counter) in &other.counters {
            let entry = merged.counters.entry(device.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
        merged
    }

    /// Compare this clock against another over the union of device ids.
    ///
    /// Counts the dimensions where each side exceeds the other:
    /// neither exceeds ⇒ `Identical`; only self ⇒ `Newer`; only other ⇒
    /// `Older`; both ⇒ `Concurrent`. Swapping the arguments yields the
    /// inverse relation.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_greater = 0usize;
        let mut other_greater = 0usize;

        for device in self.counters.keys().chain(other.counters.keys()) {
            let a = self.get(device);
            let b = other.get(device);
            if a > b {
                self_greater += 1;
            } else if b > a {
                other_greater += 1;
            }
        }

        match (self_greater > 0, other_greater > 0) {
            (false, false) => ClockOrdering::Identical,
            (true, false) => ClockOrdering::Newer,
            (false, true) => ClockOrdering::Older,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Iterate over (device id, counter) pairs
    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.counters.iter()
    }
}

impl FromIterator<(String, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self {
            counters: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (device, counter)) in self.counters.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", device, counter)?;
        }
        write!(f, "}}")
    }
}

// ============================================================================
// Tests
// ============================================================================
