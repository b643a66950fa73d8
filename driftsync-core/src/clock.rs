//! Vector clocks for causal ordering of database versions.
//!
//! Every replica carries a counter in the clock; counters only advance for the
//! replica that produced a version. Comparing two clocks yields a partial
//! order: one dominates the other, they are equal, or neither dominates
//! (simultaneous, i.e. a true conflict).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Outcome of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockComparison {
    Equal,
    Smaller,
    Greater,
    Simultaneous,
}

/// Per-replica logical counters.
///
/// Stored as a sorted map so that `Display` and database text columns are
/// deterministic; equality and comparison never depend on entry order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<String, u64>,
}

impl VectorClock {
    /// Create an empty clock (all counters implicitly zero).
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for the given replica; missing entries count as zero.
    pub fn get(&self, client: &str) -> u64 {
        self.entries.get(client).copied().unwrap_or(0)
    }

    /// Set a replica's counter directly (used when rebuilding from rows).
    pub fn set(&mut self, client: impl Into<String>, logical_time: u64) {
        self.entries.insert(client.into(), logical_time);
    }

    /// Return a new clock with the given replica's counter advanced by one.
    pub fn increment(&self, client: &str) -> VectorClock {
        let mut next = self.clone();
        let counter = next.entries.entry(client.to_string()).or_insert(0);
        *counter += 1;
        next
    }

    /// Iterate over (client, logical time) pairs in client order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(c, t)| (c.as_str(), *t))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Union of two clocks: the entry-wise maximum.
    pub fn merged_with(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clone();
        for (client, time) in other.iter() {
            let entry = merged.entries.entry(client.to_string()).or_insert(0);
            if time > *entry {
                *entry = time;
            }
        }
        merged
    }

    /// Compare two clocks under the component-wise partial order.
    pub fn compare(a: &VectorClock, b: &VectorClock) -> ClockComparison {
        let mut a_smaller = false;
        let mut b_smaller = false;

        for client in a.entries.keys().chain(b.entries.keys()) {
            let va = a.get(client);
            let vb = b.get(client);
            if va < vb {
                a_smaller = true;
            } else if va > vb {
                b_smaller = true;
            }
        }

        match (a_smaller, b_smaller) {
            (false, false) => ClockComparison::Equal,
            (true, false) => ClockComparison::Smaller,
            (false, true) => ClockComparison::Greater,
            (true, true) => ClockComparison::Simultaneous,
        }
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, (client, time)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}{}", client, time)?;
        }
        write!(f, ")")
    }
}
