//! Vertex — one instant on one worker's timeline.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Column identifier binding a vertex to its worker.
///
/// Allocated sequentially, in first-seen order, by the graph's vertex
/// factory. The same integer names the worker's column in the on-disk
/// interval store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Attribute(pub u32);

impl Attribute {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A point in time on one worker's timeline.
///
/// Vertices are plain values: `(attribute, timestamp)` is the whole
/// identity, so any engine can rebuild the same vertex from a persisted
/// interval boundary without keeping any vertex object alive.
///
/// Ordering is by timestamp first; the attribute only breaks ties so that
/// `Ord` agrees with `Eq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vertex {
    attribute: Attribute,
    ts: i64,
}

impl Vertex {
    pub fn new(attribute: Attribute, ts: i64) -> Self {
        Self { attribute, ts }
    }

    /// Nanosecond timestamp of this vertex.
    pub fn ts(&self) -> i64 {
        self.ts
    }

    pub fn attribute(&self) -> Attribute {
        self.attribute
    }

    /// True when both vertices live on the same worker's timeline.
    pub fn same_worker(&self, other: &Vertex) -> bool {
        self.attribute == other.attribute
    }
}

impl Ord for Vertex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ts
            .cmp(&other.ts)
            .then_with(|| self.attribute.cmp(&other.attribute))
    }
}

impl PartialOrd for Vertex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}@{}]", self.attribute, self.ts)
    }
}
