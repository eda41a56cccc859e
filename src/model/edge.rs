//! Edge — a directed, typed link between two vertices.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::Vertex;

/// What a worker was doing along an edge, or why two workers are linked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EdgeType {
    #[default]
    Default,
    Running,
    Blocked,
    Interrupted,
    Preempted,
    Timer,
    Network,
    UserInput,
    BlockDevice,
    Ipi,
    Unknown,
}

impl EdgeType {
    pub const ALL: [EdgeType; 11] = [
        EdgeType::Default,
        EdgeType::Running,
        EdgeType::Blocked,
        EdgeType::Interrupted,
        EdgeType::Preempted,
        EdgeType::Timer,
        EdgeType::Network,
        EdgeType::UserInput,
        EdgeType::BlockDevice,
        EdgeType::Ipi,
        EdgeType::Unknown,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EdgeType::Default => "DEFAULT",
            EdgeType::Running => "RUNNING",
            EdgeType::Blocked => "BLOCKED",
            EdgeType::Interrupted => "INTERRUPTED",
            EdgeType::Preempted => "PREEMPTED",
            EdgeType::Timer => "TIMER",
            EdgeType::Network => "NETWORK",
            EdgeType::UserInput => "USER_INPUT",
            EdgeType::BlockDevice => "BLOCK_DEVICE",
            EdgeType::Ipi => "IPI",
            EdgeType::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The four edge slots of a vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeDirection {
    OutgoingHorizontal,
    IncomingHorizontal,
    OutgoingVertical,
    IncomingVertical,
}

impl EdgeDirection {
    pub const ALL: [EdgeDirection; 4] = [
        EdgeDirection::OutgoingHorizontal,
        EdgeDirection::IncomingHorizontal,
        EdgeDirection::OutgoingVertical,
        EdgeDirection::IncomingVertical,
    ];

    pub fn is_horizontal(self) -> bool {
        matches!(self, EdgeDirection::OutgoingHorizontal | EdgeDirection::IncomingHorizontal)
    }

    pub fn is_outgoing(self) -> bool {
        matches!(self, EdgeDirection::OutgoingHorizontal | EdgeDirection::OutgoingVertical)
    }
}

/// A directed edge between two vertices.
///
/// Horizontal when both ends are on the same worker, vertical otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: Vertex,
    pub to: Vertex,
    pub edge_type: EdgeType,
    /// Free-text detail, e.g. the IRQ handler name.
    pub qualifier: Option<String>,
}

impl Edge {
    pub fn new(from: Vertex, to: Vertex, edge_type: EdgeType) -> Self {
        Self { from, to, edge_type, qualifier: None }
    }

    pub fn with_qualifier(mut self, qualifier: Option<impl Into<String>>) -> Self {
        self.qualifier = qualifier.map(Into::into);
        self
    }

    pub fn duration(&self) -> i64 {
        self.to.ts() - self.from.ts()
    }

    pub fn is_horizontal(&self) -> bool {
        self.from.same_worker(&self.to)
    }

    /// The "other" end of the edge from the given vertex.
    pub fn other_vertex(&self, v: &Vertex) -> Option<Vertex> {
        if *v == self.from { Some(self.to) }
        else if *v == self.to { Some(self.from) }
        else { None }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -{}-> {}", self.from, self.edge_type, self.to)?;
        if let Some(q) = &self.qualifier {
            write!(f, " ({q})")?;
        }
        Ok(())
    }
}
