//! Producer-side helper for the construction protocol.
//!
//! A trace producer thinks in `(worker, timestamp)` pairs, not in vertices.
//! `GraphBuilder` turns those pairs into `create_vertex` + `add`/`append`/
//! `link` calls and counts what it wrote.
//!
//! ```rust,no_run
//! use timegraph::{GraphBuilder, EdgeType, HostThread, MemoryBackend};
//!
//! # fn example() -> timegraph::Result<()> {
//! let graph = MemoryBackend::new();
//! let (client, server) = (HostThread::new("a", 1), HostThread::new("b", 7));
//! let mut builder = GraphBuilder::new(&graph);
//! builder.append_at(&client, 0, EdgeType::Default, None)?;
//! builder.link_at(&client, 10, &server, 12, EdgeType::Network, Some("eth0"))?;
//! builder.finish(20)?;
//! # Ok(())
//! # }
//! ```

use serde::Serialize;

use crate::model::*;
use crate::storage::GraphBackend;
use crate::Result;

/// What a builder wrote so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuildStats {
    pub vertices: usize,
    pub horizontal_edges: usize,
    pub vertical_edges: usize,
}

pub struct GraphBuilder<'g, B: GraphBackend> {
    graph: &'g B,
    stats: BuildStats,
}

impl<'g, B: GraphBackend> GraphBuilder<'g, B> {
    pub fn new(graph: &'g B) -> Self {
        Self { graph, stats: BuildStats::default() }
    }

    pub fn graph(&self) -> &'g B {
        self.graph
    }

    pub fn stats(&self) -> BuildStats {
        self.stats
    }

    /// Append a vertex of `worker` at `ts`, linked from the worker's tail.
    pub fn append_at(
        &mut self,
        worker: &B::Worker,
        ts: i64,
        edge_type: EdgeType,
        qualifier: Option<&str>,
    ) -> Result<Vertex> {
        let vertex = self.graph.create_vertex(worker, ts);
        let edge = self.graph.append(vertex, edge_type, qualifier)?;
        self.stats.vertices += 1;
        if edge.is_some() {
            self.stats.horizontal_edges += 1;
        }
        Ok(vertex)
    }

    /// Add a vertex of `worker` at `ts` without an incoming edge.
    pub fn add_at(&mut self, worker: &B::Worker, ts: i64) -> Result<Vertex> {
        let vertex = self.graph.create_vertex(worker, ts);
        self.graph.add(vertex)?;
        self.stats.vertices += 1;
        Ok(vertex)
    }

    /// Link `from_worker@from_ts` to `to_worker@to_ts`.
    ///
    /// The source is appended with a `Default` edge first when it is newer
    /// than its worker's tail; the target is added by the link if missing.
    pub fn link_at(
        &mut self,
        from_worker: &B::Worker,
        from_ts: i64,
        to_worker: &B::Worker,
        to_ts: i64,
        edge_type: EdgeType,
        qualifier: Option<&str>,
    ) -> Result<Option<Edge>> {
        let newer = self
            .graph
            .tail(from_worker)?
            .is_none_or(|tail| tail.ts() < from_ts);
        let from = if newer {
            self.append_at(from_worker, from_ts, EdgeType::Default, None)?
        } else {
            self.graph.create_vertex(from_worker, from_ts)
        };
        let to = self.graph.create_vertex(to_worker, to_ts);
        let target_known = self.graph.parent_of(&to)?.is_some();

        let edge = self.graph.link(from, to, edge_type, qualifier)?;
        if !target_known {
            self.stats.vertices += 1;
        }
        match &edge {
            Some(e) if e.is_horizontal() => self.stats.horizontal_edges += 1,
            Some(_) => self.stats.vertical_edges += 1,
            None => {}
        }
        Ok(edge)
    }

    /// Close the graph at `end_time` and report what was written.
    pub fn finish(self, end_time: i64) -> Result<BuildStats> {
        self.graph.close_graph(end_time)?;
        tracing::info!(
            end_time,
            vertices = self.stats.vertices,
            horizontal_edges = self.stats.horizontal_edges,
            vertical_edges = self.stats.vertical_edges,
            "graph build finished"
        );
        Ok(self.stats)
    }
}
