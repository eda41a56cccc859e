//! # Graph Backend Trait
//!
//! This is THE contract between a trace producer, the graph engines and
//! every read-only consumer (critical path, views, statistics).
//!
//! ## Implementations
//!
//! | Backend | Module | Description |
//! |---------|--------|-------------|
//! | `MemoryBackend` | `memory` | Transient, for tests and short-lived graphs |
//! | `HistoryBackend` | `history` | Durable, interval-store + segment-store file pair |
//!
//! ## Construction protocol
//!
//! One producer creates vertices with [`GraphBackend::create_vertex`] and
//! feeds them, per worker, in non-decreasing timestamp order through
//! `add`, `append` and `link`. `close_graph` ends construction; after it
//! the graph is read-only.

pub mod memory;
pub mod history;

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex};

use crate::model::*;
use crate::{Error, Result};

pub use memory::MemoryBackend;
pub use history::{HistoryBackend, HistoryConfig};

// ============================================================================
// GraphBackend Trait
// ============================================================================

/// The timed dependency graph contract.
///
/// All methods take `&self`: engines guard their state internally. Only one
/// thread may write (`add`/`append`/`link`/`remove_tail`/`close_graph`).
/// Absent data is never an error: missing workers, vertices or edges come
/// back as `None` or an empty sequence.
pub trait GraphBackend: Send + Sync {
    /// The worker identity this graph is keyed by.
    type Worker: Worker;

    // ========================================================================
    // Vertex factory
    // ========================================================================

    /// Bind a new vertex to `worker` at `ts`.
    ///
    /// Allocates the worker's attribute the first time it is seen. The
    /// vertex is not part of the graph until it is added.
    fn create_vertex(&self, worker: &Self::Worker, ts: i64) -> Vertex;

    // ========================================================================
    // Construction
    // ========================================================================

    /// Add a vertex to its worker's timeline without creating an edge.
    fn add(&self, vertex: Vertex) -> Result<()>;

    /// Add a vertex and link it horizontally from the worker's previous tail.
    ///
    /// Returns `None` when the vertex is the worker's first.
    fn append(
        &self,
        vertex: Vertex,
        edge_type: EdgeType,
        qualifier: Option<&str>,
    ) -> Result<Option<Edge>>;

    /// Link two vertices. `from` must already be in the graph; `to` is added
    /// when missing. Same worker gives a horizontal edge, otherwise vertical.
    ///
    /// Any edge previously leaving `from` in the same direction is replaced.
    /// Callers must not rely on the engine to refuse it.
    fn link(
        &self,
        from: Vertex,
        to: Vertex,
        edge_type: EdgeType,
        qualifier: Option<&str>,
    ) -> Result<Option<Edge>>;

    /// Remove the most recent vertex of `worker`, with its edges.
    fn remove_tail(&self, worker: &Self::Worker) -> Result<Option<Vertex>>;

    /// End construction at `end_time`. The graph is read-only afterwards.
    fn close_graph(&self, end_time: i64) -> Result<()>;

    // ========================================================================
    // Queries
    // ========================================================================

    fn tail(&self, worker: &Self::Worker) -> Result<Option<Vertex>>;

    fn head_of_worker(&self, worker: &Self::Worker) -> Result<Option<Vertex>>;

    /// Earliest head across all workers, ties broken by vertex order.
    fn head(&self) -> Result<Option<Vertex>> {
        let mut best: Option<Vertex> = None;
        for worker in self.workers()? {
            if let Some(h) = self.head_of_worker(&worker)? {
                if best.is_none_or(|b| h < b) {
                    best = Some(h);
                }
            }
        }
        Ok(best)
    }

    /// First vertex of the timeline `vertex` belongs to, found by walking
    /// incoming horizontal edges backwards.
    fn head_of(&self, vertex: Vertex) -> Result<Vertex> {
        let mut seen = HashSet::new();
        let mut head = vertex;
        seen.insert(head);
        while let Some(e) = self.edge_from(&head, EdgeDirection::IncomingHorizontal)? {
            head = e.from;
            if !seen.insert(head) {
                tracing::warn!(%vertex, at = %head, "horizontal cycle while looking for head");
                return Err(Error::CycleDetected(format!(
                    "walking back from {vertex} reached {head} twice"
                )));
            }
        }
        Ok(head)
    }

    /// The vertices of `worker`, in timestamp order.
    fn nodes_of(&self, worker: &Self::Worker) -> Result<impl Iterator<Item = Vertex> + '_>;

    /// The worker owning `vertex`, if the vertex is in the graph.
    fn parent_of(&self, vertex: &Vertex) -> Result<Option<Self::Worker>>;

    /// Snapshot of the workers having at least one vertex.
    fn workers(&self) -> Result<BTreeSet<Self::Worker>>;

    /// Total vertex count.
    fn size(&self) -> Result<usize>;

    fn edge_from(&self, vertex: &Vertex, dir: EdgeDirection) -> Result<Option<Edge>>;

    /// First vertex of `worker` at or after `time`.
    fn vertex_at(&self, time: i64, worker: &Self::Worker) -> Result<Option<Vertex>> {
        Ok(self.nodes_of(worker)?.find(|v| v.ts() >= time))
    }

    fn is_done_building(&self) -> bool;

    /// Block until `close_graph` ran or `timeout` elapsed. Returns whether
    /// the graph is built.
    fn wait_until_built(&self, timeout: Duration) -> bool;
}

// ============================================================================
// BuildLatch
// ============================================================================

/// One-shot "construction finished" flag readers can wait on.
#[derive(Debug, Default)]
pub struct BuildLatch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl BuildLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// A latch that is already released, for stores reopened from disk.
    pub fn released() -> Self {
        Self { done: Mutex::new(true), cond: Condvar::new() }
    }

    pub fn release(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_released(&self) -> bool {
        *self.done.lock()
    }

    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                break;
            }
        }
        *done
    }
}

// ============================================================================
// Tests
// ============================================================================
