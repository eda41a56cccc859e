//! In-memory graph backend.
//!
//! This is the reference implementation of `GraphBackend`.
//! It keeps an ordered map from worker to vertex list, a reverse map from
//! vertex to worker, and the four edge slots of every vertex, all behind
//! one `RwLock`.
//!
//! ## Limitations
//!
//! - **No persistence**: everything is gone when the backend is dropped.
//! - **Readers during construction**: the lock keeps reads memory-safe, but
//!   the only supported concurrent use is reading after `close_graph`.
//! - **Strict timestamps**: a worker's vertices must be strictly increasing.
//!
//! Use this backend for:
//! - Testing producers and consumers of the graph
//! - Small or short-lived graphs that never need reopening

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::model::*;
use crate::{Error, Result};
use super::{BuildLatch, GraphBackend};

// ============================================================================
// MemoryBackend
// ============================================================================

/// Transient timed graph.
pub struct MemoryBackend<W: Worker> {
    inner: RwLock<MemoryInner<W>>,
    built: BuildLatch,
}

struct MemoryInner<W> {
    /// worker → attribute, allocated in first-seen order
    attributes: HashMap<W, Attribute>,
    /// attribute index → worker
    attribute_workers: Vec<W>,
    /// worker → vertices, strictly increasing in time
    timelines: BTreeMap<W, Vec<Vertex>>,
    /// vertex → owning worker
    reverse: HashMap<Vertex, W>,
    /// vertex → its four edge slots
    slots: HashMap<Vertex, EdgeSlots>,
    closed: bool,
}

#[derive(Debug, Default, Clone)]
struct EdgeSlots {
    outgoing_horizontal: Option<Edge>,
    incoming_horizontal: Option<Edge>,
    outgoing_vertical: Option<Edge>,
    incoming_vertical: Option<Edge>,
}

impl EdgeSlots {
    fn get(&self, dir: EdgeDirection) -> Option<&Edge> {
        match dir {
            EdgeDirection::OutgoingHorizontal => self.outgoing_horizontal.as_ref(),
            EdgeDirection::IncomingHorizontal => self.incoming_horizontal.as_ref(),
            EdgeDirection::OutgoingVertical => self.outgoing_vertical.as_ref(),
            EdgeDirection::IncomingVertical => self.incoming_vertical.as_ref(),
        }
    }

    fn slot_mut(&mut self, dir: EdgeDirection) -> &mut Option<Edge> {
        match dir {
            EdgeDirection::OutgoingHorizontal => &mut self.outgoing_horizontal,
            EdgeDirection::IncomingHorizontal => &mut self.incoming_horizontal,
            EdgeDirection::OutgoingVertical => &mut self.outgoing_vertical,
            EdgeDirection::IncomingVertical => &mut self.incoming_vertical,
        }
    }
}

impl<W: Worker> MemoryBackend<W> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryInner {
                attributes: HashMap::new(),
                attribute_workers: Vec::new(),
                timelines: BTreeMap::new(),
                reverse: HashMap::new(),
                slots: HashMap::new(),
                closed: false,
            }),
            built: BuildLatch::new(),
        }
    }
}

impl<W: Worker> Default for MemoryBackend<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Worker> MemoryInner<W> {
    fn check_writable(&self) -> Result<()> {
        if self.closed {
            return Err(Error::InvariantViolation("graph is closed for writing".into()));
        }
        Ok(())
    }

    fn worker_of_attribute(&self, attribute: Attribute) -> Result<W> {
        self.attribute_workers
            .get(attribute.index())
            .cloned()
            .ok_or_else(|| Error::InvariantViolation(format!(
                "attribute {attribute} was not allocated by this graph"
            )))
    }

    fn add(&mut self, vertex: Vertex) -> Result<()> {
        self.check_writable()?;
        let worker = self.worker_of_attribute(vertex.attribute())?;
        let timeline = self.timelines.entry(worker.clone()).or_default();
        if let Some(tail) = timeline.last() {
            if vertex.ts() <= tail.ts() {
                return Err(Error::InvariantViolation(format!(
                    "vertex {vertex} is not after tail {tail} of worker {worker:?}"
                )));
            }
        }
        timeline.push(vertex);
        self.reverse.insert(vertex, worker);
        self.slots.insert(vertex, EdgeSlots::default());
        tracing::trace!(%vertex, "vertex added");
        Ok(())
    }

    /// Store `edge` in the outgoing slot of its source and the incoming
    /// slot of its target, silently replacing what was there.
    fn connect(&mut self, edge: Edge) -> Edge {
        let (out_dir, in_dir) = if edge.is_horizontal() {
            (EdgeDirection::OutgoingHorizontal, EdgeDirection::IncomingHorizontal)
        } else {
            (EdgeDirection::OutgoingVertical, EdgeDirection::IncomingVertical)
        };
        *self.slots.entry(edge.from).or_default().slot_mut(out_dir) = Some(edge.clone());
        *self.slots.entry(edge.to).or_default().slot_mut(in_dir) = Some(edge.clone());
        tracing::trace!(%edge, "edge linked");
        edge
    }
}

// ============================================================================
// GraphBackend impl
// ============================================================================

impl<W: Worker> GraphBackend for MemoryBackend<W> {
    type Worker = W;

    fn create_vertex(&self, worker: &W, ts: i64) -> Vertex {
        if let Some(attribute) = self.inner.read().attributes.get(worker) {
            return Vertex::new(*attribute, ts);
        }
        let mut inner = self.inner.write();
        let next = Attribute(inner.attribute_workers.len() as u32);
        let attribute = *inner.attributes.entry(worker.clone()).or_insert(next);
        if attribute == next {
            inner.attribute_workers.push(worker.clone());
            tracing::debug!(?worker, %attribute, "worker attribute allocated");
        }
        Vertex::new(attribute, ts)
    }

    // ========================================================================
    // Construction
    // ========================================================================

    fn add(&self, vertex: Vertex) -> Result<()> {
        self.inner.write().add(vertex)
    }

    fn append(
        &self,
        vertex: Vertex,
        edge_type: EdgeType,
        qualifier: Option<&str>,
    ) -> Result<Option<Edge>> {
        let mut inner = self.inner.write();
        let worker = inner.worker_of_attribute(vertex.attribute())?;
        let previous = inner.timelines.get(&worker).and_then(|t| t.last().copied());
        inner.add(vertex)?;
        Ok(previous.map(|prev| {
            inner.connect(Edge::new(prev, vertex, edge_type).with_qualifier(qualifier))
        }))
    }

    fn link(
        &self,
        from: Vertex,
        to: Vertex,
        edge_type: EdgeType,
        qualifier: Option<&str>,
    ) -> Result<Option<Edge>> {
        let mut inner = self.inner.write();
        inner.check_writable()?;
        let from_worker = inner.reverse.get(&from).cloned().ok_or_else(|| {
            Error::InvariantViolation(format!("link source {from} is not in the graph"))
        })?;
        let to_worker = match inner.reverse.get(&to) {
            Some(w) => w.clone(),
            None => {
                inner.add(to)?;
                inner.worker_of_attribute(to.attribute())?
            }
        };
        if from_worker == to_worker && to.ts() <= from.ts() {
            return Err(Error::InvariantViolation(format!(
                "horizontal link {from} -> {to} does not move forward in time"
            )));
        }
        let edge = Edge::new(from, to, edge_type).with_qualifier(qualifier);
        Ok(Some(inner.connect(edge)))
    }

    fn remove_tail(&self, worker: &W) -> Result<Option<Vertex>> {
        let mut inner = self.inner.write();
        inner.check_writable()?;
        let Some(tail) = inner.timelines.get_mut(worker).and_then(|t| t.pop()) else {
            return Ok(None);
        };
        if inner.timelines.get(worker).is_some_and(|t| t.is_empty()) {
            inner.timelines.remove(worker);
        }
        inner.reverse.remove(&tail);
        if let Some(slots) = inner.slots.remove(&tail) {
            // Detach the far ends so no dangling edge points at the removed vertex.
            let far_ends = [
                (slots.incoming_horizontal, EdgeDirection::OutgoingHorizontal),
                (slots.outgoing_horizontal, EdgeDirection::IncomingHorizontal),
                (slots.incoming_vertical, EdgeDirection::OutgoingVertical),
                (slots.outgoing_vertical, EdgeDirection::IncomingVertical),
            ];
            for (edge, far_dir) in far_ends {
                let Some(edge) = edge else { continue };
                let Some(other) = edge.other_vertex(&tail) else { continue };
                if let Some(far) = inner.slots.get_mut(&other) {
                    let slot = far.slot_mut(far_dir);
                    if slot.as_ref() == Some(&edge) {
                        *slot = None;
                    }
                }
            }
        }
        tracing::trace!(vertex = %tail, "tail removed");
        Ok(Some(tail))
    }

    fn close_graph(&self, end_time: i64) -> Result<()> {
        let mut inner = self.inner.write();
        inner.closed = true;
        tracing::info!(end_time, vertices = inner.reverse.len(), "memory graph closed");
        drop(inner);
        self.built.release();
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    fn tail(&self, worker: &W) -> Result<Option<Vertex>> {
        Ok(self.inner.read().timelines.get(worker).and_then(|t| t.last().copied()))
    }

    fn head_of_worker(&self, worker: &W) -> Result<Option<Vertex>> {
        Ok(self.inner.read().timelines.get(worker).and_then(|t| t.first().copied()))
    }

    fn head(&self) -> Result<Option<Vertex>> {
        let inner = self.inner.read();
        Ok(inner.timelines.values().filter_map(|t| t.first().copied()).min())
    }

    fn nodes_of(&self, worker: &W) -> Result<impl Iterator<Item = Vertex> + '_> {
        let nodes = self.inner.read().timelines.get(worker).cloned().unwrap_or_default();
        Ok(nodes.into_iter())
    }

    fn parent_of(&self, vertex: &Vertex) -> Result<Option<W>> {
        Ok(self.inner.read().reverse.get(vertex).cloned())
    }

    fn workers(&self) -> Result<BTreeSet<W>> {
        Ok(self.inner.read().timelines.keys().cloned().collect())
    }

    fn size(&self) -> Result<usize> {
        Ok(self.inner.read().reverse.len())
    }

    fn edge_from(&self, vertex: &Vertex, dir: EdgeDirection) -> Result<Option<Edge>> {
        Ok(self.inner.read().slots.get(vertex).and_then(|s| s.get(dir).cloned()))
    }

    fn vertex_at(&self, time: i64, worker: &W) -> Result<Option<Vertex>> {
        let inner = self.inner.read();
        let Some(timeline) = inner.timelines.get(worker) else {
            return Ok(None);
        };
        let idx = timeline.partition_point(|v| v.ts() < time);
        Ok(timeline.get(idx).copied())
    }

    fn is_done_building(&self) -> bool {
        self.built.is_released()
    }

    fn wait_until_built(&self, timeout: Duration) -> bool {
        self.built.wait(timeout)
    }
}

// ============================================================================
// Tests
// ============================================================================
