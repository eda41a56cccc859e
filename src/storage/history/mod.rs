//! On-disk graph backend.
//!
//! The graph lives in a pair of files sharing one analysis id:
//!
//! ```text
//! <id>.ht   interval store: one column per worker, horizontal edges
//! <id>.segs segment store:  vertical edges
//! ```
//!
//! ## Encoding
//!
//! | Graph concept        | Store representation                              |
//! |----------------------|---------------------------------------------------|
//! | Worker               | Attribute named by its first-seen index ("0", "1") |
//! | Worker identity      | JSON metadata of that attribute                   |
//! | Vertex at `t`        | Non-null interval starting at `t`                 |
//! | Horizontal edge type | Value of the interval between two vertices        |
//! | Vertical edge        | Segment `[from.ts, to.ts]` with both attributes   |
//!
//! A vertex opens an interval holding [`IntervalPayload::Pending`]. The
//! interval only gets its final value, an edge or [`IntervalPayload::NoEdge`],
//! when the worker's next vertex arrives. Readers therefore never see an
//! edge whose end is not known yet.
//!
//! Both stores append each record to their file as soon as it is final and
//! keep only an offset index in memory, so the graph does not have to fit
//! in RAM. Readers may query while the single writer is still appending;
//! both stores serialize access through their own locks.

pub mod codec;
pub mod interval_store;
pub mod segment_store;

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::model::*;
use crate::{Error, Result};
use super::GraphBackend;

pub use interval_store::{Interval, IntervalStore, Span};
pub use segment_store::{Segment, SegmentStore};

/// Version of the graph encoding, written in both file headers.
pub const GRAPH_PROVIDER_VERSION: u32 = 1;

// ============================================================================
// Configuration
// ============================================================================

/// Where and how an on-disk graph is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub directory: PathBuf,
    /// Analysis id, the common stem of both file names.
    pub id: String,
    /// Earliest timestamp a vertex may have.
    #[serde(default)]
    pub start_time: i64,
}

impl HistoryConfig {
    pub fn new(directory: impl Into<PathBuf>, id: impl Into<String>) -> Self {
        Self { directory: directory.into(), id: id.into(), start_time: 0 }
    }

    pub fn with_start_time(mut self, start_time: i64) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn history_path(&self) -> PathBuf {
        self.directory.join(format!("{}.ht", self.id))
    }

    pub fn segments_path(&self) -> PathBuf {
        self.directory.join(format!("{}.segs", self.id))
    }
}

// ============================================================================
// Persisted payloads
// ============================================================================

/// Value of a worker's column between two instants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalPayload {
    /// A vertex starts here; the edge leaving it is not decided yet.
    Pending,
    /// A vertex starts here and the next vertex was added without an edge.
    NoEdge,
    /// A vertex starts here and is linked to the next one.
    Edge { edge_type: EdgeType, qualifier: Option<String> },
}

impl IntervalPayload {
    fn edge(edge_type: EdgeType, qualifier: Option<&str>) -> Self {
        IntervalPayload::Edge { edge_type, qualifier: qualifier.map(str::to_string) }
    }
}

/// A vertical edge, stored as the payload of a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerticalEdgeRecord {
    pub from: Attribute,
    pub from_ts: i64,
    pub to: Attribute,
    pub to_ts: i64,
    pub edge_type: EdgeType,
    pub qualifier: Option<String>,
}

impl VerticalEdgeRecord {
    fn to_edge(&self) -> Edge {
        Edge::new(
            Vertex::new(self.from, self.from_ts),
            Vertex::new(self.to, self.to_ts),
            self.edge_type,
        )
        .with_qualifier(self.qualifier.as_deref())
    }

    fn touches(&self, v: &Vertex) -> bool {
        (self.from == v.attribute() && self.from_ts == v.ts())
            || (self.to == v.attribute() && self.to_ts == v.ts())
    }
}

/// Turn the interval of a column into the horizontal edge it encodes.
/// Sentinels and null values decode to no edge.
fn decode_horizontal(interval: &Interval<IntervalPayload>, to: Vertex) -> Option<Edge> {
    match &interval.value {
        Some(IntervalPayload::Edge { edge_type, qualifier }) => Some(
            Edge::new(Vertex::new(interval.attribute, interval.start), to, *edge_type)
                .with_qualifier(qualifier.as_deref()),
        ),
        _ => None,
    }
}

// ============================================================================
// HistoryBackend
// ============================================================================

struct WorkerTable<W> {
    by_worker: HashMap<W, Attribute>,
    by_attribute: Vec<W>,
}

/// Durable timed graph over an interval store and a segment store.
pub struct HistoryBackend<W: Worker> {
    config: HistoryConfig,
    history: IntervalStore<IntervalPayload>,
    segments: SegmentStore<VerticalEdgeRecord>,
    workers: RwLock<WorkerTable<W>>,
}

impl<W: Worker> HistoryBackend<W> {
    /// Create a fresh file pair. Fails if either file exists.
    pub fn create(config: HistoryConfig) -> Result<Self> {
        fs::create_dir_all(&config.directory)?;
        let ht = config.history_path();
        let segs = config.segments_path();
        if ht.exists() || segs.exists() {
            return Err(Error::StorageError(format!(
                "graph '{}' already exists in {}", config.id, config.directory.display()
            )));
        }
        let history = IntervalStore::create(&ht, GRAPH_PROVIDER_VERSION, config.start_time)?;
        let segments = match SegmentStore::create(&segs, GRAPH_PROVIDER_VERSION) {
            Ok(s) => s,
            Err(e) => {
                // Never leave half a pair behind.
                drop(history);
                remove_if_present(&ht)?;
                return Err(e);
            }
        };
        tracing::debug!(id = %config.id, "on-disk graph created");
        Ok(Self {
            config,
            history,
            segments,
            workers: RwLock::new(WorkerTable { by_worker: HashMap::new(), by_attribute: Vec::new() }),
        })
    }

    /// Reopen a closed file pair read-only.
    pub fn open_existing(config: HistoryConfig) -> Result<Self> {
        let ht = config.history_path();
        let segs = config.segments_path();
        match (ht.exists(), segs.exists()) {
            (true, true) => {}
            (false, false) => {
                return Err(Error::StorageError(format!(
                    "graph '{}' not found in {}", config.id, config.directory.display()
                )));
            }
            _ => return Err(partial_pair(&config)),
        }
        let history = IntervalStore::open_existing(&ht, GRAPH_PROVIDER_VERSION)?;
        let segments = SegmentStore::open_existing(&segs, GRAPH_PROVIDER_VERSION)?;

        let mut table = WorkerTable { by_worker: HashMap::new(), by_attribute: Vec::new() };
        for idx in 0..history.attribute_count() {
            let attribute = Attribute(idx as u32);
            let meta = history.attribute_metadata(attribute).ok_or_else(|| {
                Error::Corruption(format!("attribute {attribute} has no worker"))
            })?;
            let worker: W = serde_json::from_value(meta)?;
            table.by_worker.insert(worker.clone(), attribute);
            table.by_attribute.push(worker);
        }
        tracing::debug!(id = %config.id, workers = table.by_attribute.len(), "on-disk graph reopened");
        Ok(Self { config, history, segments, workers: RwLock::new(table) })
    }

    /// Reopen the graph if its files exist, otherwise create it.
    ///
    /// A pair that cannot be reopened (incompatible version, never closed,
    /// corrupt) is discarded and rebuilt once; a failure of that fresh
    /// create is returned. Half a pair is refused outright.
    pub fn open_or_create(config: HistoryConfig) -> Result<Self> {
        let ht = config.history_path();
        let segs = config.segments_path();
        match (ht.exists(), segs.exists()) {
            (false, false) => Self::create(config),
            (true, true) => match Self::open_existing(config.clone()) {
                Ok(graph) => Ok(graph),
                Err(e) => {
                    tracing::warn!(id = %config.id, error = %e, "discarding unusable graph files, rebuilding");
                    remove_if_present(&ht)?;
                    remove_if_present(&segs)?;
                    Self::create(config)
                }
            },
            _ => Err(partial_pair(&config)),
        }
    }

    /// Release both stores, optionally deleting the files. A graph that was
    /// never closed leaves an unfinished pair that the next open rebuilds.
    pub fn dispose(self, delete_files: bool) -> Result<()> {
        let segments = self.segments.close(delete_files);
        let history_path = self.history.path().to_path_buf();
        drop(self.history);
        let history = if delete_files { remove_if_present(&history_path) } else { Ok(()) };
        segments.and(history)
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Access the underlying interval store (for advanced use).
    pub fn history(&self) -> &IntervalStore<IntervalPayload> {
        &self.history
    }

    /// Number of vertical edges stored.
    pub fn vertical_edge_count(&self) -> usize {
        self.segments.len()
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn attribute_of(&self, worker: &W) -> Option<Attribute> {
        self.workers.read().by_worker.get(worker).copied()
    }

    fn knows(&self, attribute: Attribute) -> bool {
        attribute.index() < self.workers.read().by_attribute.len()
    }

    /// Interval covering `t`, `None` outside the store's time range.
    fn interval_at(&self, t: i64, attribute: Attribute) -> Result<Option<Interval<IntervalPayload>>> {
        if !self.knows(attribute) {
            return Ok(None);
        }
        match self.history.query_single_state(t, attribute) {
            Ok(interval) => Ok(Some(interval)),
            Err(Error::TimeRange { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Timestamp of the worker's last vertex.
    fn latest_time(&self, attribute: Attribute) -> Result<Option<i64>> {
        if !self.knows(attribute) {
            return Ok(None);
        }
        let ongoing = self.history.query_ongoing(attribute)?;
        Ok(ongoing.value.is_some().then_some(ongoing.start))
    }

    /// Span covering `t`, `None` outside the store's time range.
    fn span_at(&self, t: i64, attribute: Attribute) -> Result<Option<Span>> {
        if !self.knows(attribute) {
            return Ok(None);
        }
        match self.history.query_span(t, attribute) {
            Ok(span) => Ok(Some(span)),
            Err(Error::TimeRange { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// True when `v` is a real vertex, not just an instant inside a span.
    fn contains(&self, v: &Vertex) -> Result<bool> {
        let Some(latest) = self.latest_time(v.attribute())? else {
            return Ok(false);
        };
        if latest < v.ts() {
            return Ok(false);
        }
        if latest == v.ts() {
            return Ok(true);
        }
        Ok(self
            .span_at(v.ts(), v.attribute())?
            .is_some_and(|s| s.start == v.ts() && s.has_value))
    }

    fn check_current_worker_time(&self, v: &Vertex) -> Result<()> {
        if self.history.is_closed() {
            return Err(Error::InvariantViolation("graph is closed for writing".into()));
        }
        if !self.knows(v.attribute()) {
            return Err(Error::InvariantViolation(format!(
                "attribute {} was not allocated by this graph", v.attribute()
            )));
        }
        let start = self.history.start_time();
        if v.ts() < start {
            return Err(Error::InvariantViolation(format!(
                "vertex {v} is before the graph start time {start}"
            )));
        }
        if let Some(latest) = self.latest_time(v.attribute())? {
            if v.ts() < latest {
                return Err(Error::InvariantViolation(format!(
                    "vertex {v} is earlier than the worker's latest time {latest}"
                )));
            }
        }
        Ok(())
    }

    fn nodes_from(&self, attribute: Option<Attribute>, from: i64) -> HistoryNodes<'_> {
        let from = from.max(self.history.start_time());
        HistoryNodes {
            history: &self.history,
            attribute: attribute.filter(|a| self.knows(*a)),
            from,
            cursor: Some(from),
        }
    }

    /// Give the span between two existing, adjacent vertices of one worker
    /// an edge. The span was closed when `to` arrived, typically by `add`.
    fn relink(
        &self,
        from: Vertex,
        to: Vertex,
        edge_type: EdgeType,
        qualifier: Option<&str>,
    ) -> Result<Option<Edge>> {
        let attribute = to.attribute();
        let adjacent = self.span_at(to.ts() - 1, attribute)?.is_some_and(|s| s.start == from.ts());
        if !adjacent {
            return Err(Error::InvariantViolation(format!(
                "horizontal link {from} -> {to} would skip vertices"
            )));
        }
        let closed = self.history.replace_closed(
            to.ts() - 1,
            attribute,
            Some(IntervalPayload::edge(edge_type, qualifier)),
        )?;
        let edge = decode_horizontal(&closed, to);
        if let Some(e) = &edge {
            tracing::trace!(edge = %e, "horizontal edge relinked");
        }
        Ok(edge)
    }

    /// Write worker identities into the attribute tree before it is frozen.
    fn persist_workers(&self) -> Result<()> {
        let table = self.workers.read();
        for (idx, worker) in table.by_attribute.iter().enumerate() {
            self.history
                .set_attribute_metadata(Attribute(idx as u32), serde_json::to_value(worker)?)?;
        }
        Ok(())
    }
}

fn partial_pair(config: &HistoryConfig) -> Error {
    Error::Corruption(format!(
        "graph '{}' in {} has only one of its two files",
        config.id,
        config.directory.display()
    ))
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Lazy vertex sequence
// ============================================================================

/// Forward-only walk over a worker's column, one vertex per non-null
/// interval. Cloning restarts nothing but gives an independent cursor.
#[derive(Clone)]
pub struct HistoryNodes<'a> {
    history: &'a IntervalStore<IntervalPayload>,
    attribute: Option<Attribute>,
    from: i64,
    cursor: Option<i64>,
}

impl Iterator for HistoryNodes<'_> {
    type Item = Vertex;

    fn next(&mut self) -> Option<Vertex> {
        let attribute = self.attribute?;
        loop {
            let t = self.cursor?;
            let Ok(span) = self.history.query_span(t, attribute) else {
                self.cursor = None;
                return None;
            };
            // The ongoing interval keeps growing with the store's end time:
            // seeing it again from a later cursor means the column is done.
            if span.start < t && t != self.from {
                self.cursor = None;
                return None;
            }
            self.cursor = span.end.checked_add(1);
            if span.has_value && span.start >= self.from {
                return Some(Vertex::new(attribute, span.start));
            }
        }
    }
}

// ============================================================================
// GraphBackend impl
// ============================================================================

impl<W: Worker> GraphBackend for HistoryBackend<W> {
    type Worker = W;

    fn create_vertex(&self, worker: &W, ts: i64) -> Vertex {
        if let Some(attribute) = self.attribute_of(worker) {
            return Vertex::new(attribute, ts);
        }
        let mut table = self.workers.write();
        if let Some(attribute) = table.by_worker.get(worker) {
            return Vertex::new(*attribute, ts);
        }
        let name = table.by_attribute.len().to_string();
        let attribute = self.history.get_or_create_attribute(&name);
        table.by_worker.insert(worker.clone(), attribute);
        table.by_attribute.push(worker.clone());
        tracing::debug!(?worker, %attribute, "worker attribute allocated");
        Vertex::new(attribute, ts)
    }

    // ========================================================================
    // Construction
    // ========================================================================

    fn add(&self, vertex: Vertex) -> Result<()> {
        self.check_current_worker_time(&vertex)?;
        let attribute = vertex.attribute();
        let ongoing = self.history.query_ongoing(attribute)?;
        match ongoing.value {
            None => self.history.modify_attribute(
                vertex.ts(), attribute, Some(IntervalPayload::Pending),
            )?,
            Some(_) if ongoing.start == vertex.ts() => return Ok(()),
            Some(_) => self.history.close_and_modify(
                vertex.ts(),
                attribute,
                Some(IntervalPayload::NoEdge),
                Some(IntervalPayload::Pending),
            )?,
        }
        tracing::trace!(%vertex, "vertex added");
        Ok(())
    }

    fn append(
        &self,
        vertex: Vertex,
        edge_type: EdgeType,
        qualifier: Option<&str>,
    ) -> Result<Option<Edge>> {
        self.check_current_worker_time(&vertex)?;
        let attribute = vertex.attribute();
        let ongoing = self.history.query_ongoing(attribute)?;
        match ongoing.value {
            None => {
                self.history.modify_attribute(vertex.ts(), attribute, Some(IntervalPayload::Pending))?;
                tracing::trace!(%vertex, "first vertex of worker appended");
                return Ok(None);
            }
            Some(_) if ongoing.start == vertex.ts() => return Ok(None),
            Some(_) => self.history.close_and_modify(
                vertex.ts(),
                attribute,
                Some(IntervalPayload::edge(edge_type, qualifier)),
                Some(IntervalPayload::Pending),
            )?,
        }
        if vertex.ts() == self.history.start_time() {
            return Ok(None);
        }
        let edge = self
            .interval_at(vertex.ts() - 1, attribute)?
            .and_then(|closed| decode_horizontal(&closed, vertex));
        if let Some(e) = &edge {
            tracing::trace!(edge = %e, "vertex appended");
        }
        Ok(edge)
    }

    fn link(
        &self,
        from: Vertex,
        to: Vertex,
        edge_type: EdgeType,
        qualifier: Option<&str>,
    ) -> Result<Option<Edge>> {
        if !self.contains(&from)? {
            return Err(Error::InvariantViolation(format!("link source {from} is not in the graph")));
        }
        if from.same_worker(&to) {
            if to.ts() <= from.ts() {
                return Err(Error::InvariantViolation(format!(
                    "horizontal link {from} -> {to} does not move forward in time"
                )));
            }
            if self.contains(&to)? {
                return self.relink(from, to, edge_type, qualifier);
            }
            if self.latest_time(to.attribute())? != Some(from.ts()) {
                return Err(Error::InvariantViolation(format!(
                    "horizontal link {from} -> {to} would skip the worker's tail"
                )));
            }
            return self.append(to, edge_type, qualifier);
        }
        if !self.contains(&to)? {
            self.add(to)?;
        }
        let record = VerticalEdgeRecord {
            from: from.attribute(),
            from_ts: from.ts(),
            to: to.attribute(),
            to_ts: to.ts(),
            edge_type,
            qualifier: qualifier.map(str::to_string),
        };
        let edge = record.to_edge();
        self.segments.add(Segment::new(from.ts().min(to.ts()), from.ts().max(to.ts()), record))?;
        tracing::trace!(%edge, "vertical edge linked");
        Ok(Some(edge))
    }

    fn remove_tail(&self, worker: &W) -> Result<Option<Vertex>> {
        let Some(tail) = self.tail(worker)? else {
            return Ok(None);
        };
        if self.history.is_closed() {
            return Err(Error::InvariantViolation("graph is closed for writing".into()));
        }
        // The previous vertex, if any, gets its outgoing edge undecided again.
        self.history.revert_ongoing(tail.attribute(), |previous| {
            previous.as_ref().map(|_| IntervalPayload::Pending)
        })?;
        self.segments.remove_at(tail.ts(), |s| s.payload.touches(&tail))?;
        tracing::trace!(vertex = %tail, "tail removed");
        Ok(Some(tail))
    }

    fn close_graph(&self, end_time: i64) -> Result<()> {
        if self.history.is_closed() {
            return Ok(());
        }
        // Both stores are closed even when one of the steps fails.
        let workers = self.persist_workers();
        let history = self.history.close_history(end_time);
        let segments = self.segments.close(false);
        tracing::info!(
            id = %self.config.id,
            end_time = self.history.current_end_time(),
            workers = self.workers.read().by_attribute.len(),
            vertical_edges = self.segments.len(),
            "on-disk graph closed"
        );
        workers.and(history).and(segments)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    fn tail(&self, worker: &W) -> Result<Option<Vertex>> {
        let Some(attribute) = self.attribute_of(worker) else {
            return Ok(None);
        };
        Ok(self.latest_time(attribute)?.map(|ts| Vertex::new(attribute, ts)))
    }

    fn head_of_worker(&self, worker: &W) -> Result<Option<Vertex>> {
        let attribute = self.attribute_of(worker);
        Ok(self.nodes_from(attribute, i64::MIN).next())
    }

    fn nodes_of(&self, worker: &W) -> Result<impl Iterator<Item = Vertex> + '_> {
        Ok(self.nodes_from(self.attribute_of(worker), i64::MIN))
    }

    fn parent_of(&self, vertex: &Vertex) -> Result<Option<W>> {
        if !self.contains(vertex)? {
            return Ok(None);
        }
        Ok(self.workers.read().by_attribute.get(vertex.attribute().index()).cloned())
    }

    fn workers(&self) -> Result<BTreeSet<W>> {
        let table: Vec<(Attribute, W)> = {
            let t = self.workers.read();
            t.by_attribute
                .iter()
                .enumerate()
                .map(|(idx, w)| (Attribute(idx as u32), w.clone()))
                .collect()
        };
        let mut out = BTreeSet::new();
        for (attribute, worker) in table {
            if self.latest_time(attribute)?.is_some() {
                out.insert(worker);
            }
        }
        Ok(out)
    }

    fn size(&self) -> Result<usize> {
        let count = self.workers.read().by_attribute.len();
        let mut size = 0;
        for idx in 0..count {
            size += self.history.valued_count(Attribute(idx as u32))?;
        }
        Ok(size)
    }

    fn edge_from(&self, vertex: &Vertex, dir: EdgeDirection) -> Result<Option<Edge>> {
        let attribute = vertex.attribute();
        match dir {
            EdgeDirection::IncomingHorizontal => {
                if vertex.ts() == self.history.start_time() || !self.contains(vertex)? {
                    return Ok(None);
                }
                Ok(self
                    .interval_at(vertex.ts() - 1, attribute)?
                    .and_then(|prev| decode_horizontal(&prev, *vertex)))
            }
            EdgeDirection::OutgoingHorizontal => {
                let Some(here) = self.interval_at(vertex.ts(), attribute)? else {
                    return Ok(None);
                };
                if here.start != vertex.ts() {
                    return Ok(None);
                }
                Ok(decode_horizontal(&here, Vertex::new(attribute, here.end + 1)))
            }
            EdgeDirection::OutgoingVertical => Ok(self
                .segments
                .intersecting(vertex.ts())?
                .into_iter()
                .filter(|s| s.payload.from == attribute && s.payload.from_ts == vertex.ts())
                .last()
                .map(|s| s.payload.to_edge())),
            EdgeDirection::IncomingVertical => Ok(self
                .segments
                .intersecting(vertex.ts())?
                .into_iter()
                .filter(|s| s.payload.to == attribute && s.payload.to_ts == vertex.ts())
                .last()
                .map(|s| s.payload.to_edge())),
        }
    }

    fn vertex_at(&self, time: i64, worker: &W) -> Result<Option<Vertex>> {
        Ok(self.nodes_from(self.attribute_of(worker), time).next())
    }

    fn is_done_building(&self) -> bool {
        self.history.is_closed()
    }

    fn wait_until_built(&self, timeout: Duration) -> bool {
        self.history.wait_until_built(timeout)
    }
}

// ============================================================================
// Tests
// ============================================================================
