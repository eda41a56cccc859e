//! Per-worker busy time over a scan line.
//!
//! Sums the durations of the horizontal edges of every worker reachable
//! from one worker's timeline. `NoEdge` spans and vertical edges do not
//! count.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::model::*;
use crate::storage::GraphBackend;
use crate::traversal::{GraphVisitor, scan_line_traverse};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphStatistics<W: Worker> {
    sums: BTreeMap<W, i64>,
    total: i64,
}

#[derive(Default)]
struct DurationVisitor {
    /// attribute → (one of its vertices, summed duration)
    by_attribute: HashMap<Attribute, (Vertex, i64)>,
}

impl GraphVisitor for DurationVisitor {
    fn visit_edge(&mut self, edge: &Edge, horizontal: bool) {
        if !horizontal {
            return;
        }
        let entry = self
            .by_attribute
            .entry(edge.from.attribute())
            .or_insert((edge.from, 0));
        entry.1 += edge.duration();
    }
}

impl<W: Worker> GraphStatistics<W> {
    /// Walk the scan line starting at `worker`'s first vertex. A worker
    /// without vertices yields empty statistics.
    pub fn compute<B: GraphBackend<Worker = W>>(graph: &B, worker: &W) -> Result<Self> {
        let mut stats = Self { sums: BTreeMap::new(), total: 0 };
        let Some(head) = graph.head_of_worker(worker)? else {
            return Ok(stats);
        };
        let mut visitor = DurationVisitor::default();
        scan_line_traverse(graph, head, &mut visitor)?;

        for (sample, sum) in visitor.by_attribute.into_values() {
            let Some(owner) = graph.parent_of(&sample)? else {
                continue;
            };
            *stats.sums.entry(owner).or_insert(0) += sum;
            stats.total += sum;
        }
        tracing::debug!(?worker, workers = stats.sums.len(), total = stats.total, "statistics computed");
        Ok(stats)
    }

    /// Busy time of `worker`, zero when it was not reached.
    pub fn sum(&self, worker: &W) -> i64 {
        self.sums.get(worker).copied().unwrap_or(0)
    }

    pub fn total(&self) -> i64 {
        self.total
    }

    /// Share of the total in percent.
    pub fn percent(&self, worker: &W) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.sum(worker) as f64 * 100.0 / self.total as f64
    }

    pub fn workers(&self) -> impl Iterator<Item = (&W, i64)> {
        self.sums.iter().map(|(w, s)| (w, *s))
    }
}
