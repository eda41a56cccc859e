//! Scan-line traversal.
//!
//! Starting from one vertex, visits every timeline segment connected to it
//! through vertical edges, in either direction. Each timeline segment is
//! walked from its head forward along horizontal edges, so a consumer sees
//! one worker's vertices in time order before moving to the next.
//!
//! ```text
//!   A:  a0 ──── a1 ──── a2
//!        \      ↑
//!         ↘    /
//!   B:  b0 ──── b1 ──── b2
//! ```
//!
//! Starting at `a0` visits `a0 a1 a2`, then `b0 b1 b2`; every vertex once.

use hashbrown::HashSet;
use smallvec::SmallVec;

use crate::model::*;
use crate::storage::GraphBackend;
use crate::Result;

/// Callbacks of [`scan_line_traverse`]. All default to no-ops.
pub trait GraphVisitor {
    /// The first vertex of a timeline segment about to be walked.
    fn visit_head(&mut self, _vertex: &Vertex) {}

    /// Every vertex, exactly once.
    fn visit_vertex(&mut self, _vertex: &Vertex) {}

    /// Every edge on a walked segment, exactly once. `horizontal` tells
    /// timeline edges from cross-worker ones.
    fn visit_edge(&mut self, _edge: &Edge, _horizontal: bool) {}
}

/// Walk everything reachable from `start`. Disjoint parts of the graph are
/// never visited.
///
/// Fails with `CycleDetected` if a timeline loops on itself.
pub fn scan_line_traverse<B: GraphBackend>(
    graph: &B,
    start: Vertex,
    visitor: &mut impl GraphVisitor,
) -> Result<()> {
    let mut stack: SmallVec<[Vertex; 16]> = SmallVec::new();
    let mut visited: HashSet<Vertex> = HashSet::new();
    stack.push(start);

    while let Some(entry) = stack.pop() {
        if visited.contains(&entry) {
            continue;
        }
        let head = graph.head_of(entry)?;
        visitor.visit_head(&head);

        let mut cursor = Some(head);
        while let Some(current) = cursor.take() {
            if !visited.insert(current) {
                break;
            }
            visitor.visit_vertex(&current);

            if let Some(out) = graph.edge_from(&current, EdgeDirection::OutgoingVertical)? {
                visitor.visit_edge(&out, false);
                if !visited.contains(&out.to) {
                    stack.push(out.to);
                }
            }
            if let Some(inc) = graph.edge_from(&current, EdgeDirection::IncomingVertical)? {
                if !visited.contains(&inc.from) {
                    stack.push(inc.from);
                }
            }
            if let Some(next) = graph.edge_from(&current, EdgeDirection::OutgoingHorizontal)? {
                visitor.visit_edge(&next, true);
                cursor = Some(next.to);
            }
        }
    }
    tracing::trace!(%start, vertices = visited.len(), "scan line traversed");
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
