//! Graphviz DOT export — render a timed graph for inspection.
//!
//! One cluster per worker holds its timeline; vertical edges cross
//! clusters.
//!
//! ```text
//! Graph → export_dot() → digraph { subgraph cluster_0 { ... } ... }
//!   → dot -Tsvg graph.dot > graph.svg
//! ```

use std::io::Write;

use crate::model::*;
use crate::storage::GraphBackend;
use crate::Result;

/// Export a graph as a Graphviz DOT document.
///
/// Vertices are named `v<attribute>_<ts>`; edge labels carry the type,
/// the qualifier and the duration.
pub fn export_dot<B: GraphBackend>(graph: &B, writer: &mut dyn Write) -> Result<()> {
    let workers = graph.workers()?;

    // Header
    writeln!(writer, "// timegraph DOT dump")?;
    writeln!(writer, "// Workers: {}", workers.len())?;
    writeln!(writer, "// Vertices: {}", graph.size()?)?;
    writeln!(writer, "digraph timegraph {{")?;
    writeln!(writer, "  rankdir=LR;")?;
    writeln!(writer, "  node [shape=point];")?;

    let mut vertical = Vec::new();
    for (idx, worker) in workers.iter().enumerate() {
        writeln!(writer, "  subgraph cluster_{idx} {{")?;
        writeln!(writer, "    label=\"{}\";", escape(&format!("{worker:?}")))?;
        for vertex in graph.nodes_of(worker)? {
            writeln!(writer, "    {} [tooltip=\"{}\"];", node_id(&vertex), vertex.ts())?;
            if let Some(edge) = graph.edge_from(&vertex, EdgeDirection::OutgoingHorizontal)? {
                writeln!(writer, "    {};", format_edge(&edge))?;
            }
            if let Some(edge) = graph.edge_from(&vertex, EdgeDirection::OutgoingVertical)? {
                vertical.push(edge);
            }
        }
        writeln!(writer, "  }}")?;
    }

    if !vertical.is_empty() {
        writeln!(writer, "  // Vertical edges")?;
    }
    for edge in &vertical {
        writeln!(writer, "  {} [style=dashed];", format_edge(edge))?;
    }
    writeln!(writer, "}}")?;
    Ok(())
}

fn node_id(v: &Vertex) -> String {
    if v.ts() < 0 {
        format!("v{}_m{}", v.attribute(), v.ts().unsigned_abs())
    } else {
        format!("v{}_{}", v.attribute(), v.ts())
    }
}

fn format_edge(edge: &Edge) -> String {
    let label = match &edge.qualifier {
        Some(q) => format!("{} {} ({})", edge.edge_type, escape(q), edge.duration()),
        None => format!("{} ({})", edge.edge_type, edge.duration()),
    };
    format!("{} -> {} [label=\"{}\"]", node_id(&edge.from), node_id(&edge.to), label)
}

/// Escape a string for a double-quoted DOT attribute.
fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
