//! Shared helpers for the end-to-end tests.

#![allow(dead_code)]

use std::collections::BTreeMap;

use timegraph::{
    Edge, EdgeDirection, EdgeType, GraphBackend, GraphVisitor, HistoryBackend, HistoryConfig,
    HostThread, Vertex,
};

pub fn worker(tid: i64) -> HostThread {
    HostThread::new("host", tid)
}

pub fn history(dir: &tempfile::TempDir, id: &str) -> HistoryBackend<HostThread> {
    HistoryBackend::create(HistoryConfig::new(dir.path(), id)).unwrap()
}

/// Every vertex of every worker with its four edge slots.
pub type Snapshot = BTreeMap<HostThread, Vec<(Vertex, [Option<Edge>; 4])>>;

pub fn snapshot<B: GraphBackend<Worker = HostThread>>(graph: &B) -> Snapshot {
    let mut out = BTreeMap::new();
    for w in graph.workers().unwrap() {
        let rows = graph
            .nodes_of(&w)
            .unwrap()
            .map(|v| (v, EdgeDirection::ALL.map(|d| graph.edge_from(&v, d).unwrap())))
            .collect();
        out.insert(w, rows);
    }
    out
}

/// Three workers, horizontal edges of several types, qualifiers, a
/// vertex added without an edge and two vertical edges.
///
/// ```text
/// w1:  0 ─DEFAULT─ 10 ─RUNNING(cpu0)─ 20 ─BLOCKED─ 40
///                   │
/// w2:               └NETWORK(eth0)→ 15 ─RUNNING─ 25    30
///                                             │
/// w3:                                         └IPI→ 27 ─TIMER─ 35
/// ```
pub fn build_mixed<B: GraphBackend<Worker = HostThread>>(g: &B) {
    let (w1, w2, w3) = (worker(1), worker(2), worker(3));
    g.append(g.create_vertex(&w1, 0), EdgeType::Default, None).unwrap();
    let a10 = g.create_vertex(&w1, 10);
    g.append(a10, EdgeType::Default, None).unwrap();
    let b15 = g.create_vertex(&w2, 15);
    g.link(a10, b15, EdgeType::Network, Some("eth0")).unwrap();
    g.append(g.create_vertex(&w1, 20), EdgeType::Running, Some("cpu0")).unwrap();
    let b25 = g.create_vertex(&w2, 25);
    g.append(b25, EdgeType::Running, None).unwrap();
    let c27 = g.create_vertex(&w3, 27);
    g.link(b25, c27, EdgeType::Ipi, None).unwrap();
    g.add(g.create_vertex(&w2, 30)).unwrap();
    g.append(g.create_vertex(&w3, 35), EdgeType::Timer, None).unwrap();
    g.append(g.create_vertex(&w1, 40), EdgeType::Blocked, None).unwrap();
}

#[derive(Default)]
pub struct Recorder {
    pub heads: Vec<Vertex>,
    pub vertices: Vec<Vertex>,
    pub horizontal: Vec<Edge>,
    pub vertical: Vec<Edge>,
}

impl GraphVisitor for Recorder {
    fn visit_head(&mut self, vertex: &Vertex) {
        self.heads.push(*vertex);
    }

    fn visit_vertex(&mut self, vertex: &Vertex) {
        self.vertices.push(*vertex);
    }

    fn visit_edge(&mut self, edge: &Edge, horizontal: bool) {
        if horizontal {
            self.horizontal.push(edge.clone());
        } else {
            self.vertical.push(edge.clone());
        }
    }
}
