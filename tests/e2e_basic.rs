//! End-to-end tests for the construction protocol and the basic queries.
//!
//! Every property is checked against both engines: each test body is a
//! generic function over `GraphBackend`, run once on `MemoryBackend` and
//! once on a fresh `HistoryBackend`.

mod common;

use common::{history, worker};
use pretty_assertions::assert_eq;
use timegraph::{EdgeDirection, EdgeType, Error, GraphBackend, HostThread, MemoryBackend};

macro_rules! on_both_engines {
    ($name:ident, $check:path) => {
        mod $name {
            use super::*;

            #[test]
            fn memory() {
                $check(&MemoryBackend::new());
            }

            #[test]
            fn history() {
                let dir = tempfile::tempdir().unwrap();
                $check(&common::history(&dir, stringify!($name)));
            }
        }
    };
}

// ============================================================================
// 1. W1 at t=0,1,2 — DEFAULT then BLOCKED
// ============================================================================

fn three_vertex_scenario<B: GraphBackend<Worker = HostThread>>(g: &B) {
    let w1 = worker(1);
    let v: Vec<_> = (0..3).map(|t| g.create_vertex(&w1, t)).collect();
    assert_eq!(g.append(v[0], EdgeType::Default, None).unwrap(), None);
    g.append(v[1], EdgeType::Default, None).unwrap();
    g.append(v[2], EdgeType::Blocked, None).unwrap();

    assert_eq!(g.nodes_of(&w1).unwrap().collect::<Vec<_>>(), v);
    let first = g.edge_from(&v[0], EdgeDirection::OutgoingHorizontal).unwrap().unwrap();
    assert_eq!((first.to, first.edge_type, first.duration()), (v[1], EdgeType::Default, 1));
    let second = g.edge_from(&v[1], EdgeDirection::OutgoingHorizontal).unwrap().unwrap();
    assert_eq!((second.to, second.edge_type, second.duration()), (v[2], EdgeType::Blocked, 1));
    assert_eq!(g.size().unwrap(), 3);
}

on_both_engines!(three_vertex, three_vertex_scenario);

// ============================================================================
// 2. Append linking in both directions
// ============================================================================

fn append_links_both_ends<B: GraphBackend<Worker = HostThread>>(g: &B) {
    let w = worker(7);
    let v0 = g.create_vertex(&w, 100);
    let v1 = g.create_vertex(&w, 142);
    g.append(v0, EdgeType::Default, None).unwrap();
    let edge = g.append(v1, EdgeType::Preempted, Some("cpu3")).unwrap().unwrap();

    let incoming = g.edge_from(&v1, EdgeDirection::IncomingHorizontal).unwrap().unwrap();
    let outgoing = g.edge_from(&v0, EdgeDirection::OutgoingHorizontal).unwrap().unwrap();
    assert_eq!(incoming, edge);
    assert_eq!(outgoing, edge);
    assert_eq!(incoming.from, v0);
    assert_eq!(outgoing.to, v1);
    assert_eq!(edge.duration(), 42);
    assert_eq!(edge.qualifier.as_deref(), Some("cpu3"));
    assert_eq!(g.edge_from(&v0, EdgeDirection::IncomingHorizontal).unwrap(), None);
    assert_eq!(g.edge_from(&v1, EdgeDirection::OutgoingHorizontal).unwrap(), None);
}

on_both_engines!(append_linking, append_links_both_ends);

// ============================================================================
// 3. No cross-contamination between workers
// ============================================================================

fn workers_are_independent<B: GraphBackend<Worker = HostThread>>(g: &B) {
    let (a, b) = (worker(1), worker(2));
    for t in [0, 5, 9] {
        g.append(g.create_vertex(&a, t), EdgeType::Running, None).unwrap();
    }
    let b0 = g.create_vertex(&b, 3);
    g.append(b0, EdgeType::Default, None).unwrap();
    for t in [12, 13] {
        g.append(g.create_vertex(&a, t), EdgeType::Blocked, None).unwrap();
    }

    assert_eq!(g.nodes_of(&a).unwrap().count(), 5);
    assert_eq!(g.nodes_of(&b).unwrap().collect::<Vec<_>>(), vec![b0]);
    for dir in EdgeDirection::ALL {
        assert_eq!(g.edge_from(&b0, dir).unwrap(), None, "{dir:?}");
    }
    assert_eq!(g.workers().unwrap().into_iter().collect::<Vec<_>>(), vec![a, b]);
}

on_both_engines!(no_cross_contamination, workers_are_independent);

// ============================================================================
// 4. Link across workers is vertical
// ============================================================================

fn link_creates_vertical_edge<B: GraphBackend<Worker = HostThread>>(g: &B) {
    let (a, b) = (worker(1), worker(2));
    let va = g.create_vertex(&a, 10);
    let vb = g.create_vertex(&b, 14);
    g.append(va, EdgeType::Default, None).unwrap();
    let edge = g.link(va, vb, EdgeType::Network, Some("eth0")).unwrap().unwrap();

    assert_eq!((edge.from, edge.to, edge.edge_type), (va, vb, EdgeType::Network));
    assert!(!edge.is_horizontal());
    assert_eq!(g.edge_from(&va, EdgeDirection::OutgoingVertical).unwrap(), Some(edge.clone()));
    assert_eq!(g.edge_from(&vb, EdgeDirection::IncomingVertical).unwrap(), Some(edge));
    for v in [va, vb] {
        assert_eq!(g.edge_from(&v, EdgeDirection::OutgoingHorizontal).unwrap(), None);
        assert_eq!(g.edge_from(&v, EdgeDirection::IncomingHorizontal).unwrap(), None);
    }
    assert_eq!(g.nodes_of(&b).unwrap().collect::<Vec<_>>(), vec![vb]);
    assert_eq!(g.parent_of(&vb).unwrap(), Some(b));
}

on_both_engines!(link_vertical, link_creates_vertical_edge);

fn link_same_worker_is_horizontal<B: GraphBackend<Worker = HostThread>>(g: &B) {
    let w = worker(1);
    let v0 = g.create_vertex(&w, 1);
    let v1 = g.create_vertex(&w, 6);
    g.add(v0).unwrap();
    let edge = g.link(v0, v1, EdgeType::Timer, None).unwrap().unwrap();
    assert!(edge.is_horizontal());
    assert_eq!(g.edge_from(&v1, EdgeDirection::IncomingHorizontal).unwrap(), Some(edge));
}

on_both_engines!(link_horizontal, link_same_worker_is_horizontal);

fn link_after_adding_both_ends<B: GraphBackend<Worker = HostThread>>(g: &B) {
    let w = worker(1);
    let v0 = g.create_vertex(&w, 1);
    let v1 = g.create_vertex(&w, 6);
    g.add(v0).unwrap();
    g.add(v1).unwrap();
    assert_eq!(g.edge_from(&v0, EdgeDirection::OutgoingHorizontal).unwrap(), None);

    let edge = g.link(v0, v1, EdgeType::Timer, None).unwrap().unwrap();
    assert_eq!((edge.from, edge.to, edge.edge_type), (v0, v1, EdgeType::Timer));
    assert_eq!(g.edge_from(&v0, EdgeDirection::OutgoingHorizontal).unwrap(), Some(edge.clone()));
    assert_eq!(g.edge_from(&v1, EdgeDirection::IncomingHorizontal).unwrap(), Some(edge));
    assert_eq!(g.size().unwrap(), 2);
}

on_both_engines!(link_after_add, link_after_adding_both_ends);

fn link_backwards_on_one_worker_fails<B: GraphBackend<Worker = HostThread>>(g: &B) {
    let w = worker(1);
    let v0 = g.create_vertex(&w, 1);
    let v1 = g.create_vertex(&w, 6);
    g.add(v0).unwrap();
    g.append(v1, EdgeType::Running, None).unwrap();
    let err = g.link(v1, v0, EdgeType::Timer, None).unwrap_err();
    assert!(matches!(err, Error::InvariantViolation(_)), "{err}");
    let err = g.link(v1, v1, EdgeType::Timer, None).unwrap_err();
    assert!(matches!(err, Error::InvariantViolation(_)), "{err}");
}

on_both_engines!(link_backwards, link_backwards_on_one_worker_fails);

fn link_from_absent_vertex_fails<B: GraphBackend<Worker = HostThread>>(g: &B) {
    let va = g.create_vertex(&worker(1), 10);
    let vb = g.create_vertex(&worker(2), 11);
    let err = g.link(va, vb, EdgeType::Network, None).unwrap_err();
    assert!(matches!(err, Error::InvariantViolation(_)), "{err}");
    assert_eq!(g.size().unwrap(), 0);
}

on_both_engines!(link_absent_source, link_from_absent_vertex_fails);

// ============================================================================
// 5. Illegal vertex ordering
// ============================================================================

fn out_of_order_add_fails<B: GraphBackend<Worker = HostThread>>(g: &B) {
    let w = worker(1);
    let v0 = g.create_vertex(&w, 50);
    let v1 = g.create_vertex(&w, 40);
    g.add(v0).unwrap();
    let err = g.add(v1).unwrap_err();
    assert!(matches!(err, Error::InvariantViolation(_)), "{err}");
    let err = g.append(v1, EdgeType::Default, None).unwrap_err();
    assert!(matches!(err, Error::InvariantViolation(_)), "{err}");
    assert_eq!(g.tail(&w).unwrap(), Some(v0));
}

on_both_engines!(illegal_ordering, out_of_order_add_fails);

// ============================================================================
// 6. Heads, tails, point-in-time
// ============================================================================

fn heads_tails_and_vertex_at<B: GraphBackend<Worker = HostThread>>(g: &B) {
    let (a, b) = (worker(1), worker(2));
    assert_eq!(g.head().unwrap(), None);
    for t in [10, 20, 30] {
        g.append(g.create_vertex(&a, t), EdgeType::Running, None).unwrap();
    }
    for t in [5, 25] {
        g.append(g.create_vertex(&b, t), EdgeType::Running, None).unwrap();
    }

    assert_eq!(g.head().unwrap(), Some(g.create_vertex(&b, 5)));
    assert_eq!(g.head_of_worker(&a).unwrap().map(|v| v.ts()), Some(10));
    assert_eq!(g.tail(&a).unwrap().map(|v| v.ts()), Some(30));
    assert_eq!(g.head_of(g.create_vertex(&a, 30)).unwrap().ts(), 10);

    assert_eq!(g.vertex_at(0, &a).unwrap().map(|v| v.ts()), Some(10));
    assert_eq!(g.vertex_at(11, &a).unwrap().map(|v| v.ts()), Some(20));
    assert_eq!(g.vertex_at(20, &a).unwrap().map(|v| v.ts()), Some(20));
    assert_eq!(g.vertex_at(31, &a).unwrap(), None);
    assert_eq!(g.vertex_at(6, &b).unwrap().map(|v| v.ts()), Some(25));
    assert_eq!(g.vertex_at(0, &worker(3)).unwrap(), None);
}

on_both_engines!(heads_and_points, heads_tails_and_vertex_at);

fn unknown_worker_is_empty<B: GraphBackend<Worker = HostThread>>(g: &B) {
    let ghost = worker(99);
    assert_eq!(g.nodes_of(&ghost).unwrap().count(), 0);
    assert_eq!(g.tail(&ghost).unwrap(), None);
    assert_eq!(g.head_of_worker(&ghost).unwrap(), None);
    assert_eq!(g.remove_tail(&ghost).unwrap(), None);
    assert!(g.workers().unwrap().is_empty());
}

on_both_engines!(unknown_worker, unknown_worker_is_empty);

// ============================================================================
// 7. Rollback of the last vertex
// ============================================================================

fn remove_tail_then_continue<B: GraphBackend<Worker = HostThread>>(g: &B) {
    let w = worker(1);
    let v0 = g.create_vertex(&w, 0);
    let v1 = g.create_vertex(&w, 8);
    g.append(v0, EdgeType::Default, None).unwrap();
    g.append(v1, EdgeType::Blocked, None).unwrap();

    assert_eq!(g.remove_tail(&w).unwrap(), Some(v1));
    assert_eq!(g.nodes_of(&w).unwrap().collect::<Vec<_>>(), vec![v0]);
    assert_eq!(g.edge_from(&v0, EdgeDirection::OutgoingHorizontal).unwrap(), None);
    assert_eq!(g.size().unwrap(), 1);

    let v2 = g.create_vertex(&w, 8);
    let edge = g.append(v2, EdgeType::Running, None).unwrap().unwrap();
    assert_eq!(edge.edge_type, EdgeType::Running);
    assert_eq!(g.size().unwrap(), 2);
}

on_both_engines!(remove_tail, remove_tail_then_continue);

// ============================================================================
// 8. Closing
// ============================================================================

fn writes_fail_after_close<B: GraphBackend<Worker = HostThread>>(g: &B) {
    let w = worker(1);
    g.append(g.create_vertex(&w, 0), EdgeType::Default, None).unwrap();
    assert!(!g.is_done_building());
    g.close_graph(100).unwrap();
    assert!(g.is_done_building());
    assert!(g.wait_until_built(std::time::Duration::ZERO));
    assert!(g.append(g.create_vertex(&w, 200), EdgeType::Default, None).is_err());
    assert_eq!(g.nodes_of(&w).unwrap().count(), 1);
}

on_both_engines!(close, writes_fail_after_close);

fn close_is_idempotent<B: GraphBackend<Worker = HostThread>>(g: &B) {
    let w = worker(1);
    g.append(g.create_vertex(&w, 0), EdgeType::Default, None).unwrap();
    g.append(g.create_vertex(&w, 4), EdgeType::Running, None).unwrap();
    g.close_graph(10).unwrap();
    g.close_graph(20).unwrap();
    assert!(g.is_done_building());
    assert_eq!(g.size().unwrap(), 2);
}

on_both_engines!(close_twice, close_is_idempotent);

// ============================================================================
// 9. Engine-specific timestamp rules
// ============================================================================

#[test]
fn test_memory_rejects_equal_timestamp() {
    let g = MemoryBackend::new();
    g.append(g.create_vertex(&worker(1), 5), EdgeType::Default, None).unwrap();
    let err = g.append(g.create_vertex(&worker(1), 5), EdgeType::Default, None).unwrap_err();
    assert!(matches!(err, Error::InvariantViolation(_)));
}

#[test]
fn test_history_equal_timestamp_is_same_vertex() {
    let dir = tempfile::tempdir().unwrap();
    let g = history(&dir, "equal");
    let v = g.create_vertex(&worker(1), 5);
    g.append(v, EdgeType::Default, None).unwrap();
    assert_eq!(g.append(v, EdgeType::Blocked, None).unwrap(), None);
    g.add(v).unwrap();
    assert_eq!(g.nodes_of(&worker(1)).unwrap().collect::<Vec<_>>(), vec![v]);
}
