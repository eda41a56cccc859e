//! End-to-end tests for the on-disk engine: close, reopen, rebuild.

mod common;

use std::fs;
use std::io::{Seek, SeekFrom, Write};

use common::{build_mixed, snapshot, worker};
use pretty_assertions::assert_eq;
use timegraph::{
    EdgeDirection, EdgeType, Error, Graph, GraphBackend, HistoryBackend, HistoryConfig, HostThread,
    MemoryBackend,
};

fn config(dir: &tempfile::TempDir) -> HistoryConfig {
    HistoryConfig::new(dir.path(), "trace-1")
}

// ============================================================================
// 1. Round trip
// ============================================================================

#[test]
fn test_round_trip_preserves_every_edge() {
    let dir = tempfile::tempdir().unwrap();
    let g = HistoryBackend::create(config(&dir)).unwrap();
    build_mixed(&g);
    let before = snapshot(&g);
    g.close_graph(50).unwrap();
    assert_eq!(snapshot(&g), before);
    drop(g);

    let reopened: HistoryBackend<HostThread> = HistoryBackend::open_existing(config(&dir)).unwrap();
    assert!(reopened.is_done_building());
    assert_eq!(snapshot(&reopened), before);
    assert_eq!(reopened.size().unwrap(), 9);
    assert_eq!(reopened.vertical_edge_count(), 2);
    reopened.close_graph(60).unwrap();
    assert_eq!(reopened.history().current_end_time(), 50);
}

#[test]
fn test_records_reach_disk_while_building() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir);
    let g = HistoryBackend::create(cfg.clone()).unwrap();
    let header = fs::metadata(cfg.history_path()).unwrap().len();
    assert_eq!(fs::metadata(cfg.segments_path()).unwrap().len(), header);

    build_mixed(&g);
    let history_len = fs::metadata(cfg.history_path()).unwrap().len();
    let segments_len = fs::metadata(cfg.segments_path()).unwrap().len();
    assert!(history_len > header, "closed intervals are appended as they close");
    assert!(segments_len > header, "vertical edges are appended as they are linked");

    g.close_graph(50).unwrap();
    assert!(fs::metadata(cfg.history_path()).unwrap().len() > history_len);
}

#[test]
fn test_both_engines_agree() {
    let dir = tempfile::tempdir().unwrap();
    let disk = HistoryBackend::create(config(&dir)).unwrap();
    let memory = MemoryBackend::new();
    build_mixed(&disk);
    build_mixed(&memory);
    assert_eq!(snapshot(&disk), snapshot(&memory));
}

#[test]
fn test_round_trip_details() {
    let dir = tempfile::tempdir().unwrap();
    let g = HistoryBackend::create(config(&dir)).unwrap();
    build_mixed(&g);
    g.close_graph(50).unwrap();
    drop(g);

    let g: HistoryBackend<HostThread> = HistoryBackend::open_existing(config(&dir)).unwrap();
    let a10 = g.vertex_at(10, &worker(1)).unwrap().unwrap();
    let running = g.edge_from(&a10, EdgeDirection::OutgoingHorizontal).unwrap().unwrap();
    assert_eq!((running.edge_type, running.qualifier.as_deref()), (EdgeType::Running, Some("cpu0")));
    let network = g.edge_from(&a10, EdgeDirection::OutgoingVertical).unwrap().unwrap();
    assert_eq!(network.qualifier.as_deref(), Some("eth0"));
    assert_eq!(g.parent_of(&network.to).unwrap(), Some(worker(2)));

    // 25 -> 30 on worker 2 was an add: a span with no edge.
    let b25 = g.vertex_at(21, &worker(2)).unwrap().unwrap();
    assert_eq!(b25.ts(), 25);
    assert_eq!(g.edge_from(&b25, EdgeDirection::OutgoingHorizontal).unwrap(), None);
    assert_eq!(g.tail(&worker(2)).unwrap().map(|v| v.ts()), Some(30));
    assert_eq!(g.head().unwrap().map(|v| v.ts()), Some(0));
    assert_eq!(g.workers().unwrap().len(), 3);
}

// ============================================================================
// 2. Open policy
// ============================================================================

#[test]
fn test_open_history_reopens_closed_graph() {
    let dir = tempfile::tempdir().unwrap();
    {
        let graph: Graph<HistoryBackend<HostThread>> = Graph::open_history(config(&dir)).unwrap();
        build_mixed(graph.backend());
        graph.backend().close_graph(50).unwrap();
    }
    let graph: Graph<HistoryBackend<HostThread>> = Graph::open_history(config(&dir)).unwrap();
    assert!(graph.backend().is_done_building());
    assert_eq!(graph.backend().nodes_of(&worker(1)).unwrap().count(), 4);
}

#[test]
fn test_unclosed_graph_is_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    {
        let g = HistoryBackend::create(config(&dir)).unwrap();
        build_mixed(&g);
        // Dropped without close_graph: the files hold no close record.
    }
    let g: HistoryBackend<HostThread> = HistoryBackend::open_or_create(config(&dir)).unwrap();
    assert!(!g.is_done_building());
    assert_eq!(g.size().unwrap(), 0);
    g.append(g.create_vertex(&worker(1), 3), EdgeType::Default, None).unwrap();
}

#[test]
fn test_incompatible_version_is_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir);
    {
        let g = HistoryBackend::create(cfg.clone()).unwrap();
        build_mixed(&g);
        g.close_graph(50).unwrap();
    }
    // Bump the provider version stored after magic and format version.
    let mut file = fs::OpenOptions::new().write(true).open(cfg.history_path()).unwrap();
    file.seek(SeekFrom::Start(8)).unwrap();
    file.write_all(&99u32.to_le_bytes()).unwrap();
    drop(file);

    let err = HistoryBackend::<HostThread>::open_existing(cfg.clone()).err().unwrap();
    assert!(matches!(err, Error::VersionMismatch { found: 99, .. }), "{err}");

    let g: HistoryBackend<HostThread> = HistoryBackend::open_or_create(cfg).unwrap();
    assert!(!g.is_done_building());
    assert!(g.workers().unwrap().is_empty());
}

#[test]
fn test_partial_pair_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir);
    {
        let g: HistoryBackend<HostThread> = HistoryBackend::create(cfg.clone()).unwrap();
        g.close_graph(0).unwrap();
    }
    fs::remove_file(cfg.segments_path()).unwrap();
    let err = HistoryBackend::<HostThread>::open_or_create(cfg.clone()).err().unwrap();
    assert!(matches!(err, Error::Corruption(_)), "{err}");
    assert!(cfg.history_path().exists(), "a partial pair must not be deleted");
}

#[test]
fn test_create_refuses_existing_graph() {
    let dir = tempfile::tempdir().unwrap();
    let _g: HistoryBackend<HostThread> = HistoryBackend::create(config(&dir)).unwrap();
    let err = HistoryBackend::<HostThread>::create(config(&dir)).err().unwrap();
    assert!(matches!(err, Error::StorageError(_)), "{err}");
}

#[test]
fn test_dispose_deletes_files() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir);
    let g: HistoryBackend<HostThread> = HistoryBackend::create(cfg.clone()).unwrap();
    g.add(g.create_vertex(&worker(1), 1)).unwrap();
    g.close_graph(5).unwrap();
    g.dispose(true).unwrap();
    assert!(!cfg.history_path().exists());
    assert!(!cfg.segments_path().exists());
}

#[test]
fn test_start_time_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir).with_start_time(1_000);
    {
        let g: HistoryBackend<HostThread> = HistoryBackend::create(cfg.clone()).unwrap();
        g.append(g.create_vertex(&worker(1), 1_000), EdgeType::Default, None).unwrap();
        g.append(g.create_vertex(&worker(1), 1_500), EdgeType::Running, None).unwrap();
        g.close_graph(2_000).unwrap();
    }
    let g: HistoryBackend<HostThread> = HistoryBackend::open_existing(cfg).unwrap();
    assert_eq!(g.history().start_time(), 1_000);
    assert_eq!(g.history().current_end_time(), 2_000);
    let first = g.head_of_worker(&worker(1)).unwrap().unwrap();
    assert_eq!(first.ts(), 1_000);
    assert_eq!(g.edge_from(&first, EdgeDirection::IncomingHorizontal).unwrap(), None);
    let second = g.tail(&worker(1)).unwrap().unwrap();
    assert_eq!(g.edge_from(&second, EdgeDirection::IncomingHorizontal).unwrap().map(|e| e.from), Some(first));
}
