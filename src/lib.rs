//! # timegraph — Timed Dependency Graphs in Rust
//!
//! Records and queries the causal graph between independently running
//! workers (threads, interrupt contexts, remote hosts) observed in a trace.
//! Every worker is a timeline of vertices; horizontal edges join the
//! consecutive vertices of one worker, vertical edges join vertices of two
//! different workers.
//!
//! ## Design Principles
//!
//! 1. **Trait-first**: `GraphBackend` is the contract between producer, engines and readers
//! 2. **Value DTOs**: `Vertex` and `Edge` are plain values, rebuilt from `(attribute, ts)` at will
//! 3. **Single writer**: one producer, non-decreasing time per worker, enforced loudly
//! 4. **Backend-agnostic algorithms**: traversal, statistics and export only see the trait
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use timegraph::{Graph, GraphBackend, EdgeType, HostThread};
//!
//! # fn example() -> timegraph::Result<()> {
//! let graph = Graph::<timegraph::MemoryBackend<HostThread>>::open_memory();
//! let backend = graph.backend();
//!
//! let worker = HostThread::new("host", 42);
//! backend.append(backend.create_vertex(&worker, 0), EdgeType::Default, None)?;
//! let edge = backend.append(backend.create_vertex(&worker, 10), EdgeType::Blocked, Some("disk"))?;
//! assert_eq!(edge.map(|e| e.duration()), Some(10));
//! backend.close_graph(10)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Storage Backends
//!
//! | Backend | Description |
//! |---------|-------------|
//! | `MemoryBackend` | Transient graph for tests and short-lived analyses |
//! | `HistoryBackend` | Durable interval-store + segment-store file pair, readable while built |

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod storage;
pub mod traversal;
pub mod builder;
pub mod statistics;
pub mod export;

// ============================================================================
// Re-exports: Model (the DTOs)
// ============================================================================

pub use model::{
    Worker, HostThread, Attribute, Vertex,
    Edge, EdgeType, EdgeDirection,
};

// ============================================================================
// Re-exports: Storage
// ============================================================================

pub use storage::{GraphBackend, BuildLatch, MemoryBackend, HistoryBackend, HistoryConfig};

// ============================================================================
// Re-exports: Algorithms
// ============================================================================

pub use traversal::{GraphVisitor, scan_line_traverse};
pub use builder::{GraphBuilder, BuildStats};
pub use statistics::GraphStatistics;

// ============================================================================
// Top-level Graph handle
// ============================================================================

/// The primary entry point. A `Graph` wraps a backend and runs the
/// backend-agnostic algorithms over it.
pub struct Graph<B: GraphBackend> {
    backend: B,
}

impl<B: GraphBackend> Graph<B> {
    /// Create a Graph with the given backend.
    pub fn with_backend(backend: B) -> Self {
        Self { backend }
    }

    /// Visit everything reachable through the scan line of `start`.
    pub fn traverse(&self, start: Vertex, visitor: &mut impl GraphVisitor) -> Result<()> {
        scan_line_traverse(&self.backend, start, visitor)
    }

    /// Busy time per worker, seen from `worker`'s scan line.
    pub fn statistics(&self, worker: &B::Worker) -> Result<GraphStatistics<B::Worker>> {
        GraphStatistics::compute(&self.backend, worker)
    }

    /// A builder feeding this graph.
    pub fn builder(&self) -> GraphBuilder<'_, B> {
        GraphBuilder::new(&self.backend)
    }

    /// Access the underlying backend (for advanced use).
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}

/// In-memory graph for testing and embedding.
impl<W: Worker> Graph<MemoryBackend<W>> {
    pub fn open_memory() -> Self {
        Self::with_backend(MemoryBackend::new())
    }
}

/// Durable graph, reopened when its files exist.
impl<W: Worker> Graph<HistoryBackend<W>> {
    pub fn open_history(config: HistoryConfig) -> Result<Self> {
        Ok(Self::with_backend(HistoryBackend::open_or_create(config)?))
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Cycle detected: {0}")]
    CycleDetected(String),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Corrupt store: {0}")]
    Corruption(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Time {time} outside of [{start}, {end}]")]
    TimeRange { time: i64, start: i64, end: i64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
