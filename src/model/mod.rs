//! # Timed Graph Model
//!
//! Value types that define the timed dependency graph.
//! These types cross every boundary: producer ↔ storage ↔ traversal ↔ user.
//!
//! Design rule: NO storage handles, NO interval-store types here.
//! This module is pure data — no I/O, no state.

pub mod worker;
pub mod vertex;
pub mod edge;

pub use worker::{Worker, HostThread};
pub use vertex::{Vertex, Attribute};
pub use edge::{Edge, EdgeType, EdgeDirection};
