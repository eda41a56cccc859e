//! Worker — an independently scheduled execution context.

use std::fmt;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Identity of a timeline in the graph.
///
/// Workers are supplied by the caller; the graph never creates them. The
/// serde bounds let the on-disk backend persist its worker table so a
/// reopened graph resolves the same workers.
pub trait Worker:
    Clone + Eq + Ord + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Worker for T where
    T: Clone + Eq + Ord + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// A thread on a given host, the usual worker of a kernel trace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostThread {
    pub host_id: String,
    pub tid: i64,
}

impl HostThread {
    pub fn new(host_id: impl Into<String>, tid: i64) -> Self {
        Self { host_id: host_id.into(), tid }
    }
}

impl fmt::Display for HostThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host_id, self.tid)
    }
}
