//! Graph content hashing.
//!
//! Runs are pinned to the exact graph definition they started with via a
//! SHA-256 digest of the canonical JSON serialization (node maps are
//! BTreeMaps, so key order is stable).

use sha2::{Digest, Sha256};
use windlass_types::graph::WorkflowGraph;

/// Lowercase hex SHA-256 of the graph's canonical JSON.
pub fn graph_hash(graph: &WorkflowGraph) -> String {
    let canonical = serde_json::to_vec(graph).unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    format!("{digest:x}")
}
