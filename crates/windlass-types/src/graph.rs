//! Declarative graph definitions.
//!
//! A `WorkflowGraph` maps node ids to node descriptors with explicit routing
//! (`next`, `on_error`) and input references to other nodes' results or the
//! trigger payload. Node ids may contain `{param}` placeholder segments to
//! support dynamic fan-out instances; such ids are matched against runtime
//! step names via a derived pattern.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Graph definition
// ---------------------------------------------------------------------------

/// A declarative workflow graph: entry nodes plus a node id -> descriptor map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    /// The initial ready set; always candidates on every continuation pass.
    pub entry_node_ids: Vec<String>,
    /// All declared nodes, keyed by (possibly templated) node id.
    pub nodes: BTreeMap<String, NodeSpec>,
}

/// One unit of work within a graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSpec {
    /// The business function to invoke. Nodes without an RPC are pure
    /// routing points and do not count toward run completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_name: Option<String>,
    /// Input payload: literals, `{"$ref": ..., "path": ...}` data
    /// references, and `{{node.path}}` string templates, resolved
    /// recursively through objects and arrays.
    #[serde(default)]
    pub input: Value,
    /// Successor routing evaluated once this node completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<NextRouting>,
    /// Where to route when this node fails terminally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<Targets>,
    /// Retries allowed after the first attempt (engine default if absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Base delay between retries in milliseconds (engine default if absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
}

/// Successor routing for a completed node.
///
/// Serde-untagged so graph JSON can use a plain string, a list, or a
/// branch-key map directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NextRouting {
    /// A single successor.
    One(String),
    /// All listed successors.
    Many(Vec<String>),
    /// The successor selected by the branch key the node recorded during
    /// execution; no successor if the key is absent from the map.
    Branch(BTreeMap<String, String>),
}

impl NextRouting {
    /// Resolve the routing to concrete target ids, given the branch key the
    /// node recorded (if any).
    pub fn targets(&self, branch: Option<&str>) -> Vec<&str> {
        match self {
            NextRouting::One(id) => vec![id.as_str()],
            NextRouting::Many(ids) => ids.iter().map(String::as_str).collect(),
            NextRouting::Branch(map) => branch
                .and_then(|key| map.get(key))
                .map(|id| vec![id.as_str()])
                .unwrap_or_default(),
        }
    }

    /// All ids mentioned anywhere in the routing (for validation).
    pub fn all_targets(&self) -> Vec<&str> {
        match self {
            NextRouting::One(id) => vec![id.as_str()],
            NextRouting::Many(ids) => ids.iter().map(String::as_str).collect(),
            NextRouting::Branch(map) => map.values().map(String::as_str).collect(),
        }
    }
}

/// One or more target node ids (used by `on_error`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Targets {
    One(String),
    Many(Vec<String>),
}

impl Targets {
    /// The target ids as a slice-like vec.
    pub fn ids(&self) -> Vec<&str> {
        match self {
            Targets::One(id) => vec![id.as_str()],
            Targets::Many(ids) => ids.iter().map(String::as_str).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Version pinning
// ---------------------------------------------------------------------------

/// A stored graph definition, pinned by content hash.
///
/// Runs record the hash of the exact graph they were started with so a
/// redeploy cannot silently change the shape of an in-flight run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    /// Workflow name the graph belongs to.
    pub workflow_name: String,
    /// Content hash identifying this exact definition.
    pub graph_hash: String,
    /// The graph definition itself.
    pub graph: WorkflowGraph,
    /// When this version was first stored.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
