//! The shared readiness & routing algorithm.
//!
//! Both driving modes (queued and inline) re-run the same computation on
//! every continuation pass:
//!
//! 1. map the run's step records back to declared nodes (templated ids via
//!    their patterns),
//! 2. fail the run if any node failed terminally without error routing,
//! 3. compute the candidate set (entries plus the `next` targets of
//!    completed nodes, resolved through recorded branch keys),
//! 4. keep candidates with no step record whose input dependencies are all
//!    completed -- the ready set,
//! 5. when nothing is ready, in flight, or pending dispatch, the run is
//!    complete.

use std::collections::{BTreeSet, HashMap};

use windlass_types::graph::NodeSpec;

use crate::error::GraphError;
use crate::graph::validate::GraphIndex;
use crate::store::GraphSnapshot;

// ---------------------------------------------------------------------------
// Node states
// ---------------------------------------------------------------------------

/// A terminally-failed node with declared error routing.
#[derive(Debug, Clone)]
pub struct RoutedFailure {
    /// The declared node id (possibly templated).
    pub node_id: String,
    /// The concrete step name that failed.
    pub step_name: String,
}

/// The run's step records, mapped from runtime step names onto declared
/// node ids.
#[derive(Debug, Default)]
pub struct NodeStates {
    /// Node ids with at least one succeeded instance.
    pub completed: BTreeSet<String>,
    /// Node ids that failed terminally with no `on_error` routing.
    pub failed_fatal: Vec<String>,
    /// Terminal failures whose errors route to `on_error` targets.
    pub failed_routed: Vec<RoutedFailure>,
    /// Step names still in flight (neither succeeded nor terminally failed).
    pub in_flight: Vec<String>,
    /// Branch key recorded per node id.
    pub branches: HashMap<String, String>,
    /// Every raw step name with a record in this run.
    pub step_names: Vec<String>,
}

/// Map a storage snapshot onto declared nodes.
pub fn map_snapshot(
    index: &GraphIndex<'_>,
    snapshot: &GraphSnapshot,
) -> Result<NodeStates, GraphError> {
    let mut states = NodeStates {
        step_names: snapshot.all_step_names().map(str::to_string).collect(),
        in_flight: snapshot.in_flight.clone(),
        ..NodeStates::default()
    };

    for step_name in &snapshot.completed {
        let (node_id, _) = index.resolve_required(step_name)?;
        states.completed.insert(node_id.to_string());
        if let Some(branch) = snapshot.branches.get(step_name) {
            states.branches.insert(node_id.to_string(), branch.clone());
        }
    }

    for step_name in &snapshot.failed {
        let (node_id, spec) = index.resolve_required(step_name)?;
        if spec.on_error.is_some() {
            states.failed_routed.push(RoutedFailure {
                node_id: node_id.to_string(),
                step_name: step_name.clone(),
            });
        } else {
            states.failed_fatal.push(node_id.to_string());
        }
    }

    Ok(states)
}

// ---------------------------------------------------------------------------
// Candidates & readiness
// ---------------------------------------------------------------------------

/// The candidate set: entry nodes plus every `next` target of a completed
/// node, resolved through that node's recorded branch key.
pub fn candidate_nodes(
    index: &GraphIndex<'_>,
    states: &NodeStates,
) -> Result<BTreeSet<String>, GraphError> {
    let graph = index.graph();
    let mut candidates = BTreeSet::new();

    for entry in &graph.entry_node_ids {
        let (node_id, _) = index.resolve_required(entry)?;
        candidates.insert(node_id.to_string());
    }

    for node_id in &states.completed {
        let spec = &graph.nodes[node_id.as_str()];
        let Some(next) = &spec.next else { continue };
        let branch = states.branches.get(node_id).map(String::as_str);
        for target in next.targets(branch) {
            let (target_id, _) = index.resolve_required(target)?;
            candidates.insert(target_id.to_string());
        }
    }

    Ok(candidates)
}

/// Candidates with no step record for this run.
pub fn fresh_candidates(
    index: &GraphIndex<'_>,
    states: &NodeStates,
    candidates: &BTreeSet<String>,
) -> BTreeSet<String> {
    candidates
        .iter()
        .filter(|node_id| !index.has_instance(node_id, states.step_names.iter().map(String::as_str)))
        .cloned()
        .collect()
}

/// Whether every node referenced by this node's input is completed.
pub fn dependencies_satisfied(
    index: &GraphIndex<'_>,
    spec: &NodeSpec,
    completed: &BTreeSet<String>,
) -> Result<bool, GraphError> {
    for dep in crate::graph::input::input_dependencies(&spec.input) {
        let (node_id, _) = index.resolve_required(&dep)?;
        if !completed.contains(node_id) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Completion decision for a pass that dispatched nothing: the run is done
/// when no fresh candidates remain, nothing is in flight, and no node failed
/// fatally.
pub fn run_is_complete(states: &NodeStates, fresh: &BTreeSet<String>) -> bool {
    fresh.is_empty() && states.in_flight.is_empty() && states.failed_fatal.is_empty()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
