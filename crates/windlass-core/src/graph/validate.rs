//! Eager graph validation and the node index.
//!
//! Every entry node, every `next`/`on_error` target, and every input data
//! reference must resolve to a declared node before any execution happens;
//! unresolved or ambiguous references fail fast with a descriptive error.
//! The index also resolves runtime step names back to declared nodes,
//! matching templated ids through their compiled patterns.

use windlass_types::graph::{NodeSpec, WorkflowGraph};

use crate::error::GraphError;
use crate::graph::input::input_dependencies;
use crate::graph::pattern::{NodePattern, is_templated};

// ---------------------------------------------------------------------------
// GraphIndex
// ---------------------------------------------------------------------------

/// A validated view over a graph: compiled patterns plus reference
/// resolution. Build once per continuation pass.
#[derive(Debug)]
pub struct GraphIndex<'g> {
    graph: &'g WorkflowGraph,
    patterns: Vec<(&'g str, NodePattern)>,
}

impl<'g> GraphIndex<'g> {
    /// Validate the graph and build its index.
    pub fn build(graph: &'g WorkflowGraph) -> Result<Self, GraphError> {
        let patterns = graph
            .nodes
            .keys()
            .filter_map(|id| NodePattern::compile(id).map(|p| (id.as_str(), p)))
            .collect();

        let index = Self { graph, patterns };
        index.validate()?;
        Ok(index)
    }

    /// The graph this index was built over.
    pub fn graph(&self) -> &'g WorkflowGraph {
        self.graph
    }

    /// Resolve a reference or runtime step name to a declared node.
    ///
    /// Exact ids win; otherwise the name must match exactly one templated
    /// pattern. Multiple matches are a configuration error.
    pub fn resolve(&self, name: &str) -> Result<Option<(&'g str, &'g NodeSpec)>, GraphError> {
        if let Some((id, spec)) = self.graph.nodes.get_key_value(name) {
            return Ok(Some((id.as_str(), spec)));
        }

        let matches: Vec<&'g str> = self
            .patterns
            .iter()
            .filter(|(_, pattern)| pattern.matches(name))
            .map(|(id, _)| *id)
            .collect();

        match matches.as_slice() {
            [] => Ok(None),
            [id] => Ok(Some((id, &self.graph.nodes[*id]))),
            _ => Err(GraphError::AmbiguousMatch {
                name: name.to_string(),
                candidates: matches.iter().map(|id| id.to_string()).collect(),
            }),
        }
    }

    /// Resolve like [`resolve`](Self::resolve), erroring on unknown names.
    pub fn resolve_required(&self, name: &str) -> Result<(&'g str, &'g NodeSpec), GraphError> {
        self.resolve(name)?
            .ok_or_else(|| GraphError::UnknownNode(name.to_string()))
    }

    /// Whether any of the given runtime step names is an instance of the
    /// node (exact name, or pattern match for templated ids).
    pub fn has_instance<'a>(
        &self,
        node_id: &str,
        step_names: impl Iterator<Item = &'a str>,
    ) -> bool {
        match NodePattern::compile(node_id) {
            None => {
                let mut names = step_names;
                names.any(|name| name == node_id)
            }
            Some(pattern) => {
                let mut names = step_names;
                names.any(|name| name == node_id || pattern.matches(name))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    fn validate(&self) -> Result<(), GraphError> {
        if self.graph.entry_node_ids.is_empty() {
            return Err(GraphError::NoEntryNodes);
        }

        for entry in &self.graph.entry_node_ids {
            self.check_reference("<entry>", "entry", entry)?;
        }

        for (node_id, spec) in &self.graph.nodes {
            if let Some(next) = &spec.next {
                for target in next.all_targets() {
                    self.check_reference(node_id, "next", target)?;
                }
            }
            if let Some(on_error) = &spec.on_error {
                for target in on_error.ids() {
                    self.check_reference(node_id, "onError", target)?;
                }
            }
            for dep in input_dependencies(&spec.input) {
                let (resolved_id, _) = self
                    .resolve(&dep)?
                    .ok_or_else(|| GraphError::DanglingReference {
                        node: node_id.clone(),
                        context: "input",
                        target: dep.clone(),
                    })?;
                // A templated target has no single result to read.
                if is_templated(resolved_id) {
                    return Err(GraphError::TemplatedRef {
                        node: node_id.clone(),
                        target: dep,
                    });
                }
            }
        }

        Ok(())
    }

    fn check_reference(
        &self,
        node: &str,
        context: &'static str,
        target: &str,
    ) -> Result<(), GraphError> {
        if self.resolve(target)?.is_none() {
            return Err(GraphError::DanglingReference {
                node: node.to_string(),
                context,
                target: target.to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
