//! Graph Execution Runner.
//!
//! Coordinates declarative DAG-shaped workflows on top of the same storage
//! contract as the imperative core:
//! - `pattern` -- compiled `{param}` node-id patterns for dynamic fan-out
//! - `validate` -- eager reference validation and the node index
//! - `input` -- data-reference / template resolution against node results
//! - `ready` -- the shared readiness & routing algorithm
//! - `runner` -- queued and inline driving algorithms
//! - `hash` -- canonical graph content hashing

pub mod hash;
pub mod input;
pub mod pattern;
pub mod ready;
pub mod runner;
pub mod validate;

pub use hash::graph_hash;
pub use validate::GraphIndex;
