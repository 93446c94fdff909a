//! Shared domain types for Windlass.
//!
//! This crate contains the persisted data model of the workflow engine:
//! runs, step state and attempt history, graph definitions, and the storage
//! error surface.
//!
//! Zero infrastructure dependencies -- only serde, serde_json, uuid, chrono,
//! thiserror.

pub mod error;
pub mod graph;
pub mod run;
pub mod step;
