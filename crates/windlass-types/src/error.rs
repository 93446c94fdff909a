use thiserror::Error;

/// Errors from storage-backend operations (used by the `WorkflowStore` trait
/// definition in windlass-core).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}
