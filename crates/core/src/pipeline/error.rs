//! Pipeline error types.

use thiserror::Error;

/// Errors raised while building, persisting or driving a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A node reads a context key that nothing before it writes.
    #[error("missing context key '{key}' required by node '{node}'")]
    MissingContext { key: String, node: String },

    /// A sequence or parallel set with no children.
    #[error("empty pipeline section: {0}")]
    Empty(String),

    #[error("unknown activity: {0}")]
    UnknownActivity(String),

    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// Operation not allowed in the node's current status.
    #[error("cannot {operation} node {node_id}: status is {status}")]
    InvalidState {
        node_id: String,
        status: String,
        operation: String,
    },

    #[error("database error: {0}")]
    Database(String),
}

/// Errors returned by an activity's `execute` or `poll`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ActivityError {
    /// A required context value was never written. Never retried.
    #[error("missing context key: {0}")]
    MissingContext(String),

    /// Another ticket holds an exclusive operation on the cluster.
    #[error("execution mutex: cluster {cluster_id} is locked by ticket {held_by}")]
    MutexConflict { cluster_id: String, held_by: String },

    /// Automatic mutex retries exhausted.
    #[error("execution mutex: max retries exceeded ({attempts}) waiting for cluster {cluster_id}")]
    MaxRetriesExceeded { cluster_id: String, attempts: u32 },

    #[error("invalid activity params: {0}")]
    InvalidParams(String),

    /// The remote system reported an error.
    #[error("external service error: {0}")]
    External(String),

    /// The activity ran and reported failure.
    #[error("{0}")]
    Failed(String),

    /// The node was running when the service stopped and cannot be resumed.
    #[error("interrupted by service restart")]
    Interrupted,
}
