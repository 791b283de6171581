//! Pipeline definition and execution.
//!
//! A [`PipelineBuilder`] composes activity steps into a tree of sequential and
//! parallel composites. [`PipelineEngine`] persists the tree as nodes and drives
//! them `Ready -> Running -> Succeeded | Failed`, sharing values between nodes
//! through the ticket-scoped context store.

mod activity;
mod builder;
mod context;
mod engine;
mod error;
mod node;
mod scheduler;
mod store;

pub use activity::{
    cluster_targets, Activity, ActivityContext, ActivityOutcome, ActivityRegistry, Outputs,
};
pub use builder::{
    ActivityStep, NodeSpec, ParallelMode, Pipeline, PipelineBuilder, TicketContext,
    UnresolvedRead,
};
pub use context::{ContextStore, SqliteContextStore};
pub use engine::{EngineConfig, PipelineEngine, PipelineEvent, PipelineEventKind};
pub use error::{ActivityError, PipelineError};
pub use node::{flatten, NodeKind, NodeStatus, NodeTree, PipelineNode, PipelineRun};
pub use scheduler::Scheduler;
pub use store::{NodeExpect, NodeStore, NodeUpdate, SqliteNodeStore};
