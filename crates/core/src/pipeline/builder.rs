//! Declarative construction of pipeline trees.
//!
//! A pipeline is a tree: the root is a sequence, and every composite node is
//! its own join point. Sequential children run strictly in order; parallel
//! children become runnable together and the composite only succeeds once all
//! of them have.
//!
//! Each activity step declares the context keys it reads and writes. The
//! builder tracks which keys are available at every position and records
//! reads nothing before the step provides. Unresolved reads of a sub-pipeline
//! are re-checked when it is embedded; a root pipeline that still has any is
//! rejected before it is persisted.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::PipelineError;

/// How a parallel composite reacts to a failed branch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParallelMode {
    /// No new branch starts after a failure; the composite fails as soon as one branch does.
    #[default]
    FailFast,
    /// Every branch runs to completion; the composite still fails if any branch failed.
    BestEffort,
}

impl ParallelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParallelMode::FailFast => "fail_fast",
            ParallelMode::BestEffort => "best_effort",
        }
    }
}

impl std::str::FromStr for ParallelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail_fast" => Ok(ParallelMode::FailFast),
            "best_effort" => Ok(ParallelMode::BestEffort),
            other => Err(format!("unknown parallel mode: {}", other)),
        }
    }
}

/// Ticket-scoped inputs available to a builder.
#[derive(Debug, Clone)]
pub struct TicketContext {
    pub ticket_id: String,
    /// Validated ticket details.
    pub details: Value,
    /// Context keys already written by earlier flows.
    pub available_keys: BTreeSet<String>,
}

impl TicketContext {
    pub fn new(ticket_id: impl Into<String>, details: Value) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            details,
            available_keys: BTreeSet::new(),
        }
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.available_keys.extend(keys.into_iter().map(Into::into));
        self
    }
}

/// One activity invocation with its declared context keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityStep {
    pub name: String,
    pub activity: String,
    pub params: Value,
    #[serde(default)]
    pub reads: Vec<String>,
    #[serde(default)]
    pub writes: Vec<String>,
    /// Step waits for an explicit resume before it runs.
    #[serde(default)]
    pub start_paused: bool,
}

impl ActivityStep {
    pub fn new(name: impl Into<String>, activity: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            activity: activity.into(),
            params,
            reads: Vec::new(),
            writes: Vec::new(),
            start_paused: false,
        }
    }

    pub fn reads<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reads.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn writes<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.writes.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn paused(mut self) -> Self {
        self.start_paused = true;
        self
    }
}

/// Shape of a node in the definition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeSpec {
    Activity(ActivityStep),
    Sequence {
        name: String,
        children: Vec<NodeSpec>,
    },
    Parallel {
        name: String,
        mode: ParallelMode,
        children: Vec<NodeSpec>,
    },
}

impl NodeSpec {
    pub fn name(&self) -> &str {
        match self {
            NodeSpec::Activity(step) => &step.name,
            NodeSpec::Sequence { name, .. } | NodeSpec::Parallel { name, .. } => name,
        }
    }

    /// Every key written anywhere below this node.
    pub fn writes(&self) -> BTreeSet<String> {
        match self {
            NodeSpec::Activity(step) => step.writes.iter().cloned().collect(),
            NodeSpec::Sequence { children, .. } | NodeSpec::Parallel { children, .. } => {
                children.iter().flat_map(|c| c.writes()).collect()
            }
        }
    }

    /// Activity steps in definition order.
    pub fn steps(&self) -> Vec<&ActivityStep> {
        match self {
            NodeSpec::Activity(step) => vec![step],
            NodeSpec::Sequence { children, .. } | NodeSpec::Parallel { children, .. } => {
                children.iter().flat_map(|c| c.steps()).collect()
            }
        }
    }
}

/// A reads-unresolved context key and the step that needs it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnresolvedRead {
    pub key: String,
    pub node: String,
}

/// A finished pipeline definition. Immutable; execution state lives in the node store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub root: NodeSpec,
    /// Reads that must be satisfied by whatever this pipeline is embedded in.
    pub unresolved_reads: BTreeSet<UnresolvedRead>,
}

impl Pipeline {
    /// Fail if any declared read is still unsatisfied.
    pub fn ensure_resolved(&self) -> Result<(), PipelineError> {
        match self.unresolved_reads.iter().next() {
            Some(read) => Err(PipelineError::MissingContext {
                key: read.key.clone(),
                node: read.node.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Builder for pipelines; see the module docs.
#[derive(Debug)]
pub struct PipelineBuilder {
    context: TicketContext,
    name: String,
    children: Vec<NodeSpec>,
    available: BTreeSet<String>,
    unresolved: BTreeSet<UnresolvedRead>,
    errors: Vec<PipelineError>,
}

impl PipelineBuilder {
    pub fn new(context: TicketContext) -> Self {
        let available = context.available_keys.clone();
        Self {
            context,
            name: "pipeline".to_string(),
            children: Vec::new(),
            available,
            unresolved: BTreeSet::new(),
            errors: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn context(&self) -> &TicketContext {
        &self.context
    }

    /// Append one activity after everything added so far.
    pub fn add_activity(self, name: impl Into<String>, activity: impl Into<String>, params: Value) -> Self {
        self.add_step(ActivityStep::new(name, activity, params))
    }

    /// Append one activity with declared context keys.
    pub fn add_step(mut self, step: ActivityStep) -> Self {
        self.check_reads(&step.reads, &step.name);
        self.available.extend(step.writes.iter().cloned());
        self.children.push(NodeSpec::Activity(step));
        self
    }

    /// Append a fail-fast parallel set of activities.
    pub fn add_parallel_activities<I>(self, steps: I) -> Self
    where
        I: IntoIterator<Item = ActivityStep>,
    {
        self.add_parallel_activities_with_mode(steps, ParallelMode::FailFast)
    }

    pub fn add_parallel_activities_with_mode<I>(mut self, steps: I, mode: ParallelMode) -> Self
    where
        I: IntoIterator<Item = ActivityStep>,
    {
        let steps: Vec<ActivityStep> = steps.into_iter().collect();
        let name = format!("parallel-{}", self.children.len());
        if steps.is_empty() {
            self.errors.push(PipelineError::Empty(name));
            return self;
        }

        // Parallel siblings cannot see each other's writes.
        for step in &steps {
            self.check_reads(&step.reads, &step.name);
        }
        for step in &steps {
            self.available.extend(step.writes.iter().cloned());
        }

        self.children.push(NodeSpec::Parallel {
            name,
            mode,
            children: steps.into_iter().map(NodeSpec::Activity).collect(),
        });
        self
    }

    /// Append an already-built pipeline as one sequential step.
    pub fn add_sub_pipeline(mut self, pipeline: Pipeline, name: impl Into<String>) -> Self {
        let node = self.embed(pipeline, name.into());
        self.available.extend(node.writes());
        self.children.push(node);
        self
    }

    /// Append several built pipelines as fail-fast parallel branches.
    pub fn add_parallel_sub_pipelines<I, S>(self, pipelines: I) -> Self
    where
        I: IntoIterator<Item = (S, Pipeline)>,
        S: Into<String>,
    {
        self.add_parallel_sub_pipelines_with_mode(pipelines, ParallelMode::FailFast)
    }

    pub fn add_parallel_sub_pipelines_with_mode<I, S>(mut self, pipelines: I, mode: ParallelMode) -> Self
    where
        I: IntoIterator<Item = (S, Pipeline)>,
        S: Into<String>,
    {
        let branches: Vec<NodeSpec> = pipelines
            .into_iter()
            .map(|(name, pipeline)| self.embed(pipeline, name.into()))
            .collect();

        let name = format!("parallel-{}", self.children.len());
        if branches.is_empty() {
            self.errors.push(PipelineError::Empty(name));
            return self;
        }

        for branch in &branches {
            self.available.extend(branch.writes());
        }
        self.children.push(NodeSpec::Parallel {
            name,
            mode,
            children: branches,
        });
        self
    }

    /// Finalize the tree.
    pub fn build(mut self) -> Result<Pipeline, PipelineError> {
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }
        if self.children.is_empty() {
            return Err(PipelineError::Empty(self.name));
        }

        Ok(Pipeline {
            root: NodeSpec::Sequence {
                name: self.name.clone(),
                children: self.children,
            },
            name: self.name,
            unresolved_reads: self.unresolved,
        })
    }

    fn check_reads(&mut self, reads: &[String], node: &str) {
        for key in reads {
            if !self.available.contains(key) {
                self.unresolved.insert(UnresolvedRead {
                    key: key.clone(),
                    node: node.to_string(),
                });
            }
        }
    }

    /// Re-check a sub-pipeline's open reads at the current position and rename its root.
    fn embed(&mut self, pipeline: Pipeline, name: String) -> NodeSpec {
        for read in pipeline.unresolved_reads {
            if !self.available.contains(&read.key) {
                self.unresolved.insert(read);
            }
        }

        match pipeline.root {
            NodeSpec::Sequence { children, .. } => NodeSpec::Sequence { name, children },
            other => NodeSpec::Sequence {
                name,
                children: vec![other],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> TicketContext {
        TicketContext::new("t-1", json!({"cluster_id": "c-1"}))
    }

    fn step(name: &str) -> ActivityStep {
        ActivityStep::new(name, "noop", json!({}))
    }

    #[test]
    fn test_sequential_then_parallel() {
        let pipeline = PipelineBuilder::new(ctx())
            .add_activity("prepare", "noop", json!({}))
            .add_activity("install", "noop", json!({}))
            .add_parallel_activities(vec![step("a"), step("b"), step("c")])
            .build()
            .unwrap();

        let NodeSpec::Sequence { children, .. } = &pipeline.root else {
            panic!("root must be a sequence");
        };
        assert_eq!(children.len(), 3);
        assert!(matches!(children[0], NodeSpec::Activity(_)));
        match &children[2] {
            NodeSpec::Parallel { mode, children, .. } => {
                assert_eq!(*mode, ParallelMode::FailFast);
                assert_eq!(children.len(), 3);
            }
            other => panic!("expected parallel, got {:?}", other),
        }
        assert_eq!(pipeline.root.steps().len(), 5);
        assert!(pipeline.ensure_resolved().is_ok());
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let result = PipelineBuilder::new(ctx()).build();
        assert!(matches!(result, Err(PipelineError::Empty(_))));

        let result = PipelineBuilder::new(ctx())
            .add_parallel_activities(Vec::new())
            .build();
        assert!(matches!(result, Err(PipelineError::Empty(_))));
    }

    #[test]
    fn test_reads_resolved_by_earlier_writes() {
        let pipeline = PipelineBuilder::new(ctx())
            .add_step(step("allocate").writes(["hosts"]))
            .add_step(step("install").reads(["hosts"]))
            .build()
            .unwrap();
        assert!(pipeline.ensure_resolved().is_ok());
    }

    #[test]
    fn test_reads_resolved_by_ticket_context() {
        let pipeline = PipelineBuilder::new(ctx().with_keys(["hosts"]))
            .add_step(step("install").reads(["hosts"]))
            .build()
            .unwrap();
        assert!(pipeline.ensure_resolved().is_ok());
    }

    #[test]
    fn test_missing_read_detected() {
        let pipeline = PipelineBuilder::new(ctx())
            .add_step(step("install").reads(["hosts"]))
            .add_step(step("allocate").writes(["hosts"]))
            .build()
            .unwrap();

        match pipeline.ensure_resolved() {
            Err(PipelineError::MissingContext { key, node }) => {
                assert_eq!(key, "hosts");
                assert_eq!(node, "install");
            }
            other => panic!("expected missing context, got {:?}", other),
        }
    }

    #[test]
    fn test_parallel_siblings_do_not_see_each_other() {
        let pipeline = PipelineBuilder::new(ctx())
            .add_parallel_activities(vec![
                step("a").writes(["x"]),
                step("b").reads(["x"]),
            ])
            .build()
            .unwrap();
        assert!(pipeline.ensure_resolved().is_err());
    }

    #[test]
    fn test_sub_pipeline_reads_resolved_on_embed() {
        let sub = PipelineBuilder::new(ctx())
            .add_step(step("configure").reads(["hosts"]))
            .build()
            .unwrap();
        assert_eq!(sub.unresolved_reads.len(), 1);

        let pipeline = PipelineBuilder::new(ctx())
            .add_step(step("allocate").writes(["hosts"]))
            .add_sub_pipeline(sub, "configure-all")
            .build()
            .unwrap();
        assert!(pipeline.ensure_resolved().is_ok());
    }

    #[test]
    fn test_nested_parallel_sub_pipelines() {
        let shard = |n: &str| {
            PipelineBuilder::new(ctx())
                .add_step(step(&format!("{}-stop", n)))
                .add_parallel_activities(vec![step(&format!("{}-a", n)), step(&format!("{}-b", n))])
                .build()
                .unwrap()
        };

        let pipeline = PipelineBuilder::new(ctx())
            .add_parallel_sub_pipelines_with_mode(
                vec![("shard-1", shard("s1")), ("shard-2", shard("s2"))],
                ParallelMode::BestEffort,
            )
            .add_activity("finish", "noop", json!({}))
            .build()
            .unwrap();

        let NodeSpec::Sequence { children, .. } = &pipeline.root else {
            panic!("root must be a sequence");
        };
        match &children[0] {
            NodeSpec::Parallel { mode, children, .. } => {
                assert_eq!(*mode, ParallelMode::BestEffort);
                assert_eq!(children[0].name(), "shard-1");
                assert_eq!(children[1].name(), "shard-2");
            }
            other => panic!("expected parallel, got {:?}", other),
        }
        assert_eq!(pipeline.root.steps().len(), 7);
    }

    #[test]
    fn test_paused_step() {
        let pipeline = PipelineBuilder::new(ctx())
            .add_step(step("confirm").paused())
            .build()
            .unwrap();
        assert!(pipeline.root.steps()[0].start_paused);
    }
}
