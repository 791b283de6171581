//! Persisted execution state of pipeline nodes.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{NodeSpec, Outputs, ParallelMode};
use crate::ticket::RetryPolicy;

/// Node state machine: `Ready -> Running -> Succeeded | Failed`, plus `Failed -> Ready` on retry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Ready,
    Running,
    Succeeded,
    Failed,
}

impl NodeStatus {
    pub const ALL: [NodeStatus; 4] = [
        NodeStatus::Ready,
        NodeStatus::Running,
        NodeStatus::Succeeded,
        NodeStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Ready => "ready",
            NodeStatus::Running => "running",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Succeeded | NodeStatus::Failed)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown node status: {}", s))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Activity,
    Sequence,
    Parallel,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Activity => "activity",
            NodeKind::Sequence => "sequence",
            NodeKind::Parallel => "parallel",
        }
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "activity" => Ok(NodeKind::Activity),
            "sequence" => Ok(NodeKind::Sequence),
            "parallel" => Ok(NodeKind::Parallel),
            other => Err(format!("unknown node kind: {}", other)),
        }
    }
}

/// One node instance of a running pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineNode {
    pub id: String,
    pub pipeline_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Order among siblings.
    pub position: u32,
    pub name: String,
    pub kind: NodeKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub reads: Vec<String>,
    #[serde(default)]
    pub writes: Vec<String>,
    #[serde(default)]
    pub parallel_mode: ParallelMode,

    pub status: NodeStatus,
    /// Incremented on every retry; stale callbacks carry an older version.
    pub version: u32,
    /// Held back from scheduling until resumed.
    pub paused: bool,
    /// Ready, but backing off after a mutex conflict.
    pub waiting_mutex: bool,
    pub mutex_retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_state: Option<Value>,
    #[serde(default)]
    pub outputs: Outputs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineNode {
    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Activity
    }
}

/// A pipeline instance bound to the inner flow that started it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineRun {
    /// Also the flow's correlation id.
    pub id: String,
    pub ticket_id: String,
    pub flow_id: String,
    pub name: String,
    pub root_node_id: String,
    pub retry_policy: RetryPolicy,
    /// No new nodes are scheduled once set.
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}

/// Flatten a definition tree into node rows, parents before children.
pub fn flatten(pipeline_id: &str, root: &NodeSpec) -> Vec<PipelineNode> {
    let mut nodes = Vec::new();
    flatten_into(pipeline_id, root, None, 0, &mut nodes);
    nodes
}

fn flatten_into(
    pipeline_id: &str,
    spec: &NodeSpec,
    parent_id: Option<String>,
    position: u32,
    out: &mut Vec<PipelineNode>,
) {
    let id = uuid::Uuid::new_v4().to_string();
    let mut node = PipelineNode {
        id: id.clone(),
        pipeline_id: pipeline_id.to_string(),
        parent_id,
        position,
        name: spec.name().to_string(),
        kind: NodeKind::Sequence,
        activity: None,
        params: Value::Null,
        reads: Vec::new(),
        writes: Vec::new(),
        parallel_mode: ParallelMode::FailFast,
        status: NodeStatus::Ready,
        version: 0,
        paused: false,
        waiting_mutex: false,
        mutex_retries: 0,
        poll_state: None,
        outputs: Outputs::new(),
        error: None,
        started_at: None,
        finished_at: None,
        updated_at: Utc::now(),
    };

    let children = match spec {
        NodeSpec::Activity(step) => {
            node.kind = NodeKind::Activity;
            node.activity = Some(step.activity.clone());
            node.params = step.params.clone();
            node.reads = step.reads.clone();
            node.writes = step.writes.clone();
            node.paused = step.start_paused;
            &[][..]
        }
        NodeSpec::Sequence { children, .. } => children.as_slice(),
        NodeSpec::Parallel { mode, children, .. } => {
            node.kind = NodeKind::Parallel;
            node.parallel_mode = *mode;
            children.as_slice()
        }
    };

    out.push(node);
    for (idx, child) in children.iter().enumerate() {
        flatten_into(pipeline_id, child, Some(id.clone()), idx as u32, out);
    }
}

/// In-memory view of one pipeline's nodes.
pub struct NodeTree {
    nodes: HashMap<String, PipelineNode>,
    children: HashMap<String, Vec<String>>,
    root_id: String,
}

impl NodeTree {
    pub fn new(root_id: impl Into<String>, nodes: Vec<PipelineNode>) -> Self {
        let mut by_parent: HashMap<String, Vec<(u32, String)>> = HashMap::new();
        for node in &nodes {
            if let Some(ref parent) = node.parent_id {
                by_parent
                    .entry(parent.clone())
                    .or_default()
                    .push((node.position, node.id.clone()));
            }
        }

        let children = by_parent
            .into_iter()
            .map(|(parent, mut kids)| {
                kids.sort();
                (parent, kids.into_iter().map(|(_, id)| id).collect())
            })
            .collect();

        Self {
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            children,
            root_id: root_id.into(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&PipelineNode> {
        self.nodes.get(id)
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn children(&self, id: &str) -> &[String] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Composites derive status from their children; leaves report their own.
    ///
    /// A sequence or fail-fast parallel fails as soon as a child fails. A
    /// best-effort parallel fails only once no child is ready or running.
    pub fn status(&self, id: &str) -> NodeStatus {
        let Some(node) = self.nodes.get(id) else {
            return NodeStatus::Failed;
        };
        if node.is_leaf() {
            return node.status;
        }

        let statuses: Vec<NodeStatus> = self.children(id).iter().map(|c| self.status(c)).collect();
        let any = |s: NodeStatus| statuses.iter().any(|x| *x == s);
        let all = |s: NodeStatus| statuses.iter().all(|x| *x == s);

        if all(NodeStatus::Succeeded) {
            return NodeStatus::Succeeded;
        }

        let best_effort =
            node.kind == NodeKind::Parallel && node.parallel_mode == ParallelMode::BestEffort;
        if any(NodeStatus::Failed) {
            let settled = !any(NodeStatus::Ready) && !any(NodeStatus::Running);
            if !best_effort || settled {
                return NodeStatus::Failed;
            }
            return NodeStatus::Running;
        }

        if all(NodeStatus::Ready) {
            NodeStatus::Ready
        } else {
            NodeStatus::Running
        }
    }

    pub fn root_status(&self) -> NodeStatus {
        self.status(&self.root_id)
    }

    /// Leaves that may be dispatched now.
    pub fn runnable(&self) -> Vec<&PipelineNode> {
        let mut out = Vec::new();
        self.collect_runnable(&self.root_id, &mut out);
        out
    }

    fn collect_runnable<'a>(&'a self, id: &str, out: &mut Vec<&'a PipelineNode>) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };

        match node.kind {
            NodeKind::Activity => {
                if node.status == NodeStatus::Ready && !node.paused && !node.waiting_mutex {
                    out.push(node);
                }
            }
            NodeKind::Sequence => {
                if self.status(id).is_terminal() {
                    return;
                }
                for child in self.children(id) {
                    if self.status(child) != NodeStatus::Succeeded {
                        self.collect_runnable(child, out);
                        break;
                    }
                }
            }
            NodeKind::Parallel => {
                let status = self.status(id);
                if status.is_terminal() {
                    return;
                }
                if node.parallel_mode == ParallelMode::FailFast
                    && self
                        .children(id)
                        .iter()
                        .any(|c| self.status(c) == NodeStatus::Failed)
                {
                    return;
                }
                for child in self.children(id) {
                    self.collect_runnable(child, out);
                }
            }
        }
    }

    /// Leaf ids at or below `id`.
    pub fn leaves_under(&self, id: &str) -> Vec<&PipelineNode> {
        match self.nodes.get(id) {
            Some(node) if node.is_leaf() => vec![node],
            Some(_) => self
                .children(id)
                .iter()
                .flat_map(|c| self.leaves_under(c))
                .collect(),
            None => Vec::new(),
        }
    }

    /// First failed leaf in definition order.
    pub fn first_failed_leaf(&self) -> Option<&PipelineNode> {
        self.leaves_under(&self.root_id)
            .into_iter()
            .find(|n| n.status == NodeStatus::Failed)
    }

    /// Composite nodes whose stored status differs from the derived one.
    pub fn stale_composites(&self) -> Vec<(String, NodeStatus)> {
        self.nodes
            .values()
            .filter(|n| !n.is_leaf())
            .filter_map(|n| {
                let derived = self.status(&n.id);
                (derived != n.status).then(|| (n.id.clone(), derived))
            })
            .collect()
    }

    pub fn into_nodes(self) -> Vec<PipelineNode> {
        self.nodes.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ActivityStep, PipelineBuilder, TicketContext};
    use serde_json::json;

    fn step(name: &str) -> ActivityStep {
        ActivityStep::new(name, "noop", json!({}))
    }

    fn tree_for(builder: PipelineBuilder) -> NodeTree {
        let pipeline = builder.build().unwrap();
        let nodes = flatten("p-1", &pipeline.root);
        let root = nodes[0].id.clone();
        NodeTree::new(root, nodes)
    }

    fn builder() -> PipelineBuilder {
        PipelineBuilder::new(TicketContext::new("t-1", json!({})))
    }

    fn set(tree: NodeTree, name: &str, status: NodeStatus) -> NodeTree {
        let root = tree.root_id().to_string();
        let nodes = tree
            .into_nodes()
            .into_iter()
            .map(|mut n| {
                if n.name == name {
                    n.status = status;
                }
                n
            })
            .collect();
        NodeTree::new(root, nodes)
    }

    fn names(nodes: Vec<&PipelineNode>) -> Vec<String> {
        let mut names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_flatten_preserves_shape() {
        let pipeline = builder()
            .add_step(step("a"))
            .add_parallel_activities(vec![step("b"), step("c")])
            .build()
            .unwrap();
        let nodes = flatten("p-1", &pipeline.root);

        assert_eq!(nodes.len(), 5);
        assert_eq!(nodes[0].kind, NodeKind::Sequence);
        assert!(nodes[0].parent_id.is_none());
        assert!(nodes[1..].iter().all(|n| n.parent_id.is_some()));
        assert!(nodes.iter().all(|n| n.status == NodeStatus::Ready));
    }

    #[test]
    fn test_sequence_runs_in_order() {
        let tree = tree_for(
            builder()
                .add_step(step("a"))
                .add_step(step("b"))
                .add_parallel_activities(vec![step("c"), step("d"), step("e")]),
        );
        assert_eq!(names(tree.runnable()), vec!["a"]);
        assert_eq!(tree.root_status(), NodeStatus::Ready);

        let tree = set(tree, "a", NodeStatus::Succeeded);
        assert_eq!(names(tree.runnable()), vec!["b"]);
        assert_eq!(tree.root_status(), NodeStatus::Running);

        let tree = set(tree, "b", NodeStatus::Succeeded);
        assert_eq!(names(tree.runnable()), vec!["c", "d", "e"]);

        let tree = set(tree, "c", NodeStatus::Succeeded);
        let tree = set(tree, "d", NodeStatus::Succeeded);
        assert_eq!(tree.root_status(), NodeStatus::Running);
        let tree = set(tree, "e", NodeStatus::Succeeded);
        assert_eq!(tree.root_status(), NodeStatus::Succeeded);
        assert!(tree.runnable().is_empty());
    }

    #[test]
    fn test_fail_fast_parallel_blocks_new_work() {
        let tree = tree_for(
            builder()
                .add_parallel_activities(vec![step("a"), step("b")])
                .add_step(step("after")),
        );
        let tree = set(tree, "a", NodeStatus::Failed);

        assert!(tree.runnable().is_empty());
        assert_eq!(tree.root_status(), NodeStatus::Failed);
        assert_eq!(tree.first_failed_leaf().unwrap().name, "a");
    }

    #[test]
    fn test_fail_fast_parallel_fails_while_sibling_runs() {
        let tree = tree_for(builder().add_parallel_activities(vec![step("a"), step("b")]));
        let tree = set(tree, "b", NodeStatus::Running);
        let tree = set(tree, "a", NodeStatus::Failed);

        assert_eq!(tree.root_status(), NodeStatus::Failed);
        assert!(tree.runnable().is_empty());
    }

    #[test]
    fn test_best_effort_parallel_runs_remaining_branches() {
        let tree = tree_for(
            builder()
                .add_parallel_activities_with_mode(
                    vec![step("a"), step("b")],
                    ParallelMode::BestEffort,
                )
                .add_step(step("after")),
        );
        let tree = set(tree, "a", NodeStatus::Failed);
        assert_eq!(names(tree.runnable()), vec!["b"]);
        assert_eq!(tree.root_status(), NodeStatus::Running);

        let tree = set(tree, "b", NodeStatus::Succeeded);
        assert!(tree.runnable().is_empty());
        assert_eq!(tree.root_status(), NodeStatus::Failed);
    }

    #[test]
    fn test_paused_leaf_not_runnable() {
        let tree = tree_for(builder().add_step(step("confirm").paused()).add_step(step("b")));
        assert!(tree.runnable().is_empty());
        assert_eq!(tree.root_status(), NodeStatus::Ready);
    }

    #[test]
    fn test_stale_composites() {
        let tree = tree_for(builder().add_step(step("a")));
        let tree = set(tree, "a", NodeStatus::Succeeded);
        let stale = tree.stale_composites();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].1, NodeStatus::Succeeded);
    }
}
