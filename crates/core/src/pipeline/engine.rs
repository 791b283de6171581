//! Pipeline execution engine.
//!
//! A single loop task consumes [`EngineTask`]s: advancing a pipeline, polling a
//! pending node, waking a node after a mutex backoff, and applying an activity's
//! outcome. Activity calls run on their own tasks (bounded by a semaphore) and
//! report back through the same queue, so node state is only ever written from
//! the loop or from explicit operator calls, always with compare-and-set guards.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use super::scheduler::Scheduler;
use super::{
    cluster_targets, Activity, ActivityContext, ActivityError, ActivityOutcome, ActivityRegistry,
    ContextStore, NodeExpect, NodeStatus, NodeStore, NodeTree, NodeUpdate, Outputs, Pipeline,
    PipelineError, PipelineNode, PipelineRun,
};
use crate::audit::{self, AuditEvent, AuditHandle};
use crate::metrics;
use crate::mutex::{ClusterMutex, MutexConfig, MutexConflict, MutexDecision};
use crate::ticket::RetryPolicy;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Delay between polls of a pending activity (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Activity calls allowed in flight at once, across all pipelines.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_activities: usize,
}

fn default_poll_interval() -> u64 {
    3000 // 3 seconds
}

fn default_max_concurrent() -> usize {
    32
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            max_concurrent_activities: default_max_concurrent(),
        }
    }
}

/// Something observers of a pipeline care about.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEventKind {
    /// The derived root status changed.
    StatusChanged(NodeStatus),
    /// A node is backing off after a mutex conflict.
    MutexWaiting { node_id: String, attempt: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineEvent {
    pub ticket_id: String,
    pub flow_id: String,
    pub pipeline_id: String,
    pub kind: PipelineEventKind,
}

enum EngineTask {
    Advance {
        pipeline_id: String,
    },
    Poll {
        node_id: String,
        version: u32,
    },
    Wake {
        node_id: String,
        version: u32,
    },
    Completed {
        node_id: String,
        version: u32,
        result: Result<ActivityOutcome, ActivityError>,
    },
}

const CANCELLED_MESSAGE: &str = "outcome discarded: pipeline cancelled";

/// Drives pipelines node by node. Cheap to clone.
#[derive(Clone)]
pub struct PipelineEngine {
    config: EngineConfig,
    mutex_config: MutexConfig,
    activities: Arc<ActivityRegistry>,
    nodes: Arc<dyn NodeStore>,
    context: Arc<dyn ContextStore>,
    mutex: Arc<ClusterMutex>,
    audit: Option<AuditHandle>,

    // Runtime state
    permits: Arc<Semaphore>,
    scheduler: Scheduler<EngineTask>,
    task_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<EngineTask>>>>,
    events: broadcast::Sender<PipelineEvent>,
    last_root: Arc<Mutex<HashMap<String, NodeStatus>>>,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl PipelineEngine {
    pub fn new(
        config: EngineConfig,
        mutex_config: MutexConfig,
        activities: ActivityRegistry,
        nodes: Arc<dyn NodeStore>,
        context: Arc<dyn ContextStore>,
        mutex: Arc<ClusterMutex>,
    ) -> Self {
        let (scheduler, task_rx) = Scheduler::new();
        let (events, _) = broadcast::channel(256);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_activities.max(1))),
            config,
            mutex_config,
            activities: Arc::new(activities),
            nodes,
            context,
            mutex,
            audit: None,
            scheduler,
            task_rx: Arc::new(Mutex::new(Some(task_rx))),
            events,
            last_root: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn activities(&self) -> &ActivityRegistry {
        &self.activities
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Clusters currently held by a mutating node.
    pub fn locked_clusters(&self) -> usize {
        self.mutex.locked_clusters()
    }

    /// Recover persisted runs, then spawn the engine loop.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Pipeline engine already running");
            return;
        }

        let task_rx = self.task_rx.lock().unwrap().take();
        let Some(mut rx) = task_rx else {
            error!("Pipeline engine task queue unavailable");
            self.running.store(false, Ordering::SeqCst);
            return;
        };

        info!("Starting pipeline engine");
        if let Err(e) = self.recover().await {
            error!("Pipeline recovery failed: {}", e);
        }

        let engine = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Pipeline engine loop shutting down");
                        break;
                    }
                    task = rx.recv() => match task {
                        Some(task) => engine.handle(task).await,
                        None => break,
                    },
                }
            }
            *engine.task_rx.lock().unwrap() = Some(rx);
        });

        info!("Pipeline engine started");
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Pipeline engine not running");
            return;
        }

        info!("Stopping pipeline engine");
        let _ = self.shutdown_tx.send(());
        tokio::time::sleep(Duration::from_millis(100)).await;
        info!("Pipeline engine stopped");
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Persist a built pipeline for an inner flow and schedule its first nodes.
    ///
    /// Returns the pipeline id, which doubles as the flow's correlation id.
    pub fn launch(
        &self,
        ticket_id: &str,
        flow_id: &str,
        pipeline: &Pipeline,
        retry_policy: RetryPolicy,
    ) -> Result<String, PipelineError> {
        pipeline.ensure_resolved()?;
        for step in pipeline.root.steps() {
            if !self.activities.contains(&step.activity) {
                return Err(PipelineError::UnknownActivity(step.activity.clone()));
            }
        }

        let pipeline_id = uuid::Uuid::new_v4().to_string();
        let nodes = super::flatten(&pipeline_id, &pipeline.root);
        let run = PipelineRun {
            id: pipeline_id.clone(),
            ticket_id: ticket_id.to_string(),
            flow_id: flow_id.to_string(),
            name: pipeline.name.clone(),
            root_node_id: nodes[0].id.clone(),
            retry_policy,
            cancelled: false,
            created_at: Utc::now(),
        };
        self.nodes.create_run(&run, &nodes)?;

        info!(
            "Launched pipeline {} ({} nodes) for ticket {}",
            pipeline_id,
            nodes.len(),
            ticket_id
        );
        self.scheduler.now(EngineTask::Advance {
            pipeline_id: pipeline_id.clone(),
        });
        Ok(pipeline_id)
    }

    /// Stop scheduling new nodes. Running nodes finish and their outcome is discarded.
    pub fn cancel(&self, pipeline_id: &str) -> Result<bool, PipelineError> {
        let cancelled = self.nodes.cancel_run(pipeline_id)?;
        self.last_root.lock().unwrap().remove(pipeline_id);
        if cancelled {
            info!("Cancelled pipeline {}", pipeline_id);
        }
        Ok(cancelled)
    }

    pub fn run(&self, pipeline_id: &str) -> Result<PipelineRun, PipelineError> {
        self.nodes
            .get_run(pipeline_id)?
            .ok_or_else(|| PipelineError::PipelineNotFound(pipeline_id.to_string()))
    }

    pub fn nodes(&self, pipeline_id: &str) -> Result<Vec<PipelineNode>, PipelineError> {
        self.nodes.list_nodes(pipeline_id)
    }

    pub fn node(&self, node_id: &str) -> Result<PipelineNode, PipelineError> {
        self.nodes
            .get_node(node_id)?
            .ok_or_else(|| PipelineError::NodeNotFound(node_id.to_string()))
    }

    /// Root status derived from the current leaves.
    pub fn root_status(&self, pipeline_id: &str) -> Result<NodeStatus, PipelineError> {
        let run = self.run(pipeline_id)?;
        Ok(self.load_tree(&run)?.root_status())
    }

    /// First failed leaf, for status reporting.
    pub fn failing_node(&self, pipeline_id: &str) -> Result<Option<PipelineNode>, PipelineError> {
        let run = self.run(pipeline_id)?;
        Ok(self.load_tree(&run)?.first_failed_leaf().cloned())
    }

    /// Move a failed node back to READY with a new version.
    ///
    /// On a composite, every failed leaf beneath it is retried; succeeded
    /// leaves are left alone. Returns the number of leaves reset.
    pub async fn retry_node(&self, node_id: &str, retried_by: &str) -> Result<usize, PipelineError> {
        let node = self.node(node_id)?;
        let run = self.run(&node.pipeline_id)?;
        if run.cancelled {
            return Err(PipelineError::InvalidState {
                node_id: node_id.to_string(),
                status: "cancelled".to_string(),
                operation: "retry".to_string(),
            });
        }

        let tree = self.load_tree(&run)?;
        let failed: Vec<PipelineNode> = tree
            .leaves_under(node_id)
            .into_iter()
            .filter(|n| n.status == NodeStatus::Failed)
            .cloned()
            .collect();
        if failed.is_empty() {
            return Err(PipelineError::InvalidState {
                node_id: node_id.to_string(),
                status: tree.status(node_id).to_string(),
                operation: "retry".to_string(),
            });
        }

        let mut reset = 0;
        for leaf in failed {
            let update = NodeUpdate {
                status: Some(NodeStatus::Ready),
                version: Some(leaf.version + 1),
                waiting_mutex: Some(false),
                mutex_retries: Some(0),
                poll_state: Some(None),
                outputs: Some(Outputs::new()),
                error: Some(None),
                started_at: Some(None),
                finished_at: Some(None),
                ..Default::default()
            };
            let expect = NodeExpect::status(NodeStatus::Failed).at_version(leaf.version);
            let Some(updated) = self.nodes.update_node(&leaf.id, &expect, update)? else {
                debug!("Node {} changed before retry, skipping", leaf.id);
                continue;
            };

            reset += 1;
            metrics::NODE_RETRIES.inc();
            info!(
                "Retrying node {} ({}) at version {}",
                updated.id, updated.name, updated.version
            );
            self.node_changed(&run, &updated, NodeStatus::Failed).await;
            audit::emit(
                &self.audit,
                AuditEvent::NodeRetried {
                    ticket_id: run.ticket_id.clone(),
                    node_id: updated.id.clone(),
                    version: updated.version,
                    retried_by: retried_by.to_string(),
                },
            )
            .await;
        }

        self.scheduler.now(EngineTask::Advance {
            pipeline_id: run.id.clone(),
        });
        Ok(reset)
    }

    /// Retry every failed leaf of a pipeline.
    pub async fn retry_failed(
        &self,
        pipeline_id: &str,
        retried_by: &str,
    ) -> Result<usize, PipelineError> {
        let run = self.run(pipeline_id)?;
        self.retry_node(&run.root_node_id, retried_by).await
    }

    /// Hold READY leaves at or below `node_id` back from scheduling.
    pub fn pause_node(&self, node_id: &str) -> Result<usize, PipelineError> {
        self.set_paused(node_id, true)
    }

    /// Release paused leaves at or below `node_id` and schedule them.
    pub fn resume_node(&self, node_id: &str) -> Result<usize, PipelineError> {
        let resumed = self.set_paused(node_id, false)?;
        let node = self.node(node_id)?;
        self.scheduler.now(EngineTask::Advance {
            pipeline_id: node.pipeline_id,
        });
        Ok(resumed)
    }

    fn set_paused(&self, node_id: &str, paused: bool) -> Result<usize, PipelineError> {
        let operation = if paused { "pause" } else { "resume" };
        let node = self.node(node_id)?;
        let run = self.run(&node.pipeline_id)?;
        let tree = self.load_tree(&run)?;

        let targets: Vec<PipelineNode> = tree
            .leaves_under(node_id)
            .into_iter()
            .filter(|n| n.status == NodeStatus::Ready && n.paused != paused)
            .cloned()
            .collect();
        if targets.is_empty() {
            return Err(PipelineError::InvalidState {
                node_id: node_id.to_string(),
                status: tree.status(node_id).to_string(),
                operation: operation.to_string(),
            });
        }

        let mut changed = 0;
        for leaf in targets {
            let update = NodeUpdate {
                paused: Some(paused),
                ..Default::default()
            };
            let expect = NodeExpect::status(NodeStatus::Ready).at_version(leaf.version);
            if self.nodes.update_node(&leaf.id, &expect, update)?.is_some() {
                info!("Node {} ({}): {}d", leaf.id, leaf.name, operation);
                changed += 1;
            }
        }
        Ok(changed)
    }

    // =========================================================================
    // Engine loop
    // =========================================================================

    async fn handle(&self, task: EngineTask) {
        let result = match task {
            EngineTask::Advance { pipeline_id } => self.advance(&pipeline_id).await,
            EngineTask::Poll { node_id, version } => self.poll(&node_id, version).await,
            EngineTask::Wake { node_id, version } => self.wake(&node_id, version),
            EngineTask::Completed {
                node_id,
                version,
                result,
            } => self.complete(&node_id, version, result).await,
        };

        if let Err(e) = result {
            error!("Pipeline engine task failed: {}", e);
        }
    }

    fn load_tree(&self, run: &PipelineRun) -> Result<NodeTree, PipelineError> {
        Ok(NodeTree::new(
            run.root_node_id.clone(),
            self.nodes.list_nodes(&run.id)?,
        ))
    }

    async fn advance(&self, pipeline_id: &str) -> Result<(), PipelineError> {
        let run = self.run(pipeline_id)?;
        if run.cancelled {
            return Ok(());
        }

        let tree = self.load_tree(&run)?;
        let mut root_changed = false;
        for (id, status) in tree.stale_composites() {
            root_changed |= id == run.root_node_id;
            self.nodes
                .update_node(&id, &NodeExpect::any(), NodeUpdate::status(status))?;
        }
        self.publish_root(&run, tree.root_status(), root_changed);

        let runnable: Vec<PipelineNode> = tree.runnable().into_iter().cloned().collect();
        for node in runnable {
            self.dispatch(&run, node).await?;
        }
        Ok(())
    }

    /// Publish the root status if it moved. Settled runs leave `last_root`;
    /// their stored root row stops later advances from repeating the event.
    fn publish_root(&self, run: &PipelineRun, status: NodeStatus, root_changed: bool) {
        let previous = {
            let mut last_root = self.last_root.lock().unwrap();
            if status.is_terminal() {
                last_root.remove(&run.id)
            } else {
                last_root.insert(run.id.clone(), status)
            }
        };
        let repeated = previous.is_none() && status.is_terminal() && !root_changed;
        if previous == Some(status) || repeated {
            return;
        }

        debug!("Pipeline {} root status: {}", run.id, status);
        self.publish(run, PipelineEventKind::StatusChanged(status));
    }

    fn publish(&self, run: &PipelineRun, kind: PipelineEventKind) {
        // No subscribers is fine; status is always re-derivable from the store.
        let _ = self.events.send(PipelineEvent {
            ticket_id: run.ticket_id.clone(),
            flow_id: run.flow_id.clone(),
            pipeline_id: run.id.clone(),
            kind,
        });
    }

    fn activity_for(&self, node: &PipelineNode) -> Option<Arc<dyn Activity>> {
        node.activity
            .as_deref()
            .and_then(|name| self.activities.get(name))
    }

    /// Clusters a node holds while running.
    fn lock_targets(&self, node: &PipelineNode) -> Vec<String> {
        match self.activity_for(node) {
            Some(activity) if activity.mutates_cluster() => cluster_targets(&node.params),
            _ => Vec::new(),
        }
    }

    async fn dispatch(&self, run: &PipelineRun, node: PipelineNode) -> Result<(), PipelineError> {
        let Some(activity) = self.activity_for(&node) else {
            let name = node.activity.clone().unwrap_or_default();
            let err = ActivityError::InvalidParams(format!("unknown activity: {}", name));
            return self.fail_ready(run, &node, err).await;
        };

        let clusters = self.lock_targets(&node);
        if !clusters.is_empty() {
            if let Err(conflict) = self.mutex.try_acquire(&run.ticket_id, &node.id, &clusters) {
                return self.on_conflict(run, &node, conflict).await;
            }
        }

        let update = NodeUpdate {
            status: Some(NodeStatus::Running),
            waiting_mutex: Some(false),
            error: Some(None),
            started_at: Some(Some(Utc::now())),
            finished_at: Some(None),
            ..Default::default()
        };
        let expect = NodeExpect::status(NodeStatus::Ready).at_version(node.version);
        let Some(running) = self.nodes.update_node(&node.id, &expect, update)? else {
            self.mutex.release(&node.id, &clusters);
            debug!("Node {} already dispatched", node.id);
            return Ok(());
        };

        info!(
            "Dispatching node {} ({}) of ticket {}",
            running.id, running.name, run.ticket_id
        );
        self.node_changed(run, &running, NodeStatus::Ready).await;

        let inputs = self.context.get_many(&run.ticket_id, &running.reads)?;
        if let Some(missing) = running.reads.iter().find(|k| !inputs.contains_key(*k)) {
            self.scheduler.now(EngineTask::Completed {
                node_id: running.id.clone(),
                version: running.version,
                result: Err(ActivityError::MissingContext(missing.clone())),
            });
            return Ok(());
        }

        let ctx = ActivityContext {
            ticket_id: run.ticket_id.clone(),
            node_id: running.id.clone(),
            node_name: running.name.clone(),
            version: running.version,
            params: running.params.clone(),
            inputs,
            poll_state: None,
        };
        self.spawn_call(activity, ctx, false);
        Ok(())
    }

    fn spawn_call(&self, activity: Arc<dyn Activity>, ctx: ActivityContext, is_poll: bool) {
        let permits = self.permits.clone();
        let scheduler = self.scheduler.clone();

        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await;
            let started = Instant::now();

            let call = async {
                if is_poll {
                    activity.poll(&ctx).await
                } else {
                    activity.execute(&ctx).await
                }
            };
            let result = AssertUnwindSafe(call)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(ActivityError::Failed(format!(
                        "activity {} panicked",
                        activity.name()
                    )))
                });

            metrics::ACTIVITY_DURATION
                .with_label_values(&[activity.name()])
                .observe(started.elapsed().as_secs_f64());

            scheduler.now(EngineTask::Completed {
                node_id: ctx.node_id,
                version: ctx.version,
                result,
            });
        });
    }

    async fn complete(
        &self,
        node_id: &str,
        version: u32,
        result: Result<ActivityOutcome, ActivityError>,
    ) -> Result<(), PipelineError> {
        let node = self.node(node_id)?;
        if node.version != version || node.status != NodeStatus::Running {
            debug!(
                "Discarding stale outcome for node {} (version {}, now {} at {})",
                node_id, version, node.status, node.version
            );
            return Ok(());
        }
        let run = self.run(&node.pipeline_id)?;

        if run.cancelled {
            self.finish(&run, &node, NodeStatus::Failed, Some(CANCELLED_MESSAGE.to_string()), None)
                .await?;
            return Ok(());
        }

        match result {
            Ok(ActivityOutcome::Succeeded { outputs }) => {
                self.write_context(&run, &node, &outputs)?;
                let mut merged = node.outputs.clone();
                merged.extend(outputs);
                self.finish(&run, &node, NodeStatus::Succeeded, None, Some(merged))
                    .await?;
            }
            Ok(ActivityOutcome::Failed { message }) => {
                self.finish(&run, &node, NodeStatus::Failed, Some(message), None)
                    .await?;
            }
            Ok(ActivityOutcome::Pending {
                poll_state,
                partial_outputs,
            }) => {
                self.write_context(&run, &node, &partial_outputs)?;
                let mut merged = node.outputs.clone();
                merged.extend(partial_outputs);
                let update = NodeUpdate {
                    poll_state: Some(Some(poll_state)),
                    outputs: Some(merged),
                    ..Default::default()
                };
                let expect = NodeExpect::status(NodeStatus::Running).at_version(version);
                if self.nodes.update_node(node_id, &expect, update)?.is_some() {
                    debug!("Node {} pending, polling again later", node_id);
                    self.scheduler.after(
                        Duration::from_millis(self.config.poll_interval_ms),
                        EngineTask::Poll {
                            node_id: node_id.to_string(),
                            version,
                        },
                    );
                }
                return Ok(());
            }
            Err(e) => {
                warn!("Node {} ({}) failed: {}", node.id, node.name, e);
                self.finish(&run, &node, NodeStatus::Failed, Some(e.to_string()), None)
                    .await?;
            }
        }

        self.scheduler.now(EngineTask::Advance {
            pipeline_id: run.id.clone(),
        });
        Ok(())
    }

    fn write_context(
        &self,
        run: &PipelineRun,
        node: &PipelineNode,
        outputs: &Outputs,
    ) -> Result<(), PipelineError> {
        for (key, value) in outputs {
            self.context.put(&run.ticket_id, key, value, &node.id)?;
        }
        Ok(())
    }

    /// Move a RUNNING leaf to a terminal status, then release its clusters.
    async fn finish(
        &self,
        run: &PipelineRun,
        node: &PipelineNode,
        status: NodeStatus,
        error: Option<String>,
        outputs: Option<Outputs>,
    ) -> Result<(), PipelineError> {
        let update = NodeUpdate {
            status: Some(status),
            poll_state: Some(None),
            outputs,
            error: Some(error),
            finished_at: Some(Some(Utc::now())),
            ..Default::default()
        };
        let expect = NodeExpect::status(NodeStatus::Running).at_version(node.version);
        let updated = self.nodes.update_node(&node.id, &expect, update)?;
        self.mutex.release(&node.id, &self.lock_targets(node));

        if let Some(updated) = updated {
            metrics::NODES_FINISHED
                .with_label_values(&[node.activity.as_deref().unwrap_or(""), status.as_str()])
                .inc();
            self.node_changed(run, &updated, NodeStatus::Running).await;
        }
        Ok(())
    }

    /// Fail a node that never started.
    async fn fail_ready(
        &self,
        run: &PipelineRun,
        node: &PipelineNode,
        err: ActivityError,
    ) -> Result<(), PipelineError> {
        let update = NodeUpdate {
            status: Some(NodeStatus::Failed),
            waiting_mutex: Some(false),
            error: Some(Some(err.to_string())),
            finished_at: Some(Some(Utc::now())),
            ..Default::default()
        };
        let expect = NodeExpect::status(NodeStatus::Ready).at_version(node.version);
        if let Some(updated) = self.nodes.update_node(&node.id, &expect, update)? {
            warn!("Node {} ({}) failed: {}", node.id, node.name, err);
            metrics::NODES_FINISHED
                .with_label_values(&[node.activity.as_deref().unwrap_or(""), "failed"])
                .inc();
            self.node_changed(run, &updated, NodeStatus::Ready).await;
            self.scheduler.now(EngineTask::Advance {
                pipeline_id: run.id.clone(),
            });
        }
        Ok(())
    }

    async fn on_conflict(
        &self,
        run: &PipelineRun,
        node: &PipelineNode,
        conflict: MutexConflict,
    ) -> Result<(), PipelineError> {
        warn!(
            "Node {} of ticket {} blocked: cluster {} held by ticket {}",
            node.id, run.ticket_id, conflict.cluster_id, conflict.held_by
        );
        metrics::MUTEX_CONFLICTS
            .with_label_values(&[run.retry_policy.as_str()])
            .inc();
        audit::emit(
            &self.audit,
            AuditEvent::MutexConflict {
                ticket_id: run.ticket_id.clone(),
                node_id: node.id.clone(),
                cluster_id: conflict.cluster_id.clone(),
                held_by: conflict.held_by.clone(),
                policy: run.retry_policy.as_str().to_string(),
                attempt: node.mutex_retries + 1,
            },
        )
        .await;

        match self.mutex_config.decide(run.retry_policy, node.mutex_retries) {
            MutexDecision::FailFast => {
                let err = ActivityError::MutexConflict {
                    cluster_id: conflict.cluster_id,
                    held_by: conflict.held_by,
                };
                self.fail_ready(run, node, err).await
            }
            MutexDecision::GiveUp { attempts } => {
                metrics::MUTEX_RETRIES_EXHAUSTED.inc();
                let err = ActivityError::MaxRetriesExceeded {
                    cluster_id: conflict.cluster_id,
                    attempts,
                };
                self.fail_ready(run, node, err).await
            }
            MutexDecision::RetryAfter { attempt, delay } => {
                let message = ActivityError::MutexConflict {
                    cluster_id: conflict.cluster_id,
                    held_by: conflict.held_by,
                }
                .to_string();
                let update = NodeUpdate {
                    waiting_mutex: Some(true),
                    mutex_retries: Some(attempt),
                    error: Some(Some(message)),
                    ..Default::default()
                };
                let expect = NodeExpect::status(NodeStatus::Ready).at_version(node.version);
                if self.nodes.update_node(&node.id, &expect, update)?.is_none() {
                    return Ok(());
                }

                info!(
                    "Node {} waiting {:?} for cluster mutex (attempt {}/{})",
                    node.id, delay, attempt, self.mutex_config.max_retries
                );
                self.scheduler.after(
                    delay,
                    EngineTask::Wake {
                        node_id: node.id.clone(),
                        version: node.version,
                    },
                );
                self.publish(
                    run,
                    PipelineEventKind::MutexWaiting {
                        node_id: node.id.clone(),
                        attempt,
                    },
                );
                Ok(())
            }
        }
    }

    fn wake(&self, node_id: &str, version: u32) -> Result<(), PipelineError> {
        let node = self.node(node_id)?;
        if node.version != version || node.status != NodeStatus::Ready || !node.waiting_mutex {
            return Ok(());
        }

        let update = NodeUpdate {
            waiting_mutex: Some(false),
            ..Default::default()
        };
        let expect = NodeExpect::status(NodeStatus::Ready).at_version(version);
        if self.nodes.update_node(node_id, &expect, update)?.is_some() {
            self.scheduler.now(EngineTask::Advance {
                pipeline_id: node.pipeline_id,
            });
        }
        Ok(())
    }

    async fn poll(&self, node_id: &str, version: u32) -> Result<(), PipelineError> {
        let node = self.node(node_id)?;
        if node.version != version || node.status != NodeStatus::Running {
            return Ok(());
        }
        let run = self.run(&node.pipeline_id)?;
        if run.cancelled {
            return self
                .finish(&run, &node, NodeStatus::Failed, Some(CANCELLED_MESSAGE.to_string()), None)
                .await;
        }

        let Some(activity) = self.activity_for(&node) else {
            let name = node.activity.clone().unwrap_or_default();
            self.finish(
                &run,
                &node,
                NodeStatus::Failed,
                Some(format!("unknown activity: {}", name)),
                None,
            )
            .await?;
            self.scheduler.now(EngineTask::Advance { pipeline_id: run.id });
            return Ok(());
        };

        let ctx = ActivityContext {
            ticket_id: run.ticket_id.clone(),
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            version: node.version,
            params: node.params.clone(),
            inputs: self.context.get_many(&run.ticket_id, &node.reads)?,
            poll_state: node.poll_state.clone(),
        };
        self.spawn_call(activity, ctx, true);
        Ok(())
    }

    async fn node_changed(&self, run: &PipelineRun, node: &PipelineNode, from: NodeStatus) {
        debug!(
            "Node {} ({}): {} -> {}",
            node.id, node.name, from, node.status
        );
        audit::emit(
            &self.audit,
            AuditEvent::NodeStatusChanged {
                ticket_id: run.ticket_id.clone(),
                node_id: node.id.clone(),
                node_name: node.name.clone(),
                from_status: from.to_string(),
                to_status: node.status.to_string(),
                version: node.version,
                error: node.error.clone(),
            },
        )
        .await;
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Rebuild in-memory state from the store after a restart.
    async fn recover(&self) -> Result<(), PipelineError> {
        let mut resumed = 0;
        for node in self.nodes.leaves_with_status(NodeStatus::Running)? {
            let Some(run) = self.nodes.get_run(&node.pipeline_id)? else {
                continue;
            };

            let clusters = self.lock_targets(&node);
            if let Err(conflict) = self.mutex.try_acquire(&run.ticket_id, &node.id, &clusters) {
                warn!(
                    "Recovered node {} overlaps cluster {} held by ticket {}",
                    node.id, conflict.cluster_id, conflict.held_by
                );
            }

            if node.poll_state.is_some() && !run.cancelled {
                self.scheduler.now(EngineTask::Poll {
                    node_id: node.id.clone(),
                    version: node.version,
                });
                resumed += 1;
            } else {
                let message = if run.cancelled {
                    CANCELLED_MESSAGE.to_string()
                } else {
                    ActivityError::Interrupted.to_string()
                };
                self.finish(&run, &node, NodeStatus::Failed, Some(message), None)
                    .await?;
            }
        }

        for node in self.nodes.leaves_with_status(NodeStatus::Ready)? {
            if node.waiting_mutex {
                self.scheduler.now(EngineTask::Wake {
                    node_id: node.id.clone(),
                    version: node.version,
                });
            }
        }

        let runs = self.nodes.active_runs()?;
        for run in &runs {
            self.scheduler.now(EngineTask::Advance {
                pipeline_id: run.id.clone(),
            });
        }

        if resumed > 0 || !runs.is_empty() {
            info!(
                "Recovered {} active pipelines ({} nodes polling)",
                runs.len(),
                resumed
            );
        }
        Ok(())
    }
}
