//! Ticket flow manager implementation.
//!
//! Sequences each ticket's flows:
//! - A flow is claimed PENDING -> RUNNING before its runner is called, so two
//!   callers racing on the same ticket never start the same flow twice.
//! - Pipeline root changes arrive as engine events; approval flows are
//!   re-checked on a timer; pause and resource flows move on todo resolution.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use crate::audit::{self, AuditEvent, AuditHandle};
use crate::flow::{FlowRunners, FlowState};
use crate::metrics;
use crate::pipeline::{NodeStatus, PipelineEngine, PipelineEvent, PipelineEventKind};
use crate::registry::TicketTypeRegistry;
use crate::ticket::{Flow, FlowPatch, FlowType, Ticket, TicketFilter, TicketStatus, TicketStore};
use crate::todo::TodoStore;

use super::config::ManagerConfig;
use super::locks::FlowLocks;
use super::types::{ManagerError, ManagerStatus};

/// Drives tickets through their flows.
#[derive(Clone)]
pub struct TicketFlowManager {
    pub(super) config: ManagerConfig,
    pub(super) tickets: Arc<dyn TicketStore>,
    pub(super) todos: Arc<dyn TodoStore>,
    pub(super) engine: PipelineEngine,
    pub(super) registry: Arc<TicketTypeRegistry>,
    pub(super) runners: Arc<FlowRunners>,
    pub(super) audit: Option<AuditHandle>,
    /// Held while a flow is reopened for retry and while it is re-derived.
    pub(super) flow_locks: Arc<FlowLocks>,

    // Runtime state
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TicketFlowManager {
    /// Create a new manager.
    pub fn new(
        config: ManagerConfig,
        tickets: Arc<dyn TicketStore>,
        todos: Arc<dyn TodoStore>,
        engine: PipelineEngine,
        registry: Arc<TicketTypeRegistry>,
        runners: FlowRunners,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            tickets,
            todos,
            engine,
            registry,
            runners: Arc::new(runners),
            audit: None,
            flow_locks: Arc::new(FlowLocks::default()),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn engine(&self) -> &PipelineEngine {
        &self.engine
    }

    pub fn registry(&self) -> &TicketTypeRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Start the engine and the manager's background tasks.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Ticket flow manager already running");
            return;
        }

        info!("Starting ticket flow manager");

        // Subscribe before the engine recovers so no root change is missed.
        self.spawn_event_listener();
        self.engine.start().await;

        self.recover().await;

        if self.config.enabled {
            self.spawn_progress_loop();
        } else {
            info!("Progress loop disabled; approval flows advance on demand");
        }

        info!("Ticket flow manager started");
    }

    /// Stop the manager and the engine.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Ticket flow manager not running");
            return;
        }

        info!("Stopping ticket flow manager");
        let _ = self.shutdown_tx.send(());
        self.engine.stop().await;
        info!("Ticket flow manager stopped");
    }

    /// Counts for the health endpoint.
    pub fn status(&self) -> ManagerStatus {
        let count = |status: TicketStatus| {
            self.tickets
                .count(&TicketFilter::new().with_status(status))
                .unwrap_or(0) as usize
        };
        let open_todos = self
            .todos
            .list(
                &crate::todo::TodoFilter::new()
                    .with_status(crate::todo::TodoStatus::Todo)
                    .with_limit(10_000),
            )
            .map(|todos| todos.len())
            .unwrap_or(0);

        ManagerStatus {
            running: self.is_running(),
            engine_running: self.engine.is_running(),
            pending_count: count(TicketStatus::Pending),
            running_count: count(TicketStatus::Running),
            failed_count: count(TicketStatus::Failed),
            open_todos,
        }
    }

    // =========================================================================
    // Sequencing
    // =========================================================================

    /// Advance a ticket as far as it can go right now.
    ///
    /// Finds the first flow that has not succeeded. A PENDING flow is claimed
    /// and started; a flow that succeeds immediately moves on to the next one.
    /// A RUNNING flow makes this a no-op; a FAILED, REVOKED or TERMINATED flow
    /// is copied onto the ticket and progression halts.
    pub async fn run_next_flow(&self, ticket_id: &str) -> Result<TicketStatus, ManagerError> {
        loop {
            let ticket = self.ticket(ticket_id)?;
            if ticket.status.is_terminal() {
                return Ok(ticket.status);
            }

            let flows = self.tickets.list_flows(ticket_id)?;
            let Some(flow) = flows.into_iter().find(Flow::is_unfinished) else {
                self.set_ticket_status(&ticket, TicketStatus::Succeeded, None)
                    .await?;
                return Ok(TicketStatus::Succeeded);
            };

            match flow.status {
                TicketStatus::Running => {
                    if ticket.status == TicketStatus::Pending {
                        self.set_ticket_status(&ticket, TicketStatus::Running, None)
                            .await?;
                    }
                    return Ok(TicketStatus::Running);
                }
                TicketStatus::Pending => {
                    let Some(claimed) = self.tickets.transition_flow(
                        &flow.id,
                        &[TicketStatus::Pending],
                        TicketStatus::Running,
                        FlowPatch::new().with_message(None),
                    )?
                    else {
                        debug!("Flow {} claimed by another caller", flow.id);
                        continue;
                    };
                    self.flow_changed(&flow, &claimed).await;
                    if ticket.status == TicketStatus::Pending {
                        self.set_ticket_status(&ticket, TicketStatus::Running, None)
                            .await?;
                    }

                    let state = self.start_flow(&ticket, &claimed).await;
                    match self.settle_flow(&ticket, &claimed, state).await? {
                        Some(settled) if settled.status == TicketStatus::Running => {
                            return Ok(TicketStatus::Running);
                        }
                        // Succeeded moves on; a negative status is copied onto
                        // the ticket by the next pass.
                        _ => continue,
                    }
                }
                status => {
                    // Failed, revoked or terminated: halt.
                    self.set_ticket_status(&ticket, status, flow.message.clone())
                        .await?;
                    return Ok(status);
                }
            }
        }
    }

    /// Run `run_next_flow` in the background.
    pub(super) fn spawn_advance(&self, ticket_id: String) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.run_next_flow(&ticket_id).await {
                warn!("Failed to advance ticket {}: {}", ticket_id, e);
            }
        });
    }

    /// Call the flow's runner, retrying retryable external failures.
    async fn start_flow(&self, ticket: &Ticket, flow: &Flow) -> FlowState {
        let runner = match self.runners.get(flow.flow_type) {
            Ok(runner) => runner,
            Err(e) => return FlowState::failed(e.to_string()),
        };

        let mut attempt = 0;
        loop {
            match runner.run(ticket, flow).await {
                Ok(state) => return state,
                Err(e) if e.is_retryable() && attempt < self.config.external_retry_limit => {
                    attempt += 1;
                    warn!(
                        "Flow {} ({}) of ticket {} failed to start, retry {}/{}: {}",
                        flow.id,
                        flow.flow_type,
                        ticket.id,
                        attempt,
                        self.config.external_retry_limit,
                        e
                    );
                    let updated = self.tickets.transition_flow(
                        &flow.id,
                        &[TicketStatus::Running],
                        TicketStatus::Running,
                        FlowPatch::new()
                            .with_retry_count(attempt)
                            .with_message(Some(format!("retrying: {}", e))),
                    );
                    match updated {
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            // Terminated while retrying.
                            return FlowState::failed(format!("abandoned after: {}", e));
                        }
                        Err(db) => warn!("Failed to record retry of flow {}: {}", flow.id, db),
                    }
                    tokio::time::sleep(Duration::from_millis(
                        self.config.external_retry_backoff_ms,
                    ))
                    .await;
                }
                Err(e) if e.is_retryable() => {
                    return FlowState::failed(format!("{} (after {} retries)", e, attempt));
                }
                Err(e) => return FlowState::failed(e.to_string()),
            }
        }
    }

    /// Record a runner's answer on a RUNNING flow.
    ///
    /// Returns `None` if the flow was no longer RUNNING (terminated, or settled
    /// by a concurrent caller).
    pub(super) async fn settle_flow(
        &self,
        ticket: &Ticket,
        flow: &Flow,
        state: FlowState,
    ) -> Result<Option<Flow>, ManagerError> {
        let mut patch = FlowPatch::new();
        if state.obj_id.is_some() || state.status == TicketStatus::Pending {
            patch = patch.with_obj_id(state.obj_id.clone());
        }
        if state.message.is_some() {
            patch = patch.with_message(state.message.clone());
        }
        if state.status != TicketStatus::Running {
            patch = patch.with_retry_count(0);
        }

        let updated = self.tickets.transition_flow(
            &flow.id,
            &[TicketStatus::Running],
            state.status,
            patch,
        )?;

        let Some(updated) = updated else {
            debug!(
                "Flow {} changed before {} could be recorded",
                flow.id, state.status
            );
            if let Some(todo) = &state.opened_todo {
                // Nobody will resolve a todo for a flow that moved on.
                self.todos.terminate_open(&todo.ticket_id)?;
            }
            return Ok(None);
        };

        if let Some(todo) = &state.opened_todo {
            metrics::TODOS_CREATED
                .with_label_values(&[todo.todo_type.as_str()])
                .inc();
            info!(
                "Opened {} todo {} for ticket {} (operators: {})",
                todo.todo_type,
                todo.id,
                ticket.id,
                todo.operators.join(", ")
            );
            audit::emit(
                &self.audit,
                AuditEvent::TodoCreated {
                    ticket_id: ticket.id.clone(),
                    flow_id: flow.id.clone(),
                    todo_id: todo.id.clone(),
                    todo_type: todo.todo_type.to_string(),
                    operators: todo.operators.clone(),
                },
            )
            .await;
        }

        self.flow_changed(flow, &updated).await;
        Ok(Some(updated))
    }

    /// Re-derive a RUNNING flow's status from whatever it waits on.
    pub(super) async fn refresh_flow(&self, flow: Flow) -> Result<(), ManagerError> {
        let _guard = self.flow_locks.acquire(&flow.id).await;
        // A retry may have reopened the flow while we waited.
        let mut current = self.flow(&flow.id)?;
        if current.flow_obj_id.is_none() {
            current.flow_obj_id = flow.flow_obj_id;
        }
        let mut flow = current;

        if flow.status != TicketStatus::Running || flow.flow_obj_id.is_none() {
            // Not running, or still being started.
            return Ok(());
        }

        let ticket = self.ticket(&flow.ticket_id)?;
        let runner = self.runners.get(flow.flow_type)?;

        let mut state = match runner.status(&ticket, &flow).await {
            Ok(state) => state,
            Err(e) if e.is_retryable() => {
                let retries = flow.retry_count + 1;
                if retries > self.config.external_retry_limit {
                    FlowState::failed(format!("{} (after {} retries)", e, flow.retry_count))
                } else {
                    warn!(
                        "Status check of flow {} failed, retry {}/{}: {}",
                        flow.id, retries, self.config.external_retry_limit, e
                    );
                    self.tickets.transition_flow(
                        &flow.id,
                        &[TicketStatus::Running],
                        TicketStatus::Running,
                        FlowPatch::new().with_retry_count(retries),
                    )?;
                    return Ok(());
                }
            }
            Err(e) => FlowState::failed(e.to_string()),
        };

        if state.obj_id.is_none() && state.status != TicketStatus::Pending {
            state.obj_id = flow.flow_obj_id.clone();
        }

        if state.status == TicketStatus::Running {
            if flow.retry_count > 0 {
                flow.retry_count = 0;
                self.tickets.transition_flow(
                    &flow.id,
                    &[TicketStatus::Running],
                    TicketStatus::Running,
                    FlowPatch::new().with_retry_count(0),
                )?;
            }
            return Ok(());
        }

        if self.settle_flow(&ticket, &flow, state).await?.is_some() {
            self.run_next_flow(&ticket.id).await?;
        }
        Ok(())
    }

    /// Move a non-terminal ticket to `to`.
    pub(super) async fn set_ticket_status(
        &self,
        ticket: &Ticket,
        to: TicketStatus,
        reason: Option<String>,
    ) -> Result<Option<Ticket>, ManagerError> {
        if ticket.status == to {
            return Ok(Some(ticket.clone()));
        }
        let updated = self.tickets.transition(
            &ticket.id,
            &[TicketStatus::Pending, TicketStatus::Running],
            to,
        )?;
        if let Some(updated) = &updated {
            self.ticket_changed(ticket.status, updated, reason).await;
        }
        Ok(updated)
    }

    pub(super) async fn ticket_changed(
        &self,
        from: TicketStatus,
        ticket: &Ticket,
        reason: Option<String>,
    ) {
        info!(
            "Ticket {} {} -> {}{}",
            ticket.id,
            from,
            ticket.status,
            reason
                .as_deref()
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        );
        if ticket.status.is_terminal() {
            metrics::TICKETS_FINISHED
                .with_label_values(&[ticket.status.as_str()])
                .inc();
        }
        audit::emit(
            &self.audit,
            AuditEvent::TicketStatusChanged {
                ticket_id: ticket.id.clone(),
                from_status: from.to_string(),
                to_status: ticket.status.to_string(),
                reason,
            },
        )
        .await;
    }

    pub(super) async fn flow_changed(&self, before: &Flow, after: &Flow) {
        if before.status == after.status {
            return;
        }
        debug!(
            "Flow {} ({}) of ticket {}: {} -> {}",
            after.id, after.flow_type, after.ticket_id, before.status, after.status
        );
        metrics::FLOW_TRANSITIONS
            .with_label_values(&[after.flow_type.as_str(), after.status.as_str()])
            .inc();
        audit::emit(
            &self.audit,
            AuditEvent::FlowStatusChanged {
                ticket_id: after.ticket_id.clone(),
                flow_id: after.id.clone(),
                flow_type: after.flow_type.to_string(),
                from_status: before.status.to_string(),
                to_status: after.status.to_string(),
                message: after.message.clone(),
            },
        )
        .await;
    }

    pub(super) fn ticket(&self, ticket_id: &str) -> Result<Ticket, ManagerError> {
        self.tickets
            .get(ticket_id)?
            .ok_or_else(|| ManagerError::TicketNotFound(ticket_id.to_string()))
    }

    pub(super) fn flow(&self, flow_id: &str) -> Result<Flow, ManagerError> {
        self.tickets.get_flow(flow_id)?.ok_or_else(|| {
            ManagerError::TicketStore(crate::ticket::TicketError::NotFound(flow_id.to_string()))
        })
    }

    // =========================================================================
    // Background tasks
    // =========================================================================

    /// Follow pipeline root changes of inner flows.
    fn spawn_event_listener(&self) {
        let manager = self.clone();
        let mut events = self.engine.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            info!("Pipeline event listener started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Pipeline event listener received shutdown signal");
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(event) => manager.on_pipeline_event(event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Pipeline event listener lagged by {} events", skipped);
                            manager.refresh_running(FlowType::Inner).await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            info!("Pipeline event listener stopped");
        });
    }

    async fn on_pipeline_event(&self, event: PipelineEvent) {
        match event.kind {
            PipelineEventKind::StatusChanged(status) if status.is_terminal() => {
                // Settling can chain into later flows and external calls.
                let manager = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager.on_pipeline_finished(&event, status).await {
                        error!(
                            "Failed to settle flow {} after pipeline {}: {}",
                            event.flow_id, event.pipeline_id, e
                        );
                    }
                });
            }
            PipelineEventKind::StatusChanged(_) => {}
            PipelineEventKind::MutexWaiting { ref node_id, attempt } => {
                if let Err(e) = self.on_mutex_waiting(&event, node_id, attempt).await {
                    warn!(
                        "Failed to mark flow {} as waiting on the cluster mutex: {}",
                        event.flow_id, e
                    );
                }
            }
        }
    }

    async fn on_pipeline_finished(
        &self,
        event: &PipelineEvent,
        status: NodeStatus,
    ) -> Result<(), ManagerError> {
        let mut flow = self.flow(&event.flow_id)?;
        debug!(
            "Pipeline {} of flow {} finished: {}",
            event.pipeline_id, flow.id, status
        );
        // The event can beat the runner's own bookkeeping.
        if flow.flow_obj_id.is_none() {
            flow.flow_obj_id = Some(event.pipeline_id.clone());
        }
        if flow.flow_obj_id.as_deref() != Some(event.pipeline_id.as_str()) {
            debug!(
                "Ignoring pipeline {}: flow {} now runs {:?}",
                event.pipeline_id, flow.id, flow.flow_obj_id
            );
            return Ok(());
        }
        self.refresh_flow(flow).await
    }

    /// A node is backing off on the cluster mutex: keep its flow and ticket
    /// visibly RUNNING for every attempt.
    async fn on_mutex_waiting(
        &self,
        event: &PipelineEvent,
        node_id: &str,
        attempt: u32,
    ) -> Result<(), ManagerError> {
        let before = self.flow(&event.flow_id)?;
        let message = format!(
            "waiting for cluster mutex (node {}, attempt {})",
            node_id, attempt
        );
        let updated = self.tickets.transition_flow(
            &event.flow_id,
            &[TicketStatus::Pending, TicketStatus::Running],
            TicketStatus::Running,
            FlowPatch::new().with_message(Some(message)),
        )?;
        let Some(updated) = updated else {
            return Ok(());
        };
        self.flow_changed(&before, &updated).await;

        let ticket = self.ticket(&event.ticket_id)?;
        if ticket.status == TicketStatus::Pending {
            self.set_ticket_status(&ticket, TicketStatus::Running, None)
                .await?;
        }
        debug!(
            "Ticket {} waiting on cluster mutex (node {}, attempt {})",
            event.ticket_id, node_id, attempt
        );
        Ok(())
    }

    /// Periodically re-check running approval flows, and inner flows in case
    /// an engine event was missed.
    fn spawn_progress_loop(&self) {
        let manager = self.clone();
        let running = Arc::clone(&self.running);
        let interval = Duration::from_millis(self.config.approval_poll_interval_ms);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            info!("Progress loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Progress loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if !running.load(Ordering::Relaxed) {
                            break;
                        }
                        manager.refresh_running(FlowType::Approval).await;
                        manager.refresh_running(FlowType::Inner).await;
                    }
                }
            }
            info!("Progress loop stopped");
        });
    }

    pub(super) async fn refresh_running(&self, flow_type: FlowType) {
        let flows = match self.tickets.find_flows(flow_type, TicketStatus::Running) {
            Ok(flows) => flows,
            Err(e) => {
                warn!("Failed to list running {} flows: {}", flow_type, e);
                return;
            }
        };
        for flow in flows {
            let flow_id = flow.id.clone();
            if let Err(e) = self.refresh_flow(flow).await {
                warn!("Failed to refresh flow {}: {}", flow_id, e);
            }
        }
    }

    /// Pick up work left behind by a restart.
    ///
    /// Flows claimed but never started go back to PENDING; tickets with
    /// pending work are advanced.
    async fn recover(&self) {
        let mut resumed = 0;
        for flow_type in [
            FlowType::Approval,
            FlowType::Pause,
            FlowType::ResourceApply,
            FlowType::Inner,
            FlowType::Delivery,
        ] {
            let flows = match self.tickets.find_flows(flow_type, TicketStatus::Running) {
                Ok(flows) => flows,
                Err(e) => {
                    error!("Failed to recover {} flows: {}", flow_type, e);
                    continue;
                }
            };
            for flow in flows.into_iter().filter(|f| f.flow_obj_id.is_none()) {
                match self.tickets.transition_flow(
                    &flow.id,
                    &[TicketStatus::Running],
                    TicketStatus::Pending,
                    FlowPatch::new().with_message(Some("restarted".to_string())),
                ) {
                    Ok(Some(_)) => {
                        info!("Restarting interrupted flow {} of ticket {}", flow.id, flow.ticket_id);
                        self.spawn_advance(flow.ticket_id);
                        resumed += 1;
                    }
                    Ok(None) => {}
                    Err(e) => error!("Failed to reset flow {}: {}", flow.id, e),
                }
            }
        }

        match self
            .tickets
            .list(&TicketFilter::new().with_status(TicketStatus::Pending))
        {
            Ok(tickets) => {
                for ticket in tickets {
                    self.spawn_advance(ticket.id);
                    resumed += 1;
                }
            }
            Err(e) => error!("Failed to recover pending tickets: {}", e),
        }

        if resumed > 0 {
            info!("Recovered {} tickets", resumed);
        }
    }
}
