//! In-memory manager stack for end-to-end tests.

use std::sync::Arc;

use crate::audit::AuditHandle;
use crate::flow::{
    ApprovalFlow, DeliveryFlow, FlowRunners, InnerFlow, PauseFlow, ResourceApplyFlow,
};
use crate::manager::{ManagerConfig, TicketFlowManager};
use crate::mutex::{ClusterMutex, MutexConfig};
use crate::pipeline::{
    Activity, ActivityRegistry, EngineConfig, PipelineEngine, SqliteContextStore,
    SqliteNodeStore,
};
use crate::registry::TicketTypeRegistry;
use crate::ticket::SqliteTicketStore;
use crate::todo::SqliteTodoStore;

use super::{MockApprovalService, MockResourceService};

/// A manager wired to in-memory SQLite stores and mock services.
pub struct TestStack {
    pub manager: TicketFlowManager,
    pub approval: Arc<MockApprovalService>,
    pub resources: Arc<MockResourceService>,
    pub tickets: Arc<SqliteTicketStore>,
    pub todos: Arc<SqliteTodoStore>,
    pub context: Arc<SqliteContextStore>,
    pub nodes: Arc<SqliteNodeStore>,
    pub mutex: Arc<ClusterMutex>,
}

impl TestStack {
    pub fn builder() -> TestStackBuilder {
        TestStackBuilder::default()
    }
}

/// Builder for [`TestStack`]; intervals default to a few milliseconds.
pub struct TestStackBuilder {
    registry: TicketTypeRegistry,
    activities: ActivityRegistry,
    manager: ManagerConfig,
    engine: EngineConfig,
    mutex: MutexConfig,
    audit: Option<AuditHandle>,
}

impl Default for TestStackBuilder {
    fn default() -> Self {
        Self {
            registry: TicketTypeRegistry::new(),
            activities: ActivityRegistry::new(),
            manager: ManagerConfig {
                enabled: true,
                approval_poll_interval_ms: 20,
                external_retry_limit: 2,
                external_retry_backoff_ms: 10,
            },
            engine: EngineConfig {
                poll_interval_ms: 20,
                ..Default::default()
            },
            mutex: MutexConfig {
                retry_backoff_ms: 50,
                max_retries: 3,
            },
            audit: None,
        }
    }
}

impl TestStackBuilder {
    pub fn registry(mut self, registry: TicketTypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn activity(mut self, activity: Arc<dyn Activity>) -> Self {
        self.activities = self.activities.register(activity);
        self
    }

    pub fn manager_config(mut self, config: ManagerConfig) -> Self {
        self.manager = config;
        self
    }

    pub fn mutex_config(mut self, config: MutexConfig) -> Self {
        self.mutex = config;
        self
    }

    /// Send engine and manager audit events to `audit`.
    pub fn audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn build(self) -> TestStack {
        let approval = Arc::new(MockApprovalService::new());
        let resources = Arc::new(MockResourceService::new());
        let tickets = Arc::new(in_memory(SqliteTicketStore::in_memory()));
        let todos = Arc::new(in_memory(SqliteTodoStore::in_memory()));
        let context = Arc::new(in_memory(SqliteContextStore::in_memory()));
        let nodes = Arc::new(in_memory(SqliteNodeStore::in_memory()));
        let mutex = Arc::new(ClusterMutex::new());
        let registry = Arc::new(self.registry);

        let mut engine = PipelineEngine::new(
            self.engine,
            self.mutex,
            self.activities,
            nodes.clone(),
            context.clone(),
            mutex.clone(),
        );
        if let Some(audit) = &self.audit {
            engine = engine.with_audit(audit.clone());
        }

        let runners = FlowRunners::new()
            .register(Arc::new(ApprovalFlow::new(approval.clone())))
            .register(Arc::new(PauseFlow::new(todos.clone())))
            .register(Arc::new(ResourceApplyFlow::new(
                resources.clone(),
                todos.clone(),
                context.clone(),
            )))
            .register(Arc::new(InnerFlow::new(
                engine.clone(),
                registry.clone(),
                context.clone(),
            )))
            .register(Arc::new(DeliveryFlow));

        let mut manager = TicketFlowManager::new(
            self.manager,
            tickets.clone(),
            todos.clone(),
            engine,
            registry,
            runners,
        );
        if let Some(audit) = self.audit {
            manager = manager.with_audit(audit);
        }

        TestStack {
            manager,
            approval,
            resources,
            tickets,
            todos,
            context,
            nodes,
            mutex,
        }
    }
}

fn in_memory<T, E: std::fmt::Display>(store: Result<T, E>) -> T {
    match store {
        Ok(store) => store,
        Err(e) => panic!("failed to open in-memory store: {}", e),
    }
}
