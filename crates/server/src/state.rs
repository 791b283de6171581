use std::sync::Arc;

use dbflow_core::{audit::AuditStore, Config, SanitizedConfig, TicketFlowManager};

/// Shared application state
pub struct AppState {
    config: Config,
    manager: TicketFlowManager,
    audit_store: Arc<dyn AuditStore>,
}

impl AppState {
    pub fn new(
        config: Config,
        manager: TicketFlowManager,
        audit_store: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            config,
            manager,
            audit_store,
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn manager(&self) -> &TicketFlowManager {
        &self.manager
    }

    pub fn audit_store(&self) -> &dyn AuditStore {
        self.audit_store.as_ref()
    }
}
