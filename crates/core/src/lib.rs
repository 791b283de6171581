pub mod audit;
pub mod config;
pub mod external;
pub mod flow;
pub mod manager;
pub mod metrics;
pub mod mutex;
pub mod pipeline;
pub mod registry;
mod sqlite;
pub mod testing;
pub mod ticket;
pub mod todo;

pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, SanitizedConfig,
};
pub use manager::{
    ManagerConfig, ManagerError, SubmitTicketRequest, TicketFlowManager, TicketStatusView,
};
pub use registry::{FlowTemplate, TicketTypeDefinition, TicketTypeRegistry};
pub use ticket::{Flow, FlowType, RetryPolicy, Ticket, TicketStatus};
