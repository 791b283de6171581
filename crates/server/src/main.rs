use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dbflow_core::{
    audit::{create_audit_system, AuditEvent, AuditStore, SqliteAuditStore},
    external::{
        ApprovalService, AutoApproval, HttpApprovalService, HttpJobAgent, HttpResourceService,
        JobAgent, RemoteJobActivity, ResourceService, StaticResourcePool,
    },
    flow::{ApprovalFlow, DeliveryFlow, FlowRunners, InnerFlow, PauseFlow, ResourceApplyFlow},
    load_config,
    mutex::ClusterMutex,
    pipeline::{ActivityRegistry, PipelineEngine, SqliteContextStore, SqliteNodeStore},
    ticket::SqliteTicketStore,
    todo::SqliteTodoStore,
    validate_config, Config, TicketFlowManager,
};
use dbflow_server::{api::create_router, state::AppState, ticket_types::builtin_registry};

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Buffer size for audit event channel
const AUDIT_BUFFER_SIZE: usize = 1000;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn run() -> Result<()> {
    // Determine config path
    let config_path = std::env::var("DBFLOW_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    // Load configuration before logging so the format can be chosen
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    init_logging(config.logging.json);
    info!("Loaded configuration from {:?}", config_path);

    validate_config(&config).context("Configuration validation failed")?;
    info!("Database path: {:?}", config.database.path);

    // Compute config hash for audit
    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    let config_hash_short = &config_hash[..16];

    // Stores, all in the one SQLite file
    let db_path = &config.database.path;
    let audit_store: Arc<dyn AuditStore> =
        Arc::new(SqliteAuditStore::new(db_path).context("Failed to create audit store")?);
    let tickets =
        Arc::new(SqliteTicketStore::new(db_path).context("Failed to create ticket store")?);
    let todos = Arc::new(SqliteTodoStore::new(db_path).context("Failed to create todo store")?);
    let context =
        Arc::new(SqliteContextStore::new(db_path).context("Failed to create context store")?);
    let nodes = Arc::new(SqliteNodeStore::new(db_path).context("Failed to create node store")?);
    info!("Stores initialized");

    if let Some(days) = config.database.audit_retention_days {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        match audit_store.prune_before(cutoff) {
            Ok(removed) => info!("Pruned {} audit records older than {} days", removed, days),
            Err(e) => warn!("Audit retention pass failed: {}", e),
        }
    }

    // Create audit system
    let (audit_handle, audit_writer) =
        create_audit_system(Arc::clone(&audit_store), AUDIT_BUFFER_SIZE);
    let writer_handle = tokio::spawn(audit_writer.run());

    audit_handle
        .emit(AuditEvent::ServiceStarted {
            version: VERSION.to_string(),
            config_hash: config_hash_short.to_string(),
        })
        .await;

    let (approval, resources, activities) = build_services(&config)?;

    let registry = Arc::new(builtin_registry().context("Failed to register ticket types")?);
    info!("Ticket types: {}", registry.names().join(", "));

    let engine = PipelineEngine::new(
        config.engine.clone(),
        config.mutex.clone(),
        activities,
        nodes,
        context.clone(),
        Arc::new(ClusterMutex::new()),
    )
    .with_audit(audit_handle.clone());

    let runners = FlowRunners::new()
        .register(Arc::new(ApprovalFlow::new(approval)))
        .register(Arc::new(PauseFlow::new(todos.clone())))
        .register(Arc::new(ResourceApplyFlow::new(
            resources,
            todos.clone(),
            context.clone(),
        )))
        .register(Arc::new(InnerFlow::new(
            engine.clone(),
            Arc::clone(&registry),
            context,
        )))
        .register(Arc::new(DeliveryFlow));

    let manager = TicketFlowManager::new(
        config.manager.clone(),
        tickets,
        todos,
        engine,
        registry,
        runners,
    )
    .with_audit(audit_handle.clone());

    manager.start().await;
    info!("Ticket flow manager started");

    let state = Arc::new(AppState::new(
        config.clone(),
        manager.clone(),
        Arc::clone(&audit_store),
    ));
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Stopping ticket flow manager...");
    manager.stop().await;

    info!("Server shutting down...");
    audit_handle
        .emit(AuditEvent::ServiceStopped {
            reason: "graceful_shutdown".to_string(),
        })
        .await;

    // The writer exits once every AuditHandle clone is gone.
    drop(manager);
    drop(audit_handle);

    let _ = writer_handle.await;
    info!("Audit writer stopped");

    Ok(())
}

/// External services from config, falling back to in-process ones.
fn build_services(
    config: &Config,
) -> Result<(
    Arc<dyn ApprovalService>,
    Arc<dyn ResourceService>,
    ActivityRegistry,
)> {
    let approval: Arc<dyn ApprovalService> = match &config.approval {
        Some(endpoint) => {
            info!("Using approval service at {}", endpoint.url);
            Arc::new(HttpApprovalService::new(endpoint).context("Failed to create approval client")?)
        }
        None => {
            warn!("No approval service configured, approvals are granted automatically");
            Arc::new(AutoApproval)
        }
    };

    let resources: Arc<dyn ResourceService> = match &config.resources {
        Some(resources) => match &resources.url {
            Some(url) => {
                info!("Using resource service at {}", url);
                Arc::new(
                    HttpResourceService::new(url, resources)
                        .context("Failed to create resource client")?,
                )
            }
            None => {
                info!(
                    "Using static resource pool ({} hosts)",
                    resources.static_hosts.len()
                );
                Arc::new(StaticResourcePool::new(resources.static_hosts.clone()))
            }
        },
        None => {
            warn!("No resources configured, allocations will report a shortage");
            Arc::new(StaticResourcePool::new(Vec::<String>::new()))
        }
    };

    let activities = match &config.agent {
        Some(endpoint) => {
            info!("Using job agent at {}", endpoint.url);
            let agent: Arc<dyn JobAgent> =
                Arc::new(HttpJobAgent::new(endpoint).context("Failed to create agent client")?);
            ActivityRegistry::new()
                .register(Arc::new(RemoteJobActivity::new(Arc::clone(&agent))))
                .register(Arc::new(RemoteJobActivity::read_only(agent)))
        }
        None => {
            warn!("No job agent configured, inner pipelines cannot launch");
            ActivityRegistry::new()
        }
    };

    Ok((approval, resources, activities))
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
