use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::manager::ManagerConfig;
use crate::mutex::MutexConfig;
use crate::pipeline::EngineConfig;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub mutex: MutexConfig,
    /// External change-approval service. Absent: approvals are granted in-process.
    #[serde(default)]
    pub approval: Option<ServiceEndpointConfig>,
    /// Resource allocation service or a static pool.
    #[serde(default)]
    pub resources: Option<ResourcesConfig>,
    /// Remote execution agent for `remote_job` activities.
    #[serde(default)]
    pub agent: Option<ServiceEndpointConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

/// Database configuration. All tables live in one SQLite file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Audit records older than this are deleted at startup. Unset keeps them all.
    #[serde(default)]
    pub audit_retention_days: Option<u32>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            audit_retention_days: None,
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("dbflow.db")
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
}

/// An HTTP service this process calls.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceEndpointConfig {
    /// Base URL (e.g., "http://approval.internal:8000")
    pub url: String,
    /// Bearer token sent with every request
    #[serde(default)]
    pub token: Option<String>,
    /// Request timeout in seconds (default: 30)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u32,
}

fn default_timeout() -> u32 {
    30
}

/// Resource allocation: a remote service, or a fixed host pool managed in-process.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResourcesConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u32,
    /// Hosts handed out by the in-process pool when no URL is set.
    #[serde(default)]
    pub static_hosts: Vec<String>,
}

/// Sanitized config for API responses (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub manager: ManagerConfig,
    pub engine: EngineConfig,
    pub mutex: MutexConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<SanitizedEndpointConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<SanitizedResourcesConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<SanitizedEndpointConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedEndpointConfig {
    pub url: String,
    pub token_configured: bool,
    pub timeout_secs: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedResourcesConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub token_configured: bool,
    pub static_hosts: usize,
}

impl From<&ServiceEndpointConfig> for SanitizedEndpointConfig {
    fn from(config: &ServiceEndpointConfig) -> Self {
        Self {
            url: config.url.clone(),
            token_configured: config.token.as_deref().is_some_and(|t| !t.is_empty()),
            timeout_secs: config.timeout_secs,
        }
    }
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            database: config.database.clone(),
            logging: config.logging.clone(),
            manager: config.manager.clone(),
            engine: config.engine.clone(),
            mutex: config.mutex.clone(),
            approval: config.approval.as_ref().map(SanitizedEndpointConfig::from),
            resources: config.resources.as_ref().map(|r| SanitizedResourcesConfig {
                url: r.url.clone(),
                token_configured: r.token.as_deref().is_some_and(|t| !t.is_empty()),
                static_hosts: r.static_hosts.len(),
            }),
            agent: config.agent.as_ref().map(SanitizedEndpointConfig::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_empty_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host.to_string(), "0.0.0.0");
        assert_eq!(config.database.path.to_str().unwrap(), "dbflow.db");
        assert_eq!(config.database.audit_retention_days, None);
        assert!(!config.logging.json);
        assert_eq!(config.mutex.max_retries, 10);
        assert!(config.approval.is_none());
    }

    #[test]
    fn test_deserialize_sections() {
        let toml = r#"
[server]
host = "127.0.0.1"
port = 9000

[mutex]
retry_backoff_ms = 500
max_retries = 3

[approval]
url = "http://approval.local"
token = "secret"

[resources]
static_hosts = ["10.0.0.1", "10.0.0.2"]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.mutex.retry_backoff_ms, 500);
        assert_eq!(config.mutex.max_retries, 3);

        let approval = config.approval.as_ref().unwrap();
        assert_eq!(approval.url, "http://approval.local");
        assert_eq!(approval.timeout_secs, 30);

        let resources = config.resources.as_ref().unwrap();
        assert!(resources.url.is_none());
        assert_eq!(resources.static_hosts.len(), 2);
    }

    #[test]
    fn test_sanitized_config_hides_tokens() {
        let config = Config {
            approval: Some(ServiceEndpointConfig {
                url: "http://approval.local".to_string(),
                token: Some("secret".to_string()),
                timeout_secs: 10,
            }),
            ..Default::default()
        };

        let sanitized = SanitizedConfig::from(&config);
        let approval = sanitized.approval.as_ref().unwrap();
        assert!(approval.token_configured);
        assert_eq!(approval.timeout_secs, 10);

        let json = serde_json::to_string(&sanitized).unwrap();
        assert!(!json.contains("secret"));
        assert!(!json.contains("\"agent\""));
    }
}
