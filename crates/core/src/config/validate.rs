use super::{types::Config, ConfigError};

fn invalid(msg: &str) -> Result<(), ConfigError> {
    Err(ConfigError::ValidationError(msg.to_string()))
}

/// Reject settings that would stall or spin the engine.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return invalid("server.port cannot be 0");
    }
    if config.database.audit_retention_days == Some(0) {
        return invalid("database.audit_retention_days must be greater than 0");
    }
    if config.engine.poll_interval_ms == 0 {
        return invalid("engine.poll_interval_ms must be greater than 0");
    }
    if config.engine.max_concurrent_activities == 0 {
        return invalid("engine.max_concurrent_activities must be greater than 0");
    }
    if config.mutex.retry_backoff_ms == 0 {
        return invalid("mutex.retry_backoff_ms must be greater than 0");
    }
    if config.mutex.max_retries == 0 {
        return invalid("mutex.max_retries must be greater than 0");
    }
    if config.manager.approval_poll_interval_ms == 0 {
        return invalid("manager.approval_poll_interval_ms must be greater than 0");
    }
    if let Some(ref resources) = config.resources {
        if resources.url.is_none() && resources.static_hosts.is_empty() {
            return invalid("resources needs either url or static_hosts");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourcesConfig;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_port_zero_fails() {
        let mut config = Config::default();
        config.server.port = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_mutex_bounds() {
        let mut config = Config::default();
        config.mutex.max_retries = 0;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.mutex.retry_backoff_ms = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_zero_retention_fails() {
        let mut config = Config::default();
        config.database.audit_retention_days = Some(0);
        assert!(validate_config(&config).is_err());

        config.database.audit_retention_days = Some(30);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_empty_resources() {
        let config = Config {
            resources: Some(ResourcesConfig::default()),
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
    }
}
