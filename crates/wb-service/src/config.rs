//! Service configuration

use std::time::Duration;

/// Host-level configuration; the worker runtime has its own block read
/// from the same environment.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Service name used in logs and the instance row
    pub service_name: String,
    /// Log level when RUST_LOG is not set
    pub log_level: String,
    /// Port for the health endpoint
    pub health_port: u16,
    /// Default topic for the catch-all policy
    pub default_topic: String,
    /// Shutdown grace period in seconds
    pub shutdown_grace_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: "whizbang".to_string(),
            log_level: "info".to_string(),
            health_port: 8080,
            default_topic: "whizbang".to_string(),
            shutdown_grace_secs: 5,
        }
    }
}

impl ServiceConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("WB_SERVICE_NAME").unwrap_or(defaults.service_name),
            log_level: std::env::var("WB_LOG_LEVEL").unwrap_or(defaults.log_level),
            health_port: std::env::var("WB_HEALTH_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.health_port),
            default_topic: std::env::var("WB_DEFAULT_TOPIC").unwrap_or(defaults.default_topic),
            shutdown_grace_secs: std::env::var("WB_SHUTDOWN_GRACE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.shutdown_grace_secs),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.health_port, 8080);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.shutdown_grace_secs, 5);
    }
}
