//! Coordinator configuration

use std::collections::BTreeMap;

use wb_domain::{InstanceId, InstanceIdentity};
use wb_ports::BatchControl;

/// Configuration for the worker runtime.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Logical service name; drives receptor association matching.
    pub service_name: String,
    /// Environment name surfaced to policies.
    pub environment: String,
    /// Cadence of the batch exchange, milliseconds.
    pub polling_interval_ms: u64,
    pub lease_seconds: u32,
    pub stale_threshold_seconds: u32,
    pub partition_count: u32,
    /// Consecutive empty polls before the idle callback fires.
    pub idle_threshold_polls: u32,
    pub batch_size: usize,
    pub max_attempts: u32,
    /// Preserve completed rows instead of deleting them.
    pub debug_mode: bool,
    /// Free-form metadata surfaced in the service-instance row.
    pub instance_metadata: BTreeMap<String, String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            service_name: "whizbang".to_string(),
            environment: "development".to_string(),
            polling_interval_ms: 1000,
            lease_seconds: 300,
            stale_threshold_seconds: 600,
            partition_count: 10_000,
            idle_threshold_polls: 2,
            batch_size: 100,
            max_attempts: 5,
            debug_mode: false,
            instance_metadata: BTreeMap::new(),
        }
    }
}

impl CoordinatorConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("WB_SERVICE_NAME").unwrap_or(defaults.service_name),
            environment: std::env::var("WB_ENVIRONMENT").unwrap_or(defaults.environment),
            polling_interval_ms: env_parse("WB_POLLING_INTERVAL_MS", defaults.polling_interval_ms),
            lease_seconds: env_parse("WB_LEASE_SECONDS", defaults.lease_seconds),
            stale_threshold_seconds: env_parse(
                "WB_STALE_THRESHOLD_SECONDS",
                defaults.stale_threshold_seconds,
            ),
            partition_count: env_parse("WB_PARTITION_COUNT", defaults.partition_count),
            idle_threshold_polls: env_parse("WB_IDLE_THRESHOLD_POLLS", defaults.idle_threshold_polls),
            batch_size: env_parse("WB_BATCH_SIZE", defaults.batch_size),
            max_attempts: env_parse("WB_MAX_ATTEMPTS", defaults.max_attempts),
            debug_mode: std::env::var("WB_DEBUG_MODE")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(false),
            instance_metadata: BTreeMap::new(),
        }
    }

    pub fn polling_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.polling_interval_ms)
    }

    /// The control block sent on every batch exchange.
    pub fn control(&self) -> BatchControl {
        BatchControl {
            partition_count: self.partition_count,
            lease_seconds: self.lease_seconds,
            stale_threshold_seconds: self.stale_threshold_seconds,
            batch_size: self.batch_size,
            max_attempts: self.max_attempts,
            debug_mode: self.debug_mode,
        }
    }

    /// Mint the identity for this process. Called once at startup; every
    /// worker in the process presents the same instance id.
    pub fn new_identity(&self) -> InstanceIdentity {
        InstanceIdentity {
            instance_id: InstanceId::new(),
            service_name: self.service_name.clone(),
            host_name: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            process_id: std::process::id(),
            metadata: self.instance_metadata.clone(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
