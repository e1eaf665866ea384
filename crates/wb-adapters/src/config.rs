//! Adapter configuration

/// PostgreSQL connection configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database URL (e.g., "postgres://wb:wb@localhost:5432/whizbang")
    pub database_url: String,
    /// Maximum pool connections
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://wb:wb@localhost:5432/whizbang".to_string(),
            max_connections: 5,
        }
    }
}

impl StoreConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://wb:wb@localhost:5432/whizbang".to_string()),
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.max_connections, 5);
        assert!(config.database_url.starts_with("postgres://"));
    }
}
