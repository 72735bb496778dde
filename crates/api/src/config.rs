//! Application configuration

use std::env;

/// Default per-request budget for processor work
pub const DEFAULT_PROCESSOR_DEADLINE_SECS: u64 = 20;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub public_url: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Authentication
    pub jwt_secret: String,

    // Billing
    pub processor_deadline_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            public_url: env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),

            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),

            jwt_secret: {
                let secret =
                    env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },

            processor_deadline_secs: env::var("PROCESSOR_DEADLINE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_PROCESSOR_DEADLINE_SECS),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const STRONG_SECRET: &str = "test-jwt-secret-must-be-at-least-32-characters-long";

    fn setup_minimal_config() {
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var("JWT_SECRET", STRONG_SECRET);
        env::remove_var("PROCESSOR_DEADLINE_SECS");
    }

    fn cleanup_config() {
        env::remove_var("DATABASE_URL");
        env::remove_var("JWT_SECRET");
        env::remove_var("PROCESSOR_DEADLINE_SECS");
    }

    #[test]
    #[serial]
    fn test_minimal_config_uses_defaults() {
        setup_minimal_config();

        let config = Config::from_env().unwrap();
        assert_eq!(config.database_url, "postgres://test");
        assert_eq!(config.processor_deadline_secs, DEFAULT_PROCESSOR_DEADLINE_SECS);
        assert_eq!(config.database_max_connections, 20);

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_missing_database_url() {
        setup_minimal_config();
        env::remove_var("DATABASE_URL");

        match Config::from_env() {
            Err(ConfigError::Missing("DATABASE_URL")) => {}
            other => panic!("Expected Missing(DATABASE_URL), got: {:?}", other),
        }

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_short_jwt_secret_rejected() {
        setup_minimal_config();
        env::set_var("JWT_SECRET", "too-short");

        assert!(matches!(Config::from_env(), Err(ConfigError::WeakSecret(_))));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_invalid_deadline_falls_back() {
        setup_minimal_config();
        env::set_var("PROCESSOR_DEADLINE_SECS", "0");
        assert_eq!(
            Config::from_env().unwrap().processor_deadline_secs,
            DEFAULT_PROCESSOR_DEADLINE_SECS
        );

        env::set_var("PROCESSOR_DEADLINE_SECS", "5");
        assert_eq!(Config::from_env().unwrap().processor_deadline_secs, 5);

        cleanup_config();
    }
}
