//! Worker configuration

use std::env;

/// Every six hours, on the hour (seconds-first cron)
pub const DEFAULT_PLAN_SYNC_CRON: &str = "0 0 */6 * * *";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub plan_sync_cron: String,
}

impl WorkerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("Missing required environment variable: DATABASE_URL"))?;

        Ok(Self {
            database_url,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            plan_sync_cron: env::var("PLAN_SYNC_CRON")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_PLAN_SYNC_CRON.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn cron_defaults_to_six_hours() {
        env::set_var("DATABASE_URL", "postgres://test");
        env::remove_var("PLAN_SYNC_CRON");

        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.plan_sync_cron, DEFAULT_PLAN_SYNC_CRON);
        assert_eq!(config.database_max_connections, 5);

        env::set_var("PLAN_SYNC_CRON", "  ");
        assert_eq!(
            WorkerConfig::from_env().unwrap().plan_sync_cron,
            DEFAULT_PLAN_SYNC_CRON
        );

        env::set_var("PLAN_SYNC_CRON", "0 */15 * * * *");
        assert_eq!(WorkerConfig::from_env().unwrap().plan_sync_cron, "0 */15 * * * *");

        env::remove_var("PLAN_SYNC_CRON");
        env::remove_var("DATABASE_URL");
    }

    #[test]
    #[serial]
    fn database_url_is_required() {
        env::remove_var("DATABASE_URL");
        assert!(WorkerConfig::from_env().is_err());
    }
}
