pub mod balance_repository;
pub mod contract_repository;
pub mod error;
pub mod failed_balance_repository;
pub mod ledger_repository;
pub mod memory;
pub mod payment_repository;
pub mod settlement;
pub mod webhook_repository;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{error as log_error, info, warn};

use self::error::DatabaseError;
use crate::config::DatabaseConfig;

/// Database pool configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 5,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl From<&DatabaseConfig> for PoolConfig {
    fn from(config: &DatabaseConfig) -> Self {
        let defaults = PoolConfig::default();
        Self {
            max_connections: config.max_connections,
            min_connections: config.min_connections.min(config.max_connections),
            connection_timeout: Duration::from_secs(config.connection_timeout),
            idle_timeout: config
                .idle_timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            max_lifetime: defaults.max_lifetime,
        }
    }
}

/// Opens the pool and proves it with one acquired connection.
pub async fn init_pool(database_url: &str, config: PoolConfig) -> Result<PgPool, DatabaseError> {
    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        connection_timeout_secs = config.connection_timeout.as_secs(),
        "Initializing database pool"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connection_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .connect(database_url)
        .await
        .map_err(|e| {
            log_error!(error = %e, "Failed to initialize database pool");
            DatabaseError::from_sqlx(e)
        })?;

    pool.acquire().await.map_err(|e| {
        log_error!(error = %e, "Failed to acquire test connection");
        DatabaseError::from_sqlx(e)
    })?;

    Ok(pool)
}

pub async fn init_pool_from_config(config: &DatabaseConfig) -> Result<PgPool, DatabaseError> {
    init_pool(&config.url, PoolConfig::from(config)).await
}

/// Connection pool health check
pub async fn health_check(pool: &PgPool) -> Result<(), DatabaseError> {
    sqlx::query("SELECT 1").fetch_one(pool).await.map_err(|e| {
        warn!(error = %e, "Database health check failed");
        DatabaseError::from_sqlx(e)
    })?;
    Ok(())
}

/// Applies the embedded schema for payments, ledger, balances and webhook events.
pub async fn run_migrations(pool: &PgPool) -> Result<(), DatabaseError> {
    sqlx::migrate!("./migrations").run(pool).await.map_err(|e| {
        log_error!(error = %e, "Database migration failed");
        DatabaseError::query(e.to_string())
    })?;
    info!("Database migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_config_follows_database_settings() {
        let config = DatabaseConfig {
            url: "postgres://localhost/settlement".to_string(),
            max_connections: 8,
            min_connections: 12,
            connection_timeout: 10,
            idle_timeout: None,
        };

        let pool = PoolConfig::from(&config);
        assert_eq!(pool.max_connections, 8);
        assert_eq!(pool.min_connections, 8);
        assert_eq!(pool.connection_timeout, Duration::from_secs(10));
        assert_eq!(pool.idle_timeout, PoolConfig::default().idle_timeout);
    }

    #[tokio::test]
    #[ignore] // Requires a running Postgres at DATABASE_URL
    async fn migrations_apply_cleanly() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = init_pool(&url, PoolConfig::default()).await.unwrap();
        run_migrations(&pool).await.unwrap();
        health_check(&pool).await.unwrap();
    }
}
