//! Health check endpoint
//! Reports database reachability and the balance-retry backlog

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, warn};

use crate::database::failed_balance_repository::{FailedBalanceStore, FailedUpdateStatus};

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(response_time_ms: Option<u128>, details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms,
            details,
        }
    }
}

#[derive(Clone)]
pub struct HealthChecker {
    /// Absent in in-memory mode
    db_pool: Option<PgPool>,
    failed_updates: Arc<dyn FailedBalanceStore>,
    backlog_threshold: i64,
}

impl HealthChecker {
    pub fn new(
        db_pool: Option<PgPool>,
        failed_updates: Arc<dyn FailedBalanceStore>,
        backlog_threshold: i64,
    ) -> Self {
        Self {
            db_pool,
            failed_updates,
            backlog_threshold,
        }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let mut checks = HashMap::new();

        if let Some(pool) = &self.db_pool {
            let start = Instant::now();
            let component = match timeout(CHECK_TIMEOUT, crate::database::health_check(pool)).await
            {
                Ok(Ok(())) => ComponentHealth::up(Some(start.elapsed().as_millis())),
                Ok(Err(e)) => {
                    error!(error = %e, "Database health check failed");
                    ComponentHealth::down(Some(e.to_string()))
                }
                Err(_) => {
                    error!("Database health check timed out");
                    ComponentHealth::down(Some("Timeout".to_string()))
                }
            };
            checks.insert("database".to_string(), component);
        }

        let start = Instant::now();
        let backlog = timeout(CHECK_TIMEOUT, self.outstanding_balance_updates()).await;
        let component = match backlog {
            Ok(Ok(count)) if count > self.backlog_threshold => {
                warn!(outstanding = count, "Balance retry backlog above threshold");
                ComponentHealth::warning(
                    Some(start.elapsed().as_millis()),
                    Some(format!("{} balance updates awaiting retry", count)),
                )
            }
            Ok(Ok(_)) => ComponentHealth::up(Some(start.elapsed().as_millis())),
            Ok(Err(e)) => ComponentHealth::down(Some(e.to_string())),
            Err(_) => ComponentHealth::down(Some("Timeout".to_string())),
        };
        checks.insert("balance_retry_queue".to_string(), component);

        HealthStatus {
            status: overall_state(&checks),
            checks,
            timestamp: chrono::Utc::now(),
        }
    }

    async fn outstanding_balance_updates(
        &self,
    ) -> Result<i64, crate::database::error::DatabaseError> {
        let pending = self
            .failed_updates
            .count_by_status(FailedUpdateStatus::Pending)
            .await?;
        let retrying = self
            .failed_updates
            .count_by_status(FailedUpdateStatus::Retrying)
            .await?;
        Ok(pending + retrying)
    }
}

fn overall_state(checks: &HashMap<String, ComponentHealth>) -> HealthState {
    if checks
        .values()
        .any(|c| c.status == ComponentState::Down)
    {
        HealthState::Unhealthy
    } else if checks
        .values()
        .any(|c| c.status == ComponentState::Warning)
    {
        HealthState::Degraded
    } else {
        HealthState::Healthy
    }
}

/// GET /health
pub async fn health(State(checker): State<Arc<HealthChecker>>) -> impl IntoResponse {
    let status = checker.check_health().await;
    let code = match status.status {
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
    };
    (code, Json(status))
}
