use crate::database::error::DatabaseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

/// Idempotency guard: one row per gateway event id that was handled successfully.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct ProcessedWebhookEvent {
    pub gateway_event_id: String,
    pub event_type: String,
    pub processed_at: DateTime<Utc>,
}

#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    async fn find(&self, gateway_event_id: &str)
        -> Result<Option<ProcessedWebhookEvent>, DatabaseError>;

    /// Insert-or-detect-duplicate. Returns `false` when the event id was
    /// already recorded.
    async fn record_processed(
        &self,
        gateway_event_id: &str,
        event_type: &str,
    ) -> Result<bool, DatabaseError>;
}

#[derive(Clone)]
pub struct PgWebhookEventRepository {
    pool: PgPool,
}

impl PgWebhookEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookEventStore for PgWebhookEventRepository {
    async fn find(
        &self,
        gateway_event_id: &str,
    ) -> Result<Option<ProcessedWebhookEvent>, DatabaseError> {
        sqlx::query_as::<_, ProcessedWebhookEvent>(
            "SELECT gateway_event_id, event_type, processed_at \
             FROM processed_webhook_events \
             WHERE gateway_event_id = $1",
        )
        .bind(gateway_event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn record_processed(
        &self,
        gateway_event_id: &str,
        event_type: &str,
    ) -> Result<bool, DatabaseError> {
        // The unique constraint decides the race, not the earlier lookup.
        let result = sqlx::query(
            "INSERT INTO processed_webhook_events (gateway_event_id, event_type, processed_at) \
             VALUES ($1, $2, NOW()) \
             ON CONFLICT (gateway_event_id) DO NOTHING",
        )
        .bind(gateway_event_id)
        .bind(event_type)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }
}
