use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::AppError;
use crate::payments::signature::SIGNATURE_HEADER;
use crate::services::webhook_processor::{WebhookOutcome, WebhookProcessor};

pub struct WebhookState {
    pub processor: Arc<WebhookProcessor>,
}

/// POST /webhooks/gateway
///
/// The body is taken as raw bytes; the signature covers them exactly.
pub async fn handle_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if signature.is_none() {
        warn!(request_id = ?request_id, "Webhook delivered without a signature header");
    }

    match state.processor.process(&body, signature).await {
        Ok(WebhookOutcome::Processed {
            event_id,
            event_type,
        }) => {
            info!(event_id = %event_id, event_type = %event_type, "Webhook processed");
            (StatusCode::OK, Json(json!({ "received": true }))).into_response()
        }
        Ok(WebhookOutcome::Skipped { event_id }) => {
            info!(event_id = %event_id, "Duplicate webhook acknowledged");
            (
                StatusCode::OK,
                Json(json!({ "received": true, "skipped": true })),
            )
                .into_response()
        }
        Err(e) => {
            let mut error = AppError::from(e);
            if let Some(id) = request_id {
                error = error.with_request_id(id);
            }
            error.into_response()
        }
    }
}
