//! HTTP surface: gateway webhooks and health

pub mod health;
pub mod webhooks;

use axum::{
    http::Request,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::services::webhook_processor::WebhookProcessor;
use health::HealthChecker;
use webhooks::WebhookState;

/// Generates a v4 UUID for requests that arrive without `x-request-id`
#[derive(Clone, Copy, Default)]
pub struct UuidRequestId;

impl MakeRequestId for UuidRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        Uuid::new_v4().to_string().parse().ok().map(RequestId::new)
    }
}

pub fn router(processor: Arc<WebhookProcessor>, health_checker: HealthChecker) -> Router {
    let webhook_routes = Router::new()
        .route("/webhooks/gateway", post(webhooks::handle_webhook))
        .with_state(Arc::new(WebhookState { processor }));

    let health_routes = Router::new()
        .route("/health", get(health::health))
        .with_state(Arc::new(health_checker));

    Router::new()
        .merge(webhook_routes)
        .merge(health_routes)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}
