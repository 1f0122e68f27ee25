//! Callback endpoint for the fingerprinting service
//!
//! ACRCloud calls `POST /webhooks/acrcloud?token=...` when a file changes
//! state. Deliveries are at-least-once and may arrive before the upload's
//! submission has recorded the file id; both cases are absorbed by the
//! pipeline, so every well-formed authenticated delivery answers 200.

use axum::{
    body::Bytes,
    extract::{Query, State},
    routing::post,
    Json, Router,
};
use constant_time_eq::constant_time_eq;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{ApiError, ApiResult};
use crate::services::WebhookAck;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    pub token: Option<String>,
}

fn token_matches(expected: &str, presented: &str) -> bool {
    constant_time_eq(expected.as_bytes(), presented.as_bytes())
}

/// POST /webhooks/acrcloud?token=
pub async fn acrcloud_callback(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let Some(expected) = state.webhook_token.as_deref() else {
        warn!("Callback rejected: no webhook token configured");
        return Err(ApiError::Unauthorized("Webhook token not configured".to_string()));
    };
    match query.token.as_deref() {
        Some(presented) if token_matches(expected, presented) => {}
        _ => {
            warn!("Callback rejected: bad or missing token");
            return Err(ApiError::Unauthorized("Invalid webhook token".to_string()));
        }
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Callback body is not JSON: {}", e)))?;

    match state.pipeline.handle_webhook(&payload).await {
        Ok(ack) => Ok(Json(ack)),
        Err(mcai_common::Error::InvalidInput(msg)) => Err(ApiError::BadRequest(msg)),
        Err(e) => {
            state.record_error(format!("webhook: {}", e)).await;
            Err(e.into())
        }
    }
}

pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/webhooks/acrcloud", post(acrcloud_callback))
}
