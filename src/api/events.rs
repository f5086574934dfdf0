//! Commerce webhook. Accepts an event and handles it in the background.

use super::AppState;
use crate::auth::constant_time_eq;
use crate::error::AppError;
use crate::ledger::{dispatch, EventEnvelope, LedgerEvent};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use tracing::{debug, warn};

pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

pub async fn receive_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(envelope): Json<EventEnvelope>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    if let Some(secret) = state.config.webhook_secret.as_deref() {
        let given = headers
            .get(WEBHOOK_SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !constant_time_eq(given.as_bytes(), secret.as_bytes()) {
            warn!(event = %envelope.event, "Webhook secret mismatch");
            return Err(AppError::Unauthorized);
        }
    }

    let name = envelope.event.clone();
    let Some(event) = LedgerEvent::from_envelope(envelope) else {
        debug!(event = %name, "Ignoring event");
        return Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "ignored" })),
        ));
    };

    dispatch(state.ledger.clone(), event);
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "accepted" })),
    ))
}
