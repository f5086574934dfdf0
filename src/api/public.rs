//! Unauthenticated endpoints: registration, login and click tracking.

use super::dto::AffiliateDto;
use super::AppState;
use crate::domain::{AffiliateStatus, ClickContext, Role};
use crate::error::AppError;
use crate::ledger::{LiveBalance, NewAccount};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: Option<String>,
    pub code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub affiliate: AffiliateDto,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickResponse {
    pub link_id: String,
    pub url: String,
}

/// Self-registration. New accounts wait for admin approval.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), AppError> {
    let affiliate = state
        .ledger
        .create_affiliate(NewAccount {
            email: req.email,
            password: req.password,
            name: req.name,
            code: req.code,
            status: AffiliateStatus::Pending,
            role: Role::User,
            commission_rate: None,
        })
        .await?;

    let token = state.tokens.issue(&affiliate);
    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            token,
            affiliate: AffiliateDto::with_live(&affiliate, LiveBalance::default()),
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let affiliate = state
        .ledger
        .verify_credentials(&req.email, &req.password)
        .await?
        .ok_or(AppError::Unauthorized)?;

    let live = state.ledger.live_balance(&affiliate.id).await?;
    let token = state.tokens.issue(&affiliate);
    Ok(Json(SessionResponse {
        token,
        affiliate: AffiliateDto::with_live(&affiliate, live),
    }))
}

pub async fn track_click(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ClickResponse>, AppError> {
    let link = state
        .ledger
        .track_click(&code, &click_context(&headers))
        .await?;
    Ok(Json(ClickResponse {
        link_id: link.id.to_string(),
        url: link.url,
    }))
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Client IP prefers the first `x-forwarded-for` hop, then `x-real-ip`.
fn click_context(headers: &HeaderMap) -> ClickContext {
    let ip = header_text(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
        .or_else(|| header_text(headers, "x-real-ip"));

    ClickContext {
        ip,
        user_agent: header_text(headers, header::USER_AGENT.as_str()),
        referrer: header_text(headers, header::REFERER.as_str()),
    }
}
