//! Endpoints for the signed-in affiliate. Every one is scoped to the caller.

use super::dto::{
    AffiliateDto, ConversionDto, ConversionsQuery, ConversionsResponse, LinkDto, SettlementDto,
    StatsQuery,
};
use super::{parse_conversion_status, stats_window, AppState};
use crate::auth::AuthAffiliate;
use crate::db::ConversionFilter;
use crate::domain::{AffiliateSettings, PromoCode, SettingsPatch};
use crate::error::AppError;
use crate::ledger::Stats;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct CreateLinkRequest {
    pub code: Option<String>,
    pub url: Option<String>,
}

/// Profile with live balances.
pub async fn get_me(
    State(state): State<AppState>,
    AuthAffiliate(me): AuthAffiliate,
) -> Result<Json<AffiliateDto>, AppError> {
    let live = state.ledger.live_balance(&me.id).await?;
    Ok(Json(AffiliateDto::with_live(&me, live)))
}

pub async fn update_settings(
    State(state): State<AppState>,
    AuthAffiliate(me): AuthAffiliate,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<AffiliateSettings>, AppError> {
    let settings = state.ledger.update_settings(&me.id, patch).await?;
    Ok(Json(settings))
}

pub async fn list_links(
    State(state): State<AppState>,
    AuthAffiliate(me): AuthAffiliate,
) -> Result<Json<Vec<LinkDto>>, AppError> {
    let links = state.ledger.list_links(&me.id).await?;
    Ok(Json(links.iter().map(LinkDto::from).collect()))
}

pub async fn create_link(
    State(state): State<AppState>,
    AuthAffiliate(me): AuthAffiliate,
    Json(req): Json<CreateLinkRequest>,
) -> Result<(StatusCode, Json<LinkDto>), AppError> {
    let link = state
        .ledger
        .create_link(&me.id, req.code.as_deref(), req.url.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(LinkDto::from(&link))))
}

pub async fn list_promo_codes(
    State(state): State<AppState>,
    AuthAffiliate(me): AuthAffiliate,
) -> Result<Json<Vec<PromoCode>>, AppError> {
    Ok(Json(state.ledger.list_promo_codes(Some(&me.id)).await?))
}

pub async fn list_conversions(
    State(state): State<AppState>,
    AuthAffiliate(me): AuthAffiliate,
    Query(query): Query<ConversionsQuery>,
) -> Result<Json<ConversionsResponse>, AppError> {
    let filter = ConversionFilter {
        status: parse_conversion_status(query.status.as_deref())?,
        ..ConversionFilter::for_affiliate(&me.id)
    };
    let (limit, offset) = query.page();

    let conversions = state.repo.list_conversions(&filter, limit, offset).await?;
    let total = state.repo.count_conversions(&filter).await?;

    Ok(Json(ConversionsResponse {
        conversions: conversions.iter().map(ConversionDto::from).collect(),
        total,
        limit,
        offset,
    }))
}

pub async fn list_settlements(
    State(state): State<AppState>,
    AuthAffiliate(me): AuthAffiliate,
) -> Result<Json<Vec<SettlementDto>>, AppError> {
    let settlements = state.repo.list_settlements(Some(&me.id)).await?;
    Ok(Json(settlements.iter().map(SettlementDto::from).collect()))
}

pub async fn get_stats(
    State(state): State<AppState>,
    AuthAffiliate(me): AuthAffiliate,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Stats>, AppError> {
    let window = stats_window(&state, &query)?;
    Ok(Json(state.ledger.compute_stats(Some(&me.id), window).await?))
}
