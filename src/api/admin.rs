//! Admin endpoints. Every handler takes `AdminAffiliate`, which re-reads the
//! caller and requires the admin role.

use super::dto::{AffiliateDto, SettlementDto, StatsQuery};
use super::{stats_window, AppState};
use crate::auth::AdminAffiliate;
use crate::domain::{AffiliateId, AffiliateStatus, Decimal, PromoCode, PromoCodeUpdate, Role};
use crate::error::AppError;
use crate::ledger::{
    AffiliateUpdate, BackfillReport, BulkGenerateReport, CreatePromoCode, GlobalStats, LiveBalance,
    NewAccount,
};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Deserialize)]
pub struct AffiliatesQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAffiliateRequest {
    pub email: String,
    pub password: String,
    pub name: Option<String>,
    pub code: Option<String>,
    pub commission_rate: Option<Decimal>,
    pub role: Option<Role>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SettleRequest {
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoCodesQuery {
    pub affiliate_id: Option<String>,
}

pub async fn list_affiliates(
    State(state): State<AppState>,
    AdminAffiliate(_admin): AdminAffiliate,
    Query(query): Query<AffiliatesQuery>,
) -> Result<Json<Vec<AffiliateDto>>, AppError> {
    let status = match query.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(s) => Some(AffiliateStatus::from_str(s).map_err(AppError::BadRequest)?),
    };
    let affiliates = state.repo.list_affiliates(status).await?;
    let balances = state.ledger.all_live_balances().await?;
    Ok(Json(
        affiliates
            .iter()
            .map(|a| {
                let live = balances.get(&a.id).copied().unwrap_or_default();
                AffiliateDto::with_live(a, live)
            })
            .collect(),
    ))
}

/// Admin-created accounts skip review and start active.
pub async fn create_affiliate(
    State(state): State<AppState>,
    AdminAffiliate(_admin): AdminAffiliate,
    Json(req): Json<CreateAffiliateRequest>,
) -> Result<(StatusCode, Json<AffiliateDto>), AppError> {
    let affiliate = state
        .ledger
        .create_affiliate(NewAccount {
            email: req.email,
            password: req.password,
            name: req.name,
            code: req.code,
            status: AffiliateStatus::Active,
            role: req.role.unwrap_or(Role::User),
            commission_rate: req.commission_rate,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(AffiliateDto::with_live(&affiliate, LiveBalance::default())),
    ))
}

pub async fn get_affiliate(
    State(state): State<AppState>,
    AdminAffiliate(_admin): AdminAffiliate,
    Path(id): Path<String>,
) -> Result<Json<AffiliateDto>, AppError> {
    let id = AffiliateId::new(id);
    let affiliate = state.ledger.get_affiliate(&id).await?;
    let live = state.ledger.live_balance(&id).await?;
    Ok(Json(AffiliateDto::with_live(&affiliate, live)))
}

pub async fn update_affiliate(
    State(state): State<AppState>,
    AdminAffiliate(_admin): AdminAffiliate,
    Path(id): Path<String>,
    Json(update): Json<AffiliateUpdate>,
) -> Result<Json<AffiliateDto>, AppError> {
    let id = AffiliateId::new(id);
    let affiliate = state.ledger.update_affiliate(&id, update).await?;
    let live = state.ledger.live_balance(&id).await?;
    Ok(Json(AffiliateDto::with_live(&affiliate, live)))
}

pub async fn delete_affiliate(
    State(state): State<AppState>,
    AdminAffiliate(_admin): AdminAffiliate,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.ledger.delete_affiliate(&AffiliateId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn settle(
    State(state): State<AppState>,
    AdminAffiliate(admin): AdminAffiliate,
    Path(id): Path<String>,
    body: Option<Json<SettleRequest>>,
) -> Result<(StatusCode, Json<SettlementDto>), AppError> {
    let note = body.and_then(|Json(req)| req.note);
    let settlement = state
        .ledger
        .settle(&AffiliateId::new(id), &admin.id, note)
        .await?;
    Ok((StatusCode::CREATED, Json(SettlementDto::from(&settlement))))
}

pub async fn list_promo_codes(
    State(state): State<AppState>,
    AdminAffiliate(_admin): AdminAffiliate,
    Query(query): Query<PromoCodesQuery>,
) -> Result<Json<Vec<PromoCode>>, AppError> {
    let affiliate_id = query
        .affiliate_id
        .filter(|s| !s.trim().is_empty())
        .map(AffiliateId::new);
    Ok(Json(
        state.ledger.list_promo_codes(affiliate_id.as_ref()).await?,
    ))
}

pub async fn create_promo_code(
    State(state): State<AppState>,
    AdminAffiliate(_admin): AdminAffiliate,
    Json(req): Json<CreatePromoCode>,
) -> Result<(StatusCode, Json<PromoCode>), AppError> {
    let promo = state.ledger.create_promo_code(req).await?;
    Ok((StatusCode::CREATED, Json(promo)))
}

pub async fn update_promo_code(
    State(state): State<AppState>,
    AdminAffiliate(_admin): AdminAffiliate,
    Path(id): Path<String>,
    Json(update): Json<PromoCodeUpdate>,
) -> Result<Json<PromoCode>, AppError> {
    Ok(Json(state.ledger.update_promo_code(&id, update).await?))
}

pub async fn bulk_generate_promo_codes(
    State(state): State<AppState>,
    AdminAffiliate(_admin): AdminAffiliate,
) -> Result<Json<BulkGenerateReport>, AppError> {
    Ok(Json(state.ledger.bulk_generate_promo_codes().await?))
}

pub async fn backfill(
    State(state): State<AppState>,
    AdminAffiliate(_admin): AdminAffiliate,
) -> Result<Json<BackfillReport>, AppError> {
    Ok(Json(state.ledger.backfill().await?))
}

pub async fn get_stats(
    State(state): State<AppState>,
    AdminAffiliate(_admin): AdminAffiliate,
    Query(query): Query<StatsQuery>,
) -> Result<Json<GlobalStats>, AppError> {
    let window = stats_window(&state, &query)?;
    Ok(Json(state.ledger.global_stats(window).await?))
}
