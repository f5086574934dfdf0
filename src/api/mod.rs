pub mod admin;
pub mod affiliate;
pub mod dto;
pub mod events;
pub mod health;
pub mod public;

use crate::auth::TokenSigner;
use crate::config::Config;
use crate::db::Repository;
use crate::domain::ConversionStatus;
use crate::error::AppError;
use crate::ledger::{Ledger, StatsWindow};
use axum::{
    routing::{get, patch, post},
    Router,
};
use chrono::NaiveDate;
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repository>,
    pub config: Config,
    pub ledger: Arc<Ledger>,
    pub tokens: TokenSigner,
}

impl AppState {
    pub fn new(repo: Arc<Repository>, config: Config, ledger: Arc<Ledger>) -> Self {
        let tokens = TokenSigner::new(&config.auth_secret, config.token_ttl_days);
        Self {
            repo,
            config,
            ledger,
            tokens,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/v1/events", post(events::receive_event))
        .route("/v1/affiliates/register", post(public::register))
        .route("/v1/affiliates/login", post(public::login))
        .route("/v1/links/:code/click", post(public::track_click))
        .route("/v1/me", get(affiliate::get_me))
        .route("/v1/me/settings", patch(affiliate::update_settings))
        .route(
            "/v1/me/links",
            get(affiliate::list_links).post(affiliate::create_link),
        )
        .route("/v1/me/promo-codes", get(affiliate::list_promo_codes))
        .route("/v1/me/conversions", get(affiliate::list_conversions))
        .route("/v1/me/settlements", get(affiliate::list_settlements))
        .route("/v1/me/stats", get(affiliate::get_stats))
        .route(
            "/v1/admin/affiliates",
            get(admin::list_affiliates).post(admin::create_affiliate),
        )
        .route(
            "/v1/admin/affiliates/:id",
            get(admin::get_affiliate)
                .patch(admin::update_affiliate)
                .delete(admin::delete_affiliate),
        )
        .route("/v1/admin/affiliates/:id/settle", post(admin::settle))
        .route(
            "/v1/admin/promo-codes",
            get(admin::list_promo_codes).post(admin::create_promo_code),
        )
        .route(
            "/v1/admin/promo-codes/bulk-generate",
            post(admin::bulk_generate_promo_codes),
        )
        .route("/v1/admin/promo-codes/:id", patch(admin::update_promo_code))
        .route("/v1/admin/conversions/backfill", post(admin::backfill))
        .route("/v1/admin/stats", get(admin::get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn parse_conversion_status(raw: Option<&str>) -> Result<Option<ConversionStatus>, AppError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => ConversionStatus::from_str(s).map(Some).map_err(AppError::BadRequest),
    }
}

fn parse_date(field: &str, raw: Option<&str>) -> Result<Option<NaiveDate>, AppError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| AppError::BadRequest(format!("{} must be a YYYY-MM-DD date", field))),
    }
}

fn stats_window(state: &AppState, query: &dto::StatsQuery) -> Result<StatsWindow, AppError> {
    let from = parse_date("from", query.from.as_deref())?;
    let to = parse_date("to", query.to.as_deref())?;
    Ok(state.ledger.stats_window(from, to)?)
}
