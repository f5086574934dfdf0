//! Axum extractors for authenticated callers.

use super::{authenticate, require_admin};
use crate::api::AppState;
use crate::domain::Affiliate;
use crate::error::AppError;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

/// The signed-in affiliate, with status revalidated against the store.
#[derive(Debug, Clone)]
pub struct AuthAffiliate(pub Affiliate);

/// A signed-in affiliate holding the admin role.
#[derive(Debug, Clone)]
pub struct AdminAffiliate(pub Affiliate);

fn authorization(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

#[async_trait]
impl FromRequestParts<AppState> for AuthAffiliate {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let affiliate = authenticate(&state.repo, &state.tokens, authorization(parts)).await?;
        Ok(AuthAffiliate(affiliate))
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AdminAffiliate {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let caller = authenticate(&state.repo, &state.tokens, authorization(parts)).await?;
        let admin = require_admin(&state.repo, &caller).await?;
        Ok(AdminAffiliate(admin))
    }
}
