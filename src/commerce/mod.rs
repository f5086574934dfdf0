//! Commerce platform abstraction for reading orders and managing promotions.

use crate::domain::{
    AffiliateId, NewPromoCode, OrderId, OrderSnapshot, OrderState, PromoCode, PromoCodeUpdate,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

pub mod http;
pub mod mock;

pub use http::HttpCommercePlatform;
pub use mock::MockCommercePlatform;

/// The commerce platform the ledger is attached to.
///
/// Orders and payments are read-only. Promotions double as affiliate promo
/// codes and are written through [`CommercePlatform::create_promotion`] and
/// [`CommercePlatform::update_promotion`].
#[async_trait]
pub trait CommercePlatform: Send + Sync + fmt::Debug {
    /// Fetch an order with totals, metadata and applied promotions.
    ///
    /// # Returns
    /// None when the order does not exist.
    async fn get_order(&self, id: &OrderId) -> Result<Option<OrderSnapshot>, CommerceError>;

    /// Resolve a payment id to the order it pays for (payment → collection → order).
    async fn order_id_for_payment(
        &self,
        payment_id: &str,
    ) -> Result<Option<OrderId>, CommerceError>;

    /// Batch lookup of payment and cancellation state.
    ///
    /// Orders missing from the result are unknown to the platform.
    async fn order_states(
        &self,
        ids: &[OrderId],
    ) -> Result<HashMap<OrderId, OrderState>, CommerceError>;

    /// Promotions tagged with an affiliate, optionally for one affiliate only.
    async fn list_promotions(
        &self,
        affiliate_id: Option<&AffiliateId>,
    ) -> Result<Vec<PromoCode>, CommerceError>;

    async fn create_promotion(&self, new: &NewPromoCode) -> Result<PromoCode, CommerceError>;

    /// # Returns
    /// None when the promotion does not exist or is not an affiliate promotion.
    async fn update_promotion(
        &self,
        id: &str,
        update: &PromoCodeUpdate,
    ) -> Result<Option<PromoCode>, CommerceError>;

    /// Orders that carry at least one affiliate-tagged promotion.
    async fn list_promoted_orders(&self) -> Result<Vec<OrderSnapshot>, CommerceError>;
}

/// Error type for commerce platform operations.
#[derive(Debug, Clone)]
pub enum CommerceError {
    /// Network error (e.g., connection timeout, DNS failure)
    NetworkError(String),
    /// HTTP error (e.g., 429 rate limit, 5xx server error)
    HttpError { status: u16, message: String },
    /// Parsing error (invalid JSON or malformed response)
    ParseError(String),
    /// Rate limit exceeded
    RateLimited,
    Other(String),
}

impl fmt::Display for CommerceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommerceError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            CommerceError::HttpError { status, message } => {
                write!(f, "HTTP error {}: {}", status, message)
            }
            CommerceError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            CommerceError::RateLimited => write!(f, "Rate limited"),
            CommerceError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for CommerceError {}
