//! Read models of commerce-platform orders and promotions.
//!
//! The ledger never owns these records; they arrive through
//! [`crate::commerce::CommercePlatform`].

use crate::domain::{AffiliateId, Decimal, LinkId, OrderId, TimeMs};
use serde::{Deserialize, Serialize};

/// Order metadata key carrying a referral link id.
pub const META_LINK_ID: &str = "affiliate_link_id";
/// Order metadata keys carrying a referral link code.
pub const META_LINK_CODES: [&str; 2] = ["affiliate_code", "affiliate_link_code"];
/// Promotion metadata key naming the owning affiliate.
pub const META_AFFILIATE_ID: &str = "affiliate_id";
/// Promotion metadata key carrying the commission rate snapshot.
pub const META_COMMISSION_RATE: &str = "commission_rate";

/// A promotion applied to an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedPromotion {
    pub id: String,
    pub code: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AppliedPromotion {
    pub fn affiliate_id(&self) -> Option<AffiliateId> {
        self.metadata
            .get(META_AFFILIATE_ID)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(AffiliateId::new)
    }

    /// Raw rate value, if the promotion carries one.
    pub fn raw_commission_rate(&self) -> Option<&serde_json::Value> {
        self.metadata
            .get(META_COMMISSION_RATE)
            .filter(|v| !v.is_null())
    }
}

/// How an order references a referral link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkRef {
    Id(LinkId),
    Code(String),
}

/// The subset of an order the ledger needs for attribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub id: OrderId,
    pub display_id: Option<i64>,
    pub currency_code: String,
    pub total: Decimal,
    pub subtotal: Decimal,
    pub discount_total: Decimal,
    pub shipping_total: Decimal,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub promotions: Vec<AppliedPromotion>,
    pub created_at: TimeMs,
    pub canceled: bool,
    pub payment_captured: bool,
}

impl OrderSnapshot {
    /// Commissionable base for promo-code attribution: shipping and discounts excluded.
    pub fn promo_commission_base(&self) -> Decimal {
        (self.subtotal - self.discount_total) - self.shipping_total
    }

    /// Commissionable base for link attribution: the full order total.
    pub fn link_commission_base(&self) -> Decimal {
        self.total
    }

    /// Promotions that name an affiliate, in application order.
    pub fn affiliate_promotions(&self) -> impl Iterator<Item = &AppliedPromotion> {
        self.promotions
            .iter()
            .filter(|p| p.affiliate_id().is_some())
    }

    /// Referral link recorded in order metadata, id taking precedence over code.
    pub fn link_ref(&self) -> Option<LinkRef> {
        let text = |key: &str| {
            self.metadata
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        if let Some(id) = text(META_LINK_ID) {
            return Some(LinkRef::Id(LinkId::new(id)));
        }
        META_LINK_CODES
            .iter()
            .find_map(|key| text(*key))
            .map(LinkRef::Code)
    }

    pub fn state(&self) -> OrderState {
        OrderState {
            canceled: self.canceled,
            captured: self.payment_captured,
        }
    }
}

/// Payment and cancellation state of an order, used to bucket conversions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderState {
    pub canceled: bool,
    pub captured: bool,
}

/// Payment collection statuses that mean the funds are secured.
pub fn is_captured_payment_status(status: &str) -> bool {
    matches!(status, "captured" | "completed")
}

/// Parse a commission rate from promotion metadata (string or number), within [0, 1].
pub fn parse_rate(value: &serde_json::Value) -> Option<Decimal> {
    let parsed = match value {
        serde_json::Value::String(s) => Decimal::from_str_canonical(s).ok(),
        serde_json::Value::Number(n) => Decimal::from_str_canonical(&n.to_string()).ok(),
        _ => None,
    }?;
    is_valid_rate(parsed).then_some(parsed)
}

pub fn is_valid_rate(rate: Decimal) -> bool {
    !rate.is_negative() && rate <= Decimal::one()
}

/// An affiliate promo code, backed by a commerce-platform promotion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoCode {
    pub id: String,
    pub code: String,
    pub affiliate_id: AffiliateId,
    pub commission_rate: Option<Decimal>,
    pub discount_percent: Option<Decimal>,
    pub active: bool,
}

/// A promo code to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPromoCode {
    pub code: String,
    pub affiliate_id: AffiliateId,
    pub commission_rate: Option<Decimal>,
    pub discount_percent: Decimal,
}

/// Partial promo code update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoCodeUpdate {
    pub code: Option<String>,
    pub commission_rate: Option<Decimal>,
    pub discount_percent: Option<Decimal>,
    pub active: Option<bool>,
}
