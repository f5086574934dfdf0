//! Order attribution: turning a placed order into a pending conversion.
//!
//! Promo-code attribution is tried first, over every affiliate-tagged
//! promotion in order. An order where none of them resolves to an affiliate
//! falls back to the referral link recorded in its metadata.
//! Every failure mode is a skip, never an error surfaced to the shop.

use super::{Ledger, LedgerError};
use crate::db::RecordOutcome;
use crate::domain::order::{is_valid_rate, parse_rate};
use crate::domain::{
    Affiliate, AffiliateStatus, AppliedPromotion, Conversion, ConversionMetadata, Decimal, LinkId,
    LinkRef, NewConversion, OrderId, OrderSnapshot, SourceType,
};
use tracing::{debug, info};

/// Why an order produced no conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    OrderNotFound,
    OrderCanceled,
    AlreadyAttributed,
    NoReferral,
    LinkNotFound,
    AffiliateNotFound,
    AffiliateInactive,
    NonPositiveBase,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::OrderNotFound => "order_not_found",
            SkipReason::OrderCanceled => "order_canceled",
            SkipReason::AlreadyAttributed => "already_attributed",
            SkipReason::NoReferral => "no_referral",
            SkipReason::LinkNotFound => "link_not_found",
            SkipReason::AffiliateNotFound => "affiliate_not_found",
            SkipReason::AffiliateInactive => "affiliate_inactive",
            SkipReason::NonPositiveBase => "non_positive_base",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributionOutcome {
    Created(Conversion),
    Skipped(SkipReason),
}

/// A resolved referral, ready to be priced.
struct Referral {
    affiliate: Affiliate,
    link_id: Option<LinkId>,
    promotion: Option<AppliedPromotion>,
}

impl Ledger {
    /// Attribute an order by id, fetching it from the commerce platform.
    pub async fn attribute_order(
        &self,
        order_id: &OrderId,
    ) -> Result<AttributionOutcome, LedgerError> {
        match self.commerce.get_order(order_id).await? {
            Some(order) => self.attribute(&order, false).await,
            None => Ok(skip(order_id, SkipReason::OrderNotFound)),
        }
    }

    /// Attribute an order snapshot. Idempotent per order id.
    pub async fn attribute(
        &self,
        order: &OrderSnapshot,
        backfilled: bool,
    ) -> Result<AttributionOutcome, LedgerError> {
        if order.canceled {
            return Ok(skip(&order.id, SkipReason::OrderCanceled));
        }
        if self
            .repo
            .find_live_conversion_for_order(&order.id)
            .await?
            .is_some()
        {
            return Ok(skip(&order.id, SkipReason::AlreadyAttributed));
        }

        let referral = match self.resolve_referral(order).await? {
            Ok(referral) => referral,
            Err(reason) => return Ok(skip(&order.id, reason)),
        };
        if referral.affiliate.status != AffiliateStatus::Active {
            return Ok(skip(&order.id, SkipReason::AffiliateInactive));
        }

        let (source_type, base) = match referral.promotion {
            Some(_) => (SourceType::PromoCode, order.promo_commission_base()),
            None => (SourceType::Link, order.link_commission_base()),
        };
        if !base.is_positive() {
            return Ok(skip(&order.id, SkipReason::NonPositiveBase));
        }

        let rate = self.resolve_rate(referral.promotion.as_ref(), &referral.affiliate);
        let commission = commission_for(base, rate);

        let new = NewConversion {
            affiliate_id: referral.affiliate.id.clone(),
            link_id: referral.link_id,
            order_id: order.id.clone(),
            order_amount: order.total,
            commission,
            source_type,
            promo_code: referral.promotion.as_ref().and_then(|p| p.code.clone()),
            metadata: ConversionMetadata {
                display_id: order.display_id,
                currency: Some(order.currency_code.clone()),
                promotion_id: referral.promotion.as_ref().map(|p| p.id.clone()),
                commission_rate: Some(rate),
                commission_base: Some(base),
                order_created_at: Some(order.created_at),
                backfilled,
                ..Default::default()
            },
        };

        match self.repo.record_conversion(&new).await? {
            RecordOutcome::Created { conversion, projection } => {
                info!(
                    order_id = %order.id,
                    affiliate_id = %conversion.affiliate_id,
                    conversion_id = %conversion.id,
                    source = conversion.source_type.as_str(),
                    base = %base,
                    rate = %rate,
                    commission = %commission,
                    balance = %projection.balance,
                    "Conversion recorded"
                );
                Ok(AttributionOutcome::Created(conversion))
            }
            RecordOutcome::Duplicate => Ok(skip(&order.id, SkipReason::AlreadyAttributed)),
            RecordOutcome::MissingAffiliate => Ok(skip(&order.id, SkipReason::AffiliateNotFound)),
        }
    }

    async fn resolve_referral(
        &self,
        order: &OrderSnapshot,
    ) -> Result<Result<Referral, SkipReason>, LedgerError> {
        // A tagged promotion whose affiliate exists is an explicit referral; it
        // is not second-guessed by the link.
        let mut tagged = false;
        for promotion in order.affiliate_promotions() {
            tagged = true;
            let Some(affiliate_id) = promotion.affiliate_id() else {
                continue;
            };
            if let Some(affiliate) = self.repo.get_affiliate(&affiliate_id).await? {
                return Ok(Ok(Referral {
                    affiliate,
                    link_id: None,
                    promotion: Some(promotion.clone()),
                }));
            }
            debug!(
                order_id = %order.id,
                promotion_id = %promotion.id,
                affiliate_id = %affiliate_id,
                "Tagged promotion has no affiliate"
            );
        }

        let link = match order.link_ref() {
            None if tagged => return Ok(Err(SkipReason::AffiliateNotFound)),
            None => return Ok(Err(SkipReason::NoReferral)),
            Some(LinkRef::Id(id)) => self.repo.get_link(&id).await?,
            Some(LinkRef::Code(code)) => {
                self.repo
                    .get_link_by_code(&code.trim().to_ascii_uppercase())
                    .await?
            }
        };
        let Some(link) = link else {
            return Ok(Err(SkipReason::LinkNotFound));
        };

        Ok(match self.repo.get_affiliate(&link.affiliate_id).await? {
            Some(affiliate) => Ok(Referral {
                affiliate,
                link_id: Some(link.id),
                promotion: None,
            }),
            None => Err(SkipReason::AffiliateNotFound),
        })
    }

    /// Promotion rate, then the affiliate's rate, then the configured default.
    fn resolve_rate(&self, promotion: Option<&AppliedPromotion>, affiliate: &Affiliate) -> Decimal {
        promotion
            .and_then(|p| p.raw_commission_rate())
            .and_then(parse_rate)
            .or_else(|| Some(affiliate.commission_rate).filter(|r| is_valid_rate(*r)))
            .unwrap_or(self.config.default_commission_rate)
    }
}

/// Commission is truncated toward zero to whole currency units.
pub fn commission_for(base: Decimal, rate: Decimal) -> Decimal {
    (base * rate).trunc()
}

fn skip(order_id: &OrderId, reason: SkipReason) -> AttributionOutcome {
    if reason == SkipReason::AlreadyAttributed {
        debug!(order_id = %order_id, reason = reason.as_str(), "Attribution skipped");
    } else {
        info!(order_id = %order_id, reason = reason.as_str(), "Attribution skipped");
    }
    AttributionOutcome::Skipped(reason)
}
