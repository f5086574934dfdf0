//! Outbound affiliate notifications.
//!
//! Delivery is best-effort: callers log failures and never roll back the
//! change that triggered the notification.

use crate::domain::{Affiliate, Decimal, PromoCode};
use async_trait::async_trait;
use std::fmt;
use tracing::info;

#[async_trait]
pub trait Notifier: Send + Sync + fmt::Debug {
    /// An admin changed the affiliate's commission rate.
    async fn commission_rate_changed(
        &self,
        affiliate: &Affiliate,
        old_rate: Decimal,
        new_rate: Decimal,
    ) -> anyhow::Result<()>;

    /// The affiliate was approved and received a welcome promo code.
    async fn affiliate_activated(
        &self,
        affiliate: &Affiliate,
        promo: Option<&PromoCode>,
    ) -> anyhow::Result<()>;
}

/// Notifier that only writes structured log lines.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn commission_rate_changed(
        &self,
        affiliate: &Affiliate,
        old_rate: Decimal,
        new_rate: Decimal,
    ) -> anyhow::Result<()> {
        info!(
            affiliate_id = %affiliate.id,
            email = %affiliate.email,
            old_rate = %old_rate,
            new_rate = %new_rate,
            "Commission rate changed"
        );
        Ok(())
    }

    async fn affiliate_activated(
        &self,
        affiliate: &Affiliate,
        promo: Option<&PromoCode>,
    ) -> anyhow::Result<()> {
        info!(
            affiliate_id = %affiliate.id,
            email = %affiliate.email,
            promo_code = promo.map(|p| p.code.as_str()).unwrap_or("-"),
            "Affiliate activated"
        );
        Ok(())
    }
}
