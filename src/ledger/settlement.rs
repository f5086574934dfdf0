//! Settlement: paying out an affiliate's captured commission.

use super::{Ledger, LedgerError};
use crate::db::{NewSettlement, SettleOutcome, SettlementItem};
use crate::domain::{AffiliateId, Decimal, Settlement, SettlementMetadata, TimeMs};
use tracing::{info, warn};

impl Ledger {
    /// Settle everything in the affiliate's captured bucket.
    ///
    /// The settlement and the conversion status changes commit together, or
    /// not at all. Refused when the live order state cannot be fetched.
    pub async fn settle(
        &self,
        affiliate_id: &AffiliateId,
        settled_by: &AffiliateId,
        note: Option<String>,
    ) -> Result<Settlement, LedgerError> {
        if self.repo.get_affiliate(affiliate_id).await?.is_none() {
            return Err(LedgerError::NotFound(format!("affiliate {}", affiliate_id)));
        }

        let buckets = self.settlable_buckets(affiliate_id).await?;
        let contributing = buckets.captured;
        let amount: Decimal = contributing.iter().map(|c| c.commission).sum();
        if !amount.is_positive() {
            info!(affiliate_id = %affiliate_id, "Nothing to settle");
            return Err(LedgerError::NothingToSettle);
        }

        let items: Vec<SettlementItem> = contributing
            .iter()
            .map(|c| SettlementItem {
                conversion_id: c.id.clone(),
                expected: c.status,
            })
            .collect();
        let period_start = contributing.iter().map(|c| c.created_at).min();
        let period_end = contributing.iter().map(|c| c.created_at).max();

        let new = NewSettlement {
            affiliate_id: affiliate_id.clone(),
            amount,
            currency: self.config.settlement_currency.clone(),
            period_start,
            period_end,
            metadata: SettlementMetadata {
                settled_by: Some(settled_by.to_string()),
                settled_at: Some(TimeMs::now()),
                conversion_ids: items.iter().map(|i| i.conversion_id.clone()).collect(),
                note,
            },
        };

        match self.repo.settle_conversions(&new, &items).await? {
            SettleOutcome::Settled {
                settlement,
                projection,
            } => {
                info!(
                    affiliate_id = %affiliate_id,
                    settlement_id = %settlement.id,
                    amount = %settlement.amount,
                    currency = %settlement.currency,
                    conversions = items.len(),
                    balance = %projection.balance,
                    "Settlement created"
                );
                Ok(settlement)
            }
            SettleOutcome::Conflict(conversion_id) => {
                warn!(
                    affiliate_id = %affiliate_id,
                    conversion_id = %conversion_id,
                    "Settlement lost a race, rolled back"
                );
                Err(LedgerError::Conflict(format!(
                    "conversion {} changed during settlement",
                    conversion_id
                )))
            }
            SettleOutcome::MissingAffiliate => {
                Err(LedgerError::NotFound(format!("affiliate {}", affiliate_id)))
            }
        }
    }
}
