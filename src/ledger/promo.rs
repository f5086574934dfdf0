//! Affiliate promo codes, stored as promotions on the commerce platform.

use super::{Ledger, LedgerError};
use crate::domain::affiliate::{generate_code, normalize_code};
use crate::domain::order::is_valid_rate;
use crate::domain::{
    Affiliate, AffiliateId, AffiliateStatus, Decimal, NewPromoCode, PromoCode, PromoCodeUpdate,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

/// Admin request to create a promo code.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePromoCode {
    pub affiliate_id: AffiliateId,
    /// Generated when absent.
    pub code: Option<String>,
    /// Overrides the affiliate's own rate for orders using this code.
    pub commission_rate: Option<Decimal>,
    pub discount_percent: Option<Decimal>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkGenerateReport {
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Ledger {
    pub async fn list_promo_codes(
        &self,
        affiliate_id: Option<&AffiliateId>,
    ) -> Result<Vec<PromoCode>, LedgerError> {
        Ok(self.commerce.list_promotions(affiliate_id).await?)
    }

    pub async fn create_promo_code(&self, req: CreatePromoCode) -> Result<PromoCode, LedgerError> {
        let affiliate = self
            .repo
            .get_affiliate(&req.affiliate_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("affiliate {}", req.affiliate_id)))?;

        let code = match req.code.as_deref() {
            Some(raw) => normalize_code(raw)
                .ok_or_else(|| LedgerError::Invalid(format!("invalid promo code: {}", raw)))?,
            None => generate_code(),
        };
        if let Some(rate) = req.commission_rate {
            validate_rate(rate)?;
        }
        let discount_percent = req
            .discount_percent
            .unwrap_or(self.config.welcome_discount_percent);
        validate_percent(discount_percent)?;

        self.ensure_code_free(&code, None).await?;

        let promo = self
            .commerce
            .create_promotion(&NewPromoCode {
                code,
                affiliate_id: affiliate.id.clone(),
                commission_rate: req.commission_rate,
                discount_percent,
            })
            .await?;
        info!(affiliate_id = %affiliate.id, promo_id = %promo.id, code = %promo.code, "Promo code created");
        Ok(promo)
    }

    pub async fn update_promo_code(
        &self,
        id: &str,
        mut update: PromoCodeUpdate,
    ) -> Result<PromoCode, LedgerError> {
        if let Some(raw) = update.code.take() {
            let code = normalize_code(&raw)
                .ok_or_else(|| LedgerError::Invalid(format!("invalid promo code: {}", raw)))?;
            self.ensure_code_free(&code, Some(id)).await?;
            update.code = Some(code);
        }
        if let Some(rate) = update.commission_rate {
            validate_rate(rate)?;
        }
        if let Some(percent) = update.discount_percent {
            validate_percent(percent)?;
        }

        let promo = self
            .commerce
            .update_promotion(id, &update)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("promo code {}", id)))?;
        info!(promo_id = %promo.id, code = %promo.code, active = promo.active, "Promo code updated");
        Ok(promo)
    }

    /// Create the affiliate's welcome code, named after their referral code.
    ///
    /// Returns the existing code if the affiliate already has one by that name.
    pub async fn create_welcome_code(&self, affiliate: &Affiliate) -> Result<PromoCode, LedgerError> {
        let existing = self.commerce.list_promotions(Some(&affiliate.id)).await?;
        if let Some(promo) = existing.into_iter().find(|p| p.code == affiliate.code) {
            return Ok(promo);
        }

        let promo = self
            .commerce
            .create_promotion(&NewPromoCode {
                code: affiliate.code.clone(),
                affiliate_id: affiliate.id.clone(),
                commission_rate: None,
                discount_percent: self.config.welcome_discount_percent,
            })
            .await?;
        info!(affiliate_id = %affiliate.id, code = %promo.code, "Welcome promo code created");
        Ok(promo)
    }

    /// Give every active affiliate without a promo code their welcome code.
    pub async fn bulk_generate_promo_codes(&self) -> Result<BulkGenerateReport, LedgerError> {
        let affiliates = self.repo.list_affiliates(Some(AffiliateStatus::Active)).await?;
        let covered: HashSet<AffiliateId> = self
            .commerce
            .list_promotions(None)
            .await?
            .into_iter()
            .map(|p| p.affiliate_id)
            .collect();

        let mut report = BulkGenerateReport::default();
        for affiliate in &affiliates {
            if covered.contains(&affiliate.id) {
                report.skipped += 1;
                continue;
            }
            match self.create_welcome_code(affiliate).await {
                Ok(_) => report.created += 1,
                Err(e) => {
                    warn!(affiliate_id = %affiliate.id, error = %e, "Promo code generation failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            created = report.created,
            skipped = report.skipped,
            failed = report.failed,
            "Bulk promo code generation finished"
        );
        Ok(report)
    }

    async fn ensure_code_free(&self, code: &str, except_id: Option<&str>) -> Result<(), LedgerError> {
        let taken = self
            .commerce
            .list_promotions(None)
            .await?
            .iter()
            .any(|p| p.code == code && Some(p.id.as_str()) != except_id);
        if taken {
            return Err(LedgerError::Conflict(format!("promo code {} already exists", code)));
        }
        Ok(())
    }
}

fn validate_rate(rate: Decimal) -> Result<(), LedgerError> {
    if is_valid_rate(rate) {
        Ok(())
    } else {
        Err(LedgerError::Invalid(
            "commission rate must be between 0 and 1".to_string(),
        ))
    }
}

fn validate_percent(percent: Decimal) -> Result<(), LedgerError> {
    if percent.is_positive() && percent <= Decimal::hundred() {
        Ok(())
    } else {
        Err(LedgerError::Invalid(
            "discount percent must be greater than 0 and at most 100".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn test_create_promo_code_validates() {
        let h = harness().await;
        let a = h.affiliate("PROMO", AffiliateStatus::Active).await;

        let promo = h
            .ledger
            .create_promo_code(CreatePromoCode {
                affiliate_id: a.id.clone(),
                code: Some("summer-24".to_string()),
                commission_rate: Some(Decimal::from_str_canonical("0.15").unwrap()),
                discount_percent: None,
            })
            .await
            .unwrap();
        assert_eq!(promo.code, "SUMMER-24");
        assert_eq!(promo.discount_percent, Some(Decimal::from(10)));

        let dup = h
            .ledger
            .create_promo_code(CreatePromoCode {
                affiliate_id: a.id.clone(),
                code: Some("SUMMER-24".to_string()),
                commission_rate: None,
                discount_percent: None,
            })
            .await;
        assert!(matches!(dup, Err(LedgerError::Conflict(_))));

        let bad_rate = h
            .ledger
            .create_promo_code(CreatePromoCode {
                affiliate_id: a.id.clone(),
                code: None,
                commission_rate: Some(Decimal::from(2)),
                discount_percent: None,
            })
            .await;
        assert!(matches!(bad_rate, Err(LedgerError::Invalid(_))));

        let missing = h
            .ledger
            .create_promo_code(CreatePromoCode {
                affiliate_id: AffiliateId::new("aff_missing"),
                code: None,
                commission_rate: None,
                discount_percent: None,
            })
            .await;
        assert!(matches!(missing, Err(LedgerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_promo_code() {
        let h = harness().await;
        let a = h.affiliate("UPD", AffiliateStatus::Active).await;
        let promo = h.ledger.create_welcome_code(&a).await.unwrap();

        let updated = h
            .ledger
            .update_promo_code(
                &promo.id,
                PromoCodeUpdate {
                    active: Some(false),
                    discount_percent: Some(Decimal::from(20)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated.active);
        assert_eq!(updated.discount_percent, Some(Decimal::from(20)));

        let missing = h
            .ledger
            .update_promo_code("promo_missing", PromoCodeUpdate::default())
            .await;
        assert!(matches!(missing, Err(LedgerError::NotFound(_))));

        let bad = h
            .ledger
            .update_promo_code(
                &promo.id,
                PromoCodeUpdate {
                    discount_percent: Some(Decimal::zero()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(bad, Err(LedgerError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_welcome_code_is_idempotent() {
        let h = harness().await;
        let a = h.affiliate("WELCOME", AffiliateStatus::Active).await;

        let first = h.ledger.create_welcome_code(&a).await.unwrap();
        let second = h.ledger.create_welcome_code(&a).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.code, "WELCOME");
        assert_eq!(h.commerce.promotions().len(), 1);
    }

    #[tokio::test]
    async fn test_bulk_generate_covers_active_only() {
        let h = harness().await;
        let has_code = h.affiliate("HASCODE", AffiliateStatus::Active).await;
        h.ledger.create_welcome_code(&has_code).await.unwrap();
        h.affiliate("NEEDS", AffiliateStatus::Active).await;
        h.affiliate("WAITING", AffiliateStatus::Pending).await;

        let report = h.ledger.bulk_generate_promo_codes().await.unwrap();
        assert_eq!(
            report,
            BulkGenerateReport {
                created: 1,
                skipped: 1,
                failed: 0
            }
        );

        h.affiliate("BROKEN", AffiliateStatus::Active).await;
        h.commerce.set_promotion_writes_failing(true);
        let report = h.ledger.bulk_generate_promo_codes().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 2);
    }
}
