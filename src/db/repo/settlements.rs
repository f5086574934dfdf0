//! Settlement operations for the repository.

use crate::domain::{
    AffiliateId, ConversionId, ConversionStatus, Decimal, Settlement, SettlementId,
    SettlementMetadata, SettlementStatus, TimeMs,
};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;
use tracing::warn;

use super::conversions::{conversion_from_row, metadata_json};
use super::{
    decimal_col, lock_affiliate, refresh_balance_projection, retry_on_busy, BalanceProjection,
    Repository,
};

const SETTLEMENT_COLUMNS: &str =
    "id, affiliate_id, amount, currency, status, period_start, period_end, metadata, created_at";

/// A conversion to include in a settlement and the status it was read in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementItem {
    pub conversion_id: ConversionId,
    pub expected: ConversionStatus,
}

/// Fields required to create a settlement.
#[derive(Debug, Clone)]
pub struct NewSettlement {
    pub affiliate_id: AffiliateId,
    pub amount: Decimal,
    pub currency: String,
    pub period_start: Option<TimeMs>,
    pub period_end: Option<TimeMs>,
    pub metadata: SettlementMetadata,
}

/// Result of a settlement attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SettleOutcome {
    Settled {
        settlement: Settlement,
        projection: BalanceProjection,
    },
    /// A conversion was no longer in the status it was read in. Nothing was written.
    Conflict(ConversionId),
    MissingAffiliate,
}

impl Repository {
    /// Create a paid settlement and move its conversions to `paid`, atomically.
    ///
    /// Each conversion must still be in its `expected` status and belong to
    /// the affiliate; otherwise the transaction is rolled back.
    pub async fn settle_conversions(
        &self,
        new: &NewSettlement,
        items: &[SettlementItem],
    ) -> Result<SettleOutcome, sqlx::Error> {
        retry_on_busy(move || self.settle_conversions_once(new, items)).await
    }

    async fn settle_conversions_once(
        &self,
        new: &NewSettlement,
        items: &[SettlementItem],
    ) -> Result<SettleOutcome, sqlx::Error> {
        let now = TimeMs::now();
        let settlement_id = SettlementId::generate();
        let mut tx = self.pool.begin().await?;

        if !lock_affiliate(&mut tx, &new.affiliate_id, now).await? {
            return Ok(SettleOutcome::MissingAffiliate);
        }

        for item in items {
            let row = sqlx::query(
                r#"
                SELECT id, affiliate_id, link_id, order_id, order_amount, commission,
                       status, source_type, promo_code, metadata, created_at, updated_at
                FROM affiliate_conversion
                WHERE id = ? AND affiliate_id = ? AND deleted_at IS NULL
                "#,
            )
            .bind(item.conversion_id.as_str())
            .bind(new.affiliate_id.as_str())
            .fetch_optional(&mut *tx)
            .await?;

            let Some(mut conversion) = row.as_ref().map(conversion_from_row) else {
                return Ok(SettleOutcome::Conflict(item.conversion_id.clone()));
            };
            if conversion.status != item.expected {
                return Ok(SettleOutcome::Conflict(item.conversion_id.clone()));
            }

            let path: &[ConversionStatus] = match conversion.status {
                ConversionStatus::Pending => &[ConversionStatus::Captured, ConversionStatus::Paid],
                _ => &[ConversionStatus::Paid],
            };
            if conversion.status.transition_through(path).is_err() {
                return Ok(SettleOutcome::Conflict(item.conversion_id.clone()));
            }
            for step in path {
                conversion.metadata.stamp(*step, now);
            }
            conversion.metadata.settlement_id = Some(settlement_id.clone());

            let result = sqlx::query(
                r#"
                UPDATE affiliate_conversion SET status = 'paid', metadata = ?, updated_at = ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(metadata_json(&conversion.metadata))
            .bind(now.as_i64())
            .bind(conversion.id.as_str())
            .bind(item.expected.as_str())
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Ok(SettleOutcome::Conflict(item.conversion_id.clone()));
            }
        }

        let settlement = Settlement {
            id: settlement_id,
            affiliate_id: new.affiliate_id.clone(),
            amount: new.amount,
            currency: new.currency.clone(),
            status: SettlementStatus::Paid,
            period_start: new.period_start,
            period_end: new.period_end,
            metadata: new.metadata.clone(),
            created_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO affiliate_settlement (
                id, affiliate_id, amount, currency, status, period_start, period_end, metadata, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(settlement.id.as_str())
        .bind(settlement.affiliate_id.as_str())
        .bind(settlement.amount.to_canonical_string())
        .bind(&settlement.currency)
        .bind(settlement.status.as_str())
        .bind(settlement.period_start.map(|t| t.as_i64()))
        .bind(settlement.period_end.map(|t| t.as_i64()))
        .bind(serde_json::to_string(&settlement.metadata).unwrap_or_else(|_| "{}".to_string()))
        .bind(now.as_i64())
        .execute(&mut *tx)
        .await?;

        let projection = refresh_balance_projection(&mut tx, &new.affiliate_id, now).await?;
        tx.commit().await?;

        Ok(SettleOutcome::Settled {
            settlement,
            projection,
        })
    }

    /// Settlements, newest first, optionally for one affiliate.
    pub async fn list_settlements(
        &self,
        affiliate_id: Option<&AffiliateId>,
    ) -> Result<Vec<Settlement>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM affiliate_settlement \
             WHERE deleted_at IS NULL AND (?1 IS NULL OR affiliate_id = ?1) \
             ORDER BY created_at DESC, id ASC",
            SETTLEMENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(affiliate_id.map(|a| a.as_str()))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(settlement_from_row).collect())
    }

    /// Sum of all paid settlement amounts.
    pub async fn total_paid_out(&self) -> Result<Decimal, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT amount FROM affiliate_settlement WHERE deleted_at IS NULL AND status = 'paid'",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| decimal_col(row, "amount")).sum())
    }
}

fn settlement_from_row(row: &SqliteRow) -> Settlement {
    let id: String = row.get("id");

    let status_str: String = row.get("status");
    let status = SettlementStatus::from_str(&status_str).unwrap_or_else(|e| {
        warn!(settlement_id = %id, error = %e, "Unknown settlement status");
        SettlementStatus::Pending
    });

    let metadata_str: String = row.get("metadata");
    let metadata = serde_json::from_str(&metadata_str).unwrap_or_else(|e| {
        warn!(settlement_id = %id, error = %e, "Failed to parse settlement metadata");
        SettlementMetadata::default()
    });

    Settlement {
        affiliate_id: AffiliateId::new(row.get::<String, _>("affiliate_id")),
        amount: decimal_col(row, "amount"),
        currency: row.get("currency"),
        status,
        period_start: row.get::<Option<i64>, _>("period_start").map(TimeMs::new),
        period_end: row.get::<Option<i64>, _>("period_end").map(TimeMs::new),
        metadata,
        created_at: TimeMs::new(row.get("created_at")),
        id: SettlementId::new(id),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::RecordOutcome;
    use super::*;
    use crate::domain::{ConversionMetadata, NewConversion, OrderId, SourceType};

    async fn seed(repo: &Repository, affiliate_id: &AffiliateId, order: &str, commission: i64) -> ConversionId {
        let outcome = repo
            .record_conversion(&NewConversion {
                affiliate_id: affiliate_id.clone(),
                link_id: None,
                order_id: OrderId::new(order),
                order_amount: Decimal::from(commission * 10),
                commission: Decimal::from(commission),
                source_type: SourceType::PromoCode,
                promo_code: None,
                metadata: ConversionMetadata::default(),
            })
            .await
            .unwrap();
        match outcome {
            RecordOutcome::Created { conversion, .. } => conversion.id,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    fn new_settlement(affiliate_id: &AffiliateId, amount: i64, ids: Vec<ConversionId>) -> NewSettlement {
        NewSettlement {
            affiliate_id: affiliate_id.clone(),
            amount: Decimal::from(amount),
            currency: "twd".to_string(),
            period_start: None,
            period_end: None,
            metadata: SettlementMetadata {
                settled_by: Some("aff_admin".to_string()),
                conversion_ids: ids,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_settle_moves_conversions_to_paid() {
        let (repo, _temp) = setup_test_db().await;
        let a = insert_test_affiliate(&repo, "SETTLE").await;
        let c1 = seed(&repo, &a.id, "order_1", 30).await;
        let c2 = seed(&repo, &a.id, "order_2", 70).await;
        repo.transition_order_conversions(&OrderId::new("order_2"), ConversionStatus::Captured)
            .await
            .unwrap();

        let items = vec![
            SettlementItem { conversion_id: c1.clone(), expected: ConversionStatus::Pending },
            SettlementItem { conversion_id: c2.clone(), expected: ConversionStatus::Captured },
        ];
        let outcome = repo
            .settle_conversions(&new_settlement(&a.id, 100, vec![c1.clone(), c2.clone()]), &items)
            .await
            .unwrap();
        let SettleOutcome::Settled { settlement, projection } = outcome else {
            panic!("expected settlement");
        };
        assert_eq!(settlement.status, SettlementStatus::Paid);
        assert_eq!(projection.balance, Decimal::zero());
        assert_eq!(projection.total_earnings, Decimal::from(100));

        let paid = repo.get_conversion(&c1).await.unwrap().unwrap();
        assert_eq!(paid.status, ConversionStatus::Paid);
        assert_eq!(paid.metadata.settlement_id, Some(settlement.id.clone()));
        assert!(paid.metadata.captured_at.is_some());
        assert!(paid.metadata.paid_at.is_some());

        let listed = repo.list_settlements(Some(&a.id)).await.unwrap();
        assert_eq!(listed, vec![settlement]);
        assert_eq!(repo.total_paid_out().await.unwrap(), Decimal::from(100));
    }

    #[tokio::test]
    async fn test_stale_status_rolls_back_everything() {
        let (repo, _temp) = setup_test_db().await;
        let a = insert_test_affiliate(&repo, "STALE").await;
        let c1 = seed(&repo, &a.id, "order_1", 30).await;
        let c2 = seed(&repo, &a.id, "order_2", 70).await;
        repo.transition_order_conversions(&OrderId::new("order_2"), ConversionStatus::Cancelled)
            .await
            .unwrap();

        let items = vec![
            SettlementItem { conversion_id: c1.clone(), expected: ConversionStatus::Pending },
            SettlementItem { conversion_id: c2.clone(), expected: ConversionStatus::Pending },
        ];
        let outcome = repo
            .settle_conversions(&new_settlement(&a.id, 100, vec![c1.clone(), c2.clone()]), &items)
            .await
            .unwrap();
        assert_eq!(outcome, SettleOutcome::Conflict(c2));

        let untouched = repo.get_conversion(&c1).await.unwrap().unwrap();
        assert_eq!(untouched.status, ConversionStatus::Pending);
        assert!(repo.list_settlements(Some(&a.id)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cannot_settle_another_affiliates_conversion() {
        let (repo, _temp) = setup_test_db().await;
        let a = insert_test_affiliate(&repo, "OWNER").await;
        let b = insert_test_affiliate(&repo, "THIEF").await;
        let c = seed(&repo, &a.id, "order_1", 30).await;

        let items = vec![SettlementItem { conversion_id: c.clone(), expected: ConversionStatus::Pending }];
        let outcome = repo
            .settle_conversions(&new_settlement(&b.id, 30, vec![c.clone()]), &items)
            .await
            .unwrap();
        assert_eq!(outcome, SettleOutcome::Conflict(c));
    }
}
