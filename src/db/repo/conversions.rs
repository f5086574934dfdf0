//! Conversion ledger operations for the repository.
//!
//! Every write here runs in one transaction that first locks the owning
//! affiliate, then changes conversions through compare-and-set updates, then
//! rebuilds the affiliate's balance projection before commit.

use crate::domain::{
    AffiliateId, Conversion, ConversionId, ConversionMetadata, ConversionStatus, InvalidTransition,
    LinkId, NewConversion, OrderId, SourceType, TimeMs,
};
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{QueryBuilder, Row};
use std::collections::BTreeSet;
use std::str::FromStr;
use tracing::warn;

use super::{
    decimal_col, lock_affiliate, refresh_balance_projection, retry_on_busy, status_col,
    BalanceProjection, Repository,
};

const CONVERSION_COLUMNS: &str = "id, affiliate_id, link_id, order_id, order_amount, commission, \
     status, source_type, promo_code, metadata, created_at, updated_at";

/// Result of recording a conversion.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Created {
        conversion: Conversion,
        projection: BalanceProjection,
    },
    /// The order already has a live conversion.
    Duplicate,
    /// The affiliate does not exist.
    MissingAffiliate,
}

/// Result of moving an order's conversions to a new status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionReport {
    /// Conversions now in the target status, as written.
    pub transitioned: Vec<Conversion>,
    /// Conversions left untouched because the edge is not legal.
    pub rejected: Vec<(ConversionId, InvalidTransition)>,
}

/// Filter for conversion listings.
#[derive(Debug, Clone, Default)]
pub struct ConversionFilter {
    pub affiliate_id: Option<AffiliateId>,
    pub status: Option<ConversionStatus>,
    pub from: Option<TimeMs>,
    pub to: Option<TimeMs>,
}

impl ConversionFilter {
    pub fn for_affiliate(affiliate_id: &AffiliateId) -> Self {
        ConversionFilter {
            affiliate_id: Some(affiliate_id.clone()),
            ..Default::default()
        }
    }

    fn push_where<'a>(&'a self, qb: &mut QueryBuilder<'a, Sqlite>) {
        qb.push(" WHERE deleted_at IS NULL");
        if let Some(affiliate_id) = &self.affiliate_id {
            qb.push(" AND affiliate_id = ").push_bind(affiliate_id.as_str());
        }
        if let Some(status) = self.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(from) = self.from {
            qb.push(" AND created_at >= ").push_bind(from.as_i64());
        }
        if let Some(to) = self.to {
            qb.push(" AND created_at <= ").push_bind(to.as_i64());
        }
    }
}

impl Repository {
    /// Record a conversion for an order.
    ///
    /// Idempotent per order: a second call while a live conversion exists
    /// returns [`RecordOutcome::Duplicate`] and changes nothing.
    pub async fn record_conversion(
        &self,
        new: &NewConversion,
    ) -> Result<RecordOutcome, sqlx::Error> {
        retry_on_busy(move || self.record_conversion_once(new)).await
    }

    async fn record_conversion_once(
        &self,
        new: &NewConversion,
    ) -> Result<RecordOutcome, sqlx::Error> {
        let now = TimeMs::now();
        let mut tx = self.pool.begin().await?;

        if !lock_affiliate(&mut tx, &new.affiliate_id, now).await? {
            return Ok(RecordOutcome::MissingAffiliate);
        }

        let conversion = Conversion {
            id: ConversionId::generate(),
            affiliate_id: new.affiliate_id.clone(),
            link_id: new.link_id.clone(),
            order_id: Some(new.order_id.clone()),
            order_amount: new.order_amount,
            commission: new.commission,
            status: ConversionStatus::Pending,
            source_type: new.source_type,
            promo_code: new.promo_code.clone(),
            metadata: new.metadata.clone(),
            created_at: now,
            updated_at: now,
        };

        // Conflicts with the live-order index are the idempotency signal.
        let result = sqlx::query(
            r#"
            INSERT INTO affiliate_conversion (
                id, affiliate_id, link_id, order_id, order_amount, commission,
                status, source_type, promo_code, metadata, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(conversion.id.as_str())
        .bind(conversion.affiliate_id.as_str())
        .bind(conversion.link_id.as_ref().map(|l| l.as_str()))
        .bind(new.order_id.as_str())
        .bind(conversion.order_amount.to_canonical_string())
        .bind(conversion.commission.to_canonical_string())
        .bind(conversion.status.as_str())
        .bind(conversion.source_type.as_str())
        .bind(conversion.promo_code.as_deref())
        .bind(metadata_json(&conversion.metadata))
        .bind(now.as_i64())
        .bind(now.as_i64())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(RecordOutcome::Duplicate);
        }

        if let Some(link_id) = &conversion.link_id {
            sqlx::query(
                "UPDATE affiliate_link SET conversions = conversions + 1, updated_at = ? WHERE id = ?",
            )
            .bind(now.as_i64())
            .bind(link_id.as_str())
            .execute(&mut *tx)
            .await?;
        }

        let projection = refresh_balance_projection(&mut tx, &conversion.affiliate_id, now).await?;
        tx.commit().await?;

        Ok(RecordOutcome::Created {
            conversion,
            projection,
        })
    }

    pub async fn get_conversion(
        &self,
        id: &ConversionId,
    ) -> Result<Option<Conversion>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM affiliate_conversion WHERE id = ? AND deleted_at IS NULL",
            CONVERSION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(conversion_from_row))
    }

    /// The non-cancelled conversion for an order, if any.
    pub async fn find_live_conversion_for_order(
        &self,
        order_id: &OrderId,
    ) -> Result<Option<Conversion>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM affiliate_conversion \
             WHERE order_id = ? AND status != 'cancelled' AND deleted_at IS NULL",
            CONVERSION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(order_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(conversion_from_row))
    }

    /// Conversions matching a filter, newest first.
    pub async fn list_conversions(
        &self,
        filter: &ConversionFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Conversion>, sqlx::Error> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM affiliate_conversion",
            CONVERSION_COLUMNS
        ));
        filter.push_where(&mut qb);
        qb.push(" ORDER BY created_at DESC, id ASC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(conversion_from_row).collect())
    }

    pub async fn count_conversions(&self, filter: &ConversionFilter) -> Result<i64, sqlx::Error> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS n FROM affiliate_conversion");
        filter.push_where(&mut qb);
        let row = qb.build().fetch_one(&self.pool).await?;
        Ok(row.get("n"))
    }

    /// Every non-cancelled conversion, optionally for one affiliate, oldest first.
    pub async fn list_open_conversions(
        &self,
        affiliate_id: Option<&AffiliateId>,
    ) -> Result<Vec<Conversion>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM affiliate_conversion \
             WHERE deleted_at IS NULL AND status != 'cancelled' \
             AND (?1 IS NULL OR affiliate_id = ?1) \
             ORDER BY created_at ASC, id ASC",
            CONVERSION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(affiliate_id.map(|a| a.as_str()))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(conversion_from_row).collect())
    }

    /// Move every live conversion of an order to `target`.
    ///
    /// Conversions for which the edge is illegal are reported, not changed.
    /// Balance projections of the affected affiliates are rebuilt in the same
    /// transaction.
    pub async fn transition_order_conversions(
        &self,
        order_id: &OrderId,
        target: ConversionStatus,
    ) -> Result<TransitionReport, sqlx::Error> {
        retry_on_busy(move || self.transition_order_conversions_once(order_id, target)).await
    }

    async fn transition_order_conversions_once(
        &self,
        order_id: &OrderId,
        target: ConversionStatus,
    ) -> Result<TransitionReport, sqlx::Error> {
        let now = TimeMs::now();
        let mut tx = self.pool.begin().await?;

        // Lock every owner of the order before anything is read.
        let locked = sqlx::query(
            r#"
            UPDATE affiliate SET updated_at = ?
            WHERE id IN (
                SELECT affiliate_id FROM affiliate_conversion
                WHERE order_id = ? AND deleted_at IS NULL
            )
            "#,
        )
        .bind(now.as_i64())
        .bind(order_id.as_str())
        .execute(&mut *tx)
        .await?;
        if locked.rows_affected() == 0 {
            return Ok(TransitionReport::default());
        }

        let owners: BTreeSet<String> = sqlx::query(
            "SELECT DISTINCT affiliate_id FROM affiliate_conversion \
             WHERE order_id = ? AND deleted_at IS NULL",
        )
        .bind(order_id.as_str())
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.get("affiliate_id"))
        .collect();

        // Re-read under the lock.
        let sql = format!(
            "SELECT {} FROM affiliate_conversion \
             WHERE order_id = ? AND status != 'cancelled' AND deleted_at IS NULL",
            CONVERSION_COLUMNS
        );
        let current: Vec<Conversion> = sqlx::query(&sql)
            .bind(order_id.as_str())
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(conversion_from_row)
            .collect();

        let mut report = TransitionReport::default();
        for mut conversion in current {
            let from = conversion.status;
            if let Err(e) = from.transition(target) {
                report.rejected.push((conversion.id.clone(), e));
                continue;
            }

            conversion.metadata.stamp(target, now);
            let result = sqlx::query(
                r#"
                UPDATE affiliate_conversion SET status = ?, metadata = ?, updated_at = ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(target.as_str())
            .bind(metadata_json(&conversion.metadata))
            .bind(now.as_i64())
            .bind(conversion.id.as_str())
            .bind(from.as_str())
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                warn!(conversion_id = %conversion.id, "Conversion changed under lock, skipping");
                continue;
            }

            conversion.status = target;
            conversion.updated_at = now;
            report.transitioned.push(conversion);
        }

        if !report.transitioned.is_empty() {
            for owner in &owners {
                refresh_balance_projection(&mut tx, &AffiliateId::new(owner.as_str()), now).await?;
            }
        }

        tx.commit().await?;
        Ok(report)
    }
}

pub(super) fn metadata_json(metadata: &ConversionMetadata) -> String {
    serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string())
}

pub(super) fn conversion_from_row(row: &SqliteRow) -> Conversion {
    let id: String = row.get("id");

    let source_str: String = row.get("source_type");
    let source_type = SourceType::from_str(&source_str).unwrap_or_else(|e| {
        warn!(conversion_id = %id, error = %e, "Unknown source type, treating as link");
        SourceType::Link
    });

    let metadata_str: String = row.get("metadata");
    let metadata = serde_json::from_str(&metadata_str).unwrap_or_else(|e| {
        warn!(conversion_id = %id, error = %e, "Failed to parse conversion metadata");
        ConversionMetadata::default()
    });

    Conversion {
        affiliate_id: AffiliateId::new(row.get::<String, _>("affiliate_id")),
        link_id: row.get::<Option<String>, _>("link_id").map(LinkId::new),
        order_id: row.get::<Option<String>, _>("order_id").map(OrderId::new),
        order_amount: decimal_col(row, "order_amount"),
        commission: decimal_col(row, "commission"),
        status: status_col(row, "status"),
        source_type,
        promo_code: row.get("promo_code"),
        metadata,
        created_at: TimeMs::new(row.get("created_at")),
        updated_at: TimeMs::new(row.get("updated_at")),
        id: ConversionId::new(id),
    }
}
