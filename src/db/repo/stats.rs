//! Grouped reads backing the stats endpoints.

use crate::domain::{AffiliateId, ConversionStatus, Decimal, TimeMs};
use sqlx::Row;

use super::{decimal_col, status_col, Repository};

/// Click count for one UTC day (`YYYY-MM-DD`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClickDay {
    pub day: String,
    pub clicks: i64,
}

/// One non-cancelled conversion reduced to what the stats need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionPoint {
    pub day: String,
    pub status: ConversionStatus,
    pub order_amount: Decimal,
    pub commission: Decimal,
}

impl Repository {
    /// Clicks per UTC day within `[from, to]`, ascending by day.
    pub async fn click_counts_by_day(
        &self,
        affiliate_id: Option<&AffiliateId>,
        from: TimeMs,
        to: TimeMs,
    ) -> Result<Vec<ClickDay>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT strftime('%Y-%m-%d', created_at / 1000, 'unixepoch') AS day, COUNT(*) AS clicks
            FROM affiliate_click
            WHERE deleted_at IS NULL
              AND created_at >= ?1 AND created_at <= ?2
              AND (?3 IS NULL OR affiliate_id = ?3)
            GROUP BY day
            ORDER BY day ASC
            "#,
        )
        .bind(from.as_i64())
        .bind(to.as_i64())
        .bind(affiliate_id.map(|a| a.as_str()))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ClickDay {
                day: row.get("day"),
                clicks: row.get("clicks"),
            })
            .collect())
    }

    /// Non-cancelled conversions within `[from, to]`, ascending by time.
    ///
    /// Amounts are decimal text, so sums happen in Rust rather than SQL.
    pub async fn conversion_points(
        &self,
        affiliate_id: Option<&AffiliateId>,
        from: TimeMs,
        to: TimeMs,
    ) -> Result<Vec<ConversionPoint>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT strftime('%Y-%m-%d', created_at / 1000, 'unixepoch') AS day,
                   status, order_amount, commission
            FROM affiliate_conversion
            WHERE deleted_at IS NULL AND status != 'cancelled'
              AND created_at >= ?1 AND created_at <= ?2
              AND (?3 IS NULL OR affiliate_id = ?3)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(from.as_i64())
        .bind(to.as_i64())
        .bind(affiliate_id.map(|a| a.as_str()))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ConversionPoint {
                day: row.get("day"),
                status: status_col(row, "status"),
                order_amount: decimal_col(row, "order_amount"),
                commission: decimal_col(row, "commission"),
            })
            .collect())
    }
}
