//! Repository layer for database operations.
//!
//! This module provides the `Repository` struct for all database operations.
//! Methods are organized across submodules by record type:
//! - `mod.rs` - Affiliate accounts and the balance projection
//! - `links.rs` - Referral links and the click log
//! - `conversions.rs` - Conversion ledger writes and status transitions
//! - `settlements.rs` - Settlement batches
//! - `stats.rs` - Grouped reads for time-series stats

mod conversions;
mod links;
mod settlements;
mod stats;

pub use conversions::{ConversionFilter, RecordOutcome, TransitionReport};
pub use settlements::{NewSettlement, SettleOutcome, SettlementItem};
pub use stats::{ClickDay, ConversionPoint};

use crate::domain::{
    Affiliate, AffiliateId, AffiliateSettings, AffiliateStatus, ConversionStatus, Decimal,
    NewAffiliate, Role, TimeMs,
};
use backoff::future::retry;
use backoff::ExponentialBackoff;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::Row;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

const AFFILIATE_COLUMNS: &str = "id, email, password_hash, name, code, balance, total_earnings, \
     status, role, commission_rate, settings, metadata, created_at, updated_at";

/// Repository for database operations.
#[derive(Debug)]
pub struct Repository {
    pool: SqlitePool,
}

/// Cached balance fields derived from the conversion log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceProjection {
    /// Commission not yet paid out (pending + captured).
    pub balance: Decimal,
    /// All commission ever earned and not reversed (pending + captured + paid).
    pub total_earnings: Decimal,
}

impl BalanceProjection {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = (ConversionStatus, &'a Decimal)>) -> Self {
        let mut projection = BalanceProjection::default();
        for (status, commission) in entries {
            match status {
                ConversionStatus::Cancelled => {}
                ConversionStatus::Paid => projection.total_earnings += *commission,
                ConversionStatus::Pending | ConversionStatus::Captured => {
                    projection.balance += *commission;
                    projection.total_earnings += *commission;
                }
            }
        }
        projection
    }
}

/// True when the error is a uniqueness violation (duplicate email, code, or live order).
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// True when SQLite refused the write lock (`SQLITE_BUSY`, `SQLITE_LOCKED` or
/// one of their extended codes).
pub fn is_busy(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = err else {
        return false;
    };
    db.code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, 5 | 6))
}

/// Run a write transaction, starting it over while SQLite reports the
/// database as busy. Any other error is returned as is.
async fn retry_on_busy<T, F, Fut>(mut op: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let policy = ExponentialBackoff {
        initial_interval: Duration::from_millis(5),
        max_interval: Duration::from_millis(250),
        max_elapsed_time: Some(Duration::from_secs(15)),
        ..Default::default()
    };

    retry(policy, || {
        let attempt = op();
        async move {
            attempt.await.map_err(|e| {
                if is_busy(&e) {
                    debug!(error = %e, "Database busy, retrying transaction");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Cheap round-trip used by the readiness probe.
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // =========================================================================
    // Affiliate operations
    // =========================================================================

    /// Insert an affiliate.
    ///
    /// # Errors
    /// Returns a unique violation when the email or code is already taken.
    pub async fn insert_affiliate(&self, new: &NewAffiliate) -> Result<Affiliate, sqlx::Error> {
        let id = AffiliateId::generate();
        let now = TimeMs::now();
        let settings = AffiliateSettings::default();

        sqlx::query(
            r#"
            INSERT INTO affiliate (
                id, email, password_hash, name, code, balance, total_earnings,
                status, role, commission_rate, settings, metadata, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, '0', '0', ?, ?, ?, ?, '{}', ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(&new.email)
        .bind(&new.password_hash)
        .bind(new.name.as_deref())
        .bind(&new.code)
        .bind(new.status.as_str())
        .bind(new.role.as_str())
        .bind(new.commission_rate.to_canonical_string())
        .bind(serde_json::to_string(&settings).unwrap_or_else(|_| "{}".to_string()))
        .bind(now.as_i64())
        .bind(now.as_i64())
        .execute(&self.pool)
        .await?;

        Ok(Affiliate {
            id,
            email: new.email.clone(),
            password_hash: new.password_hash.clone(),
            name: new.name.clone(),
            code: new.code.clone(),
            balance: Decimal::zero(),
            total_earnings: Decimal::zero(),
            status: new.status,
            role: new.role,
            commission_rate: new.commission_rate,
            settings,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        })
    }

    /// Get a live (non-deleted) affiliate by id.
    pub async fn get_affiliate(&self, id: &AffiliateId) -> Result<Option<Affiliate>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM affiliate WHERE id = ? AND deleted_at IS NULL",
            AFFILIATE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(affiliate_from_row))
    }

    /// Get a live affiliate by normalized email.
    pub async fn get_affiliate_by_email(
        &self,
        email: &str,
    ) -> Result<Option<Affiliate>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM affiliate WHERE email = ? AND deleted_at IS NULL",
            AFFILIATE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(affiliate_from_row))
    }

    /// Get a live affiliate by referral code.
    pub async fn get_affiliate_by_code(
        &self,
        code: &str,
    ) -> Result<Option<Affiliate>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM affiliate WHERE code = ? AND deleted_at IS NULL",
            AFFILIATE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(affiliate_from_row))
    }

    /// List live affiliates, newest first, optionally filtered by status.
    pub async fn list_affiliates(
        &self,
        status: Option<AffiliateStatus>,
    ) -> Result<Vec<Affiliate>, sqlx::Error> {
        let (sql, binds_status) = match status {
            Some(_) => (
                format!(
                    "SELECT {} FROM affiliate WHERE deleted_at IS NULL AND status = ? \
                     ORDER BY created_at DESC, id ASC",
                    AFFILIATE_COLUMNS
                ),
                true,
            ),
            None => (
                format!(
                    "SELECT {} FROM affiliate WHERE deleted_at IS NULL \
                     ORDER BY created_at DESC, id ASC",
                    AFFILIATE_COLUMNS
                ),
                false,
            ),
        };

        let mut query = sqlx::query(&sql);
        if binds_status {
            query = query.bind(status.map(|s| s.as_str()));
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(affiliate_from_row).collect())
    }

    /// Set status and commission rate, provided the status is still `expected`.
    ///
    /// Returns false when the affiliate does not exist or its status moved.
    pub async fn update_affiliate_terms(
        &self,
        id: &AffiliateId,
        expected: AffiliateStatus,
        status: AffiliateStatus,
        commission_rate: Decimal,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE affiliate SET status = ?, commission_rate = ?, updated_at = ?
            WHERE id = ? AND status = ? AND deleted_at IS NULL
            "#,
        )
        .bind(status.as_str())
        .bind(commission_rate.to_canonical_string())
        .bind(TimeMs::now().as_i64())
        .bind(id.as_str())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Replace the settings document.
    pub async fn update_affiliate_settings(
        &self,
        id: &AffiliateId,
        settings: &AffiliateSettings,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE affiliate SET settings = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(serde_json::to_string(settings).unwrap_or_else(|_| "{}".to_string()))
        .bind(TimeMs::now().as_i64())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Soft-delete an affiliate. Conversions and settlements stay in place.
    pub async fn soft_delete_affiliate(&self, id: &AffiliateId) -> Result<bool, sqlx::Error> {
        let now = TimeMs::now().as_i64();
        let result = sqlx::query(
            "UPDATE affiliate SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Live affiliate counts per status.
    pub async fn count_affiliates_by_status(
        &self,
    ) -> Result<Vec<(AffiliateStatus, i64)>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n FROM affiliate
            WHERE deleted_at IS NULL
            GROUP BY status
            ORDER BY status ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let status: String = row.get("status");
                AffiliateStatus::from_str(&status)
                    .ok()
                    .map(|s| (s, row.get::<i64, _>("n")))
            })
            .collect())
    }
}

/// Take the database write lock by touching the affiliate row.
///
/// Must be the first statement of a mutating transaction so later reads see
/// a state no concurrent writer can change before commit. A read before the
/// first write pins a snapshot that SQLite cannot upgrade once another writer
/// commits, and that failure skips the busy timeout.
async fn lock_affiliate(
    conn: &mut SqliteConnection,
    id: &AffiliateId,
    now: TimeMs,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE affiliate SET updated_at = ? WHERE id = ?")
        .bind(now.as_i64())
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Rebuild the cached balance fields of one affiliate from its conversions.
async fn refresh_balance_projection(
    conn: &mut SqliteConnection,
    id: &AffiliateId,
    now: TimeMs,
) -> Result<BalanceProjection, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT status, commission FROM affiliate_conversion
        WHERE affiliate_id = ? AND deleted_at IS NULL AND status != 'cancelled'
        "#,
    )
    .bind(id.as_str())
    .fetch_all(&mut *conn)
    .await?;

    let entries: Vec<(ConversionStatus, Decimal)> = rows
        .iter()
        .map(|row| {
            (
                status_col(row, "status"),
                decimal_col(row, "commission"),
            )
        })
        .collect();
    let projection =
        BalanceProjection::from_entries(entries.iter().map(|(status, c)| (*status, c)));

    sqlx::query("UPDATE affiliate SET balance = ?, total_earnings = ?, updated_at = ? WHERE id = ?")
        .bind(projection.balance.to_canonical_string())
        .bind(projection.total_earnings.to_canonical_string())
        .bind(now.as_i64())
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;

    Ok(projection)
}

fn affiliate_from_row(row: &SqliteRow) -> Affiliate {
    let id: String = row.get("id");

    let status_str: String = row.get("status");
    let status = AffiliateStatus::from_str(&status_str).unwrap_or_else(|e| {
        // Unknown status must not grant access.
        warn!(affiliate_id = %id, error = %e, "Unknown affiliate status, treating as suspended");
        AffiliateStatus::Suspended
    });
    let role_str: String = row.get("role");
    let role = Role::from_str(&role_str).unwrap_or(Role::User);

    let settings_str: String = row.get("settings");
    let settings = serde_json::from_str(&settings_str).unwrap_or_else(|e| {
        warn!(affiliate_id = %id, error = %e, "Failed to parse affiliate settings, using defaults");
        AffiliateSettings::default()
    });

    Affiliate {
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        name: row.get("name"),
        code: row.get("code"),
        balance: decimal_col(row, "balance"),
        total_earnings: decimal_col(row, "total_earnings"),
        status,
        role,
        commission_rate: decimal_col(row, "commission_rate"),
        settings,
        metadata: json_col(row, "metadata"),
        created_at: TimeMs::new(row.get("created_at")),
        updated_at: TimeMs::new(row.get("updated_at")),
        id: AffiliateId::new(id),
    }
}

fn decimal_col(row: &SqliteRow, column: &str) -> Decimal {
    let raw: String = row.get(column);
    Decimal::from_str(&raw).unwrap_or_else(|e| {
        warn!(column, value = %raw, error = %e, "Failed to parse decimal column, using zero");
        Decimal::default()
    })
}

fn json_col(row: &SqliteRow, column: &str) -> serde_json::Value {
    let raw: String = row.get(column);
    serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!(column, error = %e, "Failed to parse JSON column, using empty object");
        serde_json::json!({})
    })
}

fn status_col(row: &SqliteRow, column: &str) -> ConversionStatus {
    let raw: String = row.get(column);
    ConversionStatus::from_str(&raw).unwrap_or_else(|e| {
        warn!(column, error = %e, "Unknown conversion status, treating as pending");
        ConversionStatus::Pending
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_projection_buckets() {
        let c = |s: &str| Decimal::from_str(s).unwrap();
        let entries = vec![
            (ConversionStatus::Pending, c("10")),
            (ConversionStatus::Captured, c("20")),
            (ConversionStatus::Paid, c("40")),
            (ConversionStatus::Cancelled, c("80")),
        ];
        let p = BalanceProjection::from_entries(entries.iter().map(|(s, d)| (*s, d)));
        assert_eq!(p.balance, c("30"));
        assert_eq!(p.total_earnings, c("70"));
    }

    #[tokio::test]
    async fn test_insert_and_get_affiliate() {
        let (repo, _temp) = setup_test_db().await;
        let created = insert_test_affiliate(&repo, "REF123").await;

        let by_id = repo.get_affiliate(&created.id).await.unwrap().unwrap();
        assert_eq!(by_id, created);

        let by_code = repo.get_affiliate_by_code("REF123").await.unwrap().unwrap();
        assert_eq!(by_code.id, created.id);

        let by_email = repo
            .get_affiliate_by_email("ref123@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_email.id, created.id);
    }

    #[tokio::test]
    async fn test_duplicate_code_is_unique_violation() {
        let (repo, _temp) = setup_test_db().await;
        insert_test_affiliate(&repo, "DUP").await;

        let err = repo
            .insert_affiliate(&NewAffiliate {
                email: "other@example.com".to_string(),
                password_hash: "x".to_string(),
                name: None,
                code: "DUP".to_string(),
                status: AffiliateStatus::Pending,
                role: Role::User,
                commission_rate: Decimal::from_str("0.1").unwrap(),
            })
            .await
            .unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[tokio::test]
    async fn test_soft_deleted_affiliate_frees_code() {
        let (repo, _temp) = setup_test_db().await;
        let a = insert_test_affiliate(&repo, "GONE").await;

        assert!(repo.soft_delete_affiliate(&a.id).await.unwrap());
        assert!(repo.get_affiliate(&a.id).await.unwrap().is_none());
        assert!(!repo.soft_delete_affiliate(&a.id).await.unwrap());

        // The row still exists for audit, but the code is reusable.
        insert_test_affiliate(&repo, "GONE").await;
    }

    #[tokio::test]
    async fn test_update_terms_and_settings() {
        let (repo, _temp) = setup_test_db().await;
        let a = insert_test_affiliate(&repo, "TERMS").await;

        let rate = Decimal::from_str("0.2").unwrap();
        assert!(repo
            .update_affiliate_terms(&a.id, AffiliateStatus::Active, AffiliateStatus::Suspended, rate)
            .await
            .unwrap());
        // Stale expectation: the status already moved.
        assert!(!repo
            .update_affiliate_terms(&a.id, AffiliateStatus::Active, AffiliateStatus::Active, rate)
            .await
            .unwrap());

        let mut settings = AffiliateSettings::default();
        settings.payout_method = Some("paypal".to_string());
        assert!(repo.update_affiliate_settings(&a.id, &settings).await.unwrap());

        let updated = repo.get_affiliate(&a.id).await.unwrap().unwrap();
        assert_eq!(updated.status, AffiliateStatus::Suspended);
        assert_eq!(updated.commission_rate, rate);
        assert_eq!(updated.settings.payout_method.as_deref(), Some("paypal"));
    }

    #[tokio::test]
    async fn test_list_and_count_by_status() {
        let (repo, _temp) = setup_test_db().await;
        let a = insert_test_affiliate(&repo, "AAA").await;
        insert_test_affiliate(&repo, "BBB").await;
        repo.update_affiliate_terms(
            &a.id,
            AffiliateStatus::Active,
            AffiliateStatus::Suspended,
            a.commission_rate,
        )
            .await
            .unwrap();

        let active = repo
            .list_affiliates(Some(AffiliateStatus::Active))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].code, "BBB");
        assert_eq!(repo.list_affiliates(None).await.unwrap().len(), 2);

        let counts = repo.count_affiliates_by_status().await.unwrap();
        assert!(counts.contains(&(AffiliateStatus::Active, 1)));
        assert!(counts.contains(&(AffiliateStatus::Suspended, 1)));
    }
}
