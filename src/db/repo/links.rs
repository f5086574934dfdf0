//! Referral link and click operations for the repository.

use crate::domain::{AffiliateClick, AffiliateId, AffiliateLink, ClickContext, ClickId, LinkId, TimeMs};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{retry_on_busy, Repository};

const LINK_COLUMNS: &str = "id, affiliate_id, code, url, clicks, conversions, created_at";

impl Repository {
    /// Create a referral link.
    ///
    /// # Errors
    /// Returns a unique violation when the code is taken by a live link.
    pub async fn insert_link(
        &self,
        affiliate_id: &AffiliateId,
        code: &str,
        url: &str,
    ) -> Result<AffiliateLink, sqlx::Error> {
        let id = LinkId::generate();
        let now = TimeMs::now();

        sqlx::query(
            r#"
            INSERT INTO affiliate_link (id, affiliate_id, code, url, clicks, conversions, created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, 0, ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(affiliate_id.as_str())
        .bind(code)
        .bind(url)
        .bind(now.as_i64())
        .bind(now.as_i64())
        .execute(&self.pool)
        .await?;

        Ok(AffiliateLink {
            id,
            affiliate_id: affiliate_id.clone(),
            code: code.to_string(),
            url: url.to_string(),
            clicks: 0,
            conversions: 0,
            created_at: now,
        })
    }

    pub async fn get_link(&self, id: &LinkId) -> Result<Option<AffiliateLink>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM affiliate_link WHERE id = ? AND deleted_at IS NULL",
            LINK_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(link_from_row))
    }

    pub async fn get_link_by_code(&self, code: &str) -> Result<Option<AffiliateLink>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM affiliate_link WHERE code = ? AND deleted_at IS NULL",
            LINK_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(link_from_row))
    }

    /// Links owned by an affiliate, newest first.
    pub async fn list_links(
        &self,
        affiliate_id: &AffiliateId,
    ) -> Result<Vec<AffiliateLink>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM affiliate_link WHERE affiliate_id = ? AND deleted_at IS NULL \
             ORDER BY created_at DESC, id ASC",
            LINK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(affiliate_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(link_from_row).collect())
    }

    /// Append a click and bump the link's counter in one transaction.
    pub async fn record_click(
        &self,
        link: &AffiliateLink,
        ctx: &ClickContext,
    ) -> Result<AffiliateClick, sqlx::Error> {
        retry_on_busy(move || self.record_click_once(link, ctx)).await
    }

    async fn record_click_once(
        &self,
        link: &AffiliateLink,
        ctx: &ClickContext,
    ) -> Result<AffiliateClick, sqlx::Error> {
        let click = AffiliateClick {
            id: ClickId::generate(),
            affiliate_id: link.affiliate_id.clone(),
            link_id: link.id.clone(),
            ip: ctx.ip.clone(),
            user_agent: ctx.user_agent.clone(),
            metadata: ctx.metadata(),
            created_at: TimeMs::now(),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO affiliate_click (id, affiliate_id, link_id, ip, user_agent, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(click.id.as_str())
        .bind(click.affiliate_id.as_str())
        .bind(click.link_id.as_str())
        .bind(click.ip.as_deref())
        .bind(click.user_agent.as_deref())
        .bind(click.metadata.to_string())
        .bind(click.created_at.as_i64())
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE affiliate_link SET clicks = clicks + 1, updated_at = ? WHERE id = ?")
            .bind(click.created_at.as_i64())
            .bind(link.id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(click)
    }
}

fn link_from_row(row: &SqliteRow) -> AffiliateLink {
    AffiliateLink {
        id: LinkId::new(row.get::<String, _>("id")),
        affiliate_id: AffiliateId::new(row.get::<String, _>("affiliate_id")),
        code: row.get("code"),
        url: row.get("url"),
        clicks: row.get("clicks"),
        conversions: row.get("conversions"),
        created_at: TimeMs::new(row.get("created_at")),
    }
}
