//! Response bodies shared by the affiliate and admin endpoints.

use crate::domain::{
    Affiliate, AffiliateLink, AffiliateSettings, Conversion, ConversionMetadata, Decimal,
    Settlement, SettlementMetadata,
};
use crate::ledger::LiveBalance;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 200;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AffiliateDto {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub code: String,
    pub status: String,
    pub role: String,
    pub commission_rate: Decimal,
    pub balance: Decimal,
    pub total_earnings: Decimal,
    pub balances: LiveBalance,
    pub settings: AffiliateSettings,
    pub created_at: i64,
}

impl AffiliateDto {
    /// Money fields come from live bucket totals, never the stored projection.
    pub fn with_live(affiliate: &Affiliate, live: LiveBalance) -> Self {
        Self {
            id: affiliate.id.to_string(),
            email: affiliate.email.clone(),
            name: affiliate.name.clone(),
            code: affiliate.code.clone(),
            status: affiliate.status.as_str().to_string(),
            role: affiliate.role.as_str().to_string(),
            commission_rate: affiliate.commission_rate,
            balance: live.balance,
            total_earnings: live.total_earnings,
            balances: live,
            settings: affiliate.settings.clone(),
            created_at: affiliate.created_at.as_ms(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkDto {
    pub id: String,
    pub code: String,
    pub url: String,
    pub clicks: i64,
    pub conversions: i64,
    pub created_at: i64,
}

impl From<&AffiliateLink> for LinkDto {
    fn from(link: &AffiliateLink) -> Self {
        Self {
            id: link.id.to_string(),
            code: link.code.clone(),
            url: link.url.clone(),
            clicks: link.clicks,
            conversions: link.conversions,
            created_at: link.created_at.as_ms(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionDto {
    pub id: String,
    pub affiliate_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub order_amount: Decimal,
    pub commission: Decimal,
    pub status: String,
    pub source_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promo_code: Option<String>,
    pub metadata: ConversionMetadata,
    pub created_at: i64,
}

impl From<&Conversion> for ConversionDto {
    fn from(c: &Conversion) -> Self {
        Self {
            id: c.id.to_string(),
            affiliate_id: c.affiliate_id.to_string(),
            link_id: c.link_id.as_ref().map(|l| l.to_string()),
            order_id: c.order_id.as_ref().map(|o| o.to_string()),
            order_amount: c.order_amount,
            commission: c.commission,
            status: c.status.as_str().to_string(),
            source_type: c.source_type.as_str().to_string(),
            promo_code: c.promo_code.clone(),
            metadata: c.metadata.clone(),
            created_at: c.created_at.as_ms(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementDto {
    pub id: String,
    pub affiliate_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_end: Option<i64>,
    pub metadata: SettlementMetadata,
    pub created_at: i64,
}

impl From<&Settlement> for SettlementDto {
    fn from(s: &Settlement) -> Self {
        Self {
            id: s.id.to_string(),
            affiliate_id: s.affiliate_id.to_string(),
            amount: s.amount,
            currency: s.currency.clone(),
            status: s.status.as_str().to_string(),
            period_start: s.period_start.map(|t| t.as_ms()),
            period_end: s.period_end.map(|t| t.as_ms()),
            metadata: s.metadata.clone(),
            created_at: s.created_at.as_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ConversionsQuery {
    pub fn page(&self) -> (i64, i64) {
        let limit = self
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionsResponse {
    pub conversions: Vec<ConversionDto>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// `from`/`to` as `YYYY-MM-DD` UTC dates.
#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub from: Option<String>,
    pub to: Option<String>,
}
