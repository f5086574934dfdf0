//! Referral links and their append-only click log.

use crate::domain::{AffiliateId, ClickId, LinkId, TimeMs};
use serde::{Deserialize, Serialize};

/// A trackable referral URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffiliateLink {
    pub id: LinkId,
    pub affiliate_id: AffiliateId,
    pub code: String,
    pub url: String,
    /// Denormalized click counter.
    pub clicks: i64,
    /// Denormalized conversion counter.
    pub conversions: i64,
    pub created_at: TimeMs,
}

/// A recorded click. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffiliateClick {
    pub id: ClickId,
    pub affiliate_id: AffiliateId,
    pub link_id: LinkId,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: TimeMs,
}

/// Request-side details captured with a click.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClickContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
}

impl ClickContext {
    pub fn metadata(&self) -> serde_json::Value {
        match &self.referrer {
            Some(referrer) => serde_json::json!({ "referrer": referrer }),
            None => serde_json::json!({}),
        }
    }
}

/// Only absolute http(s) URLs are accepted as link targets.
pub fn is_valid_target_url(url: &str) -> bool {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    matches!(rest, Some(host) if !host.is_empty() && !host.starts_with('/') && !host.contains(char::is_whitespace))
}
