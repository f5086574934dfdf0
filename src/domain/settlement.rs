//! Settlement batches.

use crate::domain::{AffiliateId, ConversionId, Decimal, SettlementId, TimeMs};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    Pending,
    Processing,
    Paid,
    Failed,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "pending",
            SettlementStatus::Processing => "processing",
            SettlementStatus::Paid => "paid",
            SettlementStatus::Failed => "failed",
        }
    }
}

impl FromStr for SettlementStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SettlementStatus::Pending),
            "processing" => Ok(SettlementStatus::Processing),
            "paid" => Ok(SettlementStatus::Paid),
            "failed" => Ok(SettlementStatus::Failed),
            other => Err(format!("unknown settlement status: {}", other)),
        }
    }
}

/// Who settled and what was included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettlementMetadata {
    pub settled_by: Option<String>,
    pub settled_at: Option<TimeMs>,
    pub conversion_ids: Vec<ConversionId>,
    pub note: Option<String>,
}

/// A payout batch. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: SettlementId,
    pub affiliate_id: AffiliateId,
    pub amount: Decimal,
    pub currency: String,
    pub status: SettlementStatus,
    pub period_start: Option<TimeMs>,
    pub period_end: Option<TimeMs>,
    pub metadata: SettlementMetadata,
    pub created_at: TimeMs,
}
