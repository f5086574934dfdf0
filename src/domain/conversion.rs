//! Conversions: the money-bearing ledger entries, and their status state machine.

use crate::domain::{AffiliateId, ConversionId, Decimal, LinkId, OrderId, SettlementId, TimeMs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle of a conversion.
///
/// ```text
/// pending ──capture──▶ captured ──settle──▶ paid
///    │                    │
///    └──────cancel────────┴──▶ cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionStatus {
    Pending,
    Captured,
    Paid,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid conversion transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ConversionStatus,
    pub to: ConversionStatus,
}

impl ConversionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionStatus::Pending => "pending",
            ConversionStatus::Captured => "captured",
            ConversionStatus::Paid => "paid",
            ConversionStatus::Cancelled => "cancelled",
        }
    }

    /// No automated transition leaves these states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConversionStatus::Paid | ConversionStatus::Cancelled)
    }

    /// The single table of legal edges. Every mutation path consults it.
    pub fn can_transition_to(&self, next: ConversionStatus) -> bool {
        use ConversionStatus::*;
        matches!(
            (self, next),
            (Pending, Captured) | (Pending, Cancelled) | (Captured, Cancelled) | (Captured, Paid)
        )
    }

    /// Validate a single edge.
    pub fn transition(self, next: ConversionStatus) -> Result<ConversionStatus, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Validate a chain of edges, returning the final status.
    pub fn transition_through(
        self,
        steps: &[ConversionStatus],
    ) -> Result<ConversionStatus, InvalidTransition> {
        steps
            .iter()
            .try_fold(self, |current, next| current.transition(*next))
    }
}

impl fmt::Display for ConversionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            // Legacy rows used "confirmed" for placed-but-uncaptured orders.
            "pending" | "confirmed" => Ok(ConversionStatus::Pending),
            "captured" => Ok(ConversionStatus::Captured),
            "paid" => Ok(ConversionStatus::Paid),
            "cancelled" | "canceled" => Ok(ConversionStatus::Cancelled),
            other => Err(format!("unknown conversion status: {}", other)),
        }
    }
}

/// Which referral channel produced the conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Link,
    PromoCode,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Link => "link",
            SourceType::PromoCode => "promo_code",
        }
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "link" => Ok(SourceType::Link),
            "promo_code" => Ok(SourceType::PromoCode),
            other => Err(format!("unknown source type: {}", other)),
        }
    }
}

/// Order snapshot and audit stamps kept alongside a conversion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promotion_id: Option<String>,
    /// Rate in effect when the commission was computed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commission_rate: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commission_base: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_created_at: Option<TimeMs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<TimeMs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<TimeMs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<TimeMs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_id: Option<SettlementId>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub backfilled: bool,
}

impl ConversionMetadata {
    /// Record the time a status was entered.
    pub fn stamp(&mut self, status: ConversionStatus, at: TimeMs) {
        match status {
            ConversionStatus::Pending => {}
            ConversionStatus::Captured => self.captured_at = Some(at),
            ConversionStatus::Paid => self.paid_at = Some(at),
            ConversionStatus::Cancelled => self.cancelled_at = Some(at),
        }
    }
}

/// A commission ledger entry tying one order to one affiliate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversion {
    pub id: ConversionId,
    pub affiliate_id: AffiliateId,
    pub link_id: Option<LinkId>,
    pub order_id: Option<OrderId>,
    pub order_amount: Decimal,
    /// Fixed at creation; never recomputed.
    pub commission: Decimal,
    pub status: ConversionStatus,
    pub source_type: SourceType,
    pub promo_code: Option<String>,
    pub metadata: ConversionMetadata,
    pub created_at: TimeMs,
    pub updated_at: TimeMs,
}

/// Fields required to record a new conversion.
#[derive(Debug, Clone)]
pub struct NewConversion {
    pub affiliate_id: AffiliateId,
    pub link_id: Option<LinkId>,
    pub order_id: OrderId,
    pub order_amount: Decimal,
    pub commission: Decimal,
    pub source_type: SourceType,
    pub promo_code: Option<String>,
    pub metadata: ConversionMetadata,
}
