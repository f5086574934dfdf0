//! Affiliate accounts: status, role and self-service settings.

use crate::domain::{AffiliateId, Decimal, TimeMs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Account review status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AffiliateStatus {
    /// Registered, awaiting review.
    Pending,
    /// Approved; earns commission.
    Active,
    /// Application declined.
    Rejected,
    /// Previously active, access revoked.
    Suspended,
}

impl AffiliateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AffiliateStatus::Pending => "pending",
            AffiliateStatus::Active => "active",
            AffiliateStatus::Rejected => "rejected",
            AffiliateStatus::Suspended => "suspended",
        }
    }

    /// Whether an account in this status may use authenticated endpoints.
    pub fn may_sign_in(&self) -> bool {
        matches!(self, AffiliateStatus::Pending | AffiliateStatus::Active)
    }

    /// Admin-driven status changes. Nothing moves back to `pending`.
    pub fn can_transition_to(&self, next: AffiliateStatus) -> bool {
        *self == next || next != AffiliateStatus::Pending
    }
}

impl fmt::Display for AffiliateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AffiliateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(AffiliateStatus::Pending),
            "active" => Ok(AffiliateStatus::Active),
            "rejected" => Ok(AffiliateStatus::Rejected),
            "suspended" => Ok(AffiliateStatus::Suspended),
            other => Err(format!("unknown affiliate status: {}", other)),
        }
    }
}

/// Access role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Self-service preferences stored as JSON on the affiliate row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AffiliateSettings {
    /// e.g. "bank_transfer", "paypal".
    pub payout_method: Option<String>,
    pub payout_account: Option<String>,
    pub notify_on_conversion: bool,
    pub notify_on_settlement: bool,
}

impl Default for AffiliateSettings {
    fn default() -> Self {
        Self {
            payout_method: None,
            payout_account: None,
            notify_on_conversion: true,
            notify_on_settlement: true,
        }
    }
}

/// Partial settings update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub payout_method: Option<String>,
    pub payout_account: Option<String>,
    pub notify_on_conversion: Option<bool>,
    pub notify_on_settlement: Option<bool>,
}

impl AffiliateSettings {
    pub fn apply(&mut self, patch: SettingsPatch) {
        if let Some(method) = patch.payout_method {
            self.payout_method = Some(method).filter(|m| !m.trim().is_empty());
        }
        if let Some(account) = patch.payout_account {
            self.payout_account = Some(account).filter(|a| !a.trim().is_empty());
        }
        if let Some(flag) = patch.notify_on_conversion {
            self.notify_on_conversion = flag;
        }
        if let Some(flag) = patch.notify_on_settlement {
            self.notify_on_settlement = flag;
        }
    }
}

/// An affiliate account as stored in the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct Affiliate {
    pub id: AffiliateId,
    pub email: String,
    pub password_hash: String,
    pub name: Option<String>,
    /// Referral code, unique among live accounts.
    pub code: String,
    /// Projection of unpaid, non-cancelled commission. Not authoritative.
    pub balance: Decimal,
    /// Projection of all non-cancelled commission ever earned. Not authoritative.
    pub total_earnings: Decimal,
    pub status: AffiliateStatus,
    pub role: Role,
    pub commission_rate: Decimal,
    pub settings: AffiliateSettings,
    pub metadata: serde_json::Value,
    pub created_at: TimeMs,
    pub updated_at: TimeMs,
}

impl Affiliate {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Fields required to create an affiliate.
#[derive(Debug, Clone)]
pub struct NewAffiliate {
    pub email: String,
    pub password_hash: String,
    pub name: Option<String>,
    pub code: String,
    pub status: AffiliateStatus,
    pub role: Role,
    pub commission_rate: Decimal,
}

/// Normalize an email for uniqueness checks.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// Referral and link codes: uppercase alphanumerics plus `-`/`_`, 3..=32 chars.
pub fn normalize_code(code: &str) -> Option<String> {
    let code = code.trim().to_ascii_uppercase();
    let valid = (3..=32).contains(&code.len())
        && code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then_some(code)
}

/// Random 8-character referral code.
pub fn generate_code() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            AffiliateStatus::Pending,
            AffiliateStatus::Active,
            AffiliateStatus::Rejected,
            AffiliateStatus::Suspended,
        ] {
            assert_eq!(AffiliateStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(AffiliateStatus::from_str("deleted").is_err());
    }

    #[test]
    fn test_status_never_returns_to_pending() {
        assert!(AffiliateStatus::Pending.can_transition_to(AffiliateStatus::Active));
        assert!(AffiliateStatus::Active.can_transition_to(AffiliateStatus::Suspended));
        assert!(AffiliateStatus::Suspended.can_transition_to(AffiliateStatus::Active));
        assert!(!AffiliateStatus::Active.can_transition_to(AffiliateStatus::Pending));
        assert!(AffiliateStatus::Pending.can_transition_to(AffiliateStatus::Pending));
    }

    #[test]
    fn test_only_pending_and_active_may_sign_in() {
        assert!(AffiliateStatus::Pending.may_sign_in());
        assert!(AffiliateStatus::Active.may_sign_in());
        assert!(!AffiliateStatus::Suspended.may_sign_in());
        assert!(!AffiliateStatus::Rejected.may_sign_in());
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code(" ref123 "), Some("REF123".to_string()));
        assert_eq!(normalize_code("ab"), None);
        assert_eq!(normalize_code("has space"), None);
        assert_eq!(normalize_code("SUMMER-2024_A"), Some("SUMMER-2024_A".to_string()));
    }

    #[test]
    fn test_generated_code_is_valid() {
        let code = generate_code();
        assert_eq!(code.len(), 8);
        assert_eq!(normalize_code(&code), Some(code.clone()));
    }

    #[test]
    fn test_settings_patch_merges() {
        let mut settings = AffiliateSettings::default();
        settings.apply(SettingsPatch {
            payout_method: Some("bank_transfer".to_string()),
            notify_on_conversion: Some(false),
            ..Default::default()
        });
        assert_eq!(settings.payout_method.as_deref(), Some("bank_transfer"));
        assert!(!settings.notify_on_conversion);
        assert!(settings.notify_on_settlement);

        settings.apply(SettingsPatch {
            payout_method: Some("  ".to_string()),
            ..Default::default()
        });
        assert!(settings.payout_method.is_none());
    }
}
