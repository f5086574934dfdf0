//! Commission ledger services.
//!
//! This module provides the `Ledger` service, which owns the business rules
//! on top of the repository and the commerce platform. Operations are
//! organized across submodules:
//! - `accounts.rs` - Affiliate accounts, settings and referral links
//! - `attribution.rs` - Order → conversion attribution
//! - `reconciliation.rs` - Capture/cancel transitions and live balance buckets
//! - `settlement.rs` - Paying out captured commission
//! - `stats.rs` - Time-series stats
//! - `promo.rs` - Affiliate promo codes backed by commerce promotions
//! - `backfill.rs` - Re-scanning promoted orders
//! - `events.rs` - Commerce event dispatch

pub mod accounts;
pub mod attribution;
pub mod backfill;
pub mod events;
pub mod promo;
pub mod reconciliation;
pub mod settlement;
pub mod stats;

pub use accounts::{AffiliateUpdate, NewAccount};
pub use attribution::{AttributionOutcome, SkipReason};
pub use backfill::BackfillReport;
pub use events::{dispatch, EventEnvelope, LedgerEvent};
pub use promo::{BulkGenerateReport, CreatePromoCode};
pub use reconciliation::{Buckets, LiveBalance};
pub use stats::{DayStats, GlobalStats, Stats, StatsTotals, StatsWindow};

use crate::commerce::{CommerceError, CommercePlatform};
use crate::config::Config;
use crate::db::Repository;
use crate::domain::{Decimal, InvalidTransition};
use crate::notify::Notifier;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("commerce platform error: {0}")]
    Commerce(#[from] CommerceError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("nothing to settle")]
    NothingToSettle,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("{0}")]
    Invalid(String),
}

/// The subset of configuration the ledger rules depend on.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub default_commission_rate: Decimal,
    pub settlement_currency: String,
    pub stats_max_days: i64,
    pub welcome_discount_percent: Decimal,
    pub storefront_url: Option<String>,
}

impl From<&Config> for LedgerConfig {
    fn from(config: &Config) -> Self {
        Self {
            default_commission_rate: config.default_commission_rate,
            settlement_currency: config.settlement_currency.clone(),
            stats_max_days: config.stats_max_days,
            welcome_discount_percent: config.welcome_discount_percent,
            storefront_url: config.storefront_url.clone(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_commission_rate: Decimal::new(rust_decimal::Decimal::new(1, 1)),
            settlement_currency: "twd".to_string(),
            stats_max_days: 366,
            welcome_discount_percent: Decimal::from(10),
            storefront_url: None,
        }
    }
}

/// Ledger service shared by the HTTP handlers and the event dispatcher.
#[derive(Debug, Clone)]
pub struct Ledger {
    repo: Arc<Repository>,
    commerce: Arc<dyn CommercePlatform>,
    notifier: Arc<dyn Notifier>,
    config: LedgerConfig,
}

impl Ledger {
    pub fn new(
        repo: Arc<Repository>,
        commerce: Arc<dyn CommercePlatform>,
        notifier: Arc<dyn Notifier>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            repo,
            commerce,
            notifier,
            config,
        }
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::commerce::MockCommercePlatform;
    use crate::db::migrations::init_db;
    use crate::domain::{
        Affiliate, AffiliateStatus, NewAffiliate, OrderId, OrderSnapshot, Role, TimeMs,
    };
    use crate::notify::LogNotifier;
    use tempfile::TempDir;

    pub struct Harness {
        pub ledger: Ledger,
        pub commerce: Arc<MockCommercePlatform>,
        _temp: TempDir,
    }

    pub async fn harness() -> Harness {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("ledger.db").to_string_lossy().to_string();
        let pool = init_db(&db_path).await.unwrap();
        let commerce = Arc::new(MockCommercePlatform::new());
        let ledger = Ledger::new(
            Arc::new(Repository::new(pool)),
            commerce.clone(),
            Arc::new(LogNotifier),
            LedgerConfig::default(),
        );
        Harness {
            ledger,
            commerce,
            _temp: temp,
        }
    }

    impl Harness {
        pub async fn affiliate(&self, code: &str, status: AffiliateStatus) -> Affiliate {
            self.ledger
                .repo()
                .insert_affiliate(&NewAffiliate {
                    email: format!("{}@example.com", code.to_ascii_lowercase()),
                    password_hash: "x".to_string(),
                    name: None,
                    code: code.to_string(),
                    status,
                    role: Role::User,
                    commission_rate: Decimal::from_str_canonical("0.1").unwrap(),
                })
                .await
                .unwrap()
        }
    }

    pub fn order(id: &str, total: i64) -> OrderSnapshot {
        OrderSnapshot {
            id: OrderId::new(id),
            display_id: Some(1),
            currency_code: "twd".to_string(),
            total: Decimal::from(total),
            subtotal: Decimal::from(total),
            discount_total: Decimal::zero(),
            shipping_total: Decimal::zero(),
            metadata: serde_json::json!({}),
            promotions: vec![],
            created_at: TimeMs::now(),
            canceled: false,
            payment_captured: false,
        }
    }
}
