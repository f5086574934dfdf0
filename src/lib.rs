pub mod api;
pub mod auth;
pub mod commerce;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod ledger;
pub mod notify;

pub use commerce::{CommerceError, CommercePlatform, HttpCommercePlatform, MockCommercePlatform};
pub use config::Config;
pub use db::{init_db, Repository};
pub use domain::{
    Affiliate, AffiliateStatus, Conversion, ConversionStatus, Decimal, OrderId, Settlement, TimeMs,
};
pub use error::AppError;
pub use ledger::{Ledger, LedgerConfig, LedgerError};
pub use notify::{LogNotifier, Notifier};
