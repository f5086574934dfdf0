//! Domain types for the affiliate commission ledger.
//!
//! This module provides:
//! - Lossless money handling via the Decimal wrapper
//! - Domain primitives: TimeMs and prefixed record ids
//! - Affiliate, link, click, conversion and settlement records
//! - The conversion status state machine
//! - Read models of commerce orders and promotions

pub mod affiliate;
pub mod conversion;
pub mod decimal;
pub mod link;
pub mod order;
pub mod primitives;
pub mod settlement;

pub use affiliate::{
    Affiliate, AffiliateSettings, AffiliateStatus, NewAffiliate, Role, SettingsPatch,
};
pub use conversion::{
    Conversion, ConversionMetadata, ConversionStatus, InvalidTransition, NewConversion, SourceType,
};
pub use decimal::Decimal;
pub use link::{AffiliateClick, AffiliateLink, ClickContext};
pub use order::{
    AppliedPromotion, LinkRef, NewPromoCode, OrderSnapshot, OrderState, PromoCode,
    PromoCodeUpdate,
};
pub use primitives::{AffiliateId, ClickId, ConversionId, LinkId, OrderId, SettlementId, TimeMs};
pub use settlement::{Settlement, SettlementMetadata, SettlementStatus};
