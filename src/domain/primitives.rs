//! Domain primitives: TimeMs and the prefixed record identifiers.

use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Time in milliseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeMs(pub i64);

impl TimeMs {
    /// Create a TimeMs from milliseconds.
    pub fn new(ms: i64) -> Self {
        TimeMs(ms)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        TimeMs(Utc::now().timestamp_millis())
    }

    /// Get the underlying milliseconds value.
    pub fn as_ms(&self) -> i64 {
        self.0
    }

    /// Alias of [`TimeMs::as_ms`] used when binding to SQL.
    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// UTC calendar day containing this instant.
    pub fn utc_date(&self) -> Option<NaiveDate> {
        Utc.timestamp_millis_opt(self.0)
            .single()
            .map(|dt| dt.date_naive())
    }

    /// First millisecond of `date` in UTC.
    pub fn start_of_day(date: NaiveDate) -> Self {
        let dt = date.and_time(NaiveTime::default()).and_utc();
        TimeMs(dt.timestamp_millis())
    }

    /// Last millisecond of `date` in UTC.
    pub fn end_of_day(date: NaiveDate) -> Self {
        TimeMs(Self::start_of_day(date).0 + 86_400_000 - 1)
    }
}

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Wrap an existing identifier.
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            /// Mint a fresh identifier with this record's prefix.
            pub fn generate() -> Self {
                $name(format!("{}_{}", $prefix, uuid::Uuid::new_v4().simple()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

record_id!(
    /// Affiliate account identifier.
    AffiliateId,
    "aff"
);
record_id!(
    /// Referral link identifier.
    LinkId,
    "afflink"
);
record_id!(
    /// Click event identifier.
    ClickId,
    "affclick"
);
record_id!(
    /// Conversion (commission ledger entry) identifier.
    ConversionId,
    "affconv"
);
record_id!(
    /// Settlement batch identifier.
    SettlementId,
    "affset"
);
record_id!(
    /// Order identifier owned by the commerce platform.
    OrderId,
    "order"
);
