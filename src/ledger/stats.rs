//! Time-series stats over clicks and conversions.

use super::{Ledger, LedgerError};
use crate::db::{ClickDay, ConversionPoint};
use crate::domain::{AffiliateId, Decimal, TimeMs};
use chrono::{Duration, NaiveDate};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

const DEFAULT_WINDOW_DAYS: i64 = 30;
const DATE_FORMAT: &str = "%Y-%m-%d";

/// An inclusive range of UTC days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl StatsWindow {
    /// Defaults to the last 30 days ending `today`.
    ///
    /// # Errors
    /// `Invalid` when `from > to` or the window is longer than `max_days`.
    pub fn resolve(
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        today: NaiveDate,
        max_days: i64,
    ) -> Result<Self, LedgerError> {
        let to = to.unwrap_or(today);
        let from = from.unwrap_or_else(|| to - Duration::days(DEFAULT_WINDOW_DAYS - 1));

        if from > to {
            return Err(LedgerError::Invalid("from must not be after to".to_string()));
        }
        let window = StatsWindow { from, to };
        if window.len_days() > max_days {
            return Err(LedgerError::Invalid(format!(
                "date range must not exceed {} days",
                max_days
            )));
        }
        Ok(window)
    }

    pub fn len_days(&self) -> i64 {
        (self.to - self.from).num_days() + 1
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let to = self.to;
        self.from.iter_days().take_while(move |d| *d <= to)
    }

    pub fn start(&self) -> TimeMs {
        TimeMs::start_of_day(self.from)
    }

    pub fn end(&self) -> TimeMs {
        TimeMs::end_of_day(self.to)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsTotals {
    pub clicks: i64,
    pub conversions: i64,
    pub revenue: Decimal,
    pub commission: Decimal,
    /// conversions / clicks, four decimal places; zero without clicks.
    pub conversion_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayStats {
    pub date: String,
    pub clicks: i64,
    pub conversions: i64,
    pub revenue: Decimal,
    pub commission: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub from: String,
    pub to: String,
    pub totals: StatsTotals,
    pub daily: Vec<DayStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    #[serde(flatten)]
    pub stats: Stats,
    pub affiliates_by_status: BTreeMap<String, i64>,
    pub total_paid_out: Decimal,
}

impl Ledger {
    /// Stats for one affiliate, or for everyone when `affiliate_id` is None.
    pub async fn compute_stats(
        &self,
        affiliate_id: Option<&AffiliateId>,
        window: StatsWindow,
    ) -> Result<Stats, LedgerError> {
        let clicks = self
            .repo
            .click_counts_by_day(affiliate_id, window.start(), window.end())
            .await?;
        let points = self
            .repo
            .conversion_points(affiliate_id, window.start(), window.end())
            .await?;
        Ok(build_stats(window, &clicks, &points))
    }

    pub async fn global_stats(&self, window: StatsWindow) -> Result<GlobalStats, LedgerError> {
        let stats = self.compute_stats(None, window).await?;
        let affiliates_by_status = self
            .repo
            .count_affiliates_by_status()
            .await?
            .into_iter()
            .map(|(status, n)| (status.as_str().to_string(), n))
            .collect();
        let total_paid_out = self.repo.total_paid_out().await?;

        Ok(GlobalStats {
            stats,
            affiliates_by_status,
            total_paid_out,
        })
    }

    /// Resolve a window against today's date and the configured cap.
    pub fn stats_window(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<StatsWindow, LedgerError> {
        let today = TimeMs::now()
            .utc_date()
            .ok_or_else(|| LedgerError::Invalid("clock out of range".to_string()))?;
        StatsWindow::resolve(from, to, today, self.config.stats_max_days)
    }
}

/// Fold grouped rows into a zero-filled daily series plus totals.
pub fn build_stats(window: StatsWindow, clicks: &[ClickDay], points: &[ConversionPoint]) -> Stats {
    let mut by_day: HashMap<String, DayStats> = window
        .days()
        .map(|d| {
            let date = d.format(DATE_FORMAT).to_string();
            (
                date.clone(),
                DayStats {
                    date,
                    clicks: 0,
                    conversions: 0,
                    revenue: Decimal::zero(),
                    commission: Decimal::zero(),
                },
            )
        })
        .collect();

    for click in clicks {
        if let Some(day) = by_day.get_mut(&click.day) {
            day.clicks += click.clicks;
        }
    }
    for point in points {
        if let Some(day) = by_day.get_mut(&point.day) {
            day.conversions += 1;
            day.revenue += point.order_amount;
            day.commission += point.commission;
        }
    }

    let mut daily: Vec<DayStats> = by_day.into_values().collect();
    daily.sort_by(|a, b| a.date.cmp(&b.date));

    let mut totals = StatsTotals::default();
    for day in &daily {
        totals.clicks += day.clicks;
        totals.conversions += day.conversions;
        totals.revenue += day.revenue;
        totals.commission += day.commission;
    }
    if totals.clicks > 0 {
        totals.conversion_rate =
            (Decimal::from(totals.conversions) / Decimal::from(totals.clicks)).round_dp(4);
    }

    Stats {
        from: window.from.format(DATE_FORMAT).to_string(),
        to: window.to.format(DATE_FORMAT).to_string(),
        totals,
        daily,
    }
}
