//! Re-scan of orders that carry affiliate promotions.
//!
//! Recovers conversions whose `order.placed` event was lost, then brings
//! every scanned order's conversions in line with its capture and cancel
//! state.

use super::{AttributionOutcome, Ledger, LedgerError};
use crate::domain::{ConversionStatus, OrderSnapshot};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    pub scanned: usize,
    pub created: usize,
    pub captured: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Ledger {
    pub async fn backfill(&self) -> Result<BackfillReport, LedgerError> {
        let orders = self.commerce.list_promoted_orders().await?;
        let mut report = BackfillReport::default();

        for order in &orders {
            report.scanned += 1;
            if let Err(e) = self.backfill_order(order, &mut report).await {
                warn!(order_id = %order.id, error = %e, "Backfill failed for order");
                report.failed += 1;
            }
        }

        info!(
            scanned = report.scanned,
            created = report.created,
            captured = report.captured,
            cancelled = report.cancelled,
            skipped = report.skipped,
            failed = report.failed,
            "Backfill finished"
        );
        Ok(report)
    }

    async fn backfill_order(
        &self,
        order: &OrderSnapshot,
        report: &mut BackfillReport,
    ) -> Result<(), LedgerError> {
        match self.attribute(order, true).await? {
            AttributionOutcome::Created(_) => report.created += 1,
            AttributionOutcome::Skipped(_) => report.skipped += 1,
        }

        if order.canceled {
            report.cancelled += self.cancel_order(&order.id).await?;
        } else if order.payment_captured {
            let moved = self
                .repo
                .transition_order_conversions(&order.id, ConversionStatus::Captured)
                .await?;
            report.captured += moved.transitioned.len();
        }
        Ok(())
    }
}
