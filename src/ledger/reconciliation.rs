//! Reconciliation of conversions against payment and cancellation state.

use super::{Ledger, LedgerError};
use crate::domain::{AffiliateId, Conversion, ConversionStatus, Decimal, OrderId, OrderState};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Non-cancelled conversions sorted by where their money currently stands.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Buckets {
    pub pending: Vec<Conversion>,
    pub captured: Vec<Conversion>,
    pub paid: Vec<Conversion>,
}

/// Live per-bucket commission totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveBalance {
    pub pending: Decimal,
    pub captured: Decimal,
    pub paid: Decimal,
    /// pending + captured
    pub balance: Decimal,
    /// pending + captured + paid
    pub total_earnings: Decimal,
}

impl Buckets {
    /// Bucket conversions using the live order states.
    ///
    /// `states` is None when the lookup failed; every conversion then falls
    /// back to its own stored status, as does any conversion whose order is
    /// missing from `states`. Otherwise the order's payment state decides
    /// between pending and captured. Conversions whose order is canceled are
    /// dropped even if the cancel event has not been processed yet.
    pub fn from_conversions(
        conversions: Vec<Conversion>,
        states: Option<&HashMap<OrderId, OrderState>>,
    ) -> Self {
        let mut buckets = Buckets::default();

        for conversion in conversions {
            let state = states.and_then(|s| {
                conversion
                    .order_id
                    .as_ref()
                    .and_then(|order_id| s.get(order_id))
            });

            if state.is_some_and(|s| s.canceled) {
                continue;
            }
            let status = conversion.status;
            match status {
                ConversionStatus::Cancelled => {}
                ConversionStatus::Paid => buckets.paid.push(conversion),
                ConversionStatus::Pending | ConversionStatus::Captured => match state {
                    Some(s) if s.captured => buckets.captured.push(conversion),
                    Some(_) => buckets.pending.push(conversion),
                    None if status == ConversionStatus::Captured => {
                        buckets.captured.push(conversion)
                    }
                    None => buckets.pending.push(conversion),
                },
            }
        }

        buckets
    }

    pub fn totals(&self) -> LiveBalance {
        let sum = |items: &[Conversion]| items.iter().map(|c| c.commission).sum::<Decimal>();
        let pending = sum(&self.pending);
        let captured = sum(&self.captured);
        let paid = sum(&self.paid);
        LiveBalance {
            pending,
            captured,
            paid,
            balance: pending + captured,
            total_earnings: pending + captured + paid,
        }
    }
}

impl Ledger {
    /// Handle a captured payment by resolving it to its order.
    pub async fn capture_payment(&self, payment_id: &str) -> Result<usize, LedgerError> {
        match self.commerce.order_id_for_payment(payment_id).await? {
            Some(order_id) => self.capture_order(&order_id).await,
            None => {
                info!(payment_id, "Payment has no order, nothing to capture");
                Ok(0)
            }
        }
    }

    /// Move an order's pending conversions to captured, if the platform agrees
    /// the payment is captured and the order is not canceled.
    ///
    /// Returns the number of conversions moved.
    pub async fn capture_order(&self, order_id: &OrderId) -> Result<usize, LedgerError> {
        let states = self
            .commerce
            .order_states(std::slice::from_ref(order_id))
            .await?;
        let Some(state) = states.get(order_id) else {
            info!(order_id = %order_id, "Order not found, capture skipped");
            return Ok(0);
        };
        if state.canceled {
            debug!(order_id = %order_id, "Order canceled, capture skipped");
            return Ok(0);
        }
        if !state.captured {
            debug!(order_id = %order_id, "Payment not captured yet, capture skipped");
            return Ok(0);
        }

        let report = self
            .repo
            .transition_order_conversions(order_id, ConversionStatus::Captured)
            .await?;
        for (conversion_id, e) in &report.rejected {
            debug!(order_id = %order_id, conversion_id = %conversion_id, reason = %e, "Capture not applied");
        }
        for conversion in &report.transitioned {
            info!(
                order_id = %order_id,
                conversion_id = %conversion.id,
                affiliate_id = %conversion.affiliate_id,
                commission = %conversion.commission,
                "Conversion captured"
            );
        }
        Ok(report.transitioned.len())
    }

    /// Cancel an order's live conversions, reversing their commission.
    ///
    /// Paid conversions are left alone. Returns the number cancelled.
    pub async fn cancel_order(&self, order_id: &OrderId) -> Result<usize, LedgerError> {
        let report = self
            .repo
            .transition_order_conversions(order_id, ConversionStatus::Cancelled)
            .await?;
        for (conversion_id, e) in &report.rejected {
            warn!(
                order_id = %order_id,
                conversion_id = %conversion_id,
                reason = %e,
                "Canceled order has a conversion that cannot be cancelled"
            );
        }
        for conversion in &report.transitioned {
            info!(
                order_id = %order_id,
                conversion_id = %conversion.id,
                affiliate_id = %conversion.affiliate_id,
                commission = %conversion.commission,
                "Conversion cancelled"
            );
        }
        Ok(report.transitioned.len())
    }

    /// Bucket an affiliate's conversions against live order state.
    ///
    /// For display: a failed order lookup falls back to stored statuses.
    pub async fn live_buckets(&self, affiliate_id: &AffiliateId) -> Result<Buckets, LedgerError> {
        let conversions = self.repo.list_open_conversions(Some(affiliate_id)).await?;
        let order_ids = unsettled_order_ids(&conversions);
        if order_ids.is_empty() {
            return Ok(Buckets::from_conversions(conversions, None));
        }

        match self.commerce.order_states(&order_ids).await {
            Ok(states) => Ok(Buckets::from_conversions(conversions, Some(&states))),
            Err(e) => {
                warn!(
                    affiliate_id = %affiliate_id,
                    error = %e,
                    "Order state lookup failed, using stored conversion status"
                );
                Ok(Buckets::from_conversions(conversions, None))
            }
        }
    }

    /// Bucket an affiliate's conversions for a payout.
    ///
    /// Unlike [`Ledger::live_buckets`], a failed order lookup is an error:
    /// stored statuses may miss a cancellation the platform already knows.
    pub async fn settlable_buckets(
        &self,
        affiliate_id: &AffiliateId,
    ) -> Result<Buckets, LedgerError> {
        let conversions = self.repo.list_open_conversions(Some(affiliate_id)).await?;
        let order_ids = unsettled_order_ids(&conversions);
        if order_ids.is_empty() {
            return Ok(Buckets::from_conversions(conversions, None));
        }

        let states = self.commerce.order_states(&order_ids).await?;
        Ok(Buckets::from_conversions(conversions, Some(&states)))
    }

    /// Live balances of every affiliate with open conversions, bucketed with a
    /// single order state lookup. Affiliates without conversions are absent.
    pub async fn all_live_balances(&self) -> Result<HashMap<AffiliateId, LiveBalance>, LedgerError> {
        let conversions = self.repo.list_open_conversions(None).await?;
        let order_ids = unsettled_order_ids(&conversions);
        let states = if order_ids.is_empty() {
            None
        } else {
            match self.commerce.order_states(&order_ids).await {
                Ok(states) => Some(states),
                Err(e) => {
                    warn!(error = %e, "Order state lookup failed, using stored conversion status");
                    None
                }
            }
        };

        let mut by_affiliate: HashMap<AffiliateId, Vec<Conversion>> = HashMap::new();
        for conversion in conversions {
            by_affiliate
                .entry(conversion.affiliate_id.clone())
                .or_default()
                .push(conversion);
        }
        Ok(by_affiliate
            .into_iter()
            .map(|(id, conversions)| {
                (id, Buckets::from_conversions(conversions, states.as_ref()).totals())
            })
            .collect())
    }

    pub async fn live_balance(&self, affiliate_id: &AffiliateId) -> Result<LiveBalance, LedgerError> {
        Ok(self.live_buckets(affiliate_id).await?.totals())
    }
}

fn unsettled_order_ids(conversions: &[Conversion]) -> Vec<OrderId> {
    conversions
        .iter()
        .filter(|c| c.status != ConversionStatus::Paid)
        .filter_map(|c| c.order_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::domain::{
        AffiliateStatus, AppliedPromotion, ConversionId, ConversionMetadata, SourceType, TimeMs,
    };

    fn conversion(order: &str, status: ConversionStatus, commission: i64) -> Conversion {
        Conversion {
            id: ConversionId::new(format!("affconv_{}", order)),
            affiliate_id: AffiliateId::new("aff_1"),
            link_id: None,
            order_id: Some(OrderId::new(order)),
            order_amount: Decimal::from(commission * 10),
            commission: Decimal::from(commission),
            status,
            source_type: SourceType::Link,
            promo_code: None,
            metadata: ConversionMetadata::default(),
            created_at: TimeMs::new(0),
            updated_at: TimeMs::new(0),
        }
    }

    #[test]
    fn test_bucketing_against_live_state() {
        let conversions = vec![
            conversion("o_pending", ConversionStatus::Pending, 1),
            conversion("o_captured_live", ConversionStatus::Pending, 10),
            conversion("o_captured", ConversionStatus::Captured, 100),
            conversion("o_paid", ConversionStatus::Paid, 1000),
            conversion("o_canceled_live", ConversionStatus::Captured, 10000),
            conversion("o_uncaptured_live", ConversionStatus::Captured, 2),
        ];
        let states: HashMap<OrderId, OrderState> = [
            ("o_captured_live", OrderState { canceled: false, captured: true }),
            ("o_uncaptured_live", OrderState { canceled: false, captured: false }),
            ("o_canceled_live", OrderState { canceled: true, captured: true }),
        ]
        .into_iter()
        .map(|(id, s)| (OrderId::new(id), s))
        .collect();

        let totals = Buckets::from_conversions(conversions, Some(&states)).totals();
        assert_eq!(totals.pending, Decimal::from(3));
        assert_eq!(totals.captured, Decimal::from(110));
        assert_eq!(totals.paid, Decimal::from(1000));
        assert_eq!(totals.balance, Decimal::from(113));
        assert_eq!(totals.total_earnings, Decimal::from(1113));
    }

    #[test]
    fn test_bucketing_falls_back_to_stored_status() {
        let conversions = vec![
            conversion("o1", ConversionStatus::Pending, 1),
            conversion("o2", ConversionStatus::Captured, 10),
            conversion("o3", ConversionStatus::Cancelled, 100),
        ];
        let totals = Buckets::from_conversions(conversions, None).totals();
        assert_eq!(totals.pending, Decimal::from(1));
        assert_eq!(totals.captured, Decimal::from(10));
        assert_eq!(totals.total_earnings, Decimal::from(11));
    }

    async fn attributed(h: &Harness, code: &str, order_id: &str, total: i64) -> (AffiliateId, OrderId) {
        let a = h.affiliate(code, AffiliateStatus::Active).await;
        let mut o = order(order_id, total);
        o.promotions = vec![AppliedPromotion {
            id: "promo_1".to_string(),
            code: Some(code.to_string()),
            metadata: serde_json::json!({ "affiliate_id": a.id.as_str() }),
        }];
        h.commerce.put_order(o.clone());
        h.ledger.attribute(&o, false).await.unwrap();
        (a.id, o.id)
    }

    #[tokio::test]
    async fn test_capture_requires_captured_payment() {
        let h = harness().await;
        let (aff, order_id) = attributed(&h, "CAP", "order_1", 1000).await;

        assert_eq!(h.ledger.capture_order(&order_id).await.unwrap(), 0);

        h.commerce.capture_order(&order_id);
        assert_eq!(h.ledger.capture_order(&order_id).await.unwrap(), 1);
        // Redelivery is a no-op.
        assert_eq!(h.ledger.capture_order(&order_id).await.unwrap(), 0);

        let balance = h.ledger.live_balance(&aff).await.unwrap();
        assert_eq!(balance.captured, Decimal::from(100));
        assert_eq!(balance.pending, Decimal::zero());
    }

    #[tokio::test]
    async fn test_capture_via_payment_id() {
        let h = harness().await;
        let (_, order_id) = attributed(&h, "PAY", "order_1", 1000).await;
        h.commerce.capture_order(&order_id);
        h.commerce.put_payment("pay_1", &order_id);

        assert_eq!(h.ledger.capture_payment("pay_unknown").await.unwrap(), 0);
        assert_eq!(h.ledger.capture_payment("pay_1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancel_wins_over_capture() {
        let h = harness().await;
        let (aff, order_id) = attributed(&h, "RACE", "order_1", 1000).await;

        h.commerce.capture_order(&order_id);
        h.commerce.cancel_order(&order_id);
        assert_eq!(h.ledger.capture_order(&order_id).await.unwrap(), 0);

        assert_eq!(h.ledger.cancel_order(&order_id).await.unwrap(), 1);
        assert_eq!(h.ledger.cancel_order(&order_id).await.unwrap(), 0);

        let stored = h.ledger.repo().get_affiliate(&aff).await.unwrap().unwrap();
        assert_eq!(stored.balance, Decimal::zero());
        assert_eq!(stored.total_earnings, Decimal::zero());
    }

    #[tokio::test]
    async fn test_live_balance_survives_lookup_failure() {
        let h = harness().await;
        let (aff, order_id) = attributed(&h, "FLAKY", "order_1", 1000).await;
        h.commerce.capture_order(&order_id);
        h.commerce.set_order_states_failing(true);

        let balance = h.ledger.live_balance(&aff).await.unwrap();
        assert_eq!(balance.pending, Decimal::from(100));
        assert_eq!(balance.captured, Decimal::zero());
    }

    #[tokio::test]
    async fn test_settlable_buckets_fail_closed() {
        let h = harness().await;
        let (aff, order_id) = attributed(&h, "STRICT", "order_1", 1000).await;
        h.commerce.capture_order(&order_id);
        h.commerce.set_order_states_failing(true);

        assert!(matches!(
            h.ledger.settlable_buckets(&aff).await,
            Err(LedgerError::Commerce(_))
        ));

        h.commerce.set_order_states_failing(false);
        let buckets = h.ledger.settlable_buckets(&aff).await.unwrap();
        assert_eq!(buckets.captured.len(), 1);
    }

    #[tokio::test]
    async fn test_all_live_balances_match_per_affiliate() {
        let h = harness().await;
        let (first, first_order) = attributed(&h, "ONE", "order_1", 1000).await;
        let (second, _) = attributed(&h, "TWO", "order_2", 500).await;
        let idle = h.affiliate("IDLE", AffiliateStatus::Active).await;
        h.commerce.capture_order(&first_order);

        let all = h.ledger.all_live_balances().await.unwrap();
        assert_eq!(all[&first], h.ledger.live_balance(&first).await.unwrap());
        assert_eq!(all[&second], h.ledger.live_balance(&second).await.unwrap());
        assert_eq!(all[&first].captured, Decimal::from(100));
        assert_eq!(all[&second].pending, Decimal::from(50));
        assert!(!all.contains_key(&idle.id));
    }
}
