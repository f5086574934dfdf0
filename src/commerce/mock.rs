//! In-memory commerce platform for testing without network calls.

use super::{CommerceError, CommercePlatform};
use crate::domain::{
    AffiliateId, NewPromoCode, OrderId, OrderSnapshot, OrderState, PromoCode, PromoCodeUpdate,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct MockState {
    orders: HashMap<OrderId, OrderSnapshot>,
    payments: HashMap<String, OrderId>,
    promotions: Vec<PromoCode>,
    fail_order_states: bool,
    fail_promotion_writes: bool,
}

/// Mock commerce platform holding orders, payments and promotions in memory.
///
/// Tests mutate it after construction to simulate capture and cancellation.
#[derive(Debug, Default)]
pub struct MockCommercePlatform {
    state: Mutex<MockState>,
}

impl MockCommercePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an order.
    pub fn with_order(self, order: OrderSnapshot) -> Self {
        self.put_order(order);
        self
    }

    /// Link a payment id to an order.
    pub fn with_payment(self, payment_id: &str, order_id: &OrderId) -> Self {
        self.put_payment(payment_id, order_id);
        self
    }

    /// Add an existing promotion.
    pub fn with_promotion(self, promo: PromoCode) -> Self {
        self.lock().promotions.push(promo);
        self
    }

    /// Insert or replace an order.
    pub fn put_order(&self, order: OrderSnapshot) {
        self.lock().orders.insert(order.id.clone(), order);
    }

    pub fn put_payment(&self, payment_id: &str, order_id: &OrderId) {
        self.lock()
            .payments
            .insert(payment_id.to_string(), order_id.clone());
    }

    /// Mark an order's payment as captured.
    pub fn capture_order(&self, id: &OrderId) {
        if let Some(order) = self.lock().orders.get_mut(id) {
            order.payment_captured = true;
        }
    }

    /// Mark an order as canceled.
    pub fn cancel_order(&self, id: &OrderId) {
        if let Some(order) = self.lock().orders.get_mut(id) {
            order.canceled = true;
        }
    }

    /// Make batch order-state lookups fail.
    pub fn set_order_states_failing(&self, failing: bool) {
        self.lock().fail_order_states = failing;
    }

    /// Make promotion writes fail.
    pub fn set_promotion_writes_failing(&self, failing: bool) {
        self.lock().fail_promotion_writes = failing;
    }

    /// All promotions, in creation order.
    pub fn promotions(&self) -> Vec<PromoCode> {
        self.lock().promotions.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CommercePlatform for MockCommercePlatform {
    async fn get_order(&self, id: &OrderId) -> Result<Option<OrderSnapshot>, CommerceError> {
        Ok(self.lock().orders.get(id).cloned())
    }

    async fn order_id_for_payment(
        &self,
        payment_id: &str,
    ) -> Result<Option<OrderId>, CommerceError> {
        Ok(self.lock().payments.get(payment_id).cloned())
    }

    async fn order_states(
        &self,
        ids: &[OrderId],
    ) -> Result<HashMap<OrderId, OrderState>, CommerceError> {
        let state = self.lock();
        if state.fail_order_states {
            return Err(CommerceError::HttpError {
                status: 503,
                message: "Server error".to_string(),
            });
        }
        Ok(ids
            .iter()
            .filter_map(|id| state.orders.get(id).map(|o| (id.clone(), o.state())))
            .collect())
    }

    async fn list_promotions(
        &self,
        affiliate_id: Option<&AffiliateId>,
    ) -> Result<Vec<PromoCode>, CommerceError> {
        Ok(self
            .lock()
            .promotions
            .iter()
            .filter(|p| affiliate_id.map_or(true, |id| &p.affiliate_id == id))
            .cloned()
            .collect())
    }

    async fn create_promotion(&self, new: &NewPromoCode) -> Result<PromoCode, CommerceError> {
        let mut state = self.lock();
        if state.fail_promotion_writes {
            return Err(CommerceError::Other("promotion writes disabled".to_string()));
        }
        if state.promotions.iter().any(|p| p.code == new.code) {
            return Err(CommerceError::HttpError {
                status: 400,
                message: format!("Promotion with code {} already exists", new.code),
            });
        }

        let promo = PromoCode {
            id: format!("promo_{}", state.promotions.len() + 1),
            code: new.code.clone(),
            affiliate_id: new.affiliate_id.clone(),
            commission_rate: new.commission_rate,
            discount_percent: Some(new.discount_percent),
            active: true,
        };
        state.promotions.push(promo.clone());
        Ok(promo)
    }

    async fn update_promotion(
        &self,
        id: &str,
        update: &PromoCodeUpdate,
    ) -> Result<Option<PromoCode>, CommerceError> {
        let mut state = self.lock();
        if state.fail_promotion_writes {
            return Err(CommerceError::Other("promotion writes disabled".to_string()));
        }
        let Some(promo) = state.promotions.iter_mut().find(|p| p.id == id) else {
            return Ok(None);
        };

        if let Some(code) = &update.code {
            promo.code = code.clone();
        }
        if let Some(rate) = update.commission_rate {
            promo.commission_rate = Some(rate);
        }
        if let Some(percent) = update.discount_percent {
            promo.discount_percent = Some(percent);
        }
        if let Some(active) = update.active {
            promo.active = active;
        }
        Ok(Some(promo.clone()))
    }

    async fn list_promoted_orders(&self) -> Result<Vec<OrderSnapshot>, CommerceError> {
        let mut orders: Vec<OrderSnapshot> = self
            .lock()
            .orders
            .values()
            .filter(|o| o.affiliate_promotions().next().is_some())
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(orders)
    }
}
