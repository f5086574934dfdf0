//! Commerce event dispatch.
//!
//! Each event runs on its own task. Failures are logged and left for
//! redelivery or the backfill tool; they never reach the sender.

use super::{Ledger, LedgerError};
use crate::domain::OrderId;
use serde::Deserialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Wire shape of an inbound event: `{"event": "...", "data": {"id": "..."}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub event: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    OrderPlaced(OrderId),
    /// Carries the payment id, not the order id.
    PaymentCaptured(String),
    OrderCanceled(OrderId),
}

impl LedgerEvent {
    /// None for event names the ledger does not subscribe to.
    pub fn from_envelope(envelope: EventEnvelope) -> Option<Self> {
        let id = envelope.data.id.trim().to_string();
        if id.is_empty() {
            return None;
        }
        match envelope.event.as_str() {
            "order.placed" => Some(LedgerEvent::OrderPlaced(OrderId::new(id))),
            "payment.captured" => Some(LedgerEvent::PaymentCaptured(id)),
            "order.canceled" => Some(LedgerEvent::OrderCanceled(OrderId::new(id))),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::OrderPlaced(_) => "order.placed",
            LedgerEvent::PaymentCaptured(_) => "payment.captured",
            LedgerEvent::OrderCanceled(_) => "order.canceled",
        }
    }
}

impl Ledger {
    pub async fn handle_event(&self, event: &LedgerEvent) -> Result<(), LedgerError> {
        debug!(event = event.name(), "Handling event");
        match event {
            LedgerEvent::OrderPlaced(order_id) => {
                self.attribute_order(order_id).await?;
            }
            LedgerEvent::PaymentCaptured(payment_id) => {
                self.capture_payment(payment_id).await?;
            }
            LedgerEvent::OrderCanceled(order_id) => {
                self.cancel_order(order_id).await?;
            }
        }
        Ok(())
    }
}

/// Run an event on a background task.
pub fn dispatch(ledger: Arc<Ledger>, event: LedgerEvent) -> JoinHandle<()> {
    tokio::spawn(async move {
        match ledger.handle_event(&event).await {
            Ok(()) => info!(event = event.name(), "Event handled"),
            Err(e) => error!(event = event.name(), error = %e, "Event handler failed"),
        }
    })
}
