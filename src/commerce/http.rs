//! Medusa admin API client implementation.

use super::{CommerceError, CommercePlatform};
use crate::domain::order::{is_captured_payment_status, META_AFFILIATE_ID, META_COMMISSION_RATE};
use crate::domain::{
    AffiliateId, AppliedPromotion, Decimal, NewPromoCode, OrderId, OrderSnapshot, OrderState,
    PromoCode, PromoCodeUpdate, TimeMs,
};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

const ORDER_FIELDS: &str = "id,display_id,currency_code,total,subtotal,discount_total,\
     shipping_total,metadata,created_at,canceled_at,status,payment_status,\
     *payment_collections,*promotions";
const ORDER_STATE_FIELDS: &str = "id,status,canceled_at,payment_status,*payment_collections";
const PROMOTION_FIELDS: &str = "id,code,status,metadata,*application_method";
const PAGE_SIZE: usize = 100;

/// Commerce platform backed by the Medusa admin REST API.
///
/// Reads are retried with exponential backoff. Writes are sent once.
#[derive(Debug, Clone)]
pub struct HttpCommercePlatform {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpCommercePlatform {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.basic_auth(key, None::<&str>),
            None => request,
        }
    }

    /// GET with retry. A 404 is not an error and yields None.
    async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<Value>, CommerceError> {
        let url = format!("{}{}", self.base_url, path);
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        retry(backoff, || async {
            let response = self
                .authorize(self.client.get(&url).query(query))
                .send()
                .await
                .map_err(|e| {
                    backoff::Error::transient(CommerceError::NetworkError(e.to_string()))
                })?;

            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(backoff::Error::transient(CommerceError::RateLimited));
            }
            if status.is_server_error() {
                return Err(backoff::Error::transient(CommerceError::HttpError {
                    status: status.as_u16(),
                    message: "Server error".to_string(),
                }));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(CommerceError::HttpError {
                    status: status.as_u16(),
                    message: "Client error".to_string(),
                }));
            }

            response
                .json::<Value>()
                .await
                .map(Some)
                .map_err(|e| backoff::Error::permanent(CommerceError::ParseError(e.to_string())))
        })
        .await
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, CommerceError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .authorize(self.client.post(&url).json(body))
            .send()
            .await
            .map_err(|e| CommerceError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CommerceError::RateLimited);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CommerceError::HttpError {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| CommerceError::ParseError(e.to_string()))
    }

    /// Walk a paginated admin list endpoint, returning every item under `key`.
    async fn get_all(
        &self,
        path: &str,
        key: &str,
        fields: &str,
    ) -> Result<Vec<Value>, CommerceError> {
        let mut items = Vec::new();
        let mut offset = 0usize;

        loop {
            let query = [
                ("fields", fields.to_string()),
                ("limit", PAGE_SIZE.to_string()),
                ("offset", offset.to_string()),
            ];
            let Some(page) = self.get_json(path, &query).await? else {
                break;
            };
            let batch = page
                .get(key)
                .and_then(|v| v.as_array())
                .ok_or_else(|| CommerceError::ParseError(format!("Missing {} array", key)))?;
            let fetched = batch.len();
            items.extend(batch.iter().cloned());

            let total = page.get("count").and_then(|v| v.as_u64()).map(|c| c as usize);
            offset += fetched;
            if fetched < PAGE_SIZE || total.is_some_and(|t| offset >= t) {
                break;
            }
        }

        Ok(items)
    }
}

#[async_trait]
impl CommercePlatform for HttpCommercePlatform {
    async fn get_order(&self, id: &OrderId) -> Result<Option<OrderSnapshot>, CommerceError> {
        debug!(order_id = %id, "Fetching order");
        let query = [("fields", ORDER_FIELDS.to_string())];
        let Some(response) = self
            .get_json(&format!("/admin/orders/{}", id), &query)
            .await?
        else {
            return Ok(None);
        };

        let order = response
            .get("order")
            .ok_or_else(|| CommerceError::ParseError("Missing order field".to_string()))?;
        parse_order(order).map(Some)
    }

    async fn order_id_for_payment(
        &self,
        payment_id: &str,
    ) -> Result<Option<OrderId>, CommerceError> {
        debug!(payment_id, "Resolving payment to order");
        let query = [(
            "fields",
            "id,payment_collection.id,payment_collection.order.id".to_string(),
        )];
        let Some(response) = self
            .get_json(&format!("/admin/payments/{}", payment_id), &query)
            .await?
        else {
            return Ok(None);
        };

        Ok(response
            .pointer("/payment/payment_collection/order/id")
            .and_then(|v| v.as_str())
            .map(OrderId::new))
    }

    async fn order_states(
        &self,
        ids: &[OrderId],
    ) -> Result<HashMap<OrderId, OrderState>, CommerceError> {
        let mut states = HashMap::with_capacity(ids.len());

        for chunk in ids.chunks(PAGE_SIZE) {
            let mut query: Vec<(&str, String)> = chunk
                .iter()
                .map(|id| ("id[]", id.as_str().to_string()))
                .collect();
            query.push(("fields", ORDER_STATE_FIELDS.to_string()));
            query.push(("limit", chunk.len().to_string()));

            let Some(response) = self.get_json("/admin/orders", &query).await? else {
                continue;
            };
            let orders = response
                .get("orders")
                .and_then(|v| v.as_array())
                .ok_or_else(|| CommerceError::ParseError("Missing orders array".to_string()))?;

            for order in orders {
                if let Some(id) = order.get("id").and_then(|v| v.as_str()) {
                    states.insert(OrderId::new(id), parse_order_state(order));
                }
            }
        }

        Ok(states)
    }

    async fn list_promotions(
        &self,
        affiliate_id: Option<&AffiliateId>,
    ) -> Result<Vec<PromoCode>, CommerceError> {
        let promotions = self
            .get_all("/admin/promotions", "promotions", PROMOTION_FIELDS)
            .await?;

        Ok(promotions
            .iter()
            .filter_map(parse_promotion)
            .filter(|p| affiliate_id.map_or(true, |id| &p.affiliate_id == id))
            .collect())
    }

    async fn create_promotion(&self, new: &NewPromoCode) -> Result<PromoCode, CommerceError> {
        let mut metadata = json!({ META_AFFILIATE_ID: new.affiliate_id.as_str() });
        if let Some(rate) = new.commission_rate {
            metadata[META_COMMISSION_RATE] = json!(rate.to_canonical_string());
        }

        let body = json!({
            "code": new.code,
            "type": "standard",
            "status": "active",
            "is_automatic": false,
            "application_method": {
                "type": "percentage",
                "target_type": "order",
                "allocation": "across",
                "value": amount_json(new.discount_percent),
            },
            "metadata": metadata,
        });

        let response = self.post_json("/admin/promotions", &body).await?;
        response
            .get("promotion")
            .and_then(parse_promotion)
            .ok_or_else(|| CommerceError::ParseError("Invalid promotion response".to_string()))
    }

    async fn update_promotion(
        &self,
        id: &str,
        update: &PromoCodeUpdate,
    ) -> Result<Option<PromoCode>, CommerceError> {
        let path = format!("/admin/promotions/{}", id);
        let query = [("fields", PROMOTION_FIELDS.to_string())];
        let Some(current) = self.get_json(&path, &query).await? else {
            return Ok(None);
        };
        let Some(current) = current.get("promotion") else {
            return Ok(None);
        };
        if parse_promotion(current).is_none() {
            return Ok(None);
        }

        let mut body = json!({});
        if let Some(code) = &update.code {
            body["code"] = json!(code);
        }
        if let Some(active) = update.active {
            body["status"] = json!(if active { "active" } else { "inactive" });
        }
        if let Some(percent) = update.discount_percent {
            body["application_method"] = json!({ "value": amount_json(percent) });
        }
        if let Some(rate) = update.commission_rate {
            // Metadata is replaced wholesale, so carry the existing keys over.
            let mut metadata = current.get("metadata").cloned().unwrap_or_else(|| json!({}));
            metadata[META_COMMISSION_RATE] = json!(rate.to_canonical_string());
            body["metadata"] = metadata;
        }

        let response = self.post_json(&path, &body).await?;
        Ok(response.get("promotion").and_then(parse_promotion))
    }

    async fn list_promoted_orders(&self) -> Result<Vec<OrderSnapshot>, CommerceError> {
        let orders = self.get_all("/admin/orders", "orders", ORDER_FIELDS).await?;

        let mut promoted = Vec::new();
        for order in &orders {
            match parse_order(order) {
                Ok(order) if order.affiliate_promotions().next().is_some() => promoted.push(order),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to parse order during scan"),
            }
        }
        Ok(promoted)
    }
}

fn amount_json(value: Decimal) -> Value {
    value
        .to_canonical_string()
        .parse::<f64>()
        .map(|f| json!(f))
        .unwrap_or_else(|_| json!(value.to_canonical_string()))
}

/// Amounts arrive as numbers, numeric strings, or `{ "value": ... }` objects.
fn amount_field(json: &Value, key: &str) -> Result<Decimal, CommerceError> {
    let value = match json.get(key) {
        None | Some(Value::Null) => return Ok(Decimal::zero()),
        Some(Value::Object(obj)) => obj.get("value").cloned().unwrap_or(Value::Null),
        Some(other) => other.clone(),
    };
    let parsed = match &value {
        Value::Number(n) => Decimal::from_str_canonical(&n.to_string()),
        Value::String(s) => Decimal::from_str_canonical(s),
        Value::Null => return Ok(Decimal::zero()),
        _ => return Err(CommerceError::ParseError(format!("Invalid {} field", key))),
    };
    parsed.map_err(|e| CommerceError::ParseError(format!("Invalid {}: {}", key, e)))
}

fn time_field(json: &Value, key: &str) -> Result<TimeMs, CommerceError> {
    match json.get(key) {
        Some(Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| TimeMs::new(dt.timestamp_millis()))
            .map_err(|e| CommerceError::ParseError(format!("Invalid {}: {}", key, e))),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(TimeMs::new)
            .ok_or_else(|| CommerceError::ParseError(format!("Invalid {} field", key))),
        _ => Err(CommerceError::ParseError(format!("Missing {} field", key))),
    }
}

fn parse_order_state(order: &Value) -> OrderState {
    let canceled = order.get("status").and_then(|v| v.as_str()) == Some("canceled")
        || order.get("canceled_at").is_some_and(|v| !v.is_null());

    let order_level = order
        .get("payment_status")
        .and_then(|v| v.as_str())
        .is_some_and(is_captured_payment_status);
    let collection_level = order
        .get("payment_collections")
        .and_then(|v| v.as_array())
        .is_some_and(|collections| {
            collections.iter().any(|c| {
                c.get("status")
                    .and_then(|v| v.as_str())
                    .is_some_and(is_captured_payment_status)
            })
        });

    OrderState {
        canceled,
        captured: order_level || collection_level,
    }
}

fn parse_order(order: &Value) -> Result<OrderSnapshot, CommerceError> {
    let id = order
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CommerceError::ParseError("Missing id field".to_string()))?;

    let promotions = order
        .get("promotions")
        .and_then(|v| v.as_array())
        .map(|promos| {
            promos
                .iter()
                .filter_map(|p| {
                    Some(AppliedPromotion {
                        id: p.get("id")?.as_str()?.to_string(),
                        code: p.get("code").and_then(|v| v.as_str()).map(str::to_string),
                        metadata: p.get("metadata").cloned().unwrap_or_else(|| json!({})),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let state = parse_order_state(order);

    Ok(OrderSnapshot {
        id: OrderId::new(id),
        display_id: order.get("display_id").and_then(|v| v.as_i64()),
        currency_code: order
            .get("currency_code")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_ascii_lowercase(),
        total: amount_field(order, "total")?,
        subtotal: amount_field(order, "subtotal")?,
        discount_total: amount_field(order, "discount_total")?,
        shipping_total: amount_field(order, "shipping_total")?,
        metadata: order
            .get("metadata")
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or_else(|| json!({})),
        promotions,
        created_at: time_field(order, "created_at")?,
        canceled: state.canceled,
        payment_captured: state.captured,
    })
}

/// A promotion is an affiliate promo code only when its metadata names an affiliate.
fn parse_promotion(promotion: &Value) -> Option<PromoCode> {
    let applied = AppliedPromotion {
        id: promotion.get("id")?.as_str()?.to_string(),
        code: promotion.get("code").and_then(|v| v.as_str()).map(str::to_string),
        metadata: promotion.get("metadata").cloned().unwrap_or_else(|| json!({})),
    };
    let affiliate_id = applied.affiliate_id()?;

    Some(PromoCode {
        commission_rate: applied
            .raw_commission_rate()
            .and_then(crate::domain::order::parse_rate),
        discount_percent: promotion
            .get("application_method")
            .and_then(|m| amount_field(m, "value").ok()),
        active: promotion.get("status").and_then(|v| v.as_str()) != Some("inactive"),
        code: applied.code.clone().unwrap_or_default(),
        id: applied.id,
        affiliate_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_json() -> Value {
        json!({
            "id": "order_01",
            "display_id": 42,
            "currency_code": "TWD",
            "total": 1050,
            "subtotal": "1000",
            "discount_total": { "value": "100", "precision": 20 },
            "shipping_total": 50,
            "metadata": { "affiliate_code": "REF123" },
            "created_at": "2024-05-01T10:00:00.000Z",
            "canceled_at": null,
            "status": "pending",
            "payment_status": "authorized",
            "payment_collections": [{ "status": "captured" }],
            "promotions": [
                { "id": "promo_1", "code": "AFF10", "metadata": { "affiliate_id": "aff_1", "commission_rate": 0.15 } },
                { "id": "promo_2", "code": "SALE" }
            ]
        })
    }

    #[test]
    fn test_parse_order_valid() {
        let order = parse_order(&order_json()).unwrap();
        assert_eq!(order.id, OrderId::new("order_01"));
        assert_eq!(order.display_id, Some(42));
        assert_eq!(order.currency_code, "twd");
        assert_eq!(order.total, Decimal::from(1050));
        assert_eq!(order.discount_total, Decimal::from(100));
        assert_eq!(order.promo_commission_base(), Decimal::from(850));
        assert_eq!(order.created_at, TimeMs::new(1_714_557_600_000));
        assert!(order.payment_captured);
        assert!(!order.canceled);
        assert_eq!(order.promotions.len(), 2);
        assert_eq!(order.affiliate_promotions().count(), 1);
    }

    #[test]
    fn test_parse_order_missing_created_at() {
        let mut json = order_json();
        json.as_object_mut().unwrap().remove("created_at");
        assert!(matches!(parse_order(&json), Err(CommerceError::ParseError(_))));
    }

    #[test]
    fn test_parse_order_state_canceled() {
        let state = parse_order_state(&json!({ "id": "o", "status": "canceled" }));
        assert!(state.canceled);
        assert!(!state.captured);

        let state = parse_order_state(&json!({ "id": "o", "canceled_at": "2024-01-01T00:00:00Z", "payment_status": "captured" }));
        assert!(state.canceled);
        assert!(state.captured);
    }

    #[test]
    fn test_parse_promotion_requires_affiliate() {
        let promo = parse_promotion(&json!({
            "id": "promo_1",
            "code": "AFF10",
            "status": "active",
            "metadata": { "affiliate_id": "aff_1", "commission_rate": "0.2" },
            "application_method": { "value": 10 }
        }))
        .unwrap();
        assert_eq!(promo.affiliate_id, AffiliateId::new("aff_1"));
        assert_eq!(promo.commission_rate, Decimal::from_str_canonical("0.2").ok());
        assert_eq!(promo.discount_percent, Some(Decimal::from(10)));
        assert!(promo.active);

        assert!(parse_promotion(&json!({ "id": "promo_2", "code": "SALE", "metadata": {} })).is_none());
    }
}
