use affiliate_ledger::api::{self, AppState};
use affiliate_ledger::config::Config;
use affiliate_ledger::db::init_db;
use affiliate_ledger::domain::{AffiliateStatus, Decimal, OrderId, OrderSnapshot, Role, TimeMs};
use affiliate_ledger::ledger::NewAccount;
use affiliate_ledger::{Ledger, LedgerConfig, LogNotifier, MockCommercePlatform, Repository};
use axum::http::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt;

const WEBHOOK_SECRET: &str = "hook-secret";

struct TestApp {
    app: axum::Router,
    ledger: Arc<Ledger>,
    commerce: Arc<MockCommercePlatform>,
    _temp: TempDir,
}

async fn setup_test_app() -> TestApp {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir
        .path()
        .join("test.db")
        .to_string_lossy()
        .to_string();
    let pool = init_db(&db_path).await.expect("init_db failed");
    let repo = Arc::new(Repository::new(pool));
    let commerce = Arc::new(MockCommercePlatform::new());

    let config = Config {
        port: 0,
        database_path: db_path,
        commerce_api_url: "http://example.invalid".to_string(),
        commerce_api_key: None,
        auth_secret: "integration-test-secret".to_string(),
        token_ttl_days: 30,
        default_commission_rate: Decimal::from_str_canonical("0.1").unwrap(),
        settlement_currency: "twd".to_string(),
        stats_max_days: 366,
        welcome_discount_percent: Decimal::from(10),
        storefront_url: Some("https://shop.example".to_string()),
        webhook_secret: Some(WEBHOOK_SECRET.to_string()),
    };

    let ledger = Arc::new(Ledger::new(
        repo.clone(),
        commerce.clone(),
        Arc::new(LogNotifier),
        LedgerConfig::from(&config),
    ));
    let state = AppState::new(repo, config, ledger.clone());

    TestApp {
        app: api::create_router(state),
        ledger,
        commerce,
        _temp: temp_dir,
    }
}

async fn send(
    app: &axum::Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = axum::http::Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            axum::body::Body::from(json.to_string())
        }
        None => axum::body::Body::empty(),
    };

    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn dec(value: &Value) -> Decimal {
    Decimal::from_str_canonical(value.as_str().expect("decimal string")).unwrap()
}

async fn login(app: &axum::Router, email: &str, password: &str) -> String {
    let (status, body) = send(
        app,
        "POST",
        "/v1/affiliates/login",
        None,
        Some(json!({ "email": email, "password": password })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login failed: {}", body);
    body["token"].as_str().unwrap().to_string()
}

async fn admin_token(t: &TestApp) -> String {
    t.ledger
        .create_affiliate(NewAccount {
            email: "admin@example.com".to_string(),
            password: "admin-password".to_string(),
            name: Some("Admin".to_string()),
            code: Some("ADMIN".to_string()),
            status: AffiliateStatus::Active,
            role: Role::Admin,
            commission_rate: None,
        })
        .await
        .unwrap();
    login(&t.app, "admin@example.com", "admin-password").await
}

fn order(id: &str, total: i64, code: &str) -> OrderSnapshot {
    OrderSnapshot {
        id: OrderId::new(id),
        display_id: Some(1),
        currency_code: "twd".to_string(),
        total: Decimal::from(total),
        subtotal: Decimal::from(total),
        discount_total: Decimal::zero(),
        shipping_total: Decimal::zero(),
        metadata: json!({ "affiliate_code": code }),
        promotions: vec![],
        created_at: TimeMs::now(),
        canceled: false,
        payment_captured: false,
    }
}

#[tokio::test]
async fn test_health_and_ready() {
    let t = setup_test_app().await;
    let (status, body) = send(&t.app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(&t.app, "GET", "/ready", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn test_register_login_and_guard() {
    let t = setup_test_app().await;

    let (status, body) = send(
        &t.app,
        "POST",
        "/v1/affiliates/register",
        None,
        Some(json!({ "email": "New@Example.com", "password": "password123", "code": "newbie" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["affiliate"]["status"], "pending");
    assert_eq!(body["affiliate"]["code"], "NEWBIE");
    assert!(body["affiliate"].get("passwordHash").is_none());
    let token = body["token"].as_str().unwrap().to_string();

    let (status, body) = send(&t.app, "GET", "/v1/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["email"], "new@example.com");
    assert_eq!(dec(&body["balance"]), Decimal::zero());

    let (status, _) = send(
        &t.app,
        "POST",
        "/v1/affiliates/register",
        None,
        Some(json!({ "email": "new@example.com", "password": "password123" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(&t.app, "GET", "/v1/me", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Unauthorized");

    let (status, _) = send(&t.app, "GET", "/v1/me", Some("garbage.token"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &t.app,
        "POST",
        "/v1/affiliates/login",
        None,
        Some(json!({ "email": "new@example.com", "password": "wrong-password" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // A regular affiliate cannot reach admin endpoints.
    let (status, body) = send(&t.app, "GET", "/v1/admin/affiliates", Some(&token), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Forbidden");
}

#[tokio::test]
async fn test_suspension_revokes_existing_tokens() {
    let t = setup_test_app().await;
    let admin = admin_token(&t).await;

    let (status, body) = send(
        &t.app,
        "POST",
        "/v1/admin/affiliates",
        Some(&admin),
        Some(json!({ "email": "sus@example.com", "password": "password123", "code": "SUS" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "active");
    let id = body["id"].as_str().unwrap().to_string();

    let token = login(&t.app, "sus@example.com", "password123").await;
    let (status, _) = send(&t.app, "GET", "/v1/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &t.app,
        "PATCH",
        &format!("/v1/admin/affiliates/{}", id),
        Some(&admin),
        Some(json!({ "status": "suspended" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "suspended");

    let (status, _) = send(&t.app, "GET", "/v1/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &t.app,
        "DELETE",
        &format!("/v1/admin/affiliates/{}", id),
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(
        &t.app,
        "GET",
        &format!("/v1/admin/affiliates/{}", id),
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_referral_to_settlement_over_http() {
    let t = setup_test_app().await;
    let admin = admin_token(&t).await;

    let (_, body) = send(
        &t.app,
        "POST",
        "/v1/admin/affiliates",
        Some(&admin),
        Some(json!({ "email": "ref@example.com", "password": "password123", "code": "REF123" })),
    )
    .await;
    let affiliate_id = body["id"].as_str().unwrap().to_string();
    let token = login(&t.app, "ref@example.com", "password123").await;

    let (status, link) = send(
        &t.app,
        "POST",
        "/v1/me/links",
        Some(&token),
        Some(json!({ "code": "REF123" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(link["url"], "https://shop.example");

    let (status, click) = send(&t.app, "POST", "/v1/links/ref123/click", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(click["url"], "https://shop.example");
    let (status, _) = send(&t.app, "POST", "/v1/links/NOPE/click", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let placed = order("order_1", 1000, "REF123");
    t.commerce.put_order(placed.clone());
    t.ledger.attribute_order(&placed.id).await.unwrap();
    t.commerce.capture_order(&placed.id);
    t.ledger.capture_order(&placed.id).await.unwrap();

    let (_, me) = send(&t.app, "GET", "/v1/me", Some(&token), None).await;
    assert_eq!(dec(&me["balances"]["captured"]), Decimal::from(100));
    assert_eq!(dec(&me["balances"]["pending"]), Decimal::zero());

    let (status, listed) = send(&t.app, "GET", "/v1/admin/affiliates", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    let listed = listed
        .as_array()
        .unwrap()
        .iter()
        .find(|a| a["id"] == affiliate_id.as_str())
        .unwrap()
        .clone();
    assert_eq!(dec(&listed["balances"]["captured"]), Decimal::from(100));
    assert_eq!(dec(&listed["balances"]["pending"]), Decimal::zero());
    assert_eq!(dec(&listed["balance"]), Decimal::from(100));

    let (status, page) = send(
        &t.app,
        "GET",
        "/v1/me/conversions?status=captured&limit=10",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 1);
    assert_eq!(page["conversions"][0]["sourceType"], "link");
    assert_eq!(dec(&page["conversions"][0]["commission"]), Decimal::from(100));

    let (status, _) = send(
        &t.app,
        "GET",
        "/v1/me/conversions?status=refunded",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let settle_uri = format!("/v1/admin/affiliates/{}/settle", affiliate_id);
    let (status, settlement) = send(
        &t.app,
        "POST",
        &settle_uri,
        Some(&admin),
        Some(json!({ "note": "first payout" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(dec(&settlement["amount"]), Decimal::from(100));
    assert_eq!(settlement["status"], "paid");
    assert_eq!(settlement["metadata"]["note"], "first payout");

    let (status, body) = send(&t.app, "POST", &settle_uri, Some(&admin), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "nothing to settle");

    let (_, settlements) = send(&t.app, "GET", "/v1/me/settlements", Some(&token), None).await;
    assert_eq!(settlements.as_array().unwrap().len(), 1);

    let (_, me) = send(&t.app, "GET", "/v1/me", Some(&token), None).await;
    assert_eq!(dec(&me["balance"]), Decimal::zero());
    assert_eq!(dec(&me["totalEarnings"]), Decimal::from(100));

    let (status, stats) = send(&t.app, "GET", "/v1/me/stats", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["totals"]["clicks"], 1);
    assert_eq!(stats["totals"]["conversions"], 1);
    assert_eq!(stats["daily"].as_array().unwrap().len(), 30);

    let (status, _) = send(
        &t.app,
        "GET",
        "/v1/me/stats?from=2024-02-01&to=2024-01-01",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, global) = send(&t.app, "GET", "/v1/admin/stats", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dec(&global["totalPaidOut"]), Decimal::from(100));
    assert_eq!(global["affiliatesByStatus"]["active"], 2);
}

#[tokio::test]
async fn test_activation_creates_welcome_promo_code() {
    let t = setup_test_app().await;
    let admin = admin_token(&t).await;

    let (_, body) = send(
        &t.app,
        "POST",
        "/v1/affiliates/register",
        None,
        Some(json!({ "email": "wait@example.com", "password": "password123", "code": "WAIT" })),
    )
    .await;
    let id = body["affiliate"]["id"].as_str().unwrap().to_string();
    let token = body["token"].as_str().unwrap().to_string();

    let (status, _) = send(
        &t.app,
        "PATCH",
        &format!("/v1/admin/affiliates/{}", id),
        Some(&admin),
        Some(json!({ "status": "active", "commissionRate": "0.15" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, promos) = send(&t.app, "GET", "/v1/me/promo-codes", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(promos.as_array().unwrap().len(), 1);
    assert_eq!(promos[0]["code"], "WAIT");

    let promo_id = promos[0]["id"].as_str().unwrap().to_string();
    let (status, updated) = send(
        &t.app,
        "PATCH",
        &format!("/v1/admin/promo-codes/{}", promo_id),
        Some(&admin),
        Some(json!({ "active": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["active"], false);

    let (status, report) = send(
        &t.app,
        "POST",
        "/v1/admin/promo-codes/bulk-generate",
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // The admin account itself is active and had no code yet.
    assert_eq!(report["created"], 1);
    assert_eq!(report["skipped"], 1);
}

#[tokio::test]
async fn test_events_webhook() {
    let t = setup_test_app().await;
    let affiliate = t
        .ledger
        .create_affiliate(NewAccount {
            email: "hook@example.com".to_string(),
            password: "password123".to_string(),
            name: None,
            code: Some("HOOK".to_string()),
            status: AffiliateStatus::Active,
            role: Role::User,
            commission_rate: None,
        })
        .await
        .unwrap();
    t.ledger
        .create_link(&affiliate.id, Some("HOOK"), None)
        .await
        .unwrap();
    t.commerce.put_order(order("order_1", 500, "HOOK"));

    let event = json!({ "event": "order.placed", "data": { "id": "order_1" } });
    let request = |secret: Option<&str>| {
        let mut builder = axum::http::Request::builder()
            .method("POST")
            .uri("/v1/events")
            .header("content-type", "application/json");
        if let Some(secret) = secret {
            builder = builder.header("x-webhook-secret", secret);
        }
        builder
            .body(axum::body::Body::from(event.to_string()))
            .unwrap()
    };

    let response = t.app.clone().oneshot(request(Some("wrong"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let response = t.app.clone().oneshot(request(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = t
        .app
        .clone()
        .oneshot(request(Some(WEBHOOK_SECRET)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let mut attributed = false;
    for _ in 0..50 {
        if t
            .ledger
            .repo()
            .find_live_conversion_for_order(&OrderId::new("order_1"))
            .await
            .unwrap()
            .is_some()
        {
            attributed = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(attributed, "order.placed was not handled");

    let ignored = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/events")
        .header("content-type", "application/json")
        .header("x-webhook-secret", WEBHOOK_SECRET)
        .body(axum::body::Body::from(
            json!({ "event": "order.updated", "data": { "id": "order_1" } }).to_string(),
        ))
        .unwrap();
    let response = t.app.clone().oneshot(ignored).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}
