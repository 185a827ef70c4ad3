//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};

use api::config::Config;
use api::{AppState, Cipher, Gateway};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use checkout::{InMemoryPaymentGateway, PlaintextCipher, WebhookVerifier};
use domain::ReservationRequest;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{Value, json};
use store::{InMemoryStore, ReservationStore};
use tower::ServiceExt;

const WEBHOOK_SECRET: &str = "whsec_api_test";
const SESSION: &str = "shopper-session-1";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn setup_with_state() -> (axum::Router, Arc<AppState<InMemoryStore>>) {
    let config = Config {
        webhook_secret: Some(WEBHOOK_SECRET.to_string()),
        ..Config::default()
    };
    let gateway: Gateway = Arc::new(InMemoryPaymentGateway::new());
    let cipher: Cipher = Arc::new(PlaintextCipher);
    let state = Arc::new(AppState::new(InMemoryStore::new(), gateway, cipher, &config));
    let app = api::create_app(state.clone(), get_metrics_handle());
    (app, state)
}

fn setup() -> axum::Router {
    setup_with_state().0
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    (status, json)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-session-token", SESSION)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-session-token", SESSION)
        .body(Body::empty())
        .unwrap()
}

async fn create_variant(app: &axum::Router, sku: &str, stock: u32) -> String {
    let (status, json) = send(
        app,
        json_request(
            "POST",
            "/admin/variants",
            json!({
                "sku": sku,
                "name": format!("Widget {sku}"),
                "price_cents": 1000,
                "currency": "USD",
                "stock_quantity": stock,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{json}");
    json["id"].as_str().unwrap().to_string()
}

async fn cart_with_item(app: &axum::Router, variant_id: &str, quantity: u32) -> String {
    let (status, cart) = send(app, empty_request("POST", "/carts")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(cart["session_token"], SESSION);

    let (status, json) = send(
        app,
        json_request(
            "POST",
            "/carts/current/items",
            json!({"variant_id": variant_id, "quantity": quantity}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{json}");
    cart["cart_id"].as_str().unwrap().to_string()
}

async fn start_checkout(app: &axum::Router) -> (StatusCode, Value) {
    send(
        app,
        json_request(
            "POST",
            "/checkout",
            json!({
                "success_url": "https://shop.example.test/success",
                "cancel_url": "https://shop.example.test/cancel",
            }),
        ),
    )
    .await
}

async fn inventory(app: &axum::Router, variant_id: &str) -> Value {
    let (status, json) = send(
        app,
        empty_request("GET", &format!("/admin/inventory/{variant_id}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    json
}

fn signed_webhook(body: &Value) -> Request<Body> {
    let raw = body.to_string();
    let signature = WebhookVerifier::new(WEBHOOK_SECRET)
        .sign(raw.as_bytes())
        .unwrap();
    Request::builder()
        .method("POST")
        .uri("/webhooks/payments")
        .header("content-type", "application/json")
        .header("x-signature", signature)
        .body(Body::from(raw))
        .unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let app = setup();

    let (status, json) = send(
        &app,
        Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_checkout_and_payment_flow() {
    let app = setup();
    let variant_id = create_variant(&app, "SKU-FLOW", 5).await;
    let cart_id = cart_with_item(&app, &variant_id, 2).await;

    let (status, started) = start_checkout(&app).await;
    assert_eq!(status, StatusCode::OK, "{started}");
    let session_id = started["session_id"].as_str().unwrap().to_string();
    let order_id = started["order_id"].as_str().unwrap().to_string();
    assert!(started["redirect_url"].as_str().unwrap().starts_with("https://"));

    let held = inventory(&app, &variant_id).await;
    assert_eq!(held["stock"], 5);
    assert_eq!(held["reserved"], 2);
    assert_eq!(held["available"], 3);

    let (status, cart) = send(&app, empty_request("GET", "/carts/current")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cart["status"], "ordered");
    assert_eq!(cart["total_cents"], 2000);

    let event = json!({
        "id": "evt_completed_1",
        "type": "checkout.session.completed",
        "data": {"object": {
            "id": session_id,
            "amount_total": 2000,
            "currency": "usd",
            "customer_email": "shopper@example.test",
            "payment_intent": "pi_123",
            "metadata": {"cart_id": cart_id},
        }},
    });
    let (status, json) = send(&app, signed_webhook(&event)).await;
    assert_eq!(status, StatusCode::OK, "{json}");
    assert_eq!(json["received"], true);
    assert_eq!(json["outcome"], "completed");
    assert_eq!(json["cleared"], 1);

    // A redelivery changes nothing.
    let (status, json) = send(&app, signed_webhook(&event)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "already_settled");

    let sold = inventory(&app, &variant_id).await;
    assert_eq!(sold["stock"], 3);
    assert_eq!(sold["reserved"], 0);
    assert_eq!(sold["available"], 3);

    let (status, order) = send(&app, empty_request("GET", &format!("/orders/{order_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(order["status"], "paid");
    assert_eq!(order["customer_email"], "shopper@example.test");
    assert_eq!(order["items"].as_array().unwrap().len(), 1);
    assert_eq!(order["items"][0]["quantity"], 2);
    assert_eq!(order["payments"].as_array().unwrap().len(), 1);
    assert_eq!(order["payments"][0]["provider_reference"], "pi_123");
}

#[tokio::test]
async fn test_checkout_reports_shortfalls() {
    let app = setup();
    let variant_id = create_variant(&app, "SKU-SHORT", 1).await;
    cart_with_item(&app, &variant_id, 3).await;

    let (status, json) = start_checkout(&app).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert!(json["correlation_id"].is_string());
    let shortfalls = json["shortfalls"].as_array().unwrap();
    assert_eq!(shortfalls.len(), 1);
    assert_eq!(shortfalls[0]["variant_id"], variant_id.as_str());
    assert_eq!(shortfalls[0]["requested"], 3);
    assert_eq!(shortfalls[0]["available"], 1);

    let untouched = inventory(&app, &variant_id).await;
    assert_eq!(untouched["available"], 1);
    assert_eq!(untouched["reserved"], 0);
}

#[tokio::test]
async fn test_checkout_requires_session_token() {
    let app = setup();

    let (status, json) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/checkout")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"success_url": "https://a.test/s", "cancel_url": "https://a.test/c"})
                    .to_string(),
            ))
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("X-Session-Token"));
}

#[tokio::test]
async fn test_checkout_rejects_relative_urls() {
    let app = setup();
    let variant_id = create_variant(&app, "SKU-URL", 4).await;
    cart_with_item(&app, &variant_id, 1).await;

    let (status, _) = send(
        &app,
        json_request(
            "POST",
            "/checkout",
            json!({"success_url": "/success", "cancel_url": "https://a.test/c"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(inventory(&app, &variant_id).await["reserved"], 0);
}

#[tokio::test]
async fn test_error_echoes_correlation_id() {
    let app = setup();
    let correlation_id = "6f1c1a52-6b0e-4a3d-9d1f-1f1a2b3c4d5e";

    let (status, json) = send(
        &app,
        Request::builder()
            .uri("/carts/current")
            .header("x-session-token", "no-such-cart")
            .header("x-correlation-id", correlation_id)
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["correlation_id"], correlation_id);
}

#[tokio::test]
async fn test_webhook_rejects_bad_signature() {
    let app = setup();

    let (status, json) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/webhooks/payments")
            .header("x-signature", "deadbeef")
            .body(Body::from(r#"{"id":"evt","type":"checkout.session.completed"}"#))
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["correlation_id"].is_string());
}

#[tokio::test]
async fn test_webhook_unknown_session_is_not_found() {
    let app = setup();
    let event = json!({
        "id": "evt_unknown",
        "type": "checkout.session.completed",
        "data": {"object": {"id": "cs_missing"}},
    });

    let (status, _) = send(&app, signed_webhook(&event)).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_webhook_expiry_restores_stock() {
    let app = setup();
    let variant_id = create_variant(&app, "SKU-EXP", 4).await;
    cart_with_item(&app, &variant_id, 3).await;
    let (_, started) = start_checkout(&app).await;

    let event = json!({
        "id": "evt_expired",
        "type": "checkout.session.expired",
        "data": {"object": {"id": started["session_id"]}},
    });
    let (status, json) = send(&app, signed_webhook(&event)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "expired");
    assert_eq!(json["order_failed"], true);
    assert_eq!(json["released"], 1);
    let level = inventory(&app, &variant_id).await;
    assert_eq!(level["available"], 4);
    assert_eq!(level["reserved"], 0);

    let order_id = started["order_id"].as_str().unwrap();
    let (_, order) = send(&app, empty_request("GET", &format!("/orders/{order_id}"))).await;
    assert_eq!(order["status"], "failed");
}

#[tokio::test]
async fn test_webhook_ignores_other_events() {
    let app = setup();
    let event = json!({
        "id": "evt_other",
        "type": "invoice.created",
        "data": {"object": {"id": "in_1"}},
    });

    let (status, json) = send(&app, signed_webhook(&event)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "ignored");
    assert_eq!(json["kind"], "invoice.created");
}

#[tokio::test]
async fn test_inventory_update() {
    let app = setup();
    let variant_id = create_variant(&app, "SKU-ADJ", 2).await;
    let uri = format!("/admin/inventory/{variant_id}");

    let (status, json) = send(&app, json_request("PUT", &uri, json!({"adjust": 3}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["available"], 5);

    let (status, json) = send(&app, json_request("PUT", &uri, json!({"adjust": -9}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["shortfalls"][0]["available"], 5);

    let (status, json) = send(&app, json_request("PUT", &uri, json!({"stock_quantity": 7}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["stock"], 7);

    let (status, _) = send(
        &app,
        json_request("PUT", &uri, json!({"stock_quantity": 1, "adjust": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_inventory_unknown_variant() {
    let app = setup();

    let (status, _) = send(
        &app,
        empty_request("GET", &format!("/admin/inventory/{}", uuid::Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, empty_request("GET", "/admin/inventory/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_add_item_outside_purchase_bounds() {
    let app = setup();
    let (status, variant) = send(
        &app,
        json_request(
            "POST",
            "/admin/variants",
            json!({
                "sku": "SKU-BOUND",
                "name": "Bounded",
                "price_cents": 500,
                "currency": "usd",
                "min_purchase_quantity": 2,
                "max_purchase_quantity": 3,
                "stock_quantity": 10,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    send(&app, empty_request("POST", "/carts")).await;

    let (status, _) = send(
        &app,
        json_request(
            "POST",
            "/carts/current/items",
            json!({"variant_id": variant["id"], "quantity": 4}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_delete_cart_restores_stock() {
    let (app, state) = setup_with_state();
    let variant_id = create_variant(&app, "SKU-DEL", 3).await;
    let cart_id = cart_with_item(&app, &variant_id, 2).await;
    state
        .store
        .reserve_all(
            cart_id.parse().unwrap(),
            vec![ReservationRequest::new(variant_id.parse().unwrap(), 2)],
            chrono::Utc::now() + chrono::Duration::minutes(30),
        )
        .await
        .unwrap();
    assert_eq!(inventory(&app, &variant_id).await["available"], 1);

    let (status, json) = send(&app, empty_request("DELETE", &format!("/carts/{cart_id}"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["released"], 1);
    assert_eq!(json["units_restored"], 2);
    assert_eq!(inventory(&app, &variant_id).await["available"], 3);
    let (status, _) = send(&app, empty_request("GET", "/carts/current")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_ordered_cart_is_conflict() {
    let app = setup();
    let variant_id = create_variant(&app, "SKU-DEL-ORD", 3).await;
    let cart_id = cart_with_item(&app, &variant_id, 2).await;
    let (status, _) = start_checkout(&app).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, empty_request("DELETE", &format!("/carts/{cart_id}"))).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(inventory(&app, &variant_id).await["reserved"], 2);
}

#[tokio::test]
async fn test_cancel_reservation() {
    let (app, state) = setup_with_state();
    let variant_id = create_variant(&app, "SKU-CANCEL", 4).await;
    let cart_id = cart_with_item(&app, &variant_id, 2).await;
    start_checkout(&app).await;

    let reservations = state
        .store
        .reservations_for_cart(cart_id.parse().unwrap())
        .await
        .unwrap();
    assert_eq!(reservations.len(), 1);
    let reservation_id = reservations[0].id;

    let uri = format!("/admin/reservations/{reservation_id}");
    let (status, json) = send(&app, empty_request("DELETE", &uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["quantity"], 2);
    assert_eq!(inventory(&app, &variant_id).await["available"], 4);

    let (status, _) = send(&app, empty_request("DELETE", &uri)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sweep_endpoint() {
    let (app, state) = setup_with_state();
    let variant_id = create_variant(&app, "SKU-SWEEP", 6).await;
    cart_with_item(&app, &variant_id, 2).await;
    start_checkout(&app).await;

    let (status, json) = send(&app, empty_request("POST", "/admin/reservations/sweep")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["released"], 0);

    let released = state
        .store
        .release_expired(chrono::Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(inventory(&app, &variant_id).await["available"], 6);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = setup();
    let variant_id = create_variant(&app, "SKU-METRICS", 1).await;
    cart_with_item(&app, &variant_id, 1).await;
    start_checkout(&app).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("checkout_started_total"));
}
