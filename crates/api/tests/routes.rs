//! Router behaviour over the in-memory billing harness

#![allow(clippy::unwrap_used, clippy::expect_used)]

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use subsync_api::{create_router, AppState, Config};
use subsync_billing::testing::TestHarness;
use subsync_shared::Permission;
use tower::ServiceExt;
use uuid::Uuid;

struct TestApp {
    router: Router,
    state: AppState,
    harness: TestHarness,
}

impl TestApp {
    async fn new() -> Self {
        let harness = TestHarness::new().await;
        let config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            public_url: "http://localhost:3000".to_string(),
            database_url: "postgres://localhost/subsync_test".to_string(),
            database_max_connections: 1,
            jwt_secret: "router-test-secret-at-least-32-characters".to_string(),
            processor_deadline_secs: 5,
        };
        let pool = PgPoolOptions::new()
            .connect_lazy(&config.database_url)
            .unwrap();
        let state = AppState::new(config, pool, harness.billing.clone());

        Self {
            router: create_router(state.clone()),
            state,
            harness,
        }
    }

    fn token(&self, tenant_id: Uuid, permissions: &[Permission]) -> String {
        self.state
            .jwt_manager
            .generate_access_token(Uuid::new_v4(), tenant_id, permissions)
            .unwrap()
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }
}

fn request(method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

#[tokio::test]
async fn plans_are_public() {
    let app = TestApp::new().await;

    let (status, body) = app
        .send(request(Method::GET, "/api/v1/plans", None, None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 3);

    let (status, body) = app
        .send(request(Method::GET, "/api/v1/plans/professional", None, None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["price_cents"], 5499);

    let (status, body) = app
        .send(request(Method::GET, "/api/v1/plans/platinum", None, None))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn liveness_needs_no_database() {
    let app = TestApp::new().await;
    let (status, _) = app
        .send(request(Method::GET, "/health/live", None, None))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn subscription_routes_require_a_token() {
    let app = TestApp::new().await;

    let (status, body) = app
        .send(request(Method::GET, "/api/v1/subscription", None, None))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let (status, body) = app
        .send(request(
            Method::GET,
            "/api/v1/subscription",
            Some("not-a-jwt"),
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "INVALID_TOKEN");
}

#[tokio::test]
async fn viewers_cannot_change_the_plan() {
    let app = TestApp::new().await;
    let tenant = app.harness.add_tenant("Acme", "owner@acme.test").await;
    let token = app.token(tenant.id, &[Permission::ViewBilling]);

    let (status, _) = app
        .send(request(
            Method::POST,
            "/api/v1/subscription",
            Some(&token),
            Some(json!({ "plan_descriptor": "starter" })),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(app.harness.gateway.subscriptions().is_empty());
}

#[tokio::test]
async fn subscribe_read_and_cancel() {
    let app = TestApp::new().await;
    let tenant = app.harness.add_tenant("Acme", "owner@acme.test").await;
    let token = app.token(tenant.id, &[Permission::ManageBilling]);

    let (status, _) = app
        .send(request(Method::GET, "/api/v1/subscription", Some(&token), None))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, created) = app
        .send(request(
            Method::POST,
            "/api/v1/subscription",
            Some(&token),
            Some(json!({ "plan_descriptor": "starter" })),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["status"], "active");
    assert_eq!(created["tenant_id"], tenant.id.to_string());

    let (status, fetched) = app
        .send(request(Method::GET, "/api/v1/subscription", Some(&token), None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], created["id"]);

    let (status, body) = app
        .send(request(Method::DELETE, "/api/v1/subscription", Some(&token), None))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);

    let (_, fetched) = app
        .send(request(Method::GET, "/api/v1/subscription", Some(&token), None))
        .await;
    assert_eq!(fetched["status"], "canceled");
}

#[tokio::test]
async fn blocked_downgrade_returns_conflict_details() {
    let app = TestApp::new().await;
    let tenant = app.harness.add_tenant("Acme", "owner@acme.test").await;
    let token = app.token(tenant.id, &[Permission::ManageBilling]);
    app.harness.gateway.set_new_subscription_status("active");

    let (status, created) = app
        .send(request(
            Method::POST,
            "/api/v1/subscription",
            Some(&token),
            Some(json!({ "plan_descriptor": "enterprise" })),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["status"], "active");

    let (status, body) = app
        .send(request(
            Method::POST,
            "/api/v1/subscription",
            Some(&token),
            Some(json!({ "plan_descriptor": "starter" })),
        ))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");
    assert_eq!(body["error"]["details"]["type"], "feature");
    assert!(body["error"]["details"]["feature"].is_string());
}

#[tokio::test]
async fn empty_descriptor_is_a_validation_error() {
    let app = TestApp::new().await;
    let tenant = app.harness.add_tenant("Acme", "owner@acme.test").await;
    let token = app.token(tenant.id, &[Permission::ViewBilling]);

    let (status, body) = app
        .send(request(
            Method::POST,
            "/api/v1/subscription/proration-estimate",
            Some(&token),
            Some(json!({ "new_plan_descriptor": " " })),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn checkout_resolves_tenant_from_body() {
    let app = TestApp::new().await;
    let tenant = app.harness.add_tenant("Acme", "owner@acme.test").await;

    let (status, body) = app
        .send(request(
            Method::POST,
            "/api/v1/checkout/session",
            None,
            Some(json!({
                "tenant_id": tenant.id,
                "plan_descriptor": "professional",
            })),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["url"].as_str().unwrap().starts_with("https://checkout.test/"));
    assert_eq!(app.harness.gateway.customers().len(), 1);
}

#[tokio::test]
async fn portal_session_without_body_uses_billing_page() {
    let app = TestApp::new().await;
    let tenant = app.harness.add_tenant("Acme", "owner@acme.test").await;
    let token = app.token(tenant.id, &[Permission::ManageBilling]);

    let (status, body) = app
        .send(request(Method::POST, "/api/v1/portal/session", Some(&token), None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["url"].as_str().unwrap().starts_with("https://portal.test/"));
}

#[tokio::test]
async fn unpaid_invoice_of_another_tenant_is_not_found() {
    let app = TestApp::new().await;
    let tenant = app.harness.add_tenant("Acme", "owner@acme.test").await;
    let token = app.token(tenant.id, &[Permission::ManageBilling]);

    let (status, body) = app
        .send(request(
            Method::POST,
            "/api/v1/invoices/in_missing/pay",
            Some(&token),
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn webhook_signature_decides_status() {
    let app = TestApp::new().await;
    let payload = json!({
        "id": "evt_router_1",
        "type": "customer.created",
        "data": { "object": { "id": "cus_1" } },
    })
    .to_string();

    let unsigned = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/webhooks/processor")
        .body(Body::from(payload.clone()))
        .unwrap();
    let (status, body) = app.send(unsigned).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let signed = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/webhooks/processor")
        .header("stripe-signature", TestHarness::sign(&payload))
        .body(Body::from(payload.clone()))
        .unwrap();
    let (status, _) = app.send(signed).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.harness.ledger.len().await, 1);
}

#[tokio::test]
async fn trial_routes_start_extend_and_report() {
    let app = TestApp::new().await;
    let tenant = app.harness.add_tenant("Acme", "owner@acme.test").await;
    let token = app.token(tenant.id, &[Permission::ManageBilling, Permission::ViewBilling]);

    let (status, created) = app
        .send(request(
            Method::POST,
            "/api/v1/subscription/trial",
            Some(&token),
            Some(json!({ "plan_descriptor": "professional", "trial_days": 14 })),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["status"], "trialing");

    let (status, body) = app
        .send(request(
            Method::POST,
            "/api/v1/subscription/trial/extend",
            Some(&token),
            Some(json!({ "additional_days": 7 })),
        ))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);

    let (status, trial) = app
        .send(request(Method::GET, "/api/v1/subscription/trial", Some(&token), None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(trial["is_in_trial"], true);
    assert_eq!(trial["days_remaining"], 21);
    assert!(trial["trial_end"].is_string());

    // A second trial conflicts with the running one
    let (status, body) = app
        .send(request(
            Method::POST,
            "/api/v1/subscription/trial",
            Some(&token),
            Some(json!({ "plan_descriptor": "professional", "trial_days": 14 })),
        ))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");
}

#[tokio::test]
async fn grace_period_requires_past_due() {
    let app = TestApp::new().await;
    let tenant = app.harness.add_tenant("Acme", "owner@acme.test").await;
    let token = app.token(tenant.id, &[Permission::ManageBilling]);
    app.harness.gateway.set_new_subscription_status("active");

    let (_, created) = app
        .send(request(
            Method::POST,
            "/api/v1/subscription",
            Some(&token),
            Some(json!({ "plan_descriptor": "professional" })),
        ))
        .await;

    let (status, _) = app
        .send(request(
            Method::POST,
            "/api/v1/subscription/grace-period",
            Some(&token),
            Some(json!({ "grace_days": 7 })),
        ))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let processor_id = created["processor_subscription_id"].as_str().unwrap();
    app.harness
        .billing
        .subscriptions
        .mark_past_due(processor_id)
        .await
        .unwrap();

    let (status, _) = app
        .send(request(
            Method::POST,
            "/api/v1/subscription/grace-period",
            Some(&token),
            Some(json!({ "grace_days": 7 })),
        ))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn schedule_change_validates_date() {
    let app = TestApp::new().await;
    let tenant = app.harness.add_tenant("Acme", "owner@acme.test").await;
    let token = app.token(tenant.id, &[Permission::ManageBilling]);
    app.harness.gateway.set_new_subscription_status("active");
    app.send(request(
        Method::POST,
        "/api/v1/subscription",
        Some(&token),
        Some(json!({ "plan_descriptor": "professional" })),
    ))
    .await;

    let (status, body) = app
        .send(request(
            Method::POST,
            "/api/v1/subscription/schedule-change",
            Some(&token),
            Some(json!({ "new_plan_descriptor": "enterprise", "effective_date": "2001-01-01" })),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, change) = app
        .send(request(
            Method::POST,
            "/api/v1/subscription/schedule-change",
            Some(&token),
            Some(json!({
                "new_plan_descriptor": "enterprise",
                "effective_date": "2099-01-01",
                "proration_behavior": "always_invoice",
            })),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(change["new_plan"], "enterprise");
    assert_eq!(change["proration"], "always_invoice");
    assert_eq!(change["effective_at"], "2099-01-01T00:00:00Z");
}

#[tokio::test]
async fn setup_intent_returns_client_secret() {
    let app = TestApp::new().await;
    let tenant = app.harness.add_tenant("Acme", "owner@acme.test").await;
    let token = app.token(tenant.id, &[Permission::ManageBilling]);

    let (status, body) = app
        .send(request(
            Method::POST,
            "/api/v1/payment-methods/setup-intent",
            Some(&token),
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["client_secret"].as_str().unwrap().ends_with("_secret_test"));
}

#[tokio::test]
async fn created_invoice_can_be_downloaded() {
    let app = TestApp::new().await;
    let tenant = app.harness.add_tenant("Acme", "owner@acme.test").await;
    let token = app.token(tenant.id, &[Permission::ManageBilling, Permission::ViewBilling]);

    let (status, invoice) = app
        .send(request(
            Method::POST,
            "/api/v1/invoices",
            Some(&token),
            Some(json!({ "description": "Setup fee", "amount": 1500, "currency": "aed" })),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(invoice["amount_due"], 1500);

    let id = invoice["id"].as_str().unwrap();
    let (status, download) = app
        .send(request(
            Method::GET,
            &format!("/api/v1/invoices/{}/download", id),
            Some(&token),
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(download["url"], format!("https://invoice.test/{}/pdf", id));

    let (status, body) = app
        .send(request(
            Method::POST,
            "/api/v1/invoices",
            Some(&token),
            Some(json!({ "description": "Setup fee", "amount": 0, "currency": "aed" })),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn usage_routes_report_quota() {
    let app = TestApp::new().await;
    let tenant = app.harness.add_tenant("Acme", "owner@acme.test").await;
    let token = app.token(tenant.id, &[Permission::ManageBilling, Permission::ViewBilling]);
    app.harness.usage.set(1, 1, 24);
    app.send(request(
        Method::POST,
        "/api/v1/subscription",
        Some(&token),
        Some(json!({ "plan_descriptor": "starter" })),
    ))
    .await;

    let (status, usage) = app
        .send(request(Method::GET, "/api/v1/usage", Some(&token), None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(usage.as_array().unwrap().len(), 3);

    let (status, quota) = app
        .send(request(
            Method::GET,
            "/api/v1/usage/quota?type=orders_per_month",
            Some(&token),
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(quota["type"], "orders_per_month");
    assert_eq!(quota["used"], 24);
    assert_eq!(quota["limit"], 25);
}
