//! End-to-end tests for billing-sync
//!
//! Drive the full `/payments` router in-process with an in-memory store,
//! a recording notifier and a fake payment gateway.
//!
//! # Test Categories
//!
//! 1. **Webhook Authentication**: missing and tampered signatures
//! 2. **Reconciliation Scenarios**: create, duplicate invoice, unknown update
//! 3. **Administration**: lookup, cancel, reactivate, tenant scoping
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --package billing-sync --test webhook_flow_tests
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use billing_sync::admin::SubscriptionAdmin;
use billing_sync::handlers::app_router;
use billing_sync::models::{Invoice, NewInvoice, NewSubscription, Subscription, SubscriptionStatus};
use billing_sync::notify::{NotifyOutcome, SubscriptionChange, SubscriptionNotifier};
use billing_sync::store::{InvoiceStore, MemoryStore, StoreError, StoreResult, SubscriptionStore};
use billing_sync::stripe::gateway::{GatewayError, GatewaySubscription, PaymentGateway};
use billing_sync::stripe::handler::{WebhookState, SIGNATURE_HEADER};
use billing_sync::stripe::{ReconciliationEngine, SignatureVerifier};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tower::ServiceExt;

const SECRET: &str = "whsec_integration";

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Default)]
struct RecordingNotifier {
    changes: Mutex<Vec<SubscriptionChange>>,
}

#[async_trait]
impl SubscriptionNotifier for RecordingNotifier {
    async fn notify(&self, change: &SubscriptionChange) -> NotifyOutcome {
        self.changes.lock().push(change.clone());
        NotifyOutcome::Delivered { status: 200 }
    }
}

#[derive(Default)]
struct FakeGateway {
    calls: Mutex<Vec<(String, bool)>>,
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> Result<GatewaySubscription, GatewayError> {
        self.calls.lock().push((subscription_id.to_string(), cancel));
        Ok(GatewaySubscription {
            id: subscription_id.to_string(),
            status: SubscriptionStatus::Active,
            cancel_at_period_end: cancel,
            customer_email: Some("u1@example.com".to_string()),
        })
    }
}

/// Store whose backend is unreachable
struct UnavailableStore;

fn unavailable<T>() -> StoreResult<T> {
    Err(StoreError::Backend("connection reset".to_string()))
}

#[async_trait]
impl SubscriptionStore for UnavailableStore {
    async fn create(&self, _subscription: NewSubscription) -> StoreResult<Subscription> {
        unavailable()
    }

    async fn get_by_user_tenant(
        &self,
        _user_id: &str,
        _tenant: &str,
    ) -> StoreResult<Option<Subscription>> {
        unavailable()
    }

    async fn get_by_processor_id(&self, _id: &str) -> StoreResult<Option<Subscription>> {
        unavailable()
    }

    async fn update(&self, _subscription: &Subscription) -> StoreResult<Subscription> {
        unavailable()
    }
}

#[async_trait]
impl InvoiceStore for UnavailableStore {
    async fn create(&self, _invoice: NewInvoice) -> StoreResult<Invoice> {
        unavailable()
    }

    async fn get_by_processor_invoice_id(&self, _id: &str) -> StoreResult<Option<Invoice>> {
        unavailable()
    }

    async fn list_for_user(&self, _user_id: &str, _tenant: &str) -> StoreResult<Vec<Invoice>> {
        unavailable()
    }
}

struct TestApp {
    router: Router,
    store: Arc<MemoryStore>,
    notifier: Arc<RecordingNotifier>,
    gateway: Arc<FakeGateway>,
}

impl TestApp {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let gateway = Arc::new(FakeGateway::default());

        let engine = ReconciliationEngine::new(store.clone(), store.clone(), notifier.clone());
        let webhook = Arc::new(WebhookState::new(
            SignatureVerifier::new(SECRET),
            Arc::new(engine),
        ));
        let admin = Arc::new(SubscriptionAdmin::new(
            store.clone(),
            store.clone(),
            gateway.clone(),
            notifier.clone(),
        ));

        Self {
            router: app_router(webhook, admin),
            store,
            notifier,
            gateway,
        }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn deliver(&self, event_type: &str, object: Value) -> (StatusCode, Value) {
        let body = serde_json::to_vec(&json!({
            "id": format!("evt_{}", event_type.replace('.', "_")),
            "object": "event",
            "type": event_type,
            "created": chrono::Utc::now().timestamp(),
            "livemode": false,
            "pending_webhooks": 1,
            "data": { "object": object }
        }))
        .unwrap();
        let signature =
            SignatureVerifier::new(SECRET).sign(&body, chrono::Utc::now().timestamp());

        self.send(
            Request::builder()
                .method("POST")
                .uri("/payments/webhook")
                .header("content-type", "application/json")
                .header(SIGNATURE_HEADER, signature)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
    }

    async fn admin(&self, method: &str, path: &str, tenant: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(tenant) = tenant {
            builder = builder.header("X-Tenant-ID", tenant);
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }
}

fn subscription_created(subscription_id: &str) -> Value {
    json!({
        "id": subscription_id,
        "object": "subscription",
        "customer": { "id": "cus_123", "object": "customer" },
        "status": "active",
        "cancel_at_period_end": false,
        "metadata": { "user_id": "u1", "tenant": "t1", "plan": "premium_monthly" },
        "items": { "object": "list", "data": [{
            "id": "si_1",
            "current_period_start": 1_700_000_000,
            "current_period_end": 1_702_592_000,
            "price": { "id": "price_1", "unit_amount": 999 }
        }]}
    })
}

fn invoice_paid(invoice_id: &str, subscription_id: &str) -> Value {
    json!({
        "id": invoice_id,
        "object": "invoice",
        "amount_paid": 999,
        "currency": "usd",
        "status": "paid",
        "hosted_invoice_url": "https://invoice.example/i/1",
        "period_start": 1_700_000_000,
        "period_end": 1_702_592_000,
        "parent": {
            "type": "subscription_details",
            "subscription_details": { "subscription": subscription_id }
        }
    })
}

// ============================================================================
// Webhook Authentication
// ============================================================================

#[tokio::test]
async fn test_health() {
    let app = TestApp::new();
    let (status, body) = app.admin("GET", "/payments/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "healthy"}));
}

#[tokio::test]
async fn test_tampered_webhook_rejected_without_state_change() {
    let app = TestApp::new();
    let body = serde_json::to_vec(&json!({
        "id": "evt_1",
        "type": "customer.subscription.created",
        "data": { "object": subscription_created("sub_123") }
    }))
    .unwrap();
    let signature = SignatureVerifier::new(SECRET).sign(&body, chrono::Utc::now().timestamp());

    let mut tampered = body.clone();
    let last = tampered.len() - 2;
    tampered[last] = b' ';

    let (status, response) = app
        .send(
            Request::builder()
                .method("POST")
                .uri("/payments/webhook")
                .header(SIGNATURE_HEADER, signature)
                .body(Body::from(tampered))
                .unwrap(),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response, json!({"error": "Invalid signature"}));
    assert_eq!(app.store.subscription_count(), 0);
}

#[tokio::test]
async fn test_missing_signature_rejected() {
    let app = TestApp::new();
    let (status, response) = app
        .send(
            Request::builder()
                .method("POST")
                .uri("/payments/webhook")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error"], "Missing Stripe-Signature header");
}

// ============================================================================
// Reconciliation Scenarios
// ============================================================================

#[tokio::test]
async fn test_scenario_a_subscription_created() {
    let app = TestApp::new();
    let (status, body) = app
        .deliver("customer.subscription.created", subscription_created("sub_123"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "success"}));

    let row = app
        .store
        .get_by_user_tenant("u1", "t1")
        .await
        .unwrap()
        .expect("subscription stored");
    assert_eq!(row.stripe_subscription_id, "sub_123");
    assert_eq!(row.stripe_customer_id, "cus_123");
    assert_eq!(row.status, SubscriptionStatus::Active);
    assert_eq!(app.store.subscription_count(), 1);

    let changes = app.notifier.changes.lock();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].user_id, "u1");
    assert_eq!(changes[0].subscription_id, "sub_123");
}

#[tokio::test]
async fn test_duplicate_created_for_same_user_tenant_fails_second_insert() {
    let app = TestApp::new();
    app.deliver("customer.subscription.created", subscription_created("sub_123"))
        .await;
    let (status, _) = app
        .deliver("customer.subscription.created", subscription_created("sub_456"))
        .await;

    // Acknowledged, but no second row for (u1, t1)
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.store.subscription_count(), 1);
    assert!(app.store.get_by_processor_id("sub_456").await.unwrap().is_none());
}

#[tokio::test]
async fn test_scenario_b_duplicate_invoice_delivery() {
    let app = TestApp::new();
    app.deliver("customer.subscription.created", subscription_created("sub_123"))
        .await;

    for _ in 0..2 {
        let (status, _) = app.deliver("invoice.paid", invoice_paid("inv_1", "sub_123")).await;
        assert_eq!(status, StatusCode::OK);
    }

    assert_eq!(app.store.invoice_count(), 1);
    let invoice = app
        .store
        .get_by_processor_invoice_id("inv_1")
        .await
        .unwrap()
        .expect("invoice stored");
    assert_eq!(invoice.user_id, "u1");
    assert_eq!(invoice.tenant, "t1");
    assert_eq!(invoice.amount_paid, 999);
}

#[tokio::test]
async fn test_concurrent_invoice_redelivery_stores_once() {
    let app = TestApp::new();
    app.deliver("customer.subscription.created", subscription_created("sub_123"))
        .await;

    let deliveries = (0..8).map(|_| app.deliver("invoice.paid", invoice_paid("inv_7", "sub_123")));
    let results = futures::future::join_all(deliveries).await;

    assert!(results.iter().all(|(status, _)| *status == StatusCode::OK));
    assert_eq!(app.store.invoice_count(), 1);
}

#[tokio::test]
async fn test_scenario_c_update_for_unknown_subscription() {
    let app = TestApp::new();
    let mut object = subscription_created("sub_999");
    object["status"] = json!("past_due");

    let (status, body) = app.deliver("customer.subscription.updated", object).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "success"}));
    assert_eq!(app.store.subscription_count(), 0);
    assert!(app.notifier.changes.lock().is_empty());
}

#[tokio::test]
async fn test_deleted_sets_canceled_and_keeps_flag() {
    let app = TestApp::new();
    let mut created = subscription_created("sub_123");
    created["cancel_at_period_end"] = json!(true);
    app.deliver("customer.subscription.created", created).await;

    let mut deleted = subscription_created("sub_123");
    deleted["status"] = json!("canceled");
    app.deliver("customer.subscription.deleted", deleted).await;

    let row = app
        .store
        .get_by_processor_id("sub_123")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, SubscriptionStatus::Canceled);
    assert!(row.cancel_at_period_end);
}

#[tokio::test]
async fn test_store_outage_still_acknowledged() {
    let notifier = Arc::new(RecordingNotifier::default());
    let store = Arc::new(UnavailableStore);
    let gateway = Arc::new(FakeGateway::default());
    let engine = ReconciliationEngine::new(store.clone(), store.clone(), notifier.clone());
    let webhook = Arc::new(WebhookState::new(
        SignatureVerifier::new(SECRET),
        Arc::new(engine),
    ));
    let admin = Arc::new(SubscriptionAdmin::new(
        store.clone(),
        store,
        gateway.clone(),
        notifier.clone(),
    ));
    let app = TestApp {
        router: app_router(webhook, admin),
        store: Arc::new(MemoryStore::new()),
        notifier,
        gateway,
    };

    for (event_type, object) in [
        ("customer.subscription.created", subscription_created("sub_123")),
        ("customer.subscription.updated", subscription_created("sub_123")),
        ("invoice.paid", invoice_paid("inv_1", "sub_123")),
    ] {
        let (status, body) = app.deliver(event_type, object).await;
        assert_eq!(status, StatusCode::OK, "{event_type}");
        assert_eq!(body, json!({"status": "success"}));
    }
    assert!(app.notifier.changes.lock().is_empty());

    // Admin reads surface the outage instead
    let (status, body) = app
        .admin("GET", "/payments/subscription/u1", Some("t1"))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_unhandled_event_acknowledged() {
    let app = TestApp::new();
    let (status, body) = app
        .deliver("customer.created", json!({"id": "cus_1", "object": "customer"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
}

// ============================================================================
// Administration
// ============================================================================

#[tokio::test]
async fn test_admin_requires_tenant_header() {
    let app = TestApp::new();
    let (status, body) = app.admin("GET", "/payments/subscription/u1", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "X-Tenant-ID header is required"}));
}

#[tokio::test]
async fn test_admin_lookup_and_invoices() {
    let app = TestApp::new();
    let (status, body) = app
        .admin("GET", "/payments/subscription/u1", Some("t1"))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Subscription not found");

    app.deliver("customer.subscription.created", subscription_created("sub_123"))
        .await;
    app.deliver("invoice.paid", invoice_paid("inv_1", "sub_123")).await;

    let (status, body) = app
        .admin("GET", "/payments/subscription/u1", Some("t1"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stripe_subscription_id"], "sub_123");
    assert_eq!(body["plan"], "premium_monthly");
    assert!(body.get("version").is_none());

    let (status, body) = app.admin("GET", "/payments/invoices/u1", Some("t1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(1));
    assert_eq!(body[0]["stripe_invoice_id"], "inv_1");

    // Other tenants see nothing
    let (status, body) = app.admin("GET", "/payments/invoices/u1", Some("t2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_admin_cancel_then_reactivate() {
    let app = TestApp::new();
    app.deliver("customer.subscription.created", subscription_created("sub_123"))
        .await;

    let (status, body) = app.admin("POST", "/payments/cancel/u1", Some("t1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    let row = app.store.get_by_user_tenant("u1", "t1").await.unwrap().unwrap();
    assert!(row.cancel_at_period_end);
    assert_eq!(row.status, SubscriptionStatus::Active);

    // Second cancel is refused before reaching Stripe
    let (status, body) = app.admin("POST", "/payments/cancel/u1", Some("t1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["error"],
        "Subscription is already scheduled for cancellation"
    );

    let (status, _) = app
        .admin("POST", "/payments/reactivate/u1", Some("t1"))
        .await;
    assert_eq!(status, StatusCode::OK);

    let row = app.store.get_by_user_tenant("u1", "t1").await.unwrap().unwrap();
    assert!(!row.cancel_at_period_end);

    assert_eq!(
        *app.gateway.calls.lock(),
        vec![("sub_123".to_string(), true), ("sub_123".to_string(), false)]
    );

    let changes = app.notifier.changes.lock();
    let emails: Vec<_> = changes.iter().map(|c| c.email.clone()).collect();
    assert_eq!(
        emails,
        vec![
            None,
            Some("u1@example.com".to_string()),
            Some("u1@example.com".to_string())
        ]
    );
}

#[tokio::test]
async fn test_admin_cancel_unknown_user() {
    let app = TestApp::new();
    let (status, _) = app.admin("POST", "/payments/cancel/nobody", Some("t1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(app.gateway.calls.lock().is_empty());
}
