#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{HeaderMap, Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

use order_pipeline::{
    auth::{USER_ID_HEADER, USER_ROLES_HEADER},
    config::{AppConfig, SettlerConfig},
    db,
    entities::{
        cart_item, checkout_session, commit_intent, inventory_reservation, order, outbox_event,
        payment, product,
    },
    errors::ServiceError,
    events::{OutboxMessage, OutboxRelay, Publisher},
    gateway::{
        sign_payload, verify_signature, PaymentGateway, RemoteOrderRequest, EVENT_ID_HEADER,
        SIGNATURE_HEADER,
    },
    services::{CommitIntentSettler, DbCartSource, InventoryReservationManager, SettlementSignal},
    workers::EventBus,
    AppState,
};

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const PROVIDER: &str = "razorpay";

/// Gateway double: hands out sequential remote order ids and checks
/// signatures with the real HMAC routine.
pub struct FakeGateway {
    created: AtomicUsize,
    failures_remaining: AtomicUsize,
    requests: Mutex<Vec<RemoteOrderRequest>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            created: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// The next `n` remote order calls fail with a gateway error.
    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<RemoteOrderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_remote_order(
        &self,
        request: &RemoteOrderRequest,
    ) -> Result<String, ServiceError> {
        self.requests.lock().unwrap().push(request.clone());
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ServiceError::ExternalServiceError(
                "payment gateway returned 502 Bad Gateway".into(),
            ));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("order_test_{n}"))
    }

    fn verify_webhook_signature(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
    ) -> Result<Value, ServiceError> {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ServiceError::InvalidSignature)?;
        if !verify_signature(WEBHOOK_SECRET, raw_body, signature) {
            return Err(ServiceError::InvalidSignature);
        }
        serde_json::from_slice(raw_body).map_err(|e| ServiceError::BadRequest(e.to_string()))
    }
}

/// Publisher whose broker is always down.
#[derive(Default)]
pub struct FailingPublisher {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl Publisher for FailingPublisher {
    async fn publish(&self, _topic: &str, _message: &OutboxMessage) -> Result<String, ServiceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ServiceError::QueueError("broker unavailable".into()))
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    pub fn data(&self) -> &Value {
        &self.body["data"]
    }

    pub fn error_code(&self) -> Option<&str> {
        self.body["error"]["code"].as_str()
    }
}

/// Application wired against a throwaway SQLite file.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub db: Arc<DatabaseConnection>,
    pub gateway: Arc<FakeGateway>,
    pub bus: EventBus,
    pub settlement_rx: mpsc::Receiver<i64>,
    _dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let db_path = dir.path().join("pipeline.db");
        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.run_workers = false;
        cfg.payment.provider = PROVIDER.to_string();
        cfg.payment.webhook_secret = WEBHOOK_SECRET.to_string();
        cfg.retry.initial_delay_ms = 1;
        cfg.retry.max_delay_ms = 5;
        customize(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db = Arc::new(pool);
        let gateway = Arc::new(FakeGateway::new());
        let (settlement, settlement_rx) = SettlementSignal::channel(64);
        let state = AppState::new(
            db.clone(),
            cfg,
            Arc::new(DbCartSource::new(db.clone())),
            gateway.clone(),
            settlement,
        );
        let router = order_pipeline::app_router(state.clone());

        Self {
            router,
            state,
            db,
            gateway,
            bus: EventBus::in_memory(64),
            settlement_rx,
            _dir: dir,
        }
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        user_id: Option<i64>,
        extra_headers: &[(&str, String)],
        body: Option<Vec<u8>>,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user_id) = user_id {
            builder = builder.header(USER_ID_HEADER, user_id.to_string());
        }
        for (name, value) in extra_headers {
            builder = builder.header(*name, value.as_str());
        }
        let request = match body {
            Some(bytes) => builder
                .header("content-type", "application/json")
                .body(Body::from(bytes)),
            None => builder.body(Body::empty()),
        }
        .expect("request");

        let response = self.router.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        TestResponse {
            status,
            headers,
            body,
        }
    }

    // ----- seeding -----

    pub async fn seed_product(&self, name: &str, base_price: i64, stock_qty: i32) -> i64 {
        product::ActiveModel {
            name: Set(name.to_string()),
            base_price: Set(base_price),
            stock_qty: Set(stock_qty),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .expect("seed product")
        .id
    }

    pub async fn add_to_cart(&self, user_id: i64, product_id: i64, quantity: i32) {
        cart_item::ActiveModel {
            user_id: Set(user_id),
            product_id: Set(product_id),
            quantity: Set(quantity),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .expect("seed cart item");
    }

    // ----- checkout flow -----

    pub async fn initiate(&self, user_id: i64) -> TestResponse {
        self.request(Method::POST, "/api/v1/checkout/initiate", Some(user_id), &[], None)
            .await
    }

    pub async fn start_checkout(&self, user_id: i64) -> Uuid {
        let response = self.initiate(user_id).await;
        assert!(response.status.is_success(), "initiate failed: {:?}", response.body);
        response.data()["checkout_id"]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .expect("checkout id")
    }

    pub async fn order_summary(&self, user_id: i64, checkout_id: Uuid, method: &str) -> TestResponse {
        let body = serde_json::json!({ "payment_method": method });
        self.request(
            Method::POST,
            &format!("/api/v1/checkout/{checkout_id}/order-summary"),
            Some(user_id),
            &[],
            Some(serde_json::to_vec(&body).unwrap()),
        )
        .await
    }

    pub async fn confirm(&self, user_id: i64, checkout_id: Uuid, key: Option<&str>) -> TestResponse {
        let headers: Vec<(&str, String)> = key
            .map(|k| vec![("idempotency-key", k.to_string())])
            .unwrap_or_default();
        self.request(
            Method::POST,
            &format!("/api/v1/checkout/{checkout_id}/secure-confirm"),
            Some(user_id),
            &headers,
            None,
        )
        .await
    }

    /// initiate + order-summary + secure-confirm for the user's current cart.
    pub async fn place_order(&self, user_id: i64, method: &str, key: &str) -> TestResponse {
        let checkout_id = self.start_checkout(user_id).await;
        let summary = self.order_summary(user_id, checkout_id, method).await;
        assert_eq!(summary.status, StatusCode::OK, "order-summary failed: {:?}", summary.body);
        self.confirm(user_id, checkout_id, Some(key)).await
    }

    pub async fn send_webhook(&self, event_id: Option<&str>, payload: &Value) -> TestResponse {
        let body = serde_json::to_vec(payload).unwrap();
        let signature = sign_payload(WEBHOOK_SECRET, &body).unwrap();
        let mut headers = vec![(SIGNATURE_HEADER, signature)];
        if let Some(event_id) = event_id {
            headers.push((EVENT_ID_HEADER, event_id.to_string()));
        }
        self.request(Method::POST, "/api/v1/payments/webhook", None, &headers, Some(body))
            .await
    }

    // ----- workers -----

    pub fn settler(&self) -> CommitIntentSettler {
        self.settler_with(self.state.config.settler.clone())
    }

    pub fn settler_with(&self, config: SettlerConfig) -> CommitIntentSettler {
        CommitIntentSettler::new(
            self.db.clone(),
            InventoryReservationManager::new(self.db.clone()),
            config,
        )
    }

    pub fn relay(&self, publisher: Arc<dyn Publisher>) -> OutboxRelay {
        OutboxRelay::new(self.db.clone(), publisher, self.state.config.outbox.clone())
    }

    // ----- inspection -----

    pub async fn stock(&self, product_id: i64) -> i32 {
        product::Entity::find_by_id(product_id)
            .one(&*self.db)
            .await
            .unwrap()
            .expect("product")
            .stock_qty
    }

    pub async fn orders(&self) -> Vec<order::Model> {
        order::Entity::find()
            .order_by_asc(order::Column::Id)
            .all(&*self.db)
            .await
            .unwrap()
    }

    pub async fn order_by_public_id(&self, public_id: &str) -> order::Model {
        let public_id = Uuid::parse_str(public_id).expect("order uuid");
        order::Entity::find()
            .filter(order::Column::PublicId.eq(public_id))
            .one(&*self.db)
            .await
            .unwrap()
            .expect("order")
    }

    pub async fn payment_for(&self, order_id: i64) -> payment::Model {
        payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .one(&*self.db)
            .await
            .unwrap()
            .expect("payment")
    }

    pub async fn commit_intents(&self, order_id: i64) -> Vec<commit_intent::Model> {
        commit_intent::Entity::find()
            .filter(commit_intent::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await
            .unwrap()
    }

    pub async fn reservations(&self) -> Vec<inventory_reservation::Model> {
        inventory_reservation::Entity::find()
            .order_by_asc(inventory_reservation::Column::Id)
            .all(&*self.db)
            .await
            .unwrap()
    }

    pub async fn outbox(&self) -> Vec<outbox_event::Model> {
        outbox_event::Entity::find()
            .order_by_asc(outbox_event::Column::Id)
            .all(&*self.db)
            .await
            .unwrap()
    }

    pub async fn outbox_topics(&self) -> Vec<String> {
        self.outbox().await.into_iter().map(|e| e.topic).collect()
    }

    pub async fn session_for_order(&self, order_id: i64) -> Uuid {
        checkout_session::Entity::find()
            .filter(checkout_session::Column::OrderId.eq(order_id))
            .one(&*self.db)
            .await
            .unwrap()
            .expect("session for order")
            .public_id
    }

    pub async fn session(&self, checkout_id: Uuid) -> checkout_session::Model {
        checkout_session::Entity::find()
            .filter(checkout_session::Column::PublicId.eq(checkout_id))
            .one(&*self.db)
            .await
            .unwrap()
            .expect("session")
    }
}

pub fn admin_headers() -> Vec<(&'static str, String)> {
    vec![(USER_ROLES_HEADER, "admin".to_string())]
}

/// Gateway notification body for one payment state change.
pub fn payment_notification(event: &str, provider_order_id: &str, payment_id: &str, status: &str) -> Value {
    serde_json::json!({
        "entity": "event",
        "event": event,
        "payload": {
            "payment": {
                "entity": {
                    "id": payment_id,
                    "order_id": provider_order_id,
                    "status": status,
                    "method": "upi"
                }
            }
        }
    })
}
