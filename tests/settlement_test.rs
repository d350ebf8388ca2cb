mod common;

use assert_matches::assert_matches;
use axum::http::{Method, StatusCode};
use chrono::Utc;
use common::TestApp;
use order_pipeline::config::SettlerConfig;
use order_pipeline::entities::commit_intent::{self, CommitIntentStatus};
use order_pipeline::entities::inventory_reservation::{self, ReservationStatus};
use order_pipeline::entities::{outbox_event, product};
use order_pipeline::services::commit_intents::Settlement;
use order_pipeline::workers::{MaintenanceReport, MaintenanceSweep};
use sea_orm::{sea_query::Expr, ColumnTrait, EntityTrait, QueryFilter};

async fn cod_order(app: &TestApp, product_id: i64, qty: i32, key: &str) -> i64 {
    app.add_to_cart(4, product_id, qty).await;
    let placed = app.place_order(4, "cod", key).await;
    assert_eq!(placed.status, StatusCode::CREATED, "{:?}", placed.body);
    app.order_by_public_id(placed.data()["order_id"].as_str().unwrap())
        .await
        .id
}

async fn set_stock(app: &TestApp, product_id: i64, qty: i32) {
    product::Entity::update_many()
        .col_expr(product::Column::StockQty, Expr::value(qty))
        .filter(product::Column::Id.eq(product_id))
        .exec(&*app.db)
        .await
        .unwrap();
}

#[tokio::test]
async fn settlement_decrements_stock_exactly_once() {
    let app = TestApp::new().await;
    let product = app.seed_product("Sona Masoori 10kg", 1150, 8).await;
    let order_id = cod_order(&app, product, 3, "settle-once").await;

    let settler = app.settler();
    let first = settler.settle_order(order_id).await.unwrap();
    assert_matches!(
        first.as_slice(),
        [Settlement::Settled { order_id: id, decremented }]
            if *id == order_id && decremented.get(&product) == Some(&3)
    );
    assert_eq!(app.stock(product).await, 5);

    let second = settler.settle_order(order_id).await.unwrap();
    assert_eq!(second, vec![Settlement::Skipped]);
    assert!(settler.run_due().await.unwrap().is_empty());
    assert_eq!(app.stock(product).await, 5);

    let intent = &app.commit_intents(order_id).await[0];
    assert_eq!(intent.status, CommitIntentStatus::Done);
    assert_eq!(intent.attempts, 1);
    assert!(intent.last_error.is_none());

    let events = app.outbox().await;
    let committed: Vec<&outbox_event::Model> = events
        .iter()
        .filter(|e| e.topic == "inventory.committed")
        .collect();
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].dedupe_key, format!("inventory.committed:{order_id}"));
    assert_eq!(committed[0].aggregate_type, "inventory");
    assert_eq!(committed[0].payload["items"][0]["quantity"], 3);
    assert!(events.iter().any(|e| e.topic == "order.confirmed"));
}

#[tokio::test]
async fn sweep_settles_due_intents_without_a_signal() {
    let app = TestApp::new().await;
    let product = app.seed_product("Toor Dal 1kg", 165, 10).await;
    let order_id = cod_order(&app, product, 2, "sweep-key").await;

    let results = app.settler().run_due().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_matches!(&results[0], Settlement::Settled { order_id: id, .. } if *id == order_id);
    assert_eq!(app.stock(product).await, 8);
}

#[tokio::test]
async fn failed_settlement_rolls_back_and_schedules_a_retry() {
    let app = TestApp::new().await;
    let product = app.seed_product("Almonds 500g", 899, 5).await;
    let order_id = cod_order(&app, product, 4, "retry-key").await;

    // Stock vanished between reservation and settlement.
    set_stock(&app, product, 2).await;

    let before = Utc::now();
    let results = app.settler().settle_order(order_id).await.unwrap();
    assert_matches!(
        results.as_slice(),
        [Settlement::RetryScheduled { attempts: 1, retry_at }] if *retry_at >= before
    );

    assert_eq!(app.stock(product).await, 2);
    let intent = &app.commit_intents(order_id).await[0];
    assert_eq!(intent.status, CommitIntentStatus::Pending);
    assert_eq!(intent.attempts, 1);
    assert!(intent.last_error.as_deref().unwrap().contains("Insufficient stock"));
    let retry_at = intent.next_retry_at.unwrap();
    let delay = retry_at - intent.updated_at;
    assert_eq!(delay.num_seconds(), 60);

    let reservations = app.reservations().await;
    assert_eq!(reservations[0].status, ReservationStatus::Active);
    assert!(!app.outbox_topics().await.contains(&"inventory.committed".to_string()));

    // Not due yet.
    assert!(app.settler().run_due().await.unwrap().is_empty());

    // Once restocked and due, the retry settles.
    set_stock(&app, product, 5).await;
    commit_intent::Entity::update_many()
        .col_expr(commit_intent::Column::NextRetryAt, Expr::value(Utc::now()))
        .filter(commit_intent::Column::OrderId.eq(order_id))
        .exec(&*app.db)
        .await
        .unwrap();
    let retried = app.settler().run_due().await.unwrap();
    assert_matches!(retried.as_slice(), [Settlement::Settled { .. }]);
    assert_eq!(app.stock(product).await, 1);
    assert_eq!(app.commit_intents(order_id).await[0].attempts, 2);
}

#[tokio::test]
async fn late_settlement_does_not_take_stock_held_by_another_checkout() {
    let app = TestApp::new().await;
    let product = app.seed_product("Basmati Rice 5kg", 780, 6).await;
    let order_id = cod_order(&app, product, 5, "late-key").await;

    // The order's own hold lapses before the settler gets to it.
    inventory_reservation::Entity::update_many()
        .col_expr(
            inventory_reservation::Column::ReservedUntil,
            Expr::value(Utc::now() - chrono::Duration::minutes(1)),
        )
        .filter(inventory_reservation::Column::OrderId.eq(order_id))
        .exec(&*app.db)
        .await
        .unwrap();

    app.add_to_cart(7, product, 5).await;
    let other_checkout = app.start_checkout(7).await;
    assert_eq!(app.order_summary(7, other_checkout, "cod").await.status, StatusCode::OK);

    let results = app.settler().settle_order(order_id).await.unwrap();
    assert_matches!(results.as_slice(), [Settlement::RetryScheduled { attempts: 1, .. }]);
    assert_eq!(app.stock(product).await, 6);
    let intent = &app.commit_intents(order_id).await[0];
    assert!(intent.last_error.as_deref().unwrap().contains("held_elsewhere=5"));

    let now = Utc::now();
    let held: i32 = app
        .reservations()
        .await
        .iter()
        .filter(|r| r.is_live(now))
        .map(|r| r.quantity)
        .sum();
    assert!(app.stock(product).await - held >= 0);

    // Once the other checkout lets go, the retry goes through on plain stock.
    let cancelled = app
        .request(
            Method::POST,
            &format!("/api/v1/checkout/{other_checkout}/cancel"),
            Some(7),
            &[],
            None,
        )
        .await;
    assert_eq!(cancelled.status, StatusCode::OK);
    commit_intent::Entity::update_many()
        .col_expr(commit_intent::Column::NextRetryAt, Expr::value(Utc::now()))
        .filter(commit_intent::Column::OrderId.eq(order_id))
        .exec(&*app.db)
        .await
        .unwrap();
    let retried = app.settler().run_due().await.unwrap();
    assert_matches!(
        retried.as_slice(),
        [Settlement::Settled { decremented, .. }] if decremented.get(&product) == Some(&5)
    );
    assert_eq!(app.stock(product).await, 1);
    let own = app
        .reservations()
        .await
        .into_iter()
        .find(|r| r.order_id == Some(order_id))
        .unwrap();
    assert_eq!(own.status, ReservationStatus::Expired);
}

#[tokio::test]
async fn exhausted_intent_is_marked_failed() {
    let app = TestApp::new().await;
    let product = app.seed_product("Cashews 250g", 499, 3).await;
    let order_id = cod_order(&app, product, 3, "exhaust-key").await;
    set_stock(&app, product, 0).await;

    let settler = app.settler_with(SettlerConfig {
        max_attempts: 1,
        ..SettlerConfig::default()
    });
    let results = settler.settle_order(order_id).await.unwrap();
    assert_eq!(results, vec![Settlement::Failed { attempts: 1 }]);

    let intent = &app.commit_intents(order_id).await[0];
    assert_eq!(intent.status, CommitIntentStatus::Failed);
    assert!(intent.last_error.is_some());
    assert!(settler.run_due().await.unwrap().is_empty());
}

#[tokio::test]
async fn stuck_processing_intent_is_reclaimed_after_its_lease() {
    let app = TestApp::new().await;
    let product = app.seed_product("Pistachio 200g", 620, 4).await;
    let order_id = cod_order(&app, product, 1, "lease-key").await;

    // Simulate a worker that claimed the intent and died.
    commit_intent::Entity::update_many()
        .col_expr(commit_intent::Column::Status, Expr::value(CommitIntentStatus::Processing))
        .col_expr(commit_intent::Column::Attempts, Expr::value(1))
        .col_expr(
            commit_intent::Column::UpdatedAt,
            Expr::value(Utc::now() - chrono::Duration::minutes(10)),
        )
        .filter(commit_intent::Column::OrderId.eq(order_id))
        .exec(&*app.db)
        .await
        .unwrap();

    let results = app.settler().run_due().await.unwrap();
    assert_matches!(results.as_slice(), [Settlement::Settled { .. }]);
    assert_eq!(app.commit_intents(order_id).await[0].attempts, 2);
    assert_eq!(app.stock(product).await, 3);
}

#[tokio::test]
async fn maintenance_sweep_expires_sessions_and_reservations() {
    let app = TestApp::new().await;
    let product = app.seed_product("Poha 500g", 70, 5).await;
    app.add_to_cart(4, product, 2).await;
    let checkout_id = app.start_checkout(4).await;
    assert_eq!(app.order_summary(4, checkout_id, "cod").await.status, StatusCode::OK);

    let sweep = MaintenanceSweep::new(
        app.state.services.checkout.clone(),
        order_pipeline::services::InventoryReservationManager::new(app.db.clone()),
        order_pipeline::services::IdempotencyLedger::new(
            app.db.clone(),
            app.state.config.checkout.idempotency_ttl(),
        ),
    );
    assert_eq!(sweep.run_once(Utc::now()).await.unwrap(), MaintenanceReport::default());

    let later = Utc::now() + chrono::Duration::hours(2);
    let report = sweep.run_once(later).await.unwrap();
    assert_eq!(report.sessions_expired, 1);
    assert_eq!(report.reservations_expired, 1);
    assert!(!app.session(checkout_id).await.is_active);
    assert_eq!(app.reservations().await[0].status, ReservationStatus::Expired);
}
