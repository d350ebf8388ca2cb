mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::http::{Method, StatusCode};
use chrono::{Duration, Utc};
use common::{admin_headers, FailingPublisher, TestApp};
use order_pipeline::config::OutboxConfig;
use order_pipeline::entities::outbox_event::{self, OutboxStatus};
use order_pipeline::events::consumer::OrderEventConsumer;
use order_pipeline::events::outbox::DrainReport;
use order_pipeline::events::{enqueue, topics, InMemoryPublisher, NewOutboxEvent, OutboxRelay};
use sea_orm::{sea_query::Expr, ColumnTrait, EntityTrait, QueryFilter};
use serde_json::json;
use tokio::sync::{broadcast, watch};

async fn enqueue_paid(app: &TestApp, order_id: i64) -> i64 {
    let created = enqueue(
        &*app.db,
        NewOutboxEvent::new(
            topics::ORDER_PAID,
            "order",
            order_id,
            json!({ "order_id": order_id, "amount": 2600 }),
        ),
    )
    .await
    .unwrap();
    assert!(created);
    app.outbox()
        .await
        .into_iter()
        .find(|e| e.aggregate_id == order_id.to_string())
        .unwrap()
        .id
}

async fn event(app: &TestApp, id: i64) -> outbox_event::Model {
    outbox_event::Entity::find_by_id(id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap()
}

async fn make_due(app: &TestApp, id: i64) {
    outbox_event::Entity::update_many()
        .col_expr(
            outbox_event::Column::NextRetryAt,
            Expr::value(Utc::now() - Duration::seconds(1)),
        )
        .filter(outbox_event::Column::Id.eq(id))
        .exec(&*app.db)
        .await
        .unwrap();
}

#[tokio::test]
async fn enqueue_is_deduplicated() {
    let app = TestApp::new().await;
    enqueue_paid(&app, 11).await;

    let again = enqueue(
        &*app.db,
        NewOutboxEvent::new(topics::ORDER_PAID, "order", 11, json!({ "order_id": 11 })),
    )
    .await
    .unwrap();
    assert!(!again);
    assert_eq!(app.outbox().await.len(), 1);
}

// The test database has a single pooled connection, so the two inserts are
// serialized; the unique dedupe key still decides which one lands.
#[tokio::test]
async fn simultaneous_enqueues_insert_one_row() {
    let app = TestApp::new().await;
    let paid = || NewOutboxEvent::new(topics::ORDER_PAID, "order", 31, json!({ "order_id": 31 }));

    let (a, b) = tokio::join!(enqueue(&*app.db, paid()), enqueue(&*app.db, paid()));
    let created = [a.unwrap(), b.unwrap()];
    assert_eq!(created.iter().filter(|c| **c).count(), 1);
    assert_eq!(app.outbox().await.len(), 1);
}

#[tokio::test]
async fn relay_publishes_pending_events() {
    let app = TestApp::new().await;
    let id = enqueue_paid(&app, 12).await;
    let mut deliveries = app.bus.subscribe().unwrap();

    let relay = app.relay(app.bus.publisher.clone());
    let report = relay.drain_once().await.unwrap();
    assert_eq!(
        report,
        DrainReport {
            claimed: 1,
            sent: 1,
            ..Default::default()
        }
    );

    let delivery = deliveries.recv().await.unwrap();
    assert_eq!(delivery.topic, "order.paid");
    assert_eq!(delivery.message.outbox_id, id);
    assert_eq!(delivery.message.payload["amount"], 2600);

    let sent = event(&app, id).await;
    assert_eq!(sent.status, OutboxStatus::Sent);
    assert_eq!(sent.broker_message_id.as_deref(), Some(delivery.broker_message_id.as_str()));
    assert!(sent.sent_at.is_some());
    assert!(sent.locked_until.is_none());

    // Nothing left to relay.
    assert_eq!(relay.drain_once().await.unwrap().claimed, 0);
}

#[tokio::test]
async fn leased_events_are_hidden_until_the_lease_lapses() {
    let app = TestApp::new().await;
    let id = enqueue_paid(&app, 17).await;
    let relay = app.relay(app.bus.publisher.clone());

    // A worker claims the event and then stalls.
    let claimed = relay.claim_batch(Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let leased = event(&app, id).await;
    assert_eq!(leased.status, OutboxStatus::Pending);
    assert!(leased.locked_until.unwrap() > Utc::now());

    let other_worker = app.relay(app.bus.publisher.clone());
    assert!(other_worker.claim_batch(Utc::now()).await.unwrap().is_empty());
    assert_eq!(other_worker.drain_once().await.unwrap().claimed, 0);

    outbox_event::Entity::update_many()
        .col_expr(
            outbox_event::Column::LockedUntil,
            Expr::value(Utc::now() - Duration::seconds(1)),
        )
        .filter(outbox_event::Column::Id.eq(id))
        .exec(&*app.db)
        .await
        .unwrap();

    let report = other_worker.drain_once().await.unwrap();
    assert_eq!(
        report,
        DrainReport {
            claimed: 1,
            sent: 1,
            ..Default::default()
        }
    );
    let sent = event(&app, id).await;
    assert_eq!(sent.status, OutboxStatus::Sent);
    assert_eq!(sent.attempts, 0);
}

#[tokio::test]
async fn failed_publishes_back_off_then_dead_letter() {
    let app = TestApp::new().await;
    let id = enqueue_paid(&app, 13).await;
    let publisher = Arc::new(FailingPublisher::default());
    let relay = OutboxRelay::new(
        app.db.clone(),
        publisher.clone(),
        OutboxConfig {
            max_attempts: 2,
            ..OutboxConfig::default()
        },
    );

    let first = relay.drain_once().await.unwrap();
    assert_eq!(first.retried, 1);
    assert_eq!(first.dead_lettered, 0);
    let pending = event(&app, id).await;
    assert_eq!(pending.status, OutboxStatus::Pending);
    assert_eq!(pending.attempts, 1);
    assert!(pending.next_retry_at.unwrap() > Utc::now());
    assert!(pending.last_error.as_deref().unwrap().contains("broker unavailable"));

    // Backing off: not claimable yet.
    assert_eq!(relay.drain_once().await.unwrap().claimed, 0);

    make_due(&app, id).await;
    let second = relay.drain_once().await.unwrap();
    assert_eq!(second.dead_lettered, 1);
    let failed = event(&app, id).await;
    assert_eq!(failed.status, OutboxStatus::Failed);
    assert_eq!(failed.attempts, 2);
    assert_eq!(publisher.attempts.load(Ordering::SeqCst), 2);

    make_due(&app, id).await;
    assert_eq!(relay.drain_once().await.unwrap().claimed, 0);
}

#[tokio::test]
async fn operators_can_list_and_requeue_failed_events() {
    let app = TestApp::new().await;
    let id = enqueue_paid(&app, 14).await;
    let relay = OutboxRelay::new(
        app.db.clone(),
        Arc::new(FailingPublisher::default()),
        OutboxConfig {
            max_attempts: 1,
            ..OutboxConfig::default()
        },
    );
    assert_eq!(relay.drain_once().await.unwrap().dead_lettered, 1);

    let denied = app
        .request(Method::GET, "/api/v1/admin/outbox?status=FAILED", Some(1), &[], None)
        .await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);

    let listed = app
        .request(
            Method::GET,
            "/api/v1/admin/outbox?status=FAILED",
            Some(1),
            &admin_headers(),
            None,
        )
        .await;
    assert_eq!(listed.status, StatusCode::OK, "{:?}", listed.body);
    let items = listed.data().as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], id);
    assert_eq!(items[0]["status"], "FAILED");
    assert_eq!(items[0]["attempts"], 1);

    let retry_uri = format!("/api/v1/admin/outbox/{id}/retry");
    let retried = app
        .request(Method::POST, &retry_uri, Some(1), &admin_headers(), None)
        .await;
    assert_eq!(retried.status, StatusCode::OK);
    assert_eq!(retried.data()["status"], "PENDING");
    assert_eq!(retried.data()["attempts"], 0);

    let again = app
        .request(Method::POST, &retry_uri, Some(1), &admin_headers(), None)
        .await;
    assert_eq!(again.status, StatusCode::CONFLICT);

    let missing = app
        .request(
            Method::POST,
            "/api/v1/admin/outbox/9999/retry",
            Some(1),
            &admin_headers(),
            None,
        )
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);

    // Requeued events relay normally.
    let report = app.relay(app.bus.publisher.clone()).drain_once().await.unwrap();
    assert_eq!(report.sent, 1);
}

#[tokio::test]
async fn consumer_turns_paid_orders_into_fulfillment_requests() {
    let app = TestApp::new().await;
    let id = enqueue_paid(&app, 15).await;
    let mut deliveries = app.bus.subscribe().unwrap();
    app.relay(app.bus.publisher.clone()).drain_once().await.unwrap();
    let delivery = deliveries.recv().await.unwrap();

    let consumer = OrderEventConsumer::new(app.db.clone());
    assert!(consumer.handle(&delivery).await.unwrap());
    // Redelivery is harmless.
    assert!(consumer.handle(&delivery).await.unwrap());

    assert_eq!(event(&app, id).await.status, OutboxStatus::Done);
    let follow_ups: Vec<outbox_event::Model> = app
        .outbox()
        .await
        .into_iter()
        .filter(|e| e.topic == topics::ORDER_RECEIVED_FOR_FULFILLMENT)
        .collect();
    assert_eq!(follow_ups.len(), 1);
    assert_eq!(follow_ups[0].aggregate_id, "15");
    assert_eq!(follow_ups[0].status, OutboxStatus::Pending);
    assert_eq!(follow_ups[0].payload["order_id"], 15);
}

#[tokio::test]
async fn consumer_ignores_topics_it_does_not_handle() {
    let app = TestApp::new().await;
    enqueue(
        &*app.db,
        NewOutboxEvent::new(topics::ORDER_CONFIRMED, "order", 16, json!({ "order_id": 16 })),
    )
    .await
    .unwrap();
    let mut deliveries = app.bus.subscribe().unwrap();
    app.relay(app.bus.publisher.clone()).drain_once().await.unwrap();
    let delivery = deliveries.recv().await.unwrap();

    let consumer = OrderEventConsumer::new(app.db.clone());
    assert!(!consumer.handle(&delivery).await.unwrap());
    assert_eq!(app.outbox().await.len(), 1);
    assert_eq!(app.outbox().await[0].status, OutboxStatus::Sent);
}

#[tokio::test]
async fn consumer_recovers_deliveries_dropped_by_a_lagging_receiver() {
    let app = TestApp::new().await;
    let first = enqueue_paid(&app, 18).await;
    let second = enqueue_paid(&app, 19).await;

    let bus = Arc::new(InMemoryPublisher::new(1));
    let mut deliveries = bus.subscribe();
    let report = app.relay(bus.clone()).drain_once().await.unwrap();
    assert_eq!(report.sent, 2);
    assert!(matches!(
        deliveries.try_recv(),
        Err(broadcast::error::TryRecvError::Lagged(1))
    ));
    assert_eq!(event(&app, first).await.status, OutboxStatus::Sent);

    let consumer = OrderEventConsumer::new(app.db.clone());
    assert_eq!(consumer.catch_up().await.unwrap(), 2);
    assert_eq!(event(&app, first).await.status, OutboxStatus::Done);
    assert_eq!(event(&app, second).await.status, OutboxStatus::Done);

    // The delivery still buffered on the bus is a harmless repeat.
    let buffered = deliveries.try_recv().unwrap();
    assert_eq!(buffered.message.outbox_id, second);
    assert!(consumer.handle(&buffered).await.unwrap());
    assert_eq!(consumer.catch_up().await.unwrap(), 0);

    let follow_ups: Vec<String> = app
        .outbox()
        .await
        .into_iter()
        .filter(|e| e.topic == topics::ORDER_RECEIVED_FOR_FULFILLMENT)
        .map(|e| e.aggregate_id)
        .collect();
    assert_eq!(follow_ups, vec!["18".to_string(), "19".to_string()]);
}

#[tokio::test]
async fn consumer_worker_handles_events_sent_before_it_started() {
    let app = TestApp::new().await;
    let id = enqueue_paid(&app, 20).await;

    // Published while nobody was listening.
    let bus = Arc::new(InMemoryPublisher::new(8));
    app.relay(bus.clone()).drain_once().await.unwrap();
    assert_eq!(event(&app, id).await.status, OutboxStatus::Sent);

    let (shutdown, shutdown_rx) = watch::channel(false);
    let consumer = OrderEventConsumer::new(app.db.clone());
    let worker = tokio::spawn(consumer.run(bus.subscribe(), shutdown_rx));

    let mut status = OutboxStatus::Sent;
    for _ in 0..50 {
        status = event(&app, id).await.status;
        if status == OutboxStatus::Done {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    shutdown.send(true).unwrap();
    worker.await.unwrap();

    assert_eq!(status, OutboxStatus::Done);
    assert!(app
        .outbox_topics()
        .await
        .contains(&topics::ORDER_RECEIVED_FOR_FULFILLMENT.to_string()));
}
