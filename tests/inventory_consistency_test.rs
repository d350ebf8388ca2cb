mod common;

use assert_matches::assert_matches;
use axum::http::StatusCode;
use chrono::{Duration, Utc};
use common::TestApp;
use order_pipeline::entities::inventory_reservation::{self, ReservationStatus};
use sea_orm::{sea_query::Expr, EntityTrait};
use order_pipeline::services::commit_intents::Settlement;

#[tokio::test]
async fn concurrent_checkouts_never_oversell() {
    let app = TestApp::new().await;
    let product = app.seed_product("Cold Pressed Oil 1L", 380, 6).await;
    app.add_to_cart(1, product, 5).await;
    app.add_to_cart(2, product, 5).await;

    let first_checkout = app.start_checkout(1).await;
    let second_checkout = app.start_checkout(2).await;

    let (first, second) = tokio::join!(
        app.order_summary(1, first_checkout, "cod"),
        app.order_summary(2, second_checkout, "cod"),
    );
    let mut statuses = [first.status, second.status];
    statuses.sort();
    assert_eq!(statuses, [StatusCode::OK, StatusCode::CONFLICT]);

    let loser = if first.status == StatusCode::CONFLICT { &first } else { &second };
    assert_eq!(loser.error_code(), Some("insufficient_stock"));
    assert!(loser.body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("requested=5, available=1"));

    let (winner_user, winner_checkout) = if first.status == StatusCode::OK {
        (1, first_checkout)
    } else {
        (2, second_checkout)
    };
    let placed = app.confirm(winner_user, winner_checkout, Some("oversell-key-1")).await;
    assert_eq!(placed.status, StatusCode::CREATED, "{:?}", placed.body);
    assert_eq!(placed.data()["status"], "CONFIRMED");

    let order = app
        .order_by_public_id(placed.data()["order_id"].as_str().unwrap())
        .await;
    let results = app.settler().settle_order(order.id).await.unwrap();
    assert_matches!(results.as_slice(), [Settlement::Settled { .. }]);
    assert_eq!(app.stock(product).await, 1);

    let reservations = app.reservations().await;
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0].status, ReservationStatus::Committed);
    assert_eq!(reservations[0].order_id, Some(order.id));
}

#[tokio::test]
async fn reservation_is_all_or_nothing() {
    let app = TestApp::new().await;
    let plenty = app.seed_product("Basmati Rice 5kg", 899, 10).await;
    let scarce = app.seed_product("Kashmiri Chilli 100g", 210, 1).await;
    app.add_to_cart(3, plenty, 2).await;
    app.add_to_cart(3, scarce, 2).await;

    let checkout_id = app.start_checkout(3).await;
    let response = app.order_summary(3, checkout_id, "upi").await;
    assert_eq!(response.status, StatusCode::CONFLICT);
    let message = response.body["error"]["message"].as_str().unwrap().to_string();
    assert!(message.contains(&format!("product {scarce}")), "{message}");
    assert!(!message.contains(&format!("product {plenty}:")), "{message}");

    assert!(app.reservations().await.is_empty());
    assert_eq!(app.stock(plenty).await, 10);
    assert_eq!(app.stock(scarce).await, 1);
}

#[tokio::test]
async fn expired_reservations_stop_counting_against_stock() {
    let app = TestApp::new().await;
    let product = app.seed_product("Ghee 500ml", 540, 3).await;
    app.add_to_cart(1, product, 3).await;
    app.add_to_cart(2, product, 3).await;

    let first = app.start_checkout(1).await;
    assert_eq!(app.order_summary(1, first, "cod").await.status, StatusCode::OK);

    let second = app.start_checkout(2).await;
    assert_eq!(app.order_summary(2, second, "cod").await.status, StatusCode::CONFLICT);

    // Age the first reservation past its deadline.
    inventory_reservation::Entity::update_many()
        .col_expr(
            inventory_reservation::Column::ReservedUntil,
            Expr::value(Utc::now() - Duration::minutes(1)),
        )
        .exec(&*app.db)
        .await
        .unwrap();

    assert_eq!(app.order_summary(2, second, "cod").await.status, StatusCode::OK);
}
