//! sea-orm entities backing the checkout, order and event tables.

pub mod cart_item;
pub mod checkout_session;
pub mod commit_intent;
pub mod idempotency_key;
pub mod inventory_reservation;
pub mod named_lock;
pub mod order;
pub mod order_item;
pub mod outbox_event;
pub mod payment;
pub mod payment_webhook_event;
pub mod product;
