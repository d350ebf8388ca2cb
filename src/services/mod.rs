//! Business services behind the HTTP handlers and background workers.

pub mod cart;
pub mod checkout_sessions;
pub mod commit_intents;
pub mod idempotency;
pub mod inventory_reservations;
pub mod order_commit;
pub mod payment_webhooks;
pub mod pricing;

pub use cart::{CartSource, DbCartSource};
pub use checkout_sessions::CheckoutSessionManager;
pub use commit_intents::{CommitIntentSettler, SettlementSignal};
pub use idempotency::IdempotencyLedger;
pub use inventory_reservations::InventoryReservationManager;
pub use order_commit::OrderCommitService;
pub use payment_webhooks::PaymentWebhookProcessor;
