pub mod checkout;
pub mod orders;
pub mod outbox_admin;
pub mod payment_webhooks;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::gateway::PaymentGateway;
use crate::services::{
    CartSource, CheckoutSessionManager, IdempotencyLedger, InventoryReservationManager,
    OrderCommitService, PaymentWebhookProcessor, SettlementSignal,
};

pub use crate::AppState;

/// Services layer used by the HTTP handlers.
#[derive(Clone)]
pub struct AppServices {
    pub checkout: Arc<CheckoutSessionManager>,
    pub orders: Arc<OrderCommitService>,
    pub webhooks: Arc<PaymentWebhookProcessor>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        config: &AppConfig,
        cart: Arc<dyn CartSource>,
        gateway: Arc<dyn PaymentGateway>,
        settlement: SettlementSignal,
    ) -> Self {
        let reservations = InventoryReservationManager::new(db_pool.clone());
        let sessions = CheckoutSessionManager::new(
            db_pool.clone(),
            reservations.clone(),
            cart,
            config.checkout.clone(),
            config.pricing.clone(),
        );
        let ledger = IdempotencyLedger::new(db_pool.clone(), config.checkout.idempotency_ttl());
        let orders = OrderCommitService::new(
            db_pool.clone(),
            sessions.clone(),
            reservations,
            ledger,
            config.pricing.clone(),
            gateway.clone(),
            config.payment.provider.clone(),
        )
        .with_settlement_signal(settlement.clone());
        let webhooks = PaymentWebhookProcessor::new(db_pool, gateway, config.payment.provider.clone())
            .with_settlement_signal(settlement);

        Self {
            checkout: Arc::new(sessions),
            orders: Arc::new(orders),
            webhooks: Arc::new(webhooks),
        }
    }
}
