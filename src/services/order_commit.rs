//! Idempotent order placement.
//!
//! One transaction takes the named lock for the idempotency token, claims the
//! ledger row, re-validates the checkout and its reservations, writes the
//! order and stores the response. Either all of it commits or none of it does.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    ModelTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::PricingConfig;
use crate::db::NamedLock;
use crate::entities::checkout_session::PaymentMethod;
use crate::entities::commit_intent::{IntentItem, REASON_COD_CONFIRMED};
use crate::entities::order::{self, OrderStatus};
use crate::entities::{order_item, payment};
use crate::entities::payment::PaymentStatus;
use crate::errors::ServiceError;
use crate::events::{aggregates, enqueue, topics, NewOutboxEvent};
use crate::gateway::{PaymentGateway, RemoteOrderRequest};
use crate::services::checkout_sessions::CheckoutSessionManager;
use crate::services::commit_intents::{create_commit_intent, SettlementSignal};
use crate::services::idempotency::{
    request_fingerprint, IdempotencyLedger, IdempotencyToken, LedgerClaim,
};
use crate::services::inventory_reservations::InventoryReservationManager;
use crate::services::pricing::{compute_totals, OrderTotals};

pub const OWNER_ORDER_PAYMENT_PENDING: &str = "order_payment_pending";
pub const OWNER_ORDER_CONFIRMED: &str = "order_confirmed";

#[derive(Debug, Clone)]
pub struct ConfirmRequest {
    pub checkout_id: Uuid,
    pub user_id: i64,
    pub token: IdempotencyToken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReference {
    pub payment_id: Uuid,
    pub provider: String,
    pub provider_order_id: Option<String>,
    pub amount: i64,
    pub currency: String,
}

/// Response body stored in the idempotency ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub order_id: Uuid,
    pub checkout_id: Uuid,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
    pub totals: OrderTotals,
    pub payment: Option<PaymentReference>,
}

/// Result of a confirm call, fresh or replayed.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmResponse {
    pub status: u16,
    pub body: serde_json::Value,
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub payments: Vec<payment::Model>,
}

#[derive(Clone)]
pub struct OrderCommitService {
    db_pool: Arc<DatabaseConnection>,
    sessions: CheckoutSessionManager,
    reservations: InventoryReservationManager,
    ledger: IdempotencyLedger,
    pricing: PricingConfig,
    gateway: Arc<dyn PaymentGateway>,
    provider: String,
    settlement: Option<SettlementSignal>,
}

impl OrderCommitService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        sessions: CheckoutSessionManager,
        reservations: InventoryReservationManager,
        ledger: IdempotencyLedger,
        pricing: PricingConfig,
        gateway: Arc<dyn PaymentGateway>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            db_pool,
            sessions,
            reservations,
            ledger,
            pricing,
            gateway,
            provider: provider.into(),
            settlement: None,
        }
    }

    pub fn with_settlement_signal(mut self, signal: SettlementSignal) -> Self {
        self.settlement = Some(signal);
        self
    }

    /// Places the order for a checkout exactly once per idempotency token.
    #[instrument(skip(self, request), fields(checkout_id = %request.checkout_id, user_id = request.user_id, key = %request.token.as_str()))]
    pub async fn confirm(&self, request: &ConfirmRequest) -> Result<ConfirmResponse, ServiceError> {
        let now = Utc::now();
        let fingerprint = request_fingerprint(request.user_id, &request.checkout_id.to_string());

        let txn = self.db_pool.begin().await.map_err(ServiceError::db_error)?;
        let lock = NamedLock::acquire(&txn, request.token.as_str()).await?;

        match self
            .ledger
            .claim(&txn, &request.token, request.user_id, &fingerprint, now)
            .await?
        {
            LedgerClaim::Fresh => {}
            LedgerClaim::Replay { status, body } => {
                lock.release(&txn).await?;
                txn.commit().await.map_err(ServiceError::db_error)?;
                let mut response = ConfirmResponse {
                    status,
                    body,
                    replayed: true,
                };
                self.ensure_remote_order(&mut response, &request.token).await;
                return Ok(response);
            }
            LedgerClaim::InProgress => {
                txn.rollback().await.map_err(ServiceError::db_error)?;
                return Err(ServiceError::RequestInProgress);
            }
        }

        let (placed, order_db_id) = self.place(&txn, request, now).await?;
        let owner_type = match placed.status {
            OrderStatus::Confirmed => OWNER_ORDER_CONFIRMED,
            _ => OWNER_ORDER_PAYMENT_PENDING,
        };
        let body = serde_json::to_value(&placed)?;
        self.ledger
            .record_response(&txn, &request.token, owner_type, order_db_id, 201, &body)
            .await?;
        lock.release(&txn).await?;
        txn.commit().await.map_err(ServiceError::commit_db_error)?;

        metrics::counter!("orders.placed", 1);
        info!(
            order_id = %placed.order_id,
            status = ?placed.status,
            total = placed.totals.total,
            "order placed"
        );

        if placed.status == OrderStatus::Confirmed {
            if let Some(signal) = &self.settlement {
                signal.notify(order_db_id);
            }
        }

        let mut response = ConfirmResponse {
            status: 201,
            body,
            replayed: false,
        };
        self.ensure_remote_order(&mut response, &request.token).await;
        Ok(response)
    }

    /// Everything between the ledger claim and the response write.
    async fn place(
        &self,
        txn: &DatabaseTransaction,
        request: &ConfirmRequest,
        now: DateTime<Utc>,
    ) -> Result<(PlacedOrder, i64), ServiceError> {
        let checkout = self
            .sessions
            .load_for_confirm(txn, request.checkout_id, request.user_id, now)
            .await?;
        self.reservations
            .validate_against_snapshot(txn, checkout.session.id, &checkout.snapshot, now)
            .await?;

        let totals = compute_totals(&checkout.snapshot, checkout.payment_method, &self.pricing)?;
        let pay_now = checkout.payment_method.is_pay_now();
        let status = if pay_now {
            OrderStatus::PendingPayment
        } else {
            OrderStatus::Confirmed
        };

        let order = order::ActiveModel {
            public_id: Set(Uuid::new_v4()),
            user_id: Set(request.user_id),
            checkout_session_id: Set(checkout.session.id),
            status: Set(status),
            payment_method: Set(checkout.payment_method),
            currency: Set(totals.currency.clone()),
            subtotal: Set(totals.subtotal),
            tax: Set(totals.tax),
            shipping: Set(totals.shipping),
            cod_fee: Set(totals.cod_fee),
            discount: Set(totals.discount),
            total: Set(totals.total),
            placed_at: Set((!pay_now).then_some(now)),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(txn)
        .await
        .map_err(ServiceError::commit_db_error)?;

        let items: Vec<order_item::ActiveModel> = totals
            .lines
            .iter()
            .map(|line| order_item::ActiveModel {
                order_id: Set(order.id),
                product_id: Set(line.product_id),
                quantity: Set(line.quantity),
                unit_price_snapshot: Set(line.unit_price),
                tax_snapshot: Set(line.tax),
                line_total: Set(line.line_total),
                ..Default::default()
            })
            .collect();
        order_item::Entity::insert_many(items)
            .exec_without_returning(txn)
            .await
            .map_err(ServiceError::commit_db_error)?;

        let payment = if pay_now {
            let payment = payment::ActiveModel {
                public_id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                provider: Set(self.provider.clone()),
                provider_order_id: Set(None),
                provider_payment_id: Set(None),
                status: Set(PaymentStatus::Pending),
                amount: Set(totals.total),
                currency: Set(totals.currency.clone()),
                paid_at: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            }
            .insert(txn)
            .await
            .map_err(ServiceError::commit_db_error)?;
            Some(PaymentReference {
                payment_id: payment.public_id,
                provider: payment.provider,
                provider_order_id: None,
                amount: payment.amount,
                currency: payment.currency,
            })
        } else {
            enqueue(
                txn,
                NewOutboxEvent::new(
                    topics::ORDER_RECEIVED_FOR_FULFILLMENT,
                    aggregates::ORDER,
                    order.id,
                    json!({
                        "order_id": order.id,
                        "order_public_id": order.public_id,
                        "user_id": order.user_id,
                        "payment_method": order.payment_method,
                        "total": order.total,
                        "currency": order.currency,
                    }),
                ),
            )
            .await?;
            let intent_items = totals
                .lines
                .iter()
                .map(|line| IntentItem {
                    product_id: line.product_id,
                    quantity: line.quantity,
                })
                .collect();
            create_commit_intent(txn, order.id, REASON_COD_CONFIRMED, intent_items).await?;
            None
        };

        self.reservations
            .attach_order(txn, checkout.session.id, order.id)
            .await?;
        self.sessions
            .complete(txn, checkout.session.id, order.id)
            .await?;

        Ok((
            PlacedOrder {
                order_id: order.public_id,
                checkout_id: request.checkout_id,
                status,
                payment_method: checkout.payment_method,
                totals,
                payment,
            },
            order.id,
        ))
    }

    /// Makes sure a pay-now order has a gateway order. Runs after commit; a
    /// failure is logged and left for the next replay of the same token.
    async fn ensure_remote_order(&self, response: &mut ConfirmResponse, token: &IdempotencyToken) {
        let Ok(mut placed) = serde_json::from_value::<PlacedOrder>(response.body.clone()) else {
            return;
        };
        let Some(reference) = placed.payment.as_mut() else {
            return;
        };
        if reference.provider_order_id.is_some() {
            return;
        }

        match self.attach_remote_order(reference, &placed.order_id, token).await {
            Ok(provider_order_id) => {
                reference.provider_order_id = Some(provider_order_id);
                if let Ok(body) = serde_json::to_value(&placed) {
                    response.body = body;
                }
            }
            Err(err) => {
                warn!(
                    order_id = %placed.order_id,
                    error = %err,
                    "could not create remote payment order; client may retry confirm"
                );
            }
        }
    }

    async fn attach_remote_order(
        &self,
        reference: &PaymentReference,
        order_public_id: &Uuid,
        token: &IdempotencyToken,
    ) -> Result<String, ServiceError> {
        let payment = payment::Entity::find()
            .filter(payment::Column::PublicId.eq(reference.payment_id))
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound("payment not found".to_string()))?;
        if let Some(existing) = payment.provider_order_id {
            return Ok(existing);
        }

        let provider_order_id = self
            .gateway
            .create_remote_order(&RemoteOrderRequest {
                amount: payment.amount,
                currency: payment.currency.clone(),
                receipt: order_public_id.to_string(),
                idempotency_token: token.as_str().to_string(),
            })
            .await?;

        let updated = payment::Entity::update_many()
            .col_expr(
                payment::Column::ProviderOrderId,
                Expr::value(provider_order_id.clone()),
            )
            .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::ProviderOrderId.is_null())
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        if updated.rows_affected == 0 {
            // A concurrent replay stored its id first.
            let current = payment::Entity::find_by_id(payment.id)
                .one(&*self.db_pool)
                .await
                .map_err(ServiceError::db_error)?
                .and_then(|p| p.provider_order_id);
            return current.ok_or_else(|| {
                ServiceError::InternalError("payment lost its provider order id".to_string())
            });
        }
        info!(payment_id = %reference.payment_id, %provider_order_id, "remote payment order attached");
        Ok(provider_order_id)
    }

    /// Order with items and payments, visible only to its owner.
    pub async fn order_details(
        &self,
        public_id: Uuid,
        user_id: i64,
    ) -> Result<OrderDetails, ServiceError> {
        let order = order::Entity::find()
            .filter(order::Column::PublicId.eq(public_id))
            .filter(order::Column::UserId.eq(user_id))
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("order {public_id} not found")))?;
        let items = order
            .find_related(order_item::Entity)
            .order_by_asc(order_item::Column::ProductId)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        let payments = order
            .find_related(payment::Entity)
            .order_by_asc(payment::Column::Id)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(OrderDetails {
            order,
            items,
            payments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::pricing::LineTotals;

    #[test]
    fn placed_order_body_round_trips_through_the_ledger() {
        let placed = PlacedOrder {
            order_id: Uuid::new_v4(),
            checkout_id: Uuid::new_v4(),
            status: OrderStatus::PendingPayment,
            payment_method: PaymentMethod::Upi,
            totals: OrderTotals {
                currency: "INR".into(),
                subtotal: 1_000,
                tax: 20,
                shipping: 50,
                cod_fee: 0,
                discount: 0,
                total: 1_070,
                lines: vec![LineTotals {
                    product_id: 1,
                    quantity: 2,
                    unit_price: 500,
                    line_total: 1_000,
                    tax: 20,
                }],
            },
            payment: Some(PaymentReference {
                payment_id: Uuid::new_v4(),
                provider: "razorpay".into(),
                provider_order_id: None,
                amount: 1_070,
                currency: "INR".into(),
            }),
        };
        let body = serde_json::to_value(&placed).unwrap();
        assert_eq!(body["status"], "PENDING_PAYMENT");
        assert_eq!(body["payment"]["provider_order_id"], serde_json::Value::Null);
        let back: PlacedOrder = serde_json::from_value(body).unwrap();
        assert_eq!(back, placed);
    }
}
