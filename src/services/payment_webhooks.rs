//! Inbound payment gateway notifications.

use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::Utc;
use sea_orm::sea_query::{Expr, Func, OnConflict};
use sea_orm::{
    ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait, QueryFilter, QuerySelect,
    Set, TransactionTrait,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::entities::commit_intent::{IntentItem, REASON_PAYMENT_SUCCEEDED};
use crate::entities::order::{self, OrderStatus};
use crate::entities::payment::{self, PaymentStatus};
use crate::entities::{order_item, payment_webhook_event};
use crate::errors::ServiceError;
use crate::events::{aggregates, enqueue, topics, NewOutboxEvent};
use crate::gateway::{translate_status, PaymentGateway, StatusTranslation, EVENT_ID_HEADER};
use crate::services::commit_intents::{create_commit_intent, SettlementSignal};

/// Body returned to the gateway; every non-error outcome is a 200.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookAck {
    pub note: String,
}

impl WebhookAck {
    fn new(note: impl Into<String>) -> Self {
        Self { note: note.into() }
    }
}

/// Fields of interest from a gateway payment notification.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PaymentNotification {
    event: Option<String>,
    provider_payment_id: Option<String>,
    provider_order_id: Option<String>,
    status: Option<String>,
}

impl PaymentNotification {
    fn parse(payload: &Value) -> Self {
        let entity = &payload["payload"]["payment"]["entity"];
        let text = |v: &Value| v.as_str().map(str::to_string);
        Self {
            event: text(&payload["event"]),
            provider_payment_id: text(&entity["id"]).or_else(|| text(&entity["payment_id"])),
            provider_order_id: text(&entity["order_id"]),
            status: text(&entity["status"]),
        }
    }

    /// Entity status, or the suffix of the event name (`payment.captured`).
    fn gateway_status(&self) -> Option<&str> {
        self.status.as_deref().or_else(|| {
            self.event
                .as_deref()
                .and_then(|event| event.rsplit('.').next())
        })
    }
}

/// Ordering used to ignore notifications that arrive after a later state.
fn status_rank(status: PaymentStatus) -> u8 {
    match status {
        PaymentStatus::Pending | PaymentStatus::Unknown => 0,
        PaymentStatus::Authorized | PaymentStatus::Failed => 1,
        PaymentStatus::Captured => 2,
        PaymentStatus::Refunded => 3,
    }
}

#[derive(Clone)]
pub struct PaymentWebhookProcessor {
    db_pool: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    provider: String,
    settlement: Option<SettlementSignal>,
}

impl PaymentWebhookProcessor {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            db_pool,
            gateway,
            provider: provider.into(),
            settlement: None,
        }
    }

    pub fn with_settlement_signal(mut self, signal: SettlementSignal) -> Self {
        self.settlement = Some(signal);
        self
    }

    #[instrument(skip(self, raw_body, headers), fields(provider = %self.provider))]
    pub async fn handle(&self, raw_body: &[u8], headers: &HeaderMap) -> Result<WebhookAck, ServiceError> {
        let payload = self.gateway.verify_webhook_signature(raw_body, headers)?;
        let notification = PaymentNotification::parse(&payload);

        let Some(event_id) = headers
            .get(EVENT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
        else {
            let placeholder = format!("missing-{}", Uuid::new_v4());
            let event = self.record_received(&placeholder, &notification, &payload).await?;
            self.record_error(event.id, "missing event id").await?;
            warn!("webhook without event id recorded for reconciliation");
            return Ok(WebhookAck::new("ignored: missing event id"));
        };

        let event = self.record_received(&event_id, &notification, &payload).await?;
        if event.processed_at.is_some() {
            info!(%event_id, "webhook already processed");
            return Ok(WebhookAck::new("already processed"));
        }

        let Some(provider_order_id) = notification.provider_order_id.as_deref() else {
            self.record_error(event.id, "no provider order id").await?;
            return Ok(WebhookAck::new("ignored: no payment entity"));
        };
        let Some(pay) = payment::Entity::find()
            .filter(payment::Column::Provider.eq(self.provider.as_str()))
            .filter(payment::Column::ProviderOrderId.eq(provider_order_id))
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
        else {
            self.record_error(event.id, "no payment found for provider order id")
                .await?;
            warn!(%event_id, provider_order_id, "webhook for unknown payment");
            return Ok(WebhookAck::new("ignored: payment not found"));
        };
        let Some(provider_payment_id) = notification.provider_payment_id.clone() else {
            self.record_error(event.id, "no provider payment id").await?;
            return Ok(WebhookAck::new("ignored: no payment entity"));
        };

        let raw_status = notification.gateway_status().unwrap_or_default();
        let translation = translate_status(raw_status);
        if translation.payment == PaymentStatus::Unknown {
            self.record_error(event.id, &format!("unrecognized gateway status: {raw_status:?}"))
                .await?;
            warn!(%event_id, raw_status, "unrecognized gateway payment status");
            return Ok(WebhookAck::new("ignored: unrecognized status"));
        }

        let txn = self.db_pool.begin().await.map_err(ServiceError::db_error)?;
        let applied = self
            .apply(&txn, event.id, &pay, &provider_payment_id, provider_order_id, translation)
            .await;
        let (note, settle_order) = match applied {
            Ok(result) => match txn.commit().await {
                Ok(()) => result,
                Err(err) => return Err(self.fail(event.id, ServiceError::db_error(err)).await),
            },
            Err(err) => {
                if let Err(rollback_err) = txn.rollback().await {
                    error!(error = %rollback_err, "webhook rollback failed");
                }
                return Err(self.fail(event.id, err).await);
            }
        };

        if let (Some(order_id), Some(signal)) = (settle_order, &self.settlement) {
            signal.notify(order_id);
        }
        info!(%event_id, payment_id = pay.id, status = ?translation.payment, "webhook processed");
        Ok(WebhookAck::new(note))
    }

    /// The single processing transaction. Returns the ack note and, after a
    /// capture, the order to settle.
    async fn apply(
        &self,
        txn: &DatabaseTransaction,
        event_id: i64,
        pay: &payment::Model,
        provider_payment_id: &str,
        provider_order_id: &str,
        translation: StatusTranslation,
    ) -> Result<(String, Option<i64>), ServiceError> {
        let now = Utc::now();
        let current = payment::Entity::find_by_id(pay.id)
            .lock_exclusive()
            .one(txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("payment {} vanished", pay.id)))?;

        if status_rank(translation.payment) < status_rank(current.status) {
            Self::mark_processed(txn, event_id, current.id).await?;
            return Ok((
                format!("ignored: payment already {:?}", current.status).to_lowercase(),
                None,
            ));
        }

        let mut payment_update = payment::Entity::update_many()
            .col_expr(payment::Column::Status, Expr::value(translation.payment))
            .col_expr(payment::Column::ProviderPaymentId, Expr::value(provider_payment_id))
            .col_expr(payment::Column::UpdatedAt, Expr::value(now));
        if translation.payment == PaymentStatus::Captured && current.paid_at.is_none() {
            payment_update = payment_update.col_expr(payment::Column::PaidAt, Expr::value(now));
        }
        payment_update
            .filter(payment::Column::Id.eq(current.id))
            .exec(txn)
            .await
            .map_err(ServiceError::db_error)?;

        if let Some(order_status) = translation.order {
            let mut order_update = order::Entity::update_many()
                .col_expr(order::Column::Status, Expr::value(order_status))
                .col_expr(order::Column::UpdatedAt, Expr::value(now));
            if order_status == OrderStatus::Confirmed {
                order_update = order_update.col_expr(
                    order::Column::PlacedAt,
                    Func::if_null(Expr::col(order::Column::PlacedAt), Expr::value(now)).into(),
                );
            }
            order_update
                .filter(order::Column::Id.eq(current.order_id))
                .exec(txn)
                .await
                .map_err(ServiceError::db_error)?;
        }

        let event_payload = json!({
            "order_id": current.order_id,
            "payment_id": current.public_id,
            "provider_payment_id": provider_payment_id,
            "provider_order_id": provider_order_id,
        });
        let mut settle_order = None;
        let note = match translation.payment {
            PaymentStatus::Captured => {
                let items = order_item::Entity::find()
                    .filter(order_item::Column::OrderId.eq(current.order_id))
                    .all(txn)
                    .await
                    .map_err(ServiceError::db_error)?
                    .into_iter()
                    .map(|line| IntentItem {
                        product_id: line.product_id,
                        quantity: line.quantity,
                    })
                    .collect();
                if create_commit_intent(txn, current.order_id, REASON_PAYMENT_SUCCEEDED, items)
                    .await?
                {
                    settle_order = Some(current.order_id);
                }
                enqueue(
                    txn,
                    NewOutboxEvent::new(
                        topics::ORDER_PAID,
                        aggregates::ORDER,
                        current.order_id,
                        event_payload,
                    ),
                )
                .await?;
                "payment captured"
            }
            PaymentStatus::Failed => {
                enqueue(
                    txn,
                    NewOutboxEvent::new(
                        topics::ORDER_PAYMENT_FAILED,
                        aggregates::ORDER,
                        current.order_id,
                        event_payload,
                    ),
                )
                .await?;
                "payment failed"
            }
            _ => "payment updated",
        };

        Self::mark_processed(txn, event_id, current.id).await?;
        Ok((note.to_string(), settle_order))
    }

    async fn mark_processed(
        txn: &DatabaseTransaction,
        event_id: i64,
        payment_id: i64,
    ) -> Result<(), ServiceError> {
        payment_webhook_event::Entity::update_many()
            .col_expr(payment_webhook_event::Column::ProcessedAt, Expr::value(Utc::now()))
            .col_expr(payment_webhook_event::Column::PaymentId, Expr::value(payment_id))
            .col_expr(
                payment_webhook_event::Column::LastError,
                Expr::value(Option::<String>::None),
            )
            .filter(payment_webhook_event::Column::Id.eq(event_id))
            .exec(txn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }

    /// Inserts the delivery unless it was seen before and returns the stored row.
    async fn record_received(
        &self,
        provider_event_id: &str,
        notification: &PaymentNotification,
        payload: &Value,
    ) -> Result<payment_webhook_event::Model, ServiceError> {
        payment_webhook_event::Entity::insert(payment_webhook_event::ActiveModel {
            provider: Set(self.provider.clone()),
            provider_event_id: Set(provider_event_id.to_string()),
            event_type: Set(notification.event.clone()),
            payload: Set(payload.clone()),
            payment_id: Set(None),
            last_error: Set(None),
            processed_at: Set(None),
            received_at: Set(Utc::now()),
            ..Default::default()
        })
        .on_conflict(
            OnConflict::columns([
                payment_webhook_event::Column::Provider,
                payment_webhook_event::Column::ProviderEventId,
            ])
            .do_nothing()
            .to_owned(),
        )
        .exec_without_returning(&*self.db_pool)
        .await
        .map_err(ServiceError::db_error)?;

        payment_webhook_event::Entity::find()
            .filter(payment_webhook_event::Column::Provider.eq(self.provider.as_str()))
            .filter(payment_webhook_event::Column::ProviderEventId.eq(provider_event_id))
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::InternalError("webhook event not stored".to_string()))
    }

    async fn record_error(&self, event_id: i64, message: &str) -> Result<(), ServiceError> {
        payment_webhook_event::Entity::update_many()
            .col_expr(payment_webhook_event::Column::LastError, Expr::value(message))
            .filter(payment_webhook_event::Column::Id.eq(event_id))
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }

    /// Records a processing failure outside the rolled-back transaction and
    /// returns the error the gateway should see (500, so it redelivers).
    async fn fail(&self, event_id: i64, err: ServiceError) -> ServiceError {
        error!(webhook_event_id = event_id, error = %err, "webhook processing failed");
        let recorded = self
            .db_pool
            .begin()
            .await
            .map_err(ServiceError::db_error);
        match recorded {
            Ok(txn) => {
                let result = payment_webhook_event::Entity::update_many()
                    .col_expr(
                        payment_webhook_event::Column::LastError,
                        Expr::value(format!("processing failed: {err}")),
                    )
                    .filter(payment_webhook_event::Column::Id.eq(event_id))
                    .exec(&txn)
                    .await;
                let committed = match result {
                    Ok(_) => txn.commit().await,
                    Err(e) => Err(e),
                };
                if let Err(record_err) = committed {
                    error!(webhook_event_id = event_id, error = %record_err, "could not record webhook failure");
                }
            }
            Err(record_err) => {
                error!(webhook_event_id = event_id, error = %record_err, "could not record webhook failure");
            }
        }
        ServiceError::InternalError("webhook processing failed".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gateway_payment_entity() {
        let payload = json!({
            "event": "payment.captured",
            "payload": {"payment": {"entity": {
                "id": "pay_1", "order_id": "order_9", "status": "captured"
            }}}
        });
        let n = PaymentNotification::parse(&payload);
        assert_eq!(n.provider_payment_id.as_deref(), Some("pay_1"));
        assert_eq!(n.provider_order_id.as_deref(), Some("order_9"));
        assert_eq!(n.gateway_status(), Some("captured"));
    }

    #[test]
    fn status_falls_back_to_event_suffix() {
        let payload = json!({
            "event": "payment.failed",
            "payload": {"payment": {"entity": {"id": "pay_2", "order_id": "order_3"}}}
        });
        assert_eq!(PaymentNotification::parse(&payload).gateway_status(), Some("failed"));
        assert_eq!(PaymentNotification::parse(&json!({})).gateway_status(), None);
    }

    #[tokio::test]
    async fn rejected_signature_stops_before_any_write() {
        let mut gateway = crate::gateway::MockPaymentGateway::new();
        gateway
            .expect_verify_webhook_signature()
            .times(1)
            .returning(|_, _| Err(ServiceError::InvalidSignature));
        gateway.expect_create_remote_order().never();

        // Never reached: verification fails first.
        let processor = PaymentWebhookProcessor::new(
            Arc::new(DatabaseConnection::Disconnected),
            Arc::new(gateway),
            "razorpay",
        );
        let result = processor.handle(b"{}", &HeaderMap::new()).await;
        assert!(matches!(result, Err(ServiceError::InvalidSignature)));
    }

    #[test]
    fn later_states_are_not_downgraded() {
        assert!(status_rank(PaymentStatus::Authorized) < status_rank(PaymentStatus::Captured));
        assert!(status_rank(PaymentStatus::Failed) < status_rank(PaymentStatus::Captured));
        assert!(status_rank(PaymentStatus::Captured) < status_rank(PaymentStatus::Refunded));
        assert_eq!(status_rank(PaymentStatus::Failed), status_rank(PaymentStatus::Authorized));
    }
}
