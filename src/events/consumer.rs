//! In-process reactions to payment outcomes.

use std::sync::Arc;
use std::time::Duration;

use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    TransactionTrait,
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::outbox::{acknowledge, enqueue, NewOutboxEvent};
use super::publisher::Delivery;
use super::{topics, OutboxMessage};
use crate::entities::outbox_event::{self, OutboxStatus};
use crate::errors::ServiceError;

const HANDLED_TOPICS: [&str; 2] = [topics::ORDER_PAID, topics::ORDER_PAYMENT_FAILED];
const CATCH_UP_BATCH: u64 = 100;
const CATCH_UP_INTERVAL: Duration = Duration::from_secs(60);

/// Follow-up topic for an event the consumer handles.
fn follow_up(topic: &str) -> Option<&'static str> {
    match topic {
        topics::ORDER_PAID => Some(topics::ORDER_RECEIVED_FOR_FULFILLMENT),
        topics::ORDER_PAYMENT_FAILED => Some(topics::ORDER_PAYMENT_FAILED_NOTIFY),
        _ => None,
    }
}

#[derive(Clone)]
pub struct OrderEventConsumer {
    db_pool: Arc<DatabaseConnection>,
}

impl OrderEventConsumer {
    pub fn new(db_pool: Arc<DatabaseConnection>) -> Self {
        Self { db_pool }
    }

    /// Enqueues the follow-up event and acknowledges the source event in one
    /// transaction. Returns false for topics this consumer ignores.
    pub async fn handle(&self, delivery: &Delivery) -> Result<bool, ServiceError> {
        let Some(next_topic) = follow_up(&delivery.topic) else {
            return Ok(false);
        };
        let message = &delivery.message;

        let txn = self.db_pool.begin().await.map_err(ServiceError::db_error)?;
        let created = enqueue(
            &txn,
            NewOutboxEvent::new(
                next_topic,
                &message.aggregate_type,
                &message.aggregate_id,
                message.payload.clone(),
            ),
        )
        .await?;
        acknowledge(&txn, message.outbox_id).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            outbox_id = message.outbox_id,
            source = %delivery.topic,
            follow_up = next_topic,
            created,
            "outbox event consumed"
        );
        Ok(true)
    }

    /// Handles SENT events of consumed topics that never reached this
    /// consumer: missed while it was down, dropped by a lagging receiver, or
    /// left behind by a failed `handle`. Returns how many were handled.
    pub async fn catch_up(&self) -> Result<usize, ServiceError> {
        let mut handled = 0;
        let mut after_id = 0;
        loop {
            let batch = outbox_event::Entity::find()
                .filter(outbox_event::Column::Status.eq(OutboxStatus::Sent))
                .filter(outbox_event::Column::Topic.is_in(HANDLED_TOPICS))
                .filter(outbox_event::Column::Id.gt(after_id))
                .order_by_asc(outbox_event::Column::Id)
                .limit(CATCH_UP_BATCH)
                .all(&*self.db_pool)
                .await
                .map_err(ServiceError::db_error)?;
            let Some(last) = batch.last() else {
                break;
            };
            after_id = last.id;
            for event in &batch {
                let delivery = Delivery {
                    broker_message_id: event.broker_message_id.clone().unwrap_or_default(),
                    topic: event.topic.clone(),
                    message: OutboxMessage::from(event),
                };
                if self.handle(&delivery).await? {
                    handled += 1;
                }
            }
        }
        if handled > 0 {
            info!(handled, "order event consumer caught up from the outbox");
        }
        Ok(handled)
    }

    async fn catch_up_logged(&self) {
        if let Err(err) = self.catch_up().await {
            error!(error = %err, "order event catch-up failed");
        }
    }

    /// Consumes the bus until `shutdown` flips. The outbox table is rescanned
    /// on start, after the receiver lags, and on a slow timer.
    pub async fn run(
        self,
        mut deliveries: broadcast::Receiver<Delivery>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("order event consumer started");
        self.catch_up_logged().await;
        let mut ticker = tokio::time::interval(CATCH_UP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.catch_up_logged().await,
                received = deliveries.recv() => match received {
                    Ok(delivery) => {
                        if let Err(err) = self.handle(&delivery).await {
                            error!(
                                outbox_id = delivery.message.outbox_id,
                                topic = %delivery.topic,
                                error = %err,
                                "failed to consume outbox event"
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "order event consumer lagged behind the bus");
                        self.catch_up_logged().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("order event consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follow_up_topics() {
        assert_eq!(follow_up("order.paid"), Some("order.received_for_fulfillment"));
        assert_eq!(follow_up("order.payment_failed"), Some("order.payment_failed.notify"));
        assert_eq!(follow_up("order.confirmed"), None);
        assert_eq!(follow_up("order.received_for_fulfillment"), None);
    }
}
