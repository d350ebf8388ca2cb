//! Transactional outbox.
//!
//! Producers call [`enqueue`] inside the transaction that performs the state
//! change. [`OutboxRelay`] claims due rows under a lease, publishes them
//! outside any transaction and records the outcome per event.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, LockBehavior, LockType, OnConflict};
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use super::publisher::Publisher;
use super::OutboxMessage;
use crate::config::OutboxConfig;
use crate::entities::outbox_event::{self, OutboxStatus};
use crate::errors::ServiceError;
use crate::middleware_helpers::retry::capped_backoff;

/// An event to be written next to a state change.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub topic: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: Value,
    pub dedupe_key: String,
}

impl NewOutboxEvent {
    /// Dedupe key defaults to `{aggregate_type}:{aggregate_id}:{topic}`.
    pub fn new(
        topic: &str,
        aggregate_type: &str,
        aggregate_id: impl ToString,
        payload: Value,
    ) -> Self {
        let aggregate_id = aggregate_id.to_string();
        Self {
            dedupe_key: format!("{aggregate_type}:{aggregate_id}:{topic}"),
            topic: topic.to_string(),
            aggregate_type: aggregate_type.to_string(),
            aggregate_id,
            payload,
        }
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = key.into();
        self
    }
}

/// Writes `event` unless a row with the same dedupe key exists. Returns
/// whether a new row was inserted.
pub async fn enqueue<C: ConnectionTrait>(
    conn: &C,
    event: NewOutboxEvent,
) -> Result<bool, ServiceError> {
    let now = Utc::now();
    let dedupe_key = event.dedupe_key.clone();
    let inserted = outbox_event::Entity::insert(outbox_event::ActiveModel {
        topic: Set(event.topic),
        aggregate_type: Set(event.aggregate_type),
        aggregate_id: Set(event.aggregate_id),
        dedupe_key: Set(event.dedupe_key),
        payload: Set(event.payload),
        status: Set(OutboxStatus::Pending),
        attempts: Set(0),
        next_retry_at: Set(None),
        locked_until: Set(None),
        broker_message_id: Set(None),
        last_error: Set(None),
        sent_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    })
    .on_conflict(
        OnConflict::column(outbox_event::Column::DedupeKey)
            .do_nothing()
            .to_owned(),
    )
    .exec_without_returning(conn)
    .await
    .map_err(ServiceError::db_error)?;

    if inserted == 1 {
        debug!(dedupe_key = %dedupe_key, "outbox event enqueued");
        Ok(true)
    } else {
        debug!(dedupe_key = %dedupe_key, "outbox event already present");
        Ok(false)
    }
}

/// Marks an event consumed in-process. Returns false if it was already final.
pub async fn acknowledge<C: ConnectionTrait>(conn: &C, outbox_id: i64) -> Result<bool, ServiceError> {
    let res = outbox_event::Entity::update_many()
        .col_expr(outbox_event::Column::Status, Expr::value(OutboxStatus::Done))
        .col_expr(outbox_event::Column::LockedUntil, Expr::value(Option::<DateTime<Utc>>::None))
        .col_expr(outbox_event::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(outbox_event::Column::Id.eq(outbox_id))
        .filter(outbox_event::Column::Status.is_in([OutboxStatus::Pending, OutboxStatus::Sent]))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(res.rows_affected == 1)
}

/// Operator view: events that still need attention, oldest first.
pub async fn list_outstanding<C: ConnectionTrait>(
    conn: &C,
    status: Option<OutboxStatus>,
    limit: u64,
) -> Result<Vec<outbox_event::Model>, ServiceError> {
    let statuses = match status {
        Some(status) => vec![status],
        None => vec![OutboxStatus::Pending, OutboxStatus::Failed],
    };
    outbox_event::Entity::find()
        .filter(outbox_event::Column::Status.is_in(statuses))
        .order_by_asc(outbox_event::Column::Id)
        .limit(limit)
        .all(conn)
        .await
        .map_err(ServiceError::db_error)
}

/// Puts a FAILED event back in the queue with a fresh attempt budget.
pub async fn requeue_failed<C: ConnectionTrait>(
    conn: &C,
    outbox_id: i64,
) -> Result<outbox_event::Model, ServiceError> {
    let res = outbox_event::Entity::update_many()
        .col_expr(outbox_event::Column::Status, Expr::value(OutboxStatus::Pending))
        .col_expr(outbox_event::Column::Attempts, Expr::value(0))
        .col_expr(outbox_event::Column::NextRetryAt, Expr::value(Option::<DateTime<Utc>>::None))
        .col_expr(outbox_event::Column::LockedUntil, Expr::value(Option::<DateTime<Utc>>::None))
        .col_expr(outbox_event::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(outbox_event::Column::Id.eq(outbox_id))
        .filter(outbox_event::Column::Status.eq(OutboxStatus::Failed))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    let event = outbox_event::Entity::find_by_id(outbox_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("outbox event {outbox_id} not found")))?;
    if res.rows_affected == 0 {
        return Err(ServiceError::Conflict(format!(
            "outbox event {outbox_id} is {:?}, only FAILED events can be retried",
            event.status
        )));
    }
    info!(outbox_id, topic = %event.topic, "outbox event requeued");
    Ok(event)
}

/// Counts for one relay cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

#[derive(Clone)]
pub struct OutboxRelay {
    db_pool: Arc<DatabaseConnection>,
    publisher: Arc<dyn Publisher>,
    config: OutboxConfig,
}

impl OutboxRelay {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        publisher: Arc<dyn Publisher>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            db_pool,
            publisher,
            config,
        }
    }

    fn claimable(now: DateTime<Utc>) -> Condition {
        Condition::all()
            .add(outbox_event::Column::Status.eq(OutboxStatus::Pending))
            .add(
                Condition::any()
                    .add(outbox_event::Column::NextRetryAt.is_null())
                    .add(outbox_event::Column::NextRetryAt.lte(now)),
            )
            .add(
                Condition::any()
                    .add(outbox_event::Column::LockedUntil.is_null())
                    .add(outbox_event::Column::LockedUntil.lte(now)),
            )
    }

    /// Leases up to `batch_size` due events in one short transaction.
    pub async fn claim_batch(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<outbox_event::Model>, ServiceError> {
        let txn = self.db_pool.begin().await.map_err(ServiceError::db_error)?;
        let events = outbox_event::Entity::find()
            .filter(Self::claimable(now))
            .order_by_asc(outbox_event::Column::Id)
            .limit(self.config.batch_size)
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .all(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        if events.is_empty() {
            txn.commit().await.map_err(ServiceError::db_error)?;
            return Ok(events);
        }

        let lease_until = now + chrono::Duration::seconds(self.config.lease_secs as i64);
        let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        outbox_event::Entity::update_many()
            .col_expr(outbox_event::Column::LockedUntil, Expr::value(lease_until))
            .col_expr(outbox_event::Column::UpdatedAt, Expr::value(now))
            .filter(outbox_event::Column::Id.is_in(ids))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        txn.commit().await.map_err(ServiceError::db_error)?;
        Ok(events)
    }

    /// One relay cycle: claim, publish each event, record each outcome.
    #[instrument(skip(self))]
    pub async fn drain_once(&self) -> Result<DrainReport, ServiceError> {
        let events = self.claim_batch(Utc::now()).await?;
        let mut report = DrainReport {
            claimed: events.len(),
            ..Default::default()
        };

        for event in &events {
            let message = OutboxMessage::from(event);
            match self.publisher.publish(&event.topic, &message).await {
                Ok(broker_message_id) => {
                    self.mark_sent(event.id, &broker_message_id).await?;
                    metrics::counter!("outbox.published", 1);
                    report.sent += 1;
                }
                Err(err) => {
                    metrics::counter!("outbox.publish_failed", 1);
                    if self.mark_failure(event, &err.to_string()).await? {
                        report.dead_lettered += 1;
                    } else {
                        report.retried += 1;
                    }
                }
            }
        }

        if report.claimed > 0 {
            debug!(?report, "outbox cycle finished");
        }
        Ok(report)
    }

    async fn mark_sent(&self, outbox_id: i64, broker_message_id: &str) -> Result<(), ServiceError> {
        let now = Utc::now();
        outbox_event::Entity::update_many()
            .col_expr(outbox_event::Column::Status, Expr::value(OutboxStatus::Sent))
            .col_expr(outbox_event::Column::SentAt, Expr::value(now))
            .col_expr(
                outbox_event::Column::BrokerMessageId,
                Expr::value(broker_message_id),
            )
            .col_expr(outbox_event::Column::LockedUntil, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(outbox_event::Column::LastError, Expr::value(Option::<String>::None))
            .col_expr(outbox_event::Column::UpdatedAt, Expr::value(now))
            .filter(outbox_event::Column::Id.eq(outbox_id))
            .filter(outbox_event::Column::Status.eq(OutboxStatus::Pending))
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }

    /// Records a failed publish. Returns true when the event hit the attempt
    /// ceiling and is now FAILED.
    async fn mark_failure(
        &self,
        event: &outbox_event::Model,
        error: &str,
    ) -> Result<bool, ServiceError> {
        let now = Utc::now();
        let attempts = event.attempts + 1;
        let exhausted = attempts >= self.config.max_attempts;
        let mut update = outbox_event::Entity::update_many()
            .col_expr(outbox_event::Column::Attempts, Expr::value(attempts))
            .col_expr(outbox_event::Column::LastError, Expr::value(error))
            .col_expr(outbox_event::Column::LockedUntil, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(outbox_event::Column::UpdatedAt, Expr::value(now));

        if exhausted {
            update = update.col_expr(outbox_event::Column::Status, Expr::value(OutboxStatus::Failed));
            metrics::counter!("outbox.dead_lettered", 1);
            error!(
                outbox_id = event.id,
                topic = %event.topic,
                attempts,
                error,
                "outbox event failed permanently"
            );
        } else {
            let retry_at = now
                + capped_backoff(
                    self.config.backoff_base_secs,
                    self.config.backoff_cap_secs,
                    attempts,
                );
            update = update.col_expr(outbox_event::Column::NextRetryAt, Expr::value(retry_at));
            warn!(
                outbox_id = event.id,
                topic = %event.topic,
                attempts,
                %retry_at,
                error,
                "outbox publish failed, retry scheduled"
            );
        }

        update
            .filter(outbox_event::Column::Id.eq(event.id))
            .filter(outbox_event::Column::Status.eq(OutboxStatus::Pending))
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(exhausted)
    }

    /// Polls until `shutdown` flips. A full batch is followed immediately by
    /// another cycle; otherwise the relay sleeps for the poll interval.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        info!(batch_size = self.config.batch_size, "outbox relay started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.drain_once().await {
                Ok(report) => (report.claimed as u64) < self.config.batch_size,
                Err(err) => {
                    error!(error = %err, "outbox relay cycle failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = sleep(poll) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!("outbox relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_dedupe_key_combines_aggregate_and_topic() {
        let event = NewOutboxEvent::new("order.paid", "order", 42, json!({"order_id": 42}));
        assert_eq!(event.dedupe_key, "order:42:order.paid");
        assert_eq!(event.aggregate_id, "42");

        let custom = event.with_dedupe_key("inventory.committed:42");
        assert_eq!(custom.dedupe_key, "inventory.committed:42");
    }
}
