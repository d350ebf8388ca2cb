//! Settlement of commit intents into permanent stock decrements.
//!
//! An intent is claimed (PENDING -> PROCESSING, attempts + 1) in a short
//! transaction, then settled in a second one that locks the affected product
//! rows, decrements stock, marks the intent DONE and writes the follow-up
//! events. A failed settlement is rolled back and the intent is rescheduled
//! or marked FAILED in a separate recovery transaction.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, LockBehavior, LockType, OnConflict};
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::config::SettlerConfig;
use crate::db::with_transaction;
use crate::entities::commit_intent::{self, CommitIntentStatus, IntentItem, IntentPayload};
use crate::entities::{order_item, product};
use crate::errors::ServiceError;
use crate::events::{aggregates, enqueue, topics, NewOutboxEvent};
use crate::middleware_helpers::retry::capped_backoff;
use crate::services::inventory_reservations::{decrement_stock, InventoryReservationManager};

/// Records the intention to decrement stock for `order_id`. Unique per
/// (order, reason); returns whether a new intent was written.
pub async fn create_commit_intent<C: ConnectionTrait>(
    conn: &C,
    order_id: i64,
    reason: &str,
    items: Vec<IntentItem>,
) -> Result<bool, ServiceError> {
    let now = Utc::now();
    let payload = serde_json::to_value(IntentPayload { order_id, items })?;
    let inserted = commit_intent::Entity::insert(commit_intent::ActiveModel {
        order_id: Set(order_id),
        reason: Set(reason.to_string()),
        status: Set(CommitIntentStatus::Pending),
        attempts: Set(0),
        next_retry_at: Set(None),
        payload: Set(payload),
        last_error: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    })
    .on_conflict(
        OnConflict::columns([commit_intent::Column::OrderId, commit_intent::Column::Reason])
            .do_nothing()
            .to_owned(),
    )
    .exec_without_returning(conn)
    .await
    .map_err(ServiceError::db_error)?;
    Ok(inserted == 1)
}

/// In-process fast path to the settler. A dropped signal is harmless: the
/// polling sweep finds the intent anyway.
#[derive(Clone, Debug)]
pub struct SettlementSignal {
    sender: mpsc::Sender<i64>,
}

impl SettlementSignal {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<i64>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    pub fn notify(&self, order_id: i64) {
        if self.sender.try_send(order_id).is_err() {
            debug!(order_id, "settlement signal not delivered; sweep will pick it up");
        }
    }
}

/// What happened to one intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Settled {
        order_id: i64,
        decremented: BTreeMap<i64, i32>,
    },
    /// Nothing claimable: already settled, claimed elsewhere or not yet due.
    Skipped,
    RetryScheduled {
        attempts: i32,
        retry_at: DateTime<Utc>,
    },
    Failed {
        attempts: i32,
    },
}

#[derive(Clone)]
pub struct CommitIntentSettler {
    db_pool: Arc<DatabaseConnection>,
    reservations: InventoryReservationManager,
    config: SettlerConfig,
}

impl CommitIntentSettler {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        reservations: InventoryReservationManager,
        config: SettlerConfig,
    ) -> Self {
        Self {
            db_pool,
            reservations,
            config,
        }
    }

    /// PENDING and due, or PROCESSING with a lapsed lease.
    fn claimable(now: DateTime<Utc>, lease: chrono::Duration) -> Condition {
        Condition::any()
            .add(
                Condition::all()
                    .add(commit_intent::Column::Status.eq(CommitIntentStatus::Pending))
                    .add(
                        Condition::any()
                            .add(commit_intent::Column::NextRetryAt.is_null())
                            .add(commit_intent::Column::NextRetryAt.lte(now)),
                    ),
            )
            .add(
                Condition::all()
                    .add(commit_intent::Column::Status.eq(CommitIntentStatus::Processing))
                    .add(commit_intent::Column::UpdatedAt.lte(now - lease)),
            )
    }

    fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.lease_secs as i64)
    }

    /// Claims up to `limit` intents, optionally only those of one order.
    async fn claim(
        &self,
        order_id: Option<i64>,
        limit: u64,
    ) -> Result<Vec<commit_intent::Model>, ServiceError> {
        let now = Utc::now();
        let lease = self.lease();
        with_transaction(&self.db_pool, move |txn| {
            Box::pin(async move {
                let mut query = commit_intent::Entity::find().filter(Self::claimable(now, lease));
                if let Some(order_id) = order_id {
                    query = query.filter(commit_intent::Column::OrderId.eq(order_id));
                }
                let candidates = query
                    .order_by_asc(commit_intent::Column::Id)
                    .limit(limit)
                    .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
                    .all(txn)
                    .await
                    .map_err(ServiceError::db_error)?;

                let mut claimed = Vec::with_capacity(candidates.len());
                for intent in candidates {
                    let attempts = intent.attempts + 1;
                    let res = commit_intent::Entity::update_many()
                        .col_expr(
                            commit_intent::Column::Status,
                            Expr::value(CommitIntentStatus::Processing),
                        )
                        .col_expr(commit_intent::Column::Attempts, Expr::value(attempts))
                        .col_expr(commit_intent::Column::UpdatedAt, Expr::value(now))
                        .filter(commit_intent::Column::Id.eq(intent.id))
                        .filter(commit_intent::Column::Status.eq(intent.status))
                        .filter(commit_intent::Column::Attempts.eq(intent.attempts))
                        .exec(txn)
                        .await
                        .map_err(ServiceError::db_error)?;
                    if res.rows_affected == 1 {
                        claimed.push(commit_intent::Model {
                            status: CommitIntentStatus::Processing,
                            attempts,
                            updated_at: now,
                            ..intent
                        });
                    }
                }
                Ok(claimed)
            })
        })
        .await
    }

    /// Settles the intents of one order, typically after a confirmation signal.
    #[instrument(skip(self))]
    pub async fn settle_order(&self, order_id: i64) -> Result<Vec<Settlement>, ServiceError> {
        let claimed = self.claim(Some(order_id), self.config.batch_size).await?;
        if claimed.is_empty() {
            debug!(order_id, "no claimable commit intent");
            return Ok(vec![Settlement::Skipped]);
        }
        let mut results = Vec::with_capacity(claimed.len());
        for intent in claimed {
            results.push(self.process(intent).await?);
        }
        Ok(results)
    }

    /// Polling sweep: settles every due intent up to the batch size.
    pub async fn run_due(&self) -> Result<Vec<Settlement>, ServiceError> {
        let claimed = self.claim(None, self.config.batch_size).await?;
        let mut results = Vec::with_capacity(claimed.len());
        for intent in claimed {
            results.push(self.process(intent).await?);
        }
        Ok(results)
    }

    async fn process(&self, intent: commit_intent::Model) -> Result<Settlement, ServiceError> {
        match self.settle(&intent).await {
            Ok(Some(decremented)) => {
                metrics::counter!("commit_intent.settled", 1);
                info!(
                    intent_id = intent.id,
                    order_id = intent.order_id,
                    attempts = intent.attempts,
                    "commit intent settled"
                );
                Ok(Settlement::Settled {
                    order_id: intent.order_id,
                    decremented,
                })
            }
            Ok(None) => Ok(Settlement::Skipped),
            Err(err) => self.record_failure(&intent, &err).await,
        }
    }

    /// Settlement transaction. Returns `None` when the intent is no longer ours.
    async fn settle(
        &self,
        intent: &commit_intent::Model,
    ) -> Result<Option<BTreeMap<i64, i32>>, ServiceError> {
        let txn = self.db_pool.begin().await.map_err(ServiceError::db_error)?;
        match self.apply(&txn, intent).await {
            Ok(result) => {
                txn.commit().await.map_err(ServiceError::db_error)?;
                Ok(result)
            }
            Err(err) => {
                txn.rollback().await.map_err(ServiceError::db_error)?;
                Err(err)
            }
        }
    }

    async fn apply(
        &self,
        txn: &DatabaseTransaction,
        intent: &commit_intent::Model,
    ) -> Result<Option<BTreeMap<i64, i32>>, ServiceError> {
        let current = commit_intent::Entity::find_by_id(intent.id)
            .lock_exclusive()
            .one(txn)
            .await
            .map_err(ServiceError::db_error)?;
        match current {
            Some(row)
                if row.status == CommitIntentStatus::Processing
                    && row.attempts == intent.attempts => {}
            _ => return Ok(None),
        }

        let required = Self::required_quantities(txn, intent).await?;
        if required.is_empty() {
            return Err(ServiceError::InternalError(format!(
                "order {} has no items to commit",
                intent.order_id
            )));
        }

        let now = Utc::now();
        let product_ids: Vec<i64> = required.keys().copied().collect();
        let stock: BTreeMap<i64, i32> = product::Entity::find()
            .filter(product::Column::Id.is_in(product_ids.clone()))
            .order_by_asc(product::Column::Id)
            .lock_exclusive()
            .all(txn)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|p| (p.id, p.stock_qty))
            .collect();
        // Stock held by other live checkouts is not ours to take.
        let held = self
            .reservations
            .held_by_others(txn, &product_ids, intent.order_id, now)
            .await?;
        for (product_id, qty) in &required {
            let on_hand = stock.get(product_id).copied().ok_or_else(|| {
                ServiceError::NotFound(format!("product {product_id} not found"))
            })?;
            let held_elsewhere = held.get(product_id).copied().unwrap_or(0);
            let available = i64::from(on_hand) - held_elsewhere;
            if available < i64::from(*qty) {
                return Err(ServiceError::InsufficientStock(format!(
                    "product {product_id}: required={qty}, available={available}, \
                     on_hand={on_hand}, held_elsewhere={held_elsewhere}"
                )));
            }
        }

        let outcome = self.reservations.commit(txn, intent.order_id, now).await?;
        if let Some(failure) = outcome.failures.first() {
            return Err(ServiceError::InsufficientStock(format!(
                "reservation {} for product {} could not be committed",
                failure.reservation_id, failure.product_id
            )));
        }

        let mut decremented = outcome.committed_quantities.clone();
        for (product_id, qty) in &required {
            let covered = outcome.committed_quantities.get(product_id).copied().unwrap_or(0);
            let remaining = qty - covered;
            if remaining <= 0 {
                continue;
            }
            if !decrement_stock(txn, *product_id, remaining).await? {
                return Err(ServiceError::InsufficientStock(format!(
                    "product {product_id}: could not decrement {remaining}"
                )));
            }
            *decremented.entry(*product_id).or_insert(0) += remaining;
        }

        commit_intent::Entity::update_many()
            .col_expr(commit_intent::Column::Status, Expr::value(CommitIntentStatus::Done))
            .col_expr(
                commit_intent::Column::NextRetryAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(commit_intent::Column::LastError, Expr::value(Option::<String>::None))
            .col_expr(commit_intent::Column::UpdatedAt, Expr::value(now))
            .filter(commit_intent::Column::Id.eq(intent.id))
            .exec(txn)
            .await
            .map_err(ServiceError::db_error)?;

        let items: Vec<IntentItem> = decremented
            .iter()
            .map(|(product_id, quantity)| IntentItem {
                product_id: *product_id,
                quantity: *quantity,
            })
            .collect();
        enqueue(
            txn,
            NewOutboxEvent::new(
                topics::INVENTORY_COMMITTED,
                aggregates::INVENTORY,
                intent.order_id,
                json!({ "order_id": intent.order_id, "items": items }),
            )
            .with_dedupe_key(format!("{}:{}", topics::INVENTORY_COMMITTED, intent.order_id)),
        )
        .await?;
        enqueue(
            txn,
            NewOutboxEvent::new(
                topics::ORDER_CONFIRMED,
                aggregates::ORDER,
                intent.order_id,
                json!({ "order_id": intent.order_id, "reason": intent.reason }),
            ),
        )
        .await?;

        Ok(Some(decremented))
    }

    /// Quantities per product from the order lines, falling back to the
    /// intent payload for orders without stored lines.
    async fn required_quantities(
        txn: &DatabaseTransaction,
        intent: &commit_intent::Model,
    ) -> Result<BTreeMap<i64, i32>, ServiceError> {
        let lines = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(intent.order_id))
            .all(txn)
            .await
            .map_err(ServiceError::db_error)?;
        let mut required = BTreeMap::new();
        if lines.is_empty() {
            for item in intent.decoded_payload()?.items {
                *required.entry(item.product_id).or_insert(0) += item.quantity;
            }
        } else {
            for line in lines {
                *required.entry(line.product_id).or_insert(0) += line.quantity;
            }
        }
        Ok(required)
    }

    /// Recovery transaction after a rolled-back settlement.
    async fn record_failure(
        &self,
        intent: &commit_intent::Model,
        cause: &ServiceError,
    ) -> Result<Settlement, ServiceError> {
        let now = Utc::now();
        let attempts = intent.attempts;
        let exhausted = attempts >= self.config.max_attempts;
        let message = cause.to_string();

        let txn = self.db_pool.begin().await.map_err(ServiceError::db_error)?;
        let mut update = commit_intent::Entity::update_many()
            .col_expr(commit_intent::Column::LastError, Expr::value(message.clone()))
            .col_expr(commit_intent::Column::UpdatedAt, Expr::value(now));
        let settlement = if exhausted {
            update = update
                .col_expr(commit_intent::Column::Status, Expr::value(CommitIntentStatus::Failed));
            Settlement::Failed { attempts }
        } else {
            let retry_at = now
                + capped_backoff(
                    self.config.backoff_base_secs,
                    self.config.backoff_cap_secs,
                    attempts,
                );
            update = update
                .col_expr(commit_intent::Column::Status, Expr::value(CommitIntentStatus::Pending))
                .col_expr(commit_intent::Column::NextRetryAt, Expr::value(retry_at));
            Settlement::RetryScheduled { attempts, retry_at }
        };
        update
            .filter(commit_intent::Column::Id.eq(intent.id))
            .filter(commit_intent::Column::Status.eq(CommitIntentStatus::Processing))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        match &settlement {
            Settlement::Failed { .. } => {
                metrics::counter!("commit_intent.failed", 1);
                error!(
                    intent_id = intent.id,
                    order_id = intent.order_id,
                    attempts,
                    error = %message,
                    "commit intent failed permanently"
                );
            }
            _ => warn!(
                intent_id = intent.id,
                order_id = intent.order_id,
                attempts,
                error = %message,
                "commit intent settlement failed, retry scheduled"
            ),
        }
        Ok(settlement)
    }

    /// Serves signals and sweeps until `shutdown` flips.
    pub async fn run(self, mut signals: mpsc::Receiver<i64>, mut shutdown: watch::Receiver<bool>) {
        let mut sweep = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("commit intent settler started");
        loop {
            tokio::select! {
                Some(order_id) = signals.recv() => {
                    if let Err(err) = self.settle_order(order_id).await {
                        error!(order_id, error = %err, "signalled settlement failed");
                    }
                }
                _ = sweep.tick() => {
                    if let Err(err) = self.run_due().await {
                        error!(error = %err, "commit intent sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("commit intent settler stopped");
    }
}
