//! Inventory reservations: short-lived stock claims held during checkout.
//!
//! `available = stock_qty - Σ(ACTIVE reservations whose deadline is still ahead)`.
//! Expiry is evaluated at read time through `reserved_until`; the hygiene sweep
//! only tidies the status column.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::entities::checkout_session::CartSnapshot;
use crate::entities::inventory_reservation::{self, ReservationStatus};
use crate::entities::product;
use crate::errors::ServiceError;

/// A reservation whose stock decrement did not go through during commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitFailure {
    pub reservation_id: i64,
    pub product_id: i64,
    pub requested: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub committed_reservation_ids: Vec<i64>,
    /// Quantity decremented per product by this call.
    pub committed_quantities: BTreeMap<i64, i32>,
    pub failures: Vec<CommitFailure>,
    /// Reservations found past their deadline and not committed.
    pub expired_reservation_ids: Vec<i64>,
}

/// Whose reservations an availability sum leaves out.
#[derive(Debug, Clone, Copy)]
enum Holder {
    Session(i64),
    Order(i64),
}

/// Collapses snapshot lines into requested quantity per product.
pub fn requested_by_product(snapshot: &CartSnapshot) -> BTreeMap<i64, i32> {
    let mut requested = BTreeMap::new();
    for item in &snapshot.items {
        *requested.entry(item.product_id).or_insert(0) += item.quantity;
    }
    requested
}

#[derive(Clone)]
pub struct InventoryReservationManager {
    db_pool: Arc<DatabaseConnection>,
}

impl InventoryReservationManager {
    pub fn new(db_pool: Arc<DatabaseConnection>) -> Self {
        Self { db_pool }
    }

    /// Sum of live reservations per product, optionally ignoring one holder's own claims.
    async fn reserved_quantities<C: ConnectionTrait>(
        conn: &C,
        product_ids: &[i64],
        exclude: Option<Holder>,
        now: DateTime<Utc>,
    ) -> Result<HashMap<i64, i64>, ServiceError> {
        let mut query = inventory_reservation::Entity::find()
            .select_only()
            .column(inventory_reservation::Column::ProductId)
            .column_as(
                Expr::col(inventory_reservation::Column::Quantity).sum(),
                "reserved_qty",
            )
            .filter(inventory_reservation::Column::ProductId.is_in(product_ids.to_vec()))
            .filter(inventory_reservation::Column::Status.eq(ReservationStatus::Active))
            .filter(inventory_reservation::Column::ReservedUntil.gt(now));
        match exclude {
            Some(Holder::Session(session_id)) => {
                query =
                    query.filter(inventory_reservation::Column::CheckoutSessionId.ne(session_id));
            }
            Some(Holder::Order(order_id)) => {
                query = query.filter(
                    Condition::any()
                        .add(inventory_reservation::Column::OrderId.is_null())
                        .add(inventory_reservation::Column::OrderId.ne(order_id)),
                );
            }
            None => {}
        }
        let rows: Vec<(i64, Option<i64>)> = query
            .group_by(inventory_reservation::Column::ProductId)
            .into_tuple()
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(rows
            .into_iter()
            .map(|(product_id, qty)| (product_id, qty.unwrap_or(0)))
            .collect())
    }

    /// Live reservations per product held by anyone other than `order_id`.
    /// Callers lock the product rows first.
    pub async fn held_by_others<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_ids: &[i64],
        order_id: i64,
        now: DateTime<Utc>,
    ) -> Result<HashMap<i64, i64>, ServiceError> {
        Self::reserved_quantities(conn, product_ids, Some(Holder::Order(order_id)), now).await
    }

    /// All-or-nothing availability check. Product rows are write-locked in id
    /// order so concurrent checkouts for the same products queue up here.
    #[instrument(skip(self, conn, requested))]
    pub async fn check_availability<C: ConnectionTrait>(
        &self,
        conn: &C,
        requested: &BTreeMap<i64, i32>,
        exclude_session: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let product_ids: Vec<i64> = requested.keys().copied().collect();
        if product_ids.is_empty() {
            return Err(ServiceError::BadRequest("no items to reserve".to_string()));
        }

        let products: HashMap<i64, product::Model> = product::Entity::find()
            .filter(product::Column::Id.is_in(product_ids.clone()))
            .order_by_asc(product::Column::Id)
            .lock_exclusive()
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let reserved =
            Self::reserved_quantities(conn, &product_ids, exclude_session.map(Holder::Session), now)
                .await?;

        let mut problems = Vec::new();
        for (product_id, qty) in requested {
            let Some(product) = products.get(product_id) else {
                return Err(ServiceError::NotFound(format!("product {product_id} not found")));
            };
            let held = reserved.get(product_id).copied().unwrap_or(0);
            let available = (i64::from(product.stock_qty) - held).max(0);
            if i64::from(*qty) > available {
                problems.push(format!(
                    "Not enough stock for product {product_id}: requested={qty}, available={available}"
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            warn!(problems = ?problems, "availability check failed");
            Err(ServiceError::InsufficientStock(problems.join("; ")))
        }
    }

    /// Inserts one ACTIVE row per product; rows already present for the
    /// (session, product) pair are left untouched. Returns the number inserted.
    #[instrument(skip(self, conn, requested))]
    pub async fn reserve<C: ConnectionTrait>(
        &self,
        conn: &C,
        session_id: i64,
        requested: &BTreeMap<i64, i32>,
        deadline: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        if requested.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let rows = requested
            .iter()
            .map(|(product_id, qty)| inventory_reservation::ActiveModel {
                checkout_session_id: Set(session_id),
                product_id: Set(*product_id),
                order_id: Set(None),
                quantity: Set(*qty),
                status: Set(ReservationStatus::Active),
                reserved_until: Set(deadline),
                last_error: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            });

        let inserted = inventory_reservation::Entity::insert_many(rows)
            .on_conflict(
                OnConflict::columns([
                    inventory_reservation::Column::CheckoutSessionId,
                    inventory_reservation::Column::ProductId,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(conn)
            .await
            .map_err(ServiceError::db_error)?;

        info!(session_id, inserted, "reservations recorded");
        Ok(inserted)
    }

    /// Moves the deadline of the session's ACTIVE reservations.
    pub async fn extend_deadline<C: ConnectionTrait>(
        &self,
        conn: &C,
        session_id: i64,
        deadline: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        let res = inventory_reservation::Entity::update_many()
            .col_expr(inventory_reservation::Column::ReservedUntil, Expr::value(deadline))
            .col_expr(inventory_reservation::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(inventory_reservation::Column::CheckoutSessionId.eq(session_id))
            .filter(inventory_reservation::Column::Status.eq(ReservationStatus::Active))
            .filter(inventory_reservation::Column::ReservedUntil.lt(deadline))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(res.rows_affected)
    }

    /// Removes this session's reservations that no longer match `requested`
    /// (different quantity, dropped product, or no longer ACTIVE) so a fresh
    /// reservation pass can recreate them.
    pub async fn drop_stale<C: ConnectionTrait>(
        &self,
        conn: &C,
        session_id: i64,
        requested: &BTreeMap<i64, i32>,
        now: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        let existing = inventory_reservation::Entity::find()
            .filter(inventory_reservation::Column::CheckoutSessionId.eq(session_id))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let stale: Vec<i64> = existing
            .iter()
            .filter(|r| requested.get(&r.product_id) != Some(&r.quantity) || !r.is_live(now))
            .map(|r| r.id)
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }
        let res = inventory_reservation::Entity::delete_many()
            .filter(inventory_reservation::Column::Id.is_in(stale))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(res.rows_affected)
    }

    /// Confirms that every snapshot line is backed by a live reservation of the
    /// same quantity, and that no extra reservations exist for the session.
    #[instrument(skip(self, conn, snapshot))]
    pub async fn validate_against_snapshot<C: ConnectionTrait>(
        &self,
        conn: &C,
        session_id: i64,
        snapshot: &CartSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Vec<inventory_reservation::Model>, ServiceError> {
        let reservations = inventory_reservation::Entity::find()
            .filter(inventory_reservation::Column::CheckoutSessionId.eq(session_id))
            .filter(inventory_reservation::Column::Status.eq(ReservationStatus::Active))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        if reservations.is_empty() {
            return Err(ServiceError::ReservationMismatch(
                "no reservations found for checkout".to_string(),
            ));
        }

        let requested = requested_by_product(snapshot);
        let by_product: HashMap<i64, &inventory_reservation::Model> =
            reservations.iter().map(|r| (r.product_id, r)).collect();

        for (product_id, qty) in &requested {
            let Some(reservation) = by_product.get(product_id) else {
                return Err(ServiceError::ReservationMismatch(format!(
                    "no reservation for product {product_id}"
                )));
            };
            if reservation.reserved_until <= now {
                return Err(ServiceError::ReservationMismatch(format!(
                    "reservation for product {product_id} expired"
                )));
            }
            if reservation.quantity != *qty {
                return Err(ServiceError::ReservationMismatch(format!(
                    "product {product_id}: reserved={}, requested={qty}",
                    reservation.quantity
                )));
            }
        }
        if reservations.len() != requested.len() {
            return Err(ServiceError::ReservationMismatch(
                "reservations do not match cart snapshot".to_string(),
            ));
        }
        Ok(reservations)
    }

    /// Links the session's ACTIVE reservations to the order created from it.
    pub async fn attach_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        session_id: i64,
        order_id: i64,
    ) -> Result<u64, ServiceError> {
        let res = inventory_reservation::Entity::update_many()
            .col_expr(inventory_reservation::Column::OrderId, Expr::value(order_id))
            .col_expr(inventory_reservation::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(inventory_reservation::Column::CheckoutSessionId.eq(session_id))
            .filter(inventory_reservation::Column::Status.eq(ReservationStatus::Active))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(res.rows_affected)
    }

    /// Converts the order's live reservations into permanent stock decrements.
    ///
    /// ACTIVE reservations past their deadline no longer back the order: they
    /// are marked EXPIRED and left for the caller to cover. Each live
    /// reservation is first claimed (ACTIVE -> COMMITTED, conditional on its
    /// current status) and then backed by a conditional decrement. A claim that
    /// finds the row already committed is a no-op; a decrement that finds too
    /// little stock puts the reservation back to ACTIVE with `last_error` set and
    /// is reported in `failures` without failing the call.
    #[instrument(skip(self, conn))]
    pub async fn commit<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: i64,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, ServiceError> {
        let reservations = inventory_reservation::Entity::find()
            .filter(inventory_reservation::Column::OrderId.eq(order_id))
            .filter(inventory_reservation::Column::Status.eq(ReservationStatus::Active))
            .order_by_asc(inventory_reservation::Column::ProductId)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let mut outcome = CommitOutcome::default();
        for reservation in reservations {
            if !reservation.is_live(now) {
                inventory_reservation::Entity::update_many()
                    .col_expr(
                        inventory_reservation::Column::Status,
                        Expr::value(ReservationStatus::Expired),
                    )
                    .col_expr(inventory_reservation::Column::UpdatedAt, Expr::value(now))
                    .filter(inventory_reservation::Column::Id.eq(reservation.id))
                    .filter(inventory_reservation::Column::Status.eq(ReservationStatus::Active))
                    .exec(conn)
                    .await
                    .map_err(ServiceError::db_error)?;
                outcome.expired_reservation_ids.push(reservation.id);
                continue;
            }
            let claimed = inventory_reservation::Entity::update_many()
                .col_expr(
                    inventory_reservation::Column::Status,
                    Expr::value(ReservationStatus::Committed),
                )
                .col_expr(inventory_reservation::Column::UpdatedAt, Expr::value(now))
                .filter(inventory_reservation::Column::Id.eq(reservation.id))
                .filter(inventory_reservation::Column::Status.eq(ReservationStatus::Active))
                .exec(conn)
                .await
                .map_err(ServiceError::db_error)?;
            if claimed.rows_affected == 0 {
                continue;
            }

            if decrement_stock(conn, reservation.product_id, reservation.quantity).await? {
                outcome.committed_reservation_ids.push(reservation.id);
                *outcome
                    .committed_quantities
                    .entry(reservation.product_id)
                    .or_insert(0) += reservation.quantity;
            } else {
                warn!(
                    reservation_id = reservation.id,
                    product_id = reservation.product_id,
                    requested = reservation.quantity,
                    "stock decrement refused for reservation"
                );
                inventory_reservation::Entity::update_many()
                    .col_expr(
                        inventory_reservation::Column::Status,
                        Expr::value(ReservationStatus::Active),
                    )
                    .col_expr(
                        inventory_reservation::Column::LastError,
                        Expr::value(format!(
                            "insufficient stock to commit {} units",
                            reservation.quantity
                        )),
                    )
                    .col_expr(inventory_reservation::Column::UpdatedAt, Expr::value(now))
                    .filter(inventory_reservation::Column::Id.eq(reservation.id))
                    .exec(conn)
                    .await
                    .map_err(ServiceError::db_error)?;
                outcome.failures.push(CommitFailure {
                    reservation_id: reservation.id,
                    product_id: reservation.product_id,
                    requested: reservation.quantity,
                });
            }
        }

        info!(
            order_id,
            committed = outcome.committed_reservation_ids.len(),
            failed = outcome.failures.len(),
            expired = outcome.expired_reservation_ids.len(),
            "reservations committed"
        );
        Ok(outcome)
    }

    /// Releases whatever the session still holds.
    pub async fn release_for_session<C: ConnectionTrait>(
        &self,
        conn: &C,
        session_id: i64,
    ) -> Result<u64, ServiceError> {
        let res = inventory_reservation::Entity::update_many()
            .col_expr(
                inventory_reservation::Column::Status,
                Expr::value(ReservationStatus::Released),
            )
            .col_expr(inventory_reservation::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(inventory_reservation::Column::CheckoutSessionId.eq(session_id))
            .filter(inventory_reservation::Column::Status.eq(ReservationStatus::Active))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(res.rows_affected)
    }

    /// Marks ACTIVE reservations whose deadline has passed as EXPIRED.
    #[instrument(skip(self))]
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let res = inventory_reservation::Entity::update_many()
            .col_expr(
                inventory_reservation::Column::Status,
                Expr::value(ReservationStatus::Expired),
            )
            .col_expr(inventory_reservation::Column::UpdatedAt, Expr::value(now))
            .filter(inventory_reservation::Column::Status.eq(ReservationStatus::Active))
            .filter(inventory_reservation::Column::ReservedUntil.lte(now))
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        if res.rows_affected > 0 {
            info!(expired = res.rows_affected, "expired stale reservations");
        }
        Ok(res.rows_affected)
    }
}

/// `UPDATE products SET stock_qty = stock_qty - n WHERE id = ? AND stock_qty >= n`.
/// Returns whether the row was decremented.
pub async fn decrement_stock<C: ConnectionTrait>(
    conn: &C,
    product_id: i64,
    quantity: i32,
) -> Result<bool, ServiceError> {
    let res = product::Entity::update_many()
        .col_expr(
            product::Column::StockQty,
            Expr::col(product::Column::StockQty).sub(quantity),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(product::Column::Id.eq(product_id))
        .filter(product::Column::StockQty.gte(quantity))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(res.rows_affected == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::checkout_session::SnapshotItem;

    #[test]
    fn requested_quantities_are_merged_per_product() {
        let snapshot = CartSnapshot {
            items: vec![
                SnapshotItem { product_id: 2, quantity: 1, unit_price: 10 },
                SnapshotItem { product_id: 1, quantity: 3, unit_price: 20 },
                SnapshotItem { product_id: 2, quantity: 4, unit_price: 10 },
            ],
        };
        let requested = requested_by_product(&snapshot);
        assert_eq!(requested.get(&1), Some(&3));
        assert_eq!(requested.get(&2), Some(&5));
        assert_eq!(requested.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }
}
