//! Per-user checkout sessions.
//!
//! A user has at most one active session (partial unique index on
//! `checkout_sessions(user_id) WHERE is_active`). Sessions carry the cart
//! snapshot and payment method between the order-summary and confirm steps
//! and become unusable once inside the expiry buffer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, QuerySelect, Set, SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::{CheckoutConfig, PricingConfig};
use crate::entities::checkout_session::{self, CartSnapshot, PaymentMethod};
use crate::errors::ServiceError;
use crate::services::cart::CartSource;
use crate::services::inventory_reservations::{requested_by_product, InventoryReservationManager};
use crate::services::pricing::{compute_totals, OrderTotals};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiatedCheckout {
    pub checkout_id: Uuid,
    pub expires_at: DateTime<Utc>,
    /// False when an existing active session was returned.
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSummary {
    pub checkout_id: Uuid,
    pub payment_method: PaymentMethod,
    pub expires_at: DateTime<Utc>,
    pub reservations_created: u64,
    pub items: CartSnapshot,
    pub totals: OrderTotals,
}

/// Session state locked for the confirm step.
#[derive(Debug, Clone)]
pub struct ConfirmableCheckout {
    pub session: checkout_session::Model,
    pub snapshot: CartSnapshot,
    pub payment_method: PaymentMethod,
}

#[derive(Clone)]
pub struct CheckoutSessionManager {
    db_pool: Arc<DatabaseConnection>,
    reservations: InventoryReservationManager,
    cart: Arc<dyn CartSource>,
    checkout: CheckoutConfig,
    pricing: PricingConfig,
}

impl CheckoutSessionManager {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        reservations: InventoryReservationManager,
        cart: Arc<dyn CartSource>,
        checkout: CheckoutConfig,
        pricing: PricingConfig,
    ) -> Self {
        Self {
            db_pool,
            reservations,
            cart,
            checkout,
            pricing,
        }
    }

    async fn find_active_for_user<C: ConnectionTrait>(
        conn: &C,
        user_id: i64,
        lock: bool,
    ) -> Result<Option<checkout_session::Model>, ServiceError> {
        let mut query = checkout_session::Entity::find()
            .filter(checkout_session::Column::UserId.eq(user_id))
            .filter(checkout_session::Column::IsActive.eq(true));
        if lock {
            query = query.lock_exclusive();
        }
        query.one(conn).await.map_err(ServiceError::db_error)
    }

    async fn lock_by_public_id(
        txn: &DatabaseTransaction,
        checkout_id: Uuid,
        user_id: i64,
    ) -> Result<checkout_session::Model, ServiceError> {
        let session = checkout_session::Entity::find()
            .filter(checkout_session::Column::PublicId.eq(checkout_id))
            .lock_exclusive()
            .one(txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("checkout {checkout_id} not found")))?;
        if session.user_id != user_id {
            return Err(ServiceError::Forbidden(
                "checkout belongs to another user".to_string(),
            ));
        }
        Ok(session)
    }

    async fn deactivate<C: ConnectionTrait>(
        &self,
        conn: &C,
        session_id: i64,
    ) -> Result<(), ServiceError> {
        checkout_session::Entity::update_many()
            .col_expr(checkout_session::Column::IsActive, Expr::value(false))
            .col_expr(checkout_session::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(checkout_session::Column::Id.eq(session_id))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
        self.reservations.release_for_session(conn, session_id).await?;
        Ok(())
    }

    /// Returns the user's active session, creating one if none exists. An
    /// expired active session is deactivated and replaced.
    #[instrument(skip(self))]
    pub async fn initiate(&self, user_id: i64) -> Result<InitiatedCheckout, ServiceError> {
        let now = Utc::now();
        let txn = self.db_pool.begin().await.map_err(ServiceError::db_error)?;

        if let Some(existing) = Self::find_active_for_user(&txn, user_id, true).await? {
            if existing.expires_at > now {
                txn.commit().await.map_err(ServiceError::db_error)?;
                return Ok(InitiatedCheckout {
                    checkout_id: existing.public_id,
                    expires_at: existing.expires_at,
                    created: false,
                });
            }
            info!(user_id, checkout_id = %existing.public_id, "replacing expired checkout session");
            self.deactivate(&txn, existing.id).await?;
        }

        let expires_at = now + self.checkout.session_ttl();
        let inserted = checkout_session::ActiveModel {
            public_id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            cart_snapshot: Set(None),
            selected_payment_method: Set(None),
            is_active: Set(true),
            order_id: Set(None),
            expires_at: Set(expires_at),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await;

        match inserted {
            Ok(session) => {
                txn.commit().await.map_err(ServiceError::db_error)?;
                info!(user_id, checkout_id = %session.public_id, "checkout session created");
                Ok(InitiatedCheckout {
                    checkout_id: session.public_id,
                    expires_at: session.expires_at,
                    created: true,
                })
            }
            Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                // A concurrent initiate won. The failed statement poisons the
                // transaction, so roll back before reading the winner.
                txn.rollback().await.map_err(ServiceError::db_error)?;
                let winner = Self::find_active_for_user(&*self.db_pool, user_id, false)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::Transient("active checkout vanished during initiate".into())
                    })?;
                Ok(InitiatedCheckout {
                    checkout_id: winner.public_id,
                    expires_at: winner.expires_at,
                    created: false,
                })
            }
            Err(err) => Err(ServiceError::db_error(err)),
        }
    }

    /// Captures the cart, reserves stock for it and records the payment method,
    /// all in one transaction.
    #[instrument(skip(self))]
    pub async fn set_payment_method(
        &self,
        checkout_id: Uuid,
        user_id: i64,
        method: PaymentMethod,
    ) -> Result<OrderSummary, ServiceError> {
        let snapshot = self.cart.snapshot(user_id).await?;
        if snapshot.is_empty() {
            return Err(ServiceError::BadRequest("cart is empty".to_string()));
        }
        let totals = compute_totals(&snapshot, method, &self.pricing)?;
        let requested = requested_by_product(&snapshot);

        let now = Utc::now();
        let txn = self.db_pool.begin().await.map_err(ServiceError::db_error)?;
        let session = Self::lock_by_public_id(&txn, checkout_id, user_id).await?;

        if !session.is_active {
            return Err(ServiceError::CheckoutExpired(
                "checkout session is no longer active".to_string(),
            ));
        }
        if session.is_expiring(now, self.checkout.expiry_buffer()) {
            self.deactivate(&txn, session.id).await?;
            txn.commit().await.map_err(ServiceError::db_error)?;
            warn!(%checkout_id, "checkout expired before payment method was set");
            return Err(ServiceError::CheckoutExpired(
                "checkout session expired".to_string(),
            ));
        }

        let expires_at = if method.is_pay_now() {
            let extended =
                session.created_at + self.checkout.session_ttl() + self.checkout.pay_now_extension();
            session.expires_at.max(extended)
        } else {
            session.expires_at
        };
        let deadline = expires_at + self.checkout.reservation_grace();

        self.reservations
            .drop_stale(&txn, session.id, &requested, now)
            .await?;
        self.reservations
            .check_availability(&txn, &requested, Some(session.id), now)
            .await?;
        let reservations_created = self
            .reservations
            .reserve(&txn, session.id, &requested, deadline)
            .await?;
        self.reservations
            .extend_deadline(&txn, session.id, deadline)
            .await?;

        let mut active: checkout_session::ActiveModel = session.into();
        active.cart_snapshot = Set(Some(serde_json::to_value(&snapshot)?));
        active.selected_payment_method = Set(Some(method));
        active.expires_at = Set(expires_at);
        active.updated_at = Set(now);
        active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;
        info!(%checkout_id, %method, reservations_created, "payment method set and stock reserved");

        Ok(OrderSummary {
            checkout_id,
            payment_method: method,
            expires_at,
            reservations_created,
            items: snapshot,
            totals,
        })
    }

    /// Locks the session row for the remainder of `txn` and returns the state
    /// needed to place the order.
    pub async fn load_for_confirm(
        &self,
        txn: &DatabaseTransaction,
        checkout_id: Uuid,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ConfirmableCheckout, ServiceError> {
        let session = Self::lock_by_public_id(txn, checkout_id, user_id).await?;
        if !session.is_active {
            return Err(ServiceError::CheckoutExpired(
                "checkout session is no longer active".to_string(),
            ));
        }
        if session.is_expiring(now, self.checkout.expiry_buffer()) {
            return Err(ServiceError::CheckoutExpired(
                "checkout session expired".to_string(),
            ));
        }
        let payment_method = session.selected_payment_method.ok_or_else(|| {
            ServiceError::BadRequest("payment method has not been selected".to_string())
        })?;
        let snapshot = session.snapshot()?;
        if snapshot.is_empty() {
            return Err(ServiceError::BadRequest("checkout has no items".to_string()));
        }
        Ok(ConfirmableCheckout {
            session,
            snapshot,
            payment_method,
        })
    }

    /// Closes the session once its order exists.
    pub async fn complete(
        &self,
        txn: &DatabaseTransaction,
        session_id: i64,
        order_id: i64,
    ) -> Result<(), ServiceError> {
        checkout_session::Entity::update_many()
            .col_expr(checkout_session::Column::IsActive, Expr::value(false))
            .col_expr(checkout_session::Column::OrderId, Expr::value(order_id))
            .col_expr(checkout_session::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(checkout_session::Column::Id.eq(session_id))
            .exec(txn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }

    /// Explicit cancellation. Returns false when the session was already inactive.
    #[instrument(skip(self))]
    pub async fn cancel(&self, checkout_id: Uuid, user_id: i64) -> Result<bool, ServiceError> {
        let txn = self.db_pool.begin().await.map_err(ServiceError::db_error)?;
        let session = Self::lock_by_public_id(&txn, checkout_id, user_id).await?;
        if !session.is_active {
            return Ok(false);
        }
        self.deactivate(&txn, session.id).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;
        info!(%checkout_id, "checkout cancelled");
        Ok(true)
    }

    /// Hygiene: deactivates sessions whose deadline has passed.
    pub async fn expire_sessions(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let res = checkout_session::Entity::update_many()
            .col_expr(checkout_session::Column::IsActive, Expr::value(false))
            .col_expr(checkout_session::Column::UpdatedAt, Expr::value(now))
            .filter(checkout_session::Column::IsActive.eq(true))
            .filter(checkout_session::Column::ExpiresAt.lte(now))
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(res.rows_affected)
    }
}
