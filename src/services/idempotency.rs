//! Durable idempotency ledger for order placement.
//!
//! The ledger row is inserted before the guarded work and receives the final
//! response in the same transaction as that work, so a committed row always
//! carries a replayable response.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::entities::idempotency_key;
use crate::errors::ServiceError;

/// Validated client token from the `Idempotency-Key` header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    const MAX_LENGTH: usize = 128;

    pub fn parse(raw: impl AsRef<str>) -> Result<Self, ServiceError> {
        let key = raw.as_ref().trim();
        if key.is_empty() {
            return Err(ServiceError::MissingIdempotencyKey);
        }
        if key.len() > Self::MAX_LENGTH {
            return Err(ServiceError::ValidationError(format!(
                "Idempotency-Key exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
        {
            return Err(ServiceError::ValidationError(
                "Idempotency-Key contains invalid characters".to_string(),
            ));
        }
        Ok(Self(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Outcome of claiming a token.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerClaim {
    /// This request owns the token and must run the guarded work.
    Fresh,
    /// A previous request finished; return its response verbatim.
    Replay { status: u16, body: serde_json::Value },
    /// Another request holds the token and has not finished yet.
    InProgress,
}

/// Fingerprint binding a token to the request it was first used for.
pub fn request_fingerprint(user_id: i64, scope: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.to_be_bytes());
    hasher.update(b":");
    hasher.update(scope.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct IdempotencyLedger {
    db_pool: Arc<DatabaseConnection>,
    ttl: Duration,
}

impl IdempotencyLedger {
    pub fn new(db_pool: Arc<DatabaseConnection>, ttl: Duration) -> Self {
        Self { db_pool, ttl }
    }

    /// Inserts the ledger row, or inspects the existing one when the insert is
    /// skipped because the token is already known.
    #[instrument(skip(self, conn, token), fields(key = %token.as_str()))]
    pub async fn claim<C: ConnectionTrait>(
        &self,
        conn: &C,
        token: &IdempotencyToken,
        user_id: i64,
        request_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<LedgerClaim, ServiceError> {
        let inserted = idempotency_key::Entity::insert(idempotency_key::ActiveModel {
            key: Set(token.as_str().to_string()),
            created_by: Set(user_id),
            request_hash: Set(request_hash.to_string()),
            owner_type: Set(None),
            owner_id: Set(None),
            response_code: Set(None),
            response_body: Set(None),
            created_at: Set(now),
            expires_at: Set(now + self.ttl),
            ..Default::default()
        })
        .on_conflict(
            OnConflict::column(idempotency_key::Column::Key)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await
        .map_err(ServiceError::db_error)?;

        if inserted == 1 {
            debug!("idempotency key recorded");
            return Ok(LedgerClaim::Fresh);
        }

        let existing = idempotency_key::Entity::find()
            .filter(idempotency_key::Column::Key.eq(token.as_str()))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::Transient("idempotency key disappeared while claiming".to_string())
            })?;

        if existing.created_by != user_id || existing.request_hash != request_hash {
            return Err(ServiceError::IdempotencyKeyReused(
                "key was already used for a different request".to_string(),
            ));
        }

        Ok(match existing.terminal_response() {
            Some((status, body)) => {
                metrics::counter!("idempotency.replayed", 1);
                info!(status, "replaying stored response");
                LedgerClaim::Replay { status, body }
            }
            None => LedgerClaim::InProgress,
        })
    }

    /// Stores the terminal response for `token`. Must run in the transaction
    /// that performed the guarded work.
    pub async fn record_response<C: ConnectionTrait>(
        &self,
        conn: &C,
        token: &IdempotencyToken,
        owner_type: &str,
        owner_id: i64,
        status: u16,
        body: &serde_json::Value,
    ) -> Result<(), ServiceError> {
        let res = idempotency_key::Entity::update_many()
            .col_expr(idempotency_key::Column::OwnerType, Expr::value(owner_type))
            .col_expr(idempotency_key::Column::OwnerId, Expr::value(owner_id))
            .col_expr(idempotency_key::Column::ResponseCode, Expr::value(i32::from(status)))
            .col_expr(idempotency_key::Column::ResponseBody, Expr::value(body.clone()))
            .filter(idempotency_key::Column::Key.eq(token.as_str()))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
        if res.rows_affected != 1 {
            return Err(ServiceError::InternalError(format!(
                "idempotency key {} missing when recording response",
                token.as_str()
            )));
        }
        Ok(())
    }

    /// Deletes finished keys past their expiry.
    #[instrument(skip(self))]
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let res = idempotency_key::Entity::delete_many()
            .filter(idempotency_key::Column::ExpiresAt.lt(now))
            .filter(idempotency_key::Column::ResponseCode.is_not_null())
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        if res.rows_affected > 0 {
            info!(purged = res.rows_affected, "purged expired idempotency keys");
        }
        Ok(res.rows_affected)
    }
}
