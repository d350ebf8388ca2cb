//! Transaction-scoped named locks.
//!
//! PostgreSQL uses `pg_advisory_xact_lock`, released by the server at commit or
//! rollback. Other backends fall back to the `named_locks` table: the holder
//! inserts the key (a concurrent inserter blocks on the uncommitted row) and
//! deletes it again before committing, so a rollback also leaves no trace.

use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseTransaction, DbBackend, EntityTrait, QueryFilter, Set,
    Statement,
};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::entities::named_lock;
use crate::errors::ServiceError;

/// Folds an arbitrary token into the signed 64-bit key space used by advisory locks.
pub fn lock_key(token: &str) -> i64 {
    let digest = Sha256::digest(token.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// A lock held for the lifetime of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamedLock {
    key: i64,
    strategy: LockStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockStrategy {
    Advisory,
    LockTable,
}

impl NamedLock {
    pub fn key(&self) -> i64 {
        self.key
    }

    /// Blocks until the lock for `token` is held by `txn`.
    pub async fn acquire(txn: &DatabaseTransaction, token: &str) -> Result<Self, ServiceError> {
        let key = lock_key(token);
        let backend = txn.get_database_backend();
        let strategy = match backend {
            DbBackend::Postgres => {
                txn.execute(Statement::from_sql_and_values(
                    DbBackend::Postgres,
                    "SELECT pg_advisory_xact_lock($1)",
                    [key.into()],
                ))
                .await?;
                LockStrategy::Advisory
            }
            _ => {
                named_lock::Entity::insert(named_lock::ActiveModel {
                    lock_key: Set(key),
                    acquired_at: Set(Utc::now()),
                })
                .on_conflict(
                    OnConflict::column(named_lock::Column::LockKey)
                        .do_nothing()
                        .to_owned(),
                )
                .exec_without_returning(txn)
                .await?;
                LockStrategy::LockTable
            }
        };
        debug!(lock_key = key, ?strategy, "named lock acquired");
        Ok(Self { key, strategy })
    }

    /// Must run before the owning transaction commits. A no-op for advisory locks.
    pub async fn release(self, txn: &DatabaseTransaction) -> Result<(), ServiceError> {
        if self.strategy == LockStrategy::LockTable {
            named_lock::Entity::delete_many()
                .filter(named_lock::Column::LockKey.eq(self.key))
                .exec(txn)
                .await?;
        }
        Ok(())
    }
}
