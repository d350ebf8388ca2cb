//! Transaction helper that keeps `ServiceError` intact across the closure boundary.

use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionError, TransactionTrait};
use std::future::Future;
use std::pin::Pin;

use crate::errors::ServiceError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Runs `f` inside a transaction: commit on `Ok`, rollback on `Err`.
///
/// ```rust,ignore
/// let order = with_transaction(&db, |txn| {
///     Box::pin(async move {
///         let order = order::Entity::insert(model).exec(txn).await?;
///         Ok(order.last_insert_id)
///     })
/// })
/// .await?;
/// ```
pub async fn with_transaction<F, T>(db: &DatabaseConnection, f: F) -> Result<T, ServiceError>
where
    F: for<'a> FnOnce(&'a DatabaseTransaction) -> BoxFuture<'a, Result<T, ServiceError>> + Send,
    T: Send,
{
    db.transaction::<_, T, ServiceError>(f)
        .await
        .map_err(|e| match e {
            TransactionError::Connection(db_err) => ServiceError::DatabaseError(db_err),
            TransactionError::Transaction(err) => err,
        })
}
