use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};

use crate::entities::checkout_session::{CartSnapshot, SnapshotItem};
use crate::entities::{cart_item, product};
use crate::errors::ServiceError;

/// Supplies the user's current cart, priced at the moment of the call.
#[async_trait]
pub trait CartSource: Send + Sync {
    async fn snapshot(&self, user_id: i64) -> Result<CartSnapshot, ServiceError>;
}

/// Reads `cart_items` joined to the product's current `base_price`.
#[derive(Clone)]
pub struct DbCartSource {
    db_pool: Arc<DatabaseConnection>,
}

impl DbCartSource {
    pub fn new(db_pool: Arc<DatabaseConnection>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl CartSource for DbCartSource {
    async fn snapshot(&self, user_id: i64) -> Result<CartSnapshot, ServiceError> {
        let rows = cart_item::Entity::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .filter(cart_item::Column::Quantity.gt(0))
            .order_by_asc(cart_item::Column::ProductId)
            .find_also_related(product::Entity)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        let mut items = Vec::with_capacity(rows.len());
        for (line, product) in rows {
            let product = product.ok_or_else(|| {
                ServiceError::NotFound(format!("product {} in cart no longer exists", line.product_id))
            })?;
            items.push(SnapshotItem {
                product_id: product.id,
                quantity: line.quantity,
                unit_price: product.base_price,
            });
        }
        Ok(CartSnapshot { items })
    }
}
