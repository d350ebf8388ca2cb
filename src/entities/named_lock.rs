use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;

/// Lock rows used on backends without transaction-scoped advisory locks.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "named_locks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub lock_key: i64,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
