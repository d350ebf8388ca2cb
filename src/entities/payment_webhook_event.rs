use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Inbound gateway notifications, deduplicated on (provider, provider_event_id).
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_webhook_events")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub provider: String,
    pub provider_event_id: String,
    pub event_type: Option<String>,
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: Json,
    pub payment_id: Option<i64>,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
