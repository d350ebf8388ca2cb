use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One row per client-supplied token. The response columns stay empty until the
/// guarded operation commits in the same transaction that fills them.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "idempotency_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub key: String,
    pub created_by: i64,
    pub request_hash: String,
    pub owner_type: Option<String>,
    pub owner_id: Option<i64>,
    pub response_code: Option<i32>,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub response_body: Option<Json>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Model {
    pub fn terminal_response(&self) -> Option<(u16, Json)> {
        match (self.response_code, &self.response_body) {
            (Some(code), Some(body)) => u16::try_from(code).ok().map(|c| (c, body.clone())),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
