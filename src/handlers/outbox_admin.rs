use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::AdminUser;
use crate::entities::outbox_event::{self, OutboxStatus};
use crate::events::outbox::{list_outstanding, requeue_failed};
use crate::{ApiResponse, ApiResult, AppState};

const DEFAULT_LIMIT: u64 = 100;
const MAX_LIMIT: u64 = 500;

#[derive(Debug, Default, Deserialize)]
pub struct OutboxQuery {
    pub status: Option<OutboxStatus>,
    pub limit: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct OutboxItem {
    pub id: i64,
    pub topic: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub dedupe_key: String,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<outbox_event::Model> for OutboxItem {
    fn from(event: outbox_event::Model) -> Self {
        Self {
            id: event.id,
            topic: event.topic,
            aggregate_type: event.aggregate_type,
            aggregate_id: event.aggregate_id,
            dedupe_key: event.dedupe_key,
            status: event.status,
            attempts: event.attempts,
            next_retry_at: event.next_retry_at,
            last_error: event.last_error,
            created_at: event.created_at,
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_outbox))
        .route("/:id/retry", post(retry_outbox))
}

async fn list_outbox(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<OutboxQuery>,
) -> ApiResult<Vec<OutboxItem>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let events = list_outstanding(&*state.db, query.status, limit).await?;
    Ok(Json(ApiResponse::success(
        events.into_iter().map(OutboxItem::from).collect(),
    )))
}

async fn retry_outbox(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
) -> ApiResult<OutboxItem> {
    let event = requeue_failed(&*state.db, id).await?;
    info!(outbox_id = id, admin_id = admin.user_id, "outbox event requeued by operator");
    Ok(Json(ApiResponse::success(OutboxItem::from(event))))
}
