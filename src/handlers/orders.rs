use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::services::order_commit::OrderDetails;
use crate::{ApiResponse, ApiResult, AppState};

pub fn router() -> Router<AppState> {
    Router::new().route("/:order_id", get(get_order))
}

async fn get_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(order_id): Path<Uuid>,
) -> ApiResult<OrderDetails> {
    let details = state
        .services
        .orders
        .order_details(order_id, user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(details)))
}
