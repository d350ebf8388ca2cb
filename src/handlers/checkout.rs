use axum::{
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthenticatedUser;
use crate::entities::checkout_session::PaymentMethod;
use crate::errors::ServiceError;
use crate::middleware_helpers::retry::retry_transient;
use crate::services::idempotency::IdempotencyToken;
use crate::services::order_commit::ConfirmRequest;
use crate::{ApiResponse, AppState};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const IDEMPOTENT_REPLAY_HEADER: &str = "idempotent-replayed";

#[derive(Debug, Deserialize, Validate)]
pub struct OrderSummaryRequest {
    #[validate(length(min = 1, max = 16))]
    pub payment_method: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub checkout_id: Uuid,
    pub cancelled: bool,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/initiate", post(initiate))
        .route("/:checkout_id/order-summary", post(order_summary))
        .route("/:checkout_id/secure-confirm", post(secure_confirm))
        .route("/:checkout_id/cancel", post(cancel))
}

async fn initiate(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<impl IntoResponse, ServiceError> {
    let user_id = user.user_id;
    let manager = state.services.checkout.clone();
    let initiated = retry_transient(&state.retry, || {
        let manager = manager.clone();
        async move { manager.initiate(user_id).await }
    })
    .await?;
    let status = if initiated.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ApiResponse::success(initiated))))
}

async fn order_summary(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(checkout_id): Path<Uuid>,
    Json(payload): Json<OrderSummaryRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    payload.validate()?;
    let method: PaymentMethod = payload
        .payment_method
        .parse()
        .map_err(ServiceError::BadRequest)?;

    let user_id = user.user_id;
    let manager = state.services.checkout.clone();
    let summary = retry_transient(&state.retry, || {
        let manager = manager.clone();
        async move {
            manager
                .set_payment_method(checkout_id, user_id, method)
                .await
        }
    })
    .await?;
    Ok(Json(ApiResponse::success(summary)))
}

async fn secure_confirm(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(checkout_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ServiceError> {
    let raw_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ServiceError::MissingIdempotencyKey)?;
    let request = ConfirmRequest {
        checkout_id,
        user_id: user.user_id,
        token: IdempotencyToken::parse(raw_key)?,
    };

    let orders = state.services.orders.clone();
    let response = retry_transient(&state.retry, || {
        let orders = orders.clone();
        let request = request.clone();
        async move { orders.confirm(&request).await }
    })
    .await?;

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
    let mut response_headers = HeaderMap::new();
    if response.replayed {
        info!(%checkout_id, "replaying stored confirm response");
        response_headers.insert(
            HeaderName::from_static(IDEMPOTENT_REPLAY_HEADER),
            HeaderValue::from_static("true"),
        );
    }
    Ok((
        status,
        response_headers,
        Json(ApiResponse::success(response.body)),
    ))
}

async fn cancel(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(checkout_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let cancelled = state
        .services
        .checkout
        .cancel(checkout_id, user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(CancelResponse {
        checkout_id,
        cancelled,
    })))
}
