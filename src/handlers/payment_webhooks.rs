use axum::{body::Bytes, extract::State, http::HeaderMap, routing::post, Json, Router};

use crate::services::payment_webhooks::WebhookAck;
use crate::{ApiResponse, ApiResult, AppState};

pub fn router() -> Router<AppState> {
    Router::new().route("/webhook", post(payment_webhook))
}

/// Signature verification needs the exact bytes the gateway signed, so the
/// body is taken raw.
async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<WebhookAck> {
    let ack = state.services.webhooks.handle(&body, &headers).await?;
    Ok(Json(ApiResponse::success(ack)))
}
