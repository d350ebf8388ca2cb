//! Payment gateway collaborator.
//!
//! The pipeline only needs two capabilities from a gateway: creating a remote
//! order for a pending payment and authenticating inbound webhooks. Gateway
//! status strings are mapped onto internal statuses by [`translate_status`].

use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::config::PaymentConfig;
use crate::entities::order::OrderStatus;
use crate::entities::payment::PaymentStatus;
use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-razorpay-signature";
pub const EVENT_ID_HEADER: &str = "x-razorpay-event-id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOrderRequest {
    /// Minor units.
    pub amount: i64,
    pub currency: String,
    pub receipt: String,
    pub idempotency_token: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates the gateway-side order and returns its identifier.
    async fn create_remote_order(&self, request: &RemoteOrderRequest)
        -> Result<String, ServiceError>;

    /// Authenticates a webhook delivery and returns its parsed body.
    fn verify_webhook_signature(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
    ) -> Result<Value, ServiceError>;
}

/// Internal statuses for one gateway status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTranslation {
    pub payment: PaymentStatus,
    /// `None` leaves the order untouched.
    pub order: Option<OrderStatus>,
}

/// Exhaustive mapping from gateway payment status to internal statuses.
/// Unrecognized values become `UNKNOWN` and never move the order.
pub fn translate_status(gateway_status: &str) -> StatusTranslation {
    let (payment, order) = match gateway_status.trim().to_ascii_lowercase().as_str() {
        "created" => (PaymentStatus::Pending, Some(OrderStatus::PendingPayment)),
        "authorized" => (PaymentStatus::Authorized, Some(OrderStatus::PendingPayment)),
        "captured" | "paid" => (PaymentStatus::Captured, Some(OrderStatus::Confirmed)),
        "failed" => (PaymentStatus::Failed, Some(OrderStatus::PendingPayment)),
        "refunded" => (PaymentStatus::Refunded, Some(OrderStatus::Refunded)),
        _ => (PaymentStatus::Unknown, None),
    };
    StatusTranslation { payment, order }
}

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String, ServiceError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(format!("invalid webhook secret: {e}")))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks a hex signature in constant time.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

#[derive(Debug, Deserialize)]
struct RemoteOrderResponse {
    id: String,
}

/// Razorpay REST client.
#[derive(Clone)]
pub struct RazorpayGateway {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
    webhook_secret: String,
}

impl RazorpayGateway {
    pub fn new(config: &PaymentConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.gateway_base_url.trim_end_matches('/').to_string(),
            key_id: config.key_id.clone(),
            key_secret: config.key_secret.clone(),
            webhook_secret: config.webhook_secret.clone(),
        })
    }
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    #[instrument(skip(self, request), fields(receipt = %request.receipt, amount = request.amount))]
    async fn create_remote_order(
        &self,
        request: &RemoteOrderRequest,
    ) -> Result<String, ServiceError> {
        let response = self
            .client
            .post(format!("{}/v1/orders", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .header("Idempotency-Key", &request.idempotency_token)
            .json(&json!({
                "amount": request.amount,
                "currency": request.currency,
                "receipt": request.receipt,
                "notes": { "idempotency_key": request.idempotency_token },
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    ServiceError::Transient(format!("payment gateway unreachable: {e}"))
                } else {
                    ServiceError::ExternalServiceError(format!("payment gateway request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ServiceError::Transient(format!(
                "payment gateway returned {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, body = %body, "payment gateway rejected remote order");
            return Err(ServiceError::ExternalServiceError(format!(
                "payment gateway returned {status}"
            )));
        }

        let created: RemoteOrderResponse = response.json().await.map_err(|e| {
            ServiceError::ExternalServiceError(format!("unexpected gateway response: {e}"))
        })?;
        debug!(provider_order_id = %created.id, "remote order created");
        Ok(created.id)
    }

    fn verify_webhook_signature(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
    ) -> Result<Value, ServiceError> {
        if self.webhook_secret.is_empty() {
            warn!("webhook secret not configured; rejecting delivery");
            return Err(ServiceError::InvalidSignature);
        }
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ServiceError::InvalidSignature)?;
        if !verify_signature(&self.webhook_secret, raw_body, signature) {
            return Err(ServiceError::InvalidSignature);
        }
        serde_json::from_slice(raw_body)
            .map_err(|e| ServiceError::BadRequest(format!("invalid webhook json: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::http::HeaderValue;
    use rstest::rstest;
    use wiremock::matchers::{basic_auth, body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str) -> PaymentConfig {
        PaymentConfig {
            gateway_base_url: base_url.to_string(),
            key_id: "rzp_test_key".into(),
            key_secret: "rzp_test_secret".into(),
            webhook_secret: "whsec".into(),
            ..PaymentConfig::default()
        }
    }

    fn request() -> RemoteOrderRequest {
        RemoteOrderRequest {
            amount: 10_250,
            currency: "INR".into(),
            receipt: "order-17".into(),
            idempotency_token: "confirm-abc".into(),
        }
    }

    #[rstest]
    #[case("created", PaymentStatus::Pending, Some(OrderStatus::PendingPayment))]
    #[case("authorized", PaymentStatus::Authorized, Some(OrderStatus::PendingPayment))]
    #[case("captured", PaymentStatus::Captured, Some(OrderStatus::Confirmed))]
    #[case("PAID", PaymentStatus::Captured, Some(OrderStatus::Confirmed))]
    #[case("failed", PaymentStatus::Failed, Some(OrderStatus::PendingPayment))]
    #[case("refunded", PaymentStatus::Refunded, Some(OrderStatus::Refunded))]
    #[case("disputed", PaymentStatus::Unknown, None)]
    #[case("", PaymentStatus::Unknown, None)]
    fn status_table(
        #[case] raw: &str,
        #[case] payment: PaymentStatus,
        #[case] order: Option<OrderStatus>,
    ) {
        assert_eq!(translate_status(raw), StatusTranslation { payment, order });
    }

    #[test]
    fn signature_round_trip_and_tamper() {
        let body = br#"{"event":"payment.captured"}"#;
        let sig = sign_payload("whsec", body).unwrap();
        assert!(verify_signature("whsec", body, &sig));
        assert!(!verify_signature("other", body, &sig));
        assert!(!verify_signature("whsec", b"{}", &sig));
        assert!(!verify_signature("whsec", body, "not-hex"));
    }

    #[test]
    fn webhook_verification_requires_header_and_secret() {
        let gateway = RazorpayGateway::new(&config("http://localhost")).unwrap();
        let body = br#"{"event":"payment.captured"}"#;

        let mut headers = HeaderMap::new();
        assert_matches!(
            gateway.verify_webhook_signature(body, &headers),
            Err(ServiceError::InvalidSignature)
        );

        let sig = sign_payload("whsec", body).unwrap();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&sig).unwrap());
        let payload = gateway.verify_webhook_signature(body, &headers).unwrap();
        assert_eq!(payload["event"], "payment.captured");

        let unconfigured = RazorpayGateway::new(&PaymentConfig::default()).unwrap();
        assert_matches!(
            unconfigured.verify_webhook_signature(body, &headers),
            Err(ServiceError::InvalidSignature)
        );
    }

    #[tokio::test]
    async fn creates_remote_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/orders"))
            .and(basic_auth("rzp_test_key", "rzp_test_secret"))
            .and(header("Idempotency-Key", "confirm-abc"))
            .and(body_partial_json(json!({"amount": 10_250, "currency": "INR", "receipt": "order-17"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "order_Rzp123", "status": "created"})))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = RazorpayGateway::new(&config(&server.uri())).unwrap();
        let id = gateway.create_remote_order(&request()).await.unwrap();
        assert_eq!(id, "order_Rzp123");
    }

    #[tokio::test]
    async fn gateway_errors_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/orders"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/orders"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad amount"))
            .mount(&server)
            .await;

        let gateway = RazorpayGateway::new(&config(&server.uri())).unwrap();
        assert_matches!(
            gateway.create_remote_order(&request()).await,
            Err(ServiceError::Transient(_))
        );
        assert_matches!(
            gateway.create_remote_order(&request()).await,
            Err(ServiceError::ExternalServiceError(_))
        );
    }
}
