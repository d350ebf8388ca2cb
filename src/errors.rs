use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use sea_orm::SqlErr;
use serde::{Deserialize, Serialize};

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body nested inside the uniform `{status, data, error}` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    /// Machine-readable error code, e.g. `insufficient_stock`.
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Idempotency-Key header is required")]
    MissingIdempotencyKey,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Reservation mismatch: {0}")]
    ReservationMismatch(String),

    #[error("Checkout expired: {0}")]
    CheckoutExpired(String),

    #[error("Request with this idempotency key is still in progress")]
    RequestInProgress,

    #[error("Idempotency key reused: {0}")]
    IdempotencyKeyReused(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

/// Driver messages that indicate a retry may succeed.
const TRANSIENT_DB_MARKERS: &[&str] = &[
    "deadlock detected",
    "could not serialize access",
    "could not obtain lock",
    "lock timeout",
    "database is locked",
    "connection reset",
    "connection refused",
    "broken pipe",
    "pool timed out",
];

fn db_err_is_transient(err: &DbErr) -> bool {
    match err {
        DbErr::ConnectionAcquire(_) | DbErr::Conn(_) => true,
        DbErr::Exec(_) | DbErr::Query(_) => {
            let message = err.to_string().to_ascii_lowercase();
            TRANSIENT_DB_MARKERS.iter().any(|m| message.contains(m))
        }
        _ => false,
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    /// Maps a failure of an order-placement write. An integrity violation there
    /// means a concurrent writer won a race the locks should have prevented, so
    /// the whole operation is reported as retryable.
    pub fn commit_db_error(error: DbErr) -> Self {
        match error.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(detail))
            | Some(SqlErr::ForeignKeyConstraintViolation(detail)) => {
                ServiceError::Transient(format!("integrity violation: {detail}"))
            }
            _ => ServiceError::DatabaseError(error),
        }
    }

    /// Infrastructure failures eligible for transport-level retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::DatabaseError(err) => db_err_is_transient(err),
            _ => false,
        }
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(err) if db_err_is_transient(err) => StatusCode::SERVICE_UNAVAILABLE,
            Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::BadRequest(_) | Self::MissingIdempotencyKey => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized(_) | Self::InvalidSignature => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_)
            | Self::InsufficientStock(_)
            | Self::ReservationMismatch(_)
            | Self::RequestInProgress
            | Self::IdempotencyKeyReused(_) => StatusCode::CONFLICT,
            Self::CheckoutExpired(_) => StatusCode::GONE,
            Self::Transient(_) | Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            Self::QueueError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database_error",
            Self::NotFound(_) => "not_found",
            Self::ValidationError(_) => "validation_error",
            Self::BadRequest(_) => "bad_request",
            Self::MissingIdempotencyKey => "missing_idempotency_key",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidSignature => "invalid_signature",
            Self::Conflict(_) => "conflict",
            Self::InsufficientStock(_) => "insufficient_stock",
            Self::ReservationMismatch(_) => "reservation_mismatch",
            Self::CheckoutExpired(_) => "checkout_expired",
            Self::RequestInProgress => "request_in_progress",
            Self::IdempotencyKeyReused(_) => "idempotency_key_reused",
            Self::Transient(_) | Self::ServiceUnavailable(_) => "service_unavailable",
            Self::ExternalServiceError(_) => "external_service_error",
            Self::QueueError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => "internal_error",
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) if self.is_transient() => {
                "Service temporarily unavailable".to_string()
            }
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::Transient(_) => "Service temporarily unavailable".to_string(),
            Self::QueueError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            message: self.response_message(),
            request_id: current_request_id(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }

        let envelope = crate::ApiResponse::<()>::error(self.to_body());
        let mut response = (status, Json(envelope)).into_response();
        if matches!(self, Self::RequestInProgress) {
            response
                .headers_mut()
                .insert(axum::http::header::RETRY_AFTER, axum::http::HeaderValue::from_static("1"));
        }
        response
    }
}
