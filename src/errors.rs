use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::messages::LocalizedText;
use crate::models::ride::RideStatus;

/// Main error type for the sparrow-dispatch service
#[derive(Debug)]
pub enum DispatchError {
    // Caller input
    ValidationFailed(Vec<ValidationError>),

    // Identity and permissions
    Unauthorized(String),
    Forbidden(String),

    // Lookups
    RideNotFound(String),
    DriverNotFound(String),

    // Lifecycle
    InvalidTransition { ride_id: String, current: RideStatus, attempted: RideStatus },
    AlreadyAccepted { ride_id: String },
    AlreadyRecorded { ride_id: String, field: String },
    DuplicateRide(String),

    // Dependencies
    RouteUnavailable(String),
    StoreUnavailable(String),
    StoreConflict(String),
    PublicationFailed(String),
    FcmDelivery(String),
    NetworkTimeout,
    NetworkConnection(String),
    HttpClient(String),

    // Serialization and parsing errors
    Serialization(String),

    // Configuration and setup errors
    InvalidConfiguration(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub message_ar: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::ValidationFailed(errors) => {
                write!(f, "Validation failed: {} errors", errors.len())
            }

            DispatchError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            DispatchError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),

            DispatchError::RideNotFound(id) => write!(f, "Ride not found: {}", id),
            DispatchError::DriverNotFound(id) => write!(f, "Driver not found: {}", id),

            DispatchError::InvalidTransition { ride_id, current, attempted } => write!(
                f,
                "Ride {} cannot move from {} to {}",
                ride_id, current, attempted
            ),
            DispatchError::AlreadyAccepted { ride_id } => {
                write!(f, "Ride {} was already accepted by another driver", ride_id)
            }
            DispatchError::AlreadyRecorded { ride_id, field } => {
                write!(f, "Ride {} already has a {}", ride_id, field)
            }
            DispatchError::DuplicateRide(id) => write!(f, "Ride already exists: {}", id),

            DispatchError::RouteUnavailable(msg) => write!(f, "Route service unavailable: {}", msg),
            DispatchError::StoreUnavailable(msg) => write!(f, "Ride store unavailable: {}", msg),
            DispatchError::StoreConflict(msg) => write!(f, "Ride store contention: {}", msg),
            DispatchError::PublicationFailed(msg) => write!(f, "Event publication failed: {}", msg),
            DispatchError::FcmDelivery(msg) => write!(f, "FCM delivery error: {}", msg),
            DispatchError::NetworkTimeout => write!(f, "Network request timed out"),
            DispatchError::NetworkConnection(msg) => write!(f, "Network connection error: {}", msg),
            DispatchError::HttpClient(msg) => write!(f, "HTTP client error: {}", msg),

            DispatchError::Serialization(msg) => write!(f, "Serialization error: {}", msg),

            DispatchError::InvalidConfiguration(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for DispatchError {}

impl DispatchError {
    /// Dependency failures the caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::RouteUnavailable(_)
                | DispatchError::StoreUnavailable(_)
                | DispatchError::StoreConflict(_)
                | DispatchError::NetworkTimeout
                | DispatchError::NetworkConnection(_)
                | DispatchError::HttpClient(_)
        )
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            DispatchError::ValidationFailed(_) => (StatusCode::BAD_REQUEST, "validation_failed"),
            DispatchError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            DispatchError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            DispatchError::RideNotFound(_) => (StatusCode::NOT_FOUND, "ride_not_found"),
            DispatchError::DriverNotFound(_) => (StatusCode::NOT_FOUND, "driver_not_found"),
            DispatchError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            DispatchError::AlreadyAccepted { .. } => (StatusCode::CONFLICT, "ride_already_accepted"),
            DispatchError::AlreadyRecorded { .. } => (StatusCode::CONFLICT, "already_recorded"),
            _ if self.is_retryable() => (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }

    /// Caller-facing text. Dependency and internal failures never leak detail.
    pub fn localized_message(&self) -> LocalizedText {
        match self {
            DispatchError::ValidationFailed(_) => LocalizedText::new(
                "Some fields are missing or invalid",
                "بعض الحقول مفقودة أو غير صالحة",
            ),
            DispatchError::Unauthorized(_) => LocalizedText::new(
                "Authentication is required",
                "يلزم تسجيل الدخول",
            ),
            DispatchError::Forbidden(_) => LocalizedText::new(
                "You are not allowed to perform this action on this ride",
                "غير مسموح لك بتنفيذ هذا الإجراء على هذه الرحلة",
            ),
            DispatchError::RideNotFound(_) => LocalizedText::new("Ride not found", "الرحلة غير موجودة"),
            DispatchError::DriverNotFound(_) => LocalizedText::new("Driver not found", "السائق غير موجود"),
            DispatchError::InvalidTransition { current, .. } => LocalizedText::new(
                format!("This action is not possible while the ride is {}", current),
                format!("لا يمكن تنفيذ هذا الإجراء والرحلة في حالة {}", current),
            ),
            DispatchError::AlreadyAccepted { .. } => LocalizedText::new(
                "This ride was already accepted by another driver",
                "تم قبول هذه الرحلة من قبل سائق آخر",
            ),
            DispatchError::AlreadyRecorded { field, .. } => LocalizedText::new(
                format!("A {} was already submitted for this ride", field),
                format!("تم إرسال {} لهذه الرحلة مسبقاً", field),
            ),
            _ if self.is_retryable() => LocalizedText::new(
                "The service is temporarily unavailable, please try again",
                "الخدمة غير متاحة مؤقتاً، يرجى المحاولة مرة أخرى",
            ),
            _ => LocalizedText::new(
                "Something went wrong, please try again later",
                "حدث خطأ ما، يرجى المحاولة لاحقاً",
            ),
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_code();
        let text = self.localized_message();

        let details = match &self {
            DispatchError::ValidationFailed(errors) => serde_json::to_value(errors).ok(),
            DispatchError::InvalidTransition { current, attempted, .. } => Some(serde_json::json!({
                "current_status": current,
                "attempted_status": attempted,
            })),
            DispatchError::AlreadyAccepted { ride_id } => Some(serde_json::json!({ "ride_id": ride_id })),
            _ => None,
        };

        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }

        let error_response = ErrorResponse {
            error: error_type.to_string(),
            message: text.en,
            message_ar: text.ar,
            retryable: self.is_retryable(),
            details,
        };

        (status, axum::Json(error_response)).into_response()
    }
}

// Convenience type alias for Results
pub type DispatchResult<T> = Result<T, DispatchError>;

impl From<redis::RedisError> for DispatchError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::TypeError => DispatchError::Serialization(err.to_string()),
            _ => DispatchError::StoreUnavailable(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DispatchError::NetworkTimeout
        } else if err.is_connect() {
            DispatchError::NetworkConnection(err.to_string())
        } else {
            DispatchError::HttpClient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Serialization(err.to_string())
    }
}

// Helper functions for creating common errors
impl DispatchError {
    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        DispatchError::ValidationFailed(vec![ValidationError {
            field: field.into(),
            message: message.into(),
        }])
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        DispatchError::Forbidden(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        DispatchError::Unauthorized(msg.into())
    }

    pub fn ride_not_found(ride_id: impl Into<String>) -> Self {
        DispatchError::RideNotFound(ride_id.into())
    }
}
