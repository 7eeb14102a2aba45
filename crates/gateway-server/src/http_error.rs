//! Typed-error-to-HTTP-response mapping (spec §7 ERROR HANDLING DESIGN).

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use gateway_core::error::{GatewayError, ProviderError, QueueError};
use serde_json::json;

pub struct ApiError {
    status: StatusCode,
    retry_after: Option<u64>,
    message: String,
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn invalid_model(model: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            retry_after: None,
            message: format!("model '{model}' is not supported"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            axum::Json(json!({ "error": { "message": self.message } })),
        )
            .into_response();

        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Provider(err) => err.into(),
            GatewayError::Queue(err) => err.into(),
            GatewayError::Kv(_) => ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                retry_after: None,
                message: "key-value store unavailable".into(),
            },
            GatewayError::Validation(message) => ApiError::validation(message),
            GatewayError::Config(message) => ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                retry_after: None,
                message,
            },
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Full(name) => ApiError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                retry_after: Some(5),
                message: format!("queue '{name}' is full"),
            },
            QueueError::NotFound(id) => ApiError {
                status: StatusCode::NOT_FOUND,
                retry_after: None,
                message: format!("item '{id}' not found"),
            },
            QueueError::Kv(_) | QueueError::Serialization(_) => ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                retry_after: None,
                message: "queue operation failed".into(),
            },
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        let status = match &err {
            ProviderError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProviderError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProviderError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProviderError::Auth { .. } => StatusCode::UNAUTHORIZED,
            ProviderError::NotFound { .. } => StatusCode::NOT_FOUND,
            ProviderError::Generic { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let retry_after = err.retry_after();
        ApiError {
            status,
            retry_after,
            message: err.message().to_string(),
        }
    }
}
