//! Response envelope for everything the balancer answers itself.
//!
//! # Responsibilities
//! - Uniform JSON body for errors and admin replies: `{success, code, message, data?}`
//! - Map internal outcomes to status codes without leaking downstream error text
//!
//! # Design Decisions
//! - Proxied responses are never wrapped; only locally generated ones are

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// JSON envelope returned for non-proxied responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiResponse {
    pub success: bool,
    pub code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ApiResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            code: StatusCode::OK.as_u16(),
            message: message.into(),
            data: None,
        }
    }

    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code: status.as_u16(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, Json(self)).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }
}

/// Shorthand for an error envelope response.
pub fn error_response(status: StatusCode, message: &str) -> Response {
    ApiResponse::error(status, message).into_response()
}

pub mod messages {
    pub const NO_BACKENDS: &str = "no backends are reachable";
    pub const SERVICE_UNAVAILABLE: &str = "service unavailable";
    pub const PROXY_ERROR: &str = "proxy error";
    pub const TOO_MANY_REQUESTS: &str = "rate limit exceeded";
    pub const LIMITER_FAILED: &str = "rate limiter failed to process the request";
    pub const BODY_TOO_LARGE: &str = "request body too large";
    pub const MISSING_IP_OR_VALUE: &str = "missing 'ip' or 'value' parameter";
    pub const BAD_VALUE: &str = "invalid 'value' parameter";
    pub const UNKNOWN_CLIENT: &str = "no bucket exists for this client";
    pub const SET_RATE_FAILED: &str = "failed to set rate";
    pub const SET_MAX_FAILED: &str = "failed to set max tokens";
    pub const RATE_UPDATED: &str = "rate updated";
    pub const MAX_UPDATED: &str = "max tokens updated";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_is_omitted_when_absent() {
        let body = serde_json::to_value(ApiResponse::error(StatusCode::TOO_MANY_REQUESTS, "slow down")).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"success": false, "code": 429, "message": "slow down"})
        );
    }

    #[tokio::test]
    async fn envelope_sets_status_and_content_type() {
        let response = ApiResponse::ok("fine")
            .with_data(serde_json::json!({"rate": 3}))
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            HeaderValue::from_static("application/json")
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let decoded: ApiResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.data, Some(serde_json::json!({"rate": 3})));
    }
}
