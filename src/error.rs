use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use http_body_util::Full;
use serde_json::json;
use thiserror::Error;

/// Unified error type for the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    // Target errors
    #[error("Invalid target URL: {0}")]
    InvalidTargetUrl(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    // Upstream errors
    #[error("Target not found: {0}")]
    TargetNotFound(String),

    #[error("Target refused the connection: {0}")]
    TargetConnectionRefused(String),

    #[error("Upstream request timed out")]
    RequestTimeout,

    #[error("Upstream gateway error (status {status}): {message}")]
    UpstreamGatewayError { status: u16, message: String },

    // Pipeline errors
    #[error("Handler '{stage}' failed: {message}")]
    HandlerFailure { stage: &'static str, message: String },

    // Rate limiting
    #[error("Rate limit exceeded for {client_ip}")]
    RateLimitExceeded { client_ip: String },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    UnknownInternal(String),
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            GatewayError::InvalidTargetUrl(_) => StatusCode::BAD_REQUEST,

            // 403 Forbidden
            GatewayError::AccessDenied(_) => StatusCode::FORBIDDEN,

            // 429 Too Many Requests
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 502 Bad Gateway
            GatewayError::TargetNotFound(_) | GatewayError::TargetConnectionRefused(_) => {
                StatusCode::BAD_GATEWAY
            }

            // 502 / 503 depending on what the upstream said
            GatewayError::UpstreamGatewayError { status, .. } => match status {
                503 | 520..=530 => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            },

            // 504 Gateway Timeout
            GatewayError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            GatewayError::HandlerFailure { .. }
            | GatewayError::InvalidConfig(_)
            | GatewayError::Io(_)
            | GatewayError::UnknownInternal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable snake_case tag for logs and metric tallies
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidTargetUrl(_) => "invalid_target_url",
            GatewayError::AccessDenied(_) => "access_denied",
            GatewayError::TargetNotFound(_) => "target_not_found",
            GatewayError::TargetConnectionRefused(_) => "target_connection_refused",
            GatewayError::RequestTimeout => "request_timeout",
            GatewayError::UpstreamGatewayError { .. } => "upstream_gateway_error",
            GatewayError::HandlerFailure { .. } => "handler_failure",
            GatewayError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            GatewayError::InvalidConfig(_) => "invalid_config",
            GatewayError::Io(_) => "io",
            GatewayError::UnknownInternal(_) => "unknown_internal",
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// JSON body shared by the gateway front-end and the status API
    pub fn body(&self, request_id: Option<&str>) -> serde_json::Value {
        let status = self.status_code();
        json!({
            "status": status.as_u16(),
            "error": self.kind(),
            "message": self.to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "request_id": request_id,
        })
    }

    /// Render the error as a plain hyper response for the gateway front-end
    pub fn to_http_response(&self, request_id: &str) -> hyper::Response<Full<Bytes>> {
        let body = self.body(Some(request_id)).to_string();
        let mut response = hyper::Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = self.status_code();
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("application/json"),
        );
        response.headers_mut().insert(
            hyper::header::CACHE_CONTROL,
            hyper::header::HeaderValue::from_static("no-store"),
        );
        response
    }
}

// Implement IntoResponse for API error responses
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(self.body(None))).into_response()
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for GatewayError {
    fn from(err: url::ParseError) -> Self {
        GatewayError::InvalidTargetUrl(err.to_string())
    }
}

impl From<regex::Error> for GatewayError {
    fn from(err: regex::Error) -> Self {
        GatewayError::InvalidConfig(format!("invalid pattern: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            GatewayError::InvalidTargetUrl("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::AccessDenied("blocked".to_string()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::TargetNotFound("example.invalid".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::TargetConnectionRefused("example.com".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::HandlerFailure {
                stage: "decompress",
                message: "boom".to_string()
            }
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::UnknownInternal("?".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_upstream_gateway_error_status() {
        let err = |status| GatewayError::UpstreamGatewayError {
            status,
            message: String::new(),
        };
        assert_eq!(err(500).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(err(503).status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err(522).status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_error_client_server_helpers() {
        assert!(GatewayError::InvalidTargetUrl("bad".to_string()).is_client_error());
        assert!(!GatewayError::InvalidTargetUrl("bad".to_string()).is_server_error());

        assert!(GatewayError::RequestTimeout.is_server_error());
        assert!(!GatewayError::RequestTimeout.is_client_error());
    }

    #[test]
    fn test_error_body_carries_stage_and_request_id() {
        let err = GatewayError::HandlerFailure {
            stage: "content_rewrite",
            message: "bad utf-8".to_string(),
        };
        let body = err.body(Some("req-1"));
        assert_eq!(body["status"], 500);
        assert_eq!(body["error"], "handler_failure");
        assert_eq!(body["request_id"], "req-1");
        assert!(body["message"].as_str().unwrap().contains("content_rewrite"));
        assert!(body["timestamp"].is_string());
    }

    #[test]
    fn test_to_http_response() {
        let response = GatewayError::AccessDenied("/admin".to_string()).to_http_response("abc");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }
}
