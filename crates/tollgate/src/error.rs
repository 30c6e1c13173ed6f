use actix_web::http::header;
use actix_web::{HttpResponse, ResponseError};
use std::fmt;

/// Errors surfaced by the dispatcher. Authentication failures never appear
/// here: the authenticator answers those with a 402 challenge directly.
#[derive(Debug)]
pub enum ProxyError {
    /// No configured service or local handler matched the request.
    NoRoute,
    /// The upstream could not be reached or answered with a transport error.
    Backend(String),
    /// The upstream did not answer within the per-service timeout.
    BackendTimeout,
    /// A required component (challenger, secret store) is down.
    Unavailable(String),
    /// Anything else; logged, never echoed to the client.
    Internal(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::NoRoute => write!(f, "no matching service"),
            ProxyError::Backend(msg) => write!(f, "backend error: {msg}"),
            ProxyError::BackendTimeout => write!(f, "backend timed out"),
            ProxyError::Unavailable(msg) => write!(f, "service unavailable: {msg}"),
            ProxyError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl ResponseError for ProxyError {
    fn error_response(&self) -> HttpResponse {
        match self {
            ProxyError::NoRoute => HttpResponse::NotFound().json(serde_json::json!({
                "error": "not_found",
                "message": "no service matches this request"
            })),
            ProxyError::Backend(msg) => {
                tracing::error!("backend error: {msg}");
                HttpResponse::BadGateway().json(serde_json::json!({
                    "error": "bad_gateway",
                    "message": "failed to reach upstream service"
                }))
            }
            ProxyError::BackendTimeout => HttpResponse::GatewayTimeout().json(
                serde_json::json!({
                    "error": "gateway_timeout",
                    "message": "upstream service did not respond in time"
                }),
            ),
            ProxyError::Unavailable(msg) => {
                tracing::warn!("service unavailable: {msg}");
                HttpResponse::ServiceUnavailable()
                    .insert_header((header::RETRY_AFTER, "30"))
                    .json(serde_json::json!({
                        "error": "service_unavailable",
                        "message": "temporarily unable to serve this request"
                    }))
            }
            ProxyError::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                HttpResponse::InternalServerError().json(serde_json::json!({
                    "error": "internal_error",
                    "message": "an internal error occurred"
                }))
            }
        }
    }
}
