//! Error types for the org API client.

use thiserror::Error;

/// Errors that can occur when talking to an org.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Record not found.
    #[error("record not found: {object}/{id}")]
    NotFound { object: String, id: String },

    /// Invalid response from server.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limited.
    #[error("rate limited{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited {
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// Server-side failure (5xx).
    #[error("server error ({status}): {body}")]
    Server { status: u16, body: String },

    /// Error reported by the API in its standard error body.
    #[error("API error: {code} - {message}")]
    Api { code: String, message: String },
}

impl ApiError {
    /// Error codes the API uses for conditions that clear up on their own.
    const TRANSIENT_CODES: &'static [&'static str] = &[
        "UNABLE_TO_LOCK_ROW",
        "REQUEST_LIMIT_EXCEEDED",
        "SERVER_UNAVAILABLE",
        "QUERY_TIMEOUT",
    ];

    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ApiError::RateLimited { .. } | ApiError::Server { .. } => true,
            ApiError::Api { code, .. } => Self::TRANSIENT_CODES.contains(&code.as_str()),
            _ => false,
        }
    }

    /// Whether the session token was rejected.
    pub fn is_expired_session(&self) -> bool {
        matches!(self, ApiError::Api { code, .. } if code == "INVALID_SESSION_ID")
    }
}
