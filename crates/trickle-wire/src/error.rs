//! Error types for trickle-wire

use thiserror::Error;

/// Result type alias using trickle-wire Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while opening or reading a completion stream
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed (connect, timeout, body read)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The endpoint rejected the request (4xx other than 429)
    #[error("Request rejected ({status}): {message}")]
    ClientRequest { status: u16, message: String },

    /// The stream failed after or instead of delivering text
    #[error("Transport error: {message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },

    /// Stream was aborted
    #[error("Request aborted")]
    Aborted,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create a transport error without an HTTP status
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            status: None,
            message: message.into(),
        }
    }

    /// Classify a non-2xx response.
    ///
    /// Statuses in `[400, 500)` other than 429 are client errors; everything
    /// else (5xx, 429, oddities) is a transport error.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = extract_error_message(status, body);
        if is_client_status(status) {
            Self::ClientRequest { status, message }
        } else {
            Self::Transport {
                status: Some(status),
                message,
            }
        }
    }

    /// HTTP status attached to this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::ClientRequest { status, .. } => Some(*status),
            Error::Transport { status, .. } => *status,
            Error::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether the request was rejected before any text could stream
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::ClientRequest { .. })
    }

    /// Check if a caller-driven retry could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Http(_) | Error::Transport { .. })
    }
}

/// Whether a status is a non-retryable client error (4xx except 429)
pub fn is_client_status(status: u16) -> bool {
    (400..500).contains(&status) && status != 429
}

/// Pull a human-readable message out of an error body.
///
/// Understands `{"error": {"message": ..}}`, `{"error": ".."}`,
/// `{"detail": ".."}`, `{"detail": [{"msg": ..}]}` and `{"message": ".."}`;
/// otherwise the raw body, or the canonical reason phrase when the body is empty.
pub fn extract_error_message(status: u16, body: &str) -> String {
    let body = body.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let candidates = [
            value.pointer("/error/message"),
            value.get("error"),
            value.get("detail"),
            value.pointer("/detail/0/msg"),
            value.get("message"),
        ];
        if let Some(message) = candidates
            .into_iter()
            .flatten()
            .find_map(|v| v.as_str())
        {
            return message.to_string();
        }
    }

    if !body.is_empty() {
        return body.to_string();
    }

    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_client_errors() {
        let e = Error::from_status(400, r#"{"error":{"message":"unknown model"}}"#);
        assert!(e.is_client_error());
        assert_eq!(e.status(), Some(400));
        assert_eq!(e.to_string(), "Request rejected (400): unknown model");
        assert!(!e.is_retryable());

        assert!(Error::from_status(401, "").is_client_error());
        assert!(Error::from_status(499, "").is_client_error());
    }

    #[test]
    fn test_from_status_rate_limit_is_transport() {
        let e = Error::from_status(429, "slow down");
        assert!(!e.is_client_error());
        assert!(e.is_retryable());
        assert_eq!(e.status(), Some(429));
    }

    #[test]
    fn test_from_status_server_error_is_transport() {
        let e = Error::from_status(503, "");
        assert!(matches!(
            e,
            Error::Transport {
                status: Some(503),
                ..
            }
        ));
        assert!(e.is_retryable());
    }

    #[test]
    fn test_extract_message_shapes() {
        assert_eq!(extract_error_message(400, r#"{"error":"bad input"}"#), "bad input");
        assert_eq!(extract_error_message(422, r#"{"detail":"missing field"}"#), "missing field");
        assert_eq!(
            extract_error_message(422, r#"{"detail":[{"loc":["body"],"msg":"field required"}]}"#),
            "field required"
        );
        assert_eq!(extract_error_message(404, r#"{"message":"no such conversation"}"#), "no such conversation");
    }

    #[test]
    fn test_extract_message_fallbacks() {
        assert_eq!(extract_error_message(400, "  plain text  "), "plain text");
        assert_eq!(extract_error_message(404, ""), "Not Found");
        assert_eq!(extract_error_message(400, r#"{"code":7}"#), r#"{"code":7}"#);
    }

    #[test]
    fn test_not_retryable_local_errors() {
        assert!(!Error::Aborted.is_retryable());
        assert!(!Error::InvalidConfig("x".into()).is_retryable());
        assert_eq!(Error::Aborted.status(), None);
    }
}
