//! Gmail API error shape and classification
//!
//! Google APIs report failures as JSON bodies like
//! `{"error": {"code": 404, "message": "...", "errors": [{"reason": "notFound"}]}}`.
//! [`ApiError`] captures the parts that matter and [`classify`] maps them to an
//! [`ErrorKind`] without needing a live provider.

use serde::Deserialize;

/// Structured upstream API error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("gmail api returned {status}: {message}")]
pub struct ApiError {
    /// HTTP status code
    pub status: u16,
    /// First machine-readable reason (e.g. "notFound", "rateLimitExceeded")
    pub reason: String,
    /// Human readable message
    pub message: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: String,
}

impl ApiError {
    pub fn new(status: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Build from a response status and (possibly non-JSON) body
    pub fn from_body(status: u16, body: &[u8]) -> Self {
        match serde_json::from_slice::<ErrorEnvelope>(body) {
            Ok(envelope) => {
                let reason = envelope
                    .error
                    .errors
                    .into_iter()
                    .map(|e| e.reason)
                    .find(|r| !r.is_empty())
                    .unwrap_or(envelope.error.status);
                Self::new(status, reason, envelope.error.message)
            }
            Err(_) => Self::new(
                status,
                "",
                String::from_utf8_lossy(body).trim().chars().take(512).collect::<String>(),
            ),
        }
    }
}

/// Provider conditions the relay reacts to differently
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The history cursor is too old or otherwise unusable
    StaleHistory,
    NotFound,
    /// A label with the same name already exists
    DuplicateLabel,
    RateLimited,
    Unauthorized,
    Forbidden,
    Server,
    Other,
}

/// Classify an upstream error by status code, reason and message
pub fn classify(err: &ApiError) -> ErrorKind {
    let reason = err.reason.to_ascii_lowercase();
    let message = err.message.to_ascii_lowercase();

    match err.status {
        400 if message.contains("historyid") => ErrorKind::StaleHistory,
        404 if message.contains("historyid") => ErrorKind::StaleHistory,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::DuplicateLabel,
        400 if message.contains("label name exists") || message.contains("conflicts with") => {
            ErrorKind::DuplicateLabel
        }
        429 => ErrorKind::RateLimited,
        403 if reason.contains("ratelimitexceeded") || reason.contains("userratelimitexceeded") => {
            ErrorKind::RateLimited
        }
        401 => ErrorKind::Unauthorized,
        403 => ErrorKind::Forbidden,
        500..=599 => ErrorKind::Server,
        _ => ErrorKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_google_error_body() {
        let body = br#"{"error":{"code":404,"message":"Requested entity was not found.","errors":[{"message":"Requested entity was not found.","domain":"global","reason":"notFound"}],"status":"NOT_FOUND"}}"#;
        let err = ApiError::from_body(404, body);
        assert_eq!(err.status, 404);
        assert_eq!(err.reason, "notFound");
        assert_eq!(err.message, "Requested entity was not found.");
    }

    #[test]
    fn test_from_body_falls_back_to_status_and_text() {
        let err = ApiError::from_body(400, br#"{"error":{"message":"bad","status":"INVALID_ARGUMENT"}}"#);
        assert_eq!(err.reason, "INVALID_ARGUMENT");

        let err = ApiError::from_body(502, b"<html>Bad Gateway</html>\n");
        assert_eq!(err.reason, "");
        assert_eq!(err.message, "<html>Bad Gateway</html>");
    }

    #[test]
    fn test_classify_table() {
        let cases = [
            (ApiError::new(404, "notFound", "Requested entity was not found."), ErrorKind::NotFound),
            (ApiError::new(400, "invalidArgument", "Invalid startHistoryId"), ErrorKind::StaleHistory),
            (ApiError::new(404, "notFound", "startHistoryId is too old"), ErrorKind::StaleHistory),
            (ApiError::new(409, "alreadyExists", "Label name exists or conflicts"), ErrorKind::DuplicateLabel),
            (ApiError::new(400, "failedPrecondition", "Label name exists or conflicts"), ErrorKind::DuplicateLabel),
            (ApiError::new(429, "rateLimitExceeded", "slow down"), ErrorKind::RateLimited),
            (ApiError::new(403, "userRateLimitExceeded", "quota"), ErrorKind::RateLimited),
            (ApiError::new(403, "insufficientPermissions", "no"), ErrorKind::Forbidden),
            (ApiError::new(401, "authError", "Invalid Credentials"), ErrorKind::Unauthorized),
            (ApiError::new(503, "backendError", "try later"), ErrorKind::Server),
            (ApiError::new(418, "", "teapot"), ErrorKind::Other),
        ];

        for (err, expected) in cases {
            assert_eq!(classify(&err), expected, "{err:?}");
        }
    }
}
