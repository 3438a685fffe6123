//! Request and response types exchanged between components.
//!
//! These types are serialised as JSON on the public HTTP routes and carried
//! on the subscription manager's event channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

/// Access/refresh token pair obtained from a successful end-user authorization.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPair {
    /// Bearer token presented to the platform API.
    pub access_token: String,
    /// Token used to obtain a new access token once the current one expires.
    pub refresh_token: String,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Tokens are credentials; keep them out of logs.
        f.write_str("TokenPair([REDACTED])")
    }
}

/// Response body for `GET /success`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStatus {
    /// Whether the request's session carries a stored token pair.
    pub authorized: bool,
}

// ---------------------------------------------------------------------------
// Webhooks
// ---------------------------------------------------------------------------

/// A notification delivered by the remote platform to a subscription callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookMessage {
    /// Local identifier of the subscription the message arrived on.
    pub subscription_id: String,
    /// Topic URL the subscription tracks.
    pub topic: String,
    /// Arbitrary JSON body sent by the platform.
    pub payload: serde_json::Value,
    /// Time the message was accepted by the callback route.
    pub received_at: DateTime<Utc>,
}

/// Public view of a tracked subscription, returned by `GET /subscriptions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionView {
    /// Local identifier (also the last callback path segment).
    pub id: String,
    /// Topic URL the subscription tracks.
    pub topic: String,
    /// Whether the platform has confirmed the subscription.
    pub verified: bool,
    /// Lease expiry, if the platform has confirmed a lease.
    pub expires_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"bad_request"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&crate::ServiceError> for ErrorResponse {
    fn from(err: &crate::ServiceError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall service status: `"ok"` or `"degraded"`.
    pub status: String,
    /// Current lifecycle phase name (e.g. `"active"`).
    pub phase: String,
    /// Activation hook outcome: `"pending"`, `"active"`, `"degraded"` or `"disabled"`.
    pub subscriptions: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn token_pair_debug_is_redacted() {
        let pair = TokenPair {
            access_token: "secret-access".into(),
            refresh_token: "secret-refresh".into(),
        };
        let rendered = format!("{pair:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn error_response_from_service_error() {
        let e = ErrorResponse::from(&crate::ServiceError::NotFound("sub-1".into()));
        assert_eq!(e.code, "not_found");
        assert!(e.message.contains("sub-1"));
    }

    #[test]
    fn webhook_message_keeps_payload() {
        let msg = WebhookMessage {
            subscription_id: "abc".into(),
            topic: "https://api.example/streams?user_id=1".into(),
            payload: json!({"data": [{"id": "42"}]}),
            received_at: Utc::now(),
        };
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(encoded["payload"]["data"][0]["id"], "42");
        assert_eq!(encoded["subscription_id"], "abc");
    }
}
