//! Hub requests sent to the platform on behalf of the subscription manager.

use async_trait::async_trait;
use serde::Serialize;

use crate::platform::PlatformError;

/// Requested hub action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HubMode {
    Subscribe,
    Unsubscribe,
}

/// Body of a hub subscribe/unsubscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HubRequest {
    #[serde(rename = "hub.callback")]
    pub callback: String,
    #[serde(rename = "hub.mode")]
    pub mode: HubMode,
    #[serde(rename = "hub.topic")]
    pub topic: String,
    #[serde(rename = "hub.lease_seconds")]
    pub lease_seconds: i64,
    #[serde(rename = "hub.secret")]
    pub secret: String,
}

/// Transport for hub requests. The caller supplies the bearer token so that
/// token refresh stays with the manager.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HubClient: Send + Sync {
    /// Send `request`; [`PlatformError::Unauthorized`] means the token was rejected.
    async fn send(&self, request: &HubRequest, token: &str) -> Result<(), PlatformError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_dotted_field_names() {
        let req = HubRequest {
            callback: "https://hooks.example.com/webhooks/abc".into(),
            mode: HubMode::Subscribe,
            topic: "https://api.example/streams?user_id=1".into(),
            lease_seconds: 600,
            secret: "s".into(),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["hub.mode"], "subscribe");
        assert_eq!(v["hub.lease_seconds"], 600);
        assert_eq!(v["hub.callback"], "https://hooks.example.com/webhooks/abc");
    }
}
