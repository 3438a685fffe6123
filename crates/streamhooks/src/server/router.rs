//! Axum router construction for the business routes.

use axum::{routing::get, Router};

use super::{handlers, state::AppState};

/// Paths registered by [`build`].
pub const PATHS: &[&str] = &["/", "/success", "/subscriptions", "/messages", "/health"];

/// Build the business [`Router`]. Middleware is applied once to the merged
/// application router by [`super::middleware::apply`].
pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/success", get(handlers::success))
        .route("/subscriptions", get(handlers::subscriptions))
        .route("/messages", get(handlers::messages))
        .route("/health", get(handlers::health))
        .fallback(handlers::not_found)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{ActivationStatus, LifecyclePhase};
    use crate::server::middleware;
    use crate::webhooks::MockSubscriptionManager;
    use axum::{body::Body, http::Request};
    use chrono::Utc;
    use common::protocol::{SubscriptionView, WebhookMessage};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn app() -> (Router, AppState) {
        let mut manager = MockSubscriptionManager::new();
        manager.expect_subscriptions().returning(|| {
            vec![SubscriptionView {
                id: "sub-1".into(),
                topic: "topic-1".into(),
                verified: true,
                expires_at: None,
            }]
        });
        let state = AppState::for_tests(
            Arc::new(manager),
            LifecyclePhase::Listening,
            ActivationStatus::Pending,
        )
        .await;
        (middleware::apply(build(state.clone())), state)
    }

    async fn body_of(app: Router, uri: &str) -> (u16, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status().as_u16();
        let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or_default())
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let (app, _) = app().await;
        let (status, body) = body_of(app, "/unknown").await;
        assert_eq!(status, 404);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn health_route_exists() {
        let (app, _) = app().await;
        let (status, _) = body_of(app, "/health").await;
        // 503 because the test state is still listening.
        assert_eq!(status, 503);
    }

    #[tokio::test]
    async fn subscriptions_route_lists_manager_view() {
        let (app, _) = app().await;
        let (status, body) = body_of(app, "/subscriptions").await;
        assert_eq!(status, 200);
        assert_eq!(body[0]["id"], "sub-1");
    }

    #[tokio::test]
    async fn messages_route_returns_recorded_messages() {
        let (app, state) = app().await;
        state.messages.record(WebhookMessage {
            subscription_id: "sub-1".into(),
            topic: "topic-1".into(),
            payload: serde_json::json!({ "event": "online" }),
            received_at: Utc::now(),
        });
        let (status, body) = body_of(app, "/messages").await;
        assert_eq!(status, 200);
        assert_eq!(body[0]["payload"]["event"], "online");
    }
}
