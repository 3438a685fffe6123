//! Axum request handlers for the business routes.

use async_trait::async_trait;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use common::protocol::{
    ErrorResponse, HealthResponse, SessionStatus, SubscriptionView, TokenPair, WebhookMessage,
};
use common::ServiceError;
use tracing::warn;

use super::state::AppState;
use crate::auth::AuthorizedHandler;
use crate::lifecycle::{ActivationStatus, LifecyclePhase};
use crate::persistence::session::SessionError;
use crate::persistence::SessionStore;

/// Render `err` as its status code with an [`ErrorResponse`] body.
pub fn error_response(err: ServiceError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorResponse::from(&err))).into_response()
}

/// `GET /`: landing text.
pub async fn index() -> &'static str {
    "streamhooks: visit /auth to authorize, /subscriptions for tracked topics\n"
}

/// `GET /success`: whether the caller's session carries tokens.
pub async fn success(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(cookie) = SessionStore::cookie_from_headers(&headers) else {
        return Json(SessionStatus { authorized: false }).into_response();
    };
    match state.sessions.load(&cookie).await {
        Ok(tokens) => Json(SessionStatus {
            authorized: tokens.is_some(),
        })
        .into_response(),
        Err(SessionError::BadSignature) => {
            Json(SessionStatus { authorized: false }).into_response()
        }
        Err(e) => {
            warn!(error = %e, "session lookup failed");
            error_response(ServiceError::Internal("session lookup failed".into()))
        }
    }
}

/// `GET /subscriptions`: the manager's tracked subscriptions.
pub async fn subscriptions(State(state): State<AppState>) -> Json<Vec<SubscriptionView>> {
    Json(state.manager.subscriptions().await)
}

/// `GET /messages`: the most recent webhook messages, oldest first.
pub async fn messages(State(state): State<AppState>) -> Json<Vec<WebhookMessage>> {
    Json(state.messages.recent())
}

/// `GET /health`: lifecycle phase and activation outcome.
///
/// Returns `200 OK` once the process is active and subscriptions were
/// activated; `503 Service Unavailable` otherwise.
pub async fn health(State(state): State<AppState>) -> Response {
    let phase = *state.phase.borrow();
    let activation = state.activation.borrow().clone();

    let ready = phase == LifecyclePhase::Active && activation == ActivationStatus::Active;
    let (status_code, status_str) = if ready {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let body = HealthResponse {
        status: status_str.into(),
        phase: phase.to_string(),
        subscriptions: activation.label().into(),
    };
    (status_code, Json(body)).into_response()
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}

/// Completed authorizations open a session and land on `/success`.
#[async_trait]
impl AuthorizedHandler for SessionStore {
    async fn authorized(&self, tokens: TokenPair) -> Response {
        match self.create(&tokens).await {
            Ok(cookie) => (
                StatusCode::TEMPORARY_REDIRECT,
                [
                    (header::LOCATION, "/success".to_owned()),
                    (header::SET_COOKIE, SessionStore::set_cookie_header(&cookie)),
                ],
            )
                .into_response(),
            Err(e) => {
                warn!(error = %e, "failed to store session");
                error_response(ServiceError::Internal("session could not be stored".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhooks::MockSubscriptionManager;
    use axum::{body::Body, http::Request, routing::get, Router};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn state(phase: LifecyclePhase, activation: ActivationStatus) -> AppState {
        let mut manager = MockSubscriptionManager::new();
        manager.expect_subscriptions().returning(Vec::new);
        AppState::for_tests(Arc::new(manager), phase, activation).await
    }

    fn test_router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/success", get(success))
            .with_state(state)
    }

    async fn get_status(
        app: Router,
        uri: &str,
        cookie: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            req = req.header(header::COOKIE, cookie);
        }
        let resp = app.oneshot(req.body(Body::empty()).unwrap()).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 4096).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[test]
    fn error_response_uses_service_status() {
        let resp = error_response(ServiceError::Forbidden("nope".into()));
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn health_is_503_until_activated() {
        let app = test_router(state(LifecyclePhase::Active, ActivationStatus::Pending).await);
        let (status, body) = get_status(app, "/health", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["phase"], "active");
        assert_eq!(body["subscriptions"], "pending");
    }

    #[tokio::test]
    async fn health_is_200_when_active_and_activated() {
        let app = test_router(state(LifecyclePhase::Active, ActivationStatus::Active).await);
        let (status, body) = get_status(app, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn authorized_handler_sets_cookie_and_redirects() {
        let state = state(LifecyclePhase::Active, ActivationStatus::Active).await;
        let resp = state
            .sessions
            .authorized(TokenPair {
                access_token: "a".into(),
                refresh_token: "r".into(),
            })
            .await;
        assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(resp.headers()[header::LOCATION], "/success");
        let set_cookie = resp.headers()[header::SET_COOKIE].to_str().unwrap().to_owned();
        let cookie = set_cookie.split(';').next().unwrap().to_owned();

        let (status, body) = get_status(test_router(state), "/success", Some(&cookie)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["authorized"], true);
    }

    #[tokio::test]
    async fn forged_cookie_is_not_authorized() {
        let app = test_router(state(LifecyclePhase::Active, ActivationStatus::Active).await);
        let (status, body) = get_status(app, "/success", Some("sid=abc.Zm9yZ2Vk")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["authorized"], false);
    }
}
