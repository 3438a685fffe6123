//! End-user authorization: the `/auth` redirect and the code callback.
//!
//! The callback route is the path of the configured redirect URI. A valid
//! callback exchanges the authorization code and hands the resulting
//! [`TokenPair`] to an [`AuthorizedHandler`], whose response is returned to
//! the browser unchanged.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use common::protocol::TokenPair;
use common::ServiceError;
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::Config;
use crate::platform::{PlatformClient, PlatformError};
use crate::server::handlers::error_response;

/// Permission scopes requested from every end user.
pub const SCOPES: [&str; 3] = [
    "channel:read:subscriptions",
    "user:read:email",
    "moderation:read",
];

/// Outstanding `state` values remembered between redirect and callback.
const PENDING_STATES: usize = 256;

/// Parameters of the authorization redirect.
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub authorize_url: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    /// Ask the platform to re-prompt users who already authorized the app.
    pub force_verify: bool,
}

impl OAuthSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            authorize_url: format!("{}/authorize", cfg.oauth_base_url.trim_end_matches('/')),
            client_id: cfg.client_id.clone(),
            redirect_uri: cfg.redirect_uri.clone(),
            scopes: SCOPES.iter().map(|s| (*s).to_owned()).collect(),
            force_verify: true,
        }
    }

    fn authorize_location(&self, state: &str) -> Result<Url, url::ParseError> {
        let scope = self.scopes.join(" ");
        let mut params = vec![
            ("client_id", self.client_id.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("state", state),
        ];
        if self.force_verify {
            params.push(("force_verify", "true"));
        }
        Url::parse_with_params(&self.authorize_url, &params)
    }
}

/// Exchanges an authorization code for tokens.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CodeExchange: Send + Sync {
    async fn exchange(&self, code: &str, redirect_uri: &str) -> Result<TokenPair, PlatformError>;
}

#[async_trait]
impl CodeExchange for PlatformClient {
    async fn exchange(&self, code: &str, redirect_uri: &str) -> Result<TokenPair, PlatformError> {
        self.exchange_code(code, redirect_uri).await
    }
}

/// Receives the tokens of a completed authorization.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthorizedHandler: Send + Sync {
    async fn authorized(&self, tokens: TokenPair) -> Response;
}

#[derive(Clone)]
struct AuthState {
    settings: Arc<OAuthSettings>,
    exchange: Arc<dyn CodeExchange>,
    handler: Arc<dyn AuthorizedHandler>,
    pending: Arc<Mutex<VecDeque<String>>>,
}

impl AuthState {
    fn remember(&self, state: String) {
        if let Ok(mut pending) = self.pending.lock() {
            if pending.len() == PENDING_STATES {
                pending.pop_front();
            }
            pending.push_back(state);
        }
    }

    /// Remove `state` if it was issued; each value is accepted once.
    fn take(&self, state: &str) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        match pending.iter().position(|s| s == state) {
            Some(index) => {
                pending.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Path that starts the authorization flow.
pub const AUTHORIZE_PATH: &str = "/auth";

/// Build the authorization routes: `GET /auth` and `GET {callback_path}`.
pub fn routes(
    settings: OAuthSettings,
    callback_path: &str,
    exchange: Arc<dyn CodeExchange>,
    handler: Arc<dyn AuthorizedHandler>,
) -> Router {
    let state = AuthState {
        settings: Arc::new(settings),
        exchange,
        handler,
        pending: Arc::new(Mutex::new(VecDeque::with_capacity(PENDING_STATES))),
    };
    Router::new()
        .route(AUTHORIZE_PATH, get(authorize))
        .route(callback_path, get(callback))
        .with_state(state)
}

async fn authorize(State(auth): State<AuthState>) -> Response {
    let state = Uuid::new_v4().simple().to_string();
    match auth.settings.authorize_location(&state) {
        Ok(location) => {
            auth.remember(state);
            (
                StatusCode::FOUND,
                [(header::LOCATION, location.to_string())],
            )
                .into_response()
        }
        Err(e) => error_response(ServiceError::Internal(format!("authorize URL: {e}"))),
    }
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

async fn callback(State(auth): State<AuthState>, Query(params): Query<CallbackParams>) -> Response {
    let Some(state) = params.state.as_deref().filter(|s| auth.take(s)) else {
        return error_response(ServiceError::BadRequest("unknown or missing state".into()));
    };
    if let Some(error) = params.error {
        let description = params.error_description.unwrap_or_default();
        info!(error = %error, "end user declined authorization");
        return error_response(ServiceError::Forbidden(format!("{error}: {description}")));
    }
    let Some(code) = params.code else {
        return error_response(ServiceError::BadRequest("missing code".into()));
    };

    match auth.exchange.exchange(&code, &auth.settings.redirect_uri).await {
        Ok(tokens) => {
            info!(state, "authorization completed");
            auth.handler.authorized(tokens).await
        }
        Err(e) => {
            warn!(error = %e, "authorization code exchange failed");
            error_response(ServiceError::Unavailable("token exchange failed".into()))
        }
    }
}
