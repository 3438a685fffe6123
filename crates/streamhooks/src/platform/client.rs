//! [`PlatformClient`]: `reqwest`-based client with a cached app access token.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use common::protocol::TokenPair;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use super::{PlatformError, TokenSource};
use crate::config::Config;
use crate::webhooks::hub::{HubClient, HubRequest};

/// Per-request timeout for platform calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamsResponse {
    data: Vec<Stream>,
}

#[derive(Debug, Deserialize)]
struct Stream {
    user_id: String,
}

/// Client for the platform's OAuth2 and REST APIs.
///
/// Cheap to clone; clones share the HTTP connection pool and the cached app
/// token.
#[derive(Clone)]
pub struct PlatformClient {
    http: reqwest::Client,
    oauth_base: Arc<str>,
    api_base: Arc<str>,
    client_id: Arc<str>,
    client_secret: Arc<str>,
    app_token: Arc<ArcSwapOption<String>>,
}

impl std::fmt::Debug for PlatformClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformClient")
            .field("oauth_base", &self.oauth_base)
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl PlatformClient {
    /// Build a client from the service configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be constructed.
    pub fn new(cfg: &Config) -> Result<Self, PlatformError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("streamhooks/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            oauth_base: Arc::from(cfg.oauth_base_url.trim_end_matches('/')),
            api_base: Arc::from(cfg.api_base_url.trim_end_matches('/')),
            client_id: Arc::from(cfg.client_id.as_str()),
            client_secret: Arc::from(cfg.client_secret.as_str()),
            app_token: Arc::new(ArcSwapOption::empty()),
        })
    }

    /// Topic URL for a channel's stream-change notifications.
    pub fn stream_topic(&self, user_id: &str) -> String {
        format!("{}/streams?user_id={user_id}", self.api_base)
    }

    /// Exchange an authorization code for an access/refresh token pair.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenPair, PlatformError> {
        let resp = self
            .http
            .post(format!("{}/token", self.oauth_base))
            .form(&[
                ("client_id", &*self.client_id),
                ("client_secret", &*self.client_secret),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await?;
        let body: TokenResponse = check(resp).await?.json().await?;
        Ok(TokenPair {
            access_token: body.access_token,
            refresh_token: body.refresh_token.unwrap_or_default(),
        })
    }

    /// User ids of the `count` most-watched live channels.
    pub async fn top_streams(&self, count: usize) -> Result<Vec<String>, PlatformError> {
        let url = format!("{}/streams", self.api_base);
        let first = count.min(100).to_string();
        let resp = self
            .send_authorized(|token| {
                self.http
                    .get(&url)
                    .query(&[("first", first.as_str())])
                    .header("Client-Id", &*self.client_id)
                    .bearer_auth(token)
            })
            .await?;
        let body: StreamsResponse = check(resp).await?.json().await?;
        Ok(body.data.into_iter().map(|s| s.user_id).collect())
    }

    async fn fetch_app_token(&self) -> Result<String, PlatformError> {
        let resp = self
            .http
            .post(format!("{}/token", self.oauth_base))
            .form(&[
                ("client_id", &*self.client_id),
                ("client_secret", &*self.client_secret),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;
        let body: TokenResponse = check(resp).await?.json().await?;
        info!("app access token obtained");
        self.app_token
            .store(Some(Arc::new(body.access_token.clone())));
        Ok(body.access_token)
    }

    /// Send a bearer-authenticated request, refreshing the token once on `401`.
    async fn send_authorized<F>(&self, build: F) -> Result<Response, PlatformError>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = self.token().await?;
        let resp = build(&token).send().await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }
        debug!("app token rejected; refreshing");
        let token = self.refresh().await?;
        Ok(build(&token).send().await?)
    }
}

#[async_trait]
impl TokenSource for PlatformClient {
    async fn token(&self) -> Result<String, PlatformError> {
        if let Some(token) = self.app_token.load_full() {
            return Ok(token.as_ref().clone());
        }
        self.fetch_app_token().await
    }

    async fn refresh(&self) -> Result<String, PlatformError> {
        self.app_token.store(None);
        self.fetch_app_token().await
    }
}

#[async_trait]
impl HubClient for PlatformClient {
    async fn send(&self, request: &HubRequest, token: &str) -> Result<(), PlatformError> {
        let resp = self
            .http
            .post(format!("{}/webhooks/hub", self.api_base))
            .header("Client-Id", &*self.client_id)
            .bearer_auth(token)
            .json(request)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }
}

/// Map non-2xx answers to [`PlatformError`].
async fn check(resp: Response) -> Result<Response, PlatformError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(PlatformError::Unauthorized);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(PlatformError::Status {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use axum::{
        extract::State,
        http::{HeaderMap, StatusCode as AxumStatus},
        routing::{get, post},
        Json, Router,
    };
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Counters {
        tokens: Arc<AtomicUsize>,
    }

    /// Spawn a fake platform: `/oauth2/token` issues `token-N`, `/helix/streams`
    /// accepts only the latest token.
    async fn fake_platform() -> (String, Counters) {
        async fn token(State(c): State<Counters>) -> Json<Value> {
            let n = c.tokens.fetch_add(1, Ordering::SeqCst) + 1;
            Json(json!({ "access_token": format!("token-{n}"), "refresh_token": "r" }))
        }
        async fn streams(
            State(c): State<Counters>,
            headers: HeaderMap,
        ) -> (AxumStatus, Json<Value>) {
            let expected = format!("Bearer token-{}", c.tokens.load(Ordering::SeqCst));
            let auth = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if auth != expected || auth == "Bearer token-1" {
                return (AxumStatus::UNAUTHORIZED, Json(json!({})));
            }
            (
                AxumStatus::OK,
                Json(json!({ "data": [{ "user_id": "7" }, { "user_id": "9" }] })),
            )
        }

        let counters = Counters::default();
        let app = Router::new()
            .route("/oauth2/token", post(token))
            .route("/helix/streams", get(streams))
            .with_state(counters.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), counters)
    }

    fn client_for(base: &str) -> PlatformClient {
        let cfg = Config {
            oauth_base_url: format!("{base}/oauth2/"),
            api_base_url: format!("{base}/helix"),
            ..test_config()
        };
        PlatformClient::new(&cfg).unwrap()
    }

    #[tokio::test]
    async fn token_is_cached() {
        let (base, counters) = fake_platform().await;
        let client = client_for(&base);
        assert_eq!(client.token().await.unwrap(), "token-1");
        assert_eq!(client.token().await.unwrap(), "token-1");
        assert_eq!(counters.tokens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_token_is_refreshed_once() {
        let (base, counters) = fake_platform().await;
        let client = client_for(&base);
        let ids = client.top_streams(2).await.unwrap();
        assert_eq!(ids, vec!["7".to_string(), "9".to_string()]);
        assert_eq!(counters.tokens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stream_topic_uses_api_base() {
        let client = client_for("http://platform.test");
        assert_eq!(
            client.stream_topic("42"),
            "http://platform.test/helix/streams?user_id=42"
        );
    }
}
