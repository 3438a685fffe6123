//! Configuration loading and validation for the streamhooks service.
//!
//! All values are read from environment variables once at startup. The process
//! exits with a clear error message if any required variable is missing or
//! invalid. Missing TLS paths are not errors: they disable the HTTPS listener.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::auth::AUTHORIZE_PATH;
use crate::server::router;

/// Longest lease the platform grants, in seconds (ten days).
pub const MAX_LEASE_SECONDS: u64 = 864_000;

/// Validated service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Key used to sign session cookies. **Required.**
    pub session_secret: String,

    /// Platform application client id. **Required.**
    pub client_id: String,

    /// Platform application client secret. **Required.**
    pub client_secret: String,

    /// Public host name the platform uses to reach the webhook callbacks. **Required.**
    pub host_name: String,

    /// Absolute URI the platform redirects to after end-user authorization.
    /// Its path becomes the authorization callback route. **Required.**
    pub redirect_uri: String,

    /// Path to the PEM-encoded TLS private key.
    pub cert_key_path: Option<String>,

    /// Path to the PEM-encoded TLS certificate.
    pub cert_path: Option<String>,

    /// Path to the PEM-encoded intermediate certificate chain.
    pub cert_chain_path: Option<String>,

    /// Port of the plain HTTP listener.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Port of the HTTPS listener.
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// SQLite connection URL for sessions and subscriptions.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// First path segment of the webhook callback routes.
    #[serde(default = "default_webhook_base_path")]
    pub webhook_base_path: String,

    /// Number of channels subscribed to when the service activates.
    #[serde(default = "default_seed_count")]
    pub seed_count: usize,

    /// Lease requested for each subscription, in seconds.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,

    /// Upper bound on each teardown step during shutdown, in seconds.
    #[serde(default = "default_shutdown_step_timeout")]
    pub shutdown_step_timeout_secs: u64,

    /// Base URL of the platform's OAuth2 endpoints.
    #[serde(default = "default_oauth_base_url")]
    pub oauth_base_url: String,

    /// Base URL of the platform's REST API.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// OTLP endpoint for span export. Export is disabled when unset.
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// The three optional TLS material paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsPaths {
    pub key: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub chain: Option<PathBuf>,
}

fn default_http_port() -> u16 {
    80
}
fn default_https_port() -> u16 {
    443
}
fn default_database_url() -> String {
    "sqlite://database/data.sqlite".into()
}
fn default_webhook_base_path() -> String {
    "webhooks".into()
}
fn default_seed_count() -> usize {
    10
}
fn default_lease_seconds() -> u64 {
    86_400
}
fn default_shutdown_step_timeout() -> u64 {
    30
}
fn default_oauth_base_url() -> String {
    "https://id.twitch.tv/oauth2".into()
}
fn default_api_base_url() -> String {
    "https://api.twitch.tv/helix".into()
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.session_secret, "SESSION_SECRET")?;
        ensure_non_empty(&self.client_id, "CLIENT_ID")?;
        ensure_non_empty(&self.client_secret, "CLIENT_SECRET")?;
        ensure_non_empty(&self.host_name, "HOST_NAME")?;
        ensure_non_empty(&self.redirect_uri, "REDIRECT_URI")?;
        ensure_non_empty(&self.database_url, "DATABASE_URL")?;

        url::Url::parse(&self.redirect_uri)
            .with_context(|| {
                format!("REDIRECT_URI is not an absolute URL: {}", self.redirect_uri)
            })?;
        self.check_redirect_path()?;

        if self.http_port == 0 || self.https_port == 0 {
            anyhow::bail!("HTTP_PORT and HTTPS_PORT must be non-zero");
        }
        if self.http_port == self.https_port {
            anyhow::bail!("HTTP_PORT and HTTPS_PORT must differ (both {})", self.http_port);
        }
        if self.webhook_base_path.trim_matches('/').is_empty() {
            anyhow::bail!("WEBHOOK_BASE_PATH must not be empty");
        }
        if self.seed_count == 0 {
            anyhow::bail!("SEED_COUNT must be > 0");
        }
        if self.lease_seconds == 0 || self.lease_seconds > MAX_LEASE_SECONDS {
            anyhow::bail!("LEASE_SECONDS must be within 1..={MAX_LEASE_SECONDS}");
        }
        if self.shutdown_step_timeout_secs == 0 {
            anyhow::bail!("SHUTDOWN_STEP_TIMEOUT_SECS must be > 0");
        }
        Ok(())
    }

    /// The configured TLS material paths; blank values count as unset.
    pub fn tls_paths(&self) -> TlsPaths {
        fn path(value: &Option<String>) -> Option<PathBuf> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        }
        TlsPaths {
            key: path(&self.cert_key_path),
            cert: path(&self.cert_path),
            chain: path(&self.cert_chain_path),
        }
    }

    /// Deadline applied to each teardown step.
    pub fn shutdown_step_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_step_timeout_secs)
    }

    /// Reject a callback path that another route already owns or that the
    /// router would read as a parameter.
    pub fn check_redirect_path(&self) -> Result<()> {
        let path = self.redirect_path();
        let base = self.webhook_base_path.trim_matches('/');
        let first = path.trim_start_matches('/').split('/').next().unwrap_or_default();
        if path == AUTHORIZE_PATH || router::PATHS.contains(&path.as_str()) {
            anyhow::bail!("REDIRECT_URI path {path} is already served by the application");
        }
        if first == base {
            anyhow::bail!(
                "REDIRECT_URI path {path} collides with the webhook callbacks under /{base}"
            );
        }
        if path.contains([':', '*', '{', '}']) {
            anyhow::bail!("REDIRECT_URI path {path} contains route pattern characters");
        }
        Ok(())
    }

    /// Path component of [`Config::redirect_uri`], used as the callback route.
    pub fn redirect_path(&self) -> String {
        url::Url::parse(&self.redirect_uri)
            .map(|u| u.path().to_owned())
            .unwrap_or_else(|_| "/auth/callback".into())
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        session_secret: "s3cret".into(),
        client_id: "client".into(),
        client_secret: "client-secret".into(),
        host_name: "hooks.example.com".into(),
        redirect_uri: "http://localhost/auth/callback".into(),
        cert_key_path: None,
        cert_path: None,
        cert_chain_path: None,
        http_port: 8080,
        https_port: 8443,
        database_url: "sqlite::memory:".into(),
        webhook_base_path: default_webhook_base_path(),
        seed_count: 3,
        lease_seconds: default_lease_seconds(),
        shutdown_step_timeout_secs: 5,
        oauth_base_url: "http://127.0.0.1:9/oauth2".into(),
        api_base_url: "http://127.0.0.1:9/helix".into(),
        otel_exporter_otlp_endpoint: None,
        log_level: default_log_level(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_http_port(), 80);
        assert_eq!(default_https_port(), 443);
        assert_eq!(default_database_url(), "sqlite://database/data.sqlite");
        assert_eq!(default_webhook_base_path(), "webhooks");
        assert_eq!(default_seed_count(), 10);
        assert_eq!(default_lease_seconds(), 86_400);
        assert_eq!(default_shutdown_step_timeout(), 30);
        assert_eq!(default_log_level(), "info");
    }

    #[test]
    fn validate_accepts_test_config() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_session_secret() {
        let cfg = Config {
            session_secret: "  ".into(),
            ..test_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_relative_redirect_uri() {
        let cfg = Config {
            redirect_uri: "/auth/callback".into(),
            ..test_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_equal_ports() {
        let cfg = Config {
            http_port: 8080,
            https_port: 8080,
            ..test_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_step_timeout() {
        let cfg = Config {
            shutdown_step_timeout_secs: 0,
            ..test_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn blank_tls_paths_count_as_unset() {
        let cfg = Config {
            cert_key_path: Some("/etc/tls/key.pem".into()),
            cert_path: Some("   ".into()),
            cert_chain_path: None,
            ..test_config()
        };
        let paths = cfg.tls_paths();
        assert_eq!(paths.key, Some(PathBuf::from("/etc/tls/key.pem")));
        assert_eq!(paths.cert, None);
        assert_eq!(paths.chain, None);
    }

    #[test]
    fn redirect_path_is_taken_from_uri() {
        let cfg = Config {
            redirect_uri: "https://hooks.example.com/oauth/return?x=1".into(),
            ..test_config()
        };
        assert_eq!(cfg.redirect_path(), "/oauth/return");
    }

    #[test]
    fn validate_rejects_redirect_paths_owned_by_other_routes() {
        for path in [
            "/",
            "/auth",
            "/success",
            "/subscriptions",
            "/messages",
            "/health",
            "/webhooks/abc",
            "/oauth/:code",
        ] {
            let cfg = Config {
                redirect_uri: format!("http://localhost:8080{path}"),
                ..test_config()
            };
            assert!(cfg.validate().is_err(), "path {path}");
        }
    }

    #[test]
    fn validate_accepts_nested_callback_under_auth() {
        let cfg = Config {
            redirect_uri: "http://localhost/auth/callback".into(),
            ..test_config()
        };
        assert!(cfg.check_redirect_path().is_ok());
    }

    #[test]
    fn validate_bounds_lease_seconds() {
        let at_max = Config {
            lease_seconds: MAX_LEASE_SECONDS,
            ..test_config()
        };
        assert!(at_max.validate().is_ok());

        let over = Config {
            lease_seconds: MAX_LEASE_SECONDS + 1,
            ..test_config()
        };
        assert!(over.validate().is_err());
    }
}
