//! [`SessionStore`]: signed-cookie sessions backed by the shared database.
//!
//! The cookie value is `<id>.<base64url(HMAC-SHA256(secret, id))>`. A value
//! whose signature does not verify is rejected before the database is read.

use axum::http::{header, HeaderMap};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use common::protocol::TokenPair;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::sqlite::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use super::Database;

type HmacSha256 = Hmac<Sha256>;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "sid";

/// Errors produced by the session layer.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The cookie value is malformed or its signature does not verify.
    #[error("session cookie failed verification")]
    BadSignature,

    /// The signing key was rejected by the MAC implementation.
    #[error("invalid session signing key")]
    InvalidKey,

    /// The database rejected the query.
    #[error("session storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Session store sharing the orchestrator's database pool.
///
/// Never closes the pool: the connection's lifetime belongs to the lifecycle
/// sequencers.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
    mac: HmacSha256,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Create a store signing cookies with `secret`.
    pub fn new(db: &Database, secret: &str) -> Result<Self, SessionError> {
        let mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
            .map_err(|_| SessionError::InvalidKey)?;
        Ok(Self {
            pool: db.pool().clone(),
            mac,
        })
    }

    /// Persist `tokens` under a fresh session id and return the signed cookie value.
    pub async fn create(&self, tokens: &TokenPair) -> Result<String, SessionError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO sessions (id, access_token, refresh_token, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(format!("{id}.{}", self.sign(&id)))
    }

    /// Look up the tokens for a signed cookie value.
    ///
    /// Returns `Ok(None)` for a well-signed id that has no row.
    pub async fn load(&self, cookie_value: &str) -> Result<Option<TokenPair>, SessionError> {
        let id = self.verify(cookie_value)?;
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT access_token, refresh_token FROM sessions WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(access_token, refresh_token)| TokenPair {
            access_token,
            refresh_token,
        }))
    }

    /// Build the `Set-Cookie` header value for a signed session id.
    pub fn set_cookie_header(cookie_value: &str) -> String {
        format!("{SESSION_COOKIE}={cookie_value}; Path=/; HttpOnly; SameSite=Lax")
    }

    /// Extract the session cookie value from request headers, if present.
    pub fn cookie_from_headers(headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == SESSION_COOKIE)
            .map(|(_, value)| value.to_owned())
    }

    fn sign(&self, id: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(id.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    fn verify<'a>(&self, cookie_value: &'a str) -> Result<&'a str, SessionError> {
        let (id, signature) = cookie_value
            .rsplit_once('.')
            .ok_or(SessionError::BadSignature)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| SessionError::BadSignature)?;
        let mut mac = self.mac.clone();
        mac.update(id.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| SessionError::BadSignature)?;
        Ok(id)
    }
}
