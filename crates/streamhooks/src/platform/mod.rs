//! HTTP client for the remote platform's OAuth2 and REST endpoints.
//!
//! # Responsibilities
//!
//! - Obtain and cache the app access token (client-credentials grant).
//! - Exchange end-user authorization codes for [`TokenPair`]s.
//! - List live channels for the seeding policy.
//! - Deliver hub subscribe/unsubscribe requests for the subscription manager.
//!
//! [`TokenPair`]: common::protocol::TokenPair

pub mod client;

pub use client::PlatformClient;

use async_trait::async_trait;
use thiserror::Error;

/// Errors produced by platform calls.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The request could not be sent or the body could not be decoded.
    #[error("platform request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The platform rejected the bearer token.
    #[error("platform rejected the access token")]
    Unauthorized,

    /// The platform answered with an unexpected status.
    #[error("platform answered {status}: {body}")]
    Status { status: u16, body: String },
}

/// The get-token / refresh-token pair handed to the subscription manager.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Current app access token, fetched on first use.
    async fn token(&self) -> Result<String, PlatformError>;

    /// Discard the cached token and fetch a new one.
    async fn refresh(&self) -> Result<String, PlatformError>;
}
