//! SQLite persistence: the connection the orchestrator owns, plus the two
//! stores that borrow it.
//!
//! # Ownership
//!
//! - [`Database`] is opened, synced and closed **only** by the lifecycle
//!   sequencers.
//! - [`SessionStore`] and [`SubscriptionStore`] hold clones of the pool handle
//!   and never close it.

pub mod session;
pub mod subscriptions;

pub use session::SessionStore;
pub use subscriptions::{SubscriptionRecord, SubscriptionStore};

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

/// The persistence collaborator as seen by the lifecycle sequencers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Idempotently prepare the schema.
    async fn sync(&self) -> Result<()>;

    /// Close the connection. Fails if it was already closed.
    async fn close(&self) -> Result<()>;
}

/// Pooled SQLite connection.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if necessary) the database at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is malformed, the parent directory cannot
    /// be created, or the first connection cannot be established.
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid database URL: {url}"))?
            .create_if_missing(true);

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .context("failed to open database")?;

        info!(url, "database opened");
        Ok(Self { pool })
    }

    /// Single-connection in-memory database for tests.
    #[cfg(test)]
    pub async fn in_memory() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        Self { pool }
    }

    /// Shared pool handle for the stores.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Persistence for Database {
    async fn sync(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("failed to create sessions table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS subscriptions (
                id TEXT PRIMARY KEY NOT NULL,
                topic TEXT NOT NULL UNIQUE,
                secret TEXT NOT NULL,
                lease_seconds INTEGER NOT NULL,
                expires_at INTEGER,
                verified INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await
        .context("failed to create subscriptions table")?;

        info!("database schema synchronised");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.pool.is_closed() {
            anyhow::bail!("database connection already closed");
        }
        self.pool.close().await;
        Ok(())
    }
}
