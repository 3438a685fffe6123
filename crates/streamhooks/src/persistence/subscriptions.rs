//! [`SubscriptionStore`]: the subscription manager's persistence adapter.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqlitePool;

use super::Database;

/// A persisted subscription row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    /// Local identifier, also the last segment of the callback path.
    pub id: String,
    /// Topic URL the subscription tracks.
    pub topic: String,
    /// Shared secret the platform signs notifications with.
    pub secret: String,
    /// Lease requested from the platform, in seconds.
    pub lease_seconds: i64,
    /// Lease expiry once the platform has verified the subscription.
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether the platform has completed the verification handshake.
    pub verified: bool,
}

type Row = (String, String, String, i64, Option<i64>, bool);

impl From<Row> for SubscriptionRecord {
    fn from((id, topic, secret, lease_seconds, expires_at, verified): Row) -> Self {
        Self {
            id,
            topic,
            secret,
            lease_seconds,
            expires_at: expires_at.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            verified,
        }
    }
}

/// Subscription rows in the shared database. Never closes the pool.
#[derive(Clone, Debug)]
pub struct SubscriptionStore {
    pool: SqlitePool,
}

impl SubscriptionStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Insert or replace a record.
    pub async fn save(&self, record: &SubscriptionRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO subscriptions (id, topic, secret, lease_seconds, expires_at, verified)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                topic = excluded.topic,
                secret = excluded.secret,
                lease_seconds = excluded.lease_seconds,
                expires_at = excluded.expires_at,
                verified = excluded.verified",
        )
        .bind(&record.id)
        .bind(&record.topic)
        .bind(&record.secret)
        .bind(record.lease_seconds)
        .bind(record.expires_at.map(|t| t.timestamp()))
        .bind(record.verified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a record; deleting an unknown id is not an error.
    pub async fn remove(&self, id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM subscriptions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All persisted records, oldest topic first.
    pub async fn list(&self) -> Result<Vec<SubscriptionRecord>, sqlx::Error> {
        let rows: Vec<Row> = sqlx::query_as(
            "SELECT id, topic, secret, lease_seconds, expires_at, verified
             FROM subscriptions ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SubscriptionRecord::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::Persistence;

    fn record(id: &str, topic: &str) -> SubscriptionRecord {
        SubscriptionRecord {
            id: id.into(),
            topic: topic.into(),
            secret: "secret".into(),
            lease_seconds: 600,
            expires_at: None,
            verified: false,
        }
    }

    async fn store() -> SubscriptionStore {
        let db = Database::in_memory().await;
        db.sync().await.unwrap();
        SubscriptionStore::new(&db)
    }

    #[tokio::test]
    async fn save_updates_existing_row() {
        let store = store().await;
        let mut rec = record("a", "topic-a");
        store.save(&rec).await.unwrap();

        rec.verified = true;
        rec.expires_at = Utc.timestamp_opt(1_900_000_000, 0).single();
        store.save(&rec).await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all, vec![rec]);
    }

    #[tokio::test]
    async fn remove_deletes_only_the_given_id() {
        let store = store().await;
        store.save(&record("a", "topic-a")).await.unwrap();
        store.save(&record("b", "topic-b")).await.unwrap();
        store.remove("a").await.unwrap();
        store.remove("missing").await.unwrap();

        let ids: Vec<_> = store.list().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b".to_string()]);
    }
}
