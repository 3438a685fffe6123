//! [`WebhookManager`]: subscription bookkeeping, hub requests, and the
//! callback routes the platform calls back on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use common::protocol::{SubscriptionView, WebhookMessage};
use common::ServiceError;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::hub::{HubClient, HubMode, HubRequest};
use super::{ManagerError, ManagerEvent, RenewalScheduler, SubscriptionManager};
use crate::config::{Config, MAX_LEASE_SECONDS};
use crate::persistence::{SubscriptionRecord, SubscriptionStore};
use crate::platform::{PlatformError, TokenSource};
use crate::server::handlers::error_response;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the notification signature: `sha256=<hex>`.
pub const SIGNATURE_HEADER: &str = "x-hub-signature";

/// Capacity of the manager's event channel.
const EVENT_CAPACITY: usize = 256;

/// Inputs for building a [`WebhookManager`] and its scheduler.
pub struct ManagerBuilder {
    hostname: String,
    base_path: String,
    lease_seconds: i64,
    store: SubscriptionStore,
    hub: Arc<dyn HubClient>,
    tokens: Arc<dyn TokenSource>,
}

/// Everything the orchestrator needs to finish wiring the manager.
pub struct ManagerAssembly {
    /// The manager, as the orchestrator sees it.
    pub manager: Arc<dyn SubscriptionManager>,
    /// Detached scheduler; must be attached to `manager` before use.
    pub scheduler: RenewalScheduler,
    /// Message and error notifications.
    pub events: mpsc::Receiver<ManagerEvent>,
    /// Callback routes under `/{base_path}/:id`.
    pub routes: Router,
}

impl ManagerBuilder {
    pub fn new(
        cfg: &Config,
        store: SubscriptionStore,
        hub: Arc<dyn HubClient>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            hostname: cfg.host_name.clone(),
            base_path: cfg.webhook_base_path.trim_matches('/').to_owned(),
            lease_seconds: i64::try_from(cfg.lease_seconds.min(MAX_LEASE_SECONDS))
                .unwrap_or(i64::MAX),
            store,
            hub,
            tokens,
        }
    }

    /// Construct the scheduler, then the manager holding it.
    pub fn build(self) -> ManagerAssembly {
        let scheduler = RenewalScheduler::new();
        let (events_tx, events) = mpsc::channel(EVENT_CAPACITY);
        let routes_base = self.base_path.clone();
        let manager = Arc::new(WebhookManager {
            hostname: self.hostname,
            base_path: self.base_path,
            lease_seconds: self.lease_seconds,
            store: self.store,
            hub: self.hub,
            tokens: self.tokens,
            scheduler: scheduler.clone(),
            events: events_tx,
            subscriptions: RwLock::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        });
        let routes = callback_routes(&routes_base, Arc::clone(&manager));
        ManagerAssembly {
            manager,
            scheduler,
            events,
            routes,
        }
    }
}

/// Subscription manager backed by [`SubscriptionStore`] and a [`HubClient`].
pub struct WebhookManager {
    hostname: String,
    base_path: String,
    lease_seconds: i64,
    store: SubscriptionStore,
    hub: Arc<dyn HubClient>,
    tokens: Arc<dyn TokenSource>,
    scheduler: RenewalScheduler,
    events: mpsc::Sender<ManagerEvent>,
    subscriptions: RwLock<HashMap<String, SubscriptionRecord>>,
    destroyed: AtomicBool,
}

impl WebhookManager {
    fn callback_url(&self, id: &str) -> String {
        format!("https://{}/{}/{id}", self.hostname, self.base_path)
    }

    fn ensure_live(&self) -> Result<(), ManagerError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ManagerError::Destroyed);
        }
        Ok(())
    }

    fn hub_request(&self, record: &SubscriptionRecord, mode: HubMode) -> HubRequest {
        HubRequest {
            callback: self.callback_url(&record.id),
            mode,
            topic: record.topic.clone(),
            lease_seconds: record.lease_seconds,
            secret: record.secret.clone(),
        }
    }

    /// Send a hub request, refreshing the app token once if it is rejected.
    async fn send(&self, request: &HubRequest) -> Result<(), ManagerError> {
        let token = self.tokens.token().await?;
        match self.hub.send(request, &token).await {
            Err(PlatformError::Unauthorized) => {
                debug!("hub rejected token; refreshing");
                let token = self.tokens.refresh().await?;
                Ok(self.hub.send(request, &token).await?)
            }
            other => Ok(other?),
        }
    }

    async fn publish(&self, event: ManagerEvent) {
        if self.events.send(event).await.is_err() {
            debug!("event receiver dropped");
        }
    }

    /// Renewal time for a lease ending at `expires_at`: 90% into the lease.
    fn renew_at(&self, expires_at: DateTime<Utc>, lease_seconds: i64) -> DateTime<Utc> {
        Duration::try_seconds(lease_seconds / 10)
            .and_then(|margin| expires_at.checked_sub_signed(margin))
            .unwrap_or(expires_at)
    }

    /// Handle a verification request from the platform.
    async fn verify(&self, id: &str, params: VerifyParams) -> Result<String, ServiceError> {
        let record = self
            .subscriptions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("subscription {id}")))?;
        if params.topic != record.topic {
            return Err(ServiceError::NotFound(format!("topic for subscription {id}")));
        }

        match params.mode.as_str() {
            "subscribe" => {
                let lease = params.lease_seconds.unwrap_or(record.lease_seconds);
                let expires_at = lease_expiry(Utc::now(), lease).ok_or_else(|| {
                    ServiceError::BadRequest(format!("hub.lease_seconds out of range: {lease}"))
                })?;
                let updated = SubscriptionRecord {
                    verified: true,
                    expires_at: Some(expires_at),
                    lease_seconds: lease,
                    ..record
                };
                self.store
                    .save(&updated)
                    .await
                    .map_err(|e| ServiceError::Internal(e.to_string()))?;
                if let Err(e) = self
                    .scheduler
                    .schedule(id, self.renew_at(expires_at, lease))
                {
                    warn!(subscription = %id, error = %e, "renewal not scheduled");
                }
                self.subscriptions
                    .write()
                    .await
                    .insert(id.to_owned(), updated);
                info!(subscription = %id, lease_seconds = lease, "subscription verified");
                params
                    .challenge
                    .ok_or_else(|| ServiceError::BadRequest("missing hub.challenge".into()))
            }
            "unsubscribe" => params
                .challenge
                .ok_or_else(|| ServiceError::BadRequest("missing hub.challenge".into())),
            "denied" => {
                self.forget(id).await;
                let reason = params.reason.unwrap_or_else(|| "unspecified".into());
                self.publish(ManagerEvent::Error(ManagerError::Denied {
                    topic: record.topic,
                    reason,
                }))
                .await;
                Ok(String::new())
            }
            other => Err(ServiceError::BadRequest(format!("unknown hub.mode {other}"))),
        }
    }

    /// Handle a notification: check its signature and publish it.
    async fn notify(&self, id: &str, headers: &HeaderMap, body: &[u8]) -> Result<(), ServiceError> {
        let record = self
            .subscriptions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("subscription {id}")))?;

        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("sha256="))
            .and_then(|hex_sig| hex::decode(hex_sig).ok())
            .ok_or_else(|| ServiceError::Forbidden("missing or malformed signature".into()))?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(record.secret.as_bytes())
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        mac.update(body);
        mac.verify_slice(&signature)
            .map_err(|_| ServiceError::Forbidden("signature mismatch".into()))?;

        let payload: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| ServiceError::BadRequest(format!("invalid JSON body: {e}")))?;
        self.publish(ManagerEvent::Message(WebhookMessage {
            subscription_id: record.id,
            topic: record.topic,
            payload,
            received_at: Utc::now(),
        }))
        .await;
        Ok(())
    }

    async fn forget(&self, id: &str) {
        self.scheduler.cancel(id);
        self.subscriptions.write().await.remove(id);
        if let Err(e) = self.store.remove(id).await {
            warn!(subscription = %id, error = %e, "failed to remove subscription row");
        }
    }
}

#[async_trait]
impl SubscriptionManager for WebhookManager {
    async fn init(&self) -> Result<(), ManagerError> {
        self.ensure_live()?;
        let records = self.store.list().await?;
        let now = Utc::now();
        let mut renew = Vec::new();
        {
            let mut subs = self.subscriptions.write().await;
            for record in records {
                match record.expires_at {
                    Some(expires_at) if record.verified && expires_at > now => {
                        if let Err(e) = self
                            .scheduler
                            .schedule(&record.id, self.renew_at(expires_at, record.lease_seconds))
                        {
                            warn!(subscription = %record.id, error = %e, "renewal not scheduled");
                        }
                    }
                    _ => renew.push(record.id.clone()),
                }
                subs.insert(record.id.clone(), record);
            }
        }
        let restored = self.subscriptions.read().await.len();
        info!(restored, expired = renew.len(), "subscription manager initialised");
        for id in renew {
            if let Err(e) = self.renew(&id).await {
                warn!(subscription = %id, error = %e, "renewal of stored subscription failed");
            }
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), ManagerError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Err(ManagerError::Destroyed);
        }
        self.scheduler.shutdown().await;

        let records: Vec<_> = self.subscriptions.write().await.drain().map(|(_, r)| r).collect();
        let mut failed = Vec::new();
        for record in records {
            match self.send(&self.hub_request(&record, HubMode::Unsubscribe)).await {
                Ok(()) => {
                    if let Err(e) = self.store.remove(&record.id).await {
                        warn!(
                            subscription = %record.id,
                            error = %e,
                            "failed to remove subscription row"
                        );
                    }
                }
                Err(e) => {
                    warn!(subscription = %record.id, error = %e, "unsubscribe failed");
                    failed.push(record.id);
                }
            }
        }
        info!(failed = failed.len(), "subscription manager destroyed");
        if failed.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::Unsubscribe { failed })
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<String, ManagerError> {
        self.ensure_live()?;
        if let Some(existing) = self
            .subscriptions
            .read()
            .await
            .values()
            .find(|r| r.topic == topic)
        {
            return Ok(existing.id.clone());
        }

        let record = SubscriptionRecord {
            id: Uuid::new_v4().simple().to_string(),
            topic: topic.to_owned(),
            secret: Uuid::new_v4().simple().to_string(),
            lease_seconds: self.lease_seconds,
            expires_at: None,
            verified: false,
        };
        self.store.save(&record).await?;
        self.subscriptions
            .write()
            .await
            .insert(record.id.clone(), record.clone());

        if let Err(e) = self.send(&self.hub_request(&record, HubMode::Subscribe)).await {
            self.forget(&record.id).await;
            return Err(e);
        }
        info!(subscription = %record.id, topic, "subscription requested");
        Ok(record.id)
    }

    async fn renew(&self, id: &str) -> Result<(), ManagerError> {
        self.ensure_live()?;
        let record = self
            .subscriptions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::UnknownSubscription(id.to_owned()))?;
        let record = SubscriptionRecord {
            lease_seconds: self.lease_seconds,
            ..record
        };
        match self.send(&self.hub_request(&record, HubMode::Subscribe)).await {
            Ok(()) => {
                debug!(subscription = %id, "renewal requested");
                Ok(())
            }
            Err(e) => {
                self.publish(ManagerEvent::Error(ManagerError::Renewal {
                    id: id.to_owned(),
                    reason: e.to_string(),
                }))
                .await;
                Err(e)
            }
        }
    }

    async fn subscriptions(&self) -> Vec<SubscriptionView> {
        let mut views: Vec<_> = self
            .subscriptions
            .read()
            .await
            .values()
            .map(|r| SubscriptionView {
                id: r.id.clone(),
                topic: r.topic.clone(),
                verified: r.verified,
                expires_at: r.expires_at,
            })
            .collect();
        views.sort_by(|a, b| a.topic.cmp(&b.topic));
        views
    }
}

// ---------------------------------------------------------------------------
// Callback routes
// ---------------------------------------------------------------------------

/// End of a lease of `lease_seconds` starting at `now`; `None` unless the
/// lease is within `1..=MAX_LEASE_SECONDS`.
fn lease_expiry(now: DateTime<Utc>, lease_seconds: i64) -> Option<DateTime<Utc>> {
    if lease_seconds <= 0 || lease_seconds.unsigned_abs() > MAX_LEASE_SECONDS {
        return None;
    }
    now.checked_add_signed(Duration::try_seconds(lease_seconds)?)
}

#[derive(Debug, Deserialize)]
struct VerifyParams {
    #[serde(rename = "hub.mode")]
    mode: String,
    #[serde(rename = "hub.topic")]
    topic: String,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
    #[serde(rename = "hub.lease_seconds")]
    lease_seconds: Option<i64>,
    #[serde(rename = "hub.reason")]
    reason: Option<String>,
}

fn callback_routes(base_path: &str, manager: Arc<WebhookManager>) -> Router {
    Router::new()
        .route(&format!("/{base_path}/:id"), get(verify).post(notify))
        .with_state(manager)
}

async fn verify(
    State(manager): State<Arc<WebhookManager>>,
    Path(id): Path<String>,
    Query(params): Query<VerifyParams>,
) -> Response {
    match manager.verify(&id, params).await {
        Ok(challenge) => (StatusCode::OK, challenge).into_response(),
        Err(e) => {
            warn!(subscription = %id, error = %e, "verification rejected");
            error_response(e)
        }
    }
}

async fn notify(
    State(manager): State<Arc<WebhookManager>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match manager.notify(&id, &headers, &body).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!(subscription = %id, error = %e, "notification rejected");
            error_response(e)
        }
    }
}
