//! Shared application state injected into every business-route handler.

use std::sync::Arc;

use tokio::sync::watch;

use crate::lifecycle::{ActivationStatus, LifecyclePhase};
use crate::persistence::SessionStore;
use crate::webhooks::handlers::MessageLog;
use crate::webhooks::SubscriptionManager;

/// Application state shared across all request handlers.
///
/// All fields are cheaply cloneable so that Axum can clone the state for each
/// request.
#[derive(Clone)]
pub struct AppState {
    /// Signed-cookie sessions; shares the orchestrator's database pool.
    pub sessions: SessionStore,
    /// The subscription manager, read-only from the routes' point of view.
    pub manager: Arc<dyn SubscriptionManager>,
    /// Most recent webhook messages recorded by the message handler.
    pub messages: MessageLog,
    pub phase: watch::Receiver<LifecyclePhase>,
    pub activation: watch::Receiver<ActivationStatus>,
}

#[cfg(test)]
impl AppState {
    /// State over a fresh in-memory database, in phase `phase` with
    /// activation `activation`.
    pub async fn for_tests(
        manager: Arc<dyn SubscriptionManager>,
        phase: LifecyclePhase,
        activation: ActivationStatus,
    ) -> Self {
        use crate::persistence::{Database, Persistence};

        let db = Database::in_memory().await;
        db.sync().await.unwrap();
        let (_, phase) = watch::channel(phase);
        let (_, activation) = watch::channel(activation);
        Self {
            sessions: SessionStore::new(&db, "test-secret").unwrap(),
            manager,
            messages: MessageLog::default(),
            phase,
            activation,
        }
    }
}
