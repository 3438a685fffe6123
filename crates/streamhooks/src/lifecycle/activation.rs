//! Post-bind activation: start subscription activity once the encrypted
//! callback endpoint is reachable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::webhooks::{Seeder, SubscriptionManager};

/// Outcome of the activation hook, as reported by `/health`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationStatus {
    /// Waiting for the encrypted listener.
    Pending,
    /// Manager initialised and seeded.
    Active,
    /// Init or seeding failed; the process keeps serving without subscriptions.
    Degraded(String),
    /// No encrypted listener, so activation never runs.
    Disabled,
}

impl ActivationStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Degraded(_) => "degraded",
            Self::Disabled => "disabled",
        }
    }
}

/// One-shot hook run after the encrypted listener binds.
pub struct ActivationHook {
    manager: Arc<dyn SubscriptionManager>,
    seeder: Arc<dyn Seeder>,
    fired: AtomicBool,
    status: watch::Sender<ActivationStatus>,
}

impl ActivationHook {
    pub fn new(manager: Arc<dyn SubscriptionManager>, seeder: Arc<dyn Seeder>) -> Arc<Self> {
        let (status, _) = watch::channel(ActivationStatus::Pending);
        Arc::new(Self {
            manager,
            seeder,
            fired: AtomicBool::new(false),
            status,
        })
    }

    pub fn status(&self) -> watch::Receiver<ActivationStatus> {
        self.status.subscribe()
    }

    /// Record that the hook will never run. Has no effect once fired.
    pub fn disable(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.status.send_replace(ActivationStatus::Disabled);
            info!("subscription activation disabled: no encrypted listener");
        }
    }

    /// Spawn the hook. Only the first call (and only if not disabled) spawns;
    /// later calls return `None`.
    pub fn on_bound(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.fired.swap(true, Ordering::SeqCst) {
            return None;
        }
        let hook = Arc::clone(self);
        Some(tokio::spawn(async move { hook.run().await }))
    }

    async fn run(&self) {
        info!("activating subscriptions");
        if let Err(e) = self.manager.init().await {
            error!(
                error = %e,
                "subscription manager init failed; continuing without subscriptions"
            );
            self.status
                .send_replace(ActivationStatus::Degraded(format!("init: {e}")));
            return;
        }
        match self.seeder.seed(Arc::clone(&self.manager)).await {
            Ok(subscribed) => {
                info!(subscribed, "subscriptions activated");
                self.status.send_replace(ActivationStatus::Active);
            }
            Err(e) => {
                error!(error = %e, "seeding subscriptions failed; continuing degraded");
                self.status
                    .send_replace(ActivationStatus::Degraded(format!("seed: {e:#}")));
            }
        }
    }
}
