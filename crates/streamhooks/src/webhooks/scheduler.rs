//! [`RenewalScheduler`]: per-subscription timers that renew before the lease ends.
//!
//! The scheduler is built before the manager it drives and attached to it
//! afterwards. It keeps only a `Weak` reference so that manager and scheduler
//! do not keep each other alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::SubscriptionManager;

/// Errors produced by the scheduler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// `schedule` was called before `attach`.
    #[error("renewal scheduler has no manager attached")]
    NotAttached,

    /// `attach` was called twice.
    #[error("renewal scheduler is already attached")]
    AlreadyAttached,

    /// The scheduler has been shut down.
    #[error("renewal scheduler is shut down")]
    ShutDown,
}

struct Inner {
    manager: OnceLock<Weak<dyn SubscriptionManager>>,
    timers: Mutex<HashMap<String, CancellationToken>>,
    root: CancellationToken,
    tracker: TaskTracker,
}

/// Cloneable handle to the renewal timers.
#[derive(Clone)]
pub struct RenewalScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("attached", &self.is_attached())
            .field("pending", &self.pending())
            .finish()
    }
}

impl RenewalScheduler {
    /// Create a detached scheduler.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                manager: OnceLock::new(),
                timers: Mutex::new(HashMap::new()),
                root: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Bind the scheduler to the manager whose subscriptions it renews.
    pub fn attach(&self, manager: &Arc<dyn SubscriptionManager>) -> Result<(), SchedulerError> {
        self.inner
            .manager
            .set(Arc::downgrade(manager))
            .map_err(|_| SchedulerError::AlreadyAttached)
    }

    pub fn is_attached(&self) -> bool {
        self.inner.manager.get().is_some()
    }

    /// Number of timers that have not fired or been cancelled.
    pub fn pending(&self) -> usize {
        self.inner.timers.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Renew subscription `id` at `at`, replacing any earlier timer for it.
    /// A time in the past fires immediately.
    pub fn schedule(&self, id: &str, at: DateTime<Utc>) -> Result<(), SchedulerError> {
        let manager = self
            .inner
            .manager
            .get()
            .cloned()
            .ok_or(SchedulerError::NotAttached)?;
        if self.inner.root.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }

        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let token = self.inner.root.child_token();
        if let Ok(mut timers) = self.inner.timers.lock() {
            if let Some(previous) = timers.insert(id.to_owned(), token.clone()) {
                previous.cancel();
            }
        }

        let inner = Arc::clone(&self.inner);
        let id = id.to_owned();
        self.inner.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            // Forget the timer before renewing: a successful renewal schedules
            // a fresh one under the same id.
            if let Ok(mut timers) = inner.timers.lock() {
                timers.remove(&id);
            }
            let Some(manager) = manager.upgrade() else {
                debug!(subscription = %id, "manager dropped; renewal skipped");
                return;
            };
            if let Err(e) = manager.renew(&id).await {
                warn!(subscription = %id, error = %e, "scheduled renewal failed");
            }
        });
        Ok(())
    }

    /// Cancel the timer for `id`, if any.
    pub fn cancel(&self, id: &str) {
        if let Ok(mut timers) = self.inner.timers.lock() {
            if let Some(token) = timers.remove(id) {
                token.cancel();
            }
        }
    }

    /// Cancel every timer and wait for in-flight renewals to finish.
    pub async fn shutdown(&self) {
        self.inner.root.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        if let Ok(mut timers) = self.inner.timers.lock() {
            timers.clear();
        }
    }
}

impl Default for RenewalScheduler {
    fn default() -> Self {
        Self::new()
    }
}
