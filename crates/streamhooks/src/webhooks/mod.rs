//! Webhook subscription management.
//!
//! # Construction
//!
//! ```text
//! ManagerBuilder::build()
//!     → RenewalScheduler::new()          (detached)
//!     → WebhookManager { scheduler, .. } (holds the scheduler)
//!     → ManagerAssembly { manager, scheduler, events, routes }
//! orchestrator
//!     → scheduler.attach(&manager)       (closes the cycle; scheduler holds a Weak)
//!     → handlers::spawn_event_pump(events, on_message, on_error)
//! ```
//!
//! # Invariants
//!
//! - The scheduler never fires a renewal before it has been attached.
//! - Events are delivered through a bounded channel; message and error events
//!   are not ordered relative to each other.
//! - After [`SubscriptionManager::destroy`] every call fails with
//!   [`ManagerError::Destroyed`] and no renewal timer remains.

pub mod handlers;
pub mod hub;
pub mod manager;
pub mod scheduler;
pub mod seed;

pub use manager::{ManagerAssembly, ManagerBuilder};
pub use scheduler::RenewalScheduler;
pub use seed::{Seeder, TopStreamsSeeder};

use async_trait::async_trait;
use common::protocol::{SubscriptionView, WebhookMessage};
use thiserror::Error;

use crate::platform::PlatformError;

/// Errors produced by the subscription manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The manager has been destroyed.
    #[error("subscription manager destroyed")]
    Destroyed,

    /// No subscription with this id is tracked.
    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),

    /// The platform refused the subscription during verification.
    #[error("subscription to {topic} denied: {reason}")]
    Denied { topic: String, reason: String },

    /// A renewal request was refused or could not be delivered.
    #[error("renewal of subscription {id} failed: {reason}")]
    Renewal { id: String, reason: String },

    /// Some subscriptions could not be cancelled during destroy.
    #[error("failed to unsubscribe {} subscription(s)", failed.len())]
    Unsubscribe { failed: Vec<String> },

    /// A platform call failed.
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// The persistence adapter failed.
    #[error("subscription storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Notification published by the manager on its event channel.
#[derive(Debug)]
pub enum ManagerEvent {
    Message(WebhookMessage),
    Error(ManagerError),
}

/// The subscription-manager collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubscriptionManager: Send + Sync {
    /// Load existing subscriptions and reschedule or renew them.
    async fn init(&self) -> Result<(), ManagerError>;

    /// Cancel renewal timers and unsubscribe everything still tracked.
    async fn destroy(&self) -> Result<(), ManagerError>;

    /// Start tracking `topic`; returns the subscription id.
    async fn subscribe(&self, topic: &str) -> Result<String, ManagerError>;

    /// Re-send the subscription request for `id` before its lease ends.
    async fn renew(&self, id: &str) -> Result<(), ManagerError>;

    /// Snapshot of tracked subscriptions.
    async fn subscriptions(&self) -> Vec<SubscriptionView>;
}
