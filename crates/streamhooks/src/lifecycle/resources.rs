//! Resources acquired during startup and released during shutdown.

use std::fmt;
use std::sync::Arc;

use crate::persistence::Persistence;
use crate::server::listener::ListenerHandle;
use crate::webhooks::SubscriptionManager;

/// Kind of a managed resource; also names its teardown step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Persistence,
    PlainListener,
    EncryptedListener,
    SubscriptionManager,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Persistence => "persistence",
            Self::PlainListener => "plain-listener",
            Self::EncryptedListener => "encrypted-listener",
            Self::SubscriptionManager => "subscription-manager",
        })
    }
}

/// What startup acquired so far.
///
/// Consumed by value by [`super::ShutdownSequencer::run`], so every resource
/// is released at most once.
#[derive(Default)]
pub struct AcquiredResources {
    pub persistence: Option<Arc<dyn Persistence>>,
    pub manager: Option<Arc<dyn SubscriptionManager>>,
    pub plain_listener: Option<Box<dyn ListenerHandle>>,
    pub encrypted_listener: Option<Box<dyn ListenerHandle>>,
}

impl AcquiredResources {
    /// Kinds currently held.
    pub fn kinds(&self) -> Vec<ResourceKind> {
        let mut kinds = Vec::new();
        if self.persistence.is_some() {
            kinds.push(ResourceKind::Persistence);
        }
        if self.manager.is_some() {
            kinds.push(ResourceKind::SubscriptionManager);
        }
        if self.plain_listener.is_some() {
            kinds.push(ResourceKind::PlainListener);
        }
        if self.encrypted_listener.is_some() {
            kinds.push(ResourceKind::EncryptedListener);
        }
        kinds
    }
}

impl fmt::Debug for AcquiredResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AcquiredResources").field(&self.kinds()).finish()
    }
}
