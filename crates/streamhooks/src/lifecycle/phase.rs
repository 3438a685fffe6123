//! Process lifecycle phases and the forward-only tracker.

use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

/// A named stage of the process, ordered by ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecyclePhase {
    Initializing,
    PersistenceReady,
    Listening,
    Active,
    ShuttingDown,
    Terminated,
}

impl LifecyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::PersistenceReady => "persistence-ready",
            Self::Listening => "listening",
            Self::Active => "active",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PhaseError {
    #[error("lifecycle cannot move from {from} to {to}")]
    Regression {
        from: LifecyclePhase,
        to: LifecyclePhase,
    },
}

/// Current phase, published on a `watch` channel. Phases only move forward.
#[derive(Debug)]
pub struct PhaseTracker {
    tx: watch::Sender<LifecyclePhase>,
    entered: Mutex<Vec<(LifecyclePhase, Instant)>>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LifecyclePhase::Initializing);
        Self {
            tx,
            entered: Mutex::new(vec![(LifecyclePhase::Initializing, Instant::now())]),
        }
    }

    pub fn current(&self) -> LifecyclePhase {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecyclePhase> {
        self.tx.subscribe()
    }

    /// Enter `next`.
    ///
    /// # Errors
    ///
    /// [`PhaseError::Regression`] if `next` is not strictly after the current
    /// phase; the current phase is left unchanged.
    pub fn advance(&self, next: LifecyclePhase) -> Result<(), PhaseError> {
        let mut outcome = Ok(());
        self.tx.send_if_modified(|current| {
            if next <= *current {
                outcome = Err(PhaseError::Regression {
                    from: *current,
                    to: next,
                });
                return false;
            }
            *current = next;
            true
        });
        outcome?;

        if let Ok(mut entered) = self.entered.lock() {
            entered.push((next, Instant::now()));
        }
        info!(phase = %next, "lifecycle phase entered");
        Ok(())
    }

    /// Phases entered so far, with their entry time.
    pub fn history(&self) -> Vec<(LifecyclePhase, Instant)> {
        self.entered.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_forward_and_skip_ahead() {
        let tracker = PhaseTracker::new();
        tracker.advance(LifecyclePhase::PersistenceReady).unwrap();
        tracker.advance(LifecyclePhase::Active).unwrap();
        assert_eq!(tracker.current(), LifecyclePhase::Active);
        let phases: Vec<_> = tracker.history().into_iter().map(|(p, _)| p).collect();
        assert_eq!(
            phases,
            vec![
                LifecyclePhase::Initializing,
                LifecyclePhase::PersistenceReady,
                LifecyclePhase::Active
            ]
        );
    }

    #[test]
    fn regression_and_reentry_are_refused() {
        let tracker = PhaseTracker::new();
        tracker.advance(LifecyclePhase::Listening).unwrap();
        assert_eq!(
            tracker.advance(LifecyclePhase::Listening),
            Err(PhaseError::Regression {
                from: LifecyclePhase::Listening,
                to: LifecyclePhase::Listening
            })
        );
        assert!(tracker.advance(LifecyclePhase::PersistenceReady).is_err());
        assert_eq!(tracker.current(), LifecyclePhase::Listening);
    }

    #[test]
    fn subscribers_see_the_latest_phase() {
        let tracker = PhaseTracker::new();
        let rx = tracker.subscribe();
        tracker.advance(LifecyclePhase::ShuttingDown).unwrap();
        assert_eq!(*rx.borrow(), LifecyclePhase::ShuttingDown);
        assert_eq!(LifecyclePhase::ShuttingDown.to_string(), "shutting-down");
    }
}
