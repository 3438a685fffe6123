//! Shutdown: a one-shot trigger and the ordered, non-short-circuiting
//! teardown sequence.
//!
//! Teardown order: encrypted listener (if any), plain listener, persistence,
//! subscription manager. A failed or timed-out step is recorded and the next
//! step still runs; the exit code is 1 if any step failed.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::resources::{AcquiredResources, ResourceKind};

/// State of the process-wide shutdown trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Active,
    ShuttingDown,
    Terminated,
}

/// Fires at most once, however many signals arrive.
#[derive(Debug)]
pub struct ShutdownTrigger {
    state: watch::Sender<TriggerState>,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (state, _) = watch::channel(TriggerState::Active);
        Self { state }
    }

    pub fn state(&self) -> TriggerState {
        *self.state.borrow()
    }

    /// Move `Active → ShuttingDown`. Returns `true` only for the call that
    /// made the transition.
    pub fn fire(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state != TriggerState::Active {
                return false;
            }
            *state = TriggerState::ShuttingDown;
            true
        })
    }

    /// Resolve once the trigger has fired.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|state| *state != TriggerState::Active).await;
    }

    /// Move `ShuttingDown → Terminated`. No effect in any other state.
    pub fn finish(&self) {
        self.state.send_if_modified(|state| {
            if *state != TriggerState::ShuttingDown {
                return false;
            }
            *state = TriggerState::Terminated;
            true
        });
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("{0:#}")]
    Failed(anyhow::Error),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

/// Ordered outcome of each attempted teardown step. Append-only.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    entries: Vec<(ResourceKind, Result<(), TeardownError>)>,
}

impl ShutdownReport {
    pub fn record(&mut self, step: ResourceKind, outcome: Result<(), TeardownError>) {
        self.entries.push((step, outcome));
    }

    pub fn entries(&self) -> &[(ResourceKind, Result<(), TeardownError>)] {
        &self.entries
    }

    /// Steps in the order they were attempted.
    pub fn steps(&self) -> Vec<ResourceKind> {
        self.entries.iter().map(|(step, _)| *step).collect()
    }

    pub fn failures(&self) -> Vec<(ResourceKind, &TeardownError)> {
        self.entries
            .iter()
            .filter_map(|(step, outcome)| outcome.as_ref().err().map(|e| (*step, e)))
            .collect()
    }

    /// `0` if every step succeeded, `1` otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.failures().is_empty() {
            0
        } else {
            1
        }
    }
}

/// Releases [`AcquiredResources`] in teardown order.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownSequencer {
    step_timeout: Duration,
}

impl ShutdownSequencer {
    pub fn new(step_timeout: Duration) -> Self {
        Self { step_timeout }
    }

    /// Attempt every step for the resources present. Absent resources are
    /// skipped and not recorded.
    pub async fn run(&self, resources: AcquiredResources) -> ShutdownReport {
        let AcquiredResources {
            persistence,
            manager,
            plain_listener,
            encrypted_listener,
        } = resources;
        let mut report = ShutdownReport::default();

        if let Some(listener) = encrypted_listener {
            self.step(&mut report, ResourceKind::EncryptedListener, listener.close())
                .await;
        }
        if let Some(listener) = plain_listener {
            self.step(&mut report, ResourceKind::PlainListener, listener.close())
                .await;
        }
        if let Some(persistence) = persistence {
            self.step(&mut report, ResourceKind::Persistence, async move {
                persistence.close().await
            })
            .await;
        }
        if let Some(manager) = manager {
            self.step(&mut report, ResourceKind::SubscriptionManager, async move {
                manager.destroy().await.map_err(anyhow::Error::from)
            })
            .await;
        }

        let failed = report.failures().len();
        if failed == 0 {
            info!(steps = report.entries().len(), "shutdown complete");
        } else {
            warn!(steps = report.entries().len(), failed, "shutdown complete with failures");
        }
        report
    }

    async fn step<F>(&self, report: &mut ShutdownReport, step: ResourceKind, release: F)
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        info!(step = %step, "teardown step started");
        let outcome = match tokio::time::timeout(self.step_timeout, release).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TeardownError::Failed(e)),
            Err(_) => Err(TeardownError::TimedOut(self.step_timeout)),
        };
        match &outcome {
            Ok(()) => info!(step = %step, "teardown step finished"),
            Err(e) => error!(step = %step, error = %e, "teardown step failed"),
        }
        report.record(step, outcome);
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;
    use crate::persistence::MockPersistence;
    use crate::server::listener::ListenerHandle;
    use crate::webhooks::{ManagerError, MockSubscriptionManager};
    use std::sync::{Arc, Mutex};

    fn listener(name: &'static str, log: &CallLog, behaviour: Behaviour) -> Box<FakeListener> {
        Box::new(FakeListener {
            name,
            log: Arc::clone(log),
            behaviour,
        })
    }

    fn persistence(log: &CallLog, fail: bool) -> Arc<MockPersistence> {
        let log = Arc::clone(log);
        let mut db = MockPersistence::new();
        db.expect_close().times(1).returning(move || {
            log.lock().unwrap().push("close persistence".into());
            if fail {
                anyhow::bail!("database is locked");
            }
            Ok(())
        });
        Arc::new(db)
    }

    fn manager(log: &CallLog, fail: bool) -> Arc<MockSubscriptionManager> {
        let log = Arc::clone(log);
        let mut manager = MockSubscriptionManager::new();
        manager.expect_destroy().times(1).returning(move || {
            log.lock().unwrap().push("destroy manager".into());
            if fail {
                return Err(ManagerError::Unsubscribe {
                    failed: vec!["sub-1".into()],
                });
            }
            Ok(())
        });
        Arc::new(manager)
    }

    fn resources(log: &CallLog, fail_persistence: bool, with_tls: bool) -> AcquiredResources {
        AcquiredResources {
            persistence: Some(persistence(log, fail_persistence)),
            manager: Some(manager(log, false)),
            plain_listener: Some(listener("plain", log, Behaviour::Succeed)),
            encrypted_listener: with_tls
                .then(|| listener("encrypted", log, Behaviour::Succeed) as Box<dyn ListenerHandle>),
        }
    }

    fn sequencer() -> ShutdownSequencer {
        ShutdownSequencer::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn steps_run_in_order_and_exit_zero() {
        let log = CallLog::default();
        let report = sequencer().run(resources(&log, false, true)).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "close encrypted",
                "close plain",
                "close persistence",
                "destroy manager"
            ]
        );
        assert_eq!(
            report.steps(),
            vec![
                ResourceKind::EncryptedListener,
                ResourceKind::PlainListener,
                ResourceKind::Persistence,
                ResourceKind::SubscriptionManager
            ]
        );
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn failing_persistence_close_does_not_stop_later_steps() {
        let log = CallLog::default();
        let report = sequencer().run(resources(&log, true, true)).await;

        assert_eq!(log.lock().unwrap().len(), 4);
        assert_eq!(report.entries().len(), 4);
        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, ResourceKind::Persistence);
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn failing_first_and_last_steps_are_both_reported() {
        let log = CallLog::default();
        let resources = AcquiredResources {
            persistence: Some(persistence(&log, false)),
            manager: Some(manager(&log, true)),
            plain_listener: Some(listener("plain", &log, Behaviour::Succeed)),
            encrypted_listener: Some(listener("encrypted", &log, Behaviour::Fail)),
        };
        let report = sequencer().run(resources).await;

        let failed: Vec<_> = report.failures().into_iter().map(|(step, _)| step).collect();
        assert_eq!(
            failed,
            vec![ResourceKind::EncryptedListener, ResourceKind::SubscriptionManager]
        );
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn absent_encrypted_listener_is_skipped() {
        let log = CallLog::default();
        let report = sequencer().run(resources(&log, false, false)).await;
        assert_eq!(report.steps().first(), Some(&ResourceKind::PlainListener));
        assert_eq!(report.entries().len(), 3);
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn hung_step_times_out_and_sequence_continues() {
        let log = CallLog::default();
        let resources = AcquiredResources {
            persistence: Some(persistence(&log, false)),
            manager: Some(manager(&log, false)),
            plain_listener: Some(listener("plain", &log, Behaviour::Hang)),
            encrypted_listener: None,
        };
        let report = ShutdownSequencer::new(Duration::from_millis(50))
            .run(resources)
            .await;

        assert!(matches!(
            report.entries()[0],
            (ResourceKind::PlainListener, Err(TeardownError::TimedOut(_)))
        ));
        assert_eq!(report.entries().len(), 3);
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn trigger_fires_once() {
        let trigger = Arc::new(ShutdownTrigger::new());
        let fired = Arc::new(Mutex::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let trigger = Arc::clone(&trigger);
            let fired = Arc::clone(&fired);
            tasks.push(tokio::spawn(async move {
                if trigger.fire() {
                    *fired.lock().unwrap() += 1;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        trigger.wait().await;

        assert_eq!(*fired.lock().unwrap(), 1);
        assert_eq!(trigger.state(), TriggerState::ShuttingDown);
        trigger.finish();
        assert!(!trigger.fire());
        assert_eq!(trigger.state(), TriggerState::Terminated);
    }

    #[test]
    fn finish_before_fire_has_no_effect() {
        let trigger = ShutdownTrigger::new();
        trigger.finish();
        assert_eq!(trigger.state(), TriggerState::Active);
    }
}
