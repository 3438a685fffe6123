//! Message and error handlers fed by the manager's event channel.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use common::protocol::WebhookMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ManagerError, ManagerEvent};

/// Called for every accepted notification.
pub type MessageHandler = Arc<dyn Fn(WebhookMessage) + Send + Sync>;

/// Called for every error the manager reports.
pub type ErrorHandler = Arc<dyn Fn(ManagerError) + Send + Sync>;

/// Number of messages kept by [`MessageLog`].
pub const MESSAGE_LOG_CAPACITY: usize = 50;

/// Bounded ring of the most recent notifications, newest last.
#[derive(Clone, Debug)]
pub struct MessageLog {
    inner: Arc<Mutex<VecDeque<WebhookMessage>>>,
    capacity: usize,
}

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn record(&self, message: WebhookMessage) {
        if let Ok(mut ring) = self.inner.lock() {
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(message);
        }
    }

    pub fn recent(&self) -> Vec<WebhookMessage> {
        self.inner
            .lock()
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new(MESSAGE_LOG_CAPACITY)
    }
}

/// Log each notification and keep it in `log`.
pub fn message_handler(log: MessageLog) -> MessageHandler {
    Arc::new(move |message: WebhookMessage| {
        info!(
            subscription = %message.subscription_id,
            topic = %message.topic,
            "webhook message received"
        );
        log.record(message);
    })
}

/// Log manager errors; they never stop the process.
pub fn error_handler() -> ErrorHandler {
    Arc::new(|error: ManagerError| {
        warn!(error = %error, "subscription manager error");
    })
}

/// Drain `events` on a dedicated task until every sender is gone.
pub fn spawn_event_pump(
    mut events: mpsc::Receiver<ManagerEvent>,
    on_message: MessageHandler,
    on_error: ErrorHandler,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ManagerEvent::Message(message) => on_message(message),
                ManagerEvent::Error(error) => on_error(error),
            }
        }
        debug!("manager event channel closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(n: usize) -> WebhookMessage {
        WebhookMessage {
            subscription_id: format!("sub-{n}"),
            topic: "topic".into(),
            payload: serde_json::json!({ "n": n }),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn log_keeps_only_the_newest_entries() {
        let log = MessageLog::new(2);
        for n in 0..3 {
            log.record(message(n));
        }
        let ids: Vec<_> = log.recent().into_iter().map(|m| m.subscription_id).collect();
        assert_eq!(ids, vec!["sub-1", "sub-2"]);
    }

    #[tokio::test]
    async fn pump_dispatches_by_kind_and_ends_with_the_channel() {
        let (tx, rx) = mpsc::channel(8);
        let log = MessageLog::default();
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_seen = Arc::clone(&errors);

        let pump = spawn_event_pump(
            rx,
            message_handler(log.clone()),
            Arc::new(move |_| {
                errors_seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tx.send(ManagerEvent::Message(message(1))).await.unwrap();
        tx.send(ManagerEvent::Error(ManagerError::Destroyed)).await.unwrap();
        tx.send(ManagerEvent::Message(message(2))).await.unwrap();
        drop(tx);
        pump.await.unwrap();

        assert_eq!(log.recent().len(), 2);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }
}
