//! Termination signals → [`ShutdownTrigger`].

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::ShutdownTrigger;

/// Fire `trigger` on every SIGINT or SIGTERM (Ctrl-C elsewhere). Only the
/// first signal starts shutdown; later ones are logged and ignored.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be installed.
pub async fn forward(trigger: Arc<ShutdownTrigger>) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt =
            signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        loop {
            let name = tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
            };
            deliver(&trigger, name);
        }
    }

    #[cfg(not(unix))]
    loop {
        tokio::signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")?;
        deliver(&trigger, "Ctrl-C");
    }
}

fn deliver(trigger: &ShutdownTrigger, name: &str) {
    if trigger.fire() {
        info!(signal = name, "termination signal received, shutting down");
    } else {
        warn!(
            signal = name,
            state = ?trigger.state(),
            "shutdown already in progress; signal ignored"
        );
    }
}
