//! `streamhooks`: binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the telemetry pipeline (tracing + optional OTLP).
//! 3. Run the startup sequencer: persistence, routes, subscription manager,
//!    TLS material, listeners, activation.
//! 4. Wait for SIGINT/SIGTERM.
//! 5. Run the shutdown sequencer and exit with its code.

mod auth;
mod config;
mod lifecycle;
mod persistence;
mod platform;
mod server;
mod telemetry;
mod webhooks;

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use config::Config;
use lifecycle::{
    signals, LifecyclePhase, PhaseTracker, PlatformSubsystems, ShutdownSequencer,
    ShutdownTrigger, Startup,
};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(&cfg.log_level, cfg.otel_exporter_otlp_endpoint.as_deref())?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        http_port = cfg.http_port,
        https_port = cfg.https_port,
        "streamhooks starting"
    );

    // -----------------------------------------------------------------------
    // 3. Startup
    // -----------------------------------------------------------------------
    let phase = Arc::new(PhaseTracker::new());
    let subsystems = PlatformSubsystems::new(&cfg)?;
    let running = match Startup::new(&cfg, Arc::clone(&phase)).run(&subsystems).await {
        Ok(running) => running,
        Err(e) => {
            error!(error = %e, "startup failed");
            telemetry::shutdown_telemetry();
            std::process::exit(1);
        }
    };

    // -----------------------------------------------------------------------
    // 4. Wait for a termination signal
    // -----------------------------------------------------------------------
    let trigger = Arc::new(ShutdownTrigger::new());
    let signal_trigger = Arc::clone(&trigger);
    tokio::spawn(async move {
        if let Err(e) = signals::forward(signal_trigger).await {
            error!(error = %format!("{e:#}"), "signal handling unavailable");
        }
    });
    trigger.wait().await;

    // -----------------------------------------------------------------------
    // 5. Shutdown
    // -----------------------------------------------------------------------
    info!(
        phase = %phase.current(),
        http = ?running.plain_addr(),
        https = ?running.encrypted_addr(),
        activation = running.activation().borrow().label(),
        "shutdown requested"
    );
    if let Err(e) = phase.advance(LifecyclePhase::ShuttingDown) {
        warn!(error = %e, "unexpected lifecycle phase at shutdown");
    }
    let report = running
        .shutdown(&ShutdownSequencer::new(cfg.shutdown_step_timeout()))
        .await;
    trigger.finish();
    if let Err(e) = phase.advance(LifecyclePhase::Terminated) {
        warn!(error = %e, "unexpected lifecycle phase at exit");
    }

    let code = report.exit_code();
    let uptime = phase
        .history()
        .iter()
        .find(|(p, _)| *p == LifecyclePhase::Active)
        .map(|(_, entered)| entered.elapsed());
    info!(
        exit_code = code,
        steps = ?report.steps(),
        uptime = ?uptime,
        "streamhooks stopped"
    );
    telemetry::shutdown_telemetry();
    std::process::exit(code);
}
