//! # Guardian Server
//!
//! Surveillance daemon: ingests live video and audio from the configured
//! cameras and microphones, runs per-channel motion/light/audio-anomaly
//! detectors, and publishes annotated events.
//!
//! This binary is deliberately thin. It loads and validates configuration,
//! bootstraps tracing, hands everything to the channel supervisor in
//! `guardian-core`, and translates process signals:
//!
//! - SIGINT / SIGTERM: coordinated shutdown (pipelines, then hooks)
//! - SIGHUP: hot configuration reload with rollback on failure

mod log_counter;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use guardian_config::ConfigManager;
use guardian_core::source::launcher::FfmpegLauncher;
use guardian_core::{
    EventBus, HealthAggregator, MetricsRegistry, Supervisor, SupervisorOptions,
};

/// Command line arguments for the Guardian daemon
#[derive(Parser, Debug)]
#[command(name = "guardian-server")]
#[command(about = "Surveillance daemon with per-channel adaptive detectors")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "GUARDIAN_CONFIG")]
    config: PathBuf,

    /// Log filter override (defaults to the configured logging level)
    #[arg(long, env = "GUARDIAN_LOG")]
    log: Option<String>,

    /// Grace period for stopping all pipelines on shutdown
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    shutdown_grace: Duration,

    /// Per-hook budget when running shutdown hooks
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    hook_grace: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let manager = Arc::new(
        ConfigManager::load(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?,
    );
    let config = manager.current();

    let metrics = Arc::new(MetricsRegistry::new());
    let filter = args
        .log
        .clone()
        .unwrap_or_else(|| format!("guardian_server={0},guardian_core={0},guardian_config={0}", config.logging.level));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(log_counter::LogCounterLayer::new(metrics.clone()))
        .init();

    info!(config = %args.config.display(), "configuration loaded");

    let bus = Arc::new(EventBus::default());
    let supervisor = Arc::new(Supervisor::new(
        manager.clone(),
        Arc::new(FfmpegLauncher),
        metrics.clone(),
        bus.clone(),
        SupervisorOptions {
            shutdown_timeout: args.shutdown_grace,
            hook_timeout: args.hook_grace,
        },
    ));
    let health = HealthAggregator::new(supervisor.clone(), metrics.clone());

    // External sinks (store, API) subscribe to the bus; until they attach,
    // detections are at least visible in the log.
    let mut event_rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => info!(
                    detector = %event.detector,
                    source = %event.source,
                    severity = event.severity.as_str(),
                    message = %event.message,
                    "detection event"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event log sink lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    supervisor.start().await.context("supervisor startup failed")?;

    let (reason, signal_name) = wait_for_shutdown(&manager, &supervisor).await;
    info!(reason = %reason, "shutting down");
    let summary = supervisor.stop(Some(&reason), signal_name.as_deref()).await;
    if let Some(err) = &summary.last_error {
        warn!(error = %err, "shutdown finished with errors");
    }
    match serde_json::to_string(&summary) {
        Ok(json) => info!(summary = %json, "shutdown summary"),
        Err(err) => warn!(error = %err, "shutdown summary not serializable"),
    }

    let readiness = health.readiness().await;
    info!(
        duration_ms = summary.duration_ms,
        status = ?readiness.status,
        "guardian stopped"
    );
    Ok(())
}

/// Block until a terminating signal arrives, servicing SIGHUP reloads in the
/// meantime. Returns the shutdown reason and signal name.
async fn wait_for_shutdown(
    manager: &Arc<ConfigManager>,
    supervisor: &Arc<Supervisor>,
) -> (String, Option<String>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return ("interrupt".into(), Some("SIGINT".into()));
            }
        };
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "cannot install SIGHUP handler");
                let _ = tokio::signal::ctrl_c().await;
                return ("interrupt".into(), Some("SIGINT".into()));
            }
        };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    return ("interrupt".into(), Some("SIGINT".into()));
                }
                _ = sigterm.recv() => {
                    return ("termination requested".into(), Some("SIGTERM".into()));
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received, reloading configuration");
                    match manager.reload() {
                        Ok(_) => match supervisor.apply_reload().await {
                            Ok(summary) => info!(
                                added = summary.added.len(),
                                removed = summary.removed.len(),
                                restarted = summary.restarted.len(),
                                updated = summary.updated.len(),
                                "reload applied"
                            ),
                            Err(err) => {
                                error!(error = %err, "reload failed, previous configuration kept")
                            }
                        },
                        Err(err) => {
                            error!(error = %err, "configuration reload rejected")
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        let _ = (manager, supervisor);
        ("interrupt".into(), Some("SIGINT".into()))
    }
}
