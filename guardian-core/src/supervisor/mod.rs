//! The channel supervisor: owns every pipeline's lifecycle.
//!
//! Startup is all-or-nothing (a failing pipeline tears down the ones already
//! started); hot reload diffs the new configuration per channel and touches
//! only what changed, rolling back to the previous pipeline set when a step
//! fails; shutdown stops pipelines in parallel under a deadline and then
//! runs the registered hooks in order, tolerating individual failures.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as TokioMutex;
use tokio::time::timeout;
use tracing::{error, info, warn};

use guardian_config::{ConfigManager, PipelineConfig, resolve_pipelines};
use guardian_model::{ChannelId, ChannelKind};

use crate::error::{CoreError, Result};
use crate::events::EventBus;
use crate::metrics::MetricsRegistry;
use crate::pipeline::ChannelPipeline;
use crate::source::SourceState;
use crate::source::launcher::DecoderLauncher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    /// Deadline for stopping all pipelines in parallel.
    pub shutdown_timeout: Duration,
    /// Per-hook execution budget.
    pub hook_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            hook_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookStatus {
    Ok,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookResult {
    pub name: String,
    pub status: HookStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of the (single) shutdown, kept for health reporting and returned
/// to every caller of [`Supervisor::stop`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownSummary {
    pub last_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_signal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub duration_ms: u64,
    pub hooks: Vec<HookResult>,
}

/// What a hot reload changed, per channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub restarted: Vec<String>,
    pub updated: Vec<String>,
}

/// Inspection row for the CLI's list-pipelines call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineInfo {
    pub channel: String,
    pub kind: ChannelKind,
    pub state: SourceState,
    pub restarts: u64,
    pub severity: guardian_model::RestartSeverity,
}

type HookFn = Box<dyn Fn() -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

struct ShutdownHook {
    name: String,
    run: HookFn,
}

struct ShutdownRegistry {
    hooks: Vec<ShutdownHook>,
    summary: Option<ShutdownSummary>,
}

pub struct Supervisor {
    config: Arc<ConfigManager>,
    launcher: Arc<dyn DecoderLauncher>,
    metrics: Arc<MetricsRegistry>,
    bus: Arc<EventBus>,
    options: SupervisorOptions,
    pipelines: TokioMutex<BTreeMap<String, Arc<ChannelPipeline>>>,
    state: StdRwLock<SupervisorState>,
    started_at: StdMutex<Option<DateTime<Utc>>>,
    shutdown: TokioMutex<ShutdownRegistry>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state())
            .finish()
    }
}

impl Supervisor {
    pub fn new(
        config: Arc<ConfigManager>,
        launcher: Arc<dyn DecoderLauncher>,
        metrics: Arc<MetricsRegistry>,
        bus: Arc<EventBus>,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            config,
            launcher,
            metrics,
            bus,
            options,
            pipelines: TokioMutex::new(BTreeMap::new()),
            state: StdRwLock::new(SupervisorState::Idle),
            started_at: StdMutex::new(None),
            shutdown: TokioMutex::new(ShutdownRegistry {
                hooks: Vec::new(),
                summary: None,
            }),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: SupervisorState) {
        *self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
        self.metrics
            .set_gauge("supervisor.state", state_gauge(next));
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self
            .started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn build_pipeline(&self, config: PipelineConfig) -> Arc<ChannelPipeline> {
        Arc::new(ChannelPipeline::new(
            config,
            self.launcher.clone(),
            self.metrics.clone(),
            self.bus.clone(),
        ))
    }

    /// Validate the current configuration, build every declared pipeline,
    /// and start them. A failure aborts the whole start and tears down the
    /// pipelines that already came up.
    pub async fn start(&self) -> Result<()> {
        match self.state() {
            SupervisorState::Idle | SupervisorState::Stopped => {}
            state => return Err(CoreError::Internal(format!("cannot start while {}", state.as_str()))),
        }
        self.set_state(SupervisorState::Starting);
        let started = std::time::Instant::now();

        let configs = resolve_pipelines(&self.config.current())?;
        let mut pipelines = self.pipelines.lock().await;
        let mut started_channels: Vec<String> = Vec::new();

        for config in configs {
            let canonical = config.channel.canonical();
            let pipeline = self.build_pipeline(config);
            match pipeline.start().await {
                Ok(()) => {
                    info!(channel = %canonical, "pipeline started");
                    pipelines.insert(canonical.clone(), pipeline);
                    started_channels.push(canonical);
                }
                Err(err) => {
                    error!(channel = %canonical, error = %err, "pipeline failed to start, aborting startup");
                    for channel in &started_channels {
                        if let Some(existing) = pipelines.remove(channel) {
                            existing.stop().await;
                        }
                    }
                    self.set_state(SupervisorState::Stopped);
                    return Err(err);
                }
            }
        }
        drop(pipelines);

        let elapsed = started.elapsed();
        self.metrics
            .observe_latency("supervisor.startupMs", elapsed.as_secs_f64() * 1000.0);
        *self
            .started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Utc::now());
        self.set_state(SupervisorState::Running);
        info!(
            channels = started_channels.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "supervisor running"
        );
        Ok(())
    }

    /// Apply the configuration currently held by the [`ConfigManager`],
    /// touching only the channels whose resolved config changed. On failure
    /// the previous pipeline set is restored and the supervisor keeps
    /// running.
    pub async fn apply_reload(&self) -> Result<ReloadSummary> {
        if self.state() != SupervisorState::Running {
            return Err(CoreError::NotRunning(self.state().as_str().into()));
        }

        let new_configs: BTreeMap<String, PipelineConfig> =
            resolve_pipelines(&self.config.current())?
                .into_iter()
                .map(|config| (config.channel.canonical(), config))
                .collect();

        let mut pipelines = self.pipelines.lock().await;
        let mut summary = ReloadSummary::default();

        // Undo log for rollback: configs of everything we remove or mutate.
        let mut removed_configs: Vec<PipelineConfig> = Vec::new();
        let mut mutated_configs: Vec<(String, PipelineConfig)> = Vec::new();
        let mut outcome: Result<()> = Ok(());

        let existing: Vec<String> = pipelines.keys().cloned().collect();
        for channel in existing {
            if !new_configs.contains_key(&channel) {
                if let Some(pipeline) = pipelines.remove(&channel) {
                    removed_configs.push(pipeline.config().await);
                    pipeline.stop().await;
                    summary.removed.push(channel.clone());
                    info!(channel = %channel, "pipeline removed by reload");
                }
            }
        }

        for (channel, next) in &new_configs {
            match pipelines.get(channel).cloned() {
                None => {
                    let pipeline = self.build_pipeline(next.clone());
                    match pipeline.start().await {
                        Ok(()) => {
                            pipelines.insert(channel.clone(), pipeline);
                            summary.added.push(channel.clone());
                            info!(channel = %channel, "pipeline added by reload");
                        }
                        Err(err) => {
                            error!(channel = %channel, error = %err, "reload failed to start new pipeline");
                            outcome = Err(err);
                            break;
                        }
                    }
                }
                Some(pipeline) => {
                    let current = pipeline.config().await;
                    if current == *next {
                        continue;
                    }
                    mutated_configs.push((channel.clone(), current));
                    match pipeline.update_options(next.clone()).await {
                        Ok(result) if result.restart_required => {
                            summary.restarted.push(channel.clone());
                            info!(channel = %channel, "pipeline restarted by reload");
                        }
                        Ok(_) => {
                            summary.updated.push(channel.clone());
                            info!(channel = %channel, "pipeline options updated by reload");
                        }
                        Err(err) => {
                            error!(channel = %channel, error = %err, "reload failed to update pipeline");
                            outcome = Err(err);
                            break;
                        }
                    }
                }
            }
        }

        if let Err(err) = outcome {
            // Roll back: drop what reload added, restore what it removed or
            // mutated, and keep serving with the previous configuration.
            for channel in &summary.added {
                if let Some(pipeline) = pipelines.remove(channel) {
                    pipeline.stop().await;
                }
            }
            for (channel, old_config) in mutated_configs {
                if let Some(pipeline) = pipelines.get(&channel)
                    && let Err(rollback_err) = pipeline.update_options(old_config).await
                {
                    error!(channel = %channel, error = %rollback_err, "rollback update failed");
                }
            }
            for old_config in removed_configs {
                let channel = old_config.channel.canonical();
                let pipeline = self.build_pipeline(old_config);
                if let Err(rollback_err) = pipeline.start().await {
                    error!(channel = %channel, error = %rollback_err, "rollback restart failed");
                } else {
                    pipelines.insert(channel, pipeline);
                }
            }
            warn!("configuration rollback applied");
            self.metrics.increment_counter("supervisor.configRollbacks", 1);
            return Err(err);
        }

        self.metrics.increment_counter("supervisor.configReloads", 1);
        info!(
            added = summary.added.len(),
            removed = summary.removed.len(),
            restarted = summary.restarted.len(),
            updated = summary.updated.len(),
            "configuration reload applied"
        );
        Ok(summary)
    }

    /// Find a pipeline by canonical or raw channel id. Raw names are probed
    /// as `video:` first, then `audio:`.
    async fn find_pipeline(&self, raw: &str) -> Option<Arc<ChannelPipeline>> {
        let pipelines = self.pipelines.lock().await;
        for kind in [ChannelKind::Video, ChannelKind::Audio] {
            let canonical = ChannelId::parse(raw, kind).canonical();
            if let Some(pipeline) = pipelines.get(&canonical) {
                return Some(pipeline.clone());
            }
        }
        None
    }

    /// True iff the channel exists, its breaker was open, and it is now
    /// closed (a restart is underway).
    pub async fn reset_circuit_breaker(&self, channel: &str) -> bool {
        match self.find_pipeline(channel).await {
            Some(pipeline) => match pipeline.reset_circuit_breaker().await {
                Ok(was_open) => {
                    if was_open {
                        self.metrics.increment_counter("supervisor.circuitResets", 1);
                        let canonical = pipeline.channel().canonical();
                        self.metrics.record_pipeline_restart(
                            pipeline.kind(),
                            guardian_model::RestartReason::ManualCircuitReset,
                            crate::metrics::RestartRecord {
                                channel: canonical,
                                attempt: pipeline.restart_stats().total.saturating_add(1)
                                    as u32,
                                delay_ms: 0,
                                watchdog_backoff_ms: 0,
                                error_code: None,
                                exit_code: None,
                                signal: None,
                                timestamp: Utc::now(),
                            },
                        );
                    }
                    was_open
                }
                Err(err) => {
                    error!(channel = %channel, error = %err, "circuit reset restart failed");
                    false
                }
            },
            None => {
                warn!(channel = %channel, "circuit reset for unknown channel");
                false
            }
        }
    }

    /// Video only: re-arm the channel's transport ladder at its head.
    pub async fn reset_transport_fallback(&self, channel: &str) -> bool {
        match self.find_pipeline(channel).await {
            Some(pipeline) => pipeline.reset_transport_fallback().await,
            None => false,
        }
    }

    /// Clear a channel's health severity in metrics and in the pipeline.
    pub async fn reset_channel_health(&self, channel: &str) -> bool {
        match self.find_pipeline(channel).await {
            Some(pipeline) => pipeline.reset_channel_health(),
            None => false,
        }
    }

    /// Register a named shutdown hook; hooks run in registration order.
    pub async fn register_shutdown_hook<F, Fut>(&self, name: &str, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        let mut shutdown = self.shutdown.lock().await;
        shutdown.hooks.push(ShutdownHook {
            name: name.to_string(),
            run: Box::new(move || Box::pin(hook())),
        });
    }

    /// Stop everything. Idempotent: concurrent and subsequent calls observe
    /// the one shutdown and return its summary.
    pub async fn stop(&self, reason: Option<&str>, signal: Option<&str>) -> ShutdownSummary {
        let mut shutdown = self.shutdown.lock().await;
        if let Some(summary) = &shutdown.summary {
            return summary.clone();
        }

        self.set_state(SupervisorState::Stopping);
        let started = std::time::Instant::now();
        let mut last_error = None;

        let pipelines: Vec<Arc<ChannelPipeline>> = {
            let mut map = self.pipelines.lock().await;
            std::mem::take(&mut *map).into_values().collect()
        };
        let stop_all = futures::future::join_all(pipelines.iter().map(|p| p.stop()));
        if timeout(self.options.shutdown_timeout, stop_all).await.is_err() {
            error!("pipeline shutdown exceeded deadline");
            last_error = Some("pipeline shutdown exceeded deadline".to_string());
        }

        let mut hook_results = Vec::with_capacity(shutdown.hooks.len());
        for hook in &shutdown.hooks {
            let result = match timeout(self.options.hook_timeout, (hook.run)()).await {
                Ok(Ok(())) => HookResult {
                    name: hook.name.clone(),
                    status: HookStatus::Ok,
                    error: None,
                },
                Ok(Err(message)) => {
                    error!(hook = %hook.name, error = %message, "shutdown hook failed");
                    HookResult {
                        name: hook.name.clone(),
                        status: HookStatus::Error,
                        error: Some(message),
                    }
                }
                Err(_) => {
                    error!(hook = %hook.name, "shutdown hook exceeded its budget");
                    HookResult {
                        name: hook.name.clone(),
                        status: HookStatus::Timeout,
                        error: Some("hook timed out".into()),
                    }
                }
            };
            hook_results.push(result);
        }

        let elapsed = started.elapsed();
        self.metrics
            .observe_latency("supervisor.shutdownMs", elapsed.as_secs_f64() * 1000.0);
        self.set_state(SupervisorState::Stopped);

        let summary = ShutdownSummary {
            last_at: Utc::now(),
            last_reason: reason.map(str::to_string),
            last_signal: signal.map(str::to_string),
            last_error,
            duration_ms: elapsed.as_millis() as u64,
            hooks: hook_results,
        };
        shutdown.summary = Some(summary.clone());
        info!(duration_ms = summary.duration_ms, "supervisor stopped");
        summary
    }

    pub async fn shutdown_summary(&self) -> Option<ShutdownSummary> {
        self.shutdown.lock().await.summary.clone()
    }

    pub async fn list_pipelines(&self) -> Vec<PipelineInfo> {
        let pipelines = self.pipelines.lock().await;
        let mut rows = Vec::with_capacity(pipelines.len());
        for (channel, pipeline) in pipelines.iter() {
            let stats = pipeline.restart_stats();
            rows.push(PipelineInfo {
                channel: channel.clone(),
                kind: pipeline.kind(),
                state: pipeline.source_state().await,
                restarts: stats.total,
                severity: stats.severity.severity,
            });
        }
        rows
    }

    pub async fn pipeline_count(&self) -> usize {
        self.pipelines.lock().await.len()
    }
}

fn state_gauge(state: SupervisorState) -> f64 {
    match state {
        SupervisorState::Idle => 0.0,
        SupervisorState::Starting => 1.0,
        SupervisorState::Running => 2.0,
        SupervisorState::Stopping => 3.0,
        SupervisorState::Stopped => 4.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::{ScriptedLauncher, StreamScript};
    use guardian_config::models::{CameraConfig, ChannelOverrides, GuardianConfig, MotionOverrides};
    use std::time::Duration;

    fn two_camera_config() -> GuardianConfig {
        let mut config = GuardianConfig::default();
        config.video.width = 4;
        config.video.height = 4;
        for (id, channel, input) in [
            ("front", "cam-1", "rtsp://host/stream-1"),
            ("back", "cam-2", "rtsp://host/stream-2"),
        ] {
            config.video.cameras.push(CameraConfig {
                id: id.into(),
                channel: Some(channel.into()),
                input: input.into(),
                overrides: ChannelOverrides::default(),
            });
        }
        config
    }

    fn fixture(config: GuardianConfig) -> (Arc<Supervisor>, Arc<ScriptedLauncher>) {
        let launcher = Arc::new(ScriptedLauncher::repeating(StreamScript::endless(
            vec![0u8; 16],
            Duration::from_millis(10),
        )));
        let manager = Arc::new(ConfigManager::from_value(config).unwrap());
        let metrics = Arc::new(MetricsRegistry::new());
        let bus = Arc::new(EventBus::default());
        let supervisor = Arc::new(Supervisor::new(
            manager,
            launcher.clone(),
            metrics,
            bus,
            SupervisorOptions {
                shutdown_timeout: Duration::from_secs(5),
                hook_timeout: Duration::from_millis(200),
            },
        ));
        (supervisor, launcher)
    }

    #[tokio::test]
    async fn start_brings_up_every_channel() {
        let (supervisor, launcher) = fixture(two_camera_config());
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Running);
        assert_eq!(supervisor.pipeline_count().await, 2);
        assert_eq!(launcher.launches(), 2);

        let rows = supervisor.list_pipelines().await;
        let channels: Vec<&str> = rows.iter().map(|r| r.channel.as_str()).collect();
        assert_eq!(channels, vec!["video:cam-1", "video:cam-2"]);

        supervisor.stop(Some("test"), None).await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn failed_start_tears_down_started_pipelines() {
        let (supervisor, launcher) = fixture(two_camera_config());
        launcher.fail_for_input("rtsp://host/stream-2");

        assert!(supervisor.start().await.is_err());
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert_eq!(supervisor.pipeline_count().await, 0);
    }

    #[tokio::test]
    async fn reload_touches_only_changed_channels() {
        let (supervisor, launcher) = fixture(two_camera_config());
        supervisor.start().await.unwrap();
        assert_eq!(launcher.launches(), 2);

        // Detector-only change on cam-1: no new decoder spawn anywhere.
        let mut detector_change = two_camera_config();
        detector_change.video.cameras[0].overrides.motion = Some(MotionOverrides {
            area_threshold: Some(6.0),
            ..MotionOverrides::default()
        });
        supervisor
            .config
            .replace(detector_change)
            .unwrap();
        let summary = supervisor.apply_reload().await.unwrap();
        assert_eq!(summary.updated, vec!["video:cam-1"]);
        assert!(summary.restarted.is_empty());
        assert!(summary.added.is_empty());
        assert!(summary.removed.is_empty());
        assert_eq!(launcher.launches(), 2, "no media source was replaced");

        // Source URI change on cam-1: its source is replaced, cam-2 is not.
        let mut uri_change = two_camera_config();
        uri_change.video.cameras[0].input = "rtsp://host/stream-1b".into();
        supervisor.config.replace(uri_change).unwrap();
        let summary = supervisor.apply_reload().await.unwrap();
        assert_eq!(summary.restarted, vec!["video:cam-1"]);
        assert_eq!(launcher.launches(), 3);
        let last = launcher.specs().last().unwrap().clone();
        assert_eq!(last.config.input, "rtsp://host/stream-1b");
        assert_eq!(last.channel, "video:cam-1");

        supervisor.stop(None, None).await;
    }

    #[tokio::test]
    async fn failed_reload_rolls_back() {
        let (supervisor, launcher) = fixture(two_camera_config());
        supervisor.start().await.unwrap();

        let mut with_new_channel = two_camera_config();
        with_new_channel.video.cameras.push(CameraConfig {
            id: "garage".into(),
            channel: Some("cam-3".into()),
            input: "rtsp://host/broken".into(),
            overrides: ChannelOverrides::default(),
        });
        launcher.fail_for_input("rtsp://host/broken");
        supervisor.config.replace(with_new_channel).unwrap();

        assert!(supervisor.apply_reload().await.is_err());
        // Previous pipeline set restored; supervisor still running.
        assert_eq!(supervisor.state(), SupervisorState::Running);
        assert_eq!(supervisor.pipeline_count().await, 2);
        let rows = supervisor.list_pipelines().await;
        assert!(rows.iter().all(|r| r.channel != "video:cam-3"));

        supervisor.stop(None, None).await;
    }

    #[tokio::test]
    async fn resets_accept_raw_and_canonical_ids() {
        let (supervisor, _launcher) = fixture(two_camera_config());
        supervisor.start().await.unwrap();

        // Nothing is open or fallen back, so resets report false, but the
        // channel resolution itself must succeed for raw and canonical forms.
        assert!(!supervisor.reset_circuit_breaker("cam-1").await);
        assert!(!supervisor.reset_circuit_breaker("video:cam-1").await);
        assert!(!supervisor.reset_circuit_breaker("video:nope").await);
        assert!(!supervisor.reset_transport_fallback("cam-2").await);
        assert!(!supervisor.reset_channel_health("cam-2").await);
        assert!(!supervisor.reset_channel_health("audio:cam-2").await);

        supervisor.stop(None, None).await;
    }

    #[tokio::test]
    async fn shutdown_runs_hooks_in_order_and_tolerates_failures() {
        let (supervisor, _launcher) = fixture(two_camera_config());
        supervisor.start().await.unwrap();

        supervisor
            .register_shutdown_hook("flush-events", || async { Ok(()) })
            .await;
        supervisor
            .register_shutdown_hook("close-store", || async {
                Err("store already closed".to_string())
            })
            .await;
        supervisor
            .register_shutdown_hook("slow-hook", || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        let summary = supervisor.stop(Some("shutdown requested"), Some("SIGTERM")).await;
        assert_eq!(summary.last_reason.as_deref(), Some("shutdown requested"));
        assert_eq!(summary.last_signal.as_deref(), Some("SIGTERM"));
        let names: Vec<&str> = summary.hooks.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["flush-events", "close-store", "slow-hook"]);
        assert_eq!(summary.hooks[0].status, HookStatus::Ok);
        assert_eq!(summary.hooks[1].status, HookStatus::Error);
        assert_eq!(summary.hooks[2].status, HookStatus::Timeout);

        // Second stop observes the same shutdown.
        let again = supervisor.stop(Some("other"), None).await;
        assert_eq!(again.last_reason.as_deref(), Some("shutdown requested"));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }
}
