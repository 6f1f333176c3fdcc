//! Service-level health derivation.
//!
//! Combines the supervisor state, per-channel restart severities, and
//! error-log pressure into one structured, stable-shape document. Readiness
//! is `running && ok`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use guardian_model::{ChannelKind, RestartSeverity};

use crate::metrics::{MetricsRegistry, MetricsSnapshot, RetentionTotals};
use crate::supervisor::{ShutdownSummary, Supervisor, SupervisorState};

/// Errors counted before error pressure alone degrades the service; a
/// single fatal always does.
const ERROR_DEGRADE_THRESHOLD: u64 = 50;

pub const LOG_ERROR_COUNTER: &str = "log.error";
pub const LOG_FATAL_COUNTER: &str = "log.fatal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealth {
    Ok,
    Starting,
    Stopping,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub severity: RestartSeverity,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
    pub restarts: u64,
    pub watchdog_restarts: u64,
    pub watchdog_backoff_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindHealth {
    pub channels: BTreeMap<String, ChannelSummary>,
    pub degraded: Vec<String>,
    pub total_degraded: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelinesHealth {
    pub video: KindHealth,
    pub audio: KindHealth,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMetricsSummary {
    pub restarts: u64,
    pub watchdog_restarts: u64,
    pub watchdog_backoff_ms: u64,
    pub total_delay_ms: u64,
    pub transport_fallbacks: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub pipelines: PipelineMetricsSummary,
    pub retention: RetentionTotals,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimePipelines {
    pub video_channels: usize,
    pub audio_channels: usize,
    pub video_restarts: u64,
    pub audio_restarts: u64,
    pub video_degraded: usize,
    pub audio_degraded: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSummary {
    pub pipelines: RuntimePipelines,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationInfo {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<ShutdownSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: ServiceHealth,
    pub state: SupervisorState,
    pub uptime_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
    pub pipelines: PipelinesHealth,
    pub metrics_summary: MetricsSummary,
    pub runtime: RuntimeSummary,
    pub application: ApplicationInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessReport {
    pub ready: bool,
    pub status: ServiceHealth,
    pub state: SupervisorState,
}

/// Exit-code mapping for the CLI boundary: ok=0, degraded=1, starting=2,
/// stopping=3.
pub fn exit_code(status: ServiceHealth) -> i32 {
    match status {
        ServiceHealth::Ok => 0,
        ServiceHealth::Degraded => 1,
        ServiceHealth::Starting => 2,
        ServiceHealth::Stopping => 3,
    }
}

#[derive(Debug, Clone)]
pub struct HealthAggregator {
    supervisor: Arc<Supervisor>,
    metrics: Arc<MetricsRegistry>,
    app_name: String,
    app_version: String,
}

impl HealthAggregator {
    pub fn new(supervisor: Arc<Supervisor>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            supervisor,
            metrics,
            app_name: "guardian".into(),
            app_version: env!("CARGO_PKG_VERSION").into(),
        }
    }

    fn kind_health(snapshot: &MetricsSnapshot, kind: ChannelKind) -> KindHealth {
        let mut health = KindHealth::default();
        if let Some(metrics) = snapshot.pipelines.get(&kind) {
            for (channel, stats) in &metrics.channels {
                if stats.severity.severity != RestartSeverity::None {
                    health.degraded.push(channel.clone());
                }
                health.channels.insert(
                    channel.clone(),
                    ChannelSummary {
                        severity: stats.severity.severity,
                        reason: stats.severity.reason.clone(),
                        restarts: stats.restarts,
                        watchdog_restarts: stats.watchdog_restarts,
                        watchdog_backoff_ms: stats.watchdog_backoff_ms,
                        last_restart_at: stats.last_restart_at,
                    },
                );
            }
        }
        health.total_degraded = health.degraded.len();
        health
    }

    pub async fn report(&self) -> HealthReport {
        let snapshot = self.metrics.snapshot();
        let state = self.supervisor.state();
        let started_at = self.supervisor.started_at();
        let now = Utc::now();

        let video = Self::kind_health(&snapshot, ChannelKind::Video);
        let audio = Self::kind_health(&snapshot, ChannelKind::Audio);

        let errors = snapshot
            .counters
            .get(LOG_ERROR_COUNTER)
            .copied()
            .unwrap_or(0);
        let fatals = snapshot
            .counters
            .get(LOG_FATAL_COUNTER)
            .copied()
            .unwrap_or(0);
        let any_degraded = video.total_degraded + audio.total_degraded > 0
            || fatals > 0
            || errors >= ERROR_DEGRADE_THRESHOLD;

        let status = match state {
            SupervisorState::Idle | SupervisorState::Starting => ServiceHealth::Starting,
            SupervisorState::Stopping | SupervisorState::Stopped => ServiceHealth::Stopping,
            SupervisorState::Running => {
                if any_degraded {
                    ServiceHealth::Degraded
                } else {
                    ServiceHealth::Ok
                }
            }
        };

        let mut pipeline_totals = PipelineMetricsSummary::default();
        for metrics in snapshot.pipelines.values() {
            pipeline_totals.restarts += metrics.totals.restarts;
            pipeline_totals.watchdog_restarts += metrics.totals.watchdog_restarts;
            pipeline_totals.watchdog_backoff_ms += metrics.totals.watchdog_backoff_ms;
            pipeline_totals.total_delay_ms += metrics.totals.total_delay_ms;
            pipeline_totals.transport_fallbacks += metrics.totals.transport_fallbacks;
            pipeline_totals.last_restart_at = match (
                pipeline_totals.last_restart_at,
                metrics.totals.last_restart_at,
            ) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }

        let rows = self.supervisor.list_pipelines().await;
        let runtime = RuntimePipelines {
            video_channels: rows.iter().filter(|r| r.kind == ChannelKind::Video).count(),
            audio_channels: rows.iter().filter(|r| r.kind == ChannelKind::Audio).count(),
            video_restarts: snapshot
                .pipelines
                .get(&ChannelKind::Video)
                .map(|m| m.totals.restarts)
                .unwrap_or(0),
            audio_restarts: snapshot
                .pipelines
                .get(&ChannelKind::Audio)
                .map(|m| m.totals.restarts)
                .unwrap_or(0),
            video_degraded: video.total_degraded,
            audio_degraded: audio.total_degraded,
        };

        HealthReport {
            status,
            state,
            uptime_seconds: started_at
                .map(|at| (now - at).num_milliseconds() as f64 / 1000.0)
                .unwrap_or(0.0),
            started_at,
            timestamp: now,
            pipelines: PipelinesHealth { video, audio },
            metrics_summary: MetricsSummary {
                pipelines: pipeline_totals,
                retention: snapshot.retention.clone(),
            },
            runtime: RuntimeSummary { pipelines: runtime },
            application: ApplicationInfo {
                name: self.app_name.clone(),
                version: self.app_version.clone(),
                shutdown: self.supervisor.shutdown_summary().await,
            },
        }
    }

    pub async fn readiness(&self) -> ReadinessReport {
        let report = self.report().await;
        ReadinessReport {
            ready: report.status == ServiceHealth::Ok
                && report.state == SupervisorState::Running,
            status: report.status,
            state: report.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::metrics::RestartRecord;
    use crate::source::testing::{ScriptedLauncher, StreamScript};
    use crate::supervisor::SupervisorOptions;
    use guardian_config::ConfigManager;
    use guardian_config::models::{CameraConfig, ChannelOverrides, GuardianConfig};
    use guardian_model::RestartReason;
    use std::time::Duration;

    async fn running_fixture() -> (HealthAggregator, Arc<Supervisor>, Arc<MetricsRegistry>) {
        let mut config = GuardianConfig::default();
        config.video.width = 4;
        config.video.height = 4;
        config.video.cameras.push(CameraConfig {
            id: "front".into(),
            channel: Some("cam-a".into()),
            input: "rtsp://host/stream".into(),
            overrides: ChannelOverrides::default(),
        });

        let launcher = Arc::new(ScriptedLauncher::repeating(StreamScript::endless(
            vec![0u8; 16],
            Duration::from_millis(10),
        )));
        let metrics = Arc::new(MetricsRegistry::new());
        let bus = Arc::new(EventBus::default());
        let supervisor = Arc::new(Supervisor::new(
            Arc::new(ConfigManager::from_value(config).unwrap()),
            launcher,
            metrics.clone(),
            bus,
            SupervisorOptions::default(),
        ));
        supervisor.start().await.unwrap();
        (
            HealthAggregator::new(supervisor.clone(), metrics.clone()),
            supervisor,
            metrics,
        )
    }

    #[tokio::test]
    async fn running_and_quiet_is_ok_and_ready() {
        let (health, supervisor, _metrics) = running_fixture().await;
        let report = health.report().await;
        assert_eq!(report.status, ServiceHealth::Ok);
        assert_eq!(report.state, SupervisorState::Running);
        assert_eq!(report.runtime.pipelines.video_channels, 1);
        assert!(health.readiness().await.ready);
        assert_eq!(exit_code(report.status), 0);

        supervisor.stop(None, None).await;
        let report = health.report().await;
        assert_eq!(report.status, ServiceHealth::Stopping);
        assert!(!health.readiness().await.ready);
        assert_eq!(exit_code(report.status), 3);
    }

    #[tokio::test]
    async fn degraded_channel_degrades_the_service() {
        let (health, supervisor, metrics) = running_fixture().await;
        for attempt in 1..=3 {
            metrics.record_pipeline_restart(
                ChannelKind::Video,
                RestartReason::WatchdogTimeout,
                RestartRecord {
                    channel: "video:cam-a".into(),
                    attempt,
                    delay_ms: 1_000,
                    watchdog_backoff_ms: 1_000,
                    error_code: None,
                    exit_code: None,
                    signal: None,
                    timestamp: Utc::now(),
                },
            );
        }

        let report = health.report().await;
        assert_eq!(report.status, ServiceHealth::Degraded);
        assert_eq!(exit_code(report.status), 1);
        let video = &report.pipelines.video;
        assert_eq!(video.total_degraded, 1);
        assert_eq!(video.degraded, vec!["video:cam-a"]);
        let channel = &video.channels["video:cam-a"];
        assert_eq!(channel.severity, RestartSeverity::Warning);
        assert!(channel.reason.contains("watchdog restarts"));
        assert_eq!(report.metrics_summary.pipelines.watchdog_restarts, 3);

        supervisor.stop(None, None).await;
    }

    #[tokio::test]
    async fn fatal_log_pressure_degrades() {
        let (health, supervisor, metrics) = running_fixture().await;
        metrics.increment_counter(LOG_FATAL_COUNTER, 1);
        assert_eq!(health.report().await.status, ServiceHealth::Degraded);
        supervisor.stop(None, None).await;
    }

    #[tokio::test]
    async fn health_json_has_the_stable_shape() {
        let (health, supervisor, _metrics) = running_fixture().await;
        let report = health.report().await;
        let json = serde_json::to_value(&report).unwrap();

        for key in [
            "status",
            "state",
            "uptimeSeconds",
            "timestamp",
            "pipelines",
            "metricsSummary",
            "runtime",
            "application",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
        assert!(json["pipelines"]["video"]["channels"].is_object());
        assert!(json["pipelines"]["audio"]["totalDegraded"].is_number());
        assert!(json["metricsSummary"]["pipelines"]["restarts"].is_number());
        assert!(json["metricsSummary"]["retention"].is_object());
        assert!(json["runtime"]["pipelines"]["videoChannels"].is_number());
        assert_eq!(json["application"]["name"], "guardian");

        supervisor.stop(Some("test"), Some("SIGTERM")).await;
        let json = serde_json::to_value(health.report().await).unwrap();
        assert_eq!(json["application"]["shutdown"]["lastSignal"], "SIGTERM");
        assert!(json["application"]["shutdown"]["hooks"].is_array());
    }
}
