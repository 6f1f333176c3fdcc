//! Process-wide metrics sink.
//!
//! One registry per process, shared by the supervisor, every media source,
//! and every detector through an explicit `Arc` handle. Mutations are atomic
//! per call behind a readers-writer lock; [`MetricsRegistry::snapshot`]
//! returns a deep, serializable copy with no shared references.
//!
//! Warning-class records (severity changes, retention, transport fallback,
//! suppression) additionally fan out to registered listeners. A panicking
//! listener is isolated and counted, never propagated to the producer.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use guardian_model::{
    ChannelKind, DetectorKind, RestartEvent, RestartReason, RestartSeverity, SeverityAssessment,
    SeverityThresholds, TransportFallbackEvent, classify_restart_severity,
};

pub const DEFAULT_RESTART_HISTORY_LIMIT: usize = 64;
pub const DEFAULT_WARNING_BUFFER_LIMIT: usize = 64;

/// Inputs to [`MetricsRegistry::record_pipeline_restart`], mirroring the
/// recover signal of a media source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartRecord {
    pub channel: String,
    pub attempt: u32,
    pub delay_ms: u64,
    pub watchdog_backoff_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionWarning {
    pub scope: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Totals populated by the (external) retention task; surfaced in health.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionTotals {
    pub runs: u64,
    pub files_deleted: u64,
    pub bytes_freed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

/// A detector reporting that its adaptive gate swallowed activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuppressionEvent {
    pub detector: DetectorKind,
    pub channel: String,
    pub reason: String,
    pub suppressed_frames: u64,
    pub timestamp: DateTime<Utc>,
}

/// Published to `on_warning` listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum WarningEvent {
    #[serde(rename_all = "camelCase")]
    SeverityChanged {
        kind: ChannelKind,
        channel: String,
        previous: RestartSeverity,
        assessment: SeverityAssessment,
    },
    Retention(RetentionWarning),
    TransportFallback(TransportFallbackEvent),
    Suppression(SuppressionEvent),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub last_ms: f64,
}

impl LatencyStats {
    fn observe(&mut self, ms: f64) {
        if self.count == 0 {
            self.min_ms = ms;
            self.max_ms = ms;
        } else {
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
        }
        self.count += 1;
        self.total_ms += ms;
        self.last_ms = ms;
    }
}

/// Per-channel restart view as kept by the registry (the pipeline keeps its
/// own richer `RestartStats`; this is the cross-process rollup).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPipelineStats {
    pub restarts: u64,
    pub by_reason: BTreeMap<RestartReason, u64>,
    pub total_delay_ms: u64,
    pub watchdog_restarts: u64,
    pub watchdog_backoff_ms: u64,
    pub severity: SeverityAssessment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTotals {
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
pub struct PipelineKindMetrics {
    pub channels: BTreeMap<String, ChannelPipelineStats>,
    pub totals: PipelineTotals,
}

#[derive(Debug, Default)]
struct MetricsInner {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
    latencies: BTreeMap<String, LatencyStats>,
    pipelines: BTreeMap<ChannelKind, PipelineKindMetrics>,
    restart_history: VecDeque<RestartEvent>,
    restart_history_dropped: u64,
    transport_fallbacks: VecDeque<TransportFallbackEvent>,
    transport_fallback_total: u64,
    last_transport_fallback: Option<TransportFallbackEvent>,
    retention_warnings: VecDeque<RetentionWarning>,
    retention_warning_total: u64,
    retention: RetentionTotals,
    suppressions: VecDeque<SuppressionEvent>,
    suppression_total: u64,
}

/// Deep, serializable copy of the registry state, taken atomically with
/// respect to any single mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub latencies: BTreeMap<String, LatencyStats>,
    pub pipelines: BTreeMap<ChannelKind, PipelineKindMetrics>,
    pub restart_history: Vec<RestartEvent>,
    pub restart_history_limit: usize,
    pub restart_history_dropped: u64,
    pub transport_fallbacks: Vec<TransportFallbackEvent>,
    pub transport_fallback_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transport_fallback: Option<TransportFallbackEvent>,
    pub retention_warnings: Vec<RetentionWarning>,
    pub retention_warning_total: u64,
    pub retention: RetentionTotals,
    pub suppressions: Vec<SuppressionEvent>,
    pub suppression_total: u64,
    pub listener_errors: u64,
    pub taken_at: DateTime<Utc>,
}

struct WarningListener {
    id: u64,
    callback: Box<dyn Fn(&WarningEvent) + Send + Sync>,
    errors: u64,
}

impl std::fmt::Debug for WarningListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarningListener")
            .field("id", &self.id)
            .field("errors", &self.errors)
            .finish()
    }
}

/// Process-wide sink for counters, gauges, latency summaries, per-channel
/// pipeline statistics, and warning-class events.
#[derive(Debug)]
pub struct MetricsRegistry {
    inner: RwLock<MetricsInner>,
    listeners: Mutex<Vec<WarningListener>>,
    next_listener_id: AtomicU64,
    listener_errors: AtomicU64,
    history_limit: usize,
    buffer_limit: usize,
    thresholds: SeverityThresholds,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_limits(
            DEFAULT_RESTART_HISTORY_LIMIT,
            DEFAULT_WARNING_BUFFER_LIMIT,
            SeverityThresholds::default(),
        )
    }

    pub fn with_limits(
        history_limit: usize,
        buffer_limit: usize,
        thresholds: SeverityThresholds,
    ) -> Self {
        Self {
            inner: RwLock::new(MetricsInner::default()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            listener_errors: AtomicU64::new(0),
            history_limit: history_limit.max(1),
            buffer_limit: buffer_limit.max(1),
            thresholds,
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MetricsInner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MetricsInner> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn increment_counter(&self, path: &str, n: u64) {
        let mut inner = self.write();
        *inner.counters.entry(path.to_string()).or_insert(0) += n;
    }

    pub fn counter(&self, path: &str) -> u64 {
        self.read().counters.get(path).copied().unwrap_or(0)
    }

    pub fn set_gauge(&self, path: &str, value: f64) {
        let mut inner = self.write();
        inner.gauges.insert(path.to_string(), value);
    }

    pub fn gauge(&self, path: &str) -> Option<f64> {
        self.read().gauges.get(path).copied()
    }

    pub fn observe_latency(&self, name: &str, ms: f64) {
        let mut inner = self.write();
        inner
            .latencies
            .entry(name.to_string())
            .or_default()
            .observe(ms);
    }

    /// Run `f`, recording its wall-clock duration under `name`.
    pub fn time<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let started = Instant::now();
        let result = f();
        self.observe_latency(name, started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    /// Record one pipeline restart: per-channel and global totals, bounded
    /// history, last-restart timestamp, and severity reclassification. Emits
    /// a warning event when the channel's severity changed.
    pub fn record_pipeline_restart(
        &self,
        kind: ChannelKind,
        reason: RestartReason,
        record: RestartRecord,
    ) {
        let event = RestartEvent {
            reason,
            attempt: record.attempt.max(1),
            delay_ms: record.delay_ms,
            watchdog_backoff_ms: record.watchdog_backoff_ms,
            channel: record.channel.clone(),
            timestamp: record.timestamp,
            error_code: record.error_code,
            exit_code: record.exit_code,
            signal: record.signal,
        };

        let mut warning = None;
        {
            let mut inner = self.write();
            let kind_metrics = inner.pipelines.entry(kind).or_default();
            let channel = kind_metrics
                .channels
                .entry(record.channel.clone())
                .or_default();

            channel.restarts += 1;
            *channel.by_reason.entry(reason).or_insert(0) += 1;
            channel.total_delay_ms += event.delay_ms;
            if reason.is_watchdog() {
                channel.watchdog_restarts += 1;
            }
            channel.watchdog_backoff_ms += event.watchdog_backoff_ms;
            channel.last_restart_at = Some(event.timestamp);

            let previous = channel.severity.severity;
            channel.severity = classify_restart_severity(
                channel.watchdog_restarts,
                channel.watchdog_backoff_ms,
                &self.thresholds,
            );
            if channel.severity.severity != previous {
                warning = Some(WarningEvent::SeverityChanged {
                    kind,
                    channel: record.channel.clone(),
                    previous,
                    assessment: channel.severity.clone(),
                });
            }

            kind_metrics.totals.restarts += 1;
            if reason.is_watchdog() {
                kind_metrics.totals.watchdog_restarts += 1;
            }
            kind_metrics.totals.watchdog_backoff_ms += event.watchdog_backoff_ms;
            kind_metrics.totals.total_delay_ms += event.delay_ms;
            kind_metrics.totals.last_restart_at = Some(event.timestamp);

            inner.restart_history.push_front(event);
            while inner.restart_history.len() > self.history_limit {
                inner.restart_history.pop_back();
                inner.restart_history_dropped += 1;
            }
        }

        if let Some(warning) = warning {
            self.publish(&warning);
        }
    }

    pub fn record_transport_fallback(&self, kind: ChannelKind, event: TransportFallbackEvent) {
        {
            let mut inner = self.write();
            inner.transport_fallback_total += 1;
            inner.last_transport_fallback = Some(event.clone());
            inner.pipelines.entry(kind).or_default().totals.transport_fallbacks += 1;
            inner.transport_fallbacks.push_front(event.clone());
            while inner.transport_fallbacks.len() > self.buffer_limit {
                inner.transport_fallbacks.pop_back();
            }
        }
        self.publish(&WarningEvent::TransportFallback(event));
    }

    pub fn record_retention_warning(&self, warning: RetentionWarning) {
        {
            let mut inner = self.write();
            inner.retention_warning_total += 1;
            inner.retention_warnings.push_front(warning.clone());
            while inner.retention_warnings.len() > self.buffer_limit {
                inner.retention_warnings.pop_back();
            }
        }
        self.publish(&WarningEvent::Retention(warning));
    }

    pub fn record_retention_totals(&self, totals: RetentionTotals) {
        let mut inner = self.write();
        inner.retention = totals;
    }

    pub fn record_suppression(&self, event: SuppressionEvent) {
        {
            let mut inner = self.write();
            inner.suppression_total += 1;
            inner.suppressions.push_front(event.clone());
            while inner.suppressions.len() > self.buffer_limit {
                inner.suppressions.pop_back();
            }
        }
        self.publish(&WarningEvent::Suppression(event));
    }

    /// Manual channel-health override, used by the CLI reset paths. Replaces
    /// the derived severity (and optionally the counters feeding it).
    pub fn set_pipeline_channel_health(
        &self,
        kind: ChannelKind,
        channel: &str,
        severity: SeverityAssessment,
        restarts: Option<u64>,
        backoff_ms: Option<u64>,
    ) {
        let mut inner = self.write();
        let stats = inner
            .pipelines
            .entry(kind)
            .or_default()
            .channels
            .entry(channel.to_string())
            .or_default();
        stats.severity = severity;
        if let Some(restarts) = restarts {
            stats.watchdog_restarts = restarts;
        }
        if let Some(backoff_ms) = backoff_ms {
            stats.watchdog_backoff_ms = backoff_ms;
        }
    }

    pub fn channel_severity(&self, kind: ChannelKind, channel: &str) -> RestartSeverity {
        self.read()
            .pipelines
            .get(&kind)
            .and_then(|metrics| metrics.channels.get(channel))
            .map(|stats| stats.severity.severity)
            .unwrap_or(RestartSeverity::None)
    }

    /// Register a warning listener. Panics inside the listener are isolated
    /// and counted against it; they never reach the producer.
    pub fn on_warning(
        &self,
        callback: impl Fn(&WarningEvent) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        listeners.push(WarningListener {
            id,
            callback: Box::new(callback),
            errors: 0,
        });
        id
    }

    pub fn off_warning(&self, id: u64) -> bool {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        listeners.len() != before
    }

    fn publish(&self, event: &WarningEvent) {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for listener in listeners.iter_mut() {
            if catch_unwind(AssertUnwindSafe(|| (listener.callback)(event))).is_err() {
                listener.errors += 1;
                self.listener_errors.fetch_add(1, Ordering::Relaxed);
                warn!(listener = listener.id, "warning listener panicked");
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.read();
        MetricsSnapshot {
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
            latencies: inner.latencies.clone(),
            pipelines: inner.pipelines.clone(),
            restart_history: inner.restart_history.iter().cloned().collect(),
            restart_history_limit: self.history_limit,
            restart_history_dropped: inner.restart_history_dropped,
            transport_fallbacks: inner.transport_fallbacks.iter().cloned().collect(),
            transport_fallback_total: inner.transport_fallback_total,
            last_transport_fallback: inner.last_transport_fallback.clone(),
            retention_warnings: inner.retention_warnings.iter().cloned().collect(),
            retention_warning_total: inner.retention_warning_total,
            retention: inner.retention.clone(),
            suppressions: inner.suppressions.iter().cloned().collect(),
            suppression_total: inner.suppression_total,
            listener_errors: self.listener_errors.load(Ordering::Relaxed),
            taken_at: Utc::now(),
        }
    }

    /// Zero everything. For tests and full restarts.
    pub fn reset(&self) {
        let mut inner = self.write();
        *inner = MetricsInner::default();
    }

    /// Zero the named per-detector counters (all channels). Used by idle
    /// rebaselines, which must clear lifetime suppression counters.
    pub fn reset_detector_counters(&self, detector: DetectorKind, names: &[&str]) {
        let prefix = format!("detector.{detector}.");
        let mut inner = self.write();
        for (path, value) in inner.counters.iter_mut() {
            if let Some(rest) = path.strip_prefix(&prefix) {
                let counter_name = rest.rsplit('.').next().unwrap_or(rest);
                if names.contains(&counter_name) {
                    *value = 0;
                }
            }
        }
    }
}
