use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::severity::{
    RestartSeverity, SeverityAssessment, SeverityThresholds, classify_restart_severity,
};

pub const DEFAULT_RESTART_HISTORY_LIMIT: usize = 32;

/// Why a media source scheduled a restart.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum RestartReason {
    StartTimeout,
    StreamIdle,
    WatchdogTimeout,
    StreamError,
    CorruptedFrame,
    TransportFallback,
    ManualCircuitReset,
}

impl RestartReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartReason::StartTimeout => "start-timeout",
            RestartReason::StreamIdle => "stream-idle",
            RestartReason::WatchdogTimeout => "watchdog-timeout",
            RestartReason::StreamError => "stream-error",
            RestartReason::CorruptedFrame => "corrupted-frame",
            RestartReason::TransportFallback => "transport-fallback",
            RestartReason::ManualCircuitReset => "manual-circuit-reset",
        }
    }

    /// Watchdog-attributed reasons contribute to the severity inputs.
    pub fn is_watchdog(&self) -> bool {
        matches!(self, RestartReason::WatchdogTimeout)
    }
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recover occurrence, as recorded in restart histories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartEvent {
    pub reason: RestartReason,
    /// Monotonic per-pipeline-incarnation attempt counter, starting at 1.
    pub attempt: u32,
    pub delay_ms: u64,
    pub watchdog_backoff_ms: u64,
    /// Canonical channel id.
    pub channel: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

/// Per-channel restart accounting: monotonic totals plus a bounded,
/// newest-first history ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartStats {
    pub total: u64,
    pub by_reason: BTreeMap<RestartReason, u64>,
    pub total_delay_ms: u64,
    pub watchdog_backoff_ms: u64,
    /// Newest-first; capped at `history_limit`, overflow counted in `dropped`.
    pub history: VecDeque<RestartEvent>,
    pub history_limit: usize,
    pub dropped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<RestartEvent>,
    pub severity: SeverityAssessment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_since: Option<DateTime<Utc>>,
}

impl Default for RestartStats {
    fn default() -> Self {
        Self::new(DEFAULT_RESTART_HISTORY_LIMIT)
    }
}

impl RestartStats {
    pub fn new(history_limit: usize) -> Self {
        Self {
            total: 0,
            by_reason: BTreeMap::new(),
            total_delay_ms: 0,
            watchdog_backoff_ms: 0,
            history: VecDeque::with_capacity(history_limit.max(1)),
            history_limit: history_limit.max(1),
            dropped: 0,
            last: None,
            severity: SeverityAssessment::default(),
            degraded_since: None,
        }
    }

    /// Watchdog restart count used by the severity classifier.
    pub fn watchdog_restarts(&self) -> u64 {
        self.by_reason
            .iter()
            .filter(|(reason, _)| reason.is_watchdog())
            .map(|(_, count)| count)
            .sum()
    }

    /// Record one restart event, recomputing severity. Returns the previous
    /// severity when it changed.
    pub fn record(
        &mut self,
        event: RestartEvent,
        thresholds: &SeverityThresholds,
    ) -> Option<RestartSeverity> {
        self.total += 1;
        *self.by_reason.entry(event.reason).or_insert(0) += 1;
        self.total_delay_ms += event.delay_ms;
        self.watchdog_backoff_ms += event.watchdog_backoff_ms;

        self.history.push_front(event.clone());
        while self.history.len() > self.history_limit {
            self.history.pop_back();
            self.dropped += 1;
        }

        let previous = self.severity.severity;
        self.severity = classify_restart_severity(
            self.watchdog_restarts(),
            self.watchdog_backoff_ms,
            thresholds,
        );

        match (previous, self.severity.severity) {
            (RestartSeverity::None, s) if s != RestartSeverity::None => {
                self.degraded_since = Some(event.timestamp);
            }
            (_, RestartSeverity::None) => self.degraded_since = None,
            _ => {}
        }
        self.last = Some(event);

        (previous != self.severity.severity).then_some(previous)
    }

    /// Reset everything but the configured history limit. Used when a
    /// pipeline is replaced during hot reload.
    pub fn reset(&mut self) {
        *self = Self::new(self.history_limit);
    }

    /// Clear the derived severity without touching the counters. Used by the
    /// manual channel-health reset path.
    pub fn clear_severity(&mut self) {
        self.severity = SeverityAssessment::default();
        self.degraded_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(reason: RestartReason, attempt: u32, delay_ms: u64, backoff_ms: u64) -> RestartEvent {
        RestartEvent {
            reason,
            attempt,
            delay_ms,
            watchdog_backoff_ms: backoff_ms,
            channel: "video:cam-a".into(),
            timestamp: Utc::now(),
            error_code: None,
            exit_code: None,
            signal: None,
        }
    }

    #[test]
    fn totals_track_reasons_and_sums() {
        // The restart-accounting scenario: three recover events.
        let mut stats = RestartStats::default();
        let t = SeverityThresholds::default();
        stats.record(event(RestartReason::WatchdogTimeout, 1, 420, 420), &t);
        stats.record(event(RestartReason::StreamIdle, 2, 150, 0), &t);
        stats.record(event(RestartReason::WatchdogTimeout, 3, 500, 500), &t);

        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_reason[&RestartReason::WatchdogTimeout], 2);
        assert_eq!(stats.by_reason[&RestartReason::StreamIdle], 1);
        assert_eq!(stats.watchdog_backoff_ms, 920);
        assert_eq!(stats.total_delay_ms, 1070);
        assert_eq!(stats.severity.severity, RestartSeverity::None);
        assert_eq!(stats.total, stats.by_reason.values().sum::<u64>());
    }

    #[test]
    fn six_watchdog_timeouts_cross_critical() {
        let mut stats = RestartStats::default();
        let t = SeverityThresholds::default();
        for attempt in 1..=6 {
            stats.record(
                event(RestartReason::WatchdogTimeout, attempt, 10_000, 10_000),
                &t,
            );
        }
        assert_eq!(stats.severity.severity, RestartSeverity::Critical);
        assert_eq!(
            stats.severity.triggered_by,
            Some(crate::severity::SeverityTrigger::WatchdogRestarts)
        );
        assert_eq!(stats.severity.threshold, 6);
        assert!(stats.degraded_since.is_some());
    }

    #[test]
    fn history_is_newest_first_and_bounded() {
        let mut stats = RestartStats::new(3);
        let t = SeverityThresholds::default();
        for attempt in 1..=5 {
            stats.record(event(RestartReason::StreamError, attempt, 100, 0), &t);
        }
        assert_eq!(stats.history.len(), 3);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.dropped + stats.history.len() as u64, stats.total);
        let attempts: Vec<u32> = stats.history.iter().map(|e| e.attempt).collect();
        assert_eq!(attempts, vec![5, 4, 3]);
    }

    #[test]
    fn severity_change_reported_once() {
        let mut stats = RestartStats::default();
        let t = SeverityThresholds::default();
        for attempt in 1..=2 {
            let changed = stats.record(
                event(RestartReason::WatchdogTimeout, attempt, 10, 10),
                &t,
            );
            assert!(changed.is_none());
        }
        let changed = stats.record(event(RestartReason::WatchdogTimeout, 3, 10, 10), &t);
        assert_eq!(changed, Some(RestartSeverity::None));
        let unchanged = stats.record(event(RestartReason::WatchdogTimeout, 4, 10, 10), &t);
        assert!(unchanged.is_none());
    }

    #[test]
    fn reset_preserves_history_limit() {
        let mut stats = RestartStats::new(7);
        let t = SeverityThresholds::default();
        stats.record(event(RestartReason::StreamIdle, 1, 10, 0), &t);
        stats.reset();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.history_limit, 7);
        assert!(stats.history.is_empty());
        assert!(stats.last.is_none());
    }
}
