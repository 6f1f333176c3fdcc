use serde::{Deserialize, Serialize};

/// Health severity derived from a channel's watchdog restart pressure.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RestartSeverity {
    #[default]
    None,
    Warning,
    Critical,
}

impl RestartSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartSeverity::None => "none",
            RestartSeverity::Warning => "warning",
            RestartSeverity::Critical => "critical",
        }
    }
}

/// Which attribute crossed its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeverityTrigger {
    WatchdogRestarts,
    WatchdogBackoff,
}

/// Thresholds for the severity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SeverityThresholds {
    pub warning_restarts: u64,
    pub warning_backoff_ms: u64,
    pub critical_restarts: u64,
    pub critical_backoff_ms: u64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            warning_restarts: 3,
            warning_backoff_ms: 60_000,
            critical_restarts: 6,
            critical_backoff_ms: 180_000,
        }
    }
}

/// Outcome of a severity evaluation, including the human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeverityAssessment {
    pub severity: RestartSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<SeverityTrigger>,
    pub threshold: u64,
    pub actual: u64,
    pub reason: String,
}

impl Default for SeverityAssessment {
    fn default() -> Self {
        Self {
            severity: RestartSeverity::None,
            triggered_by: None,
            threshold: 0,
            actual: 0,
            reason: String::new(),
        }
    }
}

/// Classify watchdog restart pressure into a health severity.
///
/// Evaluation order is fixed: critical-restarts, critical-backoff,
/// warning-restarts, warning-backoff, none. Monotone in both inputs for
/// fixed thresholds.
pub fn classify_restart_severity(
    watchdog_restarts: u64,
    watchdog_backoff_ms: u64,
    thresholds: &SeverityThresholds,
) -> SeverityAssessment {
    let restarts_hit = |severity: RestartSeverity, threshold: u64| SeverityAssessment {
        severity,
        triggered_by: Some(SeverityTrigger::WatchdogRestarts),
        threshold,
        actual: watchdog_restarts,
        reason: format!("watchdog restarts {watchdog_restarts} >= {threshold}"),
    };
    let backoff_hit = |severity: RestartSeverity, threshold: u64| SeverityAssessment {
        severity,
        triggered_by: Some(SeverityTrigger::WatchdogBackoff),
        threshold,
        actual: watchdog_backoff_ms,
        reason: format!("watchdog backoff {watchdog_backoff_ms}ms >= {threshold}ms"),
    };

    if watchdog_restarts >= thresholds.critical_restarts {
        return restarts_hit(RestartSeverity::Critical, thresholds.critical_restarts);
    }
    if watchdog_backoff_ms >= thresholds.critical_backoff_ms {
        return backoff_hit(RestartSeverity::Critical, thresholds.critical_backoff_ms);
    }
    if watchdog_restarts >= thresholds.warning_restarts {
        return restarts_hit(RestartSeverity::Warning, thresholds.warning_restarts);
    }
    if watchdog_backoff_ms >= thresholds.warning_backoff_ms {
        return backoff_hit(RestartSeverity::Warning, thresholds.warning_backoff_ms);
    }

    SeverityAssessment::default()
}
