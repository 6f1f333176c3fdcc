use serde::{Deserialize, Serialize};

/// Which detector produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectorKind {
    Motion,
    Light,
    AudioAnomaly,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::Motion => "motion",
            DetectorKind::Light => "light",
            DetectorKind::AudioAnomaly => "audio-anomaly",
        }
    }
}

impl std::fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warning,
    Critical,
}

impl EventSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSeverity::Info => "info",
            EventSeverity::Warning => "warning",
            EventSeverity::Critical => "critical",
        }
    }
}

/// Annotated detection event as published on the bus and to external sinks.
///
/// Immutable once emitted; `meta` carries the adaptive diagnostics snapshot
/// of the emitting detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    /// Epoch milliseconds.
    pub ts: i64,
    pub detector: DetectorKind,
    /// Canonical channel id (`type:name`).
    pub source: String,
    pub severity: EventSeverity,
    pub message: String,
    pub meta: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_serializes_with_wire_names() {
        let mut meta = serde_json::Map::new();
        meta.insert("areaPct".into(), serde_json::json!(12.5));
        let payload = EventPayload {
            ts: 1_700_000_000_000,
            detector: DetectorKind::AudioAnomaly,
            source: "audio:mic-1".into(),
            severity: EventSeverity::Critical,
            message: "rms spike".into(),
            meta,
        };

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["detector"], "audio-anomaly");
        assert_eq!(value["severity"], "critical");
        assert_eq!(value["source"], "audio:mic-1");
        assert_eq!(value["meta"]["areaPct"], 12.5);
    }
}
