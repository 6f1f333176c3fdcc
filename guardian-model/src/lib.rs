//! Core data model definitions shared across Guardian crates.

pub mod channel;
pub mod error;
pub mod event;
pub mod restart;
pub mod severity;
pub mod transport;

// Intentionally curated re-exports for downstream consumers.
pub use channel::{ChannelId, ChannelKind};
pub use error::{ModelError, Result as ModelResult};
pub use event::{DetectorKind, EventPayload, EventSeverity};
pub use restart::{RestartEvent, RestartReason, RestartStats};
pub use severity::{
    RestartSeverity, SeverityAssessment, SeverityThresholds, SeverityTrigger,
    classify_restart_severity,
};
pub use transport::{TransportFallbackEvent, TransportKind};
