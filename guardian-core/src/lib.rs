//! # Guardian Core
//!
//! Channel supervisor core for the Guardian surveillance daemon.
//!
//! ## Overview
//!
//! Guardian ingests live video and audio from cameras and microphones, runs
//! per-channel detectors, and publishes annotated events. This crate owns the
//! hard part: every media pipeline's lifecycle.
//!
//! - **MediaSource**: decoder subprocess management with start/idle/watchdog
//!   timeouts, jittered exponential restart backoff, an RTSP transport
//!   fallback ladder, and a circuit breaker
//! - **Detectors**: adaptive motion and light detectors built on temporal
//!   median gating and noise-window pressure, plus an audio anomaly detector
//! - **Supervisor**: pipeline map ownership, hot configuration reload with
//!   rollback, manual resets, coordinated shutdown with hooks
//! - **Metrics & health**: process-wide metrics registry and service health
//!   aggregation

/// Process-wide metrics sink
pub mod metrics;

/// In-process event fan-out
pub mod events;

/// Decoder subprocess lifecycle
pub mod source;

/// Motion, light, and audio anomaly detectors
pub mod detect;

/// One channel's source + detectors + restart accounting
pub mod pipeline;

/// Pipeline map ownership, reload, shutdown
pub mod supervisor;

/// Service-level health derivation
pub mod health;

/// Error types and handling
pub mod error;

pub use error::{CoreError, Result};
pub use events::EventBus;
pub use health::{HealthAggregator, HealthReport, ServiceHealth};
pub use metrics::{MetricsRegistry, MetricsSnapshot, WarningEvent};
pub use supervisor::{Supervisor, SupervisorOptions, SupervisorState};
