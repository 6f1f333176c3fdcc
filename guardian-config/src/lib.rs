//! Shared configuration library for Guardian.
//!
//! This crate centralizes config loading and validation, the layered
//! per-channel pipeline-config resolution, and the `ConfigManager` that owns
//! the current validated document and publishes reload notifications. Both
//! `guardian-server` and the supervisor in `guardian-core` consume these
//! utilities so there is a single source of truth for defaults, merge order,
//! and validation rules.

pub mod error;
pub mod loader;
pub mod manager;
pub mod models;
pub mod pipeline;
pub mod validation;

pub use error::{ConfigError, Result};
pub use loader::{apply_env_overrides, load_file, load_str};
pub use manager::ConfigManager;
pub use models::{
    AudioAnomalyConfig, AudioProfile, AudioSectionConfig, CameraConfig, ChannelOverrides,
    DecoderConfig, GuardianConfig, HourRange, LightConfig, LoggingConfig, MotionConfig,
    VideoSectionConfig,
};
pub use pipeline::{MediaSourceConfig, PipelineConfig, resolve_pipelines};
pub use validation::validate;
