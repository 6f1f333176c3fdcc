//! Document-level validation. Fatal during startup load; on hot reload a
//! failure here is caught by the supervisor and triggers rollback.

use crate::error::{ConfigError, Result};
use crate::models::GuardianConfig;
use crate::pipeline::{PipelineConfig, resolve_pipelines};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

pub fn validate(config: &GuardianConfig) -> Result<()> {
    if !LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::Validation(format!(
            "logging.level must be one of {LOG_LEVELS:?}, got {:?}",
            config.logging.level
        )));
    }
    if !(config.video.frames_per_second > 0.0) {
        return Err(ConfigError::Validation(
            "video.framesPerSecond must be positive".into(),
        ));
    }
    if config.video.width == 0 || config.video.height == 0 {
        return Err(ConfigError::Validation(
            "video geometry must be non-zero".into(),
        ));
    }
    if config.audio.sample_rate == 0 {
        return Err(ConfigError::Validation(
            "audio.sampleRate must be positive".into(),
        ));
    }
    if config.audio.chunk_duration_ms == 0 {
        return Err(ConfigError::Validation(
            "audio.chunkDurationMs must be positive".into(),
        ));
    }

    for pipeline in resolve_pipelines(config)? {
        validate_pipeline(&pipeline)?;
    }
    Ok(())
}

pub fn validate_pipeline(pipeline: &PipelineConfig) -> Result<()> {
    let media = &pipeline.media;
    let channel = pipeline.channel.canonical();

    let positive = [
        ("startTimeoutMs", media.start_timeout_ms),
        ("idleTimeoutMs", media.idle_timeout_ms),
        ("watchdogTimeoutMs", media.watchdog_timeout_ms),
        ("forceKillTimeoutMs", media.force_kill_timeout_ms),
        ("restartDelayMs", media.restart_delay_ms),
        ("restartMaxDelayMs", media.restart_max_delay_ms),
    ];
    for (name, value) in positive {
        if value == 0 {
            return Err(ConfigError::Validation(format!(
                "{channel}: {name} must be positive"
            )));
        }
    }
    if media.restart_delay_ms > media.restart_max_delay_ms {
        return Err(ConfigError::Validation(format!(
            "{channel}: restartDelayMs exceeds restartMaxDelayMs"
        )));
    }
    if !(0.0..1.0).contains(&media.restart_jitter_factor) {
        return Err(ConfigError::Validation(format!(
            "{channel}: restartJitterFactor must be in [0, 1)"
        )));
    }
    if media.circuit_breaker_threshold == 0 {
        return Err(ConfigError::Validation(format!(
            "{channel}: circuitBreakerThreshold must be at least 1"
        )));
    }
    if media.transport_failure_threshold == 0 {
        return Err(ConfigError::Validation(format!(
            "{channel}: transportFailureThreshold must be at least 1"
        )));
    }

    if let Some(motion) = &pipeline.motion {
        if !(motion.diff_threshold > 0.0) || !(motion.area_threshold > 0.0) {
            return Err(ConfigError::Validation(format!(
                "{channel}: motion thresholds must be positive"
            )));
        }
    }
    if let Some(light) = &pipeline.light {
        if !(light.delta_threshold > 0.0) {
            return Err(ConfigError::Validation(format!(
                "{channel}: light.deltaThreshold must be positive"
            )));
        }
        for range in &light.normal_hours {
            if range.start > 23 || range.end > 23 {
                return Err(ConfigError::Validation(format!(
                    "{channel}: normalHours entries must use hours 0..=23"
                )));
            }
        }
    }
    if let Some(audio) = &pipeline.audio {
        if audio.frame_len(media.sample_rate.max(1)) == 0 {
            return Err(ConfigError::Validation(format!(
                "{channel}: audio frame length resolves to zero"
            )));
        }
    }

    Ok(())
}
