//! Config file loading with environment overlay.

use std::path::Path;

use crate::error::{ConfigError, Result};
use crate::models::GuardianConfig;
use crate::validation::validate;

/// Parse a TOML document, without the environment overlay or validation.
pub fn load_str(raw: &str) -> Result<GuardianConfig> {
    Ok(toml::from_str(raw)?)
}

/// Load, overlay `GUARDIAN_*` environment variables, and validate.
pub fn load_file(path: &Path) -> Result<GuardianConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut config = load_str(&raw)?;
    apply_env_overrides(&mut config, std::env::vars())?;
    validate(&config)?;
    Ok(config)
}

/// Overlay a small, documented set of environment variables onto a parsed
/// document. Injectable for tests.
pub fn apply_env_overrides(
    config: &mut GuardianConfig,
    vars: impl IntoIterator<Item = (String, String)>,
) -> Result<()> {
    for (key, value) in vars {
        match key.as_str() {
            "GUARDIAN_LOGGING_LEVEL" => config.logging.level = value,
            "GUARDIAN_LOGGING_JSON" => {
                config.logging.json = parse_bool(&key, &value)?;
            }
            "GUARDIAN_VIDEO_FPS" => {
                config.video.frames_per_second = parse_num(&key, &value)?;
            }
            "GUARDIAN_VIDEO_FFMPEG" => config.video.ffmpeg.binary = value,
            "GUARDIAN_AUDIO_FFMPEG" => config.audio.ffmpeg.binary = value,
            "GUARDIAN_AUDIO_SAMPLE_RATE" => {
                config.audio.sample_rate = parse_num(&key, &value)?;
            }
            "GUARDIAN_DATABASE_PATH" => {
                config.database.path = Some(value.into());
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Validation(format!(
            "{key}: expected a boolean, got {other:?}"
        ))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        ConfigError::Validation(format!("{key}: expected a number, got {value:?}"))
    })
}
