//! Layered resolution of per-channel pipeline configuration.
//!
//! Merge order, lowest to highest priority: section defaults
//! (`video.*` / `audio.*`, themselves seeded from root detector sections) →
//! `channels[channel]` overrides → camera/microphone element overrides.

use guardian_model::{
    ChannelId, ChannelKind, SeverityThresholds, TransportKind,
    restart::DEFAULT_RESTART_HISTORY_LIMIT,
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::models::{
    AudioAnomalyConfig, CameraConfig, ChannelOverrides, GuardianConfig, LightConfig, MotionConfig,
};

/// Everything a media source needs to run one decoder subprocess.
///
/// Equality over this struct decides `restart_required` during hot reload:
/// two pipeline configs with equal `media` fields can be updated live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaSourceConfig {
    pub kind: ChannelKind,
    pub input: String,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub chunk_duration_ms: u64,
    pub decoder_binary: String,
    pub extra_input_args: Vec<String>,
    pub extra_output_args: Vec<String>,
    pub transport: Option<TransportKind>,
    /// Failures on one transport rung before the ladder advances.
    pub transport_failure_threshold: u32,
    pub start_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub watchdog_timeout_ms: u64,
    pub force_kill_timeout_ms: u64,
    pub restart_delay_ms: u64,
    pub restart_max_delay_ms: u64,
    pub restart_jitter_factor: f64,
    /// Consecutive failures before the circuit opens.
    pub circuit_breaker_threshold: u32,
}

impl MediaSourceConfig {
    fn video_defaults(video: &crate::models::VideoSectionConfig) -> Self {
        Self {
            kind: ChannelKind::Video,
            input: String::new(),
            fps: video.frames_per_second,
            width: video.width,
            height: video.height,
            sample_rate: 0,
            chunk_duration_ms: 0,
            decoder_binary: video.ffmpeg.binary.clone(),
            extra_input_args: video.ffmpeg.extra_input_args.clone(),
            extra_output_args: video.ffmpeg.extra_output_args.clone(),
            transport: video.ffmpeg.rtsp_transport,
            transport_failure_threshold: 3,
            start_timeout_ms: 10_000,
            idle_timeout_ms: 10_000,
            watchdog_timeout_ms: 30_000,
            force_kill_timeout_ms: 5_000,
            restart_delay_ms: 1_000,
            restart_max_delay_ms: 60_000,
            restart_jitter_factor: 0.2,
            circuit_breaker_threshold: 8,
        }
    }

    fn audio_defaults(audio: &crate::models::AudioSectionConfig) -> Self {
        Self {
            kind: ChannelKind::Audio,
            input: String::new(),
            fps: 0.0,
            width: 0,
            height: 0,
            sample_rate: audio.sample_rate,
            chunk_duration_ms: audio.chunk_duration_ms,
            decoder_binary: audio.ffmpeg.binary.clone(),
            extra_input_args: audio.ffmpeg.extra_input_args.clone(),
            extra_output_args: audio.ffmpeg.extra_output_args.clone(),
            transport: None,
            transport_failure_threshold: 3,
            start_timeout_ms: 10_000,
            idle_timeout_ms: 10_000,
            watchdog_timeout_ms: 30_000,
            force_kill_timeout_ms: 5_000,
            restart_delay_ms: 1_000,
            restart_max_delay_ms: 60_000,
            restart_jitter_factor: 0.2,
            circuit_breaker_threshold: 8,
        }
    }

    fn apply(&mut self, over: &ChannelOverrides) {
        if let Some(fps) = over.fps {
            self.fps = fps;
        }
        if let Some(input) = &over.input {
            self.input = input.clone();
        }
        if let Some(width) = over.width {
            self.width = width;
        }
        if let Some(height) = over.height {
            self.height = height;
        }
        if let Some(rate) = over.sample_rate {
            self.sample_rate = rate;
        }
        if let Some(chunk) = over.chunk_duration_ms {
            self.chunk_duration_ms = chunk;
        }
        if let Some(transport) = over.transport {
            self.transport = Some(transport);
        }
        if let Some(binary) = &over.decoder_binary {
            self.decoder_binary = binary.clone();
        }
        if let Some(args) = &over.extra_input_args {
            self.extra_input_args = args.clone();
        }
        if let Some(args) = &over.extra_output_args {
            self.extra_output_args = args.clone();
        }
        if let Some(v) = over.start_timeout_ms {
            self.start_timeout_ms = v;
        }
        if let Some(v) = over.idle_timeout_ms {
            self.idle_timeout_ms = v;
        }
        if let Some(v) = over.watchdog_timeout_ms {
            self.watchdog_timeout_ms = v;
        }
        if let Some(v) = over.force_kill_timeout_ms {
            self.force_kill_timeout_ms = v;
        }
        if let Some(v) = over.restart_delay_ms {
            self.restart_delay_ms = v;
        }
        if let Some(v) = over.restart_max_delay_ms {
            self.restart_max_delay_ms = v;
        }
        if let Some(v) = over.restart_jitter_factor {
            self.restart_jitter_factor = v;
        }
        if let Some(v) = over.circuit_breaker_threshold {
            self.circuit_breaker_threshold = v;
        }
        if let Some(v) = over.transport_failure_threshold {
            self.transport_failure_threshold = v;
        }
    }
}

/// Fully resolved configuration for one channel pipeline. Immutable within a
/// pipeline incarnation; hot reload produces a fresh value and diffs it
/// against the running one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    pub channel: ChannelId,
    pub media: MediaSourceConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion: Option<MotionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light: Option<LightConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioAnomalyConfig>,
    pub restart_history_limit: usize,
    pub severity_thresholds: SeverityThresholds,
}

impl PipelineConfig {
    /// Whether switching from `self` to `next` needs a source restart, or can
    /// be applied live through the detectors' `update_options`.
    pub fn restart_required(&self, next: &PipelineConfig) -> bool {
        self.media != next.media || self.restart_history_limit != next.restart_history_limit
    }
}

fn channel_overrides<'a>(
    channels: &'a std::collections::BTreeMap<String, ChannelOverrides>,
    id: &ChannelId,
    default_kind: ChannelKind,
) -> Option<&'a ChannelOverrides> {
    channels
        .iter()
        .find(|(key, _)| ChannelId::parse(key, default_kind) == *id)
        .map(|(_, over)| over)
}

fn resolve_one(
    config: &GuardianConfig,
    kind: ChannelKind,
    id: &ChannelId,
    element: Option<&CameraConfig>,
) -> Result<PipelineConfig> {
    let (mut media, channels) = match kind {
        ChannelKind::Video => (
            MediaSourceConfig::video_defaults(&config.video),
            &config.video.channels,
        ),
        ChannelKind::Audio => (
            MediaSourceConfig::audio_defaults(&config.audio),
            &config.audio.channels,
        ),
        ChannelKind::Other => {
            return Err(ConfigError::Validation(format!(
                "channel {} has unsupported kind {kind}",
                id.canonical()
            )));
        }
    };

    let mut motion = config.motion.clone();
    motion.normalize();
    let mut light = config.light.clone();
    light.normalize();
    let mut audio = config.audio.anomaly.clone();
    let mut restart_history_limit = DEFAULT_RESTART_HISTORY_LIMIT;

    let mut layers: Vec<&ChannelOverrides> = Vec::new();
    if let Some(over) = channel_overrides(channels, id, kind) {
        layers.push(over);
    }
    if let Some(camera) = element {
        media.input = camera.input.clone();
        layers.push(&camera.overrides);
    }

    for over in layers {
        media.apply(over);
        if let Some(limit) = over.restart_history_limit {
            restart_history_limit = limit.max(1);
        }
        if let Some(motion_over) = &over.motion {
            motion_over.apply(&mut motion);
        }
        if let Some(light_over) = &over.light {
            light_over.apply(&mut light);
        }
        if let Some(audio_over) = &over.audio {
            audio_over.apply(&mut audio);
        }
    }

    if media.input.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "channel {} has no input",
            id.canonical()
        )));
    }

    let (motion, light, audio) = match kind {
        ChannelKind::Video => (
            motion.enabled.then_some(motion),
            light.enabled.then_some(light),
            None,
        ),
        _ => (None, None, audio.enabled.then_some(audio)),
    };

    Ok(PipelineConfig {
        channel: id.clone(),
        media,
        motion,
        light,
        audio,
        restart_history_limit,
        severity_thresholds: SeverityThresholds::default(),
    })
}

/// Resolve every declared channel into a [`PipelineConfig`].
///
/// Cameras/microphones are the primary declarations; `channels` entries that
/// carry their own `input` and have no matching element also become
/// pipelines. Duplicate channel ids are rejected.
pub fn resolve_pipelines(config: &GuardianConfig) -> Result<Vec<PipelineConfig>> {
    fn push(
        resolved: &mut Vec<PipelineConfig>,
        seen: &mut std::collections::HashSet<String>,
        pipeline: PipelineConfig,
    ) -> Result<()> {
        let canonical = pipeline.channel.canonical();
        if !seen.insert(canonical.clone()) {
            return Err(ConfigError::Validation(format!(
                "duplicate channel {canonical}"
            )));
        }
        resolved.push(pipeline);
        Ok(())
    }

    let mut resolved: Vec<PipelineConfig> = Vec::new();
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

    for (kind, elements) in [
        (ChannelKind::Video, &config.video.cameras),
        (ChannelKind::Audio, &config.audio.microphones),
    ] {
        for element in elements {
            let raw = element.channel.as_deref().unwrap_or("");
            if raw.trim().is_empty() {
                return Err(ConfigError::MissingChannel {
                    camera: element.id.clone(),
                });
            }
            let id = ChannelId::validated(raw, kind)?;
            let pipeline = resolve_one(config, kind, &id, Some(element))?;
            push(&mut resolved, &mut seen, pipeline)?;
        }
    }

    // Standalone channel entries with their own input.
    for (kind, channels) in [
        (ChannelKind::Video, &config.video.channels),
        (ChannelKind::Audio, &config.audio.channels),
    ] {
        for (key, over) in channels {
            if over.input.is_none() {
                continue;
            }
            let id = ChannelId::validated(key, kind)?;
            if seen.contains(&id.canonical()) {
                continue;
            }
            let pipeline = resolve_one(config, kind, &id, None)?;
            push(&mut resolved, &mut seen, pipeline)?;
        }
    }

    Ok(resolved)
}
