//! Configuration document model.
//!
//! Field names follow the wire contract (camelCase). Every section rejects
//! unknown keys at parse time; overridable knobs live in [`ChannelOverrides`]
//! so the merge in [`crate::pipeline`] stays total.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use guardian_model::TransportKind;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct GuardianConfig {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub events: EventsConfig,
    pub video: VideoSectionConfig,
    pub audio: AudioSectionConfig,
    pub person: FrameConsumerConfig,
    pub motion: MotionConfig,
    pub light: LightConfig,
    pub pose: FrameConsumerConfig,
    pub objects: FrameConsumerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

/// Event persistence store settings (consumed by the external store, not by
/// the supervisor core).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct EventsConfig {
    pub history_limit: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { history_limit: 1000 }
    }
}

/// Opaque frame-consumer settings (person/pose/objects classifiers). The
/// supervisor only forwards frames; these sections are carried so reloads
/// can diff them without understanding them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct FrameConsumerConfig {
    pub enabled: bool,
    pub model_path: Option<PathBuf>,
    pub min_confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct VideoSectionConfig {
    pub frames_per_second: f64,
    pub ffmpeg: DecoderConfig,
    /// Decoded grayscale geometry all video pipelines share by default.
    pub width: u32,
    pub height: u32,
    pub channels: BTreeMap<String, ChannelOverrides>,
    pub cameras: Vec<CameraConfig>,
}

impl Default for VideoSectionConfig {
    fn default() -> Self {
        Self {
            frames_per_second: 5.0,
            ffmpeg: DecoderConfig::default(),
            width: 640,
            height: 360,
            channels: BTreeMap::new(),
            cameras: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct AudioSectionConfig {
    pub ffmpeg: DecoderConfig,
    pub sample_rate: u32,
    pub chunk_duration_ms: u64,
    pub anomaly: AudioAnomalyConfig,
    pub channels: BTreeMap<String, ChannelOverrides>,
    pub microphones: Vec<CameraConfig>,
}

impl Default for AudioSectionConfig {
    fn default() -> Self {
        Self {
            ffmpeg: DecoderConfig::default(),
            sample_rate: 16_000,
            chunk_duration_ms: 500,
            anomaly: AudioAnomalyConfig::default(),
            channels: BTreeMap::new(),
            microphones: Vec::new(),
        }
    }
}

/// External decoder invocation defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct DecoderConfig {
    pub binary: String,
    pub extra_input_args: Vec<String>,
    pub extra_output_args: Vec<String>,
    pub rtsp_transport: Option<TransportKind>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".into(),
            extra_input_args: Vec::new(),
            extra_output_args: Vec::new(),
            rtsp_transport: None,
        }
    }
}

/// A camera or microphone declaration. `channel` is required; a declaration
/// without one is rejected at validation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CameraConfig {
    pub id: String,
    #[serde(default)]
    pub channel: Option<String>,
    pub input: String,
    #[serde(default)]
    pub overrides: ChannelOverrides,
}

/// Partial per-channel settings. Every field is optional; merging is total
/// because each knob has a well-defined default at a lower layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ChannelOverrides {
    pub fps: Option<f64>,
    pub input: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub sample_rate: Option<u32>,
    pub chunk_duration_ms: Option<u64>,
    pub transport: Option<TransportKind>,
    pub decoder_binary: Option<String>,
    pub extra_input_args: Option<Vec<String>>,
    pub extra_output_args: Option<Vec<String>>,
    pub start_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub watchdog_timeout_ms: Option<u64>,
    pub force_kill_timeout_ms: Option<u64>,
    pub restart_delay_ms: Option<u64>,
    pub restart_max_delay_ms: Option<u64>,
    pub restart_jitter_factor: Option<f64>,
    pub circuit_breaker_threshold: Option<u32>,
    pub transport_failure_threshold: Option<u32>,
    pub restart_history_limit: Option<usize>,
    pub motion: Option<MotionOverrides>,
    pub light: Option<LightOverrides>,
    pub audio: Option<AudioOverrides>,
}

/// Local-time hour range; `start > end` wraps overnight (22 → 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HourRange {
    pub start: u8,
    pub end: u8,
}

impl HourRange {
    /// Whether `hour` (0..24) falls inside this range, overnight wrap
    /// included. `start == end` means the full day.
    pub fn contains_hour(&self, hour: u8) -> bool {
        let hour = hour % 24;
        let (start, end) = (self.start % 24, self.end % 24);
        if start == end {
            true
        } else if start < end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct MotionConfig {
    pub enabled: bool,
    /// Per-pixel absolute-difference threshold on 0..255 luminance.
    pub diff_threshold: f64,
    /// Percentage of changed pixels required to consider a frame in motion.
    pub area_threshold: f64,
    pub area_inflation: f64,
    pub debounce_frames: u32,
    pub backoff_frames: u32,
    pub min_interval_ms: u64,
    pub warmup_frames: u32,
    /// 0 disables idle rebaselining.
    pub idle_rebaseline_ms: u64,
    pub noise_window: usize,
    pub delta_window: usize,
    pub temporal_median_window: usize,
    pub temporal_median_margin: f64,
    pub temporal_median_backoff_smoothing: f64,
    /// Baseline blend factor applied on soft updates and after an emit.
    pub baseline_blend: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            diff_threshold: 25.0,
            area_threshold: 1.5,
            area_inflation: 1.25,
            debounce_frames: 2,
            backoff_frames: 4,
            min_interval_ms: 10_000,
            warmup_frames: 12,
            idle_rebaseline_ms: 30_000,
            noise_window: 24,
            delta_window: 12,
            temporal_median_window: 9,
            temporal_median_margin: 0.12,
            temporal_median_backoff_smoothing: 0.35,
            baseline_blend: 0.22,
        }
    }
}

impl MotionConfig {
    /// Clamp the load-bearing adaptive bounds. Called after every merge.
    pub fn normalize(&mut self) {
        self.temporal_median_window = self.temporal_median_window.clamp(3, 60);
        self.temporal_median_backoff_smoothing =
            self.temporal_median_backoff_smoothing.clamp(0.05, 0.95);
        self.noise_window = self.noise_window.max(2);
        self.delta_window = self.delta_window.max(2);
        self.baseline_blend = self.baseline_blend.clamp(0.01, 1.0);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct MotionOverrides {
    pub enabled: Option<bool>,
    pub diff_threshold: Option<f64>,
    pub area_threshold: Option<f64>,
    pub area_inflation: Option<f64>,
    pub debounce_frames: Option<u32>,
    pub backoff_frames: Option<u32>,
    pub min_interval_ms: Option<u64>,
    pub warmup_frames: Option<u32>,
    pub idle_rebaseline_ms: Option<u64>,
    pub noise_window: Option<usize>,
    pub delta_window: Option<usize>,
    pub temporal_median_window: Option<usize>,
    pub temporal_median_margin: Option<f64>,
    pub temporal_median_backoff_smoothing: Option<f64>,
    pub baseline_blend: Option<f64>,
}

impl MotionOverrides {
    pub fn apply(&self, base: &mut MotionConfig) {
        macro_rules! set {
            ($($field:ident),+) => {
                $(if let Some(value) = self.$field.clone() {
                    base.$field = value;
                })+
            };
        }
        set!(
            enabled,
            diff_threshold,
            area_threshold,
            area_inflation,
            debounce_frames,
            backoff_frames,
            min_interval_ms,
            warmup_frames,
            idle_rebaseline_ms,
            noise_window,
            delta_window,
            temporal_median_window,
            temporal_median_margin,
            temporal_median_backoff_smoothing,
            baseline_blend
        );
        base.normalize();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct LightConfig {
    pub enabled: bool,
    /// Absolute mean-luminance delta required to consider a change.
    pub delta_threshold: f64,
    pub debounce_frames: u32,
    pub backoff_frames: u32,
    pub min_interval_ms: u64,
    pub warmup_frames: u32,
    pub idle_rebaseline_ms: u64,
    pub noise_window: usize,
    pub delta_window: usize,
    pub temporal_median_window: usize,
    pub temporal_median_margin: f64,
    pub temporal_median_backoff_smoothing: f64,
    pub baseline_blend: f64,
    /// Hours during which light changes are expected and suppressed.
    pub normal_hours: Vec<HourRange>,
}

impl Default for LightConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delta_threshold: 28.0,
            debounce_frames: 2,
            backoff_frames: 4,
            min_interval_ms: 15_000,
            warmup_frames: 12,
            idle_rebaseline_ms: 30_000,
            noise_window: 24,
            delta_window: 12,
            temporal_median_window: 9,
            temporal_median_margin: 0.12,
            temporal_median_backoff_smoothing: 0.35,
            baseline_blend: 0.22,
            normal_hours: Vec::new(),
        }
    }
}

impl LightConfig {
    pub fn normalize(&mut self) {
        self.temporal_median_window = self.temporal_median_window.clamp(3, 60);
        self.temporal_median_backoff_smoothing =
            self.temporal_median_backoff_smoothing.clamp(0.05, 0.95);
        self.noise_window = self.noise_window.max(2);
        self.delta_window = self.delta_window.max(2);
        self.baseline_blend = self.baseline_blend.clamp(0.01, 1.0);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct LightOverrides {
    pub enabled: Option<bool>,
    pub delta_threshold: Option<f64>,
    pub debounce_frames: Option<u32>,
    pub backoff_frames: Option<u32>,
    pub min_interval_ms: Option<u64>,
    pub warmup_frames: Option<u32>,
    pub idle_rebaseline_ms: Option<u64>,
    pub noise_window: Option<usize>,
    pub delta_window: Option<usize>,
    pub temporal_median_window: Option<usize>,
    pub temporal_median_margin: Option<f64>,
    pub temporal_median_backoff_smoothing: Option<f64>,
    pub baseline_blend: Option<f64>,
    pub normal_hours: Option<Vec<HourRange>>,
}

impl LightOverrides {
    pub fn apply(&self, base: &mut LightConfig) {
        macro_rules! set {
            ($($field:ident),+) => {
                $(if let Some(value) = self.$field.clone() {
                    base.$field = value;
                })+
            };
        }
        set!(
            enabled,
            delta_threshold,
            debounce_frames,
            backoff_frames,
            min_interval_ms,
            warmup_frames,
            idle_rebaseline_ms,
            noise_window,
            delta_window,
            temporal_median_window,
            temporal_median_margin,
            temporal_median_backoff_smoothing,
            baseline_blend,
            normal_hours
        );
        base.normalize();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct AudioProfile {
    pub rms_delta_threshold: f64,
    pub centroid_delta_threshold_hz: f64,
}

impl Default for AudioProfile {
    fn default() -> Self {
        Self {
            rms_delta_threshold: 0.12,
            centroid_delta_threshold_hz: 900.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct AudioAnomalyConfig {
    pub enabled: bool,
    /// Analysis frame length; duration wins when both are set.
    pub frame_samples: Option<usize>,
    pub frame_duration_ms: Option<u64>,
    pub hop_samples: Option<usize>,
    pub hop_duration_ms: Option<u64>,
    /// Rolling baseline window.
    pub baseline_window_ms: u64,
    pub min_trigger_duration_ms: u64,
    pub min_interval_ms: u64,
    pub default_profile: AudioProfile,
    pub day_profile: Option<AudioProfile>,
    pub night_profile: Option<AudioProfile>,
    pub night_hours: Option<HourRange>,
}

impl Default for AudioAnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            frame_samples: None,
            frame_duration_ms: Some(64),
            hop_samples: None,
            hop_duration_ms: Some(32),
            baseline_window_ms: 10_000,
            min_trigger_duration_ms: 750,
            min_interval_ms: 20_000,
            default_profile: AudioProfile::default(),
            day_profile: None,
            night_profile: None,
            night_hours: Some(HourRange { start: 22, end: 6 }),
        }
    }
}

impl AudioAnomalyConfig {
    pub fn frame_len(&self, sample_rate: u32) -> usize {
        match (self.frame_duration_ms, self.frame_samples) {
            (Some(ms), _) => ((sample_rate as u64 * ms) / 1000).max(32) as usize,
            (None, Some(samples)) => samples.max(32),
            (None, None) => 1024,
        }
    }

    pub fn hop_len(&self, sample_rate: u32) -> usize {
        match (self.hop_duration_ms, self.hop_samples) {
            (Some(ms), _) => ((sample_rate as u64 * ms) / 1000).max(16) as usize,
            (None, Some(samples)) => samples.max(16),
            (None, None) => self.frame_len(sample_rate) / 2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct AudioOverrides {
    pub enabled: Option<bool>,
    pub frame_samples: Option<usize>,
    pub frame_duration_ms: Option<u64>,
    pub hop_samples: Option<usize>,
    pub hop_duration_ms: Option<u64>,
    pub baseline_window_ms: Option<u64>,
    pub min_trigger_duration_ms: Option<u64>,
    pub min_interval_ms: Option<u64>,
    pub default_profile: Option<AudioProfile>,
    pub day_profile: Option<AudioProfile>,
    pub night_profile: Option<AudioProfile>,
    pub night_hours: Option<HourRange>,
}

impl AudioOverrides {
    pub fn apply(&self, base: &mut AudioAnomalyConfig) {
        macro_rules! set {
            ($($field:ident),+) => {
                $(if let Some(value) = self.$field.clone() {
                    base.$field = value;
                })+
            };
        }
        set!(
            enabled,
            baseline_window_ms,
            min_trigger_duration_ms,
            min_interval_ms,
            default_profile
        );
        // Frame geometry fields overwrite as a pair so samples-only overrides
        // can unset a lower layer's duration.
        if self.frame_samples.is_some() || self.frame_duration_ms.is_some() {
            base.frame_samples = self.frame_samples;
            base.frame_duration_ms = self.frame_duration_ms;
        }
        if self.hop_samples.is_some() || self.hop_duration_ms.is_some() {
            base.hop_samples = self.hop_samples;
            base.hop_duration_ms = self.hop_duration_ms;
        }
        if let Some(profile) = self.day_profile {
            base.day_profile = Some(profile);
        }
        if let Some(profile) = self.night_profile {
            base.night_profile = Some(profile);
        }
        if let Some(range) = self.night_hours {
            base.night_hours = Some(range);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_range_plain_and_overnight() {
        let day = HourRange { start: 9, end: 17 };
        assert!(day.contains_hour(9));
        assert!(day.contains_hour(16));
        assert!(!day.contains_hour(17));
        assert!(!day.contains_hour(3));

        let night = HourRange { start: 22, end: 6 };
        assert!(night.contains_hour(22));
        assert!(night.contains_hour(2));
        assert!(!night.contains_hour(6));
        assert!(!night.contains_hour(12));

        let all_day = HourRange { start: 4, end: 4 };
        for hour in 0..24 {
            assert!(all_day.contains_hour(hour));
        }
    }

    #[test]
    fn motion_normalize_enforces_clamps() {
        let mut config = MotionConfig {
            temporal_median_window: 500,
            temporal_median_backoff_smoothing: 0.001,
            ..MotionConfig::default()
        };
        config.normalize();
        assert_eq!(config.temporal_median_window, 60);
        assert!((config.temporal_median_backoff_smoothing - 0.05).abs() < f64::EPSILON);

        let mut config = MotionConfig {
            temporal_median_window: 1,
            temporal_median_backoff_smoothing: 2.0,
            ..MotionConfig::default()
        };
        config.normalize();
        assert_eq!(config.temporal_median_window, 3);
        assert!((config.temporal_median_backoff_smoothing - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = toml::from_str::<GuardianConfig>(
            "[video]\nframesPerSecond = 5.0\nbogusKnob = 1\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("bogusKnob"));
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let mut base = MotionConfig::default();
        let over = MotionOverrides {
            area_threshold: Some(4.0),
            temporal_median_window: Some(100),
            ..MotionOverrides::default()
        };
        over.apply(&mut base);
        assert!((base.area_threshold - 4.0).abs() < f64::EPSILON);
        // Clamp applies after every merge.
        assert_eq!(base.temporal_median_window, 60);
        assert!((base.diff_threshold - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn audio_frame_geometry_resolution() {
        let config = AudioAnomalyConfig::default();
        // 64ms at 16kHz
        assert_eq!(config.frame_len(16_000), 1024);
        assert_eq!(config.hop_len(16_000), 512);

        let config = AudioAnomalyConfig {
            frame_duration_ms: None,
            frame_samples: Some(2048),
            hop_duration_ms: None,
            hop_samples: None,
            ..AudioAnomalyConfig::default()
        };
        assert_eq!(config.frame_len(16_000), 2048);
        assert_eq!(config.hop_len(16_000), 1024);
    }
}
