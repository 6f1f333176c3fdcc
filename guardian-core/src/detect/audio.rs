//! Audio anomaly detector: rolling RMS and spectral-centroid baselines with
//! a day/night profile schedule.
//!
//! PCM chunks are re-framed into Hann-windowed analysis frames. A sustained
//! RMS departure from the rolling baseline is critical; a sustained
//! spectral-centroid shift alone is a warning.

use std::sync::Arc;

use chrono::{Local, TimeZone, Timelike};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde_json::json;

use guardian_config::{AudioAnomalyConfig, AudioProfile};
use guardian_model::{ChannelId, DetectorKind, EventPayload, EventSeverity};

use crate::events::EventBus;
use crate::metrics::MetricsRegistry;

use super::adaptive::RingWindow;

/// Baseline frames required before deltas are judged.
const MIN_BASELINE_FRAMES: usize = 3;

/// Chunk-timestamp drift beyond this re-anchors the frame clock.
const RESYNC_SLACK_MS: i64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProfileKind {
    Default,
    Day,
    Night,
}

impl ProfileKind {
    fn as_str(&self) -> &'static str {
        match self {
            ProfileKind::Default => "default",
            ProfileKind::Day => "day",
            ProfileKind::Night => "night",
        }
    }
}

pub struct AudioAnomalyDetector {
    config: AudioAnomalyConfig,
    sample_rate: u32,
    channel: String,
    metrics: Arc<MetricsRegistry>,
    bus: Arc<EventBus>,

    frame_len: usize,
    hop_len: usize,
    hann: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,

    buffer: Vec<f32>,
    next_frame_ts: i64,

    rms_window: RingWindow,
    centroid_window: RingWindow,
    rms_exceed_since: Option<i64>,
    centroid_exceed_since: Option<i64>,
    last_event_ts: Option<i64>,
    active_profile: ProfileKind,
}

impl std::fmt::Debug for AudioAnomalyDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioAnomalyDetector")
            .field("channel", &self.channel)
            .field("frame_len", &self.frame_len)
            .field("hop_len", &self.hop_len)
            .finish()
    }
}

fn hann_window(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| {
            let phase = (i as f32) * std::f32::consts::TAU / (len as f32 - 1.0).max(1.0);
            0.5 * (1.0 - phase.cos())
        })
        .collect()
}

impl AudioAnomalyDetector {
    pub fn new(
        channel: &ChannelId,
        config: AudioAnomalyConfig,
        sample_rate: u32,
        metrics: Arc<MetricsRegistry>,
        bus: Arc<EventBus>,
    ) -> Self {
        let sample_rate = sample_rate.max(1);
        let frame_len = config.frame_len(sample_rate);
        let hop_len = config.hop_len(sample_rate).min(frame_len);
        let baseline_frames = Self::baseline_frames(&config, hop_len, sample_rate);
        let fft = FftPlanner::new().plan_fft_forward(frame_len);

        Self {
            channel: channel.canonical(),
            sample_rate,
            frame_len,
            hop_len,
            hann: hann_window(frame_len),
            fft,
            buffer: Vec::with_capacity(frame_len * 2),
            next_frame_ts: 0,
            rms_window: RingWindow::new(baseline_frames),
            centroid_window: RingWindow::new(baseline_frames),
            rms_exceed_since: None,
            centroid_exceed_since: None,
            last_event_ts: None,
            active_profile: ProfileKind::Default,
            metrics,
            bus,
            config,
        }
    }

    fn baseline_frames(config: &AudioAnomalyConfig, hop_len: usize, sample_rate: u32) -> usize {
        let hop_ms = (hop_len as u64 * 1000 / sample_rate as u64).max(1);
        ((config.baseline_window_ms / hop_ms) as usize).max(MIN_BASELINE_FRAMES)
    }

    fn hop_ms(&self) -> i64 {
        (self.hop_len as i64 * 1000 / self.sample_rate as i64).max(1)
    }

    fn path(&self, name: &str) -> String {
        format!("detector.audio-anomaly.{}.{name}", self.channel)
    }

    fn profile_kind_for(&self, ts_ms: i64) -> ProfileKind {
        let hour = Local
            .timestamp_millis_opt(ts_ms)
            .single()
            .map(|dt| dt.hour() as u8);
        let Some(hour) = hour else {
            return ProfileKind::Default;
        };
        if let Some(night) = &self.config.night_hours
            && night.contains_hour(hour)
        {
            if self.config.night_profile.is_some() {
                return ProfileKind::Night;
            }
        } else if self.config.day_profile.is_some() {
            return ProfileKind::Day;
        }
        ProfileKind::Default
    }

    fn profile(&self, kind: ProfileKind) -> AudioProfile {
        match kind {
            ProfileKind::Default => self.config.default_profile,
            ProfileKind::Day => self
                .config
                .day_profile
                .unwrap_or(self.config.default_profile),
            ProfileKind::Night => self
                .config
                .night_profile
                .unwrap_or(self.config.default_profile),
        }
    }

    /// Feed one PCM chunk; returns any events emitted by the frames that
    /// completed inside it.
    pub fn process_chunk(&mut self, samples: &[i16], ts_ms: i64) -> Vec<EventPayload> {
        if samples.is_empty() {
            return Vec::new();
        }
        // Resync the frame clock when the stream jumps (source restart,
        // long gap); buffered samples from before the gap are stale.
        let buffered_ms = self.buffer.len() as i64 * 1000 / self.sample_rate as i64;
        let expected_ts = self.next_frame_ts + buffered_ms;
        if self.buffer.is_empty() || (ts_ms - expected_ts).abs() > RESYNC_SLACK_MS {
            self.buffer.clear();
            self.next_frame_ts = ts_ms;
        }
        self.buffer
            .extend(samples.iter().map(|s| *s as f32 / 32_768.0));

        let mut events = Vec::new();
        while self.buffer.len() >= self.frame_len {
            let frame_ts = self.next_frame_ts;
            if let Some(event) = self.process_frame(frame_ts) {
                events.push(event);
            }
            self.buffer.drain(..self.hop_len);
            self.next_frame_ts += self.hop_ms();
        }
        events
    }

    fn process_frame(&mut self, ts_ms: i64) -> Option<EventPayload> {
        // Profile schedule: a switch resizes the rolling baselines and
        // resets the sustain clocks, but keeps the last-event timestamp.
        let profile_kind = self.profile_kind_for(ts_ms);
        if profile_kind != self.active_profile {
            self.active_profile = profile_kind;
            self.rms_window.clear();
            self.centroid_window.clear();
            self.rms_exceed_since = None;
            self.centroid_exceed_since = None;
        }
        let profile = self.profile(profile_kind);

        let frame = &self.buffer[..self.frame_len];
        let rms = (frame.iter().map(|s| (*s as f64).powi(2)).sum::<f64>()
            / self.frame_len as f64)
            .sqrt();
        let centroid = self.spectral_centroid(frame);

        let baseline_ready = self.rms_window.len() >= MIN_BASELINE_FRAMES;
        let rms_baseline = self.rms_window.mean();
        let centroid_baseline = self.centroid_window.mean();
        let rms_delta = (rms - rms_baseline).abs();
        let centroid_delta = (centroid - centroid_baseline).abs();
        self.rms_window.push(rms);
        self.centroid_window.push(centroid);

        let set = |name: &str, value: f64| self.metrics.set_gauge(&self.path(name), value);
        set("rms", rms);
        set("rmsBaseline", rms_baseline);
        set("rmsDelta", rms_delta);
        set("centroidHz", centroid);
        set("centroidBaselineHz", centroid_baseline);
        set("centroidDeltaHz", centroid_delta);

        if !baseline_ready {
            return None;
        }

        let sustain = self.config.min_trigger_duration_ms as i64;
        let rms_sustained = if rms_delta >= profile.rms_delta_threshold {
            let since = *self.rms_exceed_since.get_or_insert(ts_ms);
            ts_ms - since >= sustain
        } else {
            self.rms_exceed_since = None;
            false
        };
        let centroid_sustained = if centroid_delta >= profile.centroid_delta_threshold_hz {
            let since = *self.centroid_exceed_since.get_or_insert(ts_ms);
            ts_ms - since >= sustain
        } else {
            self.centroid_exceed_since = None;
            false
        };

        if !rms_sustained && !centroid_sustained {
            return None;
        }

        if let Some(last) = self.last_event_ts
            && ts_ms.saturating_sub(last) < self.config.min_interval_ms as i64
        {
            self.metrics
                .increment_counter(&self.path("minIntervalSuppressed"), 1);
            return None;
        }

        let (severity, message) = if rms_sustained {
            (
                EventSeverity::Critical,
                format!(
                    "audio level anomaly: rms delta {:.3} over baseline {:.3}",
                    rms_delta, rms_baseline
                ),
            )
        } else {
            (
                EventSeverity::Warning,
                format!(
                    "audio spectrum anomaly: centroid shifted {:.0}Hz from {:.0}Hz",
                    centroid_delta, centroid_baseline
                ),
            )
        };

        self.last_event_ts = Some(ts_ms);
        self.rms_exceed_since = None;
        self.centroid_exceed_since = None;
        self.metrics.increment_counter(&self.path("events"), 1);

        let mut meta = serde_json::Map::new();
        meta.insert("rms".into(), json!(rms));
        meta.insert("rmsBaseline".into(), json!(rms_baseline));
        meta.insert("rmsDelta".into(), json!(rms_delta));
        meta.insert("rmsThreshold".into(), json!(profile.rms_delta_threshold));
        meta.insert("centroidHz".into(), json!(centroid));
        meta.insert("centroidBaselineHz".into(), json!(centroid_baseline));
        meta.insert("centroidDeltaHz".into(), json!(centroid_delta));
        meta.insert(
            "centroidThresholdHz".into(),
            json!(profile.centroid_delta_threshold_hz),
        );
        meta.insert("profile".into(), json!(profile_kind.as_str()));
        meta.insert("frameSamples".into(), json!(self.frame_len));
        meta.insert("hopSamples".into(), json!(self.hop_len));

        let event = EventPayload {
            ts: ts_ms,
            detector: DetectorKind::AudioAnomaly,
            source: self.channel.clone(),
            severity,
            message,
            meta,
        };
        self.bus.publish(event.clone());
        Some(event)
    }

    fn spectral_centroid(&self, frame: &[f32]) -> f64 {
        let mut spectrum: Vec<Complex<f32>> = frame
            .iter()
            .zip(&self.hann)
            .map(|(s, w)| Complex::new(s * w, 0.0))
            .collect();
        self.fft.process(&mut spectrum);

        let bins = self.frame_len / 2;
        let bin_hz = self.sample_rate as f64 / self.frame_len as f64;
        let mut weighted = 0.0f64;
        let mut total = 0.0f64;
        for (k, value) in spectrum.iter().take(bins).enumerate().skip(1) {
            let magnitude = value.norm() as f64;
            weighted += magnitude * (k as f64 * bin_hz);
            total += magnitude;
        }
        if total <= f64::EPSILON {
            0.0
        } else {
            weighted / total
        }
    }

    /// Apply new options. Frame/hop geometry changes rebuild the analysis
    /// state entirely; anything else preserves the last-event timestamp.
    pub fn update_options(&mut self, config: AudioAnomalyConfig) {
        let frame_len = config.frame_len(self.sample_rate);
        let hop_len = config.hop_len(self.sample_rate).min(frame_len);
        let geometry_changed = frame_len != self.frame_len || hop_len != self.hop_len;

        if geometry_changed {
            self.frame_len = frame_len;
            self.hop_len = hop_len;
            self.hann = hann_window(frame_len);
            self.fft = FftPlanner::new().plan_fft_forward(frame_len);
            self.buffer.clear();
            self.last_event_ts = None;
        }

        let baseline_frames = Self::baseline_frames(&config, hop_len, self.sample_rate);
        if baseline_frames != self.rms_window.cap() || geometry_changed {
            self.rms_window.resize(baseline_frames);
            self.centroid_window.resize(baseline_frames);
            self.rms_exceed_since = None;
            self.centroid_exceed_since = None;
        }

        self.config = config;
    }
}
