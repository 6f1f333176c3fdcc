//! Adaptive frame-differencing motion detector.
//!
//! The detector does not emit raw motion; it emits motion admitted by the
//! adaptive noise gate. Flickering light, sensor noise, and compression
//! artifacts raise the temporal suppression counter and the sustained-noise
//! boost, which in turn inflate the area threshold and the debounce/backoff
//! budgets until the scene calms down or a genuine breakout punches through.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::debug;

use guardian_config::MotionConfig;
use guardian_model::{ChannelId, DetectorKind, EventPayload, EventSeverity};

use crate::events::EventBus;
use crate::metrics::{MetricsRegistry, SuppressionEvent};

use super::adaptive::{
    DenoiseStrategy, Ema, NoiseOutput, NoiseTracker, RingWindow, TemporalGate,
    TemporalGateOutput, denoise,
};

const TREND_ALPHA: f64 = 0.3;
const FLOOR_EPSILON: f64 = 1e-3;

#[derive(Debug, Clone)]
struct Baseline {
    data: Vec<f32>,
    width: usize,
    height: usize,
}

#[derive(Debug)]
pub struct MotionDetector {
    config: MotionConfig,
    channel: String,
    metrics: Arc<MetricsRegistry>,
    bus: Arc<EventBus>,

    baseline: Option<Baseline>,
    delta_trend: Ema,
    area_trend: Ema,
    delta_window: RingWindow,
    area_window: RingWindow,
    gate: TemporalGate,
    noise: NoiseTracker,

    pending_frames: u32,
    backoff_remaining: u32,
    warmup_remaining: u32,
    rebaseline_countdown: u32,

    suppressed_frames: u64,
    backoff_suppressed_frames: u64,
    pending_suppressed_before_trigger: u64,
    backoff_activations: u64,
    idle_resets: u64,
    adaptive_rebaselines: u64,

    last_event_ts: Option<i64>,
    last_frame_ts: Option<i64>,
    last_denoise: DenoiseStrategy,
}

/// Everything computed for one frame, shared by the gauge publisher and the
/// event meta snapshot.
struct FrameComputation {
    delta: f64,
    area_pct: f64,
    stabilized: f64,
    area_adaptive_threshold: f64,
    effective_debounce: u32,
    effective_backoff: u32,
    gate: TemporalGateOutput,
    noise: NoiseOutput,
}

impl MotionDetector {
    pub fn new(
        channel: &ChannelId,
        mut config: MotionConfig,
        metrics: Arc<MetricsRegistry>,
        bus: Arc<EventBus>,
    ) -> Self {
        config.normalize();
        Self {
            channel: channel.canonical(),
            delta_trend: Ema::new(TREND_ALPHA),
            area_trend: Ema::new(TREND_ALPHA),
            delta_window: RingWindow::new(config.delta_window),
            area_window: RingWindow::new(config.delta_window),
            gate: TemporalGate::new(config.temporal_median_window, config.temporal_median_margin),
            noise: NoiseTracker::new(
                config.noise_window,
                config.temporal_median_backoff_smoothing,
            ),
            baseline: None,
            pending_frames: 0,
            backoff_remaining: 0,
            warmup_remaining: config.warmup_frames,
            rebaseline_countdown: 0,
            suppressed_frames: 0,
            backoff_suppressed_frames: 0,
            pending_suppressed_before_trigger: 0,
            backoff_activations: 0,
            idle_resets: 0,
            adaptive_rebaselines: 0,
            last_event_ts: None,
            last_frame_ts: None,
            last_denoise: DenoiseStrategy::Standard,
            metrics,
            bus,
            config,
        }
    }

    pub fn suppressed_frames(&self) -> u64 {
        self.suppressed_frames
    }

    pub fn pending_suppressed_before_trigger(&self) -> u64 {
        self.pending_suppressed_before_trigger
    }

    pub fn idle_resets(&self) -> u64 {
        self.idle_resets
    }

    pub fn adaptive_rebaselines(&self) -> u64 {
        self.adaptive_rebaselines
    }

    pub fn warmup_remaining(&self) -> u32 {
        self.warmup_remaining
    }

    fn path(&self, name: &str) -> String {
        format!("detector.motion.{}.{name}", self.channel)
    }

    fn bump(&self, name: &str) {
        self.metrics.increment_counter(&self.path(name), 1);
    }

    fn reset_adaptive_state(&mut self, wipe_baseline: bool) {
        self.delta_trend.reset();
        self.area_trend.reset();
        self.delta_window.clear();
        self.area_window.clear();
        self.gate.reset();
        self.noise.reset();
        self.pending_frames = 0;
        self.backoff_remaining = 0;
        self.rebaseline_countdown = 0;
        if wipe_baseline {
            self.baseline = None;
        }
    }

    fn blend_baseline(&mut self, frame: &[f32]) {
        if let Some(baseline) = &mut self.baseline {
            let blend = self.config.baseline_blend as f32;
            for (b, f) in baseline.data.iter_mut().zip(frame) {
                *b += blend * (*f - *b);
            }
        }
    }

    /// Schedule / advance the adaptive rebaseline countdown. Runs once per
    /// processed frame, after the adaptive outputs are known.
    fn tick_rebaseline(&mut self, pressure: f64, boost: f64) {
        if self.warmup_remaining > 0 {
            return;
        }
        if self.rebaseline_countdown == 0 {
            if pressure > 0.5 || boost >= 1.6 {
                let frames = ((self.config.debounce_frames + self.config.backoff_frames) as f64)
                    .max(0.5 * self.delta_window.cap() as f64);
                self.rebaseline_countdown = frames.ceil() as u32;
            }
        } else {
            self.rebaseline_countdown -= 1;
            if self.rebaseline_countdown == 0 && pressure > 0.5 {
                // Pressure never let up: start the adaptive windows over.
                self.reset_adaptive_state(false);
                self.adaptive_rebaselines += 1;
                self.bump("adaptiveRebaselines");
                self.metrics.record_suppression(SuppressionEvent {
                    detector: DetectorKind::Motion,
                    channel: self.channel.clone(),
                    reason: "adaptive-rebaseline".into(),
                    suppressed_frames: self.suppressed_frames,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    fn publish_gauges(&self, c: &FrameComputation) {
        let set = |name: &str, value: f64| self.metrics.set_gauge(&self.path(name), value);
        set("delta", c.delta);
        set("areaPct", c.area_pct);
        set("stabilizedDelta", c.stabilized);
        set("noiseWindowMedian", c.noise.median_ratio);
        set("noiseWindowPressure", c.noise.pressure);
        set("noiseWindowBoost", c.noise.boost);
        set("effectiveDebounceFrames", c.effective_debounce as f64);
        set("effectiveBackoffFrames", c.effective_backoff as f64);
        set("noiseBackoffPadding", c.gate.padding as f64);
        set("temporalWindow", self.gate.window_len() as f64);
        set("temporalSuppression", c.gate.suppression);
        set("temporalGateMultiplier", c.gate.multiplier);
        set("temporalAdaptiveThreshold", c.area_adaptive_threshold);
        set("rebaselineCountdown", self.rebaseline_countdown as f64);
        set("noiseWarmupRemaining", self.warmup_remaining as f64);
        set(
            "pendingSuppressedFramesBeforeTrigger",
            self.pending_suppressed_before_trigger as f64,
        );
    }

    fn meta(&self, c: &FrameComputation, pending_suppressed: u64) -> serde_json::Map<String, serde_json::Value> {
        let mut meta = serde_json::Map::new();
        meta.insert("delta".into(), json!(c.delta));
        meta.insert("areaPct".into(), json!(c.area_pct));
        meta.insert("stabilizedDelta".into(), json!(c.stabilized));
        meta.insert(
            "areaAdaptiveThreshold".into(),
            json!(c.area_adaptive_threshold),
        );
        meta.insert("noiseRatio".into(), json!(c.noise.ratio));
        meta.insert("noiseFloor".into(), json!(c.noise.floor));
        meta.insert("noiseWindowMedian".into(), json!(c.noise.median_ratio));
        meta.insert("noiseWindowPressure".into(), json!(c.noise.pressure));
        meta.insert("noiseWindowBoost".into(), json!(c.noise.boost));
        meta.insert("temporalWindow".into(), json!(self.gate.window_len()));
        meta.insert("temporalSuppression".into(), json!(c.gate.suppression));
        meta.insert("temporalGateMultiplier".into(), json!(c.gate.multiplier));
        meta.insert("noiseBackoffPadding".into(), json!(c.gate.padding));
        meta.insert(
            "effectiveDebounceFrames".into(),
            json!(c.effective_debounce),
        );
        meta.insert("effectiveBackoffFrames".into(), json!(c.effective_backoff));
        meta.insert("suppressedFrames".into(), json!(self.suppressed_frames));
        meta.insert(
            "pendingSuppressedFramesBeforeTrigger".into(),
            json!(pending_suppressed),
        );
        meta.insert("backoffActivations".into(), json!(self.backoff_activations));
        meta.insert(
            "denoiseStrategy".into(),
            json!(self.last_denoise.as_str()),
        );
        meta.insert("warmupRemaining".into(), json!(self.warmup_remaining));
        meta.insert(
            "rebaselineCountdown".into(),
            json!(self.rebaseline_countdown),
        );
        meta
    }

    /// Process one grayscale frame. Returns the emitted event, if any; the
    /// event is also published on the bus.
    pub fn process_frame(
        &mut self,
        data: &[u8],
        width: u32,
        height: u32,
        ts_ms: i64,
    ) -> Option<EventPayload> {
        let width = width as usize;
        let height = height as usize;
        if data.len() != width * height || data.is_empty() {
            self.bump("corruptFrames");
            return None;
        }

        // Idle rebaseline: a long gap since the previous frame invalidates
        // every adaptive assumption, including lifetime suppression counts.
        if self.config.idle_rebaseline_ms > 0
            && let Some(previous) = self.last_frame_ts
            && ts_ms.saturating_sub(previous) >= self.config.idle_rebaseline_ms as i64
        {
            self.reset_adaptive_state(true);
            self.warmup_remaining = self.config.warmup_frames;
            self.suppressed_frames = 0;
            self.backoff_suppressed_frames = 0;
            self.pending_suppressed_before_trigger = 0;
            self.idle_resets += 1;
            self.bump("idleResets");
            debug!(channel = %self.channel, "idle rebaseline");
        }
        self.last_frame_ts = Some(ts_ms);

        let frame: Vec<f32> = data.iter().map(|b| *b as f32).collect();

        // Baseline bootstrap, and auto-resize on geometry change.
        match &self.baseline {
            None => {
                self.baseline = Some(Baseline {
                    data: frame,
                    width,
                    height,
                });
                return None;
            }
            Some(baseline) if baseline.width != width || baseline.height != height => {
                self.reset_adaptive_state(false);
                self.baseline = Some(Baseline {
                    data: frame,
                    width,
                    height,
                });
                self.bump("baselineResizes");
                return None;
            }
            Some(_) => {}
        }

        // Denoise, escalating to heavier cascades while the result stays
        // noisy; the variant with the lowest delta against baseline wins.
        let baseline_data = self.baseline.as_ref().map(|b| b.data.clone()).unwrap_or_default();
        let diff_threshold = self.config.diff_threshold;
        let floor = self
            .noise
            .current_floor()
            .unwrap_or(f64::MAX)
            .max(FLOOR_EPSILON);

        let mut strategy = DenoiseStrategy::Standard;
        let mut smoothed = denoise(&frame, width, height, strategy);
        let mut delta = mean_abs_diff(&smoothed, &baseline_data);
        let needs_retry = |delta: f64| {
            let ratio = delta / floor;
            ratio > 1.6 || (delta < 0.5 * diff_threshold && ratio > 1.2)
        };
        if needs_retry(delta) {
            for candidate in [DenoiseStrategy::HeavyCascade, DenoiseStrategy::MedianLead] {
                let candidate_frame = denoise(&frame, width, height, candidate);
                let candidate_delta = mean_abs_diff(&candidate_frame, &baseline_data);
                if candidate_delta < delta {
                    strategy = candidate;
                    smoothed = candidate_frame;
                    delta = candidate_delta;
                }
                if !needs_retry(delta) {
                    break;
                }
            }
        }
        self.last_denoise = strategy;

        let area_pct = area_percent(&smoothed, &baseline_data, diff_threshold);

        // Trend smoothing and the stabilized delta. The area baseline for
        // the adaptive threshold is the trend as it stood before this frame,
        // so an onset is judged against the scene's past, not itself.
        let trend = self.delta_trend.update(delta);
        let window_median = self.delta_window.median();
        let stabilized = delta.max(trend).max(window_median);
        self.delta_window.push(delta);
        let area_baseline = self.area_trend.get();
        self.area_trend.update(area_pct);
        self.area_window.push(area_pct);

        let gate = self.gate.observe(stabilized);
        let noise = self.noise.observe(delta);

        let area_adaptive_threshold = self
            .config
            .area_threshold
            .max(area_baseline * self.config.area_inflation)
            * noise.suppression_factor
            * gate.multiplier;
        let effective_debounce = ((self.config.debounce_frames as f64)
            * noise.suppression_factor
            * noise.boost)
            .ceil() as u32
            + gate.padding;
        let effective_backoff = ((self.config.backoff_frames as f64)
            * noise.suppression_factor
            * noise.boost)
            .ceil() as u32
            + gate.padding;

        let computation = FrameComputation {
            delta,
            area_pct,
            stabilized,
            area_adaptive_threshold,
            effective_debounce,
            effective_backoff,
            gate,
            noise,
        };

        // Warmup: adapt silently.
        if self.warmup_remaining > 0 {
            self.warmup_remaining -= 1;
            self.blend_baseline(&smoothed);
            self.suppressed_frames += 1;
            self.bump("suppressedFrames");
            self.publish_gauges(&computation);
            return None;
        }

        // Adaptive gate and backoff.
        let in_backoff = self.backoff_remaining > 0;
        if area_pct < area_adaptive_threshold || in_backoff {
            self.blend_baseline(&smoothed);
            if in_backoff {
                self.backoff_remaining -= 1;
                self.backoff_suppressed_frames += 1;
                self.bump("backoffSuppressedFrames");
            }
            if self.pending_frames > 0 {
                self.pending_frames -= 1;
                self.pending_suppressed_before_trigger += 1;
            }
            self.suppressed_frames += 1;
            self.bump("suppressedFrames");
            self.tick_rebaseline(noise.pressure, noise.boost);
            self.publish_gauges(&computation);
            return None;
        }

        // Debounce.
        self.pending_frames += 1;
        if self.pending_frames < effective_debounce {
            self.tick_rebaseline(noise.pressure, noise.boost);
            self.publish_gauges(&computation);
            return None;
        }

        // Min interval.
        if let Some(last) = self.last_event_ts
            && ts_ms.saturating_sub(last) < self.config.min_interval_ms as i64
        {
            self.pending_frames = 0;
            self.backoff_remaining = effective_backoff;
            self.pending_suppressed_before_trigger = 0;
            self.bump("minIntervalSuppressed");
            self.tick_rebaseline(noise.pressure, noise.boost);
            self.publish_gauges(&computation);
            return None;
        }

        // Emit.
        self.last_event_ts = Some(ts_ms);
        self.pending_frames = 0;
        self.backoff_remaining = effective_backoff;
        self.backoff_activations += 1;
        self.bump("backoffActivations");
        self.bump("events");
        let pending_suppressed = self.pending_suppressed_before_trigger;
        self.pending_suppressed_before_trigger = 0;
        self.blend_baseline(&smoothed);

        let meta = self.meta(&computation, pending_suppressed);
        let event = EventPayload {
            ts: ts_ms,
            detector: DetectorKind::Motion,
            source: self.channel.clone(),
            severity: EventSeverity::Warning,
            message: format!(
                "motion detected: {:.1}% of frame changed (threshold {:.1}%)",
                area_pct, area_adaptive_threshold
            ),
            meta,
        };
        self.bus.publish(event.clone());
        self.tick_rebaseline(noise.pressure, noise.boost);
        self.publish_gauges(&computation);
        Some(event)
    }

    /// Apply new options without losing what the adaptive gate has learned.
    ///
    /// Non-geometry changes (thresholds, debounce, intervals) apply live and
    /// preserve the suppression counters; window-geometry changes reset the
    /// adaptive windows but still keep the lifetime counters.
    pub fn update_options(&mut self, mut config: MotionConfig) {
        config.normalize();
        let geometry_changed = config.noise_window != self.config.noise_window
            || config.delta_window != self.config.delta_window
            || config.temporal_median_window != self.config.temporal_median_window;

        if geometry_changed {
            self.delta_window.resize(config.delta_window);
            self.area_window.resize(config.delta_window);
            self.gate
                .resize(config.temporal_median_window, config.temporal_median_margin);
            self.noise
                .resize(config.noise_window, config.temporal_median_backoff_smoothing);
            self.pending_frames = 0;
            self.backoff_remaining = 0;
            self.rebaseline_countdown = 0;
        } else {
            self.gate.set_margin(config.temporal_median_margin);
            self.noise
                .set_boost_alpha(config.temporal_median_backoff_smoothing);
        }

        self.config = config;
    }
}

fn mean_abs_diff(frame: &[f32], baseline: &[f32]) -> f64 {
    if frame.is_empty() || frame.len() != baseline.len() {
        return 0.0;
    }
    let sum: f64 = frame
        .iter()
        .zip(baseline)
        .map(|(f, b)| (*f as f64 - *b as f64).abs())
        .sum();
    sum / frame.len() as f64
}

fn area_percent(frame: &[f32], baseline: &[f32], diff_threshold: f64) -> f64 {
    if frame.is_empty() || frame.len() != baseline.len() {
        return 0.0;
    }
    let hits = frame
        .iter()
        .zip(baseline)
        .filter(|(f, b)| (**f as f64 - **b as f64).abs() >= diff_threshold)
        .count();
    100.0 * hits as f64 / frame.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(config: MotionConfig) -> (MotionDetector, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::new());
        let bus = Arc::new(EventBus::default());
        let channel = ChannelId::parse("cam-a", guardian_model::ChannelKind::Video);
        (
            MotionDetector::new(&channel, config, metrics.clone(), bus),
            metrics,
        )
    }

    fn quick_config() -> MotionConfig {
        MotionConfig {
            warmup_frames: 0,
            debounce_frames: 1,
            backoff_frames: 2,
            min_interval_ms: 0,
            idle_rebaseline_ms: 0,
            ..MotionConfig::default()
        }
    }

    fn flat(size: usize, value: u8) -> Vec<u8> {
        vec![value; size * size]
    }

    /// Brighten the top half of a flat frame.
    fn half_bright(size: usize, base: u8, boost: u8) -> Vec<u8> {
        let mut frame = flat(size, base);
        for pixel in frame.iter_mut().take(size * size / 2) {
            *pixel = base.saturating_add(boost);
        }
        frame
    }

    /// Low-amplitude checkerboard jitter, below the diff threshold.
    fn jitter(size: usize, base: u8, amplitude: u8) -> Vec<u8> {
        let mut frame = flat(size, base);
        for (i, pixel) in frame.iter_mut().enumerate() {
            if i % 2 == 0 {
                *pixel = base.saturating_add(amplitude);
            }
        }
        frame
    }

    #[test]
    fn flicker_is_suppressed_by_the_temporal_gate() {
        // 12x12 baseline of 42, then twelve alternating flicker frames:
        // two bright-half frames, one low-amplitude jitter frame, cycling.
        let config = MotionConfig {
            debounce_frames: 2,
            ..quick_config()
        };
        let (mut detector, metrics) = detector(config);
        let mut ts = 0i64;
        let mut events = 0;

        assert!(detector.process_frame(&flat(12, 42), 12, 12, ts).is_none());
        for cycle in 0..4 {
            for frame in [
                half_bright(12, 42, 120),
                half_bright(12, 42, 120),
                jitter(12, 42, 3),
            ] {
                ts += 200;
                if detector.process_frame(&frame, 12, 12, ts).is_some() {
                    events += 1;
                }
            }
            let _ = cycle;
        }

        assert_eq!(events, 0, "flicker must not produce motion events");
        let gauge = |name: &str| {
            metrics
                .gauge(&format!("detector.motion.video:cam-a.{name}"))
                .unwrap_or(0.0)
        };
        assert!(gauge("temporalWindow") > 0.0);
        assert!(gauge("temporalSuppression") > 0.0);
        assert!(gauge("effectiveDebounceFrames") >= 3.0);
        assert!(gauge("temporalGateMultiplier") > 1.0);
        assert!(detector.suppressed_frames() > 0);
    }

    #[test]
    fn motion_emits_after_quiet_baseline() {
        let (mut detector, _metrics) = detector(quick_config());
        let mut ts = 0i64;
        detector.process_frame(&flat(8, 42), 8, 8, ts);
        for _ in 0..6 {
            ts += 200;
            assert!(detector.process_frame(&flat(8, 42), 8, 8, ts).is_none());
        }

        let mut emitted = None;
        for _ in 0..8 {
            ts += 200;
            if let Some(event) = detector.process_frame(&half_bright(8, 42, 120), 8, 8, ts) {
                emitted = Some(event);
                break;
            }
        }
        let event = emitted.expect("sustained brightening must emit");
        assert_eq!(event.severity, EventSeverity::Warning);
        assert_eq!(event.source, "video:cam-a");
        assert!(event.meta.contains_key("areaAdaptiveThreshold"));
        assert!(event.meta.contains_key("temporalGateMultiplier"));
        assert!(event.meta["denoiseStrategy"].is_string());
    }

    #[test]
    fn resize_recovers_and_emits_again() {
        let (mut detector, _metrics) = detector(quick_config());
        let mut ts = 0i64;

        // 6x6 incarnation
        detector.process_frame(&flat(6, 42), 6, 6, ts);
        for _ in 0..5 {
            ts += 200;
            detector.process_frame(&flat(6, 42), 6, 6, ts);
        }
        let mut first = false;
        for _ in 0..10 {
            ts += 200;
            if detector.process_frame(&half_bright(6, 42, 120), 6, 6, ts).is_some() {
                first = true;
                break;
            }
        }
        assert!(first, "expected an event at 6x6");

        // Geometry change: 10x10 baseline, then brightening again.
        ts += 200;
        assert!(detector.process_frame(&flat(10, 42), 10, 10, ts).is_none());
        for _ in 0..5 {
            ts += 200;
            detector.process_frame(&flat(10, 42), 10, 10, ts);
        }
        let mut second = false;
        for _ in 0..12 {
            ts += 200;
            if detector
                .process_frame(&half_bright(10, 42, 120), 10, 10, ts)
                .is_some()
            {
                second = true;
                break;
            }
        }
        assert!(second, "expected an event after the geometry change");
    }

    #[test]
    fn warmup_suppresses_and_counts() {
        let config = MotionConfig {
            warmup_frames: 3,
            ..quick_config()
        };
        let (mut detector, metrics) = detector(config);
        let mut ts = 0i64;
        detector.process_frame(&flat(8, 42), 8, 8, ts);
        for _ in 0..3 {
            ts += 200;
            assert!(
                detector
                    .process_frame(&half_bright(8, 42, 120), 8, 8, ts)
                    .is_none()
            );
        }
        assert_eq!(detector.warmup_remaining(), 0);
        assert_eq!(detector.suppressed_frames(), 3);
        assert_eq!(
            metrics.counter("detector.motion.video:cam-a.suppressedFrames"),
            3
        );
    }

    #[test]
    fn min_interval_limits_emission_rate() {
        let config = MotionConfig {
            min_interval_ms: 60_000,
            ..quick_config()
        };
        let (mut detector, _metrics) = detector(config);
        let mut ts = 0i64;
        detector.process_frame(&flat(8, 42), 8, 8, ts);
        for _ in 0..5 {
            ts += 200;
            detector.process_frame(&flat(8, 42), 8, 8, ts);
        }

        let mut events = 0;
        for _ in 0..20 {
            ts += 200;
            if detector
                .process_frame(&half_bright(8, 42, 120), 8, 8, ts)
                .is_some()
            {
                events += 1;
            }
        }
        assert_eq!(events, 1, "one event per min interval");
    }

    #[test]
    fn update_options_preserves_suppression_counters() {
        let (mut detector, _metrics) = detector(quick_config());
        let mut ts = 0i64;
        detector.process_frame(&flat(8, 42), 8, 8, ts);
        for _ in 0..6 {
            ts += 200;
            detector.process_frame(&jitter(8, 42, 3), 8, 8, ts);
        }
        let suppressed = detector.suppressed_frames();
        assert!(suppressed > 0);
        detector.pending_suppressed_before_trigger = 4;

        // Non-geometry change: thresholds only.
        let mut non_geometry = quick_config();
        non_geometry.area_threshold = 9.0;
        detector.update_options(non_geometry);
        assert_eq!(detector.suppressed_frames(), suppressed);
        assert_eq!(detector.pending_suppressed_before_trigger(), 4);

        // Geometry change: windows reset, lifetime counters survive.
        let mut geometry = quick_config();
        geometry.temporal_median_window = 21;
        detector.update_options(geometry);
        assert_eq!(detector.suppressed_frames(), suppressed);
        assert_eq!(detector.pending_suppressed_before_trigger(), 4);
        assert_eq!(detector.gate.window_len(), 0);
    }

    #[test]
    fn idle_rebaseline_fires_once_per_gap() {
        let config = MotionConfig {
            idle_rebaseline_ms: 5_000,
            warmup_frames: 2,
            ..quick_config()
        };
        let (mut detector, metrics) = detector(config);
        detector.process_frame(&flat(8, 42), 8, 8, 0);
        detector.process_frame(&jitter(8, 42, 3), 8, 8, 200);
        detector.process_frame(&jitter(8, 42, 3), 8, 8, 400);
        let before = detector.suppressed_frames();
        assert!(before > 0);

        // Gap over the idle threshold: exactly one reset.
        detector.process_frame(&flat(8, 42), 8, 8, 6_000);
        assert_eq!(detector.idle_resets(), 1);
        assert_eq!(detector.suppressed_frames(), 0);
        assert_eq!(detector.pending_suppressed_before_trigger(), 0);
        assert_eq!(detector.warmup_remaining(), 2);
        assert_eq!(metrics.counter("detector.motion.video:cam-a.idleResets"), 1);

        // The next prompt frame does not fire again.
        detector.process_frame(&flat(8, 42), 8, 8, 6_200);
        assert_eq!(detector.idle_resets(), 1);
    }

    #[test]
    fn mismatched_frame_length_counts_as_corrupt() {
        let (mut detector, metrics) = detector(quick_config());
        assert!(detector.process_frame(&[1, 2, 3], 8, 8, 0).is_none());
        assert_eq!(metrics.counter("detector.motion.video:cam-a.corruptFrames"), 1);
    }
}
