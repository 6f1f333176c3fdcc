//! Adaptive luminance-change detector.
//!
//! Shares the motion detector's adaptive skeleton but operates on the
//! scalar mean luminance of each frame. A normal-hours schedule (overnight
//! ranges supported) marks windows where light changes are expected: the
//! baseline keeps adapting but nothing is emitted.

use std::sync::Arc;

use chrono::{Local, TimeZone, Timelike};
use serde_json::json;
use tracing::debug;

use guardian_config::{HourRange, LightConfig};
use guardian_model::{ChannelId, DetectorKind, EventPayload, EventSeverity};

use crate::events::EventBus;
use crate::metrics::MetricsRegistry;

use super::adaptive::{Ema, NoiseOutput, NoiseTracker, RingWindow, TemporalGate, TemporalGateOutput};

const TREND_ALPHA: f64 = 0.3;

#[derive(Debug)]
pub struct LightDetector {
    config: LightConfig,
    channel: String,
    metrics: Arc<MetricsRegistry>,
    bus: Arc<EventBus>,

    baseline: Option<f64>,
    delta_trend: Ema,
    delta_window: RingWindow,
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
}

struct FrameComputation {
    luminance: f64,
    delta: f64,
    stabilized: f64,
    adaptive_threshold: f64,
    effective_debounce: u32,
    effective_backoff: u32,
    gate: TemporalGateOutput,
    noise: NoiseOutput,
    normal_hours_active: bool,
}

impl LightDetector {
    pub fn new(
        channel: &ChannelId,
        mut config: LightConfig,
        metrics: Arc<MetricsRegistry>,
        bus: Arc<EventBus>,
    ) -> Self {
        config.normalize();
        Self {
            channel: channel.canonical(),
            delta_trend: Ema::new(TREND_ALPHA),
            delta_window: RingWindow::new(config.delta_window),
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

    fn path(&self, name: &str) -> String {
        format!("detector.light.{}.{name}", self.channel)
    }

    fn bump(&self, name: &str) {
        self.metrics.increment_counter(&self.path(name), 1);
    }

    fn reset_adaptive_state(&mut self, wipe_baseline: bool) {
        self.delta_trend.reset();
        self.delta_window.clear();
        self.gate.reset();
        self.noise.reset();
        self.pending_frames = 0;
        self.backoff_remaining = 0;
        self.rebaseline_countdown = 0;
        if wipe_baseline {
            self.baseline = None;
        }
    }

    fn blend_baseline(&mut self, luminance: f64) {
        if let Some(baseline) = &mut self.baseline {
            *baseline += self.config.baseline_blend * (luminance - *baseline);
        }
    }

    fn local_hour(ts_ms: i64) -> Option<u8> {
        Local
            .timestamp_millis_opt(ts_ms)
            .single()
            .map(|dt| dt.hour() as u8)
    }

    fn normal_hours_active(&self, ts_ms: i64) -> bool {
        if self.config.normal_hours.is_empty() {
            return false;
        }
        match Self::local_hour(ts_ms) {
            Some(hour) => self
                .config
                .normal_hours
                .iter()
                .any(|range| range.contains_hour(hour)),
            None => false,
        }
    }

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
                self.reset_adaptive_state(false);
                self.adaptive_rebaselines += 1;
                self.bump("adaptiveRebaselines");
            }
        }
    }

    fn publish_gauges(&self, c: &FrameComputation) {
        let set = |name: &str, value: f64| self.metrics.set_gauge(&self.path(name), value);
        set("luminance", c.luminance);
        set("delta", c.delta);
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
        set("temporalAdaptiveThreshold", c.adaptive_threshold);
        set("rebaselineCountdown", self.rebaseline_countdown as f64);
        set("noiseWarmupRemaining", self.warmup_remaining as f64);
        set(
            "pendingSuppressedFramesBeforeTrigger",
            self.pending_suppressed_before_trigger as f64,
        );
        set(
            "normalHoursActive",
            if c.normal_hours_active { 1.0 } else { 0.0 },
        );
    }

    fn normal_hours_meta(&self, ts_ms: i64) -> serde_json::Value {
        let hour = Self::local_hour(ts_ms);
        let ranges: Vec<serde_json::Value> = self
            .config
            .normal_hours
            .iter()
            .map(|HourRange { start, end }| {
                json!({
                    "start": start,
                    "end": end,
                    "active": hour.map(|h| HourRange { start: *start, end: *end }.contains_hour(h)).unwrap_or(false),
                })
            })
            .collect();
        json!(ranges)
    }

    /// Process one grayscale frame; the scalar mean luminance drives the
    /// detector. Returns the emitted event, if any.
    pub fn process_frame(
        &mut self,
        data: &[u8],
        _width: u32,
        _height: u32,
        ts_ms: i64,
    ) -> Option<EventPayload> {
        if data.is_empty() {
            self.bump("corruptFrames");
            return None;
        }

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

        let luminance =
            data.iter().map(|b| *b as f64).sum::<f64>() / data.len() as f64;

        let Some(baseline) = self.baseline else {
            self.baseline = Some(luminance);
            return None;
        };

        let delta = (luminance - baseline).abs();
        let trend = self.delta_trend.update(delta);
        let window_median = self.delta_window.median();
        let stabilized = delta.max(trend).max(window_median);
        self.delta_window.push(delta);

        let gate = self.gate.observe(stabilized);
        let noise = self.noise.observe(delta);

        let adaptive_threshold =
            self.config.delta_threshold * noise.suppression_factor * gate.multiplier;
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

        let normal_hours_active = self.normal_hours_active(ts_ms);
        let computation = FrameComputation {
            luminance,
            delta,
            stabilized,
            adaptive_threshold,
            effective_debounce,
            effective_backoff,
            gate,
            noise,
            normal_hours_active,
        };

        // Warmup.
        if self.warmup_remaining > 0 {
            self.warmup_remaining -= 1;
            self.blend_baseline(luminance);
            self.suppressed_frames += 1;
            self.bump("suppressedFrames");
            self.publish_gauges(&computation);
            return None;
        }

        // Normal hours: expected light changes adapt the baseline silently.
        if normal_hours_active {
            self.blend_baseline(luminance);
            self.pending_frames = 0;
            self.backoff_remaining = 0;
            self.suppressed_frames += 1;
            self.bump("suppressedFrames");
            self.bump("normalHoursSuppressed");
            self.publish_gauges(&computation);
            return None;
        }

        // Adaptive gate and backoff.
        let in_backoff = self.backoff_remaining > 0;
        if stabilized < adaptive_threshold || in_backoff {
            self.blend_baseline(luminance);
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
        self.blend_baseline(luminance);

        let mut meta = serde_json::Map::new();
        meta.insert("luminance".into(), json!(luminance));
        meta.insert("baseline".into(), json!(baseline));
        meta.insert("delta".into(), json!(delta));
        meta.insert("stabilizedDelta".into(), json!(stabilized));
        meta.insert("adaptiveThreshold".into(), json!(adaptive_threshold));
        meta.insert("normalHoursActive".into(), json!(normal_hours_active));
        meta.insert("normalHours".into(), self.normal_hours_meta(ts_ms));
        meta.insert("noiseRatio".into(), json!(computation.noise.ratio));
        meta.insert(
            "noiseWindowPressure".into(),
            json!(computation.noise.pressure),
        );
        meta.insert("noiseWindowBoost".into(), json!(computation.noise.boost));
        meta.insert(
            "temporalSuppression".into(),
            json!(computation.gate.suppression),
        );
        meta.insert(
            "temporalGateMultiplier".into(),
            json!(computation.gate.multiplier),
        );
        meta.insert(
            "effectiveDebounceFrames".into(),
            json!(computation.effective_debounce),
        );
        meta.insert(
            "effectiveBackoffFrames".into(),
            json!(computation.effective_backoff),
        );
        meta.insert("suppressedFrames".into(), json!(self.suppressed_frames));
        meta.insert(
            "pendingSuppressedFramesBeforeTrigger".into(),
            json!(pending_suppressed),
        );
        meta.insert("warmupRemaining".into(), json!(self.warmup_remaining));

        let event = EventPayload {
            ts: ts_ms,
            detector: DetectorKind::Light,
            source: self.channel.clone(),
            severity: EventSeverity::Warning,
            message: format!(
                "light change detected: luminance delta {:.1} (threshold {:.1})",
                delta, adaptive_threshold
            ),
            meta,
        };
        self.bus.publish(event.clone());
        self.tick_rebaseline(computation.noise.pressure, computation.noise.boost);
        self.publish_gauges(&computation);
        Some(event)
    }

    /// Same preservation contract as the motion detector: non-geometry
    /// changes keep the suppression counters, window-geometry changes reset
    /// the windows only.
    pub fn update_options(&mut self, mut config: LightConfig) {
        config.normalize();
        let geometry_changed = config.noise_window != self.config.noise_window
            || config.delta_window != self.config.delta_window
            || config.temporal_median_window != self.config.temporal_median_window;

        if geometry_changed {
            self.delta_window.resize(config.delta_window);
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    fn detector(config: LightConfig) -> (LightDetector, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::new());
        let bus = Arc::new(EventBus::default());
        let channel = ChannelId::parse("cam-a", guardian_model::ChannelKind::Video);
        (
            LightDetector::new(&channel, config, metrics.clone(), bus),
            metrics,
        )
    }

    fn overnight_config() -> LightConfig {
        LightConfig {
            warmup_frames: 0,
            debounce_frames: 1,
            idle_rebaseline_ms: 0,
            normal_hours: vec![HourRange { start: 22, end: 6 }],
            ..LightConfig::default()
        }
    }

    fn local_ts(hour: u32) -> i64 {
        Local
            .with_ymd_and_hms(2026, 3, 10, hour, 0, 0)
            .single()
            .expect("unambiguous local time")
            .timestamp_millis()
    }

    fn flat(value: u8) -> Vec<u8> {
        vec![value; 64]
    }

    #[test]
    fn overnight_normal_hours_swallow_bright_frames() {
        let (mut detector, metrics) = detector(overnight_config());

        // Baseline in the evening, before normal hours begin.
        let evening = local_ts(20);
        assert!(detector.process_frame(&flat(42), 8, 8, evening).is_none());
        assert!(
            detector
                .process_frame(&flat(42), 8, 8, evening + 200)
                .is_none()
        );

        // Very bright frames at 02:00: inside 22->6, no events.
        let night = local_ts(2);
        for i in 0..2 {
            assert!(
                detector
                    .process_frame(&flat(220), 8, 8, night + i * 200)
                    .is_none()
            );
        }
        assert_eq!(
            metrics.gauge("detector.light.video:cam-a.normalHoursActive"),
            Some(1.0)
        );

        // Same bright frames at 07:00: exactly one event.
        let morning = local_ts(7);
        let mut events = Vec::new();
        for i in 0..15 {
            if let Some(event) = detector.process_frame(&flat(220), 8, 8, morning + i * 200) {
                events.push(event);
            }
        }
        assert_eq!(events.len(), 1, "one light event after normal hours end");
        let event = &events[0];
        assert_eq!(event.severity, EventSeverity::Warning);
        assert_eq!(event.meta["normalHoursActive"], false);
        let delta = event.meta["delta"].as_f64().unwrap();
        let threshold = event.meta["adaptiveThreshold"].as_f64().unwrap();
        assert!(delta >= threshold, "delta {delta} < threshold {threshold}");
        let ranges = event.meta["normalHours"].as_array().unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0]["active"], false);
    }

    #[test]
    fn steady_luminance_never_emits() {
        let (mut detector, _metrics) = detector(LightConfig {
            normal_hours: Vec::new(),
            warmup_frames: 0,
            idle_rebaseline_ms: 0,
            ..LightConfig::default()
        });
        let base = local_ts(12);
        for i in 0..30 {
            assert!(
                detector
                    .process_frame(&flat(90), 8, 8, base + i * 200)
                    .is_none()
            );
        }
    }

    #[test]
    fn warmup_counts_suppressed_frames() {
        let (mut detector, _metrics) = detector(LightConfig {
            warmup_frames: 4,
            normal_hours: Vec::new(),
            idle_rebaseline_ms: 0,
            ..LightConfig::default()
        });
        let base = local_ts(12);
        detector.process_frame(&flat(42), 8, 8, base);
        for i in 0..4 {
            assert!(
                detector
                    .process_frame(&flat(200), 8, 8, base + (i + 1) * 200)
                    .is_none()
            );
        }
        assert_eq!(detector.suppressed_frames(), 4);
    }

    #[test]
    fn idle_rebaseline_zeroes_counters() {
        let (mut detector, _metrics) = detector(LightConfig {
            warmup_frames: 0,
            idle_rebaseline_ms: 5_000,
            normal_hours: Vec::new(),
            ..LightConfig::default()
        });
        let base = local_ts(12);
        detector.process_frame(&flat(42), 8, 8, base);
        detector.process_frame(&flat(44), 8, 8, base + 200);
        detector.process_frame(&flat(44), 8, 8, base + 400);
        assert!(detector.suppressed_frames() > 0);

        detector.process_frame(&flat(42), 8, 8, base + 10_000);
        assert_eq!(detector.idle_resets(), 1);
        assert_eq!(detector.suppressed_frames(), 0);
    }

    #[test]
    fn update_options_preserves_counters() {
        let (mut detector, _metrics) = detector(overnight_config());
        let base = local_ts(12);
        detector.process_frame(&flat(42), 8, 8, base);
        for i in 0..5 {
            detector.process_frame(&flat(43), 8, 8, base + (i + 1) * 200);
        }
        let suppressed = detector.suppressed_frames();
        assert!(suppressed > 0);

        let mut next = overnight_config();
        next.delta_threshold = 50.0;
        detector.update_options(next);
        assert_eq!(detector.suppressed_frames(), suppressed);
    }
}
