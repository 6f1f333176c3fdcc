//! Adaptive primitives shared by the motion and light detectors: bounded
//! sample windows, trend smoothing, denoise kernels, the temporal median
//! gate, and the noise-pressure tracker.

use std::collections::VecDeque;

pub const TEMPORAL_WINDOW_MIN: usize = 3;
pub const TEMPORAL_WINDOW_MAX: usize = 60;
pub const SMOOTHING_MIN: f64 = 0.05;
pub const SMOOTHING_MAX: f64 = 0.95;

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Fixed-capacity FIFO of recent samples.
#[derive(Debug, Clone)]
pub struct RingWindow {
    values: VecDeque<f64>,
    cap: usize,
}

impl RingWindow {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            values: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.cap {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn median(&self) -> f64 {
        let values: Vec<f64> = self.values.iter().copied().collect();
        median(&values)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Fraction of samples at or above `threshold`.
    pub fn fraction_at_least(&self, threshold: f64) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let hits = self.values.iter().filter(|v| **v >= threshold).count();
        hits as f64 / self.values.len() as f64
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Change capacity, dropping accumulated samples.
    pub fn resize(&mut self, cap: usize) {
        self.cap = cap.max(1);
        self.values = VecDeque::with_capacity(self.cap);
    }
}

/// Exponential moving average with lazy initialization.
#[derive(Debug, Clone)]
pub struct Ema {
    value: Option<f64>,
    alpha: f64,
}

impl Ema {
    pub fn new(alpha: f64) -> Self {
        Self {
            value: None,
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            None => sample,
            Some(current) => current + self.alpha * (sample - current),
        };
        self.value = Some(next);
        next
    }

    pub fn get(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }

    pub fn is_primed(&self) -> bool {
        self.value.is_some()
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}

/// Which denoise pipeline produced the frame used for differencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenoiseStrategy {
    /// gaussian → median
    Standard,
    /// gaussian → median → gaussian → median
    HeavyCascade,
    /// median → gaussian → median
    MedianLead,
}

impl DenoiseStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenoiseStrategy::Standard => "gaussian-median",
            DenoiseStrategy::HeavyCascade => "gaussian-median-gaussian-median",
            DenoiseStrategy::MedianLead => "median-gaussian-median",
        }
    }
}

fn at(frame: &[f32], width: usize, height: usize, x: isize, y: isize) -> f32 {
    let x = x.clamp(0, width as isize - 1) as usize;
    let y = y.clamp(0, height as isize - 1) as usize;
    frame[y * width + x]
}

/// Separable 3x3 gaussian blur (kernel 1-2-1), edge-replicated.
pub fn gaussian3(frame: &[f32], width: usize, height: usize) -> Vec<f32> {
    let mut horizontal = vec![0.0f32; frame.len()];
    for y in 0..height {
        for x in 0..width {
            let sum = at(frame, width, height, x as isize - 1, y as isize)
                + 2.0 * at(frame, width, height, x as isize, y as isize)
                + at(frame, width, height, x as isize + 1, y as isize);
            horizontal[y * width + x] = sum / 4.0;
        }
    }
    let mut out = vec![0.0f32; frame.len()];
    for y in 0..height {
        for x in 0..width {
            let sum = at(&horizontal, width, height, x as isize, y as isize - 1)
                + 2.0 * at(&horizontal, width, height, x as isize, y as isize)
                + at(&horizontal, width, height, x as isize, y as isize + 1);
            out[y * width + x] = sum / 4.0;
        }
    }
    out
}

/// 3x3 median filter, edge-replicated.
pub fn median3(frame: &[f32], width: usize, height: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; frame.len()];
    let mut neighborhood = [0.0f32; 9];
    for y in 0..height {
        for x in 0..width {
            let mut i = 0;
            for dy in -1..=1 {
                for dx in -1..=1 {
                    neighborhood[i] =
                        at(frame, width, height, x as isize + dx, y as isize + dy);
                    i += 1;
                }
            }
            neighborhood
                .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            out[y * width + x] = neighborhood[4];
        }
    }
    out
}

pub fn denoise(
    frame: &[f32],
    width: usize,
    height: usize,
    strategy: DenoiseStrategy,
) -> Vec<f32> {
    match strategy {
        DenoiseStrategy::Standard => median3(&gaussian3(frame, width, height), width, height),
        DenoiseStrategy::HeavyCascade => {
            let pass = median3(&gaussian3(frame, width, height), width, height);
            median3(&gaussian3(&pass, width, height), width, height)
        }
        DenoiseStrategy::MedianLead => median3(
            &gaussian3(&median3(frame, width, height), width, height),
            width,
            height,
        ),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TemporalGateOutput {
    pub median: f64,
    pub suppression: f64,
    pub multiplier: f64,
    pub padding: u32,
}

/// Temporal median gate: suppresses events whose stabilized delta hovers at
/// or below the recent median (flicker), while letting genuine breakouts
/// through.
#[derive(Debug, Clone)]
pub struct TemporalGate {
    window: RingWindow,
    suppression: f64,
    margin: f64,
}

impl TemporalGate {
    pub fn new(window_size: usize, margin: f64) -> Self {
        Self {
            window: RingWindow::new(window_size.clamp(TEMPORAL_WINDOW_MIN, TEMPORAL_WINDOW_MAX)),
            suppression: 0.0,
            margin,
        }
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn suppression(&self) -> f64 {
        self.suppression
    }

    pub fn observe(&mut self, stabilized: f64) -> TemporalGateOutput {
        let cap = self.window.cap() as f64;
        if !self.window.is_empty() {
            let median = self.window.median();
            if stabilized <= median * (1.0 + self.margin) {
                self.suppression = (self.suppression + 1.0).min(cap);
            } else {
                self.suppression = (self.suppression - 1.0).max(0.0);
            }
        }
        self.window.push(stabilized);

        let ratio = self.suppression / cap;
        TemporalGateOutput {
            median: self.window.median(),
            suppression: self.suppression,
            multiplier: 1.0 + ratio.min(1.5) * 0.85,
            padding: (3.0 * ratio).round() as u32,
        }
    }

    pub fn set_margin(&mut self, margin: f64) {
        self.margin = margin;
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.suppression = 0.0;
    }

    pub fn resize(&mut self, window_size: usize, margin: f64) {
        self.window
            .resize(window_size.clamp(TEMPORAL_WINDOW_MIN, TEMPORAL_WINDOW_MAX));
        self.margin = margin;
        self.suppression = 0.0;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoiseOutput {
    pub floor: f64,
    pub ratio: f64,
    pub median_ratio: f64,
    /// Fraction of windowed ratios at or above 1.1.
    pub pressure: f64,
    /// Sustained-noise boost, clamped to [1, 4].
    pub boost: f64,
    /// Multiplier applied to thresholds and debounce/backoff.
    pub suppression_factor: f64,
}

/// Tracks the noise floor and the pressure of recent noise ratios, deriving
/// the sustained-noise boost.
#[derive(Debug, Clone)]
pub struct NoiseTracker {
    floor: Ema,
    window: RingWindow,
    boost: f64,
    boost_alpha: f64,
}

pub const NOISE_PRESSURE_THRESHOLD: f64 = 1.1;
const NOISE_FLOOR_ALPHA: f64 = 0.1;
const NOISE_FLOOR_EPSILON: f64 = 1e-3;

impl NoiseTracker {
    pub fn new(window_size: usize, boost_alpha: f64) -> Self {
        Self {
            floor: Ema::new(NOISE_FLOOR_ALPHA),
            window: RingWindow::new(window_size),
            boost: 1.0,
            boost_alpha: boost_alpha.clamp(SMOOTHING_MIN, SMOOTHING_MAX),
        }
    }

    pub fn boost(&self) -> f64 {
        self.boost
    }

    pub fn current_floor(&self) -> Option<f64> {
        self.floor.is_primed().then(|| self.floor.get())
    }

    pub fn set_boost_alpha(&mut self, boost_alpha: f64) {
        self.boost_alpha = boost_alpha.clamp(SMOOTHING_MIN, SMOOTHING_MAX);
    }

    pub fn observe(&mut self, delta: f64) -> NoiseOutput {
        // Ratio against the floor as it stood before this sample, so a
        // spike registers instead of absorbing itself.
        let previous_floor = if self.floor.is_primed() {
            self.floor.get().max(NOISE_FLOOR_EPSILON)
        } else {
            delta.max(NOISE_FLOOR_EPSILON)
        };
        let ratio = delta / previous_floor;
        self.floor.update(delta);
        self.window.push(ratio);

        let pressure = self.window.fraction_at_least(NOISE_PRESSURE_THRESHOLD);
        let median_ratio = self.window.median();
        let target = (1.0 + (median_ratio - 1.0).max(0.0) * (1.0 + pressure)).clamp(1.0, 4.0);
        self.boost = (self.boost + self.boost_alpha * (target - self.boost)).clamp(1.0, 4.0);

        NoiseOutput {
            floor: self.floor.get(),
            ratio,
            median_ratio,
            pressure,
            boost: self.boost,
            suppression_factor: 1.0 + pressure.min(1.0) * 0.5,
        }
    }

    pub fn reset(&mut self) {
        self.floor.reset();
        self.window.clear();
        self.boost = 1.0;
    }

    pub fn resize(&mut self, window_size: usize, boost_alpha: f64) {
        self.window.resize(window_size);
        self.boost_alpha = boost_alpha.clamp(SMOOTHING_MIN, SMOOTHING_MAX);
        self.floor.reset();
        self.boost = 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_handles_odd_even_empty() {
        assert_eq!(median(&[]), 0.0);
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
    }

    #[test]
    fn ring_window_evicts_oldest() {
        let mut window = RingWindow::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            window.push(v);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.median(), 3.0);
        assert!((window.mean() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn ema_primes_on_first_sample() {
        let mut ema = Ema::new(0.5);
        assert_eq!(ema.update(10.0), 10.0);
        assert_eq!(ema.update(20.0), 15.0);
    }

    #[test]
    fn gaussian_preserves_flat_frames() {
        let frame = vec![42.0f32; 25];
        let out = gaussian3(&frame, 5, 5);
        for v in out {
            assert!((v - 42.0).abs() < 1e-4);
        }
    }

    #[test]
    fn median_filter_removes_salt_noise() {
        let mut frame = vec![10.0f32; 25];
        frame[12] = 255.0;
        let out = median3(&frame, 5, 5);
        assert!((out[12] - 10.0).abs() < 1e-4);
    }

    #[test]
    fn temporal_gate_suppression_grows_under_flicker() {
        let mut gate = TemporalGate::new(9, 0.12);
        let mut last = TemporalGateOutput::default();
        // A steady delta sits at the median, so the suppression counter
        // climbs and the gate multiplier rises above 1.
        for _ in 0..12 {
            last = gate.observe(40.0);
        }
        assert!(last.suppression > 0.0);
        assert!(last.multiplier > 1.0);
        assert!(last.padding >= 1);

        // A clear breakout shrinks suppression again.
        let out = gate.observe(400.0);
        assert!(out.suppression < last.suppression);
    }

    #[test]
    fn temporal_gate_clamps_window() {
        let gate = TemporalGate::new(500, 0.1);
        assert_eq!(gate.window.cap(), TEMPORAL_WINDOW_MAX);
        let gate = TemporalGate::new(0, 0.1);
        assert_eq!(gate.window.cap(), TEMPORAL_WINDOW_MIN);
    }

    #[test]
    fn noise_tracker_boost_rises_and_clamps() {
        let mut tracker = NoiseTracker::new(8, 0.5);
        let mut out = NoiseOutput::default();
        // Deltas doubling every sample keep the ratio persistently high.
        let mut delta = 1.0;
        for _ in 0..16 {
            out = tracker.observe(delta);
            delta *= 2.0;
        }
        assert!(out.pressure > 0.5);
        assert!(out.boost > 1.5);
        assert!(out.boost <= 4.0);
        assert!(out.suppression_factor > 1.0);

        tracker.reset();
        assert!((tracker.boost() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn noise_tracker_quiet_stream_stays_at_unity() {
        let mut tracker = NoiseTracker::new(8, 0.35);
        let mut out = NoiseOutput::default();
        for _ in 0..20 {
            out = tracker.observe(2.0);
        }
        assert!((out.boost - 1.0).abs() < 0.05);
        assert!(out.pressure < 0.2);
    }
}
