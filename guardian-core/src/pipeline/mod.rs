//! One channel's supervised unit: a media source wired to that channel's
//! detectors, plus restart accounting.
//!
//! The pipeline consumes its source's event stream on a dedicated task.
//! Detector faults are transient (logged and counted, never fatal to the
//! pipeline); recover signals are recorded locally and forwarded to the
//! process-wide metrics registry.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex as TokioMutex, mpsc};
use tracing::{debug, error, info, warn};

use guardian_config::PipelineConfig;
use guardian_model::{ChannelId, ChannelKind, RestartEvent, RestartStats, SeverityAssessment};

use crate::detect::{AudioAnomalyDetector, LightDetector, MotionDetector};
use crate::error::Result;
use crate::events::EventBus;
use crate::metrics::{MetricsRegistry, RestartRecord};
use crate::source::launcher::DecoderLauncher;
use crate::source::{MediaSource, SourceEvent, SourceState};

/// Outcome of [`ChannelPipeline::update_options`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub restart_required: bool,
}

#[derive(Debug, Default)]
struct DetectorSet {
    motion: Option<MotionDetector>,
    light: Option<LightDetector>,
    audio: Option<AudioAnomalyDetector>,
}

impl DetectorSet {
    fn build(
        config: &PipelineConfig,
        metrics: &Arc<MetricsRegistry>,
        bus: &Arc<EventBus>,
    ) -> Self {
        let channel = &config.channel;
        Self {
            motion: config.motion.clone().map(|motion| {
                MotionDetector::new(channel, motion, metrics.clone(), bus.clone())
            }),
            light: config.light.clone().map(|light| {
                LightDetector::new(channel, light, metrics.clone(), bus.clone())
            }),
            audio: config.audio.clone().map(|audio| {
                AudioAnomalyDetector::new(
                    channel,
                    audio,
                    config.media.sample_rate,
                    metrics.clone(),
                    bus.clone(),
                )
            }),
        }
    }
}

struct PipelineInner {
    config: PipelineConfig,
    source: Arc<MediaSource>,
    pending_rx: Option<mpsc::Receiver<SourceEvent>>,
    consumer: Option<tokio::task::JoinHandle<()>>,
    detectors: Arc<TokioMutex<DetectorSet>>,
}

/// MediaSource + detectors + restart stats for one channel.
pub struct ChannelPipeline {
    channel: ChannelId,
    launcher: Arc<dyn DecoderLauncher>,
    metrics: Arc<MetricsRegistry>,
    bus: Arc<EventBus>,
    restart_stats: Arc<StdMutex<RestartStats>>,
    inner: TokioMutex<PipelineInner>,
}

impl std::fmt::Debug for ChannelPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPipeline")
            .field("channel", &self.channel.canonical())
            .finish()
    }
}

impl ChannelPipeline {
    pub fn new(
        config: PipelineConfig,
        launcher: Arc<dyn DecoderLauncher>,
        metrics: Arc<MetricsRegistry>,
        bus: Arc<EventBus>,
    ) -> Self {
        let channel = config.channel.clone();
        let (source, events_rx) =
            MediaSource::new(channel.clone(), config.media.clone(), launcher.clone());
        let detectors = Arc::new(TokioMutex::new(DetectorSet::build(&config, &metrics, &bus)));
        let restart_stats = Arc::new(StdMutex::new(RestartStats::new(
            config.restart_history_limit,
        )));

        Self {
            channel,
            launcher,
            metrics: metrics.clone(),
            bus,
            restart_stats,
            inner: TokioMutex::new(PipelineInner {
                config,
                source: Arc::new(source),
                pending_rx: Some(events_rx),
                consumer: None,
                detectors,
            }),
        }
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn kind(&self) -> ChannelKind {
        self.channel.kind()
    }

    pub async fn config(&self) -> PipelineConfig {
        self.inner.lock().await.config.clone()
    }

    pub async fn source_state(&self) -> SourceState {
        self.inner.lock().await.source.state()
    }

    pub fn restart_stats(&self) -> RestartStats {
        self.restart_stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn spawn_consumer(&self, inner: &mut PipelineInner, events_rx: mpsc::Receiver<SourceEvent>) {
        let ctx = ConsumerContext {
            channel: self.channel.clone(),
            detectors: inner.detectors.clone(),
            restart_stats: self.restart_stats.clone(),
            metrics: self.metrics.clone(),
            thresholds: inner.config.severity_thresholds,
        };
        inner.consumer = Some(tokio::spawn(consume_events(ctx, events_rx)));
    }

    /// Start the source and the event consumer.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(events_rx) = inner.pending_rx.take() {
            self.spawn_consumer(&mut inner, events_rx);
        }
        inner.source.start().await
    }

    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        inner.source.stop().await;
        if let Some(consumer) = inner.consumer.take() {
            // The source's Stopped event closes the stream; the consumer
            // drains and exits on channel close when the source drops. Abort
            // covers the case where the source is kept for a later restart.
            consumer.abort();
            let _ = consumer.await;
        }
        debug!(channel = %self.channel.canonical(), "pipeline stopped");
    }

    /// True iff the breaker was open and is now closed (a restart was
    /// triggered).
    pub async fn reset_circuit_breaker(&self) -> Result<bool> {
        let inner = self.inner.lock().await;
        inner.source.reset_circuit_breaker().await
    }

    /// Video only: re-arm the RTSP transport ladder. False for audio
    /// pipelines and when the ladder was already at its head.
    pub async fn reset_transport_fallback(&self) -> bool {
        if self.channel.kind() != ChannelKind::Video {
            return false;
        }
        let inner = self.inner.lock().await;
        inner.source.reset_transport_fallback()
    }

    /// Clear the channel's health severity, locally and in metrics. True iff
    /// there was a non-none severity to clear.
    pub fn reset_channel_health(&self) -> bool {
        let mut stats = self
            .restart_stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let had_severity =
            stats.severity.severity != guardian_model::RestartSeverity::None;
        stats.clear_severity();
        drop(stats);

        self.metrics.set_pipeline_channel_health(
            self.channel.kind(),
            &self.channel.canonical(),
            SeverityAssessment::default(),
            None,
            None,
        );
        had_severity
    }

    /// Apply a new resolved config.
    ///
    /// Media-source changes (URI, transport, decoder args, fps, timeouts)
    /// replace the source and reset restart stats; detector-only changes are
    /// forwarded to the live detectors without a restart.
    pub async fn update_options(&self, next: PipelineConfig) -> Result<UpdateOutcome> {
        let mut inner = self.inner.lock().await;
        let restart_required = inner.config.restart_required(&next);

        if restart_required {
            info!(channel = %self.channel.canonical(), "pipeline config changed, restarting source");
            inner.source.stop().await;
            if let Some(consumer) = inner.consumer.take() {
                consumer.abort();
                let _ = consumer.await;
            }

            let (source, events_rx) = MediaSource::new(
                self.channel.clone(),
                next.media.clone(),
                self.launcher.clone(),
            );
            inner.source = Arc::new(source);
            inner.detectors =
                Arc::new(TokioMutex::new(DetectorSet::build(&next, &self.metrics, &self.bus)));
            {
                let mut stats = self
                    .restart_stats
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                *stats = RestartStats::new(next.restart_history_limit);
            }
            inner.config = next;
            self.spawn_consumer(&mut inner, events_rx);
            inner.source.start().await?;
        } else {
            let mut detectors = inner.detectors.lock().await;
            if let (Some(detector), Some(config)) = (&mut detectors.motion, &next.motion) {
                detector.update_options(config.clone());
            }
            if let (Some(detector), Some(config)) = (&mut detectors.light, &next.light) {
                detector.update_options(config.clone());
            }
            if let (Some(detector), Some(config)) = (&mut detectors.audio, &next.audio) {
                detector.update_options(config.clone());
            }
            drop(detectors);
            inner.config = next;
        }

        Ok(UpdateOutcome { restart_required })
    }
}

struct ConsumerContext {
    channel: ChannelId,
    detectors: Arc<TokioMutex<DetectorSet>>,
    restart_stats: Arc<StdMutex<RestartStats>>,
    metrics: Arc<MetricsRegistry>,
    thresholds: guardian_model::SeverityThresholds,
}

async fn consume_events(ctx: ConsumerContext, mut events_rx: mpsc::Receiver<SourceEvent>) {
    let canonical = ctx.channel.canonical();
    let kind = ctx.channel.kind();

    while let Some(event) = events_rx.recv().await {
        match event {
            SourceEvent::Frame {
                data,
                width,
                height,
                ts,
            } => {
                ctx.metrics.increment_counter(
                    &format!("pipeline.{canonical}.frames"),
                    1,
                );
                let ts_ms = ts.timestamp_millis();
                let mut detectors = ctx.detectors.lock().await;
                if let Some(motion) = &mut detectors.motion {
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        motion.process_frame(&data, width, height, ts_ms)
                    }));
                    if outcome.is_err() {
                        error!(channel = %canonical, detector = "motion", "detector fault");
                        ctx.metrics
                            .increment_counter(&format!("detector.motion.{canonical}.errors"), 1);
                    }
                }
                if let Some(light) = &mut detectors.light {
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        light.process_frame(&data, width, height, ts_ms)
                    }));
                    if outcome.is_err() {
                        error!(channel = %canonical, detector = "light", "detector fault");
                        ctx.metrics
                            .increment_counter(&format!("detector.light.{canonical}.errors"), 1);
                    }
                }
            }
            SourceEvent::Chunk {
                samples,
                sample_rate: _,
                ts,
            } => {
                ctx.metrics.increment_counter(
                    &format!("pipeline.{canonical}.chunks"),
                    1,
                );
                let ts_ms = ts.timestamp_millis();
                let mut detectors = ctx.detectors.lock().await;
                if let Some(audio) = &mut detectors.audio {
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        audio.process_chunk(&samples, ts_ms)
                    }));
                    if outcome.is_err() {
                        error!(channel = %canonical, detector = "audio-anomaly", "detector fault");
                        ctx.metrics.increment_counter(
                            &format!("detector.audio-anomaly.{canonical}.errors"),
                            1,
                        );
                    }
                }
            }
            SourceEvent::Recover(recover) => {
                warn!(
                    channel = %canonical,
                    reason = %recover.reason,
                    attempt = recover.attempt,
                    delay_ms = recover.delay_ms,
                    "source recovering"
                );
                let restart = RestartEvent {
                    reason: recover.reason,
                    attempt: recover.attempt,
                    delay_ms: recover.delay_ms,
                    watchdog_backoff_ms: recover.watchdog_backoff_ms,
                    channel: canonical.clone(),
                    timestamp: recover.timestamp,
                    error_code: recover.error_code.clone(),
                    exit_code: recover.exit_code,
                    signal: recover.signal.clone(),
                };
                ctx.restart_stats
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .record(restart, &ctx.thresholds);
                ctx.metrics.record_pipeline_restart(
                    kind,
                    recover.reason,
                    RestartRecord {
                        channel: canonical.clone(),
                        attempt: recover.attempt,
                        delay_ms: recover.delay_ms,
                        watchdog_backoff_ms: recover.watchdog_backoff_ms,
                        error_code: recover.error_code,
                        exit_code: recover.exit_code,
                        signal: recover.signal,
                        timestamp: recover.timestamp,
                    },
                );
            }
            SourceEvent::TransportFallback(fallback) => {
                ctx.metrics.record_transport_fallback(kind, fallback);
            }
            SourceEvent::CircuitOpen {
                consecutive_failures,
                ..
            } => {
                error!(
                    channel = %canonical,
                    failures = consecutive_failures,
                    "circuit breaker open; manual reset required"
                );
                ctx.metrics
                    .increment_counter(&format!("pipeline.{canonical}.circuitOpen"), 1);
            }
            SourceEvent::Stopped => {
                debug!(channel = %canonical, "source stopped");
            }
            SourceEvent::Fatal(message) => {
                error!(channel = %canonical, error = %message, "source fatal error");
                ctx.metrics
                    .increment_counter(&format!("pipeline.{canonical}.fatalErrors"), 1);
            }
        }
    }
}
