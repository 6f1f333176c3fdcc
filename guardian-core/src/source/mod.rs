//! Media capture source: one external decoder subprocess per channel.
//!
//! Lifecycle: `Idle → Starting → Running → (Recovering | CircuitOpen) →
//! Stopped`. The source owns its child process and its timers; every
//! failure is classified into a restart reason, backed off with jitter, and
//! surfaced as a recover event. Too many consecutive failures open the
//! circuit breaker, which refuses `start()` until an operator reset.

pub mod backoff;
pub mod launcher;
pub mod testing;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as TokioMutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use guardian_config::MediaSourceConfig;
use guardian_model::{ChannelId, ChannelKind, RestartReason, TransportFallbackEvent};

use crate::error::{CoreError, Result};
use backoff::{BackoffMeta, BackoffPolicy};
use launcher::{DecoderLauncher, DecoderSpec, DecoderStream, ExitInfo};
use transport::{LadderOutcome, TransportLadder};

pub const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceState {
    Idle,
    Starting,
    Running,
    Recovering,
    CircuitOpen,
    Stopped,
}

/// Recover signal: the source failed and a restart is scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverEvent {
    pub reason: RestartReason,
    /// Monotonic per incarnation, starting at 1.
    pub attempt: u32,
    pub delay_ms: u64,
    pub watchdog_backoff_ms: u64,
    pub meta: BackoffMeta,
    /// Canonical channel id.
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Everything a media source reports upward to its pipeline.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Frame {
        data: Vec<u8>,
        width: u32,
        height: u32,
        ts: DateTime<Utc>,
    },
    Chunk {
        samples: Vec<i16>,
        sample_rate: u32,
        ts: DateTime<Utc>,
    },
    Recover(RecoverEvent),
    TransportFallback(TransportFallbackEvent),
    CircuitOpen {
        channel: String,
        consecutive_failures: u32,
    },
    Stopped,
    /// Unrecoverable; only produced when the very first spawn fails.
    Fatal(String),
}

/// Manager for one channel's decoder subprocess.
pub struct MediaSource {
    channel: ChannelId,
    config: MediaSourceConfig,
    launcher: Arc<dyn DecoderLauncher>,
    events_tx: mpsc::Sender<SourceEvent>,
    state: Arc<StdRwLock<SourceState>>,
    circuit_open: Arc<AtomicBool>,
    ladder: Arc<StdMutex<Option<TransportLadder>>>,
    cancel: StdMutex<CancellationToken>,
    task: TokioMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSource")
            .field("channel", &self.channel.canonical())
            .field("state", &self.state())
            .finish()
    }
}

impl MediaSource {
    pub fn new(
        channel: ChannelId,
        config: MediaSourceConfig,
        launcher: Arc<dyn DecoderLauncher>,
    ) -> (Self, mpsc::Receiver<SourceEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let ladder = (config.kind == ChannelKind::Video
            && config.input.starts_with("rtsp://"))
        .then(|| TransportLadder::new(config.transport, config.transport_failure_threshold));

        let source = Self {
            channel,
            config,
            launcher,
            events_tx,
            state: Arc::new(StdRwLock::new(SourceState::Idle)),
            circuit_open: Arc::new(AtomicBool::new(false)),
            ladder: Arc::new(StdMutex::new(ladder)),
            cancel: StdMutex::new(CancellationToken::new()),
            task: TokioMutex::new(None),
        };
        (source, events_rx)
    }

    pub fn state(&self) -> SourceState {
        *self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &MediaSourceConfig {
        &self.config
    }

    fn set_state(state: &StdRwLock<SourceState>, next: SourceState) {
        *state.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
    }

    fn current_transport(&self) -> Option<guardian_model::TransportKind> {
        self.ladder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|ladder| ladder.current())
            .or(self.config.transport)
    }

    fn spec(&self) -> DecoderSpec {
        DecoderSpec {
            channel: self.channel.canonical(),
            config: self.config.clone(),
            transport: self.current_transport(),
        }
    }

    /// Launch the decoder and begin the supervised read loop.
    ///
    /// A spawn failure here is fatal (the supervisor rolls the whole start
    /// back); once running, failures are retried with backoff instead.
    pub async fn start(&self) -> Result<()> {
        if self.circuit_open.load(Ordering::SeqCst) {
            return Err(CoreError::CircuitOpen {
                channel: self.channel.canonical(),
            });
        }

        let mut task = self.task.lock().await;
        if let Some(handle) = task.as_ref()
            && !handle.is_finished()
        {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        *self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = cancel.clone();

        Self::set_state(&self.state, SourceState::Starting);
        let stream = match self.launcher.launch(self.spec()).await {
            Ok(stream) => stream,
            Err(err) => {
                Self::set_state(&self.state, SourceState::Stopped);
                let _ = self
                    .events_tx
                    .try_send(SourceEvent::Fatal(err.to_string()));
                return Err(CoreError::SourceStart {
                    channel: self.channel.canonical(),
                    message: err.to_string(),
                });
            }
        };

        let ctx = RunContext {
            channel: self.channel.canonical(),
            config: self.config.clone(),
            launcher: self.launcher.clone(),
            events_tx: self.events_tx.clone(),
            state: self.state.clone(),
            circuit_open: self.circuit_open.clone(),
            ladder: self.ladder.clone(),
            cancel,
        };
        *task = Some(tokio::spawn(run_loop(ctx, stream)));
        Ok(())
    }

    /// Stop the source and its subprocess. Idempotent: later calls observe
    /// the completed shutdown.
    pub async fn stop(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .cancel();

        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Self::set_state(&self.state, SourceState::Stopped);
    }

    /// Close an open circuit breaker and restart. Returns true iff the
    /// breaker was actually open.
    pub async fn reset_circuit_breaker(&self) -> Result<bool> {
        if !self.circuit_open.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        info!(channel = %self.channel.canonical(), "circuit breaker reset, restarting");
        self.start().await?;
        Ok(true)
    }

    pub fn circuit_is_open(&self) -> bool {
        self.circuit_open.load(Ordering::SeqCst)
    }

    /// Re-arm the transport ladder at its head. Video/RTSP only; returns
    /// whether anything changed.
    pub fn reset_transport_fallback(&self) -> bool {
        self.ladder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_mut()
            .map(|ladder| ladder.reset())
            .unwrap_or(false)
    }
}

struct RunContext {
    channel: String,
    config: MediaSourceConfig,
    launcher: Arc<dyn DecoderLauncher>,
    events_tx: mpsc::Sender<SourceEvent>,
    state: Arc<StdRwLock<SourceState>>,
    circuit_open: Arc<AtomicBool>,
    ladder: Arc<StdMutex<Option<TransportLadder>>>,
    cancel: CancellationToken,
}

impl RunContext {
    fn payload_len(&self) -> usize {
        match self.config.kind {
            ChannelKind::Video => (self.config.width as usize) * (self.config.height as usize),
            _ => {
                let samples =
                    (self.config.sample_rate as u64 * self.config.chunk_duration_ms) / 1000;
                (samples.max(1) as usize) * 2
            }
        }
    }

    fn spec(&self) -> DecoderSpec {
        let transport = self
            .ladder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|ladder| ladder.current())
            .or(self.config.transport);
        DecoderSpec {
            channel: self.channel.clone(),
            config: self.config.clone(),
            transport,
        }
    }

    async fn emit(&self, event: SourceEvent) -> bool {
        self.events_tx.send(event).await.is_ok()
    }
}

enum SessionEnd {
    Cancelled,
    ReceiverGone,
    Failed {
        reason: RestartReason,
        got_payload: bool,
    },
}

/// Pump payloads from one decoder incarnation until it fails, the receiver
/// goes away, or the source is cancelled.
async fn read_session(ctx: &RunContext, stream: &mut dyn DecoderStream) -> SessionEnd {
    let payload_len = ctx.payload_len();
    let mut buf = vec![0u8; payload_len];
    let mut got_payload = false;
    let started = Instant::now();
    let mut last_payload = started;

    loop {
        // Watchdog and idle re-arm on every payload; before the first one
        // only the start timeout applies.
        let (deadline, timeout_reason) = if got_payload {
            let idle = last_payload + Duration::from_millis(ctx.config.idle_timeout_ms);
            let watchdog = last_payload + Duration::from_millis(ctx.config.watchdog_timeout_ms);
            if watchdog <= idle {
                (watchdog, RestartReason::WatchdogTimeout)
            } else {
                (idle, RestartReason::StreamIdle)
            }
        } else {
            (
                started + Duration::from_millis(ctx.config.start_timeout_ms),
                RestartReason::StartTimeout,
            )
        };

        tokio::select! {
            _ = ctx.cancel.cancelled() => return SessionEnd::Cancelled,
            _ = tokio::time::sleep_until(deadline) => {
                return SessionEnd::Failed { reason: timeout_reason, got_payload };
            }
            read = stream.read_payload(&mut buf) => match read {
                Ok(()) => {
                    if !got_payload {
                        got_payload = true;
                        MediaSource::set_state(&ctx.state, SourceState::Running);
                        debug!(channel = %ctx.channel, "first payload, source running");
                    }
                    last_payload = Instant::now();

                    let ts = Utc::now();
                    let event = match ctx.config.kind {
                        ChannelKind::Video => SourceEvent::Frame {
                            data: buf.clone(),
                            width: ctx.config.width,
                            height: ctx.config.height,
                            ts,
                        },
                        _ => SourceEvent::Chunk {
                            samples: buf
                                .chunks_exact(2)
                                .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                                .collect(),
                            sample_rate: ctx.config.sample_rate,
                            ts,
                        },
                    };
                    if !ctx.emit(event).await {
                        return SessionEnd::ReceiverGone;
                    }
                }
                Err(err) => {
                    let reason = match err.kind() {
                        std::io::ErrorKind::InvalidData => RestartReason::CorruptedFrame,
                        _ => RestartReason::StreamError,
                    };
                    return SessionEnd::Failed { reason, got_payload };
                }
            }
        }
    }
}

async fn run_loop(ctx: RunContext, first_stream: Box<dyn DecoderStream>) {
    let policy = BackoffPolicy {
        delay_ms: ctx.config.restart_delay_ms,
        max_delay_ms: ctx.config.restart_max_delay_ms,
        jitter_factor: ctx.config.restart_jitter_factor,
    };
    let grace = Duration::from_millis(ctx.config.force_kill_timeout_ms);
    let mut pending = Some(first_stream);
    let mut attempt: u32 = 0;
    let mut consecutive_failures: u32 = 0;

    loop {
        // Obtain a stream: the initial one on the first pass, a relaunch
        // afterwards. Mid-run spawn errors are ordinary recoverable failures.
        let (reason, got_payload, exit) = match pending.take() {
            Some(mut stream) => match read_session(&ctx, stream.as_mut()).await {
                SessionEnd::Cancelled | SessionEnd::ReceiverGone => {
                    stream.shutdown(grace).await;
                    let _ = ctx.emit(SourceEvent::Stopped).await;
                    MediaSource::set_state(&ctx.state, SourceState::Stopped);
                    return;
                }
                SessionEnd::Failed {
                    reason,
                    got_payload,
                } => {
                    let exit = stream.shutdown(grace).await;
                    (reason, got_payload, exit)
                }
            },
            None => match ctx.launcher.launch(ctx.spec()).await {
                Ok(stream) => {
                    pending = Some(stream);
                    continue;
                }
                Err(err) => (
                    RestartReason::StreamError,
                    false,
                    ExitInfo {
                        error: Some(err.to_string()),
                        ..ExitInfo::default()
                    },
                ),
            },
        };

        if got_payload {
            consecutive_failures = 0;
            if let Some(ladder) = ctx
                .ladder
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .as_mut()
            {
                ladder.record_success();
            }
        }
        consecutive_failures += 1;
        attempt += 1;

        // Advance the transport ladder, if one applies.
        let ladder_outcome = ctx
            .ladder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_mut()
            .map(|ladder| (ladder.record_failure(), ladder.advances()));
        if let Some((outcome, advances)) = ladder_outcome {
            match outcome {
                LadderOutcome::Advanced { from, to } => {
                    let fallback = TransportFallbackEvent {
                        from,
                        to,
                        attempt: advances,
                        reason: reason.as_str().to_string(),
                        channel: ctx.channel.clone(),
                        timestamp: Utc::now(),
                    };
                    warn!(
                        channel = %ctx.channel,
                        from = %from,
                        to = %to,
                        "transport fallback"
                    );
                    if !ctx.emit(SourceEvent::TransportFallback(fallback)).await {
                        MediaSource::set_state(&ctx.state, SourceState::Stopped);
                        return;
                    }
                }
                LadderOutcome::Exhausted => {
                    warn!(channel = %ctx.channel, "transport ladder exhausted, opening circuit");
                    ctx.circuit_open.store(true, Ordering::SeqCst);
                    MediaSource::set_state(&ctx.state, SourceState::CircuitOpen);
                    let _ = ctx
                        .emit(SourceEvent::CircuitOpen {
                            channel: ctx.channel.clone(),
                            consecutive_failures,
                        })
                        .await;
                    return;
                }
                LadderOutcome::Stay => {}
            }
        }

        if consecutive_failures >= ctx.config.circuit_breaker_threshold {
            warn!(
                channel = %ctx.channel,
                failures = consecutive_failures,
                "circuit breaker opened"
            );
            ctx.circuit_open.store(true, Ordering::SeqCst);
            MediaSource::set_state(&ctx.state, SourceState::CircuitOpen);
            let _ = ctx
                .emit(SourceEvent::CircuitOpen {
                    channel: ctx.channel.clone(),
                    consecutive_failures,
                })
                .await;
            return;
        }

        let decision = backoff::compute_jittered(&policy, attempt);
        let recover = RecoverEvent {
            reason,
            attempt,
            delay_ms: decision.delay_ms,
            watchdog_backoff_ms: if reason.is_watchdog() {
                decision.delay_ms
            } else {
                0
            },
            meta: decision.meta,
            channel: ctx.channel.clone(),
            error_code: exit.error.clone(),
            exit_code: exit.exit_code,
            signal: exit.signal.clone(),
            timestamp: Utc::now(),
        };
        MediaSource::set_state(&ctx.state, SourceState::Recovering);
        if !ctx.emit(SourceEvent::Recover(recover)).await {
            MediaSource::set_state(&ctx.state, SourceState::Stopped);
            return;
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                let _ = ctx.emit(SourceEvent::Stopped).await;
                MediaSource::set_state(&ctx.state, SourceState::Stopped);
                return;
            }
            _ = tokio::time::sleep(Duration::from_millis(decision.delay_ms)) => {}
        }
        MediaSource::set_state(&ctx.state, SourceState::Starting);
    }
}
