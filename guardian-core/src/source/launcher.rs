//! Decoder subprocess launching.
//!
//! The media source talks to its external decoder through the
//! [`DecoderLauncher`] / [`DecoderStream`] seam so pipeline and supervisor
//! tests can run against scripted streams instead of real processes. The
//! production implementation spawns ffmpeg and demuxes raw payloads from its
//! stdout.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

use guardian_config::MediaSourceConfig;
use guardian_model::{ChannelKind, TransportKind};

/// What the media source needs to know about a finished decoder process.
#[derive(Debug, Clone, Default)]
pub struct ExitInfo {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub error: Option<String>,
}

/// Instructions for one decoder incarnation.
#[derive(Debug, Clone)]
pub struct DecoderSpec {
    /// Canonical channel id, for logging.
    pub channel: String,
    pub config: MediaSourceConfig,
    /// Transport chosen by the fallback ladder, when one applies.
    pub transport: Option<TransportKind>,
}

#[async_trait]
pub trait DecoderStream: Send {
    /// Read exactly `buf.len()` payload bytes.
    ///
    /// `UnexpectedEof` means the decoder closed its output (usually: it
    /// exited); `InvalidData` marks a corrupted payload.
    async fn read_payload(&mut self, buf: &mut [u8]) -> std::io::Result<()>;

    /// Terminate the decoder: graceful stop first, hard kill once `grace`
    /// elapses. Must leave no child behind even if the result is ignored.
    async fn shutdown(&mut self, grace: Duration) -> ExitInfo;

    /// Most recent decoder-reported error line, if any.
    fn last_error(&self) -> Option<String> {
        None
    }
}

#[async_trait]
pub trait DecoderLauncher: Send + Sync {
    async fn launch(&self, spec: DecoderSpec) -> std::io::Result<Box<dyn DecoderStream>>;
}

/// Production launcher: spawns the configured ffmpeg binary.
#[derive(Debug, Default, Clone)]
pub struct FfmpegLauncher;

impl FfmpegLauncher {
    /// Argument vector for one incarnation. Video decodes to rawvideo gray8
    /// at the pipeline fps and geometry; audio decodes to mono s16le.
    pub fn build_args(spec: &DecoderSpec) -> Vec<String> {
        let config = &spec.config;
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-nostdin".into(),
        ];

        if config.kind == ChannelKind::Video
            && config.input.starts_with("rtsp://")
            && let Some(transport) = spec.transport
        {
            args.push("-rtsp_transport".into());
            args.push(transport.as_str().into());
        }

        args.extend(config.extra_input_args.iter().cloned());
        args.push("-i".into());
        args.push(config.input.clone());

        match config.kind {
            ChannelKind::Video => {
                args.push("-an".into());
                args.push("-vf".into());
                args.push(format!(
                    "fps={},scale={}:{},format=gray",
                    config.fps, config.width, config.height
                ));
                args.push("-f".into());
                args.push("rawvideo".into());
            }
            _ => {
                args.push("-vn".into());
                args.push("-ac".into());
                args.push("1".into());
                args.push("-ar".into());
                args.push(config.sample_rate.to_string());
                args.push("-f".into());
                args.push("s16le".into());
            }
        }

        args.extend(config.extra_output_args.iter().cloned());
        args.push("pipe:1".into());
        args
    }
}

#[async_trait]
impl DecoderLauncher for FfmpegLauncher {
    async fn launch(&self, spec: DecoderSpec) -> std::io::Result<Box<dyn DecoderStream>> {
        let args = Self::build_args(&spec);
        debug!(
            channel = %spec.channel,
            binary = %spec.config.decoder_binary,
            ?args,
            "spawning decoder"
        );

        let mut child = Command::new(&spec.config.decoder_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::other("decoder stdout pipe missing")
        })?;

        let last_error = Arc::new(Mutex::new(None));
        let stderr_sink = last_error.clone();
        let channel = spec.channel.clone();
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(channel = %channel, line = %line, "decoder stderr");
                    *stderr_sink
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(line);
                }
            })
        });

        Ok(Box::new(FfmpegStream {
            child,
            stdout,
            stderr_task,
            last_error,
        }))
    }
}

struct FfmpegStream {
    child: Child,
    stdout: ChildStdout,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
    last_error: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl DecoderStream for FfmpegStream {
    async fn read_payload(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.stdout.read_exact(buf).await.map(|_| ())
    }

    async fn shutdown(&mut self, grace: Duration) -> ExitInfo {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // TERM first; KILL below if the grace period runs out.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        let status = match timeout(grace, self.child.wait()).await {
            Ok(waited) => waited.ok(),
            Err(_) => {
                warn!("decoder ignored TERM, killing");
                let _ = self.child.kill().await;
                self.child.wait().await.ok()
            }
        };

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        let mut info = ExitInfo {
            error: self.last_error(),
            ..ExitInfo::default()
        };
        if let Some(status) = status {
            info.exit_code = status.code();
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                info.signal = status.signal().map(signal_name);
            }
        }
        info
    }

    fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".into(),
        2 => "SIGINT".into(),
        6 => "SIGABRT".into(),
        9 => "SIGKILL".into(),
        11 => "SIGSEGV".into(),
        13 => "SIGPIPE".into(),
        15 => "SIGTERM".into(),
        other => format!("SIG{other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardian_model::ChannelKind;

    fn video_spec(input: &str, transport: Option<TransportKind>) -> DecoderSpec {
        let mut config = MediaSourceConfig {
            kind: ChannelKind::Video,
            input: input.into(),
            fps: 5.0,
            width: 640,
            height: 360,
            sample_rate: 0,
            chunk_duration_ms: 0,
            decoder_binary: "ffmpeg".into(),
            extra_input_args: vec![],
            extra_output_args: vec![],
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
        };
        config.transport = transport;
        DecoderSpec {
            channel: "video:cam-a".into(),
            config,
            transport,
        }
    }

    #[test]
    fn video_args_decode_to_gray_rawvideo() {
        let args = FfmpegLauncher::build_args(&video_spec("rtsp://host/stream", None));
        let joined = args.join(" ");
        assert!(joined.contains("-i rtsp://host/stream"));
        assert!(joined.contains("fps=5,scale=640:360,format=gray"));
        assert!(joined.contains("-f rawvideo"));
        assert!(joined.ends_with("pipe:1"));
        assert!(!joined.contains("-rtsp_transport"));
    }

    #[test]
    fn rtsp_transport_flag_present_only_for_rtsp() {
        let args = FfmpegLauncher::build_args(&video_spec(
            "rtsp://host/stream",
            Some(TransportKind::Tcp),
        ));
        let joined = args.join(" ");
        assert!(joined.contains("-rtsp_transport tcp"));

        let args = FfmpegLauncher::build_args(&video_spec(
            "/var/media/test.mp4",
            Some(TransportKind::Tcp),
        ));
        assert!(!args.join(" ").contains("-rtsp_transport"));
    }

    #[test]
    fn audio_args_decode_to_mono_s16le() {
        let mut spec = video_spec("hw:1,0", None);
        spec.config.kind = ChannelKind::Audio;
        spec.config.sample_rate = 16_000;
        let joined = FfmpegLauncher::build_args(&spec).join(" ");
        assert!(joined.contains("-ac 1"));
        assert!(joined.contains("-ar 16000"));
        assert!(joined.contains("-f s16le"));
    }
}
