//! Scripted decoder streams for exercising source, pipeline, and supervisor
//! lifecycles without spawning real processes.

#![doc(hidden)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::launcher::{DecoderLauncher, DecoderSpec, DecoderStream, ExitInfo};

#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Deliver one payload.
    Payload(Vec<u8>),
    /// Fail the read with `InvalidData`.
    Corrupt,
    /// Never produce anything again (timers decide what happens).
    Silence,
}

/// Behavior of one decoder incarnation.
#[derive(Debug, Clone)]
pub enum StreamScript {
    /// The spawn itself fails.
    SpawnError(String),
    /// Run the steps, then report EOF.
    Script(Vec<ScriptStep>),
    /// Produce the same payload forever at a fixed cadence.
    Endless { payload: Vec<u8>, every: Duration },
}

impl StreamScript {
    pub fn spawn_error(message: &str) -> Self {
        Self::SpawnError(message.to_string())
    }

    pub fn payloads(payloads: Vec<Vec<u8>>) -> Self {
        Self::Script(payloads.into_iter().map(ScriptStep::Payload).collect())
    }

    pub fn payloads_then_silence(payloads: Vec<Vec<u8>>) -> Self {
        let mut steps: Vec<ScriptStep> =
            payloads.into_iter().map(ScriptStep::Payload).collect();
        steps.push(ScriptStep::Silence);
        Self::Script(steps)
    }

    pub fn immediate_eof() -> Self {
        Self::Script(Vec::new())
    }

    pub fn silent() -> Self {
        Self::Script(vec![ScriptStep::Silence])
    }

    pub fn endless(payload: Vec<u8>, every: Duration) -> Self {
        Self::Endless { payload, every }
    }
}

/// Launcher handing out scripted streams in order. With a `repeating`
/// fallback it never runs dry; otherwise exhaustion fails the spawn.
#[derive(Debug)]
pub struct ScriptedLauncher {
    scripts: Mutex<VecDeque<StreamScript>>,
    repeat: Option<StreamScript>,
    fail_inputs: Mutex<Vec<String>>,
    launches: AtomicUsize,
    specs: Mutex<Vec<DecoderSpec>>,
}

impl ScriptedLauncher {
    pub fn new(scripts: Vec<StreamScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            repeat: None,
            fail_inputs: Mutex::new(Vec::new()),
            launches: AtomicUsize::new(0),
            specs: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(script: StreamScript) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            repeat: Some(script),
            fail_inputs: Mutex::new(Vec::new()),
            launches: AtomicUsize::new(0),
            specs: Mutex::new(Vec::new()),
        }
    }

    /// Spawns for this input fail, regardless of the script queue.
    pub fn fail_for_input(&self, input: &str) {
        self.fail_inputs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(input.to_string());
    }

    /// Number of launch calls so far.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Specs of every launch, in order.
    pub fn specs(&self) -> Vec<DecoderSpec> {
        self.specs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl DecoderLauncher for ScriptedLauncher {
    async fn launch(&self, spec: DecoderSpec) -> std::io::Result<Box<dyn DecoderStream>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let input = spec.config.input.clone();
        self.specs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(spec);

        if self
            .fail_inputs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&input)
        {
            return Err(std::io::Error::other(format!("cannot open {input}")));
        }

        let script = self
            .scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .or_else(|| self.repeat.clone());

        match script {
            None => Err(std::io::Error::other("scripted launcher exhausted")),
            Some(StreamScript::SpawnError(message)) => Err(std::io::Error::other(message)),
            Some(StreamScript::Script(steps)) => Ok(Box::new(ScriptedStream {
                steps: steps.into(),
                endless: None,
            })),
            Some(StreamScript::Endless { payload, every }) => Ok(Box::new(ScriptedStream {
                steps: VecDeque::new(),
                endless: Some((payload, every)),
            })),
        }
    }
}

struct ScriptedStream {
    steps: VecDeque<ScriptStep>,
    endless: Option<(Vec<u8>, Duration)>,
}

#[async_trait]
impl DecoderStream for ScriptedStream {
    async fn read_payload(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        if let Some((payload, every)) = &self.endless {
            tokio::time::sleep(*every).await;
            fill(buf, payload);
            return Ok(());
        }

        match self.steps.pop_front() {
            Some(ScriptStep::Payload(payload)) => {
                fill(buf, &payload);
                Ok(())
            }
            Some(ScriptStep::Corrupt) => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "corrupted payload",
            )),
            Some(ScriptStep::Silence) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "decoder exited",
            )),
        }
    }

    async fn shutdown(&mut self, _grace: Duration) -> ExitInfo {
        ExitInfo {
            exit_code: Some(1),
            signal: None,
            error: None,
        }
    }
}

fn fill(buf: &mut [u8], payload: &[u8]) {
    let n = buf.len().min(payload.len());
    buf[..n].copy_from_slice(&payload[..n]);
    for byte in buf[n..].iter_mut() {
        *byte = 0;
    }
}
