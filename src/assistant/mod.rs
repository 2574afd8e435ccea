//! Voice assistant pipeline
//!
//! Capture, transcription, inference, and command execution run as
//! independent tasks connected by bounded channels. Each stage owns its
//! backend through a trait object, so tests drive the pipeline with
//! mock transcription and chat backends and synthetic audio.

pub mod llm;
pub mod prompt;
pub mod stt;
pub mod vad;

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::audio::{ACQUIRE_TIMEOUT, Arbiter, Recorder, RecordingConfig, SampleSource, SourceFactory};
use crate::commands::CommandRegistry;
use crate::config::{Config, Settings};
use crate::conversation::{ConversationBuffer, ConversationEntry};
use crate::script::ScriptEngine;
use crate::{Error, Result};

pub use llm::{ChatClient, ChatMessage, ChatModel, VoiceCommand, parse_command};
pub use stt::{Transcriber, WhisperClient};
pub use vad::UtteranceSegmenter;

/// Utterances waiting for transcription
const AUDIO_QUEUE_DEPTH: usize = 5;

/// Transcripts waiting for inference
const TRANSCRIPT_QUEUE_DEPTH: usize = 5;

/// Parsed commands waiting for execution
const COMMAND_QUEUE_DEPTH: usize = 10;

/// Finished responses waiting for a consumer
const RESPONSE_QUEUE_DEPTH: usize = 20;

/// Samples read from the capture source per iteration
const CAPTURE_CHUNK: usize = 2048;

/// Message flowing between pipeline stages
#[derive(Debug, Clone)]
pub enum StageMessage {
    /// A segmented utterance, raw samples
    Audio(Vec<i16>),

    /// Transcribed or typed user text
    Transcript(String),

    /// A parsed model reply awaiting execution
    Command {
        /// The user text that produced the command, for refinement
        question: String,
        command: VoiceCommand,
    },

    /// A stage failure surfaced as a spoken response
    Error(String),
}

/// Finished pipeline turn
#[derive(Debug, Clone)]
pub struct AssistantResponse {
    /// Final spoken/displayed text
    pub text: String,

    /// Command that was executed, empty for errors
    pub command: String,

    /// Whether the turn succeeded
    pub success: bool,
}

/// Backends and shared state the pipeline is assembled from
pub struct PipelineParts {
    pub settings: Arc<Settings>,
    pub transcriber: Arc<dyn Transcriber>,
    pub model: Arc<dyn ChatModel>,
    pub registry: Arc<CommandRegistry>,
    pub engine: Arc<ScriptEngine>,
    pub conversation: Arc<ConversationBuffer>,
    pub arbiter: Arc<Arbiter>,
    pub source_factory: SourceFactory,
}

struct Running {
    audio_tx: mpsc::Sender<StageMessage>,
    transcript_tx: mpsc::Sender<StageMessage>,
    tasks: Vec<JoinHandle<()>>,
}

struct ActiveRecording {
    stop: Arc<AtomicBool>,
    handle: crate::audio::RecordingHandle,
}

/// The assembled voice pipeline
pub struct VoiceAssistant {
    settings: Arc<Settings>,
    transcriber: Arc<dyn Transcriber>,
    model: Arc<dyn ChatModel>,
    registry: Arc<CommandRegistry>,
    engine: Arc<ScriptEngine>,
    conversation: Arc<ConversationBuffer>,
    arbiter: Arc<Arbiter>,
    source_factory: SourceFactory,
    recorder: Recorder,
    sample_rate: u32,
    continuous_listen: bool,
    prompt_template: Option<String>,
    recordings_dir: PathBuf,
    running: Arc<AtomicBool>,
    state: Mutex<Option<Running>>,
    response_rx: tokio::sync::Mutex<Option<mpsc::Receiver<AssistantResponse>>>,
    recording: Mutex<Option<ActiveRecording>>,
}

impl VoiceAssistant {
    #[must_use]
    pub fn new(config: &Config, parts: PipelineParts) -> Arc<Self> {
        let recorder = Recorder::new(Arc::clone(&parts.arbiter), Arc::clone(&parts.source_factory));
        Arc::new(Self {
            settings: parts.settings,
            transcriber: parts.transcriber,
            model: parts.model,
            registry: parts.registry,
            engine: parts.engine,
            conversation: parts.conversation,
            arbiter: parts.arbiter,
            source_factory: parts.source_factory,
            recorder,
            sample_rate: config.voice.sample_rate,
            continuous_listen: config.voice.continuous_listen,
            prompt_template: config.voice.prompt_template.clone(),
            recordings_dir: config.storage.recordings_root(),
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(None),
            response_rx: tokio::sync::Mutex::new(None),
            recording: Mutex::new(None),
        })
    }

    /// Start the pipeline tasks.
    ///
    /// Idempotent; returns `Ok(false)` without starting anything when
    /// the assistant feature is disabled.
    ///
    /// # Errors
    ///
    /// Returns error if continuous capture is configured and the audio
    /// source cannot be opened. Voice mode is reverted in that case.
    pub async fn begin(&self) -> Result<bool> {
        if !self.settings.voice_assistant_enabled() {
            tracing::debug!("voice assistant disabled, not starting");
            return Ok(false);
        }
        // Claim startup atomically; a concurrent begin() loses the
        // exchange and must not spawn a second set of stage tasks
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(true);
        }

        let voice_mode_applied = self.arbiter.playback().set_voice_mode(true);
        if !voice_mode_applied {
            tracing::warn!("playback did not accept voice mode");
        }

        // Open the capture source up front so a missing device fails
        // begin() instead of dying silently inside a task
        let source = if self.continuous_listen {
            match (self.source_factory)(self.sample_rate) {
                Ok(source) => Some(source),
                Err(e) => {
                    if voice_mode_applied {
                        self.arbiter.playback().set_voice_mode(false);
                    }
                    self.running.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE_DEPTH);
        let (transcript_tx, transcript_rx) = mpsc::channel(TRANSCRIPT_QUEUE_DEPTH);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (response_tx, response_rx) = mpsc::channel(RESPONSE_QUEUE_DEPTH);

        let mut tasks = Vec::new();

        if let Some(source) = source {
            let tx = audio_tx.clone();
            let running = Arc::clone(&self.running);
            let arbiter = Arc::clone(&self.arbiter);
            let sample_rate = self.sample_rate;
            tasks.push(tokio::task::spawn_blocking(move || {
                capture_stage(source, &tx, &running, &arbiter, sample_rate);
            }));
        }

        tasks.push(tokio::spawn(stt_stage(
            audio_rx,
            transcript_tx.clone(),
            Arc::clone(&self.transcriber),
            self.sample_rate,
        )));

        let system_prompt =
            prompt::build_system_prompt(self.prompt_template.as_deref(), &self.registry.list());
        tasks.push(tokio::spawn(inference_stage(
            transcript_rx,
            command_tx,
            Arc::clone(&self.model),
            Arc::clone(&self.conversation),
            system_prompt,
        )));

        tasks.push(tokio::spawn(executor_stage(
            command_rx,
            response_tx,
            Arc::clone(&self.registry),
            Arc::clone(&self.engine),
            Arc::clone(&self.model),
            Arc::clone(&self.conversation),
        )));

        *self.response_rx.lock().await = Some(response_rx);
        if let Ok(mut state) = self.state.lock() {
            *state = Some(Running {
                audio_tx,
                transcript_tx,
                tasks,
            });
        }

        tracing::info!(
            continuous = self.continuous_listen,
            "voice assistant pipeline started"
        );
        Ok(true)
    }

    /// Stop the pipeline unconditionally and leave voice mode
    pub async fn end(&self) {
        self.running.store(false, Ordering::SeqCst);

        let taken = self.state.lock().ok().and_then(|mut state| state.take());
        if let Some(running) = taken {
            drop(running.audio_tx);
            drop(running.transcript_tx);
            for task in running.tasks {
                task.abort();
            }
            tracing::info!("voice assistant pipeline stopped");
        }

        *self.response_rx.lock().await = None;
        self.arbiter.playback().set_voice_mode(false);
    }

    /// Whether the pipeline tasks are running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.lock().map(|state| state.is_some()).unwrap_or(false)
    }

    /// Start the pipeline if it is not running.
    ///
    /// # Errors
    ///
    /// Returns error if the assistant is disabled or startup fails
    pub async fn ensure_started(&self) -> Result<()> {
        if self.begin().await? {
            Ok(())
        } else {
            Err(Error::Request("voice assistant is disabled".to_string()))
        }
    }

    /// Inject typed text as if it had been spoken
    ///
    /// # Errors
    ///
    /// Returns error if the pipeline is not running
    pub async fn send_text(&self, text: &str) -> Result<()> {
        let tx = self
            .state
            .lock()
            .ok()
            .and_then(|state| state.as_ref().map(|r| r.transcript_tx.clone()))
            .ok_or_else(|| Error::Request("voice assistant is not running".to_string()))?;

        tx.send(StageMessage::Transcript(text.to_string()))
            .await
            .map_err(|_| Error::Request("voice assistant is shutting down".to_string()))
    }

    /// Wait up to `timeout` for the next finished response
    pub async fn last_response(&self, timeout: Duration) -> Option<AssistantResponse> {
        let mut guard = self.response_rx.lock().await;
        let rx = guard.as_mut()?;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Begin a push-to-talk recording
    ///
    /// # Errors
    ///
    /// Returns error if continuous capture owns the microphone or a
    /// recording is already active
    pub fn start_recording(&self) -> Result<()> {
        if self.continuous_listen && self.is_running() {
            return Err(Error::Audio(
                "microphone is owned by continuous capture".to_string(),
            ));
        }

        let mut slot = self
            .recording
            .lock()
            .map_err(|_| Error::Audio("recording state lock poisoned".to_string()))?;
        if slot.is_some() {
            return Err(Error::Audio("recording already in progress".to_string()));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let config = RecordingConfig::assistant(self.recordings_dir.clone(), self.sample_rate);
        let handle = self.recorder.start(config, Arc::clone(&stop))?;
        *slot = Some(ActiveRecording { stop, handle });
        Ok(())
    }

    /// Stop the active recording and feed it through the pipeline
    ///
    /// # Errors
    ///
    /// Returns error if no recording is active, the recording failed,
    /// or the pipeline cannot be started
    pub async fn stop_recording_and_process(&self) -> Result<()> {
        let active = self
            .recording
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| Error::Audio("no recording in progress".to_string()))?;

        active.stop.store(true, Ordering::Relaxed);
        let result = active.handle.result().await;
        if !result.success {
            return Err(Error::Audio("recording failed".to_string()));
        }

        self.ensure_started().await?;

        let samples = read_wav_samples(&result.file_path)?;
        tracing::info!(
            samples = samples.len(),
            path = %result.file_path.display(),
            "processing push-to-talk recording"
        );

        let tx = self
            .state
            .lock()
            .ok()
            .and_then(|state| state.as_ref().map(|r| r.audio_tx.clone()))
            .ok_or_else(|| Error::Request("voice assistant is not running".to_string()))?;
        tx.send(StageMessage::Audio(samples))
            .await
            .map_err(|_| Error::Request("voice assistant is shutting down".to_string()))
    }
}

/// Blocking loop reading the capture source and segmenting utterances
fn capture_stage(
    mut source: Box<dyn SampleSource>,
    audio_tx: &mpsc::Sender<StageMessage>,
    running: &AtomicBool,
    arbiter: &Arc<Arbiter>,
    sample_rate: u32,
) {
    // Continuous capture holds the hardware for its whole lifetime
    let _guard = match arbiter.acquire(ACQUIRE_TIMEOUT) {
        Ok(guard) => guard,
        Err(e) => {
            tracing::error!(error = %e, "capture could not acquire audio hardware");
            return;
        }
    };

    let mut segmenter = UtteranceSegmenter::new(sample_rate);
    let mut buf = vec![0i16; CAPTURE_CHUNK];

    while running.load(Ordering::SeqCst) {
        let count = match source.read_chunk(&mut buf, Duration::from_millis(100)) {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(error = %e, "capture read failed, stopping");
                break;
            }
        };
        if count == 0 {
            continue;
        }

        if let Some(utterance) = segmenter.push(&buf[..count]) {
            match audio_tx.try_send(StageMessage::Audio(utterance)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("audio queue full, dropping utterance");
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }
    }
}

/// Transcribes queued utterances
async fn stt_stage(
    mut rx: mpsc::Receiver<StageMessage>,
    tx: mpsc::Sender<StageMessage>,
    transcriber: Arc<dyn Transcriber>,
    sample_rate: u32,
) {
    while let Some(message) = rx.recv().await {
        let forwarded = match message {
            StageMessage::Audio(samples) => match encode_wav(&samples, sample_rate) {
                Ok(wav) => match transcriber.transcribe(&wav).await {
                    Ok(text) if text.trim().is_empty() => {
                        tracing::debug!("empty transcript, skipping");
                        continue;
                    }
                    Ok(text) => StageMessage::Transcript(text),
                    Err(e) => StageMessage::Error(format!("transcription failed: {e}")),
                },
                Err(e) => StageMessage::Error(format!("audio encoding failed: {e}")),
            },
            other => other,
        };
        if tx.send(forwarded).await.is_err() {
            break;
        }
    }
}

/// Runs inference on queued transcripts
async fn inference_stage(
    mut rx: mpsc::Receiver<StageMessage>,
    tx: mpsc::Sender<StageMessage>,
    model: Arc<dyn ChatModel>,
    conversation: Arc<ConversationBuffer>,
    system_prompt: String,
) {
    while let Some(message) = rx.recv().await {
        let forwarded = match message {
            StageMessage::Transcript(text) => {
                if let Err(e) = conversation.add_user(&text, "") {
                    tracing::warn!(error = %e, "failed to persist user turn");
                }

                let mut messages = vec![ChatMessage::new("system", system_prompt.clone())];
                messages.extend(
                    conversation
                        .entries()
                        .into_iter()
                        .map(|entry| ChatMessage::new(&entry.role, entry.text)),
                );

                match model.chat(&messages).await {
                    Ok(reply) => StageMessage::Command {
                        question: text,
                        command: parse_command(&reply),
                    },
                    Err(e) => StageMessage::Error(format!("inference failed: {e}")),
                }
            }
            other => other,
        };
        if tx.send(forwarded).await.is_err() {
            break;
        }
    }
}

/// Executes queued commands and emits responses
async fn executor_stage(
    mut rx: mpsc::Receiver<StageMessage>,
    response_tx: mpsc::Sender<AssistantResponse>,
    registry: Arc<CommandRegistry>,
    engine: Arc<ScriptEngine>,
    model: Arc<dyn ChatModel>,
    conversation: Arc<ConversationBuffer>,
) {
    while let Some(message) = rx.recv().await {
        let response = match message {
            StageMessage::Command { question, command } => {
                execute_turn(&question, command, &registry, &engine, model.as_ref(), &conversation)
                    .await
            }
            StageMessage::Error(text) => {
                tracing::warn!(error = %text, "pipeline turn failed");
                AssistantResponse {
                    text,
                    command: String::new(),
                    success: false,
                }
            }
            other => {
                tracing::warn!(?other, "unexpected message at executor stage");
                continue;
            }
        };

        if let Err(TrySendError::Full(_)) = response_tx.try_send(response) {
            tracing::warn!("response queue full, dropping response");
        }
    }
}

async fn execute_turn(
    question: &str,
    command: VoiceCommand,
    registry: &Arc<CommandRegistry>,
    engine: &Arc<ScriptEngine>,
    model: &dyn ChatModel,
    conversation: &ConversationBuffer,
) -> AssistantResponse {
    let name = command.command.clone();
    tracing::info!(command = %name, "executing turn");

    let result = match name.as_str() {
        "" | "none" => None,
        "script" => {
            let script = command
                .args
                .first()
                .cloned()
                .unwrap_or_default();
            if script.is_empty() {
                Some(crate::commands::CommandResult::failed(
                    "script command without a script",
                ))
            } else {
                let engine = Arc::clone(engine);
                run_blocking(move || engine.execute(&script)).await
            }
        }
        _ => {
            let registry = Arc::clone(registry);
            let args = command.args.clone();
            let name = name.clone();
            run_blocking(move || registry.execute(&name, &args)).await
        }
    };

    let (output, success) = match &result {
        Some(result) => (result.message.clone(), result.success),
        None => (String::new(), true),
    };

    let refined = if success && llm::needs_refinement(&output, &name) {
        match llm::refine_output(model, question, &output).await {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!(error = %e, "refinement failed, using raw output");
                None
            }
        }
    } else {
        None
    };

    let final_text = refined.clone().unwrap_or_else(|| {
        if !command.text.is_empty() {
            command.text.clone()
        } else {
            output.clone()
        }
    });

    let entry = ConversationEntry {
        text: final_text.clone(),
        command: if name == "none" { String::new() } else { name.clone() },
        args: command.args,
        output,
        refined_output: refined.unwrap_or_default(),
        ..ConversationEntry::default()
    };
    if let Err(e) = conversation.add_assistant(entry) {
        tracing::warn!(error = %e, "failed to persist assistant turn");
    }

    AssistantResponse {
        text: final_text,
        command: name,
        success,
    }
}

async fn run_blocking<F>(f: F) -> Option<crate::commands::CommandResult>
where
    F: FnOnce() -> crate::commands::CommandResult + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => Some(result),
        Err(e) => {
            tracing::error!(error = %e, "command task panicked");
            Some(crate::commands::CommandResult::failed("command task failed"))
        }
    }
}

/// Encode raw samples as an in-memory mono WAV
fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| Error::Audio(e.to_string()))?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }
        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

/// Read all samples from a recorded WAV file
fn read_wav_samples(path: &std::path::Path) -> Result<Vec<i16>> {
    let mut reader = hound::WavReader::open(path).map_err(|e| Error::Audio(e.to_string()))?;
    reader
        .samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Audio(e.to_string()))
}
