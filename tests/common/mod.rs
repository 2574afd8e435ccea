//! Shared test utilities
//!
//! Mock transcription and chat backends plus an assembled assistant so
//! pipeline tests run without audio hardware or network access.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use skald::assistant::{ChatMessage, ChatModel, PipelineParts, Transcriber, VoiceAssistant};
use skald::audio::{Arbiter, PlaybackControl, SampleSource};
use skald::script::{Capabilities, ScriptEngine};
use skald::{
    CommandRegistry, Config, ConversationBuffer, Error, Result, Settings,
};

/// Chat backend that replays canned replies in order
pub struct ScriptedChat {
    replies: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedChat {
    #[must_use]
    pub fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(ToString::to_string).collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Message lists the backend was called with
    #[must_use]
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(messages.to_vec());
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .ok_or_else(|| Error::Llm("no scripted reply left".to_string()))
    }
}

/// Chat backend that always fails
pub struct FailingChat;

#[async_trait]
impl ChatModel for FailingChat {
    async fn chat(&self, _messages: &[ChatMessage]) -> Result<String> {
        Err(Error::Llm("backend unavailable".to_string()))
    }
}

/// Chat backend that never answers within any sane test deadline
pub struct StalledChat;

#[async_trait]
impl ChatModel for StalledChat {
    async fn chat(&self, _messages: &[ChatMessage]) -> Result<String> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(Error::Llm("unreachable".to_string()))
    }
}

/// Transcriber that returns a fixed transcript
pub struct FixedTranscriber(pub String);

#[async_trait]
impl Transcriber for FixedTranscriber {
    async fn transcribe(&self, _audio: &[u8]) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Transcriber that always fails
pub struct FailingTranscriber;

#[async_trait]
impl Transcriber for FailingTranscriber {
    async fn transcribe(&self, _audio: &[u8]) -> Result<String> {
        Err(Error::Stt("transcription unavailable".to_string()))
    }
}

/// Playback stub that records how it was driven
#[derive(Default)]
pub struct TrackingPlayback {
    stops: AtomicUsize,
    voice_modes: Mutex<Vec<bool>>,
}

impl TrackingPlayback {
    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn voice_modes(&self) -> Vec<bool> {
        self.voice_modes.lock().expect("voice mode lock").clone()
    }
}

impl PlaybackControl for TrackingPlayback {
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn set_voice_mode(&self, enabled: bool) -> bool {
        self.voice_modes.lock().expect("voice mode lock").push(enabled);
        true
    }
}

/// Deterministic sample source replaying a fixed buffer
pub struct ReplaySource {
    samples: Vec<i16>,
    position: usize,
}

impl ReplaySource {
    #[must_use]
    pub fn new(samples: Vec<i16>) -> Self {
        Self {
            samples,
            position: 0,
        }
    }
}

impl SampleSource for ReplaySource {
    fn read_chunk(&mut self, buf: &mut [i16], timeout: Duration) -> Result<usize> {
        let remaining = self.samples.len() - self.position;
        let count = buf.len().min(remaining);
        if count == 0 {
            // Behave like a quiet device once the buffer is drained
            std::thread::sleep(timeout);
            return Ok(0);
        }
        buf[..count].copy_from_slice(&self.samples[self.position..self.position + count]);
        self.position += count;
        Ok(count)
    }
}

/// Config pointing all storage into a temp dir
#[must_use]
pub fn test_config(data_dir: &std::path::Path) -> Config {
    Config {
        storage: skald::config::StorageConfig {
            data_dir: data_dir.to_path_buf(),
            ..skald::config::StorageConfig::default()
        },
        conversation_limit: 30,
        ..Config::default()
    }
}

/// An assembled assistant with mock backends and its supporting state
pub struct TestAssistant {
    pub assistant: Arc<VoiceAssistant>,
    pub settings: Arc<Settings>,
    pub registry: Arc<CommandRegistry>,
    pub conversation: Arc<ConversationBuffer>,
    pub playback: Arc<TrackingPlayback>,
    _dir: tempfile::TempDir,
}

/// Build an assistant wired to mock backends and a temp data dir
#[must_use]
pub fn build_assistant(
    model: Arc<dyn ChatModel>,
    transcriber: Arc<dyn Transcriber>,
) -> TestAssistant {
    build(model, transcriber, Vec::new(), false)
}

/// Like [`build_assistant`], but the capture source replays `samples`
#[must_use]
pub fn build_assistant_with_source(
    model: Arc<dyn ChatModel>,
    transcriber: Arc<dyn Transcriber>,
    samples: Vec<i16>,
) -> TestAssistant {
    build(model, transcriber, samples, false)
}

/// Like [`build_assistant_with_source`], with continuous capture on
#[must_use]
pub fn build_continuous_assistant(
    model: Arc<dyn ChatModel>,
    transcriber: Arc<dyn Transcriber>,
    samples: Vec<i16>,
) -> TestAssistant {
    build(model, transcriber, samples, true)
}

fn build(
    model: Arc<dyn ChatModel>,
    transcriber: Arc<dyn Transcriber>,
    samples: Vec<i16>,
    continuous: bool,
) -> TestAssistant {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut config = test_config(dir.path());
    config.voice.continuous_listen = continuous;

    let settings = Settings::new(&config);
    let registry = Arc::new(CommandRegistry::new());
    let conversation = Arc::new(ConversationBuffer::open(
        dir.path().join("conversation.json"),
        config.conversation_limit,
    ));

    let dispatch_registry = Arc::clone(&registry);
    let mut caps = Capabilities::noop();
    caps.dispatch = Arc::new(move |name, args| dispatch_registry.execute(name, args));
    let engine = Arc::new(ScriptEngine::new(caps));

    let playback = Arc::new(TrackingPlayback::default());
    let arbiter = Arbiter::new(Arc::clone(&playback) as Arc<dyn PlaybackControl>);

    let assistant = VoiceAssistant::new(
        &config,
        PipelineParts {
            settings: Arc::clone(&settings),
            transcriber,
            model,
            registry: Arc::clone(&registry),
            engine,
            conversation: Arc::clone(&conversation),
            arbiter,
            source_factory: Arc::new(move |_| {
                if samples.is_empty() {
                    Err(Error::Audio("no capture in tests".to_string()))
                } else {
                    Ok(Box::new(ReplaySource::new(samples.clone())) as Box<dyn SampleSource>)
                }
            }),
        },
    );

    TestAssistant {
        assistant,
        settings,
        registry,
        conversation,
        playback,
        _dir: dir,
    }
}
