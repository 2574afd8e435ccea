//! Configuration for the Skald pipeline
//!
//! A `Config` is an immutable snapshot loaded at startup (TOML file plus
//! defaults); `Settings` is the small live handle the request manager
//! re-reads on every submission.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Deserialize;

use crate::{Error, Result};

/// Skald pipeline configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Voice assistant configuration
    pub voice: VoiceConfig,

    /// Speech-to-text endpoint configuration
    pub stt: SttConfig,

    /// Chat-completion endpoint configuration
    pub llm: LlmConfig,

    /// Storage layout (recordings, web data, memory files)
    pub storage: StorageConfig,

    /// Conversation history retention (entries), clamped to 10-100
    pub conversation_limit: usize,
}

/// Voice assistant configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Master toggle for the voice assistant feature
    pub enabled: bool,

    /// Sample rate for capture and recordings (16kHz for speech)
    pub sample_rate: u32,

    /// Hold the microphone open and segment utterances automatically.
    /// When off, capture happens through push-to-talk recordings only.
    pub continuous_listen: bool,

    /// Optional system-prompt template override.
    /// `{{COMMAND_LIST}}` is replaced with the registered commands.
    pub prompt_template: Option<String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 16_000,
            continuous_listen: false,
            prompt_template: None,
        }
    }
}

/// Speech-to-text endpoint configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Use the local endpoint instead of the cloud one
    pub local_mode: bool,

    /// Local Whisper-compatible endpoint
    pub local_endpoint: String,

    /// Cloud transcription endpoint
    pub cloud_endpoint: String,

    /// API key for the cloud endpoint (local servers ignore it)
    pub api_key: Option<String>,

    /// Transcription model name
    pub model: String,
}

impl SttConfig {
    /// Endpoint selected by the local/cloud mode flag
    #[must_use]
    pub fn endpoint(&self) -> &str {
        if self.local_mode {
            &self.local_endpoint
        } else {
            &self.cloud_endpoint
        }
    }
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            local_mode: false,
            local_endpoint: "http://127.0.0.1:9000/v1/audio/transcriptions".to_string(),
            cloud_endpoint: "https://api.openai.com/v1/audio/transcriptions".to_string(),
            api_key: None,
            model: "whisper-1".to_string(),
        }
    }
}

/// Chat-completion endpoint configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Use the local (Ollama-style) endpoint instead of the cloud one
    pub local_mode: bool,

    /// Local chat-completions endpoint
    pub local_endpoint: String,

    /// Cloud chat-completions endpoint
    pub cloud_endpoint: String,

    /// API key for the cloud endpoint
    pub api_key: Option<String>,

    /// Model identifier; empty in local mode means "adopt the first
    /// model the server reports"
    pub model: String,
}

impl LlmConfig {
    /// Endpoint selected by the local/cloud mode flag
    #[must_use]
    pub fn endpoint(&self) -> &str {
        if self.local_mode {
            &self.local_endpoint
        } else {
            &self.cloud_endpoint
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            local_mode: false,
            local_endpoint: "http://127.0.0.1:11434/v1/chat/completions".to_string(),
            cloud_endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            model: String::new(),
        }
    }
}

/// Storage layout for recordings and sandbox file areas
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Removable storage mount point, preferred for recordings when present
    pub removable_dir: Option<PathBuf>,

    /// Internal data directory (recordings fallback, conversation file,
    /// webdata and memory areas live under it)
    pub data_dir: PathBuf,

    /// Subdirectory name for assistant recordings
    pub recordings_dir: String,
}

impl StorageConfig {
    /// Directory recordings are written to: removable storage when the
    /// mount point exists, internal data dir otherwise
    #[must_use]
    pub fn recordings_root(&self) -> PathBuf {
        match &self.removable_dir {
            Some(dir) if dir.is_dir() => dir.join(&self.recordings_dir),
            _ => self.data_dir.join(&self.recordings_dir),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            removable_dir: None,
            data_dir: default_data_dir(),
            recordings_dir: "assistant_recordings".to_string(),
        }
    }
}

/// Default data directory (`~/.local/share/skald` or platform equivalent)
fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "skald", "skald")
        .map_or_else(|| PathBuf::from(".skald"), |d| d.data_dir().to_path_buf())
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults
    /// when the file does not exist
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed,
    /// or if the loaded values are out of range
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let path = path.map_or_else(default_config_path, std::path::Path::to_path_buf);

        let config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let config: Self = toml::from_str(&raw)?;
            tracing::debug!(path = %path.display(), "loaded configuration");
            config
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self {
                conversation_limit: crate::conversation::DEFAULT_LIMIT,
                ..Self::default()
            }
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.voice.sample_rate == 0 {
            return Err(Error::Config("sample_rate must be non-zero".to_string()));
        }
        if !self.llm.local_mode && self.llm.model.is_empty() {
            return Err(Error::Config(
                "llm.model is required in cloud mode".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default config file path (`~/.config/skald/skald.toml` or platform equivalent)
fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("dev", "skald", "skald").map_or_else(
        || PathBuf::from("skald.toml"),
        |d| d.config_dir().join("skald.toml"),
    )
}

/// Live settings shared across the pipeline.
///
/// The request manager reads the voice toggle once per submission, so
/// flipping it takes effect immediately without a restart.
#[derive(Debug)]
pub struct Settings {
    voice_assistant_enabled: AtomicBool,
}

impl Settings {
    /// Create a settings handle seeded from the config snapshot
    #[must_use]
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            voice_assistant_enabled: AtomicBool::new(config.voice.enabled),
        })
    }

    /// Whether the voice assistant feature is enabled
    #[must_use]
    pub fn voice_assistant_enabled(&self) -> bool {
        self.voice_assistant_enabled.load(Ordering::Relaxed)
    }

    /// Toggle the voice assistant feature
    pub fn set_voice_assistant_enabled(&self, enabled: bool) {
        self.voice_assistant_enabled.store(enabled, Ordering::Relaxed);
    }
}
