//! Error types for the Skald pipeline

use thiserror::Error;

/// Result type alias for Skald operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Skald pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Request lifecycle error (submission rejected, manager stopped, ...)
    #[error("request error: {0}")]
    Request(String),

    /// Audio capture/recording error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// LLM/chat-completion error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Lua script execution error
    #[error("script error: {0}")]
    Script(String),

    /// File storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
