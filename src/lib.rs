//! Skald - asynchronous voice-command pipeline
//!
//! This library provides the core pieces of the Skald assistant:
//! - Request lifecycle (FIFO queue, worker, TTL-evicted results)
//! - Voice pipeline (capture, STT, inference, command execution)
//! - Sandboxed Lua execution for model-generated scripts
//! - Microphone recording with AGC and hardware arbitration
//! - Bounded, persisted conversation history
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                 Request Manager                   │
//! │   submit / status / cancel  │  worker  │ cleanup │
//! └───────────────────┬──────────────────────────────┘
//!                     │
//! ┌───────────────────▼──────────────────────────────┐
//! │                Voice Assistant                    │
//! │   capture │ STT │ inference │ executor           │
//! └───────────────────┬──────────────────────────────┘
//!                     │
//! ┌───────────────────▼──────────────────────────────┐
//! │   Commands │ Lua sandbox │ Storage │ History     │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod assistant;
pub mod audio;
pub mod commands;
pub mod config;
pub mod conversation;
pub mod error;
pub mod requests;
pub mod script;
pub mod storage;

pub use assistant::{
    AssistantResponse, ChatClient, ChatMessage, ChatModel, PipelineParts, StageMessage,
    Transcriber, VoiceAssistant, VoiceCommand, WhisperClient,
};
pub use audio::{Arbiter, NullPlayback, PlaybackControl, Recorder, RecordingConfig};
pub use commands::{CommandRegistry, CommandResult};
pub use config::{Config, Settings};
pub use conversation::{ConversationBuffer, ConversationEntry};
pub use error::{Error, Result};
pub use requests::{RequestManager, RequestManagerConfig, RequestRecord, RequestStatus};
pub use script::{Capabilities, ScriptEngine};
pub use storage::{FileStore, WebDataStore};
