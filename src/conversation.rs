//! Bounded, persisted conversation history
//!
//! Dialogue turns are appended by the pipeline and by direct chat input,
//! kept in a bounded deque (oldest evicted first) and persisted as JSON
//! so history survives a restart. Independent of the request manager's
//! in-flight tracking, which is in-memory only by design.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Default retention limit (entries)
pub const DEFAULT_LIMIT: usize = 30;

/// Minimum configurable retention limit
pub const MIN_LIMIT: usize = 10;

/// Maximum configurable retention limit
pub const MAX_LIMIT: usize = 100;

/// A single dialogue turn
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConversationEntry {
    /// "user" or "assistant"
    pub role: String,

    /// Display text for this turn
    pub text: String,

    /// Unix timestamp in milliseconds
    pub timestamp: i64,

    /// Command the assistant issued, if any
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,

    /// Command arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Raw STT transcription for voice turns
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub transcription: String,

    /// Raw command output
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,

    /// LLM-refined command output, when refinement ran
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub refined_output: String,
}

#[derive(Serialize, Deserialize)]
struct PersistedBuffer {
    limit: usize,
    messages: Vec<ConversationEntry>,
}

struct Inner {
    entries: VecDeque<ConversationEntry>,
    limit: usize,
}

/// Bounded ring of dialogue turns, persisted to a JSON file
pub struct ConversationBuffer {
    inner: Mutex<Inner>,
    path: PathBuf,
}

impl ConversationBuffer {
    /// Open (or create) the buffer backed by `path`.
    ///
    /// A corrupt or unreadable file is logged and replaced with an
    /// empty buffer rather than failing startup.
    #[must_use]
    pub fn open(path: PathBuf, limit: usize) -> Self {
        let limit = limit.clamp(MIN_LIMIT, MAX_LIMIT);
        let inner = Self::load(&path, limit);
        Self {
            inner: Mutex::new(inner),
            path,
        }
    }

    fn load(path: &PathBuf, fallback_limit: usize) -> Inner {
        if !path.exists() {
            return Inner {
                entries: VecDeque::new(),
                limit: fallback_limit,
            };
        }

        match std::fs::read_to_string(path)
            .map_err(crate::Error::from)
            .and_then(|raw| serde_json::from_str::<PersistedBuffer>(&raw).map_err(Into::into))
        {
            Ok(persisted) => {
                let limit = persisted.limit.clamp(MIN_LIMIT, MAX_LIMIT);
                let mut entries: VecDeque<_> = persisted.messages.into();
                while entries.len() > limit {
                    entries.pop_front();
                }
                Inner { entries, limit }
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to read conversation buffer, starting fresh");
                Inner {
                    entries: VecDeque::new(),
                    limit: fallback_limit,
                }
            }
        }
    }

    /// Append a user turn
    ///
    /// # Errors
    ///
    /// Returns error if persisting the buffer fails
    pub fn add_user(&self, text: &str, transcription: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.add(ConversationEntry {
            role: "user".to_string(),
            text: text.to_string(),
            transcription: transcription.to_string(),
            timestamp: now_ms(),
            ..ConversationEntry::default()
        })
    }

    /// Append an assistant turn
    ///
    /// # Errors
    ///
    /// Returns error if persisting the buffer fails
    pub fn add_assistant(&self, entry: ConversationEntry) -> Result<()> {
        if entry.text.is_empty() && entry.command.is_empty() {
            return Ok(());
        }
        let entry = ConversationEntry {
            role: "assistant".to_string(),
            timestamp: if entry.timestamp == 0 { now_ms() } else { entry.timestamp },
            ..entry
        };
        self.add(entry)
    }

    fn add(&self, entry: ConversationEntry) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        inner.entries.push_back(entry);
        while inner.entries.len() > inner.limit {
            inner.entries.pop_front();
        }
        self.persist(&inner)
    }

    /// Snapshot of the buffered entries, oldest first
    #[must_use]
    pub fn entries(&self) -> Vec<ConversationEntry> {
        self.inner
            .lock()
            .map(|inner| inner.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of buffered entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    /// Whether the buffer is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current retention limit
    #[must_use]
    pub fn limit(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.limit)
            .unwrap_or(DEFAULT_LIMIT)
    }

    /// Change the retention limit (clamped to 10-100), evicting oldest
    /// entries immediately if the buffer shrinks
    ///
    /// # Errors
    ///
    /// Returns error if persisting the buffer fails
    pub fn set_limit(&self, new_limit: usize) -> Result<()> {
        let clamped = new_limit.clamp(MIN_LIMIT, MAX_LIMIT);
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        if clamped == inner.limit {
            return Ok(());
        }
        inner.limit = clamped;
        while inner.entries.len() > inner.limit {
            inner.entries.pop_front();
        }
        self.persist(&inner)
    }

    /// Remove all entries
    ///
    /// # Errors
    ///
    /// Returns error if persisting the buffer fails
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        inner.entries.clear();
        self.persist(&inner)
    }

    fn persist(&self, inner: &Inner) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let persisted = PersistedBuffer {
            limit: inner.limit,
            messages: inner.entries.iter().cloned().collect(),
        };
        let raw = serde_json::to_string(&persisted)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn poisoned() -> crate::Error {
    crate::Error::Storage("conversation buffer lock poisoned".to_string())
}
