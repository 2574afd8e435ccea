//! Speech-to-text backend

use async_trait::async_trait;

use crate::config::SttConfig;
use crate::{Error, Result};

/// Response from a Whisper-compatible transcription endpoint
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Turns recorded audio into text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe WAV audio bytes to text
    ///
    /// # Errors
    ///
    /// Returns error if transcription fails
    async fn transcribe(&self, audio: &[u8]) -> Result<String>;
}

/// Whisper-compatible HTTP transcription client
pub struct WhisperClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl WhisperClient {
    /// Create a client from STT configuration
    ///
    /// # Errors
    ///
    /// Returns error if cloud mode is selected without an API key
    pub fn new(config: &SttConfig) -> Result<Self> {
        if !config.local_mode && config.api_key.as_deref().unwrap_or("").is_empty() {
            return Err(Error::Config(
                "API key required for cloud transcription".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint().to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    async fn request(&self, audio: &[u8]) -> Result<String> {
        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if let Some(key) = &self.api_key
            && !key.is_empty()
        {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, "transcription request failed");
            e
        })?;

        let status = response.status();
        tracing::debug!(status = %status, "received transcription response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "transcription API error");
            return Err(Error::Stt(format!("transcription error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse transcription response");
            e
        })?;

        Ok(result.text)
    }
}

#[async_trait]
impl Transcriber for WhisperClient {
    async fn transcribe(&self, audio: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting transcription");

        // One retry covers transient connection drops to local servers
        let text = match self.request(audio).await {
            Ok(text) => text,
            Err(Error::Http(_)) => {
                tracing::warn!("transcription transport failure, retrying once");
                self.request(audio).await?
            }
            Err(e) => return Err(e),
        };

        tracing::info!(transcript = %text, "transcription complete");
        Ok(text)
    }
}
