//! Chat-completion backend and model-reply parsing

use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::{Error, Result};

/// Replies longer than this get a refinement pass before speech
const REFINEMENT_LENGTH_THRESHOLD: usize = 200;

/// One chat message in OpenAI wire format
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// Parsed assistant reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceCommand {
    /// Command name; `none` means speak the text and do nothing else,
    /// `script` means `args[0]` holds a Lua script
    pub command: String,

    /// Command arguments
    pub args: Vec<String>,

    /// Text to speak or display
    pub text: String,
}

/// Wire shape the model is instructed to reply with
#[derive(Deserialize)]
struct ModelReply {
    #[serde(default)]
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    text: String,
}

/// Produces chat completions
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Complete a conversation, returning the assistant message content
    ///
    /// # Errors
    ///
    /// Returns error if the completion fails
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String>;
}

/// OpenAI-compatible chat-completions client, covering both a local
/// Ollama-style server and a cloud endpoint
pub struct ChatClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    local_mode: bool,
    // Interior mutability: an empty local model is adopted from the
    // server's tag list on first use
    model: RwLock<String>,
}

impl ChatClient {
    /// Create a client from LLM configuration
    ///
    /// # Errors
    ///
    /// Returns error if cloud mode is selected without an API key
    pub fn new(config: &LlmConfig) -> Result<Self> {
        if !config.local_mode && config.api_key.as_deref().unwrap_or("").is_empty() {
            return Err(Error::Config(
                "API key required for cloud chat completions".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint().to_string(),
            api_key: config.api_key.clone(),
            local_mode: config.local_mode,
            model: RwLock::new(config.model.clone()),
        })
    }

    /// Currently selected model
    #[must_use]
    pub fn model(&self) -> String {
        self.model.read().map(|m| m.clone()).unwrap_or_default()
    }

    /// List models the endpoint offers
    ///
    /// # Errors
    ///
    /// Returns error if the listing request fails
    pub async fn fetch_models(&self) -> Result<Vec<String>> {
        if self.local_mode {
            let url = tags_url(&self.endpoint);
            let response: TagsResponse = self.client.get(&url).send().await?.json().await?;
            Ok(response.models.into_iter().map(|m| m.name).collect())
        } else {
            let url = sibling_url(&self.endpoint, "models");
            let mut request = self.client.get(&url);
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", format!("Bearer {key}"));
            }
            let response: ModelsResponse = request.send().await?.json().await?;
            Ok(response.data.into_iter().map(|m| m.id).collect())
        }
    }

    /// Adopt the first model the local server reports
    async fn adopt_local_model(&self) -> Result<String> {
        let models = self.fetch_models().await?;
        let Some(first) = models.first() else {
            return Err(Error::Llm("local server reports no models".to_string()));
        };
        tracing::info!(model = %first, "adopted local model");
        if let Ok(mut model) = self.model.write() {
            model.clone_from(first);
        }
        Ok(first.clone())
    }

    async fn request(&self, model: &str, messages: &[ChatMessage]) -> Result<reqwest::Response> {
        let body = ChatRequest {
            model,
            messages,
            stream: false,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key
            && !key.is_empty()
        {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        Ok(request.send().await?)
    }
}

#[async_trait]
impl ChatModel for ChatClient {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let mut model = self.model();
        if model.is_empty() && self.local_mode {
            model = self.adopt_local_model().await?;
        }

        tracing::debug!(model = %model, messages = messages.len(), "requesting completion");

        let mut response = self.request(&model, messages).await?;

        // A local 404 usually means the configured model is gone from
        // the server; adopt whatever it has now and retry once
        if response.status() == reqwest::StatusCode::NOT_FOUND && self.local_mode {
            tracing::warn!(model = %model, "model not found on local server");
            let adopted = self.adopt_local_model().await?;
            response = self.request(&adopted, messages).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "chat completion error");
            return Err(Error::Llm(format!("chat completion error {status}: {body}")));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse completion response");
            e
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Llm("completion contained no choices".to_string()))?;

        tracing::debug!(chars = content.len(), "completion received");
        Ok(content)
    }
}

/// Parse a model reply into a command.
///
/// The model is instructed to answer with a JSON object, but smaller
/// models drift; anything unparseable becomes a plain `none` command
/// carrying the raw text.
#[must_use]
pub fn parse_command(reply: &str) -> VoiceCommand {
    let json_slice = reply
        .find('{')
        .and_then(|start| reply.rfind('}').map(|end| &reply[start..=end]));

    if let Some(slice) = json_slice
        && let Ok(parsed) = serde_json::from_str::<ModelReply>(slice)
        && (!parsed.command.is_empty() || !parsed.text.is_empty())
    {
        return VoiceCommand {
            command: if parsed.command.is_empty() {
                "none".to_string()
            } else {
                parsed.command
            },
            args: parsed.args,
            text: parsed.text,
        };
    }

    VoiceCommand {
        command: "none".to_string(),
        args: Vec::new(),
        text: reply.trim().to_string(),
    }
}

/// Whether raw command output should get a natural-language pass
/// before being spoken
#[must_use]
pub fn needs_refinement(output: &str, command: &str) -> bool {
    if output.trim().is_empty() {
        return false;
    }
    if output.len() > REFINEMENT_LENGTH_THRESHOLD {
        return true;
    }
    let trimmed = output.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return true;
    }
    if matches!(command, "script") {
        return looks_technical(output);
    }
    command.starts_with("webdata") || command.starts_with("memory")
}

fn looks_technical(output: &str) -> bool {
    output.contains("://")
        || output.contains('=')
        || output.lines().count() > 3
        || output.chars().filter(|c| c.is_ascii_digit()).count() * 2 > output.len()
}

/// Rewrite raw command output as a short spoken answer
///
/// # Errors
///
/// Returns error if the completion fails
pub async fn refine_output(
    model: &dyn ChatModel,
    question: &str,
    raw_output: &str,
) -> Result<String> {
    let system = "You turn raw command output into a short spoken answer. \
                  Reply with one or two plain sentences and no markup.";
    let user = format!("Question: {question}\n\nRaw output:\n{raw_output}");
    let messages = [
        ChatMessage::new("system", system),
        ChatMessage::new("user", user),
    ];
    model.chat(&messages).await
}

/// Ollama tags URL for a chat-completions endpoint
fn tags_url(endpoint: &str) -> String {
    endpoint.split("/v1/").next().map_or_else(
        || endpoint.to_string(),
        |base| format!("{base}/api/tags"),
    )
}

/// Swap the route of a chat-completions endpoint for a sibling route
///
/// `…/v1/chat/completions` shares its `/v1` base with `…/v1/models`, so
/// the whole `chat/completions` suffix has to go, not just the last
/// segment.
fn sibling_url(endpoint: &str, segment: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    trimmed
        .strip_suffix("/chat/completions")
        .or_else(|| trimmed.rsplit_once('/').map(|(base, _)| base))
        .map_or_else(|| trimmed.to_string(), |base| format!("{base}/{segment}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_reply_parses() {
        let reply = r#"{"command": "brightness", "args": ["50"], "text": "Dimming."}"#;
        let cmd = parse_command(reply);
        assert_eq!(cmd.command, "brightness");
        assert_eq!(cmd.args, ["50"]);
        assert_eq!(cmd.text, "Dimming.");
    }

    #[test]
    fn reply_wrapped_in_prose_parses() {
        let reply = "Sure thing!\n```json\n{\"command\": \"none\", \"text\": \"Hi.\"}\n```";
        let cmd = parse_command(reply);
        assert_eq!(cmd.command, "none");
        assert_eq!(cmd.text, "Hi.");
    }

    #[test]
    fn plain_prose_falls_back_to_none() {
        let cmd = parse_command("The weather looks fine today.");
        assert_eq!(cmd.command, "none");
        assert!(cmd.args.is_empty());
        assert_eq!(cmd.text, "The weather looks fine today.");
    }

    #[test]
    fn unparseable_json_falls_back_to_raw_text() {
        let cmd = parse_command("{ broken json");
        assert_eq!(cmd.command, "none");
        assert_eq!(cmd.text, "{ broken json");
    }

    #[test]
    fn missing_command_defaults_to_none() {
        let cmd = parse_command(r#"{"text": "Just talking."}"#);
        assert_eq!(cmd.command, "none");
        assert_eq!(cmd.text, "Just talking.");
    }

    #[test]
    fn refinement_triggers() {
        assert!(needs_refinement(&"x".repeat(300), "none"));
        assert!(needs_refinement(r#"{"temp": 21}"#, "none"));
        assert!(needs_refinement("count=42", "script"));
        assert!(needs_refinement("a,b", "webdata_read"));
        assert!(!needs_refinement("It is 21 degrees.", "none"));
        assert!(!needs_refinement("", "script"));
    }

    #[test]
    fn endpoint_url_derivation() {
        assert_eq!(
            tags_url("http://127.0.0.1:11434/v1/chat/completions"),
            "http://127.0.0.1:11434/api/tags"
        );
        assert_eq!(
            sibling_url("https://api.openai.com/v1/chat/completions", "models"),
            "https://api.openai.com/v1/models"
        );
        assert_eq!(
            sibling_url("https://api.openai.com/v1/chat/completions/", "models"),
            "https://api.openai.com/v1/models"
        );
        assert_eq!(
            sibling_url("https://example.com/v1/completions", "models"),
            "https://example.com/v1/models"
        );
    }
}
