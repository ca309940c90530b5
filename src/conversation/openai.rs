//! Conversation engine backed by an OpenAI-compatible chat completions API.
//!
//! Works with OpenAI, OpenRouter, vLLM, Ollama's compatibility endpoint and anything
//! else speaking the same protocol.

use super::engine::{
    ChatMessage, Conversation, ConversationEngine, EngineError, HistoryManager, MessageRole,
    TokenUsage,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const API_KEY_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of the bearer key sent to the API.
#[derive(Debug, Clone)]
pub enum ApiKeySource {
    None,
    Static(String),
    /// Shell command printing the key, run before every request.
    Command(String),
}

impl ApiKeySource {
    async fn get_key(&self) -> Result<Option<String>, EngineError> {
        let cmd = match self {
            ApiKeySource::None => return Ok(None),
            ApiKeySource::Static(key) => return Ok(Some(key.clone())),
            ApiKeySource::Command(cmd) => cmd,
        };

        let output = tokio::time::timeout(
            API_KEY_COMMAND_TIMEOUT,
            Command::new("sh").arg("-c").arg(cmd).output(),
        )
        .await
        .map_err(|_| EngineError::Other("api_key_command timed out".to_string()))?
        .map_err(|e| EngineError::Other(format!("Failed to execute api_key_command: {}", e)))?;

        if !output.status.success() {
            warn!(command = %cmd, "api_key_command failed with status {}", output.status);
            return Err(EngineError::Other(format!(
                "api_key_command failed with status {}",
                output.status
            )));
        }
        let key = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if key.is_empty() {
            return Err(EngineError::Other(
                "api_key_command returned empty key".to_string(),
            ));
        }
        Ok(Some(key))
    }
}

#[derive(Debug, Clone)]
pub struct OpenAIEngineSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: ApiKeySource,
    pub temperature: Option<f32>,
    pub request_timeout: Duration,
    /// Ask the API for a JSON object reply.
    pub json_mode: bool,
    /// System prompts by instruction key.
    pub instructions: HashMap<String, String>,
}

pub struct OpenAIEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    client: Client,
    settings: OpenAIEngineSettings,
    usage: Mutex<HashMap<String, TokenUsage>>,
}

impl OpenAIEngine {
    pub fn new(settings: OpenAIEngineSettings) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                client: Client::new(),
                settings,
                usage: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Tokens spent so far on `conversation_id`.
    pub fn usage_of(&self, conversation_id: &str) -> TokenUsage {
        self.inner
            .usage
            .lock()
            .unwrap()
            .get(conversation_id)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConversationEngine for OpenAIEngine {
    async fn start_conversation(
        &self,
        history: Arc<dyn HistoryManager>,
        instruction_key: &str,
        conversation_id: &str,
    ) -> Result<Box<dyn Conversation>, EngineError> {
        let system_prompt = self.inner.settings.instructions.get(instruction_key).cloned();
        if system_prompt.is_none() {
            warn!("No instruction configured for key {}", instruction_key);
        }
        let turns = history.get(conversation_id);
        debug!(
            "Starting conversation {} with {} previous turns",
            conversation_id,
            turns.len()
        );
        Ok(Box::new(OpenAIConversation {
            inner: Arc::clone(&self.inner),
            id: conversation_id.to_string(),
            system_prompt,
            turns,
            history,
            usage: TokenUsage::default(),
        }))
    }

    async fn close(&self, conversation_id: &str) -> Result<(), EngineError> {
        if let Some(usage) = self.inner.usage.lock().unwrap().remove(conversation_id) {
            info!(
                "Conversation {} closed after {} tokens ({} prompt, {} completion)",
                conversation_id, usage.total_tokens, usage.prompt_tokens, usage.completion_tokens
            );
        }
        Ok(())
    }
}

impl EngineInner {
    async fn complete(
        &self,
        messages: Vec<OpenAIMessage>,
    ) -> Result<(String, Option<TokenUsage>), EngineError> {
        let settings = &self.settings;
        let url = format!("{}/chat/completions", settings.base_url.trim_end_matches('/'));
        let request = OpenAIChatRequest {
            model: settings.model.clone(),
            messages,
            temperature: settings.temperature,
            response_format: settings.json_mode.then(|| ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        };

        let mut req_builder = self
            .client
            .post(&url)
            .json(&request)
            .timeout(settings.request_timeout);
        if let Some(api_key) = settings.api_key.get_key().await? {
            req_builder = req_builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Other("Request timed out".to_string())
            } else {
                EngineError::Other(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_api_error(status.as_u16(), body));
        }

        let parsed: OpenAIChatResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Other(format!("Failed to parse API response: {}", e)))?;
        let usage = parsed.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(EngineError::EmptyResponse)?;
        Ok((interpret_choice(choice)?, usage))
    }

    fn record_usage(&self, conversation_id: &str, usage: &TokenUsage) {
        self.usage
            .lock()
            .unwrap()
            .entry(conversation_id.to_string())
            .or_default()
            .add(usage);
    }
}

fn classify_api_error(status: u16, body: String) -> EngineError {
    if status == 400 && (body.contains("content_filter") || body.contains("content_policy")) {
        return EngineError::PromptBlocked(body);
    }
    if status == 429 {
        return EngineError::Other("Rate limited".to_string());
    }
    EngineError::Other(format!("API error {}: {}", status, body))
}

fn interpret_choice(choice: OpenAIChoice) -> Result<String, EngineError> {
    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(EngineError::ContentBlocked(
            "finish_reason=content_filter".to_string(),
        ));
    }
    match choice.message.content {
        Some(content) if !content.trim().is_empty() => Ok(content),
        _ => Err(EngineError::EmptyResponse),
    }
}

struct OpenAIConversation {
    inner: Arc<EngineInner>,
    id: String,
    system_prompt: Option<String>,
    turns: Vec<ChatMessage>,
    history: Arc<dyn HistoryManager>,
    usage: TokenUsage,
}

#[async_trait]
impl Conversation for OpenAIConversation {
    async fn request(&mut self, message: ChatMessage) -> Result<ChatMessage, EngineError> {
        let mut messages = Vec::with_capacity(self.turns.len() + 2);
        if let Some(prompt) = &self.system_prompt {
            messages.push(OpenAIMessage {
                role: MessageRole::System.as_str().to_string(),
                content: prompt.clone(),
            });
        }
        messages.extend(self.turns.iter().map(OpenAIMessage::from));
        messages.push(OpenAIMessage::from(&message));

        let (content, usage) = self.inner.complete(messages).await?;
        if let Some(usage) = usage {
            self.usage.add(&usage);
            self.inner.record_usage(&self.id, &usage);
        }

        let reply = ChatMessage::assistant(&self.id, uuid::Uuid::new_v4().to_string(), content);
        self.history.add(&[message.clone(), reply.clone()]);
        self.turns.push(message);
        self.turns.push(reply.clone());
        Ok(reply)
    }

    fn usage(&self) -> TokenUsage {
        self.usage
    }
}

// OpenAI API types

#[derive(Debug, Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

impl From<&ChatMessage> for OpenAIMessage {
    fn from(msg: &ChatMessage) -> Self {
        OpenAIMessage {
            role: msg.role.as_str().to_string(),
            content: msg.content.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}
