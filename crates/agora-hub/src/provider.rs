use crate::{
    persistence::MessageLog,
    prompt::{build_messages, clean_reply, PromptMessage},
};
use agora_core::roster::{AgentDescriptor, Roster};
use async_trait::async_trait;
use reqwest::header;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("history unavailable: {0}")]
    History(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("api error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("parse error: {0}")]
    Parse(String),
}

/// Produces an agent's next line. `Ok(None)` means the agent stays quiet this
/// round.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    async fn produce(&self, agent: &AgentDescriptor) -> Result<Option<String>, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ProviderSettings {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(60),
            temperature: 0.8,
            max_tokens: 200,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat-completions client that speaks for roster personas
/// using recent room history as context.
pub struct ChatCompletionProvider {
    http: reqwest::Client,
    settings: ProviderSettings,
    roster: Arc<Roster>,
    log: Arc<dyn MessageLog>,
}

impl ChatCompletionProvider {
    pub fn new(
        settings: ProviderSettings,
        roster: Arc<Roster>,
        log: Arc<dyn MessageLog>,
    ) -> Result<Self, ProviderError> {
        if settings.api_key.trim().is_empty() {
            return Err(ProviderError::Config("api key not set".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|err| ProviderError::Config(err.to_string()))?;
        Ok(Self {
            http,
            settings,
            roster,
            log,
        })
    }
}

#[async_trait]
impl ContentProvider for ChatCompletionProvider {
    async fn produce(&self, agent: &AgentDescriptor) -> Result<Option<String>, ProviderError> {
        let history = self
            .log
            .recent(agent.context_message_count)
            .await
            .map_err(|err| ProviderError::History(err.to_string()))?;
        let messages = build_messages(agent, &self.roster, &history);
        let request = ChatCompletionRequest {
            model: &agent.model,
            messages: &messages,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        };

        info!(
            event = "provider_request",
            agent_id = %agent.agent_id,
            model = %agent.model,
            history = history.len()
        );
        let response = self
            .http
            .post(&self.settings.base_url)
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.settings.api_key),
            )
            .json(&request)
            .send()
            .await
            .map_err(|err| ProviderError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Parse(err.to_string()))?;
        let reply = parse_reply(parsed)?;
        let cleaned = reply.as_deref().and_then(|text| clean_reply(agent, text));
        debug!(
            event = "provider_reply",
            agent_id = %agent.agent_id,
            empty = cleaned.is_none()
        );
        Ok(cleaned)
    }
}

fn parse_reply(response: ChatCompletionResponse) -> Result<Option<String>, ProviderError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Parse("response has no choices".to_string()))?;
    Ok(choice.message.content)
}
