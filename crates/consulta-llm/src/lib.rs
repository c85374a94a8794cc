//! OpenAI-compatible chat-completion client.
//!
//! Implements [`Generator`] over a blocking HTTP agent. The default endpoint
//! is Groq's OpenAI-compatible API, but any provider speaking the same
//! `/chat/completions` contract works by overriding the base URL.

use std::time::Duration;

use anyhow::{Context, Result};
use consulta_core::{GenerationError, GenerationParams, Generator};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

impl LlmConfig {
    #[must_use]
    pub fn new(api_key: String) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Load provider settings from the environment. `GROQ_API_KEY` is
    /// required; `GROQ_BASE_URL`, `GROQ_MODEL`, and `GROQ_TIMEOUT_SECS`
    /// override the defaults.
    ///
    /// # Errors
    /// Returns an error when the API key is missing or an override is malformed.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GROQ_API_KEY")
            .context("GROQ_API_KEY is not set; the generation provider needs an API key")?;
        let mut config = Self::new(api_key);

        if let Ok(base_url) = std::env::var("GROQ_BASE_URL") {
            config.base_url = base_url;
        }
        if let Ok(model) = std::env::var("GROQ_MODEL") {
            config.model = model;
        }
        if let Ok(raw) = std::env::var("GROQ_TIMEOUT_SECS") {
            let secs: u64 = raw
                .parse()
                .with_context(|| format!("GROQ_TIMEOUT_SECS is not a number: {raw}"))?;
            config.timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

pub struct HttpCompletionClient {
    agent: ureq::Agent,
    config: LlmConfig,
}

impl HttpCompletionClient {
    #[must_use]
    pub fn new(config: LlmConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(config.timeout)
            .build();
        Self { agent, config }
    }
}

impl Generator for HttpCompletionClient {
    fn complete(&self, prompt: &str, params: &GenerationParams) -> Result<String, GenerationError> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage { role: "user", content: prompt }],
            max_tokens: params.max_tokens,
            temperature: params.temperature,
        };
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let response = self
            .agent
            .post(&url)
            .set("Authorization", &format!("Bearer {}", self.config.api_key))
            .send_json(&body)
            .map_err(classify_request_error)?;

        let parsed: ChatResponse = response
            .into_json()
            .map_err(|err| GenerationError::Provider(format!("malformed provider response: {err}")))?;

        extract_content(parsed)
    }
}

fn classify_request_error(err: ureq::Error) -> GenerationError {
    match err {
        ureq::Error::Status(code, response) => {
            let detail = response.into_string().unwrap_or_default();
            GenerationError::Provider(format!("provider returned status {code}: {detail}"))
        }
        ureq::Error::Transport(transport) => classify_transport_message(&transport.to_string()),
    }
}

// ureq surfaces socket timeouts as transport errors with io-level messages;
// string matching is the only stable way to tell them apart.
fn classify_transport_message(message: &str) -> GenerationError {
    let lowered = message.to_lowercase();
    if lowered.contains("timed out") || lowered.contains("timeout") {
        GenerationError::Timeout
    } else {
        GenerationError::Provider(format!("transport error: {message}"))
    }
}

fn extract_content(response: ChatResponse) -> Result<String, GenerationError> {
    response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content)
        .ok_or_else(|| GenerationError::Provider("provider response contained no choices".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_matches_the_chat_completions_contract() -> Result<()> {
        let body = ChatRequest {
            model: DEFAULT_MODEL,
            messages: vec![ChatMessage { role: "user", content: "hola" }],
            max_tokens: 1200,
            temperature: 0.2,
        };
        let json = serde_json::to_value(&body)?;

        assert_eq!(json["model"], DEFAULT_MODEL);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "hola");
        assert_eq!(json["max_tokens"], 1200);
        Ok(())
    }

    #[test]
    fn timeout_transport_messages_map_to_timeout() {
        assert_eq!(
            classify_transport_message("Network Error: connection timed out"),
            GenerationError::Timeout
        );
        assert!(matches!(
            classify_transport_message("dns resolution failed"),
            GenerationError::Provider(_)
        ));
    }

    #[test]
    fn provider_responses_without_choices_are_errors() {
        let empty = ChatResponse { choices: vec![] };
        assert!(matches!(extract_content(empty), Err(GenerationError::Provider(_))));

        let full = ChatResponse {
            choices: vec![ChatChoice {
                message: ChatChoiceMessage { content: "Los plazos son...".to_string() },
            }],
        };
        assert_eq!(extract_content(full), Ok("Los plazos son...".to_string()));
    }
}
