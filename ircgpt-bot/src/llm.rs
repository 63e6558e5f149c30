//! Chat-completions API client.
//!
//! One request per call: a system message and a user message in, the first
//! choice's text out. Failures come back typed so callers can tell a dead
//! network from a confused upstream; nothing here retries.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum CompletionError {
    /// Network failure or timeout.
    #[error("completion request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("completion API returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("unparsable completion response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("completion response had no choices")]
    NoChoices,
    #[error("completion response came from role {0:?}, not the assistant")]
    UnexpectedRole(String),
}

impl CompletionError {
    /// Whether the failure is worth another attempt later. Nothing retries
    /// today; this just keeps the distinction in the logs.
    pub fn is_transient(&self) -> bool {
        match self {
            CompletionError::Transport(_) => true,
            CompletionError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

/// A message in a chat request or response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// `null` (e.g. a refusal or tool call) reads as empty.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
}

fn null_as_empty<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(d)?.unwrap_or_default())
}

impl ChatMessage {
    pub fn system(content: &str) -> Self {
        Self { role: "system".to_string(), content: content.to_string() }
    }

    pub fn user(content: &str) -> Self {
        Self { role: "user".to_string(), content: content.to_string() }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

/// Response body. Only the fields the bot reads are kept.
#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Remove Markdown code fences the model sometimes wraps JSON in.
pub fn strip_code_fences(raw: &str) -> String {
    raw.replace("```json", "").replace("```", "")
}

/// Pull the assistant's text out of a raw response body.
pub fn parse_response(body: &str) -> Result<String, CompletionError> {
    let cleaned = strip_code_fences(body);
    let response: ChatResponse = serde_json::from_str(&cleaned)?;
    if let Some(ref usage) = response.usage {
        tracing::debug!(
            model = response.model.as_deref().unwrap_or("?"),
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            total_tokens = usage.total_tokens,
            "Completion usage"
        );
    }
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or(CompletionError::NoChoices)?;
    if choice.message.role != "assistant" {
        return Err(CompletionError::UnexpectedRole(choice.message.role));
    }
    if let Some(reason) = choice.finish_reason.as_deref()
        && reason != "stop"
    {
        tracing::debug!(finish_reason = reason, "Completion did not stop cleanly");
    }
    Ok(choice.message.content)
}

/// Chat-completions client.
pub struct CompletionClient {
    api_key: String,
    organization: String,
    endpoint: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    http: reqwest::Client,
}

impl CompletionClient {
    pub fn new(api_key: String, endpoint: String, timeout: Duration) -> Result<Self, CompletionError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            api_key,
            organization: String::new(),
            endpoint,
            temperature: None,
            max_tokens: None,
            http,
        })
    }

    /// Build a client from the bot configuration.
    pub fn from_config(config: &Config) -> Result<Self, CompletionError> {
        Ok(Self::new(
            config.api_key.clone(),
            config.api_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )?
        .with_organization(&config.organization)
        .with_sampling(config.temperature, config.max_tokens))
    }

    pub fn with_organization(mut self, organization: &str) -> Self {
        self.organization = organization.to_string();
        self
    }

    pub fn with_sampling(mut self, temperature: Option<f32>, max_tokens: Option<u32>) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// Send one system + user exchange and return the assistant's text.
    pub async fn complete(
        &self,
        system_prompt: &str,
        user_input: &str,
        model: &str,
    ) -> Result<String, CompletionError> {
        let request = ChatRequest {
            model,
            messages: [ChatMessage::system(system_prompt), ChatMessage::user(user_input)],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let mut builder = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request);
        if !self.organization.is_empty() {
            builder = builder.header("OpenAI-Organization", &self.organization);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(CompletionError::Status { status, body });
        }

        let body = resp.text().await?;
        tracing::debug!(model, body = %body, "Completion response");
        parse_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(role: &str, content: &str) -> String {
        serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": { "role": role, "content": content },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 3, "total_tokens": 13 }
        })
        .to_string()
    }

    #[test]
    fn extracts_first_choice() {
        assert_eq!(parse_response(&body("assistant", "hi there")).unwrap(), "hi there");
    }

    #[test]
    fn rejects_non_assistant_role() {
        let err = parse_response(&body("user", "hi")).unwrap_err();
        assert!(matches!(err, CompletionError::UnexpectedRole(ref r) if r == "user"));
    }

    #[test]
    fn rejects_empty_choices() {
        let err = parse_response(r#"{"choices": []}"#).unwrap_err();
        assert!(matches!(err, CompletionError::NoChoices));
        let err = parse_response(r#"{}"#).unwrap_err();
        assert!(matches!(err, CompletionError::NoChoices));
    }

    #[test]
    fn fenced_body_is_unwrapped() {
        let fenced = format!("```json\n{}\n```", body("assistant", "ok"));
        assert_eq!(parse_response(&fenced).unwrap(), "ok");
    }

    #[test]
    fn fences_inside_content_are_dropped() {
        let raw = body("assistant", "```json\n{\"shouldRespond\": true}\n```");
        let text = parse_response(&raw).unwrap();
        assert_eq!(text.trim(), "{\"shouldRespond\": true}");
    }

    #[test]
    fn null_content_and_partial_usage_still_parse() {
        let raw = r#"{
            "choices": [{ "message": { "role": "assistant", "content": null } }],
            "usage": { "total_tokens": 7 }
        }"#;
        assert_eq!(parse_response(raw).unwrap(), "");
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(parse_response("<html>"), Err(CompletionError::Malformed(_))));
    }

    #[test]
    fn request_serializes_optional_sampling_only_when_set() {
        let req = ChatRequest {
            model: "m",
            messages: [ChatMessage::system("s"), ChatMessage::user("u")],
            temperature: None,
            max_tokens: None,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["messages"][0]["role"], "system");
        assert_eq!(v["messages"][1]["content"], "u");
        assert!(v.get("temperature").is_none());

        let req = ChatRequest { temperature: Some(0.5), max_tokens: Some(100), ..req };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["max_tokens"], 100);
    }

    #[test]
    fn status_errors_classify_transience() {
        let e = CompletionError::Status { status: StatusCode::INTERNAL_SERVER_ERROR, body: String::new() };
        assert!(e.is_transient());
        let e = CompletionError::Status { status: StatusCode::UNAUTHORIZED, body: String::new() };
        assert!(!e.is_transient());
        assert!(!CompletionError::NoChoices.is_transient());
    }
}
