// SPDX-License-Identifier: MIT OR Apache-2.0

//! Chat completion backends

use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use peerchat_core::ChatMessage;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const API_KEY_VAR: &str = "OPENAI_API_KEY";

/// Produces the assistant's reply to a conversation
pub trait CompletionBackend: Send + Sync {
    fn complete<'a>(&'a self, messages: &'a [ChatMessage]) -> BoxFuture<'a, Result<String>>;
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct ReplyMessage {
    content: String,
}

/// OpenAI-compatible `/chat/completions` endpoint
pub struct OpenAiBackend {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
}

impl OpenAiBackend {
    pub fn new(api_base: &str, model: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: format!("{}/chat/completions", api_base.trim_end_matches('/')),
            model: model.into(),
            api_key: api_key.into(),
        })
    }

    /// Read the API key from `OPENAI_API_KEY`
    pub fn from_env(api_base: &str, model: impl Into<String>) -> Result<Self> {
        let api_key = std::env::var(API_KEY_VAR)
            .with_context(|| format!("Please set the {API_KEY_VAR} environment variable"))?;
        Self::new(api_base, model, api_key)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = CompletionRequest {
            model: &self.model,
            messages,
        };
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Completion request failed")?
            .error_for_status()
            .context("Completion endpoint returned an error")?;

        let reply: CompletionResponse = response
            .json()
            .await
            .context("Malformed completion response")?;
        extract_reply(reply)
    }
}

impl CompletionBackend for OpenAiBackend {
    fn complete<'a>(&'a self, messages: &'a [ChatMessage]) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.request(messages))
    }
}

fn extract_reply(response: CompletionResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content.trim().to_string())
        .ok_or_else(|| anyhow!("Completion response has no choices"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerchat_core::Role;

    #[test]
    fn test_request_body_shape() {
        let messages = vec![
            ChatMessage {
                role: Role::System,
                content: "You are a helpful assistant.".into(),
            },
            ChatMessage {
                role: Role::User,
                content: "hi".into(),
            },
        ];
        let body = serde_json::to_value(CompletionRequest {
            model: DEFAULT_MODEL,
            messages: &messages,
        })
        .unwrap();

        assert_eq!(
            body,
            serde_json::json!({
                "model": "gpt-3.5-turbo",
                "messages": [
                    {"role": "system", "content": "You are a helpful assistant."},
                    {"role": "user", "content": "hi"},
                ]
            })
        );
    }

    #[test]
    fn test_reply_is_first_choice_trimmed() {
        let response: CompletionResponse = serde_json::from_str(
            r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"  hello there \n"}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_reply(response).unwrap(), "hello there");

        let empty: CompletionResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(extract_reply(empty).is_err());
    }

    #[test]
    fn test_url_joins_api_base() {
        let backend = OpenAiBackend::new("http://localhost:8080/v1/", "m", "k").unwrap();
        assert_eq!(backend.url(), "http://localhost:8080/v1/chat/completions");
    }
}
