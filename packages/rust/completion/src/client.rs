//! HTTP client for OpenAI-compatible chat completion APIs (OpenRouter by default).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use knowtree_shared::{CompletionConfig, KnowTreeError, Result};

use crate::{CompletionRequest, CompletionService};

/// User-Agent string for completion requests.
const USER_AGENT: &str = concat!("KnowTree/", env!("CARGO_PKG_VERSION"));

/// Longest error body echoed back in an error message.
const MAX_ERROR_BODY: usize = 500;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatPayload<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// OpenRouterClient
// ---------------------------------------------------------------------------

/// [`CompletionService`] backed by `POST {base_url}/chat/completions`.
pub struct OpenRouterClient {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl OpenRouterClient {
    /// Build a client from the `[completion]` config and an API key.
    pub fn new(config: &CompletionConfig, api_key: impl Into<String>) -> Result<Self> {
        let base = config.base_url.trim_end_matches('/');
        let endpoint = Url::parse(&format!("{base}/chat/completions")).map_err(|e| {
            KnowTreeError::config(format!("invalid completion base_url {base:?}: {e}"))
        })?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| KnowTreeError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            api_key: api_key.into(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl CompletionService for OpenRouterClient {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(
        skip_all,
        fields(
            task = %request.task,
            subject = request.subject.as_deref().unwrap_or(""),
            model = %self.model
        )
    )]
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let payload = ChatPayload {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            max_tokens: request.max_tokens.unwrap_or(self.max_tokens),
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    KnowTreeError::Transport(format!("request timed out: {e}"))
                } else {
                    KnowTreeError::Transport(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(MAX_ERROR_BODY)
                .collect();
            let reason = match status.as_u16() {
                401 | 403 => "authentication rejected",
                429 => "rate limited",
                _ => "request rejected",
            };
            return Err(KnowTreeError::Transport(format!(
                "{reason} (HTTP {status}): {body}"
            )));
        }

        let data: ChatResponse = response
            .json()
            .await
            .map_err(|e| KnowTreeError::Transport(format!("malformed response body: {e}")))?;

        let content = data
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| KnowTreeError::Transport("response contained no content".into()))?;

        debug!(chars = content.len(), "completion received");
        Ok(content)
    }
}
