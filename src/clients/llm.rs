//! Completion capability against an OpenAI-compatible chat endpoint.
//!
//! One operation: render a prompt (plus optional system prompt) into a chat
//! completion and return the text with token usage. Retries transient
//! failures with full-jitter backoff; deterministic (temperature = 0) calls
//! are served from an in-run cache so repeat runs are stable.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::models::TokenUsage;
use crate::util::retry::{BackoffPolicy, transient_http_error, transient_status};
use crate::util::text::truncate_error_message;

use super::token_counter::TokenCounter;

/// Connection and default-parameter configuration for the completion client.
#[derive(Debug, Clone)]
pub(crate) struct LlmConfig {
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    pub(crate) model: String,
    pub(crate) temperature: f64,
    pub(crate) max_tokens: u32,
    pub(crate) request_timeout: Duration,
    pub(crate) retry: BackoffPolicy,
    pub(crate) cache_enabled: bool,
}

/// A single completion request. `None` fields fall back to the client
/// defaults.
#[derive(Debug, Clone, Default)]
pub(crate) struct CompletionRequest {
    pub(crate) prompt: String,
    pub(crate) system: Option<String>,
    pub(crate) model: Option<String>,
    pub(crate) temperature: Option<f64>,
    pub(crate) max_tokens: Option<u32>,
}

#[derive(Debug, Error)]
enum CompletionError {
    #[error("completion request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("completion endpoint returned error status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("completion response missing message content")]
    EmptyResponse,
}

impl CompletionError {
    fn is_retryable(&self) -> bool {
        match self {
            CompletionError::Transport(e) => transient_http_error(e),
            CompletionError::Status { status, .. } => transient_status(*status),
            CompletionError::EmptyResponse => false,
        }
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
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

pub(crate) struct LlmClient {
    client: Client,
    base_url: Url,
    config: LlmConfig,
    token_counter: TokenCounter,
    // temperature=0 の呼び出しのみキャッシュする（実行中のみ有効）
    cache: Mutex<HashMap<u64, (String, TokenUsage)>>,
}

impl LlmClient {
    pub(crate) fn new(config: LlmConfig, token_counter: TokenCounter) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build completion http client")?;

        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).context("invalid completion base URL")?;

        Ok(Self {
            client,
            base_url,
            config,
            token_counter,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn token_counter(&self) -> &TokenCounter {
        &self.token_counter
    }

    pub(crate) fn default_model(&self) -> &str {
        &self.config.model
    }

    /// Probe the endpoint. Used by the readiness handler.
    pub(crate) async fn health_check(&self) -> Result<()> {
        let url = self
            .base_url
            .join("models")
            .context("failed to build models URL")?;
        let mut request = self.client.get(url);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        request
            .send()
            .await
            .context("completion endpoint health request failed")?
            .error_for_status()
            .context("completion endpoint returned error status")?;
        Ok(())
    }

    /// Run a completion with retries and optional deterministic caching.
    pub(crate) async fn complete(&self, request: &CompletionRequest) -> Result<(String, TokenUsage)> {
        let model = request.model.as_deref().unwrap_or(&self.config.model);
        let temperature = request.temperature.unwrap_or(self.config.temperature);
        let max_tokens = request.max_tokens.unwrap_or(self.config.max_tokens);

        let cache_key = self.cache_key(request, model, temperature, max_tokens);
        if let Some(key) = cache_key {
            if let Some((text, usage)) = self.cache.lock().expect("llm cache lock").get(&key) {
                debug!(model, "completion cache hit");
                return Ok((text.clone(), *usage));
            }
        }

        let mut failures = 0usize;
        let result = loop {
            match self
                .try_complete(request, model, temperature, max_tokens)
                .await
            {
                Ok(ok) => break ok,
                Err(error) if error.is_retryable() => {
                    failures += 1;
                    let Some(delay) = self.config.retry.next_delay(failures) else {
                        return Err(anyhow!(error));
                    };
                    warn!(
                        model,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "completion failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(anyhow!(error)),
            }
        };

        if let Some(key) = cache_key {
            self.cache
                .lock()
                .expect("llm cache lock")
                .insert(key, result.clone());
        }

        Ok(result)
    }

    fn cache_key(
        &self,
        request: &CompletionRequest,
        model: &str,
        temperature: f64,
        max_tokens: u32,
    ) -> Option<u64> {
        if !self.config.cache_enabled || temperature != 0.0 {
            return None;
        }
        let canonical = format!(
            "{model}\u{1}{}\u{1}{}\u{1}{max_tokens}",
            request.system.as_deref().unwrap_or(""),
            request.prompt,
        );
        Some(xxh3_64(canonical.as_bytes()))
    }

    async fn try_complete(
        &self,
        request: &CompletionRequest,
        model: &str,
        temperature: f64,
        max_tokens: u32,
    ) -> Result<(String, TokenUsage), CompletionError> {
        let url = self
            .base_url
            .join("chat/completions")
            .expect("chat completions path");

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = ChatRequest {
            model,
            messages,
            temperature,
            max_tokens,
        };

        let mut http = self.client.post(url).json(&body);
        if let Some(key) = &self.config.api_key {
            http = http.bearer_auth(key);
        }

        let response = http.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Status {
                status,
                body: truncate_error_message(&body),
            });
        }

        let parsed: ChatResponse = response.json().await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(CompletionError::EmptyResponse)?;

        let usage = match parsed.usage {
            Some(wire) => TokenUsage {
                prompt_tokens: wire.prompt_tokens,
                completion_tokens: wire.completion_tokens,
                total_tokens: wire.total_tokens,
            },
            None => {
                // Estimate when the provider omits usage (message overhead
                // included, matching the chat wire format).
                let prompt_tokens = (self.token_counter.count(&request.prompt)
                    + request
                        .system
                        .as_deref()
                        .map_or(0, |s| self.token_counter.count(s))
                    + 6) as u64;
                let completion_tokens = self.token_counter.count(&text) as u64;
                TokenUsage::new(prompt_tokens, completion_tokens)
            }
        };

        Ok((text, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String) -> LlmConfig {
        LlmConfig {
            base_url,
            api_key: None,
            model: "test-model".to_string(),
            temperature: 0.7,
            max_tokens: 512,
            request_timeout: Duration::from_secs(5),
            retry: BackoffPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
            cache_enabled: true,
        }
    }

    fn completion_body(content: &str) -> serde_json::Value {
        json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 7, "total_tokens": 19}
        })
    }

    #[tokio::test]
    async fn complete_parses_text_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("hello")))
            .mount(&server)
            .await;

        let client =
            LlmClient::new(test_config(server.uri()), TokenCounter::dummy()).expect("client");
        let (text, usage) = client
            .complete(&CompletionRequest {
                prompt: "say hello".to_string(),
                ..CompletionRequest::default()
            })
            .await
            .expect("completion succeeds");

        assert_eq!(text, "hello");
        assert_eq!(usage.total_tokens, 19);
    }

    #[tokio::test]
    async fn complete_retries_transient_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("recovered")))
            .mount(&server)
            .await;

        let client =
            LlmClient::new(test_config(server.uri()), TokenCounter::dummy()).expect("client");
        let (text, _) = client
            .complete(&CompletionRequest {
                prompt: "retry me".to_string(),
                ..CompletionRequest::default()
            })
            .await
            .expect("retry should recover");

        assert_eq!(text, "recovered");
    }

    #[tokio::test]
    async fn complete_does_not_retry_client_errors() {
        let server = MockServer::start().await;
        let huge_body = "x".repeat(10_000);
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string(huge_body))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            LlmClient::new(test_config(server.uri()), TokenCounter::dummy()).expect("client");
        let error = client
            .complete(&CompletionRequest {
                prompt: "bad request".to_string(),
                ..CompletionRequest::default()
            })
            .await
            .expect_err("400 must not be retried");

        let message = error.to_string();
        assert!(message.contains("400"));
        assert!(message.len() < 1000, "error body must be truncated");
        assert!(message.contains("truncated"));
    }

    #[tokio::test]
    async fn deterministic_calls_hit_the_cache() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("cached")))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            LlmClient::new(test_config(server.uri()), TokenCounter::dummy()).expect("client");
        let request = CompletionRequest {
            prompt: "deterministic".to_string(),
            temperature: Some(0.0),
            ..CompletionRequest::default()
        };

        let (first, usage_first) = client.complete(&request).await.expect("first call");
        let (second, usage_second) = client.complete(&request).await.expect("second call");

        assert_eq!(first, "cached");
        assert_eq!(first, second);
        assert_eq!(usage_first, usage_second);
    }

    #[tokio::test]
    async fn non_deterministic_calls_bypass_the_cache() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("fresh")))
            .expect(2)
            .mount(&server)
            .await;

        let client =
            LlmClient::new(test_config(server.uri()), TokenCounter::dummy()).expect("client");
        let request = CompletionRequest {
            prompt: "sampled".to_string(),
            temperature: Some(0.7),
            ..CompletionRequest::default()
        };

        client.complete(&request).await.expect("first call");
        client.complete(&request).await.expect("second call");
    }

    #[tokio::test]
    async fn usage_is_estimated_when_provider_omits_it() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "abcdefgh"}}]
            })))
            .mount(&server)
            .await;

        let client =
            LlmClient::new(test_config(server.uri()), TokenCounter::dummy()).expect("client");
        let (_, usage) = client
            .complete(&CompletionRequest {
                prompt: "estimate this prompt".to_string(),
                ..CompletionRequest::default()
            })
            .await
            .expect("completion succeeds");

        assert!(usage.prompt_tokens > 0);
        assert_eq!(usage.completion_tokens, 2); // 8 chars -> 2 tokens
        assert_eq!(
            usage.total_tokens,
            usage.prompt_tokens + usage.completion_tokens
        );
    }
}
