use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{resolve_credential, LlmConfig};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anything that turns a prompt into text.
pub trait LlmBackend: Send + Sync {
    /// Default model name, recorded alongside stored results.
    fn model(&self) -> &str;

    /// Complete `prompt`. `model` overrides the default when set.
    fn complete(&self, system: Option<&str>, prompt: &str, model: Option<&str>) -> Result<String>;
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited by LLM API")]
    RateLimited { retry_after: Option<Duration> },

    #[error("LLM API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Backoff for rate-limit responses. Other errors are never retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after.unwrap_or_else(|| self.base_delay * 2u32.saturating_pow(attempt))
    }
}

/// Run `call`, sleeping and retrying while it reports `RateLimited`.
pub fn with_rate_limit_retry<T>(
    policy: &RetryPolicy,
    mut sleep: impl FnMut(Duration),
    mut call: impl FnMut() -> Result<T, LlmError>,
) -> Result<T, LlmError> {
    let mut attempt = 0;
    loop {
        match call() {
            Err(LlmError::RateLimited { retry_after }) if attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt, retry_after);
                warn!(
                    attempt = attempt + 1,
                    delay_secs = delay.as_secs(),
                    "rate limited, backing off"
                );
                sleep(delay);
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

/// Anthropic Messages API client.
pub struct AnthropicClient {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    retry: RetryPolicy,
}

impl AnthropicClient {
    pub fn new(cfg: &LlmConfig, api_key: String) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            retry: RetryPolicy {
                max_retries: cfg.max_retries,
                base_delay: Duration::from_secs(cfg.retry_base_secs),
            },
        })
    }

    /// Build a client, resolving the key via flag > ANTHROPIC_API_KEY > config.
    pub fn from_config(cfg: &LlmConfig, api_key_flag: Option<&str>) -> Result<Self> {
        let key = resolve_credential(
            api_key_flag,
            "ANTHROPIC_API_KEY",
            cfg.api_key.as_deref(),
            cfg.api_key_command.as_deref(),
        )
        .context("LLM API key not configured")?;
        Self::new(cfg, key)
    }

    fn send(&self, system: Option<&str>, prompt: &str, model: &str) -> Result<String, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = MessagesRequest {
            model,
            max_tokens: self.max_tokens,
            system,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        info!(model, prompt_length = prompt.len(), "sending LLM request");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .context("Failed to send request to LLM API")?;

        let status = resp.status();
        // 529 is Anthropic's "overloaded"; treat like a rate limit.
        if status.as_u16() == 429 || status.as_u16() == 529 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(LlmError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let text = resp.text().unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&text)
                .ok()
                .and_then(|e| e.error)
                .and_then(|e| e.message)
                .unwrap_or(text);
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: MessagesResponse = resp.json().context("Failed to parse LLM response")?;
        if let Some(usage) = &parsed.usage {
            info!(
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "LLM response received"
            );
        }

        let text: String = parsed
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        Ok(text)
    }
}

impl LlmBackend for AnthropicClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn complete(&self, system: Option<&str>, prompt: &str, model: Option<&str>) -> Result<String> {
        let model = model.unwrap_or(&self.model);
        let text = with_rate_limit_retry(&self.retry, std::thread::sleep, || {
            self.send(system, prompt, model)
        })?;
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_secs(2),
        }
    }

    #[test]
    fn retries_rate_limits_with_backoff() {
        let mut calls = 0;
        let mut slept = Vec::new();
        let out = with_rate_limit_retry(
            &policy(2),
            |d| slept.push(d),
            || {
                calls += 1;
                if calls < 3 {
                    Err(LlmError::RateLimited { retry_after: None })
                } else {
                    Ok("done")
                }
            },
        )
        .unwrap();
        assert_eq!(out, "done");
        assert_eq!(slept, vec![Duration::from_secs(2), Duration::from_secs(4)]);
    }

    #[test]
    fn honors_retry_after_and_gives_up() {
        let mut slept = Vec::new();
        let err = with_rate_limit_retry::<()>(
            &policy(1),
            |d| slept.push(d),
            || {
                Err(LlmError::RateLimited {
                    retry_after: Some(Duration::from_secs(30)),
                })
            },
        )
        .unwrap_err();
        assert!(matches!(err, LlmError::RateLimited { .. }));
        assert_eq!(slept, vec![Duration::from_secs(30)]);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let mut calls = 0;
        let err = with_rate_limit_retry::<()>(
            &policy(3),
            |_| {},
            || {
                calls += 1;
                Err(LlmError::Api {
                    status: 400,
                    message: "bad".into(),
                })
            },
        )
        .unwrap_err();
        assert!(matches!(err, LlmError::Api { status: 400, .. }));
        assert_eq!(calls, 1);
    }
}
