//! Transport to a locally hosted model server.
//!
//! The envelope only depends on the [`ModelClient`] trait. [`OllamaClient`]
//! is the stock implementation: one blocking POST to the OpenAI-compatible
//! chat endpoint, no retries, failures returned as they happen.

use crate::core::config::ModelConfig;
use crate::core::envelope::ModelRequest;
use crate::core::error::LedgateError;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;

const CHAT_PATH: &str = "/v1/chat/completions";
const MAX_ERROR_BODY: usize = 512;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelClientError {
    #[error("model server unreachable: {0}")]
    Unreachable(String),
    #[error("model call timed out: {0}")]
    Timeout(String),
    #[error("model server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected model response: {0}")]
    Malformed(String),
}

pub trait ModelClient: Send + Sync {
    fn complete(&self, request: &ModelRequest, timeout: Duration)
    -> Result<String, ModelClientError>;

    /// Where requests go, for operator-facing messages.
    fn endpoint(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl OllamaClient {
    pub fn new(config: &ModelConfig) -> Result<Self, LedgateError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| LedgateError::ConfigError(format!("model http client: {}", e)))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

/// Request body for the chat completions endpoint.
pub fn chat_payload(request: &ModelRequest) -> Value {
    let mut payload = json!({
        "model": request.model,
        "stream": false,
        "temperature": request.temperature,
        "messages": [
            { "role": "system", "content": request.system_preamble },
            { "role": "user", "content": request.query },
        ],
    });
    if let Some(max_tokens) = request.max_tokens {
        payload["max_tokens"] = json!(max_tokens);
    }
    payload
}

/// Pull `choices[0].message.content` out of a chat completion body.
pub fn parse_chat_response(body: &str) -> Result<String, ModelClientError> {
    let data: Value =
        serde_json::from_str(body).map_err(|e| ModelClientError::Malformed(e.to_string()))?;
    data["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            ModelClientError::Malformed("missing choices[0].message.content".to_string())
        })
}

fn classify(e: reqwest::Error) -> ModelClientError {
    if e.is_timeout() {
        ModelClientError::Timeout(e.to_string())
    } else if e.is_decode() {
        ModelClientError::Malformed(e.to_string())
    } else {
        ModelClientError::Unreachable(e.to_string())
    }
}

impl ModelClient for OllamaClient {
    fn complete(
        &self,
        request: &ModelRequest,
        timeout: Duration,
    ) -> Result<String, ModelClientError> {
        let url = format!("{}{}", self.base_url, CHAT_PATH);
        tracing::debug!(url = %url, model = %request.model, "model request");

        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(&chat_payload(request))
            .send()
            .map_err(classify)?;
        let status = response.status();
        let body = response.text().map_err(classify)?;
        if !status.is_success() {
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(ModelClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        parse_chat_response(&body)
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, CHAT_PATH)
    }
}
