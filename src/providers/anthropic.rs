/// Conversational primary (Anthropic-class API). Exposes two model tiers
/// selected per call, plus a streaming variant that surfaces text chunks
/// in emission order and finalizes with total usage.
use crate::providers::base::{
    ChatOutcome, ChatPrompt, ChatProvider, ErrorCode, ModelTier, ProviderError, ProviderResult,
    StreamCallback, TurnRole, check_json_response, classify_status, classify_transport,
};
use crate::providers::sse::parse_events;
use crate::providers::vendor_http_client;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

const PROVIDER: &str = "claude";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const MODEL_SIMPLE: &str = "claude-haiku-4-5";
const MODEL_COMPLEX: &str = "claude-sonnet-4-5";
pub const SIMPLE_TIMEOUT_SECS: u64 = 15;
pub const COMPLEX_TIMEOUT_SECS: u64 = 30;

pub struct AnthropicGateway {
    api_key: String,
    base_url: String,
    client: Client,
    simple_timeout: Duration,
    complex_timeout: Duration,
}

impl AnthropicGateway {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        let complex_timeout = Duration::from_secs(COMPLEX_TIMEOUT_SECS);
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: vendor_http_client(complex_timeout),
            simple_timeout: Duration::from_secs(SIMPLE_TIMEOUT_SECS),
            complex_timeout,
        }
    }

    /// Override the per-tier call timeouts (config-driven).
    pub fn with_timeouts(mut self, simple: Duration, complex: Duration) -> Self {
        self.simple_timeout = simple;
        self.complex_timeout = complex;
        self.client = vendor_http_client(complex);
        self
    }

    pub fn model_for(tier: ModelTier) -> &'static str {
        match tier {
            ModelTier::Simple => MODEL_SIMPLE,
            ModelTier::Complex => MODEL_COMPLEX,
        }
    }

    fn timeout_for(&self, tier: ModelTier) -> Duration {
        match tier {
            ModelTier::Simple => self.simple_timeout,
            ModelTier::Complex => self.complex_timeout,
        }
    }

    fn payload(prompt: &ChatPrompt, stream: bool) -> Value {
        let messages: Vec<Value> = prompt
            .turns
            .iter()
            .map(|turn| {
                let role = match turn.role {
                    TurnRole::User => "user",
                    TurnRole::Assistant => "assistant",
                };
                json!({"role": role, "content": turn.content})
            })
            .collect();

        let mut payload = json!({
            "model": Self::model_for(prompt.tier),
            "messages": messages,
            "max_tokens": prompt.max_tokens,
            "temperature": prompt.temperature,
        });
        if !prompt.system.is_empty() {
            payload["system"] = json!(prompt.system);
        }
        if stream {
            payload["stream"] = json!(true);
        }
        payload
    }

    fn parse_outcome(json: &Value, tier: ModelTier) -> ProviderResult<ChatOutcome> {
        let content: String = json["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if content.is_empty() {
            return Err(ProviderError::new(
                PROVIDER,
                ErrorCode::InvalidResponse,
                "response contained no text content",
            ));
        }

        Ok(ChatOutcome {
            content,
            model: json["model"]
                .as_str()
                .unwrap_or(Self::model_for(tier))
                .to_string(),
            input_tokens: json["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: json["usage"]["output_tokens"].as_u64().unwrap_or(0),
        })
    }
}

#[async_trait]
impl ChatProvider for AnthropicGateway {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn chat(&self, prompt: &ChatPrompt) -> ProviderResult<ChatOutcome> {
        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .timeout(self.timeout_for(prompt.tier))
            .json(&Self::payload(prompt, false))
            .send()
            .await
            .map_err(|e| classify_transport(PROVIDER, &e))?;
        let json = check_json_response(PROVIDER, resp).await?;
        Self::parse_outcome(&json, prompt.tier)
    }

    async fn chat_stream(
        &self,
        prompt: &ChatPrompt,
        on_chunk: StreamCallback,
    ) -> ProviderResult<ChatOutcome> {
        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&Self::payload(prompt, true))
            .send()
            .await
            .map_err(|e| classify_transport(PROVIDER, &e))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(
                PROVIDER,
                status.as_u16(),
                &body,
                retry_after,
            ));
        }

        let chunk_timeout = self.timeout_for(prompt.tier);
        let mut content = String::new();
        let mut model = Self::model_for(prompt.tier).to_string();
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;
        let mut buf = String::new();

        let mut stream = resp.bytes_stream();
        let mut done = false;
        while !done {
            let next = tokio::time::timeout(chunk_timeout, stream.next())
                .await
                .map_err(|_| {
                    ProviderError::new(PROVIDER, ErrorCode::Timeout, "stream stalled mid-response")
                })?;
            // Only complete events (terminated by a blank line) are parsed;
            // the partial tail waits for the next chunk. Stream end flushes
            // whatever remains.
            let ready: String = match next {
                Some(chunk) => {
                    let chunk = chunk.map_err(|e| {
                        ProviderError::new(PROVIDER, ErrorCode::ServiceError, e.to_string())
                    })?;
                    buf.push_str(&String::from_utf8_lossy(&chunk));
                    match buf.rfind("\n\n") {
                        Some(end) => buf.drain(..end + 2).collect(),
                        None => continue,
                    }
                }
                None => {
                    done = true;
                    std::mem::take(&mut buf)
                }
            };

            for event in parse_events(&ready) {
                let Some(data) = event.data else { continue };
                match data["type"].as_str().unwrap_or("") {
                    "message_start" => {
                        if let Some(m) = data["message"]["model"].as_str() {
                            model = m.to_string();
                        }
                        if let Some(t) = data["message"]["usage"]["input_tokens"].as_u64() {
                            input_tokens = t;
                        }
                    }
                    "content_block_delta" => {
                        if let Some(text) = data["delta"]["text"].as_str() {
                            content.push_str(text);
                            on_chunk(text);
                        }
                    }
                    "message_delta" => {
                        if let Some(t) = data["usage"]["output_tokens"].as_u64() {
                            output_tokens = t;
                        }
                    }
                    _ => {}
                }
            }
        }

        if content.is_empty() {
            return Err(ProviderError::new(
                PROVIDER,
                ErrorCode::InvalidResponse,
                "stream ended with no text content",
            ));
        }

        Ok(ChatOutcome {
            content,
            model,
            input_tokens,
            output_tokens,
        })
    }
}
