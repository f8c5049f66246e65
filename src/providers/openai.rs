/// Conversational fallback and embeddings (OpenAI-class API).
///
/// The chat gateway is the last link of both chat chains; the embedding
/// gateway stands alone because embedding dimensions differ across
/// vendors, so no cross-vendor fallback is viable.
use crate::providers::base::{
    ChatOutcome, ChatPrompt, ChatProvider, EMBEDDING_DIM, EmbedProvider, EmbeddingOutcome,
    ErrorCode, ProviderError, ProviderResult, StreamCallback, TurnRole, check_json_response,
    classify_status, classify_transport,
};
use crate::providers::sse::parse_events;
use crate::providers::vendor_http_client;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

const PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const CHAT_TIMEOUT_SECS: u64 = 30;
pub const EMBEDDING_TIMEOUT_SECS: u64 = 5;

pub struct OpenAiChatGateway {
    api_key: String,
    model: String,
    base_url: String,
    client: Client,
    timeout: Duration,
}

impl OpenAiChatGateway {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        let timeout = Duration::from_secs(CHAT_TIMEOUT_SECS);
        Self {
            api_key,
            model: DEFAULT_CHAT_MODEL.to_string(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: vendor_http_client(timeout),
            timeout,
        }
    }

    fn payload(&self, prompt: &ChatPrompt, stream: bool) -> Value {
        let mut messages = Vec::with_capacity(prompt.turns.len() + 1);
        if !prompt.system.is_empty() {
            messages.push(json!({"role": "system", "content": prompt.system}));
        }
        for turn in &prompt.turns {
            let role = match turn.role {
                TurnRole::User => "user",
                TurnRole::Assistant => "assistant",
            };
            messages.push(json!({"role": role, "content": turn.content}));
        }

        let mut payload = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": prompt.max_tokens,
            "temperature": prompt.temperature,
        });
        if stream {
            payload["stream"] = json!(true);
            payload["stream_options"] = json!({"include_usage": true});
        }
        payload
    }
}

#[async_trait]
impl ChatProvider for OpenAiChatGateway {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn chat(&self, prompt: &ChatPrompt) -> ProviderResult<ChatOutcome> {
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.payload(prompt, false))
            .send()
            .await
            .map_err(|e| classify_transport(PROVIDER, &e))?;
        let json = check_json_response(PROVIDER, resp).await?;

        let content = json["choices"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|c| c["message"]["content"].as_str())
            .unwrap_or("");
        if content.is_empty() {
            return Err(ProviderError::new(
                PROVIDER,
                ErrorCode::InvalidResponse,
                "response contained no message content",
            ));
        }

        Ok(ChatOutcome {
            content: content.to_string(),
            model: json["model"].as_str().unwrap_or(&self.model).to_string(),
            input_tokens: json["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: json["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        })
    }

    async fn chat_stream(
        &self,
        prompt: &ChatPrompt,
        on_chunk: StreamCallback,
    ) -> ProviderResult<ChatOutcome> {
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.payload(prompt, true))
            .send()
            .await
            .map_err(|e| classify_transport(PROVIDER, &e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(PROVIDER, status.as_u16(), &body, None));
        }

        let mut content = String::new();
        let mut model = self.model.clone();
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;
        let mut buf = String::new();

        let mut stream = resp.bytes_stream();
        let mut done = false;
        while !done {
            let next = tokio::time::timeout(self.timeout, stream.next())
                .await
                .map_err(|_| {
                    ProviderError::new(PROVIDER, ErrorCode::Timeout, "stream stalled mid-response")
                })?;
            // parse only blank-line-terminated events; keep the partial
            // tail for the next chunk, flushing it at stream end
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
                if let Some(m) = data["model"].as_str() {
                    model = m.to_string();
                }
                if let Some(text) = data["choices"]
                    .as_array()
                    .and_then(|arr| arr.first())
                    .and_then(|c| c["delta"]["content"].as_str())
                {
                    content.push_str(text);
                    on_chunk(text);
                }
                if let Some(usage) = data.get("usage").filter(|u| !u.is_null()) {
                    input_tokens = usage["prompt_tokens"].as_u64().unwrap_or(input_tokens);
                    output_tokens = usage["completion_tokens"].as_u64().unwrap_or(output_tokens);
                }
            }
        }

        if content.is_empty() {
            return Err(ProviderError::new(
                PROVIDER,
                ErrorCode::InvalidResponse,
                "stream ended with no message content",
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

pub struct OpenAiEmbeddingGateway {
    api_key: String,
    base_url: String,
    client: Client,
}

impl OpenAiEmbeddingGateway {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: vendor_http_client(Duration::from_secs(EMBEDDING_TIMEOUT_SECS)),
        }
    }
}

#[async_trait]
impl EmbedProvider for OpenAiEmbeddingGateway {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn embed(&self, texts: &[String]) -> ProviderResult<EmbeddingOutcome> {
        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({"model": EMBEDDING_MODEL, "input": texts}))
            .send()
            .await
            .map_err(|e| classify_transport(PROVIDER, &e))?;
        let json = check_json_response(PROVIDER, resp).await?;

        let Some(data) = json["data"].as_array() else {
            return Err(ProviderError::new(
                PROVIDER,
                ErrorCode::InvalidResponse,
                "missing data array",
            ));
        };

        // Re-assemble in input order; the API is allowed to reorder by index.
        let mut vectors: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
        for item in data {
            let index = item["index"].as_u64().unwrap_or(vectors.len() as u64) as usize;
            let vector: Vec<f32> = item["embedding"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_f64())
                        .map(|v| v as f32)
                        .collect()
                })
                .unwrap_or_default();
            if vector.len() != EMBEDDING_DIM {
                return Err(ProviderError::new(
                    PROVIDER,
                    ErrorCode::InvalidResponse,
                    format!("expected {EMBEDDING_DIM}-dim vector, got {}", vector.len()),
                ));
            }
            vectors.push((index, vector));
        }
        vectors.sort_by_key(|(index, _)| *index);

        if vectors.len() != texts.len() {
            return Err(ProviderError::new(
                PROVIDER,
                ErrorCode::InvalidResponse,
                format!("expected {} vectors, got {}", texts.len(), vectors.len()),
            ));
        }

        Ok(EmbeddingOutcome {
            vectors: vectors.into_iter().map(|(_, v)| v).collect(),
            total_tokens: json["usage"]["total_tokens"].as_u64().unwrap_or(0),
            model: json["model"].as_str().unwrap_or(EMBEDDING_MODEL).to_string(),
        })
    }
}
