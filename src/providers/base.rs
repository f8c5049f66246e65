/// Shared types for the provider gateways: the classified error surface
/// consumed by the retry harness and router, the normalized outcome shapes
/// each gateway maps its vendor payload into, and the input helpers every
/// gateway applies to base64 image payloads.
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Expected dimension of embedding vectors; there is no cross-vendor
/// substitute because dimensions differ between embedding models.
pub const EMBEDDING_DIM: usize = 1536;

/// Classification of a failed provider call, consumed by the retry harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// 401/403 or an "invalid api key" signature. Never retried.
    Auth,
    /// HTTP 429. Retried, honoring Retry-After when present.
    RateLimit,
    /// HTTP 5xx, connection or DNS failure. Retried.
    ServiceError,
    /// Local per-attempt timeout. Retried.
    Timeout,
    /// Identification produced no usable match. Not retried.
    NoMatch,
    /// Vendor payload could not be parsed into the expected shape. Not retried.
    InvalidResponse,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "AUTH",
            Self::RateLimit => "RATE_LIMIT",
            Self::ServiceError => "SERVICE_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::NoMatch => "NO_MATCH",
            Self::InvalidResponse => "INVALID_RESPONSE",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit | Self::ServiceError | Self::Timeout)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{provider}: {message} ({})", .code.as_str())]
pub struct ProviderError {
    pub provider: &'static str,
    pub code: ErrorCode,
    pub message: String,
    /// Seconds from a Retry-After header, when the vendor sent one.
    pub retry_after_secs: Option<u64>,
}

impl ProviderError {
    pub fn new(provider: &'static str, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            provider,
            code,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Classify an HTTP error status into a `ProviderError`.
pub fn classify_status(
    provider: &'static str,
    status: u16,
    body: &str,
    retry_after_secs: Option<u64>,
) -> ProviderError {
    let lower = body.to_lowercase();
    if status == 401 || status == 403 || lower.contains("invalid api key") {
        return ProviderError::new(provider, ErrorCode::Auth, format!("HTTP {status}"));
    }
    if status == 429 {
        return ProviderError {
            provider,
            code: ErrorCode::RateLimit,
            message: format!("HTTP {status}"),
            retry_after_secs,
        };
    }
    ProviderError::new(
        provider,
        ErrorCode::ServiceError,
        format!("HTTP {status}: {}", truncate(body, 200)),
    )
}

/// Classify a reqwest transport failure (timeouts, connect/DNS errors).
pub fn classify_transport(provider: &'static str, err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::new(provider, ErrorCode::Timeout, "request timed out")
    } else {
        ProviderError::new(provider, ErrorCode::ServiceError, err.to_string())
    }
}

/// Read a response, classifying error statuses and parsing the success body
/// as JSON. Parse failures on a 2xx body are `InvalidResponse`.
pub async fn check_json_response(
    provider: &'static str,
    resp: reqwest::Response,
) -> ProviderResult<Value> {
    let status = resp.status();
    if !status.is_success() {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let body = resp.text().await.unwrap_or_default();
        return Err(classify_status(
            provider,
            status.as_u16(),
            &body,
            retry_after,
        ));
    }
    resp.json::<Value>().await.map_err(|e| {
        ProviderError::new(
            provider,
            ErrorCode::InvalidResponse,
            format!("body is not JSON: {e}"),
        )
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Strip a `data:image/...;base64,` prefix if present. Gateways apply this
/// even though the pipeline normalizes upstream.
pub fn strip_data_uri(image: &str) -> &str {
    if let Some(rest) = image.strip_prefix("data:") {
        if let Some(comma) = rest.find(',') {
            return &rest[comma + 1..];
        }
    }
    image
}

/// Estimated decoded size of a base64 payload: ceil(len * 0.75).
pub fn estimated_decoded_len(b64: &str) -> usize {
    (b64.len() * 3).div_ceil(4)
}

/// Extract the first JSON object from free-form model output, tolerating
/// Markdown code fences and surrounding prose. Returns `None` when no
/// balanced object parses.
pub fn extract_first_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&text[start..=i]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// One identified species candidate, normalized from a vendor payload.
/// Missing vendor fields default explicitly: strings to "Unknown",
/// arrays to empty, confidence to 0.
#[derive(Debug, Clone)]
pub struct SpeciesCandidate {
    pub scientific_name: String,
    pub common_names: Vec<String>,
    pub family: String,
    pub genus: String,
    pub confidence: f64,
    pub similar_image_url: Option<String>,
    pub vendor_species_id: Option<String>,
    pub description: Option<String>,
    pub toxicity: Option<String>,
}

impl SpeciesCandidate {
    /// Sentinel low-confidence result used when a vision response cannot
    /// be parsed; never an error.
    pub fn unknown() -> Self {
        Self {
            scientific_name: "Unknown".to_string(),
            common_names: Vec::new(),
            family: "Unknown".to_string(),
            genus: "Unknown".to_string(),
            confidence: 0.0,
            similar_image_url: None,
            vendor_species_id: None,
            description: None,
            toxicity: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdentificationOutcome {
    pub is_plant: bool,
    pub top: SpeciesCandidate,
    /// Up to four lower-ranked candidates, best first.
    pub alternatives: Vec<SpeciesCandidate>,
}

#[derive(Debug, Clone)]
pub struct HealthFinding {
    pub name: String,
    pub confidence: f64,
    pub description: String,
    /// Ordered treatment instructions.
    pub treatment_steps: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct HealthOutcome {
    pub is_healthy: bool,
    /// Ranked by confidence, highest first.
    pub findings: Vec<HealthFinding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Simple,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

/// A fully rendered conversational request: system prompt plus ordered turns.
#[derive(Debug, Clone)]
pub struct ChatPrompt {
    pub system: String,
    pub turns: Vec<ChatTurn>,
    pub tier: ModelTier,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct EmbeddingOutcome {
    /// One vector per input text, in input order.
    pub vectors: Vec<Vec<f32>>,
    pub total_tokens: u64,
    pub model: String,
}

/// Receives stream chunks in emission order.
pub type StreamCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[async_trait]
pub trait IdentifyProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn identify(&self, images: &[String]) -> ProviderResult<IdentificationOutcome>;
}

#[async_trait]
pub trait HealthProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn assess(
        &self,
        images: &[String],
        symptoms: Option<&str>,
    ) -> ProviderResult<HealthOutcome>;
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn chat(&self, prompt: &ChatPrompt) -> ProviderResult<ChatOutcome>;
    async fn chat_stream(
        &self,
        prompt: &ChatPrompt,
        on_chunk: StreamCallback,
    ) -> ProviderResult<ChatOutcome>;
}

#[async_trait]
pub trait EmbedProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn embed(&self, texts: &[String]) -> ProviderResult<EmbeddingOutcome>;
}

#[cfg(test)]
mod tests;
