/// AI router: per semantic task, an ordered chain of provider gateways.
/// Each link runs inside the retry harness; terminal failure moves to the
/// next link; success is annotated with the provider name and whether it
/// came from a fallback position. Every link that runs leaves exactly one
/// usage ledger row.
use crate::config::RetryConfig;
use crate::model::{UsageLogEntry, new_id};
use crate::providers::anthropic::AnthropicGateway;
use crate::providers::base::{
    ChatOutcome, ChatPrompt, ChatProvider, EmbedProvider, EmbeddingOutcome, ErrorCode,
    HealthFinding, HealthOutcome, HealthProvider, IdentificationOutcome, IdentifyProvider,
    ModelTier, ProviderError, ProviderResult, StreamCallback, extract_first_json_object,
};
use crate::providers::gemini::GeminiGateway;
use crate::providers::openai::{OpenAiChatGateway, OpenAiEmbeddingGateway};
use crate::providers::plant_id::PlantIdGateway;
use crate::providers::retry::{RetryPolicy, execute};
use crate::providers::{anthropic, gemini, openai, plant_id};
use crate::usage::{UsageLedger, cost_usd};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiTask {
    Identification,
    HealthAssessment,
    ChatSimple,
    ChatComplex,
    Embedding,
}

impl AiTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identification => "identification",
            Self::HealthAssessment => "health_assessment",
            Self::ChatSimple => "chat_simple",
            Self::ChatComplex => "chat_complex",
            Self::Embedding => "embedding",
        }
    }
}

/// A successful routing result, annotated with provenance.
#[derive(Debug, Clone)]
pub struct Routed<T> {
    pub value: T,
    pub provider: String,
    pub is_fallback: bool,
}

/// Every provider in the chain failed. Carries the ordered attempt list
/// and the last classified error; nothing is ever partially returned.
#[derive(Debug, Error)]
#[error("all providers failed for {}: {last}", .task.as_str())]
pub struct AiRouterError {
    pub task: AiTask,
    pub attempted: Vec<String>,
    pub last: ProviderError,
}

/// Per-call identity for the ledger.
#[derive(Debug, Clone)]
pub struct RouteMeta {
    pub user_id: String,
    pub endpoint: String,
}

struct Link<T> {
    name: &'static str,
    model_label: String,
    timeout: Duration,
    call: Box<dyn Fn() -> BoxFuture<'static, ProviderResult<T>> + Send + Sync>,
}

/// Ledger-relevant facts extracted from a successful outcome.
struct OutcomeUsage {
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    model: Option<String>,
}

impl OutcomeUsage {
    fn none() -> Self {
        Self {
            input_tokens: None,
            output_tokens: None,
            model: None,
        }
    }

    fn from_chat(outcome: &ChatOutcome) -> Self {
        Self {
            input_tokens: Some(outcome.input_tokens as i64),
            output_tokens: Some(outcome.output_tokens as i64),
            model: Some(outcome.model.clone()),
        }
    }

    fn from_embedding(outcome: &EmbeddingOutcome) -> Self {
        Self {
            input_tokens: Some(outcome.total_tokens as i64),
            output_tokens: None,
            model: Some(outcome.model.clone()),
        }
    }
}

pub struct ChatLink {
    pub provider: Arc<dyn ChatProvider>,
    pub tier: ModelTier,
    pub model_label: String,
    pub timeout: Duration,
}

pub struct AiRouter {
    identification: Vec<(Arc<dyn IdentifyProvider>, Duration, String)>,
    health: Vec<(Arc<dyn HealthProvider>, Duration, String)>,
    chat_simple: Vec<ChatLink>,
    chat_complex: Vec<ChatLink>,
    embedding: Vec<(Arc<dyn EmbedProvider>, Duration, String)>,
    ledger: Arc<UsageLedger>,
    retry: RetryConfig,
}

impl AiRouter {
    /// Wire the default chains: identification falls back from plant-id
    /// to gemini; health from plant-id to the simple conversational tier;
    /// chat_simple from claude-simple to openai; chat_complex degrades
    /// claude-complex, claude-simple, then openai; embedding is openai
    /// only.
    pub fn from_gateways(
        plant_id: Arc<PlantIdGateway>,
        gemini: Arc<GeminiGateway>,
        claude: Arc<AnthropicGateway>,
        openai_chat: Arc<OpenAiChatGateway>,
        openai_embed: Arc<OpenAiEmbeddingGateway>,
        ledger: Arc<UsageLedger>,
        retry: RetryConfig,
    ) -> Self {
        let secs = Duration::from_secs;
        let claude_simple = ChatLink {
            provider: claude.clone(),
            tier: ModelTier::Simple,
            model_label: AnthropicGateway::model_for(ModelTier::Simple).to_string(),
            timeout: secs(anthropic::SIMPLE_TIMEOUT_SECS),
        };
        let claude_complex = ChatLink {
            provider: claude.clone(),
            tier: ModelTier::Complex,
            model_label: AnthropicGateway::model_for(ModelTier::Complex).to_string(),
            timeout: secs(anthropic::COMPLEX_TIMEOUT_SECS),
        };
        let openai_link = || ChatLink {
            provider: openai_chat.clone(),
            tier: ModelTier::Simple,
            model_label: "gpt-4o-mini".to_string(),
            timeout: secs(openai::CHAT_TIMEOUT_SECS),
        };
        let llm_health = Arc::new(LlmHealthAssessor {
            gateway: claude.clone(),
        });

        Self {
            identification: vec![
                (
                    plant_id.clone(),
                    secs(plant_id::DEFAULT_TIMEOUT_SECS),
                    "plant-id-v2".to_string(),
                ),
                (
                    gemini,
                    secs(gemini::DEFAULT_TIMEOUT_SECS),
                    "gemini-2.0-flash".to_string(),
                ),
            ],
            health: vec![
                (
                    plant_id,
                    secs(plant_id::DEFAULT_TIMEOUT_SECS),
                    "plant-id-v2".to_string(),
                ),
                (
                    llm_health,
                    secs(anthropic::SIMPLE_TIMEOUT_SECS),
                    AnthropicGateway::model_for(ModelTier::Simple).to_string(),
                ),
            ],
            chat_simple: vec![clone_link(&claude_simple), openai_link()],
            chat_complex: vec![claude_complex, claude_simple, openai_link()],
            embedding: vec![(
                openai_embed,
                secs(openai::EMBEDDING_TIMEOUT_SECS),
                "text-embedding-3-small".to_string(),
            )],
            ledger,
            retry,
        }
    }

    /// Test seam: supply chains directly.
    #[allow(clippy::too_many_arguments)]
    pub fn with_chains(
        identification: Vec<(Arc<dyn IdentifyProvider>, Duration, String)>,
        health: Vec<(Arc<dyn HealthProvider>, Duration, String)>,
        chat_simple: Vec<ChatLink>,
        chat_complex: Vec<ChatLink>,
        embedding: Vec<(Arc<dyn EmbedProvider>, Duration, String)>,
        ledger: Arc<UsageLedger>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            identification,
            health,
            chat_simple,
            chat_complex,
            embedding,
            ledger,
            retry,
        }
    }

    fn policy(&self, timeout: Duration) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            attempt_timeout: timeout,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub async fn identify(
        &self,
        meta: &RouteMeta,
        cancel: &CancellationToken,
        images: &[String],
    ) -> Result<Routed<IdentificationOutcome>, AiRouterError> {
        let links = self
            .identification
            .iter()
            .map(|(provider, timeout, model)| {
                let provider = provider.clone();
                let images = images.to_vec();
                Link {
                    name: provider.name(),
                    model_label: model.clone(),
                    timeout: *timeout,
                    call: Box::new(move || {
                        let provider = provider.clone();
                        let images = images.clone();
                        Box::pin(async move { provider.identify(&images).await })
                    }),
                }
            })
            .collect();
        self.run_chain(AiTask::Identification, meta, cancel, links, |_| {
            OutcomeUsage::none()
        })
        .await
    }

    pub async fn assess_health(
        &self,
        meta: &RouteMeta,
        cancel: &CancellationToken,
        images: &[String],
        symptoms: Option<String>,
    ) -> Result<Routed<HealthOutcome>, AiRouterError> {
        let links = self
            .health
            .iter()
            .map(|(provider, timeout, model)| {
                let provider = provider.clone();
                let images = images.to_vec();
                let symptoms = symptoms.clone();
                Link {
                    name: provider.name(),
                    model_label: model.clone(),
                    timeout: *timeout,
                    call: Box::new(move || {
                        let provider = provider.clone();
                        let images = images.clone();
                        let symptoms = symptoms.clone();
                        Box::pin(async move { provider.assess(&images, symptoms.as_deref()).await })
                    }),
                }
            })
            .collect();
        self.run_chain(AiTask::HealthAssessment, meta, cancel, links, |_| {
            OutcomeUsage::none()
        })
        .await
    }

    pub async fn chat(
        &self,
        meta: &RouteMeta,
        cancel: &CancellationToken,
        prompt: &ChatPrompt,
    ) -> Result<Routed<ChatOutcome>, AiRouterError> {
        let (task, chain) = self.chat_chain(prompt.tier);
        let links = chain
            .iter()
            .map(|link| {
                let provider = link.provider.clone();
                let mut prompt = prompt.clone();
                prompt.tier = link.tier;
                Link {
                    name: provider.name(),
                    model_label: link.model_label.clone(),
                    timeout: link.timeout,
                    call: Box::new(move || {
                        let provider = provider.clone();
                        let prompt = prompt.clone();
                        Box::pin(async move { provider.chat(&prompt).await })
                    }),
                }
            })
            .collect();
        self.run_chain(task, meta, cancel, links, OutcomeUsage::from_chat)
            .await
    }

    /// Streaming chat. Once any chunk has reached the caller the stream is
    /// committed: no retry and no fallback can run without duplicating
    /// already-delivered text, so a committed failure ends the chain.
    pub async fn chat_stream(
        &self,
        meta: &RouteMeta,
        cancel: &CancellationToken,
        prompt: &ChatPrompt,
        on_chunk: StreamCallback,
    ) -> Result<Routed<ChatOutcome>, AiRouterError> {
        let (task, chain) = self.chat_chain(prompt.tier);
        let committed = Arc::new(AtomicBool::new(false));

        let links = chain
            .iter()
            .map(|link| {
                let provider = link.provider.clone();
                let mut prompt = prompt.clone();
                prompt.tier = link.tier;
                let committed = committed.clone();
                let on_chunk = on_chunk.clone();
                Link {
                    name: provider.name(),
                    model_label: link.model_label.clone(),
                    timeout: link.timeout,
                    call: Box::new(move || {
                        let provider = provider.clone();
                        let prompt = prompt.clone();
                        let committed = committed.clone();
                        let on_chunk = on_chunk.clone();
                        Box::pin(async move {
                            if committed.load(Ordering::SeqCst) {
                                return Err(ProviderError::new(
                                    provider.name(),
                                    ErrorCode::InvalidResponse,
                                    "stream already committed to caller",
                                ));
                            }
                            let sink: StreamCallback = Arc::new(move |text: &str| {
                                committed.store(true, Ordering::SeqCst);
                                on_chunk(text);
                            });
                            provider.chat_stream(&prompt, sink).await
                        })
                    }),
                }
            })
            .collect();

        self.run_chain_inner(
            task,
            meta,
            cancel,
            links,
            OutcomeUsage::from_chat,
            Some(committed),
        )
        .await
    }

    pub async fn embed(
        &self,
        meta: &RouteMeta,
        cancel: &CancellationToken,
        texts: &[String],
    ) -> Result<Routed<EmbeddingOutcome>, AiRouterError> {
        let links = self
            .embedding
            .iter()
            .map(|(provider, timeout, model)| {
                let provider = provider.clone();
                let texts = texts.to_vec();
                Link {
                    name: provider.name(),
                    model_label: model.clone(),
                    timeout: *timeout,
                    call: Box::new(move || {
                        let provider = provider.clone();
                        let texts = texts.clone();
                        Box::pin(async move { provider.embed(&texts).await })
                    }),
                }
            })
            .collect();
        self.run_chain(AiTask::Embedding, meta, cancel, links, |outcome| {
            OutcomeUsage::from_embedding(outcome)
        })
        .await
    }

    fn chat_chain(&self, tier: ModelTier) -> (AiTask, &[ChatLink]) {
        match tier {
            ModelTier::Simple => (AiTask::ChatSimple, &self.chat_simple),
            ModelTier::Complex => (AiTask::ChatComplex, &self.chat_complex),
        }
    }

    async fn run_chain<T>(
        &self,
        task: AiTask,
        meta: &RouteMeta,
        cancel: &CancellationToken,
        links: Vec<Link<T>>,
        usage_of: impl Fn(&T) -> OutcomeUsage,
    ) -> Result<Routed<T>, AiRouterError> {
        self.run_chain_inner(task, meta, cancel, links, usage_of, None)
            .await
    }

    async fn run_chain_inner<T>(
        &self,
        task: AiTask,
        meta: &RouteMeta,
        cancel: &CancellationToken,
        links: Vec<Link<T>>,
        usage_of: impl Fn(&T) -> OutcomeUsage,
        abort_when_set: Option<Arc<AtomicBool>>,
    ) -> Result<Routed<T>, AiRouterError> {
        let mut attempted = Vec::with_capacity(links.len());
        let mut last_error: Option<ProviderError> = None;

        for (index, link) in links.into_iter().enumerate() {
            attempted.push(link.name.to_string());
            let policy = self.policy(link.timeout);
            let started = Instant::now();
            let result = execute(&policy, cancel, || (link.call)()).await;
            let latency_ms = started.elapsed().as_millis() as i64;

            match result {
                Ok(value) => {
                    let usage = usage_of(&value);
                    let model = usage.model.unwrap_or(link.model_label);
                    self.record(
                        task,
                        meta,
                        link.name,
                        &model,
                        usage.input_tokens,
                        usage.output_tokens,
                        latency_ms,
                        true,
                        None,
                    )
                    .await;
                    debug!(
                        "task {} served by {} (fallback={})",
                        task.as_str(),
                        link.name,
                        index > 0
                    );
                    return Ok(Routed {
                        value,
                        provider: link.name.to_string(),
                        is_fallback: index > 0,
                    });
                }
                Err(error) => {
                    warn!(
                        "task {} provider {} failed terminally: {} ({})",
                        task.as_str(),
                        link.name,
                        error.message,
                        error.code.as_str()
                    );
                    self.record(
                        task,
                        meta,
                        link.name,
                        &link.model_label,
                        None,
                        None,
                        latency_ms,
                        false,
                        Some(error.code.as_str()),
                    )
                    .await;
                    last_error = Some(error);
                    if let Some(flag) = &abort_when_set
                        && flag.load(Ordering::SeqCst)
                    {
                        break;
                    }
                }
            }
        }

        Err(AiRouterError {
            task,
            attempted,
            last: last_error.unwrap_or_else(|| {
                ProviderError::new("router", ErrorCode::ServiceError, "empty provider chain")
            }),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        task: AiTask,
        meta: &RouteMeta,
        provider: &'static str,
        model: &str,
        input_tokens: Option<i64>,
        output_tokens: Option<i64>,
        latency_ms: i64,
        success: bool,
        error_code: Option<&str>,
    ) {
        let cost = if success {
            cost_usd(provider, model, input_tokens, output_tokens)
        } else {
            0.0
        };
        self.ledger
            .record(UsageLogEntry {
                id: new_id(),
                user_id: meta.user_id.clone(),
                action: task.as_str().to_string(),
                provider: provider.to_string(),
                model: model.to_string(),
                input_tokens,
                output_tokens,
                latency_ms,
                success,
                error_code: error_code.map(str::to_string),
                cost_usd: cost,
                endpoint: meta.endpoint.clone(),
                created_at: Utc::now(),
            })
            .await;
    }
}

fn clone_link(link: &ChatLink) -> ChatLink {
    ChatLink {
        provider: link.provider.clone(),
        tier: link.tier,
        model_label: link.model_label.clone(),
        timeout: link.timeout,
    }
}

const HEALTH_PROMPT: &str = "You are a plant pathologist. Based on the symptom description, \
assess the plant's health. Respond with exactly one JSON object: \
{\"isHealthy\": boolean, \"issues\": [{\"name\": string, \"confidence\": number between 0 and 1, \
\"description\": string, \"treatmentSteps\": [string]}]}. Order issues by confidence, highest first.";

/// Health-assessment fallback: prompts the simple-tier conversational
/// model for strict JSON findings when the identification vendor's health
/// endpoint is down.
struct LlmHealthAssessor {
    gateway: Arc<AnthropicGateway>,
}

#[async_trait]
impl HealthProvider for LlmHealthAssessor {
    fn name(&self) -> &'static str {
        self.gateway.name()
    }

    async fn assess(
        &self,
        _images: &[String],
        symptoms: Option<&str>,
    ) -> ProviderResult<HealthOutcome> {
        let described = symptoms.unwrap_or("No symptom description was provided.");
        let prompt = ChatPrompt {
            system: HEALTH_PROMPT.to_string(),
            turns: vec![crate::providers::base::ChatTurn::user(format!(
                "Symptoms: {described}"
            ))],
            tier: ModelTier::Simple,
            max_tokens: 1024,
            temperature: 0.2,
        };
        let outcome = self.gateway.chat(&prompt).await?;

        let Some(obj) = extract_first_json_object(&outcome.content) else {
            return Err(ProviderError::new(
                self.name(),
                ErrorCode::InvalidResponse,
                "assessment response had no JSON object",
            ));
        };

        let findings: Vec<HealthFinding> = obj["issues"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(|issue| HealthFinding {
                        name: issue["name"].as_str().unwrap_or("Unknown").to_string(),
                        confidence: issue["confidence"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0),
                        description: issue["description"].as_str().unwrap_or("").to_string(),
                        treatment_steps: issue["treatmentSteps"]
                            .as_array()
                            .map(|steps| {
                                steps
                                    .iter()
                                    .filter_map(|s| s.as_str().map(str::to_string))
                                    .collect()
                            })
                            .unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(HealthOutcome {
            is_healthy: obj["isHealthy"].as_bool().unwrap_or(findings.is_empty()),
            findings,
        })
    }
}
