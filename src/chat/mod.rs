/// Chat pipeline: assemble context, pick a model tier, route, persist the
/// exchange transactionally, then extract semantic memories from the
/// assistant's answer. The streaming variant surfaces chunks in emission
/// order and persists only on successful completion.
pub mod context;

use crate::chat::context::{ContextAssembler, ContextBundle, ContextUsed};
use crate::errors::{LeafwiseError, LeafwiseResult};
use crate::model::{
    ConversationSession, HealthIssue, MemoryKind, MessageRecord, MessageRole, Plant, PlantHealth,
    SemanticMemory, new_id,
};
use crate::providers::base::{ChatPrompt, ChatTurn, ModelTier, StreamCallback, TurnRole};
use crate::repo::{ExchangeWrite, Repository};
use crate::router::{AiRouter, RouteMeta};
use crate::usage::cost_usd;
use crate::usage::limits::{QuotaFeature, QuotaGate, SlidingWindowLimiter};
use chrono::{Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const ENDPOINT: &str = "/api/v1/chat";
pub const STREAM_ENDPOINT: &str = "/api/v1/chat/stream";

/// Queries longer than this force the complex tier.
const COMPLEX_QUERY_CHARS: usize = 400;
/// Issues at or above this confidence force the complex tier.
const COMPLEX_ISSUE_CONFIDENCE: f64 = 0.6;
const MAX_RESPONSE_TOKENS: u32 = 1024;
const CHAT_TEMPERATURE: f32 = 0.7;
const MAX_MEMORIES_PER_EXCHANGE: usize = 3;
const STREAM_DEADLINE: Duration = Duration::from_secs(60);

const PERSONA: &str = "You are Leafwise, a warm and practical plant-care assistant. \
Give specific, actionable advice grounded in the gardener's actual plants and history. \
Keep answers concise and avoid generic filler. When you finish an answer that contains \
action items or natural follow-up questions, append a fenced json block with \
{\"actionItems\": [...], \"followUpQuestions\": [...]}.";

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub session_id: Option<String>,
    pub message: String,
    pub plant_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub session_id: String,
    pub content: String,
    pub action_items: Vec<String>,
    pub follow_up_questions: Vec<String>,
    pub context_used: ContextUsed,
    #[serde(skip)]
    pub provider: String,
    #[serde(skip)]
    pub model: String,
    #[serde(skip)]
    pub processing_time_ms: i64,
}

/// Events surfaced to a streaming client, in order:
/// `Start`, zero or more `Chunk`s, then exactly one `Done` or `Error`.
#[derive(Debug)]
pub enum ChatStreamEvent {
    Start { session_id: String },
    Chunk { text: String },
    Done { response: ChatResponse },
    Error { code: String, message: String },
}

pub struct ChatService {
    router: Arc<AiRouter>,
    repo: Arc<dyn Repository>,
    assembler: ContextAssembler,
    windows: Arc<SlidingWindowLimiter>,
    quotas: Arc<QuotaGate>,
}

impl ChatService {
    pub fn new(
        router: Arc<AiRouter>,
        repo: Arc<dyn Repository>,
        assembler: ContextAssembler,
        windows: Arc<SlidingWindowLimiter>,
        quotas: Arc<QuotaGate>,
    ) -> Self {
        Self {
            router,
            repo,
            assembler,
            windows,
            quotas,
        }
    }

    pub async fn run(
        &self,
        user_id: &str,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> LeafwiseResult<ChatResponse> {
        let started = Instant::now();
        let prepared = self.prepare(user_id, &request, ENDPOINT, cancel).await?;

        let routed = self
            .router
            .chat(&prepared.meta, cancel, &prepared.prompt)
            .await
            .map_err(|e| LeafwiseError::AiUnavailable {
                attempted: e.attempted,
                message: e.last.message.clone(),
            })?;

        let response = self
            .finalize(&prepared, routed.value, routed.provider, cancel, started)
            .await?;
        Ok(response)
    }

    /// Streaming variant. Events arrive on the returned channel; session
    /// aggregates are written only after the stream completes, and a
    /// mid-stream failure discards the draft assistant message.
    pub async fn run_stream(
        &self,
        user_id: &str,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> LeafwiseResult<mpsc::UnboundedReceiver<ChatStreamEvent>> {
        let started = Instant::now();
        let prepared = self
            .prepare(user_id, &request, STREAM_ENDPOINT, &cancel)
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ChatStreamEvent::Start {
            session_id: prepared.session.id.clone(),
        });

        let chunk_tx = tx.clone();
        let on_chunk: StreamCallback = Arc::new(move |text: &str| {
            let _ = chunk_tx.send(ChatStreamEvent::Chunk {
                text: text.to_string(),
            });
        });

        let router = self.router.clone();
        let repo = self.repo.clone();
        let service_ctx = StreamFinalizer {
            repo,
            router: router.clone(),
        };
        tokio::spawn(async move {
            let streamed = tokio::time::timeout(
                STREAM_DEADLINE,
                router.chat_stream(&prepared.meta, &cancel, &prepared.prompt, on_chunk),
            )
            .await;

            let event = match streamed {
                Ok(Ok(routed)) => {
                    match service_ctx
                        .finalize(&prepared, routed.value, routed.provider, &cancel, started)
                        .await
                    {
                        Ok(response) => ChatStreamEvent::Done { response },
                        Err(e) => ChatStreamEvent::Error {
                            code: e.code().to_string(),
                            message: e.to_string(),
                        },
                    }
                }
                Ok(Err(e)) => ChatStreamEvent::Error {
                    code: "AI_UNAVAILABLE".to_string(),
                    message: e.last.message.clone(),
                },
                Err(_elapsed) => ChatStreamEvent::Error {
                    code: "AI_UNAVAILABLE".to_string(),
                    message: "stream deadline exceeded".to_string(),
                },
            };
            let _ = tx.send(event);
        });

        Ok(rx)
    }

    async fn prepare(
        &self,
        user_id: &str,
        request: &ChatRequest,
        endpoint: &str,
        cancel: &CancellationToken,
    ) -> LeafwiseResult<PreparedChat> {
        if request.message.trim().is_empty() {
            return Err(LeafwiseError::Validation("message must not be empty".into()));
        }

        self.windows.check(user_id, endpoint)?;
        let user = self
            .repo
            .get_user(user_id)
            .await
            .map_err(LeafwiseError::Internal)?
            .ok_or_else(|| LeafwiseError::NotFound(format!("user {user_id}")))?;
        self.quotas.check(&user, QuotaFeature::Chat).await?;

        let session = match &request.session_id {
            Some(session_id) => self
                .repo
                .get_session(session_id, user_id)
                .await
                .map_err(LeafwiseError::Internal)?
                .ok_or_else(|| LeafwiseError::NotFound(format!("session {session_id}")))?,
            None => {
                let session = ConversationSession {
                    id: new_id(),
                    user_id: user_id.to_string(),
                    plant_id: request.plant_id.clone(),
                    message_count: 0,
                    total_input_tokens: 0,
                    total_output_tokens: 0,
                    estimated_cost_usd: 0.0,
                    models_used: BTreeSet::new(),
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                };
                self.repo
                    .insert_session(&session)
                    .await
                    .map_err(LeafwiseError::Internal)?;
                session
            }
        };

        let meta = RouteMeta {
            user_id: user_id.to_string(),
            endpoint: endpoint.to_string(),
        };
        let plant_id = request
            .plant_id
            .clone()
            .or_else(|| session.plant_id.clone());
        let bundle = self
            .assembler
            .assemble(
                &user,
                &request.message,
                plant_id.as_deref(),
                Some(&session.id),
                &meta,
                cancel,
            )
            .await?;

        let tier = decide_tier(&request.message, bundle.plant.as_ref(), &bundle.issues);
        let prompt = build_prompt(&bundle, &request.message, tier);

        Ok(PreparedChat {
            session,
            meta,
            prompt,
            bundle,
            query: request.message.clone(),
        })
    }

    async fn finalize(
        &self,
        prepared: &PreparedChat,
        outcome: crate::providers::base::ChatOutcome,
        provider: String,
        cancel: &CancellationToken,
        started: Instant,
    ) -> LeafwiseResult<ChatResponse> {
        StreamFinalizer {
            repo: self.repo.clone(),
            router: self.router.clone(),
        }
        .finalize(prepared, outcome, provider, cancel, started)
        .await
    }
}

struct PreparedChat {
    session: ConversationSession,
    meta: RouteMeta,
    prompt: ChatPrompt,
    bundle: ContextBundle,
    query: String,
}

/// Persistence + memory extraction shared by the blocking and streaming
/// paths (the streaming task cannot borrow the service).
struct StreamFinalizer {
    repo: Arc<dyn Repository>,
    router: Arc<AiRouter>,
}

impl StreamFinalizer {
    async fn finalize(
        &self,
        prepared: &PreparedChat,
        outcome: crate::providers::base::ChatOutcome,
        provider: String,
        cancel: &CancellationToken,
        started: Instant,
    ) -> LeafwiseResult<ChatResponse> {
        let (content, action_items, follow_ups) = parse_structured_tail(&outcome.content);
        let cost = cost_usd(
            &provider,
            &outcome.model,
            Some(outcome.input_tokens as i64),
            Some(outcome.output_tokens as i64),
        );

        let now = Utc::now();
        let user_message = MessageRecord {
            id: new_id(),
            session_id: prepared.session.id.clone(),
            role: MessageRole::User,
            content: prepared.query.clone(),
            input_tokens: None,
            output_tokens: None,
            model: None,
            action_items: Vec::new(),
            created_at: now,
        };
        let assistant_message = MessageRecord {
            id: new_id(),
            session_id: prepared.session.id.clone(),
            role: MessageRole::Assistant,
            content: content.clone(),
            input_tokens: Some(outcome.input_tokens as i64),
            output_tokens: Some(outcome.output_tokens as i64),
            model: Some(outcome.model.clone()),
            action_items: action_items.clone(),
            created_at: now + ChronoDuration::milliseconds(1),
        };
        self.repo
            .append_exchange(&ExchangeWrite {
                session_id: prepared.session.id.clone(),
                user_message,
                assistant_message,
                cost_usd: cost,
                model: outcome.model.clone(),
            })
            .await
            .map_err(LeafwiseError::Internal)?;

        self.extract_memories(prepared, &content, cancel).await;

        Ok(ChatResponse {
            session_id: prepared.session.id.clone(),
            content,
            action_items,
            follow_up_questions: follow_ups,
            context_used: prepared.bundle.used.clone(),
            provider,
            model: outcome.model,
            processing_time_ms: started.elapsed().as_millis() as i64,
        })
    }

    /// Embed and store diagnosis/outcome segments. Best-effort: any
    /// failure is logged and the chat response is unaffected.
    async fn extract_memories(
        &self,
        prepared: &PreparedChat,
        content: &str,
        cancel: &CancellationToken,
    ) {
        let segments = extract_memory_segments(content);
        if segments.is_empty() {
            return;
        }

        let texts: Vec<String> = segments.iter().map(|(_, text)| text.clone()).collect();
        let embedded = match self.router.embed(&prepared.meta, cancel, &texts).await {
            Ok(routed) => routed.value,
            Err(e) => {
                warn!("memory extraction skipped, embedding unavailable: {e}");
                return;
            }
        };

        for ((kind, text), vector) in segments.into_iter().zip(embedded.vectors) {
            let memory = SemanticMemory {
                id: new_id(),
                user_id: prepared.meta.user_id.clone(),
                content: text,
                content_type: kind,
                embedding: vector,
                relevance_score: 1.0,
                source_session_id: Some(prepared.session.id.clone()),
                created_at: Utc::now(),
            };
            if let Err(e) = self.repo.insert_memory(&memory).await {
                warn!("memory insert failed: {e}");
            }
        }
    }
}

/// Complex tier when the query is long, the plant is in bad shape, or a
/// confident active issue exists.
pub fn decide_tier(query: &str, plant: Option<&Plant>, issues: &[HealthIssue]) -> ModelTier {
    if query.chars().count() > COMPLEX_QUERY_CHARS {
        return ModelTier::Complex;
    }
    if let Some(plant) = plant
        && matches!(
            plant.current_health,
            PlantHealth::Struggling | PlantHealth::Critical
        )
    {
        return ModelTier::Complex;
    }
    if issues.iter().any(|issue| {
        issue.status == crate::model::IssueStatus::Active
            && issue.confidence >= COMPLEX_ISSUE_CONFIDENCE
    }) {
        return ModelTier::Complex;
    }
    ModelTier::Simple
}

/// System prompt carries persona + user facts; the context sections are
/// packed as the prefix of the final user turn.
fn build_prompt(bundle: &ContextBundle, query: &str, tier: ModelTier) -> ChatPrompt {
    let mut system = PERSONA.to_string();
    if !bundle.user_section.is_empty() {
        system.push_str("\n\nAbout the gardener:\n");
        system.push_str(&bundle.user_section);
    }

    let mut turns: Vec<ChatTurn> = bundle
        .history
        .iter()
        .map(|turn| ChatTurn {
            role: match turn.role {
                MessageRole::Assistant => TurnRole::Assistant,
                _ => TurnRole::User,
            },
            content: turn.content.clone(),
        })
        .collect();

    let mut final_turn = String::new();
    if !bundle.plant_section.is_empty() {
        final_turn.push_str(&bundle.plant_section);
        final_turn.push_str("\n\n");
    }
    if !bundle.memory_section.is_empty() {
        final_turn.push_str(&bundle.memory_section);
        final_turn.push_str("\n\n");
    }
    final_turn.push_str(query);
    turns.push(ChatTurn::user(final_turn));

    ChatPrompt {
        system,
        turns,
        tier,
        max_tokens: MAX_RESPONSE_TOKENS,
        temperature: CHAT_TEMPERATURE,
    }
}

/// Split a trailing ```json fence off the assistant output. Returns the
/// cleaned content plus action items and follow-up questions; a missing
/// or broken tail yields empty lists.
fn parse_structured_tail(content: &str) -> (String, Vec<String>, Vec<String>) {
    let Some(fence_start) = content.rfind("```json") else {
        return (content.trim().to_string(), Vec::new(), Vec::new());
    };
    let after = &content[fence_start + "```json".len()..];
    let Some(fence_len) = after.find("```") else {
        return (content.trim().to_string(), Vec::new(), Vec::new());
    };

    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(after[..fence_len].trim()) else {
        return (content.trim().to_string(), Vec::new(), Vec::new());
    };
    let list = |key: &str| -> Vec<String> {
        parsed[key]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    let clean = content[..fence_start].trim().to_string();
    (clean, list("actionItems"), list("followUpQuestions"))
}

fn diagnosis_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(diagnosis:|appears to (?:have|be)|is suffering from|signs of|symptoms of|likely (?:has|caused by))",
        )
        .unwrap()
    })
}

fn outcome_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(outcome:|has recovered|fully recovered|is improving|bounced back|new growth)")
            .unwrap()
    })
}

/// Heuristic memory extraction: sentences that read like a diagnosis or
/// an observed outcome. Capped to keep embedding cost bounded.
pub(crate) fn extract_memory_segments(content: &str) -> Vec<(MemoryKind, String)> {
    let mut segments = Vec::new();
    for raw in content.split_inclusive(['.', '\n']) {
        let sentence = raw.trim().trim_end_matches('.').trim();
        if sentence.len() < 16 {
            continue;
        }
        if diagnosis_re().is_match(sentence) {
            segments.push((MemoryKind::Diagnosis, sentence.to_string()));
        } else if outcome_re().is_match(sentence) {
            segments.push((MemoryKind::Outcome, sentence.to_string()));
        }
        if segments.len() >= MAX_MEMORIES_PER_EXCHANGE {
            break;
        }
    }
    segments
}
