// Shared end-to-end fixtures; not every helper is used by every test binary.
#![allow(unused)]

use leafwise::chat::{ChatService, context::ContextAssembler};
use leafwise::config::{ContextBudget, QuotaConfig, RetryConfig};
use leafwise::health::HealthAssessService;
use leafwise::identify::IdentificationService;
use leafwise::model::{ExperienceLevel, Tier, User};
use leafwise::providers::anthropic::AnthropicGateway;
use leafwise::providers::gemini::GeminiGateway;
use leafwise::providers::openai::{OpenAiChatGateway, OpenAiEmbeddingGateway};
use leafwise::providers::plant_id::PlantIdGateway;
use leafwise::repo::Repository;
use leafwise::repo::sqlite::SqliteRepository;
use leafwise::router::AiRouter;
use leafwise::storage::LocalPhotoStorage;
use leafwise::usage::UsageLedger;
use leafwise::usage::limits::{QuotaGate, SlidingWindowLimiter};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::MockServer;

pub const EMBEDDING_DIM: usize = 1536;

pub struct TestHarness {
    pub repo: Arc<SqliteRepository>,
    pub identify: Arc<IdentificationService>,
    pub health: Arc<HealthAssessService>,
    pub chat: Arc<ChatService>,
    pub plant_id_server: MockServer,
    pub gemini_server: MockServer,
    pub claude_server: MockServer,
    pub openai_server: MockServer,
    pub photo_dir: TempDir,
}

pub async fn harness() -> TestHarness {
    let plant_id_server = MockServer::start().await;
    let gemini_server = MockServer::start().await;
    let claude_server = MockServer::start().await;
    let openai_server = MockServer::start().await;

    let repo = Arc::new(SqliteRepository::in_memory().unwrap());
    let photo_dir = TempDir::new().unwrap();

    let plant_id = Arc::new(PlantIdGateway::new(
        "pk-test".to_string(),
        Some(plant_id_server.uri()),
        Duration::from_secs(5),
    ));
    let gemini = Arc::new(GeminiGateway::new(
        "gk-test".to_string(),
        Some(gemini_server.uri()),
        Duration::from_secs(5),
    ));
    let claude = Arc::new(AnthropicGateway::new(
        "ck-test".to_string(),
        Some(claude_server.uri()),
    ));
    let openai_chat = Arc::new(OpenAiChatGateway::new(
        "ok-test".to_string(),
        Some(openai_server.uri()),
    ));
    let openai_embed = Arc::new(OpenAiEmbeddingGateway::new(
        "ok-test".to_string(),
        Some(openai_server.uri()),
    ));

    let ledger = Arc::new(UsageLedger::new(repo.clone()));
    let router = Arc::new(AiRouter::from_gateways(
        plant_id,
        gemini,
        claude,
        openai_chat,
        openai_embed,
        ledger,
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 5,
            max_delay_ms: 20,
        },
    ));

    let storage = Arc::new(LocalPhotoStorage::new(
        photo_dir.path(),
        "http://localhost:8080/photos",
        "integration-secret",
    ));
    let windows = Arc::new(SlidingWindowLimiter::new());
    let quotas = Arc::new(QuotaGate::new(QuotaConfig::default(), repo.clone()));

    let identify = Arc::new(IdentificationService::new(
        router.clone(),
        repo.clone(),
        storage,
        windows.clone(),
        quotas.clone(),
        0.70,
        Duration::from_secs(3600),
    ));
    let health = Arc::new(HealthAssessService::new(
        router.clone(),
        repo.clone(),
        windows.clone(),
        quotas.clone(),
    ));
    let chat = Arc::new(ChatService::new(
        router.clone(),
        repo.clone(),
        ContextAssembler::new(repo.clone(), router, ContextBudget::default(), 0.70),
        windows,
        quotas,
    ));

    TestHarness {
        repo,
        identify,
        health,
        chat,
        plant_id_server,
        gemini_server,
        claude_server,
        openai_server,
        photo_dir,
    }
}

pub async fn seed_user(repo: &Arc<SqliteRepository>, id: &str, tier: Tier) -> User {
    let user = User {
        id: id.to_string(),
        display_name: "Indie".to_string(),
        experience_level: ExperienceLevel::Intermediate,
        city: Some("Porto".to_string()),
        climate_zone: None,
        home_type: Some("apartment".to_string()),
        light_level: None,
        humidity_level: None,
        tier,
    };
    repo.insert_user(&user).await.unwrap();
    user
}

// --- vendor payload builders ---

pub fn plant_id_body(name: &str, confidence: f64, alternatives: &[(&str, f64)]) -> Value {
    let mut suggestions = vec![json!({
        "id": 4001,
        "plant_name": name,
        "probability": confidence,
        "plant_details": {
            "scientific_name": name,
            "common_names": ["Golden pothos"],
            "taxonomy": {"family": "Araceae", "genus": "Epipremnum"}
        },
        "similar_images": [{"url": "https://img.example/top.jpg"}]
    })];
    for (alt_name, alt_conf) in alternatives {
        suggestions.push(json!({
            "plant_name": alt_name,
            "probability": alt_conf,
            "plant_details": {
                "scientific_name": alt_name,
                "taxonomy": {"family": "Araceae", "genus": "Epipremnum"}
            }
        }));
    }
    json!({"is_plant": true, "suggestions": suggestions})
}

pub fn gemini_vision_body(answer: &str) -> Value {
    json!({
        "candidates": [{
            "content": {"parts": [{"text": answer}], "role": "model"},
            "finishReason": "STOP"
        }]
    })
}

pub fn claude_message_body(text: &str, input_tokens: u64, output_tokens: u64) -> Value {
    json!({
        "model": "claude-haiku-4-5",
        "content": [{"type": "text", "text": text}],
        "usage": {"input_tokens": input_tokens, "output_tokens": output_tokens}
    })
}

pub fn embedding_body(count: usize) -> Value {
    let data: Vec<Value> = (0..count)
        .map(|i| {
            json!({
                "index": i,
                "embedding": unit_embedding(),
            })
        })
        .collect();
    json!({
        "model": "text-embedding-3-small",
        "data": data,
        "usage": {"total_tokens": 7 * count}
    })
}

/// Query embedding axis: [1, 0, 0, ...].
pub fn unit_embedding() -> Vec<f64> {
    let mut v = vec![0.0f64; EMBEDDING_DIM];
    v[0] = 1.0;
    v
}

/// An embedding at a known cosine similarity to the query axis.
pub fn embedding_at_similarity(similarity: f32) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    v[0] = similarity;
    v[1] = (1.0 - similarity * similarity).max(0.0).sqrt();
    v
}

pub fn tiny_png_b64() -> String {
    use base64::Engine as _;
    let img = image::DynamicImage::new_rgb8(16, 16);
    let mut bytes = Vec::new();
    img.write_to(
        &mut std::io::Cursor::new(&mut bytes),
        image::ImageFormat::Png,
    )
    .unwrap();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
