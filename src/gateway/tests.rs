use super::*;
use crate::chat::context::ContextAssembler;
use crate::config::{ContextBudget, QuotaConfig, RetryConfig};
use crate::model::{ExperienceLevel, Tier, User};
use crate::providers::base::{
    ChatOutcome, ChatPrompt, ChatProvider, EmbedProvider, EmbeddingOutcome, ErrorCode,
    IdentificationOutcome, IdentifyProvider, ModelTier, ProviderError, ProviderResult,
    SpeciesCandidate, StreamCallback,
};
use crate::repo::sqlite::SqliteRepository;
use crate::router::{AiRouter, ChatLink};
use crate::usage::UsageLedger;
use crate::usage::limits::{QuotaGate, SlidingWindowLimiter};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use base64::Engine as _;
use tempfile::TempDir;
use tower::util::ServiceExt;

struct GoodIdentify;

#[async_trait]
impl IdentifyProvider for GoodIdentify {
    fn name(&self) -> &'static str {
        "plant-id"
    }

    async fn identify(&self, _images: &[String]) -> ProviderResult<IdentificationOutcome> {
        Ok(IdentificationOutcome {
            is_plant: true,
            top: SpeciesCandidate {
                scientific_name: "Epipremnum aureum".to_string(),
                common_names: vec!["Golden pothos".to_string()],
                family: "Araceae".to_string(),
                genus: "Epipremnum".to_string(),
                confidence: 0.93,
                similar_image_url: None,
                vendor_species_id: None,
                description: None,
                toxicity: None,
            },
            alternatives: vec![],
        })
    }
}

struct DownIdentify;

#[async_trait]
impl IdentifyProvider for DownIdentify {
    fn name(&self) -> &'static str {
        "plant-id"
    }

    async fn identify(&self, _images: &[String]) -> ProviderResult<IdentificationOutcome> {
        Err(ProviderError::new(
            "plant-id",
            ErrorCode::Auth,
            "bad credentials",
        ))
    }
}

struct EchoChat;

#[async_trait]
impl ChatProvider for EchoChat {
    fn name(&self) -> &'static str {
        "claude"
    }

    async fn chat(&self, _prompt: &ChatPrompt) -> ProviderResult<ChatOutcome> {
        Ok(ChatOutcome {
            content: "Water it weekly.".to_string(),
            model: "claude-haiku-4-5".to_string(),
            input_tokens: 100,
            output_tokens: 10,
        })
    }

    async fn chat_stream(
        &self,
        prompt: &ChatPrompt,
        on_chunk: StreamCallback,
    ) -> ProviderResult<ChatOutcome> {
        on_chunk("Water it ");
        on_chunk("weekly.");
        self.chat(prompt).await
    }
}

struct NullEmbed;

#[async_trait]
impl EmbedProvider for NullEmbed {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn embed(&self, texts: &[String]) -> ProviderResult<EmbeddingOutcome> {
        Ok(EmbeddingOutcome {
            vectors: texts.iter().map(|_| vec![0.1f32; 4]).collect(),
            total_tokens: 2,
            model: "text-embedding-3-small".to_string(),
        })
    }
}

async fn test_state(identify_down: bool, dir: &TempDir) -> AppState {
    let repo = Arc::new(SqliteRepository::in_memory().unwrap());
    repo.insert_user(&User {
        id: "user-1".to_string(),
        display_name: "Dana".to_string(),
        experience_level: ExperienceLevel::Beginner,
        city: None,
        climate_zone: None,
        home_type: None,
        light_level: None,
        humidity_level: None,
        tier: Tier::Premium,
    })
    .await
    .unwrap();

    let ledger = Arc::new(UsageLedger::new(repo.clone()));
    let identify_chain: Vec<(
        Arc<dyn IdentifyProvider>,
        Duration,
        String,
    )> = if identify_down {
        vec![(
            Arc::new(DownIdentify),
            Duration::from_secs(1),
            "plant-id-v2".to_string(),
        )]
    } else {
        vec![(
            Arc::new(GoodIdentify),
            Duration::from_secs(1),
            "plant-id-v2".to_string(),
        )]
    };
    let router = Arc::new(AiRouter::with_chains(
        identify_chain,
        vec![],
        vec![ChatLink {
            provider: Arc::new(EchoChat),
            tier: ModelTier::Simple,
            model_label: "claude-haiku-4-5".to_string(),
            timeout: Duration::from_secs(2),
        }],
        vec![],
        vec![(
            Arc::new(NullEmbed),
            Duration::from_secs(1),
            "text-embedding-3-small".to_string(),
        )],
        ledger,
        RetryConfig {
            max_attempts: 1,
            base_delay_ms: 1,
            max_delay_ms: 2,
        },
    ));

    let storage = Arc::new(crate::storage::LocalPhotoStorage::new(
        dir.path(),
        "http://localhost:8080/photos",
        "secret",
    ));
    let windows = Arc::new(SlidingWindowLimiter::new());
    let quotas = Arc::new(QuotaGate::new(QuotaConfig::default(), repo.clone()));

    AppState {
        identify: Arc::new(crate::identify::IdentificationService::new(
            router.clone(),
            repo.clone(),
            storage,
            windows.clone(),
            quotas.clone(),
            0.70,
            Duration::from_secs(3600),
        )),
        health: Arc::new(crate::health::HealthAssessService::new(
            router.clone(),
            repo.clone(),
            windows.clone(),
            quotas.clone(),
        )),
        chat: Arc::new(ChatService::new(
            router.clone(),
            repo.clone(),
            ContextAssembler::new(repo.clone(), router, ContextBudget::default(), 0.7),
            windows,
            quotas,
        )),
        repo,
    }
}

/// Unsigned token with the right shape; verification is upstream.
fn bearer_for(sub: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(json!({"sub": sub}).to_string());
    format!("Bearer {header}.{payload}.sig")
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[test]
fn subject_extraction() {
    let token = bearer_for("user-42");
    let token = token.strip_prefix("Bearer ").unwrap();
    assert_eq!(subject_from_token(token).as_deref(), Some("user-42"));

    assert!(subject_from_token("not-a-jwt").is_none());
    assert!(subject_from_token("a.b").is_none());
    let empty_sub = format!(
        "h.{}.s",
        URL_SAFE_NO_PAD.encode(json!({"sub": ""}).to_string())
    );
    assert!(subject_from_token(&empty_sub).is_none());
}

#[tokio::test]
async fn probes_are_open() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(false, &dir).await);

    for path in ["/health", "/health/ready", "/health/live"] {
        let response = app
            .clone()
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "probe {path}");
    }
}

#[tokio::test]
async fn missing_token_is_401_envelope() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(false, &dir).await);

    let response = app
        .oneshot(
            Request::post("/api/v1/chat")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"message": "hi"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    assert_eq!(body["error"]["path"], "/api/v1/chat");
    assert!(body["error"]["timestamp"].is_string());
}

#[tokio::test]
async fn identify_returns_envelope_with_meta() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(false, &dir).await);

    let response = app
        .oneshot(
            Request::post("/api/v1/identify")
                .header("content-type", "application/json")
                .header("authorization", bearer_for("user-1"))
                .body(Body::from(json!({"images": ["QUJD"]}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["species"]["scientificName"], "epipremnum aureum");
    assert!(body["data"]["species"]["id"].is_string());
    assert_eq!(body["data"]["similarSpecies"], json!([]));
    assert_eq!(body["meta"]["provider"], "plant-id");
    assert!(body["meta"]["processingTimeMs"].is_number());
}

#[tokio::test]
async fn identify_outage_is_503_with_attempted_providers() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(true, &dir).await);

    let response = app
        .oneshot(
            Request::post("/api/v1/identify")
                .header("content-type", "application/json")
                .header("authorization", bearer_for("user-1"))
                .body(Body::from(json!({"images": ["QUJD"]}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "AI_UNAVAILABLE");
    assert_eq!(body["error"]["details"]["attemptedProviders"], json!(["plant-id"]));
}

#[tokio::test]
async fn six_images_fail_validation_with_422() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(false, &dir).await);

    let response = app
        .oneshot(
            Request::post("/api/v1/identify")
                .header("content-type", "application/json")
                .header("authorization", bearer_for("user-1"))
                .body(Body::from(json!({"images": vec!["QUJD"; 6]}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn chat_round_trip() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(false, &dir).await);

    let response = app
        .oneshot(
            Request::post("/api/v1/chat")
                .header("content-type", "application/json")
                .header("authorization", bearer_for("user-1"))
                .body(Body::from(
                    json!({"message": "how often should I water?"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["content"], "Water it weekly.");
    assert!(body["data"]["sessionId"].is_string());
    assert_eq!(body["meta"]["model"], "claude-haiku-4-5");
}

#[tokio::test]
async fn burst_requests_hit_sliding_window() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(false, &dir).await);

    let request = || {
        Request::post("/api/v1/chat")
            .header("content-type", "application/json")
            .header("authorization", bearer_for("user-1"))
            .body(Body::from(r#"{"message": "hi"}"#))
            .unwrap()
    };

    let mut last_status = StatusCode::OK;
    let mut last_response = None;
    for _ in 0..4 {
        let response = app.clone().oneshot(request()).await.unwrap();
        last_status = response.status();
        last_response = Some(response);
    }

    assert_eq!(last_status, StatusCode::TOO_MANY_REQUESTS);
    let response = last_response.unwrap();
    assert!(response.headers().contains_key("retry-after"));
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
}

#[tokio::test]
async fn unknown_user_is_404() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(false, &dir).await);

    let response = app
        .oneshot(
            Request::post("/api/v1/chat")
                .header("content-type", "application/json")
                .header("authorization", bearer_for("ghost"))
                .body(Body::from(r#"{"message": "hi"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
