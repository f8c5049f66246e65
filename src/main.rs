use anyhow::Result;
use leafwise::chat::{ChatService, context::ContextAssembler};
use leafwise::config::load_config;
use leafwise::gateway::{AppState, serve};
use leafwise::health::HealthAssessService;
use leafwise::identify::IdentificationService;
use leafwise::providers::anthropic::AnthropicGateway;
use leafwise::providers::gemini::GeminiGateway;
use leafwise::providers::openai::{OpenAiChatGateway, OpenAiEmbeddingGateway};
use leafwise::providers::plant_id::PlantIdGateway;
use leafwise::repo::sqlite::SqliteRepository;
use leafwise::router::AiRouter;
use leafwise::storage::LocalPhotoStorage;
use leafwise::usage::UsageLedger;
use leafwise::usage::limits::{QuotaGate, SlidingWindowLimiter};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".parse().unwrap());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref().map(Path::new))?;

    let repo = Arc::new(SqliteRepository::open(&config.database.path)?);
    let storage = Arc::new(LocalPhotoStorage::new(
        config.storage.root_dir.clone(),
        config.storage.public_base_url.clone(),
        config.storage.signing_secret.clone(),
    ));

    let providers = &config.providers;
    let plant_id = Arc::new(PlantIdGateway::new(
        providers.plant_id.api_key.clone(),
        providers.plant_id.api_base.clone(),
        providers
            .plant_id
            .timeout_or(leafwise::providers::plant_id::DEFAULT_TIMEOUT_SECS),
    ));
    let gemini = Arc::new(GeminiGateway::new(
        providers.gemini.api_key.clone(),
        providers.gemini.api_base.clone(),
        providers
            .gemini
            .timeout_or(leafwise::providers::gemini::DEFAULT_TIMEOUT_SECS),
    ));
    let mut claude = AnthropicGateway::new(
        providers.anthropic.api_key.clone(),
        providers.anthropic.api_base.clone(),
    );
    if let Some(secs) = providers.anthropic.timeout_secs {
        claude = claude.with_timeouts(
            Duration::from_secs(secs.min(leafwise::providers::anthropic::SIMPLE_TIMEOUT_SECS)),
            Duration::from_secs(secs),
        );
    }
    let claude = Arc::new(claude);
    let openai_chat = Arc::new(OpenAiChatGateway::new(
        providers.openai.api_key.clone(),
        providers.openai.api_base.clone(),
    ));
    let openai_embed = Arc::new(OpenAiEmbeddingGateway::new(
        providers.openai.api_key.clone(),
        providers.openai.api_base.clone(),
    ));

    let ledger = Arc::new(UsageLedger::new(repo.clone()));
    let router = Arc::new(AiRouter::from_gateways(
        plant_id,
        gemini,
        claude,
        openai_chat,
        openai_embed,
        ledger,
        config.retry.clone(),
    ));

    let windows = Arc::new(SlidingWindowLimiter::new());
    let quotas = Arc::new(QuotaGate::new(config.quotas.clone(), repo.clone()));
    let signed_url_ttl = Duration::from_secs(config.storage.signed_url_ttl_secs);

    let state = AppState {
        identify: Arc::new(IdentificationService::new(
            router.clone(),
            repo.clone(),
            storage,
            windows.clone(),
            quotas.clone(),
            config.thresholds.low_confidence,
            signed_url_ttl,
        )),
        health: Arc::new(HealthAssessService::new(
            router.clone(),
            repo.clone(),
            windows.clone(),
            quotas.clone(),
        )),
        chat: Arc::new(ChatService::new(
            router.clone(),
            repo.clone(),
            ContextAssembler::new(
                repo.clone(),
                router,
                config.context_budget.clone(),
                config.thresholds.semantic_search,
            ),
            windows,
            quotas,
        )),
        repo,
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve(listener, state).await
}
