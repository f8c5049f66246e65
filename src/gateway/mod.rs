/// HTTP surface: `/api/v1` endpoints over the identification, health,
/// and chat pipelines, plus unauthenticated liveness probes. Responses
/// use the success/error envelope; errors map one-to-one from the typed
/// error hierarchy.
///
/// Token verification is an external collaborator's job: the bearer
/// token's claims are opaque here except for the subject, which is the
/// user id.
use crate::chat::{ChatRequest, ChatService, ChatStreamEvent};
use crate::errors::LeafwiseError;
use crate::health::{HealthAssessRequest, HealthAssessService};
use crate::identify::{IdentificationService, IdentifyRequest};
use crate::repo::Repository;
use axum::extract::{FromRequestParts, OriginalUri, State};
use axum::http::{StatusCode, request::Parts};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(15);
const CHAT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub identify: Arc<IdentificationService>,
    pub health: Arc<HealthAssessService>,
    pub chat: Arc<ChatService>,
    pub repo: Arc<dyn Repository>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/identify", post(identify_handler))
        .route("/api/v1/health/assess", post(health_assess_handler))
        .route("/api/v1/chat", post(chat_handler))
        .route("/api/v1/chat/stream", post(chat_stream_handler))
        .route("/health", get(health_handler))
        .route("/health/ready", get(ready_handler))
        .route("/health/live", get(live_handler))
        .with_state(state)
}

pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

// --- envelope ---

fn success(data: Value, meta: Option<Value>) -> Json<Value> {
    let mut body = json!({"success": true, "data": data});
    if let Some(meta) = meta {
        body["meta"] = meta;
    }
    Json(body)
}

/// A pipeline error bound to the request path, rendered as the error
/// envelope with the matching status code.
pub struct ApiError {
    error: LeafwiseError,
    path: String,
}

impl ApiError {
    fn new(error: LeafwiseError, path: &OriginalUri) -> Self {
        Self {
            error,
            path: path.path().to_string(),
        }
    }

    fn details(&self) -> Option<Value> {
        match &self.error {
            LeafwiseError::QuotaExceeded {
                feature,
                used,
                limit,
                resets_at,
            } => Some(json!({
                "feature": feature,
                "used": used,
                "limit": limit,
                "resetsAt": resets_at.to_rfc3339(),
            })),
            LeafwiseError::AiUnavailable { attempted, .. } => Some(json!({
                "attemptedProviders": attempted,
            })),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        // internal details never reach the client
        let message = match &self.error {
            LeafwiseError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        let mut error_body = json!({
            "code": self.error.code(),
            "message": message,
            "timestamp": Utc::now().to_rfc3339(),
            "path": self.path,
        });
        if let Some(details) = self.details() {
            error_body["details"] = details;
        }
        let body = Json(json!({"success": false, "error": error_body}));

        let mut response = (status, body).into_response();
        if let LeafwiseError::RateLimited { retry_after_secs } = self.error
            && let Ok(value) = axum::http::HeaderValue::from_str(&retry_after_secs.to_string())
        {
            response.headers_mut().insert("retry-after", value);
        }
        response
    }
}

// --- auth ---

/// Authenticated user id, extracted from the bearer token's `sub` claim.
pub struct AuthUser(pub String);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let path = parts.uri.path().to_string();
        let reject = |message: &str| ApiError {
            error: LeafwiseError::Unauthorized(message.to_string()),
            path: path.clone(),
        };

        let header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| reject("missing bearer token"))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| reject("malformed authorization header"))?;

        match subject_from_token(token) {
            Some(sub) => Ok(AuthUser(sub)),
            None => Err(reject("invalid token")),
        }
    }
}

/// Pull the `sub` claim out of a JWT payload without interpreting any
/// other claim. Signature verification happens upstream.
fn subject_from_token(token: &str) -> Option<String> {
    let mut segments = token.split('.');
    let (_header, payload) = (segments.next()?, segments.next()?);
    segments.next()?; // signature segment must exist

    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: Value = serde_json::from_slice(&decoded).ok()?;
    claims["sub"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// --- request bodies ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentifyBody {
    images: Vec<String>,
    #[serde(default)]
    add_to_collection: bool,
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default)]
    location_in_home: Option<String>,
    #[serde(default)]
    light_exposure: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    plant_id: String,
    images: Vec<String>,
    #[serde(default)]
    symptoms_description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatBody {
    #[serde(default)]
    session_id: Option<String>,
    message: String,
    #[serde(default)]
    plant_id: Option<String>,
}

// --- handlers ---

async fn with_deadline<T>(
    deadline: Duration,
    uri: &OriginalUri,
    work: impl Future<Output = Result<T, ApiError>>,
) -> Result<T, ApiError> {
    match tokio::time::timeout(deadline, work).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::new(
            LeafwiseError::Internal(anyhow::anyhow!("request deadline exceeded")),
            uri,
        )),
    }
}

async fn identify_handler(
    State(state): State<AppState>,
    uri: OriginalUri,
    AuthUser(user_id): AuthUser,
    Json(body): Json<IdentifyBody>,
) -> Result<Json<Value>, ApiError> {
    let request = IdentifyRequest {
        images: body.images,
        add_to_collection: body.add_to_collection,
        nickname: body.nickname,
        location_in_home: body.location_in_home,
        light_exposure: body.light_exposure,
    };
    let cancel = CancellationToken::new();
    let response = with_deadline(IDENTIFY_TIMEOUT, &uri, async {
        state
            .identify
            .run(&user_id, request, &cancel)
            .await
            .map_err(|e| ApiError::new(e, &uri))
    })
    .await?;

    let meta = json!({
        "provider": response.provider,
        "processingTimeMs": response.processing_time_ms,
    });
    Ok(success(
        serde_json::to_value(&response).unwrap_or_default(),
        Some(meta),
    ))
}

async fn health_assess_handler(
    State(state): State<AppState>,
    uri: OriginalUri,
    AuthUser(user_id): AuthUser,
    Json(body): Json<HealthBody>,
) -> Result<Json<Value>, ApiError> {
    let request = HealthAssessRequest {
        plant_id: body.plant_id,
        images: body.images,
        symptoms_description: body.symptoms_description,
    };
    let cancel = CancellationToken::new();
    let response = with_deadline(HEALTH_TIMEOUT, &uri, async {
        state
            .health
            .run(&user_id, request, &cancel)
            .await
            .map_err(|e| ApiError::new(e, &uri))
    })
    .await?;

    let meta = json!({
        "provider": response.provider,
        "processingTimeMs": response.processing_time_ms,
    });
    Ok(success(
        serde_json::to_value(&response).unwrap_or_default(),
        Some(meta),
    ))
}

async fn chat_handler(
    State(state): State<AppState>,
    uri: OriginalUri,
    AuthUser(user_id): AuthUser,
    Json(body): Json<ChatBody>,
) -> Result<Json<Value>, ApiError> {
    let request = ChatRequest {
        session_id: body.session_id,
        message: body.message,
        plant_id: body.plant_id,
    };
    let cancel = CancellationToken::new();
    let response = with_deadline(CHAT_TIMEOUT, &uri, async {
        state
            .chat
            .run(&user_id, request, &cancel)
            .await
            .map_err(|e| ApiError::new(e, &uri))
    })
    .await?;

    let meta = json!({
        "provider": response.provider,
        "model": response.model,
        "processingTimeMs": response.processing_time_ms,
    });
    Ok(success(
        serde_json::to_value(&response).unwrap_or_default(),
        Some(meta),
    ))
}

fn to_sse_event(event: ChatStreamEvent) -> Event {
    match event {
        ChatStreamEvent::Start { session_id } => Event::default()
            .event("start")
            .data(json!({"sessionId": session_id}).to_string()),
        ChatStreamEvent::Chunk { text } => Event::default()
            .event("chunk")
            .data(json!({"text": text}).to_string()),
        ChatStreamEvent::Done { response } => Event::default().event("done").data(
            json!({
                "success": true,
                "data": serde_json::to_value(&response).unwrap_or_default(),
            })
            .to_string(),
        ),
        ChatStreamEvent::Error { code, message } => Event::default()
            .event("error")
            .data(json!({"code": code, "message": message}).to_string()),
    }
}

async fn chat_stream_handler(
    State(state): State<AppState>,
    uri: OriginalUri,
    AuthUser(user_id): AuthUser,
    Json(body): Json<ChatBody>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let request = ChatRequest {
        session_id: body.session_id,
        message: body.message,
        plant_id: body.plant_id,
    };
    let cancel = CancellationToken::new();
    let rx = state
        .chat
        .run_stream(&user_id, request, cancel.clone())
        .await
        .map_err(|e| ApiError::new(e, &uri))?;

    // dropping the stream (client gone) cancels the producer task
    let guard = cancel.drop_guard();
    let stream = futures_util::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        rx.recv()
            .await
            .map(|event| (Ok::<_, Infallible>(to_sse_event(event)), (rx, guard)))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// --- probes (never auth-gated) ---

async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok", "version": crate::VERSION}))
}

async fn live_handler() -> StatusCode {
    StatusCode::OK
}

async fn ready_handler(State(state): State<AppState>) -> Response {
    match state.repo.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ready"}))).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable", "message": e.to_string()})),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests;
