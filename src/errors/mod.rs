use chrono::{DateTime, Utc};
use thiserror::Error;

/// Typed error hierarchy for leafwise.
///
/// Use at module boundaries (pipelines, router, repository, gateway).
/// Internal/leaf functions can continue using `anyhow::Result` — the
/// `Internal` variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum LeafwiseError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{message}")]
    BadRequest { code: &'static str, message: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Monthly quota for a feature is exhausted (maps to 402).
    #[error("Monthly limit reached for {feature}: {used}/{limit}")]
    QuotaExceeded {
        feature: String,
        used: i64,
        limit: i64,
        resets_at: DateTime<Utc>,
    },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Sliding-window request cap hit (maps to 429).
    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    /// Every provider in the chain failed (maps to 503).
    #[error("AI providers unavailable: {message}")]
    AiUnavailable {
        attempted: Vec<String>,
        message: String,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type LeafwiseResult<T> = std::result::Result<T, LeafwiseError>;

impl LeafwiseError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }

    /// Machine-readable error code for the wire envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::BadRequest { code, .. } => code,
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::QuotaExceeded { .. } => "LIMIT_EXCEEDED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            Self::AiUnavailable { .. } => "AI_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 422,
            Self::BadRequest { .. } => 400,
            Self::Unauthorized(_) => 401,
            Self::QuotaExceeded { .. } => 402,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::RateLimited { .. } => 429,
            Self::AiUnavailable { .. } => 503,
            Self::Internal(_) => 500,
        }
    }
}
