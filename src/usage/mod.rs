/// Usage & cost ledger: every provider attempt-set writes exactly one
/// record, priced at record time from a constant table. Writes are
/// fire-and-forget from the caller's perspective: failures go to the log,
/// never masking the router's result.
pub mod limits;

use crate::model::UsageLogEntry;
use crate::repo::Repository;
use std::sync::Arc;
use tracing::warn;

/// Flat fee per identification call, and per-1K-token linear fees for
/// LLM and embedding models. Unknown pairs cost nothing rather than
/// failing the write.
pub fn cost_usd(
    provider: &str,
    model: &str,
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
) -> f64 {
    let per_1k = |tokens: Option<i64>, rate: f64| -> f64 {
        tokens.map_or(0.0, |t| (t.max(0) as f64 / 1000.0) * rate)
    };

    match (provider, model) {
        ("plant-id", _) => 0.05,
        ("gemini", _) => 0.01,
        ("claude", m) if m.starts_with("claude-haiku") => {
            per_1k(input_tokens, 0.0008) + per_1k(output_tokens, 0.004)
        }
        ("claude", m) if m.starts_with("claude-sonnet") => {
            per_1k(input_tokens, 0.003) + per_1k(output_tokens, 0.015)
        }
        ("openai", "text-embedding-3-small") => per_1k(input_tokens, 0.00002),
        ("openai", _) => per_1k(input_tokens, 0.00015) + per_1k(output_tokens, 0.0006),
        _ => 0.0,
    }
}

pub struct UsageLedger {
    repo: Arc<dyn Repository>,
}

impl UsageLedger {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Append one ledger row. A failed write is logged and swallowed.
    pub async fn record(&self, entry: UsageLogEntry) {
        if let Err(e) = self.repo.append_usage(&entry).await {
            warn!(
                "usage log write failed for user={} action={} provider={}: {}",
                entry.user_id, entry.action, entry.provider, e
            );
        }
    }
}
