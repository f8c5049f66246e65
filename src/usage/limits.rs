/// Read-side gates over the usage ledger: burst control via concurrent
/// sliding windows, and tier-based monthly quotas. Both decisions happen
/// before any provider call.
use crate::config::QuotaConfig;
use crate::errors::{LeafwiseError, LeafwiseResult};
use crate::model::{Tier, User};
use crate::repo::Repository;
use chrono::{Datelike, TimeZone, Utc};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// (max requests, window length), all enforced concurrently; the first
/// violation short-circuits.
const WINDOWS: [(usize, Duration); 3] = [
    (3, Duration::from_secs(1)),
    (20, Duration::from_secs(10)),
    (100, Duration::from_secs(60)),
];

pub struct SlidingWindowLimiter {
    state: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, user_id: &str, endpoint: &str) -> LeafwiseResult<()> {
        self.check_at(user_id, endpoint, Instant::now())
    }

    fn check_at(&self, user_id: &str, endpoint: &str, now: Instant) -> LeafwiseResult<()> {
        let key = format!("{user_id}:{endpoint}");
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let hits = state.entry(key).or_default();

        let longest = WINDOWS[WINDOWS.len() - 1].1;
        while let Some(front) = hits.front() {
            if now.duration_since(*front) >= longest {
                hits.pop_front();
            } else {
                break;
            }
        }

        for (max, window) in WINDOWS {
            let in_window = hits
                .iter()
                .filter(|t| now.duration_since(**t) < window)
                .count();
            if in_window >= max {
                // Seconds until the oldest hit in this window slides out.
                let oldest = hits
                    .iter()
                    .find(|t| now.duration_since(**t) < window)
                    .copied()
                    .unwrap_or(now);
                let retry_after = window
                    .saturating_sub(now.duration_since(oldest))
                    .as_secs()
                    .max(1);
                return Err(LeafwiseError::RateLimited {
                    retry_after_secs: retry_after,
                });
            }
        }

        hits.push_back(now);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaFeature {
    Identification,
    Health,
    Chat,
}

impl QuotaFeature {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Identification => "identification",
            Self::Health => "health",
            Self::Chat => "chat",
        }
    }

    /// Ledger actions counted toward this feature's quota.
    fn actions(&self) -> &'static [&'static str] {
        match self {
            Self::Identification => &["identification"],
            Self::Health => &["health_assessment"],
            Self::Chat => &["chat_simple", "chat_complex"],
        }
    }
}

pub struct QuotaGate {
    quotas: QuotaConfig,
    repo: Arc<dyn Repository>,
}

impl QuotaGate {
    pub fn new(quotas: QuotaConfig, repo: Arc<dyn Repository>) -> Self {
        Self { quotas, repo }
    }

    /// Enforce the monthly cap for one feature. Premium (sentinel -1)
    /// skips the ledger query entirely.
    pub async fn check(&self, user: &User, feature: QuotaFeature) -> LeafwiseResult<()> {
        let tier_quotas = match user.tier {
            Tier::Free => &self.quotas.free,
            Tier::Premium => &self.quotas.premium,
        };
        let limit = match feature {
            QuotaFeature::Identification => tier_quotas.identification,
            QuotaFeature::Health => tier_quotas.health,
            QuotaFeature::Chat => tier_quotas.chat,
        };
        if limit < 0 {
            return Ok(());
        }

        let used = self
            .repo
            .count_usage_success(&user.id, feature.actions(), month_start())
            .await
            .map_err(LeafwiseError::Internal)?;
        if used >= limit {
            return Err(LeafwiseError::QuotaExceeded {
                feature: feature.label().to_string(),
                used,
                limit,
                resets_at: next_month_start(),
            });
        }
        Ok(())
    }
}

/// First instant of the current calendar month, UTC.
pub fn month_start() -> chrono::DateTime<Utc> {
    let now = Utc::now();
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .expect("first of month is always valid")
}

/// First instant of the next calendar month, UTC (quota reset time).
pub fn next_month_start() -> chrono::DateTime<Utc> {
    let now = Utc::now();
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .expect("first of month is always valid")
}
