/// Context assembly for chat: four concurrent fetches (user, plant,
/// history, semantic memories) joined under a token budget. Sections
/// trim from their low-priority end; a section whose provider dependency
/// is down degrades to empty, while repository failures are fatal.
use crate::config::ContextBudget;
use crate::errors::{LeafwiseError, LeafwiseResult};
use crate::model::{HealthIssue, IssueStatus, MessageRole, Plant, User};
use crate::repo::{Repository, ScoredMemory};
use crate::router::{AiRouter, RouteMeta};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const HISTORY_MESSAGES: usize = 10;
const MEMORY_LIMIT: usize = 5;
const ISSUE_LIMIT: usize = 3;

/// Deliberately approximate token estimator: ceil(chars / 4).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Truncate to a token budget, keeping the front of the text.
fn truncate_to_budget(text: &str, budget_tokens: usize) -> String {
    let max_chars = budget_tokens * 4;
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

#[derive(Debug, Clone)]
pub struct HistoryTurn {
    pub role: MessageRole,
    pub content: String,
}

/// Counts of what survived the budget, echoed back to the client.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUsed {
    pub user_facts: bool,
    pub plant_facts: bool,
    pub history_messages: usize,
    pub memories: usize,
}

#[derive(Debug, Clone)]
pub struct ContextBundle {
    pub user_section: String,
    pub plant_section: String,
    /// Oldest-to-newest, already trimmed to budget.
    pub history: Vec<HistoryTurn>,
    pub memory_section: String,
    pub plant: Option<Plant>,
    pub issues: Vec<HealthIssue>,
    pub used: ContextUsed,
}

pub struct ContextAssembler {
    repo: Arc<dyn Repository>,
    router: Arc<AiRouter>,
    budget: ContextBudget,
    semantic_threshold: f64,
}

impl ContextAssembler {
    pub fn new(
        repo: Arc<dyn Repository>,
        router: Arc<AiRouter>,
        budget: ContextBudget,
        semantic_threshold: f64,
    ) -> Self {
        Self {
            repo,
            router,
            budget,
            semantic_threshold,
        }
    }

    pub async fn assemble(
        &self,
        user: &User,
        query: &str,
        plant_id: Option<&str>,
        session_id: Option<&str>,
        meta: &RouteMeta,
        cancel: &CancellationToken,
    ) -> LeafwiseResult<ContextBundle> {
        let (plant_result, history_result, memories_result) = tokio::join!(
            self.fetch_plant(user, plant_id),
            self.fetch_history(session_id),
            self.fetch_memories(user, query, meta, cancel),
        );

        let (plant, issues) = plant_result?;
        let history = history_result?;
        let memories = memories_result?;

        let user_section = truncate_to_budget(&render_user_facts(user), self.budget.user);
        let plant_section = match &plant {
            Some(plant) => truncate_to_budget(
                &render_plant_facts(plant, &issues),
                self.budget.plant,
            ),
            None => String::new(),
        };
        let history = trim_history(history, self.budget.history);
        let memory_section = render_memories(&memories, self.budget.memories);
        let memories_kept = memory_section.lines().filter(|l| l.starts_with("- ")).count();

        let used = ContextUsed {
            user_facts: !user_section.is_empty(),
            plant_facts: !plant_section.is_empty(),
            history_messages: history.len(),
            memories: memories_kept,
        };

        Ok(ContextBundle {
            user_section,
            plant_section,
            history,
            memory_section,
            plant,
            issues,
            used,
        })
    }

    async fn fetch_plant(
        &self,
        user: &User,
        plant_id: Option<&str>,
    ) -> LeafwiseResult<(Option<Plant>, Vec<HealthIssue>)> {
        let Some(plant_id) = plant_id else {
            return Ok((None, Vec::new()));
        };
        let plant = self
            .repo
            .get_plant(plant_id, &user.id)
            .await
            .map_err(LeafwiseError::Internal)?;
        let Some(plant) = plant else {
            return Err(LeafwiseError::NotFound(format!("plant {plant_id}")));
        };
        let issues = self
            .repo
            .issues_for_plant(
                &plant.id,
                &[IssueStatus::Active, IssueStatus::Treating],
                ISSUE_LIMIT,
            )
            .await
            .map_err(LeafwiseError::Internal)?;
        Ok((Some(plant), issues))
    }

    async fn fetch_history(&self, session_id: Option<&str>) -> LeafwiseResult<Vec<HistoryTurn>> {
        let Some(session_id) = session_id else {
            return Ok(Vec::new());
        };
        let mut messages = self
            .repo
            .recent_messages(session_id, HISTORY_MESSAGES)
            .await
            .map_err(LeafwiseError::Internal)?;
        // repository returns newest first
        messages.reverse();
        Ok(messages
            .into_iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| HistoryTurn {
                role: m.role,
                content: m.content,
            })
            .collect())
    }

    /// Embedding outage yields an empty section; repository failures
    /// propagate.
    async fn fetch_memories(
        &self,
        user: &User,
        query: &str,
        meta: &RouteMeta,
        cancel: &CancellationToken,
    ) -> LeafwiseResult<Vec<ScoredMemory>> {
        let embedded = match self
            .router
            .embed(meta, cancel, &[query.to_string()])
            .await
        {
            Ok(routed) => routed,
            Err(e) => {
                warn!("memory retrieval degraded, embedding unavailable: {e}");
                return Ok(Vec::new());
            }
        };
        let Some(vector) = embedded.value.vectors.first() else {
            return Ok(Vec::new());
        };
        self.repo
            .search_memories(&user.id, vector, MEMORY_LIMIT, self.semantic_threshold)
            .await
            .map_err(LeafwiseError::Internal)
    }
}

fn render_user_facts(user: &User) -> String {
    let mut lines = vec![format!(
        "Gardener: {} ({} level)",
        user.display_name,
        user.experience_level.as_str()
    )];
    if let Some(city) = &user.city {
        lines.push(format!("Location: {city}"));
    }
    if let Some(zone) = &user.climate_zone {
        lines.push(format!("Climate zone: {zone}"));
    }
    if let Some(home) = &user.home_type {
        lines.push(format!("Home: {home}"));
    }
    if let Some(light) = &user.light_level {
        lines.push(format!("Typical light: {light}"));
    }
    if let Some(humidity) = &user.humidity_level {
        lines.push(format!("Typical humidity: {humidity}"));
    }
    lines.join("\n")
}

fn render_plant_facts(plant: &Plant, issues: &[HealthIssue]) -> String {
    let mut lines = vec![format!(
        "Plant: {} (health: {}, location: {}, light: {})",
        plant.nickname.as_deref().unwrap_or("unnamed"),
        plant.current_health.as_str(),
        plant.location_in_home,
        plant.light_exposure
    )];
    lines.push(format!(
        "Watering: every {} days{}",
        plant.watering_frequency_days,
        plant
            .last_watered
            .map(|t| format!(", last watered {}", t.format("%Y-%m-%d")))
            .unwrap_or_default()
    ));
    for issue in issues {
        lines.push(format!(
            "Issue ({}): {}: {}",
            issue.status.as_str(),
            issue.title,
            issue.description
        ));
    }
    lines.join("\n")
}

/// Drop oldest messages until within budget, then hard-truncate the
/// oldest surviving message if a single one still overflows.
fn trim_history(mut history: Vec<HistoryTurn>, budget_tokens: usize) -> Vec<HistoryTurn> {
    let total = |turns: &[HistoryTurn]| -> usize {
        turns.iter().map(|t| estimate_tokens(&t.content)).sum()
    };
    while history.len() > 1 && total(&history) > budget_tokens {
        history.remove(0);
    }
    if total(&history) > budget_tokens
        && let Some(first) = history.first_mut()
    {
        first.content = truncate_to_budget(&first.content, budget_tokens);
    }
    history
}

/// Memories arrive ordered by similarity; drop the lowest-similarity
/// tail until within budget.
fn render_memories(memories: &[ScoredMemory], budget_tokens: usize) -> String {
    if memories.is_empty() {
        return String::new();
    }
    let header = "Relevant past notes:";
    let mut kept: Vec<String> = memories
        .iter()
        .map(|m| format!("- {}", m.memory.content))
        .collect();
    loop {
        let body = kept.join("\n");
        let text = format!("{header}\n{body}");
        if estimate_tokens(&text) <= budget_tokens || kept.len() <= 1 {
            return if kept.is_empty() { String::new() } else { text };
        }
        kept.pop();
    }
}
