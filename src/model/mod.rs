/// Domain entities shared by the pipelines, repository, and HTTP surface.
///
/// Enum values serialize as lowercase strings both on the wire and in the
/// repository, so `as_str`/`parse` are the single source of truth for names.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(
    /// Subscription tier controlling monthly quota limits.
    Tier {
        Free => "free",
        Premium => "premium",
    }
);

string_enum!(
    ExperienceLevel {
        Beginner => "beginner",
        Intermediate => "intermediate",
        Advanced => "advanced",
    }
);

string_enum!(
    Difficulty {
        Easy => "easy",
        Moderate => "moderate",
        Hard => "hard",
    }
);

string_enum!(
    PlantHealth {
        Thriving => "thriving",
        Healthy => "healthy",
        Struggling => "struggling",
        Critical => "critical",
    }
);

string_enum!(
    /// Lifecycle of a diagnosed health issue.
    /// `resolved` is terminal; `recurring` may flip back to `active` on re-report.
    IssueStatus {
        Active => "active",
        Treating => "treating",
        Resolved => "resolved",
        Recurring => "recurring",
    }
);

string_enum!(
    MessageRole {
        User => "user",
        Assistant => "assistant",
        System => "system",
    }
);

string_enum!(
    MemoryKind {
        Conversation => "conversation",
        Diagnosis => "diagnosis",
        Advice => "advice",
        Outcome => "outcome",
    }
);

string_enum!(
    PhotoKind {
        Identification => "identification",
        Health => "health",
        Progress => "progress",
    }
);

impl IssueStatus {
    /// Whether a transition to `next` is allowed by the issue lifecycle.
    pub fn can_transition_to(&self, next: IssueStatus) -> bool {
        use IssueStatus::{Active, Recurring, Resolved, Treating};
        matches!(
            (self, next),
            (Active, Treating) | (Treating, Resolved) | (Treating, Recurring) | (Recurring, Active)
        )
    }
}

/// Created and owned externally; the core only reads users.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub display_name: String,
    pub experience_level: ExperienceLevel,
    pub city: Option<String>,
    pub climate_zone: Option<String>,
    pub home_type: Option<String>,
    pub light_level: Option<String>,
    pub humidity_level: Option<String>,
    pub tier: Tier,
}

/// Canonical species record. Exactly one row per normalized scientific name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Species {
    pub id: String,
    /// Stored normalized: lowercase, trimmed, single-spaced.
    pub scientific_name: String,
    pub common_names: Vec<String>,
    pub family: String,
    pub genus: String,
    pub care_light: String,
    pub care_water: String,
    pub care_humidity: String,
    pub care_temperature: String,
    pub difficulty: Difficulty,
    pub toxicity: Option<String>,
    pub description: Option<String>,
    pub plant_id_species_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plant {
    pub id: String,
    pub user_id: String,
    pub species_id: String,
    pub nickname: Option<String>,
    pub location_in_home: String,
    pub light_exposure: String,
    pub watering_frequency_days: i64,
    pub last_watered: Option<DateTime<Utc>>,
    pub next_water_due: Option<DateTime<Utc>>,
    pub current_health: PlantHealth,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthIssue {
    pub id: String,
    pub plant_id: String,
    pub title: String,
    pub description: String,
    pub confidence: f64,
    pub status: IssueStatus,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreatmentStep {
    pub id: String,
    pub issue_id: String,
    pub step_order: i64,
    pub instruction: String,
    pub completed: bool,
}

/// Per-user chat thread. `plant_id` is a detachable back-reference:
/// deleting the plant nullifies it without touching the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSession {
    pub id: String,
    pub user_id: String,
    pub plant_id: Option<String>,
    pub message_count: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub estimated_cost_usd: f64,
    pub models_used: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub model: Option<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Embedding + excerpt pair used for retrieval-augmented chat context.
#[derive(Debug, Clone)]
pub struct SemanticMemory {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub content_type: MemoryKind,
    pub embedding: Vec<f32>,
    pub relevance_score: f64,
    pub source_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub id: String,
    pub user_id: String,
    pub plant_id: String,
    pub kind: String,
    pub due_date: DateTime<Utc>,
    /// Recurrence unit in days (e.g. 1 = days, 7 = weeks), together with
    /// `interval` giving `due + interval * frequency` for the next instance.
    pub frequency_days: Option<i64>,
    pub interval: Option<i64>,
    pub completed: bool,
    pub skipped: bool,
}

impl Reminder {
    pub fn is_recurring(&self) -> bool {
        matches!((self.frequency_days, self.interval), (Some(f), Some(i)) if f > 0 && i > 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlantPhoto {
    pub id: String,
    pub user_id: String,
    pub plant_id: Option<String>,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub kind: PhotoKind,
    pub created_at: DateTime<Utc>,
}

/// Append-only record of one provider attempt-set, the source of truth
/// for cost accounting and quota enforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLogEntry {
    pub id: String,
    pub user_id: String,
    pub action: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub latency_ms: i64,
    pub success: bool,
    pub error_code: Option<String>,
    pub cost_usd: f64,
    pub endpoint: String,
    pub created_at: DateTime<Utc>,
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests;
