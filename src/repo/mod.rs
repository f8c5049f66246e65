/// Narrow persistence interface consumed by the core. The relational
/// engine behind it is an external collaborator; the bundled adapter in
/// `sqlite` ports the fixed schema onto SQLite for tests and single-node
/// deployments.
pub mod sqlite;

use crate::model::{
    ConversationSession, HealthIssue, IssueStatus, MessageRecord, Plant, PlantPhoto, Reminder,
    SemanticMemory, Species, TreatmentStep, UsageLogEntry, User,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Outcome of a species insert attempt. The unique index on the
/// normalized scientific name turns insert races into `DuplicateName`,
/// letting the loser re-read and enrich instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeciesInsert {
    Inserted,
    DuplicateName,
}

/// A semantic memory scored against a query embedding. `relevance` is the
/// stored score with lazy time decay applied at read.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub memory: SemanticMemory,
    pub similarity: f64,
    pub relevance: f64,
}

/// One chat exchange persisted atomically: both messages plus the session
/// aggregate update happen in a single transaction.
#[derive(Debug, Clone)]
pub struct ExchangeWrite {
    pub session_id: String,
    pub user_message: MessageRecord,
    pub assistant_message: MessageRecord,
    pub cost_usd: f64,
    pub model: String,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn ping(&self) -> Result<()>;

    // users (created externally; the core reads and cascades deletes)
    async fn insert_user(&self, user: &User) -> Result<()>;
    async fn get_user(&self, user_id: &str) -> Result<Option<User>>;
    async fn delete_user(&self, user_id: &str) -> Result<()>;

    // species
    async fn find_species_by_name(&self, normalized_name: &str) -> Result<Option<Species>>;
    async fn insert_species(&self, species: &Species) -> Result<SpeciesInsert>;
    async fn update_species(&self, species: &Species) -> Result<()>;

    // plants
    async fn insert_plant(&self, plant: &Plant) -> Result<()>;
    async fn get_plant(&self, plant_id: &str, user_id: &str) -> Result<Option<Plant>>;
    async fn update_plant(&self, plant: &Plant) -> Result<()>;
    /// Deletes the plant and its owned issues and reminders; sessions are
    /// detached (plant reference nulled), never deleted.
    async fn delete_plant(&self, plant_id: &str, user_id: &str) -> Result<()>;

    // health issues
    async fn insert_issue(&self, issue: &HealthIssue, steps: &[TreatmentStep]) -> Result<()>;
    async fn issues_for_plant(
        &self,
        plant_id: &str,
        statuses: &[IssueStatus],
        limit: usize,
    ) -> Result<Vec<HealthIssue>>;
    /// Applies the issue lifecycle; an illegal transition is an error.
    async fn update_issue_status(&self, issue_id: &str, next: IssueStatus) -> Result<()>;

    // sessions and messages
    async fn insert_session(&self, session: &ConversationSession) -> Result<()>;
    async fn get_session(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<ConversationSession>>;
    /// Most recent messages first; callers re-order as needed.
    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<MessageRecord>>;
    async fn append_exchange(&self, write: &ExchangeWrite) -> Result<()>;

    // semantic memories
    async fn insert_memory(&self, memory: &SemanticMemory) -> Result<()>;
    async fn search_memories(
        &self,
        user_id: &str,
        query: &[f32],
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<ScoredMemory>>;

    // usage ledger
    async fn append_usage(&self, entry: &UsageLogEntry) -> Result<()>;
    async fn count_usage_success(
        &self,
        user_id: &str,
        actions: &[&str],
        since: DateTime<Utc>,
    ) -> Result<i64>;

    // photos
    async fn insert_photo(&self, photo: &PlantPhoto) -> Result<()>;

    // reminders
    async fn insert_reminder(&self, reminder: &Reminder) -> Result<()>;
    async fn get_reminder(&self, reminder_id: &str, user_id: &str) -> Result<Option<Reminder>>;
    async fn mark_reminder_done(&self, reminder_id: &str, skipped: bool) -> Result<()>;
}
