/// SQLite-backed repository adapter. Single connection behind a mutex,
/// WAL mode, foreign keys on. Embeddings are little-endian f32 BLOBs
/// ranked by brute-force cosine at query time, standing in for an ANN
/// index on deployments that have one.
use crate::memory::{
    RELEVANCE_HALF_LIFE_DAYS, cosine_similarity, deserialize_embedding, relevance_decay,
    serialize_embedding,
};
use crate::model::{
    ConversationSession, Difficulty, ExperienceLevel, HealthIssue, IssueStatus, MemoryKind,
    MessageRecord, MessageRole, Plant, PlantHealth, PlantPhoto, Reminder, SemanticMemory, Species,
    Tier, TreatmentStep, UsageLogEntry, User,
};
use crate::repo::{ExchangeWrite, Repository, ScoredMemory, SpeciesInsert};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

fn to_sql_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn from_sql_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid timestamp in database: {raw}"))?
        .with_timezone(&Utc))
}

fn to_json_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

fn from_json_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn parse_enum<T>(raw: &str, parse: impl Fn(&str) -> Option<T>, what: &str) -> Result<T> {
    parse(raw).with_context(|| format!("invalid {what} in database: {raw}"))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl SqliteRepository {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory: {}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;
             PRAGMA foreign_keys=ON;",
        )?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.ensure_schema()?;
        Ok(repo)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                experience_level TEXT NOT NULL,
                city TEXT,
                climate_zone TEXT,
                home_type TEXT,
                light_level TEXT,
                humidity_level TEXT,
                tier TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS species (
                id TEXT PRIMARY KEY,
                scientific_name TEXT NOT NULL,
                common_names TEXT NOT NULL DEFAULT '[]',
                family TEXT NOT NULL,
                genus TEXT NOT NULL,
                care_light TEXT NOT NULL,
                care_water TEXT NOT NULL,
                care_humidity TEXT NOT NULL,
                care_temperature TEXT NOT NULL,
                difficulty TEXT NOT NULL,
                toxicity TEXT,
                description TEXT,
                plant_id_species_id TEXT
            );
            -- names are stored pre-normalized (lowercase, single-spaced),
            -- so the unique index doubles as the case-insensitive guard
            CREATE UNIQUE INDEX IF NOT EXISTS idx_species_name
                ON species(scientific_name);

            CREATE TABLE IF NOT EXISTS plants (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                species_id TEXT NOT NULL REFERENCES species(id),
                nickname TEXT,
                location_in_home TEXT NOT NULL,
                light_exposure TEXT NOT NULL,
                watering_frequency_days INTEGER NOT NULL,
                last_watered TEXT,
                next_water_due TEXT,
                current_health TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_plants_user ON plants(user_id);
            CREATE INDEX IF NOT EXISTS idx_plants_user_health
                ON plants(user_id, current_health);
            CREATE INDEX IF NOT EXISTS idx_plants_user_water
                ON plants(user_id, next_water_due);

            CREATE TABLE IF NOT EXISTS health_issues (
                id TEXT PRIMARY KEY,
                plant_id TEXT NOT NULL REFERENCES plants(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                confidence REAL NOT NULL,
                status TEXT NOT NULL,
                reported_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS treatment_steps (
                id TEXT PRIMARY KEY,
                issue_id TEXT NOT NULL REFERENCES health_issues(id) ON DELETE CASCADE,
                step_order INTEGER NOT NULL,
                instruction TEXT NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                plant_id TEXT,
                message_count INTEGER NOT NULL DEFAULT 0,
                total_input_tokens INTEGER NOT NULL DEFAULT 0,
                total_output_tokens INTEGER NOT NULL DEFAULT 0,
                estimated_cost_usd REAL NOT NULL DEFAULT 0,
                models_used TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                input_tokens INTEGER,
                output_tokens INTEGER,
                model TEXT,
                action_items TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session
                ON messages(session_id, created_at);

            CREATE TABLE IF NOT EXISTS semantic_memories (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                content TEXT NOT NULL,
                content_type TEXT NOT NULL,
                embedding BLOB NOT NULL,
                relevance_score REAL NOT NULL,
                source_session_id TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reminders (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                plant_id TEXT NOT NULL REFERENCES plants(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                due_date TEXT NOT NULL,
                frequency_days INTEGER,
                recur_interval INTEGER,
                completed INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_reminders_user
                ON reminders(user_id, completed, due_date);

            CREATE TABLE IF NOT EXISTS usage_logs (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                action TEXT NOT NULL,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                input_tokens INTEGER,
                output_tokens INTEGER,
                latency_ms INTEGER NOT NULL,
                success INTEGER NOT NULL,
                error_code TEXT,
                cost_usd REAL NOT NULL,
                endpoint TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usage_user_action
                ON usage_logs(user_id, action, created_at);

            CREATE TABLE IF NOT EXISTS plant_photos (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                plant_id TEXT,
                url TEXT NOT NULL,
                thumbnail_url TEXT,
                kind TEXT NOT NULL,
                created_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn row_to_species(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Species, String)> {
        let difficulty: String = row.get("difficulty")?;
        let common_names: String = row.get("common_names")?;
        Ok((
            Species {
                id: row.get("id")?,
                scientific_name: row.get("scientific_name")?,
                common_names: from_json_list(&common_names),
                family: row.get("family")?,
                genus: row.get("genus")?,
                care_light: row.get("care_light")?,
                care_water: row.get("care_water")?,
                care_humidity: row.get("care_humidity")?,
                care_temperature: row.get("care_temperature")?,
                difficulty: Difficulty::Moderate, // patched below from raw text
                toxicity: row.get("toxicity")?,
                description: row.get("description")?,
                plant_id_species_id: row.get("plant_id_species_id")?,
            },
            difficulty,
        ))
    }

    fn row_to_plant(row: &rusqlite::Row<'_>) -> Result<Plant> {
        let last_watered: Option<String> = row.get("last_watered")?;
        let next_water_due: Option<String> = row.get("next_water_due")?;
        let health: String = row.get("current_health")?;
        let created_at: String = row.get("created_at")?;
        Ok(Plant {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            species_id: row.get("species_id")?,
            nickname: row.get("nickname")?,
            location_in_home: row.get("location_in_home")?,
            light_exposure: row.get("light_exposure")?,
            watering_frequency_days: row.get("watering_frequency_days")?,
            last_watered: last_watered.as_deref().map(from_sql_ts).transpose()?,
            next_water_due: next_water_due.as_deref().map(from_sql_ts).transpose()?,
            current_health: parse_enum(&health, PlantHealth::parse, "plant health")?,
            created_at: from_sql_ts(&created_at)?,
        })
    }

    /// Full ledger for one user, oldest first. Inherent (not part of the
    /// Repository trait): used by operational tooling and tests.
    pub fn usage_log(&self, user_id: &str) -> Result<Vec<UsageLogEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM usage_logs WHERE user_id = ?1 ORDER BY created_at, rowid",
        )?;
        let mut rows = stmt.query(params![user_id])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let created_at: String = row.get("created_at")?;
            entries.push(UsageLogEntry {
                id: row.get("id")?,
                user_id: row.get("user_id")?,
                action: row.get("action")?,
                provider: row.get("provider")?,
                model: row.get("model")?,
                input_tokens: row.get("input_tokens")?,
                output_tokens: row.get("output_tokens")?,
                latency_ms: row.get("latency_ms")?,
                success: row.get("success")?,
                error_code: row.get("error_code")?,
                cost_usd: row.get("cost_usd")?,
                endpoint: row.get("endpoint")?,
                created_at: from_sql_ts(&created_at)?,
            });
        }
        Ok(entries)
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRecord> {
        let role: String = row.get("role")?;
        let action_items: String = row.get("action_items")?;
        let created_at: String = row.get("created_at")?;
        Ok(MessageRecord {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            role: parse_enum(&role, MessageRole::parse, "message role")?,
            content: row.get("content")?,
            input_tokens: row.get("input_tokens")?,
            output_tokens: row.get("output_tokens")?,
            model: row.get("model")?,
            action_items: from_json_list(&action_items),
            created_at: from_sql_ts(&created_at)?,
        })
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn ping(&self) -> Result<()> {
        let conn = self.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    async fn insert_user(&self, user: &User) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO users (id, display_name, experience_level, city, climate_zone,
                                home_type, light_level, humidity_level, tier)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                user.id,
                user.display_name,
                user.experience_level.as_str(),
                user.city,
                user.climate_zone,
                user.home_type,
                user.light_level,
                user.humidity_level,
                user.tier.as_str(),
            ],
        )?;
        Ok(())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT * FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    let level: String = row.get("experience_level")?;
                    let tier: String = row.get("tier")?;
                    Ok((
                        User {
                            id: row.get("id")?,
                            display_name: row.get("display_name")?,
                            experience_level: ExperienceLevel::Beginner,
                            city: row.get("city")?,
                            climate_zone: row.get("climate_zone")?,
                            home_type: row.get("home_type")?,
                            light_level: row.get("light_level")?,
                            humidity_level: row.get("humidity_level")?,
                            tier: Tier::Free,
                        },
                        level,
                        tier,
                    ))
                },
            )
            .optional()?;

        let Some((mut user, level, tier)) = row else {
            return Ok(None);
        };
        user.experience_level = parse_enum(&level, ExperienceLevel::parse, "experience level")?;
        user.tier = parse_enum(&tier, Tier::parse, "tier")?;
        Ok(Some(user))
    }

    async fn delete_user(&self, user_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM users WHERE id = ?1", params![user_id])?;
        Ok(())
    }

    async fn find_species_by_name(&self, normalized_name: &str) -> Result<Option<Species>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT * FROM species WHERE scientific_name = ?1 COLLATE NOCASE",
                params![normalized_name],
                Self::row_to_species,
            )
            .optional()?;
        let Some((mut species, difficulty)) = row else {
            return Ok(None);
        };
        species.difficulty = parse_enum(&difficulty, Difficulty::parse, "difficulty")?;
        Ok(Some(species))
    }

    async fn insert_species(&self, species: &Species) -> Result<SpeciesInsert> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO species (id, scientific_name, common_names, family, genus,
                                  care_light, care_water, care_humidity, care_temperature,
                                  difficulty, toxicity, description, plant_id_species_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                species.id,
                species.scientific_name,
                to_json_list(&species.common_names),
                species.family,
                species.genus,
                species.care_light,
                species.care_water,
                species.care_humidity,
                species.care_temperature,
                species.difficulty.as_str(),
                species.toxicity,
                species.description,
                species.plant_id_species_id,
            ],
        );
        match result {
            Ok(_) => Ok(SpeciesInsert::Inserted),
            Err(e) if is_unique_violation(&e) => Ok(SpeciesInsert::DuplicateName),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_species(&self, species: &Species) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE species SET common_names = ?2, family = ?3, genus = ?4,
                    care_light = ?5, care_water = ?6, care_humidity = ?7,
                    care_temperature = ?8, difficulty = ?9, toxicity = ?10,
                    description = ?11, plant_id_species_id = ?12
             WHERE id = ?1",
            params![
                species.id,
                to_json_list(&species.common_names),
                species.family,
                species.genus,
                species.care_light,
                species.care_water,
                species.care_humidity,
                species.care_temperature,
                species.difficulty.as_str(),
                species.toxicity,
                species.description,
                species.plant_id_species_id,
            ],
        )?;
        Ok(())
    }

    async fn insert_plant(&self, plant: &Plant) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO plants (id, user_id, species_id, nickname, location_in_home,
                                 light_exposure, watering_frequency_days, last_watered,
                                 next_water_due, current_health, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                plant.id,
                plant.user_id,
                plant.species_id,
                plant.nickname,
                plant.location_in_home,
                plant.light_exposure,
                plant.watering_frequency_days,
                plant.last_watered.map(to_sql_ts),
                plant.next_water_due.map(to_sql_ts),
                plant.current_health.as_str(),
                to_sql_ts(plant.created_at),
            ],
        )?;
        Ok(())
    }

    async fn get_plant(&self, plant_id: &str, user_id: &str) -> Result<Option<Plant>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM plants WHERE id = ?1 AND user_id = ?2")?;
        let mut rows = stmt.query(params![plant_id, user_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_plant(row)?)),
            None => Ok(None),
        }
    }

    async fn update_plant(&self, plant: &Plant) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE plants SET nickname = ?2, location_in_home = ?3, light_exposure = ?4,
                    watering_frequency_days = ?5, last_watered = ?6, next_water_due = ?7,
                    current_health = ?8
             WHERE id = ?1 AND user_id = ?9",
            params![
                plant.id,
                plant.nickname,
                plant.location_in_home,
                plant.light_exposure,
                plant.watering_frequency_days,
                plant.last_watered.map(to_sql_ts),
                plant.next_water_due.map(to_sql_ts),
                plant.current_health.as_str(),
                plant.user_id,
            ],
        )?;
        Ok(())
    }

    async fn delete_plant(&self, plant_id: &str, user_id: &str) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        // Sessions and photos detach; issues and reminders cascade via FK.
        tx.execute(
            "UPDATE sessions SET plant_id = NULL WHERE plant_id = ?1 AND user_id = ?2",
            params![plant_id, user_id],
        )?;
        tx.execute(
            "UPDATE plant_photos SET plant_id = NULL WHERE plant_id = ?1 AND user_id = ?2",
            params![plant_id, user_id],
        )?;
        tx.execute(
            "DELETE FROM plants WHERE id = ?1 AND user_id = ?2",
            params![plant_id, user_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn insert_issue(&self, issue: &HealthIssue, steps: &[TreatmentStep]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO health_issues (id, plant_id, title, description, confidence,
                                        status, reported_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                issue.id,
                issue.plant_id,
                issue.title,
                issue.description,
                issue.confidence,
                issue.status.as_str(),
                to_sql_ts(issue.reported_at),
            ],
        )?;
        for step in steps {
            tx.execute(
                "INSERT INTO treatment_steps (id, issue_id, step_order, instruction, completed)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    step.id,
                    step.issue_id,
                    step.step_order,
                    step.instruction,
                    step.completed,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn issues_for_plant(
        &self,
        plant_id: &str,
        statuses: &[IssueStatus],
        limit: usize,
    ) -> Result<Vec<HealthIssue>> {
        let conn = self.lock();
        let placeholders = statuses
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT * FROM health_issues
             WHERE plant_id = ?1 AND status IN ({placeholders})
             ORDER BY reported_at DESC LIMIT {limit}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut sql_params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(plant_id.to_string())];
        for status in statuses {
            sql_params.push(Box::new(status.as_str().to_string()));
        }
        let mut rows = stmt.query(rusqlite::params_from_iter(
            sql_params.iter().map(|p| p.as_ref()),
        ))?;

        let mut issues = Vec::new();
        while let Some(row) = rows.next()? {
            let status: String = row.get("status")?;
            let reported_at: String = row.get("reported_at")?;
            issues.push(HealthIssue {
                id: row.get("id")?,
                plant_id: row.get("plant_id")?,
                title: row.get("title")?,
                description: row.get("description")?,
                confidence: row.get("confidence")?,
                status: parse_enum(&status, IssueStatus::parse, "issue status")?,
                reported_at: from_sql_ts(&reported_at)?,
            });
        }
        Ok(issues)
    }

    async fn update_issue_status(&self, issue_id: &str, next: IssueStatus) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let current: String = tx
            .query_row(
                "SELECT status FROM health_issues WHERE id = ?1",
                params![issue_id],
                |row| row.get(0),
            )
            .optional()?
            .with_context(|| format!("health issue not found: {issue_id}"))?;
        let current = parse_enum(&current, IssueStatus::parse, "issue status")?;
        if !current.can_transition_to(next) {
            bail!(
                "illegal issue transition {} -> {}",
                current.as_str(),
                next.as_str()
            );
        }
        tx.execute(
            "UPDATE health_issues SET status = ?2 WHERE id = ?1",
            params![issue_id, next.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn insert_session(&self, session: &ConversationSession) -> Result<()> {
        let conn = self.lock();
        let models: Vec<String> = session.models_used.iter().cloned().collect();
        conn.execute(
            "INSERT INTO sessions (id, user_id, plant_id, message_count, total_input_tokens,
                                   total_output_tokens, estimated_cost_usd, models_used,
                                   created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                session.id,
                session.user_id,
                session.plant_id,
                session.message_count,
                session.total_input_tokens,
                session.total_output_tokens,
                session.estimated_cost_usd,
                to_json_list(&models),
                to_sql_ts(session.created_at),
                to_sql_ts(session.updated_at),
            ],
        )?;
        Ok(())
    }

    async fn get_session(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<ConversationSession>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT * FROM sessions WHERE id = ?1 AND user_id = ?2",
                params![session_id, user_id],
                |row| {
                    let models: String = row.get("models_used")?;
                    let created_at: String = row.get("created_at")?;
                    let updated_at: String = row.get("updated_at")?;
                    Ok((
                        ConversationSession {
                            id: row.get("id")?,
                            user_id: row.get("user_id")?,
                            plant_id: row.get("plant_id")?,
                            message_count: row.get("message_count")?,
                            total_input_tokens: row.get("total_input_tokens")?,
                            total_output_tokens: row.get("total_output_tokens")?,
                            estimated_cost_usd: row.get("estimated_cost_usd")?,
                            models_used: BTreeSet::new(),
                            created_at: Utc::now(),
                            updated_at: Utc::now(),
                        },
                        models,
                        created_at,
                        updated_at,
                    ))
                },
            )
            .optional()?;

        let Some((mut session, models, created_at, updated_at)) = row else {
            return Ok(None);
        };
        session.models_used = from_json_list(&models).into_iter().collect();
        session.created_at = from_sql_ts(&created_at)?;
        session.updated_at = from_sql_ts(&updated_at)?;
        Ok(Some(session))
    }

    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<MessageRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM messages WHERE session_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![session_id, limit])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(Self::row_to_message(row)?);
        }
        Ok(messages)
    }

    async fn append_exchange(&self, write: &ExchangeWrite) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let mut assistant = write.assistant_message.clone();
        // Strictly monotonic timestamps within the session.
        if assistant.created_at <= write.user_message.created_at {
            assistant.created_at = write.user_message.created_at + ChronoDuration::milliseconds(1);
        }

        for msg in [&write.user_message, &assistant] {
            tx.execute(
                "INSERT INTO messages (id, session_id, role, content, input_tokens,
                                       output_tokens, model, action_items, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    msg.id,
                    write.session_id,
                    msg.role.as_str(),
                    msg.content,
                    msg.input_tokens,
                    msg.output_tokens,
                    msg.model,
                    to_json_list(&msg.action_items),
                    to_sql_ts(msg.created_at),
                ],
            )?;
        }

        let models: String = tx.query_row(
            "SELECT models_used FROM sessions WHERE id = ?1",
            params![write.session_id],
            |row| row.get(0),
        )?;
        let mut model_set: BTreeSet<String> = from_json_list(&models).into_iter().collect();
        model_set.insert(write.model.clone());
        let models: Vec<String> = model_set.into_iter().collect();

        let input_tokens = assistant.input_tokens.unwrap_or(0);
        let output_tokens = assistant.output_tokens.unwrap_or(0);
        tx.execute(
            "UPDATE sessions SET message_count = message_count + 2,
                    total_input_tokens = total_input_tokens + ?2,
                    total_output_tokens = total_output_tokens + ?3,
                    estimated_cost_usd = estimated_cost_usd + ?4,
                    models_used = ?5,
                    updated_at = ?6
             WHERE id = ?1",
            params![
                write.session_id,
                input_tokens,
                output_tokens,
                write.cost_usd,
                to_json_list(&models),
                to_sql_ts(Utc::now()),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    async fn insert_memory(&self, memory: &SemanticMemory) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO semantic_memories (id, user_id, content, content_type, embedding,
                                            relevance_score, source_session_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                memory.id,
                memory.user_id,
                memory.content,
                memory.content_type.as_str(),
                serialize_embedding(&memory.embedding),
                memory.relevance_score,
                memory.source_session_id,
                to_sql_ts(memory.created_at),
            ],
        )?;
        Ok(())
    }

    async fn search_memories(
        &self,
        user_id: &str,
        query: &[f32],
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<ScoredMemory>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM semantic_memories WHERE user_id = ?1")?;
        let mut rows = stmt.query(params![user_id])?;

        let now = Utc::now();
        let mut scored = Vec::new();
        while let Some(row) = rows.next()? {
            let content_type: String = row.get("content_type")?;
            let embedding: Vec<u8> = row.get("embedding")?;
            let created_at: String = row.get("created_at")?;
            let memory = SemanticMemory {
                id: row.get("id")?,
                user_id: row.get("user_id")?,
                content: row.get("content")?,
                content_type: parse_enum(&content_type, MemoryKind::parse, "memory kind")?,
                embedding: deserialize_embedding(&embedding)?,
                relevance_score: row.get("relevance_score")?,
                source_session_id: row.get("source_session_id")?,
                created_at: from_sql_ts(&created_at)?,
            };

            let similarity = cosine_similarity(query, &memory.embedding);
            if similarity < min_similarity {
                continue;
            }
            let age_days = (now - memory.created_at).num_seconds() as f64 / 86_400.0;
            let relevance =
                memory.relevance_score * relevance_decay(age_days, RELEVANCE_HALF_LIFE_DAYS);
            scored.push(ScoredMemory {
                memory,
                similarity,
                relevance,
            });
        }

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn append_usage(&self, entry: &UsageLogEntry) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO usage_logs (id, user_id, action, provider, model, input_tokens,
                                     output_tokens, latency_ms, success, error_code,
                                     cost_usd, endpoint, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                entry.id,
                entry.user_id,
                entry.action,
                entry.provider,
                entry.model,
                entry.input_tokens,
                entry.output_tokens,
                entry.latency_ms,
                entry.success,
                entry.error_code,
                entry.cost_usd,
                entry.endpoint,
                to_sql_ts(entry.created_at),
            ],
        )?;
        Ok(())
    }

    async fn count_usage_success(
        &self,
        user_id: &str,
        actions: &[&str],
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.lock();
        let placeholders = actions
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT COUNT(*) FROM usage_logs
             WHERE user_id = ?1 AND success = 1 AND created_at >= ?2
               AND action IN ({placeholders})"
        );
        let mut sql_params: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(user_id.to_string()),
            Box::new(to_sql_ts(since)),
        ];
        for action in actions {
            sql_params.push(Box::new((*action).to_string()));
        }
        let count: i64 = conn.query_row(
            &sql,
            rusqlite::params_from_iter(sql_params.iter().map(|p| p.as_ref())),
            |row| row.get(0),
        )?;
        Ok(count)
    }

    async fn insert_photo(&self, photo: &PlantPhoto) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO plant_photos (id, user_id, plant_id, url, thumbnail_url, kind, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                photo.id,
                photo.user_id,
                photo.plant_id,
                photo.url,
                photo.thumbnail_url,
                photo.kind.as_str(),
                to_sql_ts(photo.created_at),
            ],
        )?;
        Ok(())
    }

    async fn insert_reminder(&self, reminder: &Reminder) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO reminders (id, user_id, plant_id, kind, due_date, frequency_days,
                                    recur_interval, completed, skipped)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                reminder.id,
                reminder.user_id,
                reminder.plant_id,
                reminder.kind,
                to_sql_ts(reminder.due_date),
                reminder.frequency_days,
                reminder.interval,
                reminder.completed,
                reminder.skipped,
            ],
        )?;
        Ok(())
    }

    async fn get_reminder(&self, reminder_id: &str, user_id: &str) -> Result<Option<Reminder>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT * FROM reminders WHERE id = ?1 AND user_id = ?2",
                params![reminder_id, user_id],
                |row| {
                    let due_date: String = row.get("due_date")?;
                    Ok((
                        Reminder {
                            id: row.get("id")?,
                            user_id: row.get("user_id")?,
                            plant_id: row.get("plant_id")?,
                            kind: row.get("kind")?,
                            due_date: Utc::now(),
                            frequency_days: row.get("frequency_days")?,
                            interval: row.get("recur_interval")?,
                            completed: row.get("completed")?,
                            skipped: row.get("skipped")?,
                        },
                        due_date,
                    ))
                },
            )
            .optional()?;
        let Some((mut reminder, due_date)) = row else {
            return Ok(None);
        };
        reminder.due_date = from_sql_ts(&due_date)?;
        Ok(Some(reminder))
    }

    async fn mark_reminder_done(&self, reminder_id: &str, skipped: bool) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE reminders SET completed = ?2, skipped = ?3
             WHERE id = ?1 AND completed = 0 AND skipped = 0",
            params![reminder_id, !skipped, skipped],
        )?;
        if changed == 0 {
            bail!("reminder not found or already settled: {reminder_id}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
