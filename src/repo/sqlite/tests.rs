use super::*;
use crate::model::new_id;

fn repo() -> SqliteRepository {
    SqliteRepository::in_memory().unwrap()
}

fn sample_user(id: &str, tier: Tier) -> User {
    User {
        id: id.to_string(),
        display_name: "Casey".to_string(),
        experience_level: ExperienceLevel::Intermediate,
        city: Some("Lisbon".to_string()),
        climate_zone: None,
        home_type: Some("apartment".to_string()),
        light_level: Some("bright-indirect".to_string()),
        humidity_level: None,
        tier,
    }
}

fn sample_species(name: &str) -> Species {
    Species {
        id: new_id(),
        scientific_name: name.to_string(),
        common_names: vec!["Golden pothos".to_string()],
        family: "Araceae".to_string(),
        genus: "Epipremnum".to_string(),
        care_light: "bright indirect".to_string(),
        care_water: "every 7 days".to_string(),
        care_humidity: "moderate".to_string(),
        care_temperature: "18-27C".to_string(),
        difficulty: Difficulty::Easy,
        toxicity: Some("toxic to pets".to_string()),
        description: None,
        plant_id_species_id: None,
    }
}

fn sample_plant(user_id: &str, species_id: &str) -> Plant {
    Plant {
        id: new_id(),
        user_id: user_id.to_string(),
        species_id: species_id.to_string(),
        nickname: Some("Goldie".to_string()),
        location_in_home: "living room".to_string(),
        light_exposure: "east window".to_string(),
        watering_frequency_days: 7,
        last_watered: None,
        next_water_due: None,
        current_health: PlantHealth::Healthy,
        created_at: Utc::now(),
    }
}

fn sample_session(user_id: &str, plant_id: Option<&str>) -> ConversationSession {
    ConversationSession {
        id: new_id(),
        user_id: user_id.to_string(),
        plant_id: plant_id.map(str::to_string),
        message_count: 0,
        total_input_tokens: 0,
        total_output_tokens: 0,
        estimated_cost_usd: 0.0,
        models_used: BTreeSet::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn message(session_id: &str, role: MessageRole, content: &str) -> MessageRecord {
    MessageRecord {
        id: new_id(),
        session_id: session_id.to_string(),
        role,
        content: content.to_string(),
        input_tokens: None,
        output_tokens: None,
        model: None,
        action_items: Vec::new(),
        created_at: Utc::now(),
    }
}

fn memory_with_embedding(user_id: &str, content: &str, embedding: Vec<f32>) -> SemanticMemory {
    SemanticMemory {
        id: new_id(),
        user_id: user_id.to_string(),
        content: content.to_string(),
        content_type: MemoryKind::Diagnosis,
        embedding,
        relevance_score: 1.0,
        source_session_id: None,
        created_at: Utc::now(),
    }
}

fn usage(user_id: &str, action: &str, success: bool, created_at: DateTime<Utc>) -> UsageLogEntry {
    UsageLogEntry {
        id: new_id(),
        user_id: user_id.to_string(),
        action: action.to_string(),
        provider: "plant-id".to_string(),
        model: "plant-id-v2".to_string(),
        input_tokens: None,
        output_tokens: None,
        latency_ms: 420,
        success,
        error_code: if success { None } else { Some("SERVICE_ERROR".to_string()) },
        cost_usd: 0.05,
        endpoint: "/api/v1/identify".to_string(),
        created_at,
    }
}

#[tokio::test]
async fn user_round_trip() {
    let repo = repo();
    let user = sample_user("u1", Tier::Premium);
    repo.insert_user(&user).await.unwrap();

    let loaded = repo.get_user("u1").await.unwrap().unwrap();
    assert_eq!(loaded.display_name, "Casey");
    assert_eq!(loaded.tier, Tier::Premium);
    assert_eq!(loaded.experience_level, ExperienceLevel::Intermediate);
    assert!(repo.get_user("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn species_name_is_unique() {
    let repo = repo();
    let species = sample_species("epipremnum aureum");
    assert_eq!(
        repo.insert_species(&species).await.unwrap(),
        SpeciesInsert::Inserted
    );

    let mut duplicate = sample_species("epipremnum aureum");
    duplicate.id = new_id();
    assert_eq!(
        repo.insert_species(&duplicate).await.unwrap(),
        SpeciesInsert::DuplicateName
    );

    let found = repo
        .find_species_by_name("epipremnum aureum")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, species.id);
}

#[tokio::test]
async fn species_lookup_is_case_insensitive() {
    let repo = repo();
    repo.insert_species(&sample_species("monstera deliciosa"))
        .await
        .unwrap();
    let found = repo
        .find_species_by_name("Monstera Deliciosa")
        .await
        .unwrap();
    assert!(found.is_some());
}

#[tokio::test]
async fn plant_delete_detaches_sessions_and_cascades_issues() {
    let repo = repo();
    repo.insert_user(&sample_user("u1", Tier::Free)).await.unwrap();
    let species = sample_species("ficus lyrata");
    repo.insert_species(&species).await.unwrap();
    let plant = sample_plant("u1", &species.id);
    repo.insert_plant(&plant).await.unwrap();

    let session = sample_session("u1", Some(&plant.id));
    repo.insert_session(&session).await.unwrap();

    let issue = HealthIssue {
        id: new_id(),
        plant_id: plant.id.clone(),
        title: "root rot".to_string(),
        description: "overwatering".to_string(),
        confidence: 0.8,
        status: IssueStatus::Active,
        reported_at: Utc::now(),
    };
    repo.insert_issue(&issue, &[]).await.unwrap();

    repo.delete_plant(&plant.id, "u1").await.unwrap();

    // session survives with a nulled plant reference
    let session = repo.get_session(&session.id, "u1").await.unwrap().unwrap();
    assert!(session.plant_id.is_none());
    // issues are gone with the plant
    let issues = repo
        .issues_for_plant(&plant.id, &[IssueStatus::Active], 10)
        .await
        .unwrap();
    assert!(issues.is_empty());
    assert!(repo.get_plant(&plant.id, "u1").await.unwrap().is_none());
}

#[tokio::test]
async fn user_delete_cascades_descendants() {
    let repo = repo();
    repo.insert_user(&sample_user("u1", Tier::Free)).await.unwrap();
    let species = sample_species("hedera helix");
    repo.insert_species(&species).await.unwrap();
    let plant = sample_plant("u1", &species.id);
    repo.insert_plant(&plant).await.unwrap();
    let session = sample_session("u1", None);
    repo.insert_session(&session).await.unwrap();
    repo.append_usage(&usage("u1", "identification", true, Utc::now()))
        .await
        .unwrap();

    repo.delete_user("u1").await.unwrap();

    assert!(repo.get_plant(&plant.id, "u1").await.unwrap().is_none());
    assert!(repo.get_session(&session.id, "u1").await.unwrap().is_none());
    let count = repo
        .count_usage_success("u1", &["identification"], Utc::now() - ChronoDuration::days(1))
        .await
        .unwrap();
    assert_eq!(count, 0);
    // species are global, not user-owned
    assert!(
        repo.find_species_by_name("hedera helix")
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn append_exchange_updates_aggregates_atomically() {
    let repo = repo();
    repo.insert_user(&sample_user("u1", Tier::Free)).await.unwrap();
    let session = sample_session("u1", None);
    repo.insert_session(&session).await.unwrap();

    let user_msg = message(&session.id, MessageRole::User, "why are the leaves yellow?");
    let mut assistant_msg = message(&session.id, MessageRole::Assistant, "Likely overwatering.");
    assistant_msg.input_tokens = Some(300);
    assistant_msg.output_tokens = Some(40);
    assistant_msg.model = Some("claude-haiku-4-5".to_string());

    repo.append_exchange(&ExchangeWrite {
        session_id: session.id.clone(),
        user_message: user_msg,
        assistant_message: assistant_msg,
        cost_usd: 0.0004,
        model: "claude-haiku-4-5".to_string(),
    })
    .await
    .unwrap();

    let loaded = repo.get_session(&session.id, "u1").await.unwrap().unwrap();
    assert_eq!(loaded.message_count, 2);
    assert_eq!(loaded.total_input_tokens, 300);
    assert_eq!(loaded.total_output_tokens, 40);
    assert!((loaded.estimated_cost_usd - 0.0004).abs() < 1e-9);
    assert!(loaded.models_used.contains("claude-haiku-4-5"));

    let messages = repo.recent_messages(&session.id, 10).await.unwrap();
    assert_eq!(messages.len(), 2);
    // newest first: assistant, then user, with strictly increasing timestamps
    assert_eq!(messages[0].role, MessageRole::Assistant);
    assert!(messages[0].created_at > messages[1].created_at);
}

#[tokio::test]
async fn message_count_matches_rows_across_exchanges() {
    let repo = repo();
    repo.insert_user(&sample_user("u1", Tier::Free)).await.unwrap();
    let session = sample_session("u1", None);
    repo.insert_session(&session).await.unwrap();

    for i in 0..3 {
        repo.append_exchange(&ExchangeWrite {
            session_id: session.id.clone(),
            user_message: message(&session.id, MessageRole::User, &format!("q{i}")),
            assistant_message: message(&session.id, MessageRole::Assistant, &format!("a{i}")),
            cost_usd: 0.0,
            model: "claude-haiku-4-5".to_string(),
        })
        .await
        .unwrap();
    }

    let loaded = repo.get_session(&session.id, "u1").await.unwrap().unwrap();
    let rows = repo.recent_messages(&session.id, 100).await.unwrap();
    assert_eq!(loaded.message_count, rows.len() as i64);
    assert_eq!(loaded.message_count, 6);
}

#[tokio::test]
async fn memory_search_filters_orders_and_limits() {
    let repo = repo();
    repo.insert_user(&sample_user("u1", Tier::Free)).await.unwrap();

    let mut close = vec![0.0f32; 4];
    close[0] = 1.0;
    let mut near = vec![0.0f32; 4];
    near[0] = 0.9;
    near[1] = 0.1;
    let mut far = vec![0.0f32; 4];
    far[1] = 1.0;

    repo.insert_memory(&memory_with_embedding("u1", "exact match", close.clone()))
        .await
        .unwrap();
    repo.insert_memory(&memory_with_embedding("u1", "close match", near))
        .await
        .unwrap();
    repo.insert_memory(&memory_with_embedding("u1", "unrelated", far))
        .await
        .unwrap();

    let results = repo.search_memories("u1", &close, 5, 0.7).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].memory.content, "exact match");
    assert!(results[0].similarity > results[1].similarity);
    // fresh memories carry nearly undecayed relevance
    assert!(results[0].relevance > 0.99);

    let limited = repo.search_memories("u1", &close, 1, 0.7).await.unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn memory_search_is_scoped_per_user() {
    let repo = repo();
    repo.insert_user(&sample_user("u1", Tier::Free)).await.unwrap();
    repo.insert_user(&sample_user("u2", Tier::Free)).await.unwrap();

    let v = vec![1.0f32, 0.0];
    repo.insert_memory(&memory_with_embedding("u1", "mine", v.clone()))
        .await
        .unwrap();

    assert!(repo.search_memories("u2", &v, 5, 0.5).await.unwrap().is_empty());
}

#[tokio::test]
async fn usage_count_respects_window_action_and_success() {
    let repo = repo();
    repo.insert_user(&sample_user("u1", Tier::Free)).await.unwrap();
    let now = Utc::now();
    let month_start = now - ChronoDuration::days(10);

    repo.append_usage(&usage("u1", "identification", true, now)).await.unwrap();
    repo.append_usage(&usage("u1", "identification", false, now)).await.unwrap();
    repo.append_usage(&usage("u1", "chat_simple", true, now)).await.unwrap();
    // before the window
    repo.append_usage(&usage("u1", "identification", true, now - ChronoDuration::days(40)))
        .await
        .unwrap();

    let idents = repo
        .count_usage_success("u1", &["identification"], month_start)
        .await
        .unwrap();
    assert_eq!(idents, 1);

    let chats = repo
        .count_usage_success("u1", &["chat_simple", "chat_complex"], month_start)
        .await
        .unwrap();
    assert_eq!(chats, 1);
}

#[tokio::test]
async fn issue_transitions_are_guarded() {
    let repo = repo();
    repo.insert_user(&sample_user("u1", Tier::Free)).await.unwrap();
    let species = sample_species("calathea ornata");
    repo.insert_species(&species).await.unwrap();
    let plant = sample_plant("u1", &species.id);
    repo.insert_plant(&plant).await.unwrap();

    let issue = HealthIssue {
        id: new_id(),
        plant_id: plant.id.clone(),
        title: "spider mites".to_string(),
        description: "webbing on leaves".to_string(),
        confidence: 0.7,
        status: IssueStatus::Active,
        reported_at: Utc::now(),
    };
    let steps = vec![TreatmentStep {
        id: new_id(),
        issue_id: issue.id.clone(),
        step_order: 1,
        instruction: "wipe leaves with neem oil".to_string(),
        completed: false,
    }];
    repo.insert_issue(&issue, &steps).await.unwrap();

    repo.update_issue_status(&issue.id, IssueStatus::Treating).await.unwrap();
    repo.update_issue_status(&issue.id, IssueStatus::Resolved).await.unwrap();
    // resolved is terminal
    assert!(
        repo.update_issue_status(&issue.id, IssueStatus::Active)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn reminder_settles_exactly_once() {
    let repo = repo();
    repo.insert_user(&sample_user("u1", Tier::Free)).await.unwrap();
    let species = sample_species("pilea peperomioides");
    repo.insert_species(&species).await.unwrap();
    let plant = sample_plant("u1", &species.id);
    repo.insert_plant(&plant).await.unwrap();

    let reminder = Reminder {
        id: new_id(),
        user_id: "u1".to_string(),
        plant_id: plant.id.clone(),
        kind: "water".to_string(),
        due_date: Utc::now(),
        frequency_days: Some(7),
        interval: Some(1),
        completed: false,
        skipped: false,
    };
    repo.insert_reminder(&reminder).await.unwrap();

    repo.mark_reminder_done(&reminder.id, false).await.unwrap();
    let loaded = repo.get_reminder(&reminder.id, "u1").await.unwrap().unwrap();
    assert!(loaded.completed);
    assert!(!loaded.skipped);

    // a settled reminder cannot be settled again
    assert!(repo.mark_reminder_done(&reminder.id, true).await.is_err());
}
