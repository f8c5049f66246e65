use super::*;
use crate::model::{
    Difficulty, ExperienceLevel, PlantHealth, Species, Tier, User,
};
use crate::repo::sqlite::SqliteRepository;

#[test]
fn parses_every_n_days() {
    assert_eq!(watering_frequency_days("Water every 3 days"), 3);
    assert_eq!(watering_frequency_days("every 10 days, less in winter"), 10);
    assert_eq!(watering_frequency_days("Every 5-7 days"), 5);
}

#[test]
fn parses_times_per_week() {
    assert_eq!(watering_frequency_days("2 times per week"), 3);
    assert_eq!(watering_frequency_days("water 7x a week"), 1);
}

#[test]
fn parses_keywords() {
    assert_eq!(watering_frequency_days("Water daily in summer"), 1);
    assert_eq!(watering_frequency_days("weekly"), 7);
    assert_eq!(watering_frequency_days("biweekly misting"), 14);
}

#[test]
fn unparseable_text_falls_back_to_seven() {
    assert_eq!(watering_frequency_days("keep soil lightly moist"), 7);
    assert_eq!(watering_frequency_days("Unknown"), 7);
    assert_eq!(watering_frequency_days(""), 7);
}

#[test]
fn watering_maintains_due_date_invariant() {
    let now = Utc::now();
    let mut plant = Plant {
        id: "p1".to_string(),
        user_id: "u1".to_string(),
        species_id: "s1".to_string(),
        nickname: None,
        location_in_home: "kitchen".to_string(),
        light_exposure: "low".to_string(),
        watering_frequency_days: 5,
        last_watered: None,
        next_water_due: None,
        current_health: PlantHealth::Healthy,
        created_at: now,
    };
    apply_watering(&mut plant, now);
    assert_eq!(plant.last_watered, Some(now));
    assert_eq!(plant.next_water_due, Some(now + Duration::days(5)));
}

#[test]
fn recurring_reminder_spawns_offset_instance() {
    let due = Utc::now();
    let reminder = Reminder {
        id: "r1".to_string(),
        user_id: "u1".to_string(),
        plant_id: "p1".to_string(),
        kind: "fertilize".to_string(),
        due_date: due,
        frequency_days: Some(7),
        interval: Some(2),
        completed: false,
        skipped: false,
    };
    let next = next_reminder_instance(&reminder).unwrap();
    assert_ne!(next.id, reminder.id);
    assert_eq!(next.due_date, due + Duration::days(14));
    assert!(!next.completed && !next.skipped);

    let one_shot = Reminder {
        frequency_days: None,
        ..reminder
    };
    assert!(next_reminder_instance(&one_shot).is_none());
}

async fn seeded_repo() -> (Arc<SqliteRepository>, Plant) {
    let repo = Arc::new(SqliteRepository::in_memory().unwrap());
    repo.insert_user(&User {
        id: "u1".to_string(),
        display_name: "Ari".to_string(),
        experience_level: ExperienceLevel::Advanced,
        city: None,
        climate_zone: None,
        home_type: None,
        light_level: None,
        humidity_level: None,
        tier: Tier::Free,
    })
    .await
    .unwrap();
    let species = Species {
        id: "s1".to_string(),
        scientific_name: "epipremnum aureum".to_string(),
        common_names: vec![],
        family: "Araceae".to_string(),
        genus: "Epipremnum".to_string(),
        care_light: "bright indirect".to_string(),
        care_water: "every 7 days".to_string(),
        care_humidity: "moderate".to_string(),
        care_temperature: "18-27C".to_string(),
        difficulty: Difficulty::Easy,
        toxicity: None,
        description: None,
        plant_id_species_id: None,
    };
    repo.insert_species(&species).await.unwrap();
    let plant = Plant {
        id: "p1".to_string(),
        user_id: "u1".to_string(),
        species_id: "s1".to_string(),
        nickname: None,
        location_in_home: "office".to_string(),
        light_exposure: "north window".to_string(),
        watering_frequency_days: 7,
        last_watered: None,
        next_water_due: None,
        current_health: PlantHealth::Healthy,
        created_at: Utc::now(),
    };
    repo.insert_plant(&plant).await.unwrap();
    (repo, plant)
}

#[tokio::test]
async fn water_plant_persists_schedule() {
    let (repo, plant) = seeded_repo().await;
    let care = CareService::new(repo.clone());

    let updated = care.water_plant(&plant.id, "u1").await.unwrap();
    let last = updated.last_watered.unwrap();
    assert_eq!(updated.next_water_due.unwrap(), last + Duration::days(7));

    let stored = repo.get_plant(&plant.id, "u1").await.unwrap().unwrap();
    assert_eq!(stored.next_water_due, updated.next_water_due);
}

#[tokio::test]
async fn settling_recurring_reminder_inserts_next() {
    let (repo, plant) = seeded_repo().await;
    let care = CareService::new(repo.clone());

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

    let next = care
        .settle_reminder(&reminder.id, "u1", false)
        .await
        .unwrap()
        .unwrap();

    let spawned = repo.get_reminder(&next.id, "u1").await.unwrap().unwrap();
    assert!(!spawned.completed);
    assert_eq!(spawned.due_date, reminder.due_date + Duration::days(7));

    let settled = repo.get_reminder(&reminder.id, "u1").await.unwrap().unwrap();
    assert!(settled.completed);
}

#[tokio::test]
async fn skipping_one_shot_spawns_nothing() {
    let (repo, plant) = seeded_repo().await;
    let care = CareService::new(repo.clone());

    let reminder = Reminder {
        id: new_id(),
        user_id: "u1".to_string(),
        plant_id: plant.id.clone(),
        kind: "repot".to_string(),
        due_date: Utc::now(),
        frequency_days: None,
        interval: None,
        completed: false,
        skipped: false,
    };
    repo.insert_reminder(&reminder).await.unwrap();

    let next = care.settle_reminder(&reminder.id, "u1", true).await.unwrap();
    assert!(next.is_none());

    let settled = repo.get_reminder(&reminder.id, "u1").await.unwrap().unwrap();
    assert!(settled.skipped);
    assert!(!settled.completed);
}
