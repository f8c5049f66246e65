/// Care scheduling: derives watering cadence from free-text care
/// descriptors, maintains the watering invariant on plants, and spawns
/// follow-up instances for recurring reminders.
use crate::model::{Plant, Reminder, new_id};
use crate::repo::Repository;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::sync::Arc;
use std::sync::OnceLock;

const DEFAULT_WATERING_DAYS: i64 = 7;

fn every_n_days_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)every\s+(\d+)(?:\s*-\s*\d+)?\s*days?").unwrap())
}

fn times_per_week_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+)\s*(?:times|x)\s*(?:per|a)\s*week").unwrap())
}

/// Parse a free-text water descriptor into a cadence in days.
/// Regex extraction with a 7-day fallback; the descriptor formats are
/// vendor prose, so this is deliberately forgiving.
pub fn watering_frequency_days(descriptor: &str) -> i64 {
    if let Some(caps) = every_n_days_re().captures(descriptor)
        && let Ok(days) = caps[1].parse::<i64>()
        && days > 0
    {
        return days;
    }
    if let Some(caps) = times_per_week_re().captures(descriptor)
        && let Ok(times) = caps[1].parse::<i64>()
        && times > 0
    {
        return (7 / times).max(1);
    }

    let lower = descriptor.to_lowercase();
    if lower.contains("daily") || lower.contains("every day") {
        return 1;
    }
    if lower.contains("biweekly") || lower.contains("every other week") {
        return 14;
    }
    if lower.contains("weekly") || lower.contains("once a week") {
        return 7;
    }
    DEFAULT_WATERING_DAYS
}

/// Record a watering: `next_water_due = last_watered + watering_frequency_days`.
pub fn apply_watering(plant: &mut Plant, watered_at: DateTime<Utc>) {
    plant.last_watered = Some(watered_at);
    plant.next_water_due = Some(watered_at + Duration::days(plant.watering_frequency_days));
}

/// The follow-up instance a recurring reminder spawns when settled:
/// a fresh pending reminder at `due + interval * frequency`.
pub fn next_reminder_instance(reminder: &Reminder) -> Option<Reminder> {
    if !reminder.is_recurring() {
        return None;
    }
    let frequency = reminder.frequency_days?;
    let interval = reminder.interval?;
    Some(Reminder {
        id: new_id(),
        user_id: reminder.user_id.clone(),
        plant_id: reminder.plant_id.clone(),
        kind: reminder.kind.clone(),
        due_date: reminder.due_date + Duration::days(interval * frequency),
        frequency_days: reminder.frequency_days,
        interval: reminder.interval,
        completed: false,
        skipped: false,
    })
}

pub struct CareService {
    repo: Arc<dyn Repository>,
}

impl CareService {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    pub async fn water_plant(&self, plant_id: &str, user_id: &str) -> Result<Plant> {
        let mut plant = self
            .repo
            .get_plant(plant_id, user_id)
            .await?
            .with_context(|| format!("plant not found: {plant_id}"))?;
        apply_watering(&mut plant, Utc::now());
        self.repo.update_plant(&plant).await?;
        Ok(plant)
    }

    /// Settle a reminder (complete or skip) and spawn the next instance
    /// when it recurs. Returns the spawned reminder, if any.
    pub async fn settle_reminder(
        &self,
        reminder_id: &str,
        user_id: &str,
        skipped: bool,
    ) -> Result<Option<Reminder>> {
        let reminder = self
            .repo
            .get_reminder(reminder_id, user_id)
            .await?
            .with_context(|| format!("reminder not found: {reminder_id}"))?;
        self.repo.mark_reminder_done(reminder_id, skipped).await?;

        match next_reminder_instance(&reminder) {
            Some(next) => {
                self.repo.insert_reminder(&next).await?;
                Ok(Some(next))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests;
