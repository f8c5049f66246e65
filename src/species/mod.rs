/// Deduplicating species catalog: maps vendor identification results onto
/// canonical rows, guaranteeing at most one row per normalized scientific
/// name and enriching existing rows instead of overwriting them.
use crate::model::{Difficulty, Species, new_id};
use crate::providers::base::SpeciesCandidate;
use crate::repo::{Repository, SpeciesInsert};
use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

/// Lowercase, trim, and collapse internal whitespace to single spaces.
pub fn normalize_scientific_name(name: &str) -> String {
    name.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Default genus: first whitespace-delimited token of the normalized
/// name, title-cased.
fn genus_from_name(normalized: &str) -> String {
    let Some(first) = normalized.split_whitespace().next() else {
        return "Unknown".to_string();
    };
    let mut chars = first.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => "Unknown".to_string(),
    }
}

fn or_unknown(value: &str) -> String {
    if value.trim().is_empty() || value == "Unknown" {
        "Unknown".to_string()
    } else {
        value.to_string()
    }
}

/// Case-insensitive set union: existing names keep their positions, new
/// names append in input order. Returns `None` when nothing was added.
fn merge_common_names(existing: &[String], incoming: &[String]) -> Option<Vec<String>> {
    let mut seen: Vec<String> = existing.iter().map(|n| n.to_lowercase()).collect();
    let mut merged = existing.to_vec();
    for name in incoming {
        let folded = name.to_lowercase();
        if !seen.contains(&folded) {
            seen.push(folded);
            merged.push(name.clone());
        }
    }
    (merged.len() > existing.len()).then_some(merged)
}

pub struct SpeciesResolver {
    repo: Arc<dyn Repository>,
}

impl SpeciesResolver {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Resolve a candidate to a stable species id, inserting or enriching
    /// as needed. An insert race is resolved by the unique index: the
    /// loser re-reads and proceeds to enrichment.
    pub async fn resolve(&self, candidate: &SpeciesCandidate) -> Result<String> {
        let normalized = normalize_scientific_name(&candidate.scientific_name);
        if normalized.is_empty() {
            anyhow::bail!("candidate has an empty scientific name");
        }

        if let Some(existing) = self.repo.find_species_by_name(&normalized).await? {
            return self.enrich(existing, candidate).await;
        }

        let fresh = self.species_from_candidate(&normalized, candidate);
        match self.repo.insert_species(&fresh).await? {
            SpeciesInsert::Inserted => Ok(fresh.id),
            SpeciesInsert::DuplicateName => {
                debug!("lost species insert race for '{normalized}', enriching instead");
                let existing = self
                    .repo
                    .find_species_by_name(&normalized)
                    .await?
                    .ok_or_else(|| {
                        anyhow::anyhow!("species vanished after duplicate insert: {normalized}")
                    })?;
                self.enrich(existing, candidate).await
            }
        }
    }

    fn species_from_candidate(&self, normalized: &str, candidate: &SpeciesCandidate) -> Species {
        Species {
            id: new_id(),
            scientific_name: normalized.to_string(),
            common_names: candidate.common_names.clone(),
            family: or_unknown(&candidate.family),
            genus: if candidate.genus.trim().is_empty() || candidate.genus == "Unknown" {
                genus_from_name(normalized)
            } else {
                candidate.genus.clone()
            },
            care_light: "Unknown".to_string(),
            care_water: "Unknown".to_string(),
            care_humidity: "Unknown".to_string(),
            care_temperature: "Unknown".to_string(),
            difficulty: Difficulty::Moderate,
            toxicity: candidate.toxicity.clone(),
            description: candidate.description.clone(),
            plant_id_species_id: candidate.vendor_species_id.clone(),
        }
    }

    /// Fill-if-empty enrichment; persists only when something changed.
    async fn enrich(&self, mut existing: Species, candidate: &SpeciesCandidate) -> Result<String> {
        let mut changed = false;

        if existing.plant_id_species_id.is_none()
            && let Some(vendor_id) = &candidate.vendor_species_id
        {
            existing.plant_id_species_id = Some(vendor_id.clone());
            changed = true;
        }
        if existing.description.as_deref().is_none_or(str::is_empty)
            && let Some(description) = &candidate.description
        {
            existing.description = Some(description.clone());
            changed = true;
        }
        if existing.toxicity.as_deref().is_none_or(str::is_empty)
            && let Some(toxicity) = &candidate.toxicity
        {
            existing.toxicity = Some(toxicity.clone());
            changed = true;
        }
        if let Some(merged) = merge_common_names(&existing.common_names, &candidate.common_names) {
            existing.common_names = merged;
            changed = true;
        }
        if existing.family == "Unknown" && candidate.family != "Unknown" {
            existing.family = candidate.family.clone();
            changed = true;
        }

        if changed {
            self.repo.update_species(&existing).await?;
        }
        Ok(existing.id)
    }
}

#[cfg(test)]
mod tests;
