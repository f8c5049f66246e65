use super::*;
use crate::repo::sqlite::SqliteRepository;

fn candidate(name: &str) -> SpeciesCandidate {
    SpeciesCandidate {
        scientific_name: name.to_string(),
        common_names: vec!["Golden pothos".to_string()],
        family: "Araceae".to_string(),
        genus: "Epipremnum".to_string(),
        confidence: 0.9,
        similar_image_url: None,
        vendor_species_id: Some("128712".to_string()),
        description: Some("A hardy climbing aroid.".to_string()),
        toxicity: None,
    }
}

fn resolver() -> (SpeciesResolver, Arc<SqliteRepository>) {
    let repo = Arc::new(SqliteRepository::in_memory().unwrap());
    (SpeciesResolver::new(repo.clone()), repo)
}

#[test]
fn normalization_lowercases_trims_and_collapses() {
    assert_eq!(
        normalize_scientific_name("  Epipremnum   AUREUM "),
        "epipremnum aureum"
    );
    assert_eq!(normalize_scientific_name("Ficus\tlyrata"), "ficus lyrata");
}

#[test]
fn normalization_is_idempotent() {
    let once = normalize_scientific_name("  Monstera   Deliciosa ");
    assert_eq!(normalize_scientific_name(&once), once);
}

#[test]
fn common_name_merge_is_case_insensitive_and_order_preserving() {
    let existing = vec!["Golden pothos".to_string(), "Devil's ivy".to_string()];
    let incoming = vec!["golden POTHOS".to_string(), "Money plant".to_string()];
    let merged = merge_common_names(&existing, &incoming).unwrap();
    assert_eq!(
        merged,
        vec!["Golden pothos", "Devil's ivy", "Money plant"]
    );

    // nothing new means no update at all
    assert!(merge_common_names(&existing, &["GOLDEN POTHOS".to_string()]).is_none());
}

#[tokio::test]
async fn insert_normalizes_and_defaults() {
    let (resolver, repo) = resolver();
    let mut c = candidate("  Epipremnum   Aureum ");
    c.family = String::new();
    c.genus = String::new();

    let id = resolver.resolve(&c).await.unwrap();
    let species = repo
        .find_species_by_name("epipremnum aureum")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(species.id, id);
    assert_eq!(species.scientific_name, "epipremnum aureum");
    assert_eq!(species.family, "Unknown");
    // genus defaults to the title-cased first token
    assert_eq!(species.genus, "Epipremnum");
    assert_eq!(species.difficulty, crate::model::Difficulty::Moderate);
    assert_eq!(species.care_water, "Unknown");
    assert_eq!(species.plant_id_species_id.as_deref(), Some("128712"));
}

#[tokio::test]
async fn resolve_twice_returns_same_id_without_new_rows() {
    let (resolver, repo) = resolver();
    let c = candidate("Epipremnum aureum");

    let first = resolver.resolve(&c).await.unwrap();
    let second = resolver.resolve(&c).await.unwrap();
    assert_eq!(first, second);

    // same row, converged enrichment
    let species = repo
        .find_species_by_name("epipremnum aureum")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(species.common_names, vec!["Golden pothos"]);
}

#[tokio::test]
async fn enrichment_fills_only_empty_fields() {
    let (resolver, repo) = resolver();
    let mut first = candidate("Monstera deliciosa");
    first.vendor_species_id = None;
    first.description = None;
    resolver.resolve(&first).await.unwrap();

    let mut second = candidate("monstera DELICIOSA");
    second.common_names = vec!["Swiss cheese plant".to_string()];
    second.description = Some("Large fenestrated leaves.".to_string());
    second.toxicity = Some("mildly toxic".to_string());
    resolver.resolve(&second).await.unwrap();

    let species = repo
        .find_species_by_name("monstera deliciosa")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(species.plant_id_species_id.as_deref(), Some("128712"));
    assert_eq!(
        species.description.as_deref(),
        Some("Large fenestrated leaves.")
    );
    assert_eq!(species.toxicity.as_deref(), Some("mildly toxic"));
    assert_eq!(
        species.common_names,
        vec!["Golden pothos", "Swiss cheese plant"]
    );

    // a third pass with a different description must not overwrite
    let mut third = candidate("monstera deliciosa");
    third.description = Some("Something else entirely.".to_string());
    resolver.resolve(&third).await.unwrap();
    let species = repo
        .find_species_by_name("monstera deliciosa")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        species.description.as_deref(),
        Some("Large fenestrated leaves.")
    );
}

#[tokio::test]
async fn concurrent_resolves_create_one_row() {
    let repo = Arc::new(SqliteRepository::in_memory().unwrap());
    let resolver = Arc::new(SpeciesResolver::new(repo.clone()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let resolver = resolver.clone();
        handles.push(tokio::spawn(async move {
            resolver.resolve(&candidate("Epipremnum aureum")).await
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1, "all resolvers must converge on one row");
}

#[tokio::test]
async fn empty_name_is_an_error() {
    let (resolver, _repo) = resolver();
    let mut c = candidate("   ");
    c.scientific_name = "   ".to_string();
    assert!(resolver.resolve(&c).await.is_err());
}
