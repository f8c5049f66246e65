/// Identification pipeline: validate the images, run routing and the
/// photo upload concurrently, resolve the species, persist, and shape
/// the response. Latency is dominated by the router; the upload overlaps
/// it and degrades to empty URLs on failure.
use crate::care::watering_frequency_days;
use crate::errors::{LeafwiseError, LeafwiseResult};
use crate::model::{PhotoKind, Plant, PlantHealth, PlantPhoto, User, new_id};
use crate::providers::base::{SpeciesCandidate, estimated_decoded_len, strip_data_uri};
use crate::repo::Repository;
use crate::router::{AiRouter, RouteMeta};
use crate::species::{SpeciesResolver, normalize_scientific_name};
use crate::storage::{PhotoStorage, is_image_bytes, make_thumbnail, photo_key, thumbnail_key};
use crate::usage::limits::{QuotaFeature, QuotaGate, SlidingWindowLimiter};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

const MAX_IMAGES: usize = 5;
const MAX_DECODED_BYTES: usize = 10 * 1024 * 1024;

pub const ENDPOINT: &str = "/api/v1/identify";

#[derive(Debug, Clone, Default)]
pub struct IdentifyRequest {
    pub images: Vec<String>,
    pub add_to_collection: bool,
    pub nickname: Option<String>,
    pub location_in_home: Option<String>,
    pub light_exposure: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeciesSummary {
    pub id: Option<String>,
    pub scientific_name: String,
    pub common_names: Vec<String>,
    pub family: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarSpecies {
    pub scientific_name: String,
    pub common_names: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoUrls {
    pub url: String,
    pub thumbnail_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyResponse {
    pub species: SpeciesSummary,
    /// Present only when top confidence falls below the threshold.
    pub similar_species: Vec<SimilarSpecies>,
    pub photo: PhotoUrls,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plant_id: Option<String>,
    #[serde(skip)]
    pub provider: String,
    #[serde(skip)]
    pub processing_time_ms: i64,
}

pub struct IdentificationService {
    router: Arc<AiRouter>,
    repo: Arc<dyn Repository>,
    storage: Arc<dyn PhotoStorage>,
    resolver: SpeciesResolver,
    windows: Arc<SlidingWindowLimiter>,
    quotas: Arc<QuotaGate>,
    low_confidence_threshold: f64,
    signed_url_ttl: Duration,
}

impl IdentificationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: Arc<AiRouter>,
        repo: Arc<dyn Repository>,
        storage: Arc<dyn PhotoStorage>,
        windows: Arc<SlidingWindowLimiter>,
        quotas: Arc<QuotaGate>,
        low_confidence_threshold: f64,
        signed_url_ttl: Duration,
    ) -> Self {
        Self {
            router,
            resolver: SpeciesResolver::new(repo.clone()),
            repo,
            storage,
            windows,
            quotas,
            low_confidence_threshold,
            signed_url_ttl,
        }
    }

    pub async fn run(
        &self,
        user_id: &str,
        request: IdentifyRequest,
        cancel: &CancellationToken,
    ) -> LeafwiseResult<IdentifyResponse> {
        let started = Instant::now();

        self.windows.check(user_id, ENDPOINT)?;
        let user = self
            .repo
            .get_user(user_id)
            .await
            .map_err(LeafwiseError::Internal)?
            .ok_or_else(|| LeafwiseError::NotFound(format!("user {user_id}")))?;
        self.quotas.check(&user, QuotaFeature::Identification).await?;

        let images = validate_images(&request.images)?;

        let meta = RouteMeta {
            user_id: user_id.to_string(),
            endpoint: ENDPOINT.to_string(),
        };
        let (routed, upload) = tokio::join!(
            self.router.identify(&meta, cancel, &images),
            self.upload_photo(user_id, &images[0]),
        );

        let routed = routed.map_err(|e| LeafwiseError::AiUnavailable {
            attempted: e.attempted,
            message: e.last.message.clone(),
        })?;

        let species_id = match self.resolver.resolve(&routed.value.top).await {
            Ok(id) => Some(id),
            Err(e) => {
                // keeping identification responsive matters more than
                // catalog completeness
                warn!("species resolution failed: {e}");
                None
            }
        };

        let plant_id = if request.add_to_collection && species_id.is_some() {
            self.add_to_collection(&user, &request, &routed.value.top, species_id.as_deref())
                .await
        } else {
            None
        };

        let (photo_url, thumbnail_url) = upload;
        if !photo_url.is_empty() {
            let photo = PlantPhoto {
                id: new_id(),
                user_id: user_id.to_string(),
                plant_id: plant_id.clone(),
                url: photo_url.clone(),
                thumbnail_url: (!thumbnail_url.is_empty()).then(|| thumbnail_url.clone()),
                kind: PhotoKind::Identification,
                created_at: Utc::now(),
            };
            if let Err(e) = self.repo.insert_photo(&photo).await {
                warn!("photo record write failed: {e}");
            }
        }

        let top = &routed.value.top;
        let similar_species = if top.confidence < self.low_confidence_threshold {
            routed
                .value
                .alternatives
                .iter()
                .take(5)
                .map(|c| SimilarSpecies {
                    scientific_name: c.scientific_name.clone(),
                    common_names: c.common_names.clone(),
                    confidence: c.confidence,
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(IdentifyResponse {
            species: SpeciesSummary {
                id: species_id,
                scientific_name: normalize_scientific_name(&top.scientific_name),
                common_names: top.common_names.clone(),
                family: top.family.clone(),
                confidence: top.confidence,
            },
            similar_species,
            photo: PhotoUrls {
                url: photo_url,
                thumbnail_url,
            },
            plant_id,
            provider: routed.provider,
            processing_time_ms: started.elapsed().as_millis() as i64,
        })
    }

    /// Upload original + thumbnail under a timestamped temp key. Any
    /// failure degrades both URLs to empty strings; identification
    /// proceeds regardless.
    async fn upload_photo(&self, user_id: &str, image_b64: &str) -> (String, String) {
        let timestamp_ms = Utc::now().timestamp_millis();
        let key = photo_key(
            user_id,
            &format!("temp-{timestamp_ms}"),
            "identification",
            timestamp_ms,
        );

        let bytes = match BASE64.decode(strip_data_uri(image_b64)) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("photo upload skipped, image is not valid base64: {e}");
                return (String::new(), String::new());
            }
        };
        if !is_image_bytes(&bytes) {
            warn!("photo upload skipped, payload is not a recognized image format");
            return (String::new(), String::new());
        }

        if let Err(e) = self.storage.put(&key, &bytes).await {
            warn!("photo upload failed: {e}");
            return (String::new(), String::new());
        }
        let url = match self.storage.signed_url(&key, self.signed_url_ttl) {
            Ok(url) => url,
            Err(e) => {
                warn!("photo URL signing failed: {e}");
                return (String::new(), String::new());
            }
        };

        let thumb_url = match make_thumbnail(&bytes) {
            Ok(thumb) => {
                let thumb_key = thumbnail_key(&key);
                match self.storage.put(&thumb_key, &thumb).await {
                    Ok(()) => self
                        .storage
                        .signed_url(&thumb_key, self.signed_url_ttl)
                        .unwrap_or_default(),
                    Err(e) => {
                        warn!("thumbnail upload failed: {e}");
                        String::new()
                    }
                }
            }
            Err(e) => {
                warn!("thumbnail generation failed: {e}");
                String::new()
            }
        };

        (url, thumb_url)
    }

    async fn add_to_collection(
        &self,
        user: &User,
        request: &IdentifyRequest,
        candidate: &SpeciesCandidate,
        species_id: Option<&str>,
    ) -> Option<String> {
        let species_id = species_id?;
        let normalized = normalize_scientific_name(&candidate.scientific_name);
        let water_descriptor = match self.repo.find_species_by_name(&normalized).await {
            Ok(Some(species)) => species.care_water,
            _ => String::new(),
        };

        let plant = Plant {
            id: new_id(),
            user_id: user.id.clone(),
            species_id: species_id.to_string(),
            nickname: request.nickname.clone(),
            location_in_home: request
                .location_in_home
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
            light_exposure: request
                .light_exposure
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
            watering_frequency_days: watering_frequency_days(&water_descriptor),
            last_watered: None,
            next_water_due: None,
            current_health: PlantHealth::Healthy,
            created_at: Utc::now(),
        };
        match self.repo.insert_plant(&plant).await {
            Ok(()) => Some(plant.id),
            Err(e) => {
                warn!("failed to add plant to collection: {e}");
                None
            }
        }
    }
}

/// 1–5 images, each within the decoded-size cap after data-URI strip.
/// The offending index is reported for size violations.
fn validate_images(images: &[String]) -> LeafwiseResult<Vec<String>> {
    if images.is_empty() || images.len() > MAX_IMAGES {
        return Err(LeafwiseError::Validation(format!(
            "images must contain 1 to {MAX_IMAGES} entries, got {}",
            images.len()
        )));
    }

    let mut normalized = Vec::with_capacity(images.len());
    for (index, image) in images.iter().enumerate() {
        let stripped = strip_data_uri(image);
        if estimated_decoded_len(stripped) > MAX_DECODED_BYTES {
            return Err(LeafwiseError::bad_request(
                "IMAGE_TOO_LARGE",
                format!("image {index} exceeds the 10MB limit"),
            ));
        }
        normalized.push(stripped.to_string());
    }
    Ok(normalized)
}
