/// Health assessment pipeline: validates the images, routes the
/// assessment, persists diagnosed issues with ordered treatment steps,
/// and updates the plant's health flag.
use crate::errors::{LeafwiseError, LeafwiseResult};
use crate::model::{
    HealthIssue, IssueStatus, PlantHealth, TreatmentStep, new_id,
};
use crate::providers::base::{estimated_decoded_len, strip_data_uri};
use crate::repo::Repository;
use crate::router::{AiRouter, RouteMeta};
use crate::usage::limits::{QuotaFeature, QuotaGate, SlidingWindowLimiter};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const ENDPOINT: &str = "/api/v1/health/assess";

const MAX_IMAGES: usize = 3;
const MAX_DECODED_BYTES: usize = 10 * 1024 * 1024;
/// Findings below this confidence are reported but not persisted.
const PERSIST_CONFIDENCE: f64 = 0.2;
/// At or above this top confidence an unhealthy plant is flagged critical.
const CRITICAL_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone, Default)]
pub struct HealthAssessRequest {
    pub plant_id: String,
    pub images: Vec<String>,
    pub symptoms_description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessedIssue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub confidence: f64,
    pub description: String,
    pub treatment_steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthAssessResponse {
    pub is_healthy: bool,
    pub plant_health: PlantHealth,
    /// Ranked by confidence, highest first.
    pub issues: Vec<AssessedIssue>,
    #[serde(skip)]
    pub provider: String,
    #[serde(skip)]
    pub processing_time_ms: i64,
}

pub struct HealthAssessService {
    router: Arc<AiRouter>,
    repo: Arc<dyn Repository>,
    windows: Arc<SlidingWindowLimiter>,
    quotas: Arc<QuotaGate>,
}

impl HealthAssessService {
    pub fn new(
        router: Arc<AiRouter>,
        repo: Arc<dyn Repository>,
        windows: Arc<SlidingWindowLimiter>,
        quotas: Arc<QuotaGate>,
    ) -> Self {
        Self {
            router,
            repo,
            windows,
            quotas,
        }
    }

    pub async fn run(
        &self,
        user_id: &str,
        request: HealthAssessRequest,
        cancel: &CancellationToken,
    ) -> LeafwiseResult<HealthAssessResponse> {
        let started = Instant::now();

        self.windows.check(user_id, ENDPOINT)?;
        let user = self
            .repo
            .get_user(user_id)
            .await
            .map_err(LeafwiseError::Internal)?
            .ok_or_else(|| LeafwiseError::NotFound(format!("user {user_id}")))?;
        self.quotas.check(&user, QuotaFeature::Health).await?;

        let images = validate_images(&request.images)?;
        let mut plant = self
            .repo
            .get_plant(&request.plant_id, user_id)
            .await
            .map_err(LeafwiseError::Internal)?
            .ok_or_else(|| LeafwiseError::NotFound(format!("plant {}", request.plant_id)))?;

        let meta = RouteMeta {
            user_id: user_id.to_string(),
            endpoint: ENDPOINT.to_string(),
        };
        let routed = self
            .router
            .assess_health(
                &meta,
                cancel,
                &images,
                request.symptoms_description.clone(),
            )
            .await
            .map_err(|e| LeafwiseError::AiUnavailable {
                attempted: e.attempted,
                message: e.last.message.clone(),
            })?;
        let outcome = routed.value;

        // existing open issues, for re-report matching
        let open_issues = self
            .repo
            .issues_for_plant(
                &plant.id,
                &[IssueStatus::Active, IssueStatus::Treating, IssueStatus::Recurring],
                50,
            )
            .await
            .map_err(LeafwiseError::Internal)?;

        let mut assessed = Vec::with_capacity(outcome.findings.len());
        for finding in &outcome.findings {
            let mut issue_id = None;
            if finding.confidence >= PERSIST_CONFIDENCE {
                let already_open = open_issues.iter().find(|existing| {
                    existing.title.eq_ignore_ascii_case(&finding.name)
                });
                match already_open {
                    Some(existing) if existing.status == IssueStatus::Recurring => {
                        // re-report flips a recurring issue back to active
                        if let Err(e) = self
                            .repo
                            .update_issue_status(&existing.id, IssueStatus::Active)
                            .await
                        {
                            warn!("failed to reactivate recurring issue: {e}");
                        }
                        issue_id = Some(existing.id.clone());
                    }
                    Some(existing) => {
                        issue_id = Some(existing.id.clone());
                    }
                    None => {
                        issue_id = self.persist_issue(&plant.id, finding).await;
                    }
                }
            }
            assessed.push(AssessedIssue {
                id: issue_id,
                name: finding.name.clone(),
                confidence: finding.confidence,
                description: finding.description.clone(),
                treatment_steps: finding.treatment_steps.clone(),
            });
        }

        let new_health = if outcome.is_healthy {
            plant.current_health
        } else if outcome
            .findings
            .first()
            .is_some_and(|f| f.confidence >= CRITICAL_CONFIDENCE)
        {
            PlantHealth::Critical
        } else {
            PlantHealth::Struggling
        };
        if new_health != plant.current_health {
            plant.current_health = new_health;
            if let Err(e) = self.repo.update_plant(&plant).await {
                warn!("failed to update plant health flag: {e}");
            }
        }

        Ok(HealthAssessResponse {
            is_healthy: outcome.is_healthy,
            plant_health: plant.current_health,
            issues: assessed,
            provider: routed.provider,
            processing_time_ms: started.elapsed().as_millis() as i64,
        })
    }

    async fn persist_issue(
        &self,
        plant_id: &str,
        finding: &crate::providers::base::HealthFinding,
    ) -> Option<String> {
        let issue = HealthIssue {
            id: new_id(),
            plant_id: plant_id.to_string(),
            title: finding.name.clone(),
            description: finding.description.clone(),
            confidence: finding.confidence,
            status: IssueStatus::Active,
            reported_at: Utc::now(),
        };
        let steps: Vec<TreatmentStep> = finding
            .treatment_steps
            .iter()
            .enumerate()
            .map(|(i, instruction)| TreatmentStep {
                id: new_id(),
                issue_id: issue.id.clone(),
                step_order: (i + 1) as i64,
                instruction: instruction.clone(),
                completed: false,
            })
            .collect();
        match self.repo.insert_issue(&issue, &steps).await {
            Ok(()) => Some(issue.id),
            Err(e) => {
                warn!("failed to persist diagnosed issue: {e}");
                None
            }
        }
    }
}

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
