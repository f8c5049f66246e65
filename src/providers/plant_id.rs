/// Gateway for the plant identification vendor (Plant.id-class API).
/// Covers both species identification and the health assessment endpoint.
use crate::providers::base::{
    ErrorCode, HealthFinding, HealthOutcome, HealthProvider, IdentificationOutcome,
    IdentifyProvider, ProviderError, ProviderResult, SpeciesCandidate, check_json_response,
    classify_transport, strip_data_uri,
};
use crate::providers::vendor_http_client;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

const PROVIDER: &str = "plant-id";
const DEFAULT_BASE_URL: &str = "https://api.plant.id/v2";
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

pub struct PlantIdGateway {
    api_key: String,
    base_url: String,
    client: Client,
}

impl PlantIdGateway {
    pub fn new(api_key: String, base_url: Option<String>, timeout: Duration) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: vendor_http_client(timeout),
        }
    }

    fn parse_candidate(suggestion: &Value) -> SpeciesCandidate {
        let details = &suggestion["plant_details"];
        let scientific_name = details["scientific_name"]
            .as_str()
            .or_else(|| suggestion["plant_name"].as_str())
            .unwrap_or("Unknown")
            .to_string();
        let common_names = details["common_names"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let family = details["taxonomy"]["family"]
            .as_str()
            .unwrap_or("Unknown")
            .to_string();
        let genus = details["taxonomy"]["genus"]
            .as_str()
            .unwrap_or("Unknown")
            .to_string();
        let similar_image_url = suggestion["similar_images"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|img| img["url"].as_str())
            .map(str::to_string);
        let vendor_species_id = match &suggestion["id"] {
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) => Some(s.clone()),
            _ => None,
        };

        SpeciesCandidate {
            scientific_name,
            common_names,
            family,
            genus,
            confidence: suggestion["probability"].as_f64().unwrap_or(0.0),
            similar_image_url,
            vendor_species_id,
            description: details["wiki_description"]["value"]
                .as_str()
                .map(str::to_string),
            toxicity: details["toxicity"].as_str().map(str::to_string),
        }
    }

    fn parse_identification(json: &Value) -> ProviderResult<IdentificationOutcome> {
        let suggestions = json["suggestions"].as_array();
        let Some(suggestions) = suggestions.filter(|s| !s.is_empty()) else {
            return Err(ProviderError::new(
                PROVIDER,
                ErrorCode::NoMatch,
                "no suggestions in response",
            ));
        };

        let is_plant = json["is_plant"]
            .as_bool()
            .or_else(|| json["is_plant_probability"].as_f64().map(|p| p >= 0.5))
            .unwrap_or(true);

        let mut candidates = suggestions.iter().map(Self::parse_candidate);
        let top = candidates.next().expect("non-empty suggestions");
        let alternatives: Vec<SpeciesCandidate> = candidates.take(4).collect();

        Ok(IdentificationOutcome {
            is_plant,
            top,
            alternatives,
        })
    }

    fn parse_assessment(json: &Value) -> ProviderResult<HealthOutcome> {
        let assessment = &json["health_assessment"];
        if assessment.is_null() {
            return Err(ProviderError::new(
                PROVIDER,
                ErrorCode::InvalidResponse,
                "missing health_assessment",
            ));
        }

        let mut findings: Vec<HealthFinding> = assessment["diseases"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(|disease| {
                        let details = &disease["disease_details"];
                        let mut treatment_steps = Vec::new();
                        for group in ["biological", "chemical", "prevention"] {
                            if let Some(steps) = details["treatment"][group].as_array() {
                                treatment_steps
                                    .extend(steps.iter().filter_map(|s| s.as_str().map(str::to_string)));
                            }
                        }
                        HealthFinding {
                            name: disease["name"].as_str().unwrap_or("Unknown").to_string(),
                            confidence: disease["probability"].as_f64().unwrap_or(0.0),
                            description: details["description"].as_str().unwrap_or("").to_string(),
                            treatment_steps,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        findings.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(HealthOutcome {
            is_healthy: assessment["is_healthy"].as_bool().unwrap_or(findings.is_empty()),
            findings,
        })
    }

    async fn post(&self, path: &str, payload: &Value) -> ProviderResult<Value> {
        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header("Api-Key", &self.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| classify_transport(PROVIDER, &e))?;
        check_json_response(PROVIDER, resp).await
    }
}

#[async_trait]
impl IdentifyProvider for PlantIdGateway {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn identify(&self, images: &[String]) -> ProviderResult<IdentificationOutcome> {
        let images: Vec<&str> = images.iter().map(|i| strip_data_uri(i)).collect();
        let payload = json!({
            "images": images,
            "plant_details": ["common_names", "taxonomy"],
            "similar_images": true,
        });
        let json = self.post("/identify", &payload).await?;
        Self::parse_identification(&json)
    }
}

#[async_trait]
impl HealthProvider for PlantIdGateway {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn assess(
        &self,
        images: &[String],
        symptoms: Option<&str>,
    ) -> ProviderResult<HealthOutcome> {
        let images: Vec<&str> = images.iter().map(|i| strip_data_uri(i)).collect();
        let mut payload = json!({
            "images": images,
            "disease_details": ["description", "treatment"],
        });
        if let Some(symptoms) = symptoms {
            payload["custom_question"] = json!(symptoms);
        }
        let json = self.post("/health_assessment", &payload).await?;
        Self::parse_assessment(&json)
    }
}
