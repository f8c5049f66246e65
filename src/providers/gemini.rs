/// Vision fallback for identification (Gemini-class API). Prompts the
/// model for a strict JSON species object and parses it tolerantly: a
/// response that cannot be parsed yields the low-confidence sentinel
/// rather than an error, so parse failure alone never trips the router.
use crate::providers::base::{
    IdentificationOutcome, IdentifyProvider, ProviderResult, SpeciesCandidate,
    check_json_response, classify_transport, extract_first_json_object, strip_data_uri,
};
use crate::providers::vendor_http_client;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

const PROVIDER: &str = "gemini";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

const IDENTIFY_PROMPT: &str = "You are a botanist. Identify the plant in the attached photo(s). \
Respond with exactly one JSON object and nothing else, in this shape: \
{\"scientificName\": string, \"commonNames\": [string], \"family\": string, \
\"genus\": string, \"confidence\": number between 0 and 1}. \
If you cannot identify the plant, use \"Unknown\" and confidence 0.";

pub struct GeminiGateway {
    api_key: String,
    model: String,
    base_url: String,
    client: Client,
}

impl GeminiGateway {
    pub fn new(api_key: String, base_url: Option<String>, timeout: Duration) -> Self {
        Self {
            api_key,
            model: DEFAULT_MODEL.to_string(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: vendor_http_client(timeout),
        }
    }

    /// Map the model's free-form answer onto a candidate. Absent or broken
    /// JSON, and absent fields within it, degrade to the sentinel defaults.
    fn candidate_from_text(text: &str) -> SpeciesCandidate {
        let Some(obj) = extract_first_json_object(text) else {
            debug!("vision response had no parseable JSON object");
            return SpeciesCandidate::unknown();
        };

        let string_or_unknown = |v: &Value| -> String {
            v.as_str()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or("Unknown")
                .to_string()
        };

        SpeciesCandidate {
            scientific_name: string_or_unknown(&obj["scientificName"]),
            common_names: obj["commonNames"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            family: string_or_unknown(&obj["family"]),
            genus: string_or_unknown(&obj["genus"]),
            confidence: obj["confidence"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0),
            similar_image_url: None,
            vendor_species_id: None,
            description: None,
            toxicity: None,
        }
    }
}

#[async_trait]
impl IdentifyProvider for GeminiGateway {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn identify(&self, images: &[String]) -> ProviderResult<IdentificationOutcome> {
        let mut parts = vec![json!({"text": IDENTIFY_PROMPT})];
        for image in images {
            parts.push(json!({
                "inline_data": {
                    "mime_type": "image/jpeg",
                    "data": strip_data_uri(image),
                }
            }));
        }

        let payload = json!({
            "contents": [{"role": "user", "parts": parts}],
            "generationConfig": {"maxOutputTokens": 512, "temperature": 0.1},
        });

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| classify_transport(PROVIDER, &e))?;
        let json = check_json_response(PROVIDER, resp).await?;

        let text = json["candidates"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|c| c["content"]["parts"].as_array())
            .and_then(|parts| parts.iter().find_map(|p| p["text"].as_str()))
            .unwrap_or("");

        // A single candidate and no alternatives: the vision vendor emits
        // exactly one answer.
        Ok(IdentificationOutcome {
            is_plant: true,
            top: Self::candidate_from_text(text),
            alternatives: Vec::new(),
        })
    }
}
