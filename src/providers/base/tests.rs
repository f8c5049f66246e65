use super::*;

// --- classification ---

#[test]
fn auth_statuses_are_terminal() {
    for status in [401, 403] {
        let err = classify_status("plant-id", status, "{}", None);
        assert_eq!(err.code, ErrorCode::Auth);
        assert!(!err.is_retryable());
    }
}

#[test]
fn invalid_api_key_signature_is_auth() {
    let err = classify_status("gemini", 400, r#"{"error": "Invalid API key provided"}"#, None);
    assert_eq!(err.code, ErrorCode::Auth);
}

#[test]
fn rate_limit_carries_retry_after() {
    let err = classify_status("claude", 429, "slow down", Some(7));
    assert_eq!(err.code, ErrorCode::RateLimit);
    assert!(err.is_retryable());
    assert_eq!(err.retry_after_secs, Some(7));
}

#[test]
fn server_errors_are_retryable() {
    for status in [500, 502, 503] {
        let err = classify_status("openai", status, "upstream broke", None);
        assert_eq!(err.code, ErrorCode::ServiceError);
        assert!(err.is_retryable());
    }
}

#[test]
fn error_code_names() {
    assert_eq!(ErrorCode::Auth.as_str(), "AUTH");
    assert_eq!(ErrorCode::RateLimit.as_str(), "RATE_LIMIT");
    assert_eq!(ErrorCode::ServiceError.as_str(), "SERVICE_ERROR");
    assert_eq!(ErrorCode::Timeout.as_str(), "TIMEOUT");
    assert_eq!(ErrorCode::NoMatch.as_str(), "NO_MATCH");
    assert_eq!(ErrorCode::InvalidResponse.as_str(), "INVALID_RESPONSE");
}

// --- image input normalization ---

#[test]
fn strips_data_uri_prefix() {
    assert_eq!(
        strip_data_uri("data:image/jpeg;base64,AAAA"),
        "AAAA"
    );
    assert_eq!(strip_data_uri("AAAA"), "AAAA");
}

#[test]
fn strip_is_idempotent() {
    let once = strip_data_uri("data:image/png;base64,QUJD");
    assert_eq!(strip_data_uri(once), once);
}

#[test]
fn decoded_len_estimate_rounds_up() {
    assert_eq!(estimated_decoded_len(""), 0);
    assert_eq!(estimated_decoded_len("AAAA"), 3);
    assert_eq!(estimated_decoded_len("AAAAA"), 4); // ceil(5 * 0.75)
}

// --- tolerant JSON extraction ---

#[test]
fn extracts_bare_object() {
    let value = extract_first_json_object(r#"{"scientificName": "Monstera deliciosa"}"#).unwrap();
    assert_eq!(value["scientificName"], "Monstera deliciosa");
}

#[test]
fn extracts_from_markdown_fence() {
    let text = "Here you go:\n```json\n{\"confidence\": 0.55, \"genus\": \"Monstera\"}\n```\nHope that helps!";
    let value = extract_first_json_object(text).unwrap();
    assert_eq!(value["genus"], "Monstera");
}

#[test]
fn handles_nested_objects_and_braces_in_strings() {
    let text = r#"prefix {"a": {"b": "{not a brace}"}, "c": 1} suffix"#;
    let value = extract_first_json_object(text).unwrap();
    assert_eq!(value["c"], 1);
    assert_eq!(value["a"]["b"], "{not a brace}");
}

#[test]
fn no_object_returns_none() {
    assert!(extract_first_json_object("no json here").is_none());
    assert!(extract_first_json_object("{truncated").is_none());
}

#[test]
fn unknown_candidate_is_low_confidence_sentinel() {
    let candidate = SpeciesCandidate::unknown();
    assert_eq!(candidate.scientific_name, "Unknown");
    assert_eq!(candidate.confidence, 0.0);
    assert!(candidate.common_names.is_empty());
}
