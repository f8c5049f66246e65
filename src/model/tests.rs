use super::*;

#[test]
fn enum_names_round_trip() {
    for health in [
        PlantHealth::Thriving,
        PlantHealth::Healthy,
        PlantHealth::Struggling,
        PlantHealth::Critical,
    ] {
        assert_eq!(PlantHealth::parse(health.as_str()), Some(health));
    }
    assert_eq!(PlantHealth::parse("wilting"), None);
}

#[test]
fn tier_serializes_lowercase() {
    assert_eq!(serde_json::to_string(&Tier::Premium).unwrap(), "\"premium\"");
    let parsed: Tier = serde_json::from_str("\"free\"").unwrap();
    assert_eq!(parsed, Tier::Free);
}

#[test]
fn issue_status_transitions() {
    assert!(IssueStatus::Active.can_transition_to(IssueStatus::Treating));
    assert!(IssueStatus::Treating.can_transition_to(IssueStatus::Resolved));
    assert!(IssueStatus::Treating.can_transition_to(IssueStatus::Recurring));
    assert!(IssueStatus::Recurring.can_transition_to(IssueStatus::Active));

    // resolved is terminal
    assert!(!IssueStatus::Resolved.can_transition_to(IssueStatus::Active));
    assert!(!IssueStatus::Resolved.can_transition_to(IssueStatus::Treating));
    // no skipping straight to resolved
    assert!(!IssueStatus::Active.can_transition_to(IssueStatus::Resolved));
}

#[test]
fn reminder_recurrence_requires_both_fields() {
    let mut reminder = Reminder {
        id: new_id(),
        user_id: "u1".into(),
        plant_id: "p1".into(),
        kind: "water".into(),
        due_date: Utc::now(),
        frequency_days: Some(7),
        interval: Some(1),
        completed: false,
        skipped: false,
    };
    assert!(reminder.is_recurring());

    reminder.interval = None;
    assert!(!reminder.is_recurring());

    reminder.interval = Some(0);
    assert!(!reminder.is_recurring());
}

#[test]
fn message_record_wire_shape_is_camel_case() {
    let msg = MessageRecord {
        id: "m1".into(),
        session_id: "s1".into(),
        role: MessageRole::Assistant,
        content: "water weekly".into(),
        input_tokens: Some(120),
        output_tokens: Some(40),
        model: Some("claude-haiku".into()),
        action_items: vec!["repot in spring".into()],
        created_at: Utc::now(),
    };
    let json = serde_json::to_value(&msg).unwrap();
    assert_eq!(json["sessionId"], "s1");
    assert_eq!(json["role"], "assistant");
    assert_eq!(json["actionItems"][0], "repot in spring");
}
