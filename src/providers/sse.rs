use serde_json::Value;

/// One parsed Server-Sent Event: optional event name plus JSON data.
/// `data` is `None` for the `[DONE]` sentinel and for non-JSON payloads.
#[derive(Debug)]
pub struct SseEvent {
    pub name: Option<String>,
    pub data: Option<Value>,
}

/// Split a buffer of SSE text into events. Events end at a blank line;
/// multiple `data:` lines in one event are joined with newlines.
pub fn parse_events(chunk: &str) -> Vec<SseEvent> {
    let mut events = Vec::new();
    let mut name: Option<String> = None;
    let mut data = String::new();

    let mut flush = |name: &mut Option<String>, data: &mut String, events: &mut Vec<SseEvent>| {
        if data.is_empty() {
            *name = None;
            return;
        }
        let payload = data.trim();
        let parsed = if payload == "[DONE]" {
            None
        } else {
            serde_json::from_str::<Value>(payload).ok()
        };
        events.push(SseEvent {
            name: name.take(),
            data: parsed,
        });
        data.clear();
    };

    for line in chunk.lines() {
        if line.is_empty() {
            flush(&mut name, &mut data, &mut events);
        } else if let Some(value) = line.strip_prefix("event:") {
            name = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(value.trim_start());
        }
    }
    flush(&mut name, &mut data, &mut events);

    events
}
