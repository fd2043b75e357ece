use crate::episode::Action;

/// Recovers an ordered action list from free-form model output.
///
/// The text may be wrapped in code fences, use `True`/`False` or
/// single-quoted strings, or be truncated mid-record. Parsing is attempted
/// over a fixed sequence of independent repair strategies; the first one that
/// yields valid JSON wins. Never fails: unrecoverable input yields an empty
/// list.
pub fn recover_action_list(raw: &str) -> Vec<Action> {
    let stripped = strip_fences(raw);

    // Quote repair can damage voice lines that legitimately contain
    // apostrophes, so well-formed input gets a pass without it first.
    let passes = [
        normalize_booleans(&stripped),
        normalize_quoting(&normalize_booleans(&stripped)),
    ];

    for text in &passes {
        for repair in [repair_at_list_end, repair_at_record_end, repair_at_string_end] {
            if let Some(actions) = repair(text) {
                return actions;
            }
        }
    }
    Vec::new()
}

fn strip_fences(text: &str) -> String {
    text.replace("'''json", "")
        .replace("```json", "")
        .replace("'''", "")
        .replace("```", "")
}

fn normalize_booleans(text: &str) -> String {
    text.replace(": True", ": true").replace(": False", ": false")
}

fn normalize_quoting(text: &str) -> String {
    text.replace("''", "\"\"")
        .replace(" '", " \"")
        .replace("':", "\":")
        .replace("{'", "{\"")
        .replace("', ", "\", ")
}

/// Parse up to and including the last `]`.
fn repair_at_list_end(text: &str) -> Option<Vec<Action>> {
    let end = text.rfind(']')?;
    parse_actions(&text[..=end])
}

/// No `]` present: close the list after the last complete record.
fn repair_at_record_end(text: &str) -> Option<Vec<Action>> {
    if text.contains(']') {
        return None;
    }
    let end = text.rfind('}')?;
    parse_actions(&format!("{}]", &text[..=end]))
}

/// Truncated inside a record: close at the last complete string value.
fn repair_at_string_end(text: &str) -> Option<Vec<Action>> {
    let end = text.rfind('"')?;
    parse_actions(&format!("{}}}]", &text[..=end]))
}

fn parse_actions(text: &str) -> Option<Vec<Action>> {
    serde_json::from_str::<Vec<Action>>(text).ok()
}

/// Extracts a fenced script block and trims it to its first body marker.
/// Returns an empty string when no recognizable body is present.
pub fn recover_script_body(raw: &str) -> String {
    let mut text = raw.to_string();
    for fence in ["'''", "```"] {
        if let Some(start) = text.find(fence) {
            let after = &text[start + fence.len()..];
            // Skip an optional language tag on the opening fence line.
            let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
            let body = &after[body_start..];
            text = match body.find(fence) {
                Some(end) => body[..end].to_string(),
                None => body.to_string(),
            };
        }
    }
    match text.find("import") {
        Some(index) => text[index..].trim().to_string(),
        None => String::new(),
    }
}
