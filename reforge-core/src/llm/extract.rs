//! Pulling usable text out of heterogeneous model responses.
//!
//! Everything here stays behind the generator; callers only ever see a
//! finished `String` or a `GenerationError`.

use serde_json::Value;

/// Best-effort text from a Gemini-style response body.
///
/// Tried in order: a top-level `text` field, the non-thought text parts of
/// the first candidate, any text part at all (thoughts included), and
/// finally any string field named `text` anywhere in the document.
pub fn response_text(body: &Value) -> Option<String> {
    if let Some(text) = body.get("text").and_then(Value::as_str) {
        if !text.trim().is_empty() {
            return Some(text.to_string());
        }
    }

    let parts = body
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array);
    if let Some(parts) = parts {
        let answer: String = parts
            .iter()
            .filter(|p| !p.get("thought").and_then(Value::as_bool).unwrap_or(false))
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect();
        if !answer.trim().is_empty() {
            return Some(answer);
        }
        let any: String = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect();
        if !any.trim().is_empty() {
            return Some(any);
        }
    }

    find_text_field(body)
}

fn find_text_field(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(s)) = map.get("text") {
                if !s.trim().is_empty() {
                    return Some(s.clone());
                }
            }
            map.values().find_map(find_text_field)
        }
        Value::Array(items) => items.iter().find_map(find_text_field),
        _ => None,
    }
}

/// Body of the first fenced code block, or the trimmed text when there is
/// no fence. Fences count only at the start of a line, so backticks inside
/// a docstring never split the code. An unterminated fence runs to the end
/// of the text.
pub fn strip_code_fences(text: &str) -> String {
    let mut lines = text.lines();
    if !lines.by_ref().any(is_opening_fence) {
        return text.trim().to_string();
    }
    let body: Vec<&str> = lines.take_while(|line| line.trim_end() != "```").collect();
    let mut out = body.join("\n").trim_matches('\n').to_string();
    out.push('\n');
    out
}

/// A line-leading fence with an optional info string such as `python`.
fn is_opening_fence(line: &str) -> bool {
    line.strip_prefix("```").is_some_and(|info| {
        info.trim()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

/// The outermost `{ ... }` object in `text`, fences removed.
pub fn json_fragment(text: &str) -> Option<String> {
    let unfenced = strip_code_fences(text);
    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    (end > start).then(|| unfenced[start..=end].to_string())
}
