//! JSON extraction from free-form model output.
use serde_json::{Map, Value};

use crate::error::ResponseFormatError;

/// Parse model output as JSON, trying in order: the whole trimmed text, the
/// first fenced code block, then the span from the first `{` to the last `}`.
pub fn parse_model_json(text: &str) -> Result<Value, ResponseFormatError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ResponseFormatError::new("empty response", text));
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    if let Some(block) = first_fenced_block(trimmed)
        && let Ok(value) = serde_json::from_str::<Value>(block)
    {
        return Ok(value);
    }

    if let Some(span) = brace_span(trimmed)
        && let Ok(value) = serde_json::from_str::<Value>(span)
    {
        return Ok(value);
    }

    Err(ResponseFormatError::new("no parseable JSON found", text))
}

/// Like [`parse_model_json`] but requires a JSON object.
pub fn parse_model_object(text: &str) -> Result<Map<String, Value>, ResponseFormatError> {
    match parse_model_json(text)? {
        Value::Object(map) => Ok(map),
        _ => Err(ResponseFormatError::new("expected a JSON object", text)),
    }
}

fn first_fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    // Optional language tag on the opening fence line.
    let body = match after_fence.find('\n') {
        Some(newline) => {
            let tag = after_fence[..newline].trim();
            if tag.is_empty() || tag.eq_ignore_ascii_case("json") {
                &after_fence[newline + 1..]
            } else if tag.starts_with('{') || tag.starts_with('[') {
                after_fence
            } else {
                &after_fence[newline + 1..]
            }
        }
        None => after_fence,
    };
    let end = body.find("```")?;
    Some(body[..end].trim())
}

fn brace_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({"score": 0.8, "feedback": "warm palette", "priority_fixes": ["tighten pacing"]})
    }

    #[test]
    fn parses_bare_fenced_and_embedded_objects() {
        let obj = sample();
        let text = obj.to_string();
        assert_eq!(parse_model_json(&text).unwrap(), obj);
        assert_eq!(
            parse_model_json(&format!("```json\n{text}\n```")).unwrap(),
            obj
        );
        assert_eq!(parse_model_json(&format!("```\n{text}\n```")).unwrap(), obj);
        assert_eq!(
            parse_model_json(&format!("explanatory text {text} trailing text")).unwrap(),
            obj
        );
    }

    #[test]
    fn fenced_block_after_prose_is_found() {
        let text = "Here is the plan:\n```json\n{\"plan\": []}\n```\nLet me know.";
        assert_eq!(parse_model_json(text).unwrap(), json!({"plan": []}));
    }

    #[test]
    fn unparseable_text_reports_truncated_preview() {
        let long = format!("not valid json {}", "x".repeat(400));
        let err = parse_model_json(&long).unwrap_err();
        assert!(err.preview.len() <= 200);
        assert!(err.preview.starts_with("not valid json"));
        assert!(parse_model_json("   ").is_err());
    }

    #[test]
    fn object_parse_rejects_non_objects() {
        assert!(parse_model_object("[1, 2, 3]").is_err());
        assert!(parse_model_object("{\"ok\": true}").is_ok());
    }
}
