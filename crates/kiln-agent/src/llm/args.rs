//! Tolerant tool-argument parsing.
//!
//! Local model backends are sloppy about the argument field: it may arrive
//! as a JSON object, as a JSON string *containing* an object, or as one of
//! several empty shapes. Anything else is a parse error carried on the
//! [`kiln_core::ToolCall`] so the model gets a retry prompt instead of the
//! user getting an exception.

use serde_json::{Map, Value};

/// Parse raw argument text into an input map.
///
/// Accepted shapes: an object, a JSON string containing an object, and the
/// empty forms `""`, `"{}"`, `"null"`, and whitespace.
pub fn parse_argument_text(raw: &str) -> Result<Map<String, Value>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "{}" || trimmed == "null" || trimmed == "\"\"" {
        return Ok(Map::new());
    }

    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| format!("arguments are not valid JSON: {e}"))?;
    parse_argument_value(&value)
}

/// Parse an already-decoded argument value into an input map.
///
/// A string value is unquoted and reparsed once (vendor quirk: some
/// backends JSON-encode the object a second time).
pub fn parse_argument_value(value: &Value) -> Result<Map<String, Value>, String> {
    match value {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Map::new()),
        Value::String(s) => {
            let inner = s.trim();
            if inner.is_empty() || inner == "{}" || inner == "null" {
                return Ok(Map::new());
            }
            let reparsed: Value = serde_json::from_str(inner)
                .map_err(|e| format!("string-wrapped arguments are not valid JSON: {e}"))?;
            match reparsed {
                Value::Object(map) => Ok(map),
                Value::Null => Ok(Map::new()),
                other => Err(format!(
                    "string-wrapped arguments decode to {} instead of an object",
                    kind_of(&other)
                )),
            }
        }
        other => Err(format!(
            "arguments are {} instead of an object",
            kind_of(other)
        )),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_passes_through() {
        let map = parse_argument_text(r#"{"path": "a.txt", "limit": 5}"#).unwrap();
        assert_eq!(map["path"], "a.txt");
        assert_eq!(map["limit"], 5);
    }

    #[test]
    fn string_wrapped_object_is_unquoted() {
        let map = parse_argument_text(r#""{\"path\": \"a.txt\"}""#).unwrap();
        assert_eq!(map["path"], "a.txt");
    }

    #[test]
    fn empty_shapes_become_empty_maps() {
        for raw in ["", "   ", "{}", "null", "\"\""] {
            let map = parse_argument_text(raw).unwrap_or_else(|e| panic!("{raw:?}: {e}"));
            assert!(map.is_empty(), "{raw:?} should map to empty");
        }
    }

    #[test]
    fn invalid_json_is_an_error_not_a_panic() {
        let err = parse_argument_text("not json").unwrap_err();
        assert!(err.contains("not valid JSON"));
    }

    #[test]
    fn non_object_values_are_errors() {
        assert!(parse_argument_value(&json!([1, 2])).is_err());
        assert!(parse_argument_value(&json!(42)).is_err());
        assert!(parse_argument_value(&json!("\"just a string\"")).is_err());
    }

    #[test]
    fn null_value_is_empty_map() {
        assert!(parse_argument_value(&Value::Null).unwrap().is_empty());
    }

    #[test]
    fn string_wrapped_empty_forms() {
        assert!(parse_argument_value(&json!("")).unwrap().is_empty());
        assert!(parse_argument_value(&json!("{}")).unwrap().is_empty());
        assert!(parse_argument_value(&json!("null")).unwrap().is_empty());
    }
}
