//! Pulling one strict JSON object out of a model reply.

use serde::de::DeserializeOwned;

/// First balanced `{...}` object in `raw`. Braces inside string literals are
/// ignored, so prose or code fences around the object are tolerated.
pub fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let body = &raw[start..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&body[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Deserialize the first JSON object in `raw` into `T`. The error string is
/// fed back to the model on a schema retry, so it names what was wrong.
pub fn parse_strict<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    let json = extract_json(raw).ok_or_else(|| "reply contained no JSON object".to_string())?;
    serde_json::from_str(json).map_err(|e| format!("reply did not match the schema: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(deny_unknown_fields)]
    struct Answer {
        answer: String,
    }

    #[test]
    fn test_extracts_from_fenced_reply() {
        let raw = "Sure:\n```json\n{\"answer\": \"42\"}\n```\nDone.";
        assert_eq!(extract_json(raw), Some("{\"answer\": \"42\"}"));
    }

    #[test]
    fn test_braces_inside_strings_are_ignored() {
        let raw = r#"{"answer": "use {x} and \"}\" here"} trailing {"#;
        let parsed: Answer = parse_strict(raw).unwrap();
        assert_eq!(parsed.answer, "use {x} and \"}\" here");
    }

    #[test]
    fn test_nested_objects() {
        let raw = r#"prefix {"a": {"b": {"c": 1}}, "d": 2} suffix"#;
        assert_eq!(extract_json(raw), Some(r#"{"a": {"b": {"c": 1}}, "d": 2}"#));
    }

    #[test]
    fn test_unbalanced_and_missing() {
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("{\"open\": 1"), None);
        assert!(parse_strict::<Answer>("nothing").is_err());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = parse_strict::<Answer>(r#"{"answer": "x", "extra": true}"#).unwrap_err();
        assert!(err.contains("schema"));
    }
}
