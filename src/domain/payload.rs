use serde_json::{Map, Value as JsonValue};

/// A search/update result entry after normalization: always a JSON object.
pub type IssuePayload = Map<String, JsonValue>;

/// Normalizes raw callback output into issue payloads. Non-object entries
/// are dropped; module callbacks serialize through serde, so datetimes
/// arrive as RFC 3339 strings already.
pub fn normalize_entries(entries: Vec<JsonValue>) -> Vec<IssuePayload> {
    entries
        .into_iter()
        .filter_map(|entry| match entry {
            JsonValue::Object(map) => Some(map),
            other => {
                tracing::debug!(entry = %other, "discarding non-object issue entry");
                None
            }
        })
        .collect()
}

/// Extracts the issue key named by `model_id_key`, stringifying scalar
/// values. Objects, arrays, and null never identify an issue.
pub fn extract_model_id(payload: &IssuePayload, model_id_key: &str) -> Option<String> {
    match payload.get(model_id_key)? {
        JsonValue::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        JsonValue::Number(number) => Some(number.to_string()),
        JsonValue::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_objects_and_drops_everything_else() {
        let normalized = normalize_entries(vec![
            serde_json::json!({"id": 1}),
            serde_json::json!("just a string"),
            serde_json::json!(42),
            serde_json::json!({"id": 2, "nested": {"at": "2026-03-01T12:00:00Z"}}),
            serde_json::json!(null),
        ]);
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].get("id"), Some(&serde_json::json!(1)));
        assert_eq!(normalized[1].get("id"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn model_id_stringifies_scalars() {
        let payload = |value: JsonValue| {
            let mut map = Map::new();
            map.insert("key".to_string(), value);
            map
        };

        assert_eq!(
            extract_model_id(&payload(serde_json::json!("host-1 ")), "key"),
            Some("host-1".to_string())
        );
        assert_eq!(
            extract_model_id(&payload(serde_json::json!(17)), "key"),
            Some("17".to_string())
        );
        assert_eq!(
            extract_model_id(&payload(serde_json::json!(true)), "key"),
            Some("true".to_string())
        );
        assert_eq!(extract_model_id(&payload(serde_json::json!(null)), "key"), None);
        assert_eq!(
            extract_model_id(&payload(serde_json::json!({"inner": 1})), "key"),
            None
        );
        assert_eq!(extract_model_id(&payload(serde_json::json!("")), "key"), None);
        assert_eq!(extract_model_id(&Map::new(), "key"), None);
    }
}
