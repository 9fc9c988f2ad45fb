//! Timestamp normalization for fetched documents.
//!
//! Backends hand timestamps back in their own shape, usually
//! `{ "seconds": .., "nanoseconds": .. }` (or the underscored variant).
//! Configured top-level fields in that shape become ISO-8601 strings with
//! millisecond precision; anything else is left as it is.

use super::remote::Document;
use chrono::{DateTime, SecondsFormat};
use serde_json::Value;

/// Convert a backend timestamp value to ISO-8601, if it is one
pub fn timestamp_to_iso(value: &Value) -> Option<String> {
    let object = value.as_object()?;
    let seconds = object
        .get("seconds")
        .or_else(|| object.get("_seconds"))?
        .as_i64()?;
    let nanos = object
        .get("nanoseconds")
        .or_else(|| object.get("_nanoseconds"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let nanos = u32::try_from(nanos).ok()?;

    DateTime::from_timestamp(seconds, nanos)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Normalize `fields` of every document in place
pub fn normalize_documents<S: AsRef<str>>(documents: &mut [Document], fields: &[S]) {
    for document in documents.iter_mut() {
        for field in fields {
            if let Some(value) = document.get_mut(field.as_ref()) {
                if let Some(iso) = timestamp_to_iso(value) {
                    *value = Value::String(iso);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_both_timestamp_shapes() {
        assert_eq!(
            timestamp_to_iso(&json!({"seconds": 1_700_000_000, "nanoseconds": 250_000_000})),
            Some("2023-11-14T22:13:20.250Z".to_string())
        );
        assert_eq!(
            timestamp_to_iso(&json!({"_seconds": 0, "_nanoseconds": 0})),
            Some("1970-01-01T00:00:00.000Z".to_string())
        );
        assert_eq!(timestamp_to_iso(&json!("2024-01-01T00:00:00Z")), None);
        assert_eq!(timestamp_to_iso(&json!({"nanoseconds": 5})), None);
    }

    #[test]
    fn test_only_configured_fields_are_touched() {
        let mut docs = vec![json!({
            "id": "t1",
            "criadoEm": {"seconds": 86_400, "nanoseconds": 0},
            "prazo": {"seconds": 86_400, "nanoseconds": 0},
            "atualizadoEm": "already text"
        })
        .as_object()
        .cloned()
        .unwrap()];

        normalize_documents(&mut docs, &["criadoEm", "atualizadoEm"]);

        assert_eq!(docs[0]["criadoEm"], json!("1970-01-02T00:00:00.000Z"));
        assert_eq!(docs[0]["prazo"], json!({"seconds": 86_400, "nanoseconds": 0}));
        assert_eq!(docs[0]["atualizadoEm"], json!("already text"));
    }
}
