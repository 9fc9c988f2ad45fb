//! Snapshot diff calculator.
//!
//! Compares two snapshots one top-level key at a time using structural
//! equality of their JSON values. Capture metadata (`version`,
//! `captured_at`) is ignored, otherwise every tick would look like a change.
//!
//! The diff is shallow: a change anywhere under `forms` reports the whole
//! `forms` value. It only decides whether a save happens; the writers always
//! persist the full snapshot.

use crate::snapshot::{Snapshot, METADATA_KEYS};
use crate::Result;
use serde_json::{Map, Value};

/// Changed top-level keys and their new values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    changes: Map<String, Value>,
}

impl Diff {
    /// Names of the changed keys
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.changes.keys().map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.changes.contains_key(key)
    }

    /// New value of a changed key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.changes.get(key)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_changes(self) -> Map<String, Value> {
        self.changes
    }
}

/// Diff two sets of top-level fields
///
/// A key present in `current` but missing from `previous` counts as
/// changed. A key that disappeared from `current` is reported with a
/// `null` value.
pub fn diff_fields(previous: &Map<String, Value>, current: &Map<String, Value>) -> Option<Diff> {
    let mut changes: Map<String, Value> = current
        .iter()
        .filter(|&(key, value)| {
            !METADATA_KEYS.contains(&key.as_str()) && previous.get(key) != Some(value)
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    for key in previous.keys() {
        if !METADATA_KEYS.contains(&key.as_str()) && !current.contains_key(key) {
            changes.insert(key.clone(), Value::Null);
        }
    }

    if changes.is_empty() {
        None
    } else {
        Some(Diff { changes })
    }
}

/// Diff two snapshots; `None` means "nothing to write"
pub fn diff(previous: &Snapshot, current: &Snapshot) -> Result<Option<Diff>> {
    let previous = previous.to_fields()?;
    let current = current.to_fields()?;
    Ok(diff_fields(&previous, &current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with_form(value: i64) -> Snapshot {
        let mut snapshot = Snapshot::new("2.0");
        snapshot
            .forms
            .insert("f".into(), json!({"a": value}).as_object().cloned().unwrap());
        snapshot
    }

    #[test]
    fn test_identical_snapshots_have_no_diff() {
        let snapshot = with_form(1);
        assert!(diff(&snapshot, &snapshot).unwrap().is_none());
    }

    #[test]
    fn test_recapture_one_tick_later_has_no_diff() {
        let first = with_form(1);
        let mut second = with_form(1);
        second.captured_at = first.captured_at + 1000;
        assert!(diff(&first, &second).unwrap().is_none());
    }

    #[test]
    fn test_single_key_change_is_reported_alone() {
        let before = with_form(1);
        let mut after = before.clone();
        after.active_tab = Some("estoque".into());

        let changes = diff(&before, &after).unwrap().unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes.contains("active_tab"));
        assert_eq!(changes.get("active_tab"), Some(&json!("estoque")));
    }

    #[test]
    fn test_nested_change_reports_whole_top_level_key() {
        let before = with_form(1);
        let after = with_form(2);

        let changes = diff(&before, &after).unwrap().unwrap();
        assert_eq!(changes.keys().collect::<Vec<_>>(), vec!["forms"]);
        assert_eq!(changes.get("forms"), Some(&json!({"f": {"a": 2}})));
    }

    #[test]
    fn test_key_absent_in_previous_counts_as_changed() {
        let previous = Map::new();
        let current = json!({"user_id": "u-9"}).as_object().cloned().unwrap();
        let changes = diff_fields(&previous, &current).unwrap();
        assert!(changes.contains("user_id"));
    }

    #[test]
    fn test_cleared_key_is_reported_as_null() {
        let mut before = with_form(1);
        before.active_tab = Some("pontos".into());
        let mut after = before.clone();
        after.active_tab = None;

        let changes = diff(&before, &after).unwrap().unwrap();
        assert_eq!(changes.get("active_tab"), Some(&Value::Null));
    }

    #[test]
    fn test_version_change_alone_is_ignored() {
        let before = with_form(1);
        let mut after = before.clone();
        after.version = "3.0".into();
        assert!(diff(&before, &after).unwrap().is_none());
    }
}
