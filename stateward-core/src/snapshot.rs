/*!
Snapshot model.

A [`Snapshot`] is the full serializable picture of the application surface
at one point in time. It has a fixed set of top-level keys; the diff
calculator and the tier writers work key by key, so the JSON shape of this
struct is the storage contract for every tier.
*/

use crate::{Result, StatewardError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Top-level keys that carry capture metadata rather than state
pub const METADATA_KEYS: &[&str] = &["version", "captured_at"];

/// Keys written to the ephemeral tier
pub const SESSION_KEYS: &[&str] = &["location", "scroll_position", "active_tab", "captured_at"];

/// Scroll offset of one scrollable element
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementScroll {
    pub top: f64,
    pub left: f64,
}

/// Global and per-element scroll offsets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrollPosition {
    pub x: f64,
    pub y: f64,
    pub elements: BTreeMap<String, ElementScroll>,
}

/// State of a single text-like input
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputState {
    pub value: String,
    #[serde(rename = "type")]
    pub input_type: String,
    pub checked: bool,
}

/// State of a select element
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectState {
    pub value: String,
    pub selected_index: Option<i64>,
    pub multiple: bool,
    pub selected_options: Option<Vec<String>>,
}

/// State of a textarea, including the caret selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextAreaState {
    pub value: String,
    pub selection_start: Option<u32>,
    pub selection_end: Option<u32>,
}

/// Captured application state
///
/// Snapshots restored from the secondary or tertiary tier are partial:
/// keys that were never written come back as their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub version: String,
    /// Capture time, epoch milliseconds
    pub captured_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scroll_position: Option<ScrollPosition>,
    pub forms: BTreeMap<String, Map<String, Value>>,
    pub inputs: BTreeMap<String, InputState>,
    pub checkboxes: BTreeMap<String, bool>,
    pub radios: BTreeMap<String, String>,
    pub selects: BTreeMap<String, SelectState>,
    pub textareas: BTreeMap<String, TextAreaState>,
    pub settings: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_tab: Option<String>,
    pub open_modals: BTreeSet<String>,
    pub expanded_elements: BTreeSet<String>,
}

impl Snapshot {
    /// Empty snapshot stamped with version and current time
    pub fn new<S: Into<String>>(version: S) -> Self {
        Self {
            version: version.into(),
            captured_at: Utc::now().timestamp_millis(),
            ..Self::default()
        }
    }

    /// Top-level keys and their JSON values
    pub fn to_fields(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(StatewardError::validation(format!(
                "snapshot serialized to non-object: {other}"
            ))),
        }
    }

    /// Rebuild a (possibly partial) snapshot from top-level fields
    pub fn from_fields(fields: Map<String, Value>) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(fields))?)
    }

    /// Subset of top-level fields restricted to `keys`
    ///
    /// Empty collections and absent options are left out, so the subset only
    /// carries keys with something worth restoring.
    pub fn subset<S: AsRef<str>>(&self, keys: &[S]) -> Result<Map<String, Value>> {
        let fields = self.to_fields()?;
        Ok(fields
            .into_iter()
            .filter(|(key, value)| {
                keys.iter().any(|k| k.as_ref() == key) && !is_empty_value(value)
            })
            .collect())
    }

    /// Serialized JSON text of the full snapshot
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a snapshot from JSON text
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Whether the snapshot carries any state besides metadata
    pub fn is_empty(&self) -> bool {
        let blank = Snapshot {
            version: self.version.clone(),
            captured_at: self.captured_at,
            ..Snapshot::default()
        };
        *self == blank
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
