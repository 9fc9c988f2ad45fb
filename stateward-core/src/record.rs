/*!
Storage record schema shared by the primary tier and the collection cache.
*/

use crate::{Result, StatewardError};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Record id of the application state in the primary tier
pub const APP_STATE_ID: &str = "currentState";

/// What a record holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum RecordKind {
    /// The captured application state
    AppState,
    /// A cached remote collection
    Collection(String),
}

impl RecordKind {
    /// Label stored in the `collection` column
    pub fn label(&self) -> &str {
        match self {
            RecordKind::AppState => "appState",
            RecordKind::Collection(name) => name,
        }
    }

    /// Rebuild a kind from its stored label
    pub fn from_label(label: &str) -> Self {
        if label == "appState" {
            RecordKind::AppState
        } else {
            RecordKind::Collection(label.to_string())
        }
    }
}

/// One record per tier per logical resource, always replaced wholesale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRecord {
    pub id: String,
    pub kind: RecordKind,
    /// JSON text, or hex-encoded gzip when `compressed`
    pub data: String,
    pub compressed: bool,
    /// Write time, epoch milliseconds
    pub timestamp: i64,
    /// Number of items in the payload
    pub count: usize,
    /// SHA-256 of the uncompressed JSON text
    pub checksum: String,
}

impl StorageRecord {
    /// Build a record for `plain` (the uncompressed JSON) stored as `data`
    pub fn new(
        id: impl Into<String>,
        kind: RecordKind,
        plain: &str,
        data: String,
        compressed: bool,
        count: usize,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            data,
            compressed,
            timestamp: Utc::now().timestamp_millis(),
            count,
            checksum: compute_checksum(plain.as_bytes()),
        }
    }

    /// Uncompressed record, data doubling as the plain text
    pub fn plain(id: impl Into<String>, kind: RecordKind, plain: String, count: usize) -> Self {
        let mut record = Self::new(id, kind, &plain, String::new(), false, count);
        record.data = plain;
        record
    }

    /// Override the write time (used when re-persisting or in tests)
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Age of the record relative to `now_ms`
    pub fn age(&self, now_ms: i64) -> Duration {
        Duration::from_millis(u64::try_from(now_ms.saturating_sub(self.timestamp)).unwrap_or(0))
    }

    /// Whether the record is still inside a validity window
    pub fn is_fresh(&self, now_ms: i64, window: Duration) -> bool {
        self.age(now_ms) < window
    }

    /// Write time as a `DateTime`
    pub fn written_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }

    /// Check the uncompressed text against the stored checksum
    pub fn verify(&self, plain: &str) -> Result<()> {
        let actual = compute_checksum(plain.as_bytes());
        if actual == self.checksum {
            Ok(())
        } else {
            Err(StatewardError::IntegrityCheckFailed {
                expected: self.checksum.clone(),
                actual,
            })
        }
    }
}

/// SHA-256 of `data` as lowercase hex
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_stable() {
        assert_eq!(
            compute_checksum(b"test data"),
            "916f0027a575074ce72a331777c3478d6513f786a591bd892da1a577bf2335f9"
        );
    }

    #[test]
    fn test_plain_record_verifies() {
        let record = StorageRecord::plain(APP_STATE_ID, RecordKind::AppState, "{}".into(), 1);
        assert!(!record.compressed);
        assert_eq!(record.data, "{}");
        assert!(record.verify("{}").is_ok());
        assert!(matches!(
            record.verify("{\"x\":1}"),
            Err(StatewardError::IntegrityCheckFailed { .. })
        ));
    }

    #[test]
    fn test_freshness_window() {
        let hour = Duration::from_secs(3600);
        let record = StorageRecord::plain("tarefas", RecordKind::Collection("tarefas".into()), "[]".into(), 0)
            .with_timestamp(1_000_000);

        assert!(record.is_fresh(1_000_000 + 3_599_999, hour));
        assert!(!record.is_fresh(1_000_000 + 3_600_000, hour));
        assert!(!record.is_fresh(1_000_000 + 3_600_001, hour));
        // Clock moved backwards: age saturates to zero.
        assert!(record.is_fresh(0, hour));
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(RecordKind::AppState.label(), "appState");
        assert_eq!(RecordKind::from_label("tarefas"), RecordKind::Collection("tarefas".into()));
        assert_eq!(RecordKind::from_label("appState"), RecordKind::AppState);
    }
}
