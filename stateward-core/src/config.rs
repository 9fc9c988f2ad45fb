//! Engine configuration
//!
//! Every tunable the engine uses lives in [`EngineConfig`]: save cadence,
//! compression thresholds and timeouts, the critical field allow-list,
//! the tracked remote collections and where the on-disk tiers live.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Snapshot format tag written into every capture
pub const STATE_VERSION: &str = "2.0";

/// Collections synchronized by default
pub const DEFAULT_COLLECTIONS: &[&str] = &[
    "usuarios",
    "empresas",
    "setores",
    "ferramentas",
    "inventario",
    "emprestimos",
    "tarefas",
    "pontos",
    "avaliacoes",
    "conversas",
    "mensagens",
];

/// Snapshot keys mirrored to the secondary tier on every save
pub const DEFAULT_CRITICAL_FIELDS: &[&str] = &["user_id", "active_tab", "forms", "scroll_position"];

/// Flat settings that may be captured into a snapshot
pub const DEFAULT_ALLOWED_SETTINGS: &[&str] = &["theme", "language", "preferences", "abaAtiva"];

/// Top-level document fields holding backend timestamps
pub const DEFAULT_TIMESTAMP_FIELDS: &[&str] = &["criadoEm", "atualizadoEm"];

/// Configuration for the persistence and sync engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval between timer-driven saves
    #[serde(with = "duration_ms")]
    pub auto_save_interval: Duration,
    /// Version tag stamped on snapshots
    pub state_version: String,
    /// Serialized snapshots above this size are compressed
    pub compression_threshold_bytes: usize,
    /// Serialized snapshots above this size are not written at all
    pub max_state_size_bytes: usize,
    /// Snapshot keys redundantly written to the secondary tier
    pub critical_fields: Vec<String>,
    /// Flat settings keys allowed into the snapshot
    pub allowed_settings: Vec<String>,
    /// Delegate timeout for application state payloads
    #[serde(with = "duration_ms")]
    pub state_compress_timeout: Duration,
    /// Delegate timeout for collection payloads
    #[serde(with = "duration_ms")]
    pub collection_compress_timeout: Duration,
    /// Validity window of a cached collection
    #[serde(with = "duration_ms")]
    pub cache_duration: Duration,
    /// Collections with more items than this are compressed on disk
    pub collection_compress_min_items: usize,
    /// Remote collections kept in the local cache
    pub tracked_collections: Vec<String>,
    /// Document fields normalized to ISO-8601 strings on fetch
    pub timestamp_fields: Vec<String>,
    /// Base directory for the on-disk tiers (None keeps everything in memory)
    pub data_dir: Option<PathBuf>,
}

impl EngineConfig {
    /// Set the base directory for the on-disk tiers
    pub fn with_data_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.data_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Replace the tracked collection list
    pub fn with_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tracked_collections = collections.into_iter().map(Into::into).collect();
        self
    }

    /// Path of the primary tier database, if persisted to disk
    pub fn primary_db_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("state.db"))
    }

    /// Path of the secondary tier file, if persisted to disk
    pub fn secondary_path(&self) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join("app_state_critical.json"))
    }

    /// Whether a snapshot key belongs to the critical set
    pub fn is_critical(&self, key: &str) -> bool {
        self.critical_fields.iter().any(|field| field == key)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.auto_save_interval.is_zero() {
            return Err(crate::StatewardError::validation(
                "auto_save_interval must be greater than zero",
            ));
        }
        if self.state_compress_timeout.is_zero() || self.collection_compress_timeout.is_zero() {
            return Err(crate::StatewardError::validation(
                "compression timeouts must be greater than zero",
            ));
        }
        if self.cache_duration.is_zero() {
            return Err(crate::StatewardError::validation(
                "cache_duration must be greater than zero",
            ));
        }
        if self.max_state_size_bytes < self.compression_threshold_bytes {
            return Err(crate::StatewardError::validation(
                "max_state_size_bytes must not be below compression_threshold_bytes",
            ));
        }
        if let Some(name) = self.tracked_collections.iter().find(|c| c.trim().is_empty()) {
            return Err(crate::StatewardError::validation(format!(
                "invalid collection name: {name:?}"
            )));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            auto_save_interval: Duration::from_secs(1),
            state_version: STATE_VERSION.to_string(),
            compression_threshold_bytes: 1024,
            max_state_size_bytes: 5 * 1024 * 1024,
            critical_fields: to_strings(DEFAULT_CRITICAL_FIELDS),
            allowed_settings: to_strings(DEFAULT_ALLOWED_SETTINGS),
            state_compress_timeout: Duration::from_secs(5),
            collection_compress_timeout: Duration::from_secs(30),
            cache_duration: Duration::from_secs(60 * 60),
            collection_compress_min_items: 100,
            tracked_collections: to_strings(DEFAULT_COLLECTIONS),
            timestamp_fields: to_strings(DEFAULT_TIMESTAMP_FIELDS),
            data_dir: None,
        }
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.auto_save_interval, Duration::from_secs(1));
        assert_eq!(config.compression_threshold_bytes, 1024);
        assert_eq!(config.cache_duration, Duration::from_secs(3600));
        assert_eq!(config.tracked_collections.len(), 11);
        assert!(config.is_critical("forms"));
        assert!(!config.is_critical("textareas"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_data_dir_paths() {
        let config = EngineConfig::default().with_data_dir("/var/lib/stateward");
        assert_eq!(
            config.primary_db_path(),
            Some(PathBuf::from("/var/lib/stateward/state.db"))
        );
        assert_eq!(
            config.secondary_path(),
            Some(PathBuf::from("/var/lib/stateward/app_state_critical.json"))
        );
        assert!(EngineConfig::default().primary_db_path().is_none());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = EngineConfig {
            auto_save_interval: Duration::ZERO,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_blank_collection() {
        let config = EngineConfig::default().with_collections(["tarefas", " "]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("invalid collection name"));
    }

    #[test]
    fn test_durations_round_trip_as_millis() {
        let config = EngineConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["cache_duration"], 3_600_000);

        let partial: EngineConfig =
            serde_json::from_str(r#"{"auto_save_interval": 250}"#).unwrap();
        assert_eq!(partial.auto_save_interval, Duration::from_millis(250));
        assert_eq!(partial.compression_threshold_bytes, 1024);
    }
}
