/*!
Persistence tiers.

Three tiers with different trade-offs sit behind two small traits:

- **primary** ([`RecordStore`]): structured, high-capacity, keyed by record
  id. Backed by SQLite ([`SqliteRecordStore`]) or memory
  ([`MemoryRecordStore`]).
- **secondary** ([`FlatStore`]): one flat JSON object holding only the
  critical fields, on disk ([`FileFlatStore`]).
- **tertiary** ([`FlatStore`]): a minimal same-session subset that never
  outlives the process ([`SessionFlatStore`]).

[`TierManager`] exposes uniform put/get per tier. It does not decide
fallback order; the orchestrators do.
*/

pub mod file;
pub mod memory;
pub mod sqlite;

use crate::config::EngineConfig;
use crate::record::StorageRecord;
use crate::{Result, StatewardError};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

pub use file::FileFlatStore;
pub use memory::{MemoryRecordStore, SessionFlatStore};
pub use sqlite::SqliteRecordStore;

/// Table holding the application state record
pub const STATE_TABLE: &str = "states";
/// Table holding cached remote collections
pub const COLLECTION_TABLE: &str = "cached_data";

/// Keyed record storage (primary tier, collection cache)
#[cfg_attr(test, mockall::automock)]
pub trait RecordStore: Send + Sync {
    /// Insert or wholesale replace the record with the same id
    fn put(&self, record: &StorageRecord) -> Result<()>;

    /// Fetch a record by id
    fn get(&self, id: &str) -> Result<Option<StorageRecord>>;

    /// Remove a record; missing ids are not an error
    fn delete(&self, id: &str) -> Result<()>;

    /// All stored records
    fn list(&self) -> Result<Vec<StorageRecord>>;

    /// Remove every record
    fn clear(&self) -> Result<()>;
}

/// Single flat key-value entry (secondary and tertiary tiers)
pub trait FlatStore: Send + Sync {
    /// Replace the stored entry
    fn put(&self, fields: &Map<String, Value>) -> Result<()>;

    /// Read the stored entry
    fn get(&self) -> Result<Option<Map<String, Value>>>;

    /// Remove the stored entry
    fn clear(&self) -> Result<()>;
}

/// Tier identifiers, in fallback order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Primary,
    Secondary,
    Tertiary,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Primary, Tier::Secondary, Tier::Tertiary];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Primary => "primary",
            Tier::Secondary => "secondary",
            Tier::Tertiary => "tertiary",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner of the three persistence tiers
#[derive(Clone)]
pub struct TierManager {
    primary: Arc<dyn RecordStore>,
    secondary: Arc<dyn FlatStore>,
    tertiary: Arc<dyn FlatStore>,
}

impl TierManager {
    pub fn new(
        primary: Arc<dyn RecordStore>,
        secondary: Arc<dyn FlatStore>,
        tertiary: Arc<dyn FlatStore>,
    ) -> Self {
        Self {
            primary,
            secondary,
            tertiary,
        }
    }

    /// All three tiers in memory
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryRecordStore::new()),
            Arc::new(SessionFlatStore::new()),
            Arc::new(SessionFlatStore::new()),
        )
    }

    /// Build tiers from configuration
    ///
    /// With a data directory the primary tier is a SQLite file and the
    /// secondary tier a JSON file next to it; without one both fall back to
    /// memory. The tertiary tier is always process-local. A primary tier
    /// that cannot be opened is replaced by an [`UnavailableRecordStore`]
    /// so the remaining tiers stay usable.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let primary = open_record_store(config, STATE_TABLE);
        let secondary: Arc<dyn FlatStore> = match config.secondary_path() {
            Some(path) => Arc::new(FileFlatStore::new(path)),
            None => Arc::new(SessionFlatStore::new()),
        };
        Ok(Self::new(primary, secondary, Arc::new(SessionFlatStore::new())))
    }

    pub fn put_primary(&self, record: &StorageRecord) -> Result<()> {
        self.primary.put(record)
    }

    pub fn get_primary(&self, id: &str) -> Result<Option<StorageRecord>> {
        self.primary.get(id)
    }

    pub fn put_secondary(&self, fields: &Map<String, Value>) -> Result<()> {
        self.secondary.put(fields)
    }

    pub fn get_secondary(&self) -> Result<Option<Map<String, Value>>> {
        self.secondary.get()
    }

    pub fn put_tertiary(&self, fields: &Map<String, Value>) -> Result<()> {
        self.tertiary.put(fields)
    }

    pub fn get_tertiary(&self) -> Result<Option<Map<String, Value>>> {
        self.tertiary.get()
    }

    /// Wipe every tier; failures are logged and reported, not fatal
    pub fn clear_all(&self) -> Vec<(Tier, StatewardError)> {
        let results = [
            (Tier::Primary, self.primary.clear()),
            (Tier::Secondary, self.secondary.clear()),
            (Tier::Tertiary, self.tertiary.clear()),
        ];

        results
            .into_iter()
            .filter_map(|(tier, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    warn!(%tier, error = %e, "Failed to clear tier");
                    Some((tier, e))
                }
            })
            .collect()
    }
}

/// Open the record store backing the collection cache
pub fn open_collection_store(config: &EngineConfig) -> Result<Arc<dyn RecordStore>> {
    Ok(open_record_store(config, COLLECTION_TABLE))
}

fn open_record_store(config: &EngineConfig, table: &str) -> Arc<dyn RecordStore> {
    let opened = match config.primary_db_path() {
        Some(path) => SqliteRecordStore::open(path, table),
        None => SqliteRecordStore::open_in_memory(table),
    };
    match opened {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(table, error = %e, "Primary store unavailable, continuing without it");
            Arc::new(UnavailableRecordStore::new(Tier::Primary, e.to_string()))
        }
    }
}

/// Record store standing in for a tier that failed to open
///
/// Every call fails with [`StatewardError::TierUnavailable`], which the
/// orchestrators already treat as a per-tier failure.
#[derive(Debug, Clone)]
pub struct UnavailableRecordStore {
    tier: Tier,
    reason: String,
}

impl UnavailableRecordStore {
    pub fn new(tier: Tier, reason: impl Into<String>) -> Self {
        Self {
            tier,
            reason: reason.into(),
        }
    }

    fn unavailable<T>(&self) -> Result<T> {
        Err(StatewardError::tier_unavailable(self.tier.as_str(), self.reason.clone()))
    }
}

impl RecordStore for UnavailableRecordStore {
    fn put(&self, _record: &StorageRecord) -> Result<()> {
        self.unavailable()
    }

    fn get(&self, _id: &str) -> Result<Option<StorageRecord>> {
        self.unavailable()
    }

    fn delete(&self, _id: &str) -> Result<()> {
        self.unavailable()
    }

    fn list(&self) -> Result<Vec<StorageRecord>> {
        self.unavailable()
    }

    fn clear(&self) -> Result<()> {
        self.unavailable()
    }
}
