/*!
In-memory stores.

[`SessionFlatStore`] is the tertiary tier: it lives and dies with the
process. [`MemoryRecordStore`] stands in for the primary tier when no
database is wanted.
*/

use super::{FlatStore, RecordStore};
use crate::record::StorageRecord;
use crate::{Result, StatewardError};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

fn poisoned(tier: &'static str) -> StatewardError {
    StatewardError::tier_unavailable(tier, "lock poisoned")
}

/// Record store kept in a map
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, StorageRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<MutexGuard<'_, HashMap<String, StorageRecord>>> {
        self.records.lock().map_err(|_| poisoned("primary"))
    }
}

impl RecordStore for MemoryRecordStore {
    fn put(&self, record: &StorageRecord) -> Result<()> {
        self.records()?.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<StorageRecord>> {
        Ok(self.records()?.get(id).cloned())
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.records()?.remove(id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<StorageRecord>> {
        let mut records: Vec<_> = self.records()?.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    fn clear(&self) -> Result<()> {
        self.records()?.clear();
        Ok(())
    }
}

/// Flat entry that does not outlive the process
#[derive(Debug, Default)]
pub struct SessionFlatStore {
    entry: Mutex<Option<Map<String, Value>>>,
}

impl SessionFlatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlatStore for SessionFlatStore {
    fn put(&self, fields: &Map<String, Value>) -> Result<()> {
        *self.entry.lock().map_err(|_| poisoned("tertiary"))? = Some(fields.clone());
        Ok(())
    }

    fn get(&self) -> Result<Option<Map<String, Value>>> {
        Ok(self.entry.lock().map_err(|_| poisoned("tertiary"))?.clone())
    }

    fn clear(&self) -> Result<()> {
        *self.entry.lock().map_err(|_| poisoned("tertiary"))? = None;
        Ok(())
    }
}
