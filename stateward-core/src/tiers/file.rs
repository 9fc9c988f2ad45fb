/*!
File-backed flat store for the secondary tier.
*/

use super::FlatStore;
use crate::{Result, StatewardError};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// Single JSON object stored in one file
///
/// Writes go to a sibling temporary file first and are renamed into place,
/// so a crash mid-write leaves the previous entry intact. Parent
/// directories are created on demand.
#[derive(Debug, Clone)]
pub struct FileFlatStore {
    path: PathBuf,
}

impl FileFlatStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    StatewardError::storage(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl FlatStore for FileFlatStore {
    fn put(&self, fields: &Map<String, Value>) -> Result<()> {
        self.ensure_parent_dir()?;

        let bytes = serde_json::to_vec(fields)?;
        let temp = self.temp_path();
        fs::write(&temp, bytes).map_err(|e| {
            StatewardError::storage(format!("Failed to write {}: {}", temp.display(), e))
        })?;
        fs::rename(&temp, &self.path).map_err(|e| {
            StatewardError::storage(format!(
                "Failed to move {} into place: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }

    fn get(&self) -> Result<Option<Map<String, Value>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path).map_err(|e| {
            StatewardError::storage(format!("Failed to read {}: {}", self.path.display(), e))
        })?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| {
                StatewardError::storage(format!(
                    "Failed to delete {}: {}",
                    self.path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_clear() {
        let dir = TempDir::new().unwrap();
        let store = FileFlatStore::new(dir.path().join("critical.json"));
        assert_eq!(store.get().unwrap(), None);

        let fields = json!({"user_id": "u-1", "active_tab": "pontos"})
            .as_object()
            .cloned()
            .unwrap();
        store.put(&fields).unwrap();
        assert_eq!(store.get().unwrap(), Some(fields));
        assert!(!store.temp_path().exists());

        store.clear().unwrap();
        assert_eq!(store.get().unwrap(), None);
        store.clear().unwrap();
    }

    #[test]
    fn test_nested_directories_are_created() {
        let dir = TempDir::new().unwrap();
        let store = FileFlatStore::new(dir.path().join("a/b/c/critical.json"));
        store.put(&Map::new()).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("critical.json");
        fs::write(&path, b"{not json").unwrap();

        let store = FileFlatStore::new(&path);
        assert!(matches!(store.get(), Err(StatewardError::Json(_))));
    }
}
