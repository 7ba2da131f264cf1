//! Record tables for control-plane state.
//!
//! Each table keeps its rows in memory behind an `RwLock`. When a state
//! directory is configured, the whole table is written to `<dir>/<name>.json`
//! after every mutation (write to a temp file, then rename) and loaded back on
//! startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ControlError, Result};

/// Error text for records found mid-transition when a table is reloaded.
pub(crate) const INTERRUPTED: &str = "operation interrupted by control plane restart";

/// A keyed table of records.
pub struct RecordTable<T> {
    name: &'static str,
    rows: RwLock<BTreeMap<String, T>>,
    path: Option<PathBuf>,
}

impl<T> RecordTable<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    /// Create a table that lives only in memory.
    pub fn in_memory(name: &'static str) -> Self {
        Self {
            name,
            rows: RwLock::new(BTreeMap::new()),
            path: None,
        }
    }

    /// Create a table persisted under `dir`, loading existing rows.
    pub fn persistent(name: &'static str, dir: &Path) -> Result<Self> {
        let path = dir.join(format!("{}.json", name));
        let rows = if path.exists() {
            let json = std::fs::read_to_string(&path).map_err(|e| {
                ControlError::internal(name, format!("failed to read {}: {}", path.display(), e))
            })?;
            let rows: BTreeMap<String, T> = serde_json::from_str(&json).map_err(|e| {
                ControlError::internal(name, format!("failed to parse {}: {}", path.display(), e))
            })?;
            info!(table = name, count = rows.len(), path = %path.display(), "Records loaded from disk");
            rows
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            name,
            rows: RwLock::new(rows),
            path: Some(path),
        })
    }

    fn poisoned(&self) -> ControlError {
        ControlError::internal(self.name, "lock poisoned")
    }

    /// Get a row by id.
    pub fn get(&self, id: &str) -> Option<T> {
        self.rows.read().ok().and_then(|rows| rows.get(id).cloned())
    }

    /// Get a row by id or fail with `NotFound`.
    pub fn require(&self, id: &str) -> Result<T> {
        self.get(id).ok_or_else(|| ControlError::not_found(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rows.read().map(|rows| rows.contains_key(id)).unwrap_or(false)
    }

    /// All rows, ordered by id.
    pub fn list(&self) -> Vec<T> {
        self.rows
            .read()
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Rows matching a predicate, ordered by id.
    pub fn filter(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.rows
            .read()
            .map(|rows| rows.values().filter(|r| pred(r)).cloned().collect())
            .unwrap_or_default()
    }

    /// Insert a new row. Fails with `Conflict` if the id is taken.
    pub fn insert(&self, id: &str, row: T) -> Result<()> {
        let mut rows = self.rows.write().map_err(|_| self.poisoned())?;
        if rows.contains_key(id) {
            return Err(ControlError::conflict(id, format!("{} record already exists", self.name)));
        }
        rows.insert(id.to_string(), row);
        self.flush(&rows)
    }

    /// Mutate a row in place and return the updated copy.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut T)) -> Result<T> {
        let mut rows = self.rows.write().map_err(|_| self.poisoned())?;
        let row = rows.get_mut(id).ok_or_else(|| ControlError::not_found(id))?;
        f(row);
        let updated = row.clone();
        self.flush(&rows)?;
        Ok(updated)
    }

    /// Remove a row, returning it if present.
    pub fn remove(&self, id: &str) -> Result<Option<T>> {
        let mut rows = self.rows.write().map_err(|_| self.poisoned())?;
        let removed = rows.remove(id);
        if removed.is_some() {
            self.flush(&rows)?;
        }
        Ok(removed)
    }

    /// Remove all rows matching a predicate. Returns how many were removed.
    pub fn remove_where(&self, pred: impl Fn(&T) -> bool) -> Result<usize> {
        let mut rows = self.rows.write().map_err(|_| self.poisoned())?;
        let before = rows.len();
        rows.retain(|_, r| !pred(r));
        let removed = before - rows.len();
        if removed > 0 {
            self.flush(&rows)?;
        }
        Ok(removed)
    }

    fn flush(&self, rows: &BTreeMap<String, T>) -> Result<()> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(()),
        };

        let io_err = |e: std::io::Error| {
            ControlError::internal(self.name, format!("failed to persist {}: {}", path.display(), e))
        };

        let json = serde_json::to_string_pretty(rows)
            .map_err(|e| ControlError::internal(self.name, e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;

        debug!(table = self.name, count = rows.len(), "Records persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        value: u32,
    }

    #[test]
    fn test_insert_update_remove() {
        let table = RecordTable::in_memory("rows");
        table.insert("a", Row { value: 1 }).unwrap();
        assert!(matches!(
            table.insert("a", Row { value: 2 }),
            Err(ControlError::Conflict { .. })
        ));

        let updated = table.update("a", |r| r.value = 5).unwrap();
        assert_eq!(updated.value, 5);
        assert!(matches!(table.update("b", |_| {}), Err(ControlError::NotFound { .. })));

        assert_eq!(table.remove("a").unwrap(), Some(Row { value: 5 }));
        assert!(table.list().is_empty());
    }

    #[test]
    fn test_rows_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let table = RecordTable::persistent("rows", dir.path()).unwrap();
            table.insert("a", Row { value: 1 }).unwrap();
            table.insert("b", Row { value: 2 }).unwrap();
            table.update("b", |r| r.value = 3).unwrap();
        }

        let reloaded: RecordTable<Row> = RecordTable::persistent("rows", dir.path()).unwrap();
        assert_eq!(reloaded.get("a"), Some(Row { value: 1 }));
        assert_eq!(reloaded.get("b"), Some(Row { value: 3 }));
    }

    #[test]
    fn test_remove_where() {
        let table = RecordTable::in_memory("rows");
        for i in 0..4 {
            table.insert(&i.to_string(), Row { value: i }).unwrap();
        }
        assert_eq!(table.remove_where(|r| r.value % 2 == 0).unwrap(), 2);
        assert_eq!(table.list().len(), 2);
    }
}
