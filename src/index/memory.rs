//! Reference index backend: an in-memory hash table with a persisted
//! snapshot, as spec.md §4.B requires ("reference implementation backs a
//! hash table plus a persisted snapshot").

use std::{collections::HashMap, path::Path};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::fs;

use super::{CreateSnafu, IndexEntry, IndexError, MessageIndex, RecoverSnafu};
use crate::ids::{FileId, MessageId};

const SNAPSHOT_FILE: &str = "index.json";

#[derive(Serialize, Deserialize)]
struct SnapshotEntry {
    id: MessageId,
    entry: IndexEntry,
}

/// In-memory hash table index, concurrently readable by clients performing
/// direct reads (per spec.md §4.B) via an `RwLock`; all writes come from the
/// store's owning task.
pub struct InMemoryIndex {
    dir: std::path::PathBuf,
    table: RwLock<HashMap<MessageId, IndexEntry>>,
}

impl InMemoryIndex {
    fn snapshot_path(dir: &Path) -> std::path::PathBuf {
        dir.join(SNAPSHOT_FILE)
    }

    async fn load_snapshot(dir: &Path) -> Result<HashMap<MessageId, IndexEntry>, IndexError> {
        let path = Self::snapshot_path(dir);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let bytes = fs::read(&path).await.context(RecoverSnafu { path: path.clone() })?;
        let entries: Vec<SnapshotEntry> =
            serde_json::from_slice(&bytes).map_err(|e| IndexError::SchemaIntegrity {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        Ok(entries.into_iter().map(|e| (e.id, e.entry)).collect())
    }
}

#[async_trait::async_trait]
impl MessageIndex for InMemoryIndex {
    async fn new(dir: &Path) -> Result<Self, IndexError> {
        fs::create_dir_all(dir)
            .await
            .context(CreateSnafu { path: dir.to_path_buf() })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            table: RwLock::new(HashMap::new()),
        })
    }

    async fn recover(dir: &Path) -> Result<Self, IndexError> {
        fs::create_dir_all(dir)
            .await
            .context(CreateSnafu { path: dir.to_path_buf() })?;
        let table = Self::load_snapshot(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
            table: RwLock::new(table),
        })
    }

    fn lookup(&self, id: &MessageId) -> Option<IndexEntry> {
        self.table.read().get(id).copied()
    }

    fn insert(&self, id: MessageId, entry: IndexEntry) {
        self.table.write().insert(id, entry);
    }

    fn update(&self, id: &MessageId, entry: IndexEntry) {
        if let Some(slot) = self.table.write().get_mut(id) {
            *slot = entry;
        }
    }

    fn update_fields(&self, id: &MessageId, f: &dyn Fn(&mut IndexEntry)) {
        if let Some(slot) = self.table.write().get_mut(id) {
            f(slot);
        }
    }

    fn delete(&self, id: &MessageId) {
        self.table.write().remove(id);
    }

    fn delete_by_file(&self, file: FileId) {
        self.table.write().retain(|_, entry| entry.file != Some(file));
    }

    fn entries_for_file(&self, file: FileId) -> Vec<(MessageId, IndexEntry)> {
        self.table
            .read()
            .iter()
            .filter(|(_, e)| e.file == Some(file) && e.ref_count > 0)
            .map(|(id, e)| (*id, *e))
            .collect()
    }

    async fn terminate(&self) -> Result<(), IndexError> {
        let snapshot: Vec<SnapshotEntry> = self
            .table
            .read()
            .iter()
            .map(|(id, entry)| SnapshotEntry {
                id: *id,
                entry: *entry,
            })
            .collect();
        let bytes = serde_json::to_vec(&snapshot).map_err(|e| IndexError::SchemaIntegrity {
            path: self.dir.clone(),
            reason: e.to_string(),
        })?;
        let path = Self::snapshot_path(&self.dir);
        fs::write(&path, bytes)
            .await
            .context(CreateSnafu { path })?;
        Ok(())
    }
}
