//! LRU-evicting cache of open, read-only segment file handles, shared
//! across the store task and every client performing a direct read.
//!
//! Grounded on the "ETS shared tables" design note (spec.md §9): a
//! concurrent map with single-writer/multi-reader discipline. Eviction is
//! driven by an external "maximum time since use" signal (an fd-pressure
//! throttler, out of scope here), mirrored by [`HandleCache::set_maximum_since_use`].

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use super::{file::SegmentFile, SegmentError};
use crate::ids::FileId;

struct Entry {
    file: Arc<AsyncMutex<SegmentFile>>,
    last_used: Instant,
}

/// Shared cache of open read-only segment file handles.
pub struct HandleCache {
    data_dir: PathBuf,
    entries: Mutex<HashMap<FileId, Entry>>,
    max_since_use: Mutex<Duration>,
}

impl HandleCache {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            entries: Mutex::new(HashMap::new()),
            max_since_use: Mutex::new(Duration::from_secs(60)),
        }
    }

    fn path_for(&self, file_no: FileId) -> PathBuf {
        self.data_dir.join(format!("{file_no}.rdq"))
    }

    /// Gets (opening and caching if necessary) a read-only handle for
    /// `file_no`.
    pub async fn get(&self, file_no: FileId) -> Result<Arc<AsyncMutex<SegmentFile>>, SegmentError> {
        if let Some(entry) = self.entries.lock().get_mut(&file_no) {
            entry.last_used = Instant::now();
            return Ok(Arc::clone(&entry.file));
        }

        let path = self.path_for(file_no);
        let file = SegmentFile::open_readable(path, file_no).await?;
        let file = Arc::new(AsyncMutex::new(file));

        self.entries.lock().insert(
            file_no,
            Entry {
                file: Arc::clone(&file),
                last_used: Instant::now(),
            },
        );

        Ok(file)
    }

    /// Drops the cached handle for `file_no`, if any. Called by the store
    /// once a file has been deleted so the cache never hands out a handle
    /// to a file that no longer exists.
    pub fn invalidate(&self, file_no: FileId) {
        self.entries.lock().remove(&file_no);
    }

    /// Sets the maximum age a cached handle may reach before it becomes
    /// eligible for eviction by [`HandleCache::evict_stale`].
    pub fn set_maximum_since_use(&self, max_age: Duration) {
        *self.max_since_use.lock() = max_age;
    }

    /// Evicts every handle whose last use is older than the configured
    /// maximum age. Intended to be driven periodically by an external
    /// fd-pressure signal.
    pub fn evict_stale(&self) {
        let max_age = *self.max_since_use.lock();
        let now = Instant::now();
        self.entries
            .lock()
            .retain(|_, entry| now.duration_since(entry.last_used) <= max_age);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::MessageId;
    use std::time::Duration;

    #[tokio::test]
    async fn opens_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SegmentFile::open_writable(dir.path().join("0.rdq"), 0)
            .await
            .unwrap();
        writer
            .append(MessageId::from_bytes([1; 16]), b"hi", 1024)
            .await
            .unwrap();
        writer.sync().await.unwrap();

        let cache = HandleCache::new(dir.path().to_path_buf());
        let handle1 = cache.get(0).await.unwrap();
        let handle2 = cache.get(0).await.unwrap();
        assert!(Arc::ptr_eq(&handle1, &handle2));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn evicts_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SegmentFile::open_writable(dir.path().join("0.rdq"), 0)
            .await
            .unwrap();
        writer
            .append(MessageId::from_bytes([1; 16]), b"hi", 1024)
            .await
            .unwrap();
        writer.sync().await.unwrap();

        let cache = HandleCache::new(dir.path().to_path_buf());
        cache.get(0).await.unwrap();
        cache.set_maximum_since_use(Duration::from_secs(0));
        cache.evict_stale();
        assert!(cache.is_empty());
    }
}
