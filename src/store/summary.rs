//! File summary table: the per-file metadata shared, single-writer
//! (store)/multi-reader (clients), between the store task and any client
//! performing a direct read (spec.md §3 "File summary record", §5).

use std::{
    collections::BTreeMap,
    sync::{atomic::AtomicU64, Arc},
};

use parking_lot::RwLock;

use crate::ids::FileId;

/// One file's summary record.
///
/// Invariants (enforced by the store task, the sole writer):
/// `0 <= valid_total_size <= file_size`; while `locked`, the compactor owns
/// exclusive write rights and new reads must be deferred (readers already
/// open at lock time may complete, tracked by `readers`); the current file
/// is never locked.
pub struct FileSummary {
    pub file_no: FileId,
    pub valid_total_size: u64,
    pub file_size: u64,
    pub left: Option<FileId>,
    pub right: Option<FileId>,
    pub locked: bool,
    pub readers: Arc<AtomicU64>,
}

impl FileSummary {
    pub fn new(file_no: FileId) -> Self {
        Self {
            file_no,
            valid_total_size: 0,
            file_size: 0,
            left: None,
            right: None,
            locked: false,
            readers: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Shared table of [`FileSummary`] records, keyed by file number.
///
/// The store task is the only writer; clients performing direct reads only
/// read through this table plus compare-and-set the `readers` counter of
/// the file summary they land on.
#[derive(Default, Clone)]
pub struct FileSummaryTable {
    inner: Arc<RwLock<BTreeMap<FileId, FileSummary>>>,
}

impl FileSummaryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, summary: FileSummary) {
        self.inner.write().insert(summary.file_no, summary);
    }

    pub fn remove(&self, file_no: FileId) -> Option<FileSummary> {
        self.inner.write().remove(&file_no)
    }

    pub fn contains(&self, file_no: FileId) -> bool {
        self.inner.read().contains_key(&file_no)
    }

    /// Returns `true` if `file_no` is currently locked (or absent, which is
    /// treated as "not safe to read").
    pub fn is_locked(&self, file_no: FileId) -> bool {
        self.inner
            .read()
            .get(&file_no)
            .map_or(true, |s| s.locked)
    }

    pub fn readers_handle(&self, file_no: FileId) -> Option<Arc<AtomicU64>> {
        self.inner.read().get(&file_no).map(|s| Arc::clone(&s.readers))
    }

    pub fn with<R>(&self, file_no: FileId, f: impl FnOnce(&FileSummary) -> R) -> Option<R> {
        self.inner.read().get(&file_no).map(f)
    }

    pub fn with_mut<R>(&self, file_no: FileId, f: impl FnOnce(&mut FileSummary) -> R) -> Option<R> {
        self.inner.write().get_mut(&file_no).map(f)
    }

    /// Live files, in ascending file-number order.
    pub fn snapshot(&self) -> Vec<(FileId, u64, u64, bool)> {
        self.inner
            .read()
            .values()
            .map(|s| (s.file_no, s.valid_total_size, s.file_size, s.locked))
            .collect()
    }

    pub fn total_valid(&self) -> u64 {
        self.inner.read().values().map(|s| s.valid_total_size).sum()
    }

    pub fn total_size(&self) -> u64 {
        self.inner.read().values().map(|s| s.file_size).sum()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }
}
