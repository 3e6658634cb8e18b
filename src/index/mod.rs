//! Message index (component B): the map from message id to
//! `{ref_count, file, offset, total_size}`, pluggable per spec.md §4.B and
//! §9's "pluggable index module maps to a trait" design note.

mod memory;

pub use memory::InMemoryIndex;

use std::{io, path::PathBuf};

use snafu::Snafu;

use crate::ids::{FileId, MessageId};

/// One index entry.
///
/// `file == None` means "known only from a reference-count delta produced
/// during crash recovery; payload not yet located" (spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IndexEntry {
    pub ref_count: i64,
    pub file: Option<FileId>,
    pub offset: u64,
    pub total_size: u64,
}

impl IndexEntry {
    pub fn new(file: FileId, offset: u64, total_size: u64) -> Self {
        Self {
            ref_count: 1,
            file: Some(file),
            offset,
            total_size,
        }
    }

    /// A placeholder entry for a ref-count delta seen during recovery
    /// before its payload's location has been located.
    pub fn unlocated(ref_count: i64) -> Self {
        Self {
            ref_count,
            file: None,
            offset: 0,
            total_size: 0,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IndexError {
    #[snafu(display("failed to create index storage at {path:?}: {source}"))]
    Create { path: PathBuf, source: io::Error },

    #[snafu(display("failed to recover index storage at {path:?}: {source}"))]
    Recover { path: PathBuf, source: io::Error },

    #[snafu(display("index snapshot at {path:?} failed schema validation: {reason}"))]
    SchemaIntegrity { path: PathBuf, reason: String },
}

/// Pluggable backend mapping message ids to their index entry.
///
/// `new`/`recover` construct an instance and so require `Self: Sized`,
/// matching the trait's use both as a concrete generic bound (in
/// [`crate::store`]) and, where a single backend is chosen at runtime, as a
/// `Box<dyn MessageIndex>`.
#[async_trait::async_trait]
pub trait MessageIndex: Send + Sync {
    /// Creates a brand-new, empty index rooted at `dir`.
    async fn new(dir: &std::path::Path) -> Result<Self, IndexError>
    where
        Self: Sized;

    /// Recovers an index from a prior snapshot rooted at `dir`. Returns a
    /// fresh, empty index if no snapshot exists yet.
    async fn recover(dir: &std::path::Path) -> Result<Self, IndexError>
    where
        Self: Sized;

    /// Looks up the entry for `id`, if any.
    fn lookup(&self, id: &MessageId) -> Option<IndexEntry>;

    /// Inserts (overwriting) the entry for `id`.
    fn insert(&self, id: MessageId, entry: IndexEntry);

    /// Replaces the entry for `id` wholesale. No-op if absent.
    fn update(&self, id: &MessageId, entry: IndexEntry);

    /// Applies `f` to the entry for `id` in place, if present.
    fn update_fields(&self, id: &MessageId, f: &dyn Fn(&mut IndexEntry));

    /// Removes the entry for `id` entirely.
    fn delete(&self, id: &MessageId);

    /// Removes every entry currently pointing at `file`. Used after a
    /// file has been fully combined away or deleted empty.
    fn delete_by_file(&self, file: FileId);

    /// Returns every live (`ref_count > 0`) entry pointing into `file`, for
    /// the compactor to combine or reclaim.
    fn entries_for_file(&self, file: FileId) -> Vec<(MessageId, IndexEntry)>;

    /// Flushes/persists the index's current state to disk.
    async fn terminate(&self) -> Result<(), IndexError>;
}
