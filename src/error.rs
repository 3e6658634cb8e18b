//! Crate-wide error types.
//!
//! Every module defines its own `snafu`-derived error enum for the failure
//! modes specific to it (see [`crate::segment::SegmentError`],
//! [`crate::index::IndexError`], [`crate::compactor::CompactError`]); this
//! module collects the kinds enumerated in the store's error-handling
//! design into a single umbrella used at the public API boundary, the way
//! `vector_buffers` collects `WriterError`/`ReaderError` variants without
//! forcing every internal caller through one giant enum.

use std::{io, path::PathBuf};

use snafu::Snafu;

use crate::ids::{FileId, MessageId};

/// Errors surfaced by [`crate::store::MessageStoreHandle`] and
/// [`crate::queue::QueueHandle`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// The requested id has no live entry in the index.
    ///
    /// This is a normal, expected return value and is never escalated.
    #[snafu(display("message {id:?} not found"))]
    NotFound { id: MessageId },

    /// A record read back from a non-current file failed its checksum.
    ///
    /// Per the error-handling design, a misread on a non-current file is
    /// escalated: the caller is expected to abort and the file gets moved
    /// to a backup location on the next startup.
    #[snafu(display("checksum mismatch reading file {file}: calculated {calculated:#x}, stored {actual:#x}"))]
    Misread {
        file: FileId,
        calculated: u32,
        actual: u32,
    },

    /// `scan` could not make sense of a segment file at all (not just a
    /// trailing-garbage truncation, which is handled silently).
    #[snafu(display("unable to scan file {path:?}: {source}"))]
    UnableToScanFile { path: PathBuf, source: io::Error },

    /// Index backend failed to create its on-disk state.
    #[snafu(display("failed to create index storage at {path:?}: {source}"))]
    TableCreationFailed { path: PathBuf, source: io::Error },

    /// Recovered on-disk state did not match the expected schema.
    #[snafu(display("schema integrity error in {path:?}: {reason}"))]
    SchemaIntegrity { path: PathBuf, reason: String },

    /// Could not move a corrupted file to the backup location.
    #[snafu(display("could not back up {path:?}: {source}"))]
    CannotBackup { path: PathBuf, source: io::Error },

    /// Could not delete a segment file that should have been deletable.
    #[snafu(display("could not delete {path:?}: {source}"))]
    CannotDelete { path: PathBuf, source: io::Error },

    /// Any other I/O failure.
    #[snafu(display("I/O failure: {source}"))]
    Io { source: io::Error },

    /// `data_dir` is already held open by another running store instance.
    #[snafu(display("could not lock {path:?}, a store is already open there: {source}"))]
    AlreadyLocked { path: PathBuf, source: io::Error },

    /// The store task has shut down and can no longer be reached.
    #[snafu(display("message store is no longer running"))]
    StoreGone,
}

impl From<io::Error> for StoreError {
    fn from(source: io::Error) -> Self {
        StoreError::Io { source }
    }
}
