//! Segment file manager (component A).
//!
//! A segment file (`N.rdq`) is a numbered, append-only file holding a
//! sequence of framed `(id, payload)` records. One file is always the
//! *current file*, and it alone is ever appended to; all others are
//! read-only until the compactor combines or deletes them.

mod common;
mod file;
mod handle_cache;
mod record;

pub use common::DEFAULT_MAX_RECORD_SIZE;
pub use file::{ScannedRecord, SegmentFile};
pub use handle_cache::HandleCache;
pub use record::{framed_len, try_decode_record, RecordStatus};

use snafu::Snafu;
use std::{io, path::PathBuf};

use crate::ids::FileId;

/// Errors specific to segment file I/O.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SegmentError {
    #[snafu(display("I/O error on segment {file}: {source}"))]
    Io { file: FileId, source: io::Error },

    #[snafu(display("record of {size} bytes exceeds max record size of {limit} bytes"))]
    RecordTooLarge { size: usize, limit: usize },

    #[snafu(display("segment file {path:?} is corrupt at offset {offset}"))]
    Corrupt { path: PathBuf, offset: u64 },
}
