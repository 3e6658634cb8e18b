//! Crash recovery and clean-shutdown fast path (spec.md §4.C "Recovery",
//! §9).
//!
//! On a clean shutdown, `clean.dot` and a JSON file-summary snapshot let
//! startup skip re-scanning every segment file. Absent both markers, every
//! `.rdq` file is scanned from scratch, and any `.rdt` tmp sibling left
//! over from a compaction interrupted mid-combine is reunited with its
//! `.rdq` file first.
//!
//! Ref-counts are not recoverable from a segment scan alone: the store
//! does not persist tombstones for removes (spec.md §3, "content-addressed,
//! reference-counted log" — ref-counts are owned by whichever caller drove
//! `write`/`remove`, e.g. a queue's own index). A freshly scanned record is
//! seeded with `ref_count = 1`; a caller recovering its own durable state
//! separately re-establishes the true count the same way it does in
//! steady state, by calling `write` again for every reference it still
//! holds.

use std::{io, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::ids::{ClientRef, FileId};
use crate::index::{IndexEntry, InMemoryIndex, MessageIndex};
use crate::segment::SegmentFile;
use crate::store::actor::RecoveredState;
use crate::store::summary::{FileSummary, FileSummaryTable};

const CLEAN_SHUTDOWN_MARKER: &str = "clean.dot";
const FILE_SUMMARY_SNAPSHOT: &str = "file_summary.json";
const LOCK_FILE: &str = "store.lock";
const BACKUP_MARKER_EXT: &str = "corrupt";
const BACKUP_DIR: &str = "backup";

/// Written alongside the file-summary snapshot on a clean shutdown.
#[derive(Serialize, Deserialize)]
pub struct CleanShutdownTerms {
    pub client_refs: Vec<ClientRef>,
    pub index_module: String,
}

#[derive(Serialize, Deserialize, Clone)]
struct FileSummaryRecord {
    file_no: FileId,
    valid_total_size: u64,
    file_size: u64,
    left: Option<FileId>,
    right: Option<FileId>,
}

fn wrap_io(err: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

/// Recovers (or creates, if `data_dir` is empty) a store rooted at
/// `config.data_dir()`.
pub async fn recover(config: &StoreConfig) -> Result<RecoveredState, StoreError> {
    let data_dir = config.data_dir().clone();
    tokio::fs::create_dir_all(&data_dir)
        .await
        .map_err(|source| StoreError::Io { source })?;

    let lock = lock_data_dir(&data_dir)?;

    relocate_backup_pending_files(&data_dir).await?;
    reunite_tmp_files(&data_dir).await?;

    let clean_marker = data_dir.join(CLEAN_SHUTDOWN_MARKER);
    let summary_snapshot_path = data_dir.join(FILE_SUMMARY_SNAPSHOT);
    let had_clean_shutdown = clean_marker.exists() && summary_snapshot_path.exists();

    let index: Arc<dyn MessageIndex + Send + Sync> = Arc::new(
        InMemoryIndex::recover(&data_dir)
            .await
            .map_err(|source| StoreError::TableCreationFailed {
                path: data_dir.clone(),
                source: wrap_io(source),
            })?,
    );

    let summaries = if had_clean_shutdown {
        debug!(?data_dir, "clean shutdown markers found, skipping full scan");
        load_summary_snapshot(&summary_snapshot_path).await?
    } else {
        debug!(?data_dir, "no clean shutdown markers, scanning all segment files");
        scan_all_files(&data_dir, index.as_ref()).await?
    };

    let _ = tokio::fs::remove_file(&clean_marker).await;
    let _ = tokio::fs::remove_file(&summary_snapshot_path).await;

    let snapshot = summaries.snapshot();
    let current_file_no = snapshot.iter().map(|(file_no, ..)| *file_no).max().unwrap_or(0);
    let next_file_no = current_file_no + 1;
    if snapshot.is_empty() {
        summaries.insert(FileSummary::new(current_file_no));
    }

    Ok(RecoveredState {
        summaries,
        index,
        current_file_no,
        next_file_no,
        lock,
    })
}

/// Acquires an exclusive, non-blocking lock on `data_dir`, refusing to open
/// a store directory a second time while another instance already holds it.
/// Grounded on RabbitMQ's own message-store directory lock: a corrupted
/// index or a doubly-seeded ref count is a more likely outcome of two
/// processes mutating the same segment files than anything this crate's
/// in-process single-writer design otherwise guards against.
fn lock_data_dir(data_dir: &Path) -> Result<fslock::LockFile, StoreError> {
    let lock_path = data_dir.join(LOCK_FILE);
    let mut lock = fslock::LockFile::open(&lock_path).map_err(|source| StoreError::AlreadyLocked {
        path: lock_path.clone(),
        source,
    })?;
    let acquired = lock.try_lock().map_err(|source| StoreError::AlreadyLocked {
        path: lock_path.clone(),
        source,
    })?;
    if !acquired {
        return Err(StoreError::AlreadyLocked {
            path: lock_path,
            source: io::Error::new(io::ErrorKind::WouldBlock, "store directory is locked by another running instance"),
        });
    }
    Ok(lock)
}

/// Persists the clean-shutdown fast-start markers: `clean.dot` and a
/// file-summary snapshot. Called once the store task and its index have
/// both flushed, immediately before the process exits.
pub async fn persist_clean_shutdown(
    config: &StoreConfig,
    summaries: &FileSummaryTable,
    client_refs: Vec<ClientRef>,
) -> Result<(), StoreError> {
    let data_dir = config.data_dir();

    let records: Vec<FileSummaryRecord> = summaries
        .snapshot()
        .into_iter()
        .map(|(file_no, valid_total_size, file_size, _locked)| {
            let (left, right) = summaries
                .with(file_no, |s| (s.left, s.right))
                .unwrap_or((None, None));
            FileSummaryRecord {
                file_no,
                valid_total_size,
                file_size,
                left,
                right,
            }
        })
        .collect();

    let summary_json = serde_json::to_vec_pretty(&records).map_err(|source| StoreError::Io { source: wrap_io(source) })?;
    tokio::fs::write(data_dir.join(FILE_SUMMARY_SNAPSHOT), summary_json)
        .await
        .map_err(|source| StoreError::Io { source })?;

    let terms = CleanShutdownTerms {
        client_refs,
        index_module: format!("{:?}", config.index_module()),
    };
    let terms_json = serde_json::to_vec_pretty(&terms).map_err(|source| StoreError::Io { source: wrap_io(source) })?;
    tokio::fs::write(data_dir.join(CLEAN_SHUTDOWN_MARKER), terms_json)
        .await
        .map_err(|source| StoreError::Io { source })?;

    Ok(())
}

async fn load_summary_snapshot(path: &Path) -> Result<FileSummaryTable, StoreError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| StoreError::Io { source })?;
    let records: Vec<FileSummaryRecord> = serde_json::from_slice(&bytes).map_err(|source| StoreError::SchemaIntegrity {
        path: path.to_path_buf(),
        reason: source.to_string(),
    })?;

    let table = FileSummaryTable::new();
    for record in records {
        let mut summary = FileSummary::new(record.file_no);
        summary.valid_total_size = record.valid_total_size;
        summary.file_size = record.file_size;
        summary.left = record.left;
        summary.right = record.right;
        table.insert(summary);
    }
    Ok(table)
}

/// Scans every `.rdq` file in `data_dir`, in ascending file-number order,
/// inserting a fresh, located index entry (`ref_count = 1`) for each
/// well-framed record found.
async fn scan_all_files(
    data_dir: &Path,
    index: &(dyn MessageIndex + Send + Sync),
) -> Result<FileSummaryTable, StoreError> {
    let mut file_numbers = list_segment_files(data_dir).await?;
    file_numbers.sort_unstable();

    let table = FileSummaryTable::new();
    let mut previous: Option<FileId> = None;

    for file_no in file_numbers {
        let path = data_dir.join(format!("{file_no}.rdq"));
        let records = SegmentFile::scan(&path, file_no)
            .await
            .map_err(|source| StoreError::UnableToScanFile {
                path: path.clone(),
                source: wrap_io(source),
            })?;

        let mut summary = FileSummary::new(file_no);
        for record in &records {
            index.insert(record.id, IndexEntry::new(file_no, record.offset, record.total_size));
            summary.file_size += record.total_size;
            summary.valid_total_size += record.total_size;
        }
        summary.left = previous;
        table.insert(summary);
        if let Some(prev) = previous {
            table.with_mut(prev, |s| s.right = Some(file_no));
        }
        previous = Some(file_no);
    }

    Ok(table)
}

/// Drops a `<file_no>.corrupt` marker next to `<file_no>.rdq` in
/// `data_dir`, best-effort. Called from [`crate::store::actor`]'s read path
/// the moment a misread on a non-current file is observed (spec.md §7):
/// the offending file can't be relocated mid-process (other entries may
/// still point into it), so the marker just records the intent, and
/// [`relocate_backup_pending_files`] acts on it the next time the store
/// starts up. A failure to write the marker is logged, not propagated: the
/// caller already has the original misread error to abort on.
pub(crate) async fn mark_file_for_backup(data_dir: &Path, file_no: FileId) {
    let marker = data_dir.join(format!("{file_no}.{BACKUP_MARKER_EXT}"));
    if let Err(error) = tokio::fs::write(&marker, b"").await {
        warn!(file_no, %error, "failed to write backup-pending marker");
    }
}

/// Moves every `.rdq` file with a `.corrupt` marker into `data_dir/backup/`,
/// removing the marker once the move succeeds. Runs before
/// [`scan_all_files`]/[`reunite_tmp_files`] so a corrupted file never gets a
/// fresh chance to be rescanned into the index.
async fn relocate_backup_pending_files(data_dir: &Path) -> Result<(), StoreError> {
    let mut entries = tokio::fs::read_dir(data_dir)
        .await
        .map_err(|source| StoreError::Io { source })?;

    let mut pending = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|source| StoreError::Io { source })? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(BACKUP_MARKER_EXT) {
            if let Some(file_no) = file_no_from_stem(&path) {
                pending.push((file_no, path));
            }
        }
    }
    if pending.is_empty() {
        return Ok(());
    }

    let backup_dir = data_dir.join(BACKUP_DIR);
    tokio::fs::create_dir_all(&backup_dir)
        .await
        .map_err(|source| StoreError::Io { source })?;

    for (file_no, marker_path) in pending {
        let rdq_path = data_dir.join(format!("{file_no}.rdq"));
        if rdq_path.exists() {
            let dst = backup_dir.join(format!("{file_no}.rdq"));
            warn!(file_no, ?dst, "moving misread file to backup location on startup");
            tokio::fs::rename(&rdq_path, &dst)
                .await
                .map_err(|source| StoreError::CannotBackup { path: rdq_path, source })?;
        }
        let _ = tokio::fs::remove_file(&marker_path).await;
    }

    Ok(())
}

/// Appends any `.rdt` tmp sibling onto its `.rdq` file, then deletes the
/// tmp file. A `.rdt` file only exists if a compaction's tail-copy step
/// (spec.md §4.D) was interrupted by a crash before it could clean up.
async fn reunite_tmp_files(data_dir: &Path) -> Result<(), StoreError> {
    let mut entries = tokio::fs::read_dir(data_dir)
        .await
        .map_err(|source| StoreError::Io { source })?;

    let mut tmp_files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|source| StoreError::Io { source })? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("rdt") {
            if let Some(file_no) = file_no_from_stem(&path) {
                tmp_files.push((file_no, path));
            }
        }
    }

    for (file_no, tmp_path) in tmp_files {
        let rdq_path = data_dir.join(format!("{file_no}.rdq"));
        if !rdq_path.exists() {
            tokio::fs::rename(&tmp_path, &rdq_path)
                .await
                .map_err(|source| StoreError::Io { source })?;
            continue;
        }

        warn!(file_no, "reuniting leftover compaction tmp file with its segment");
        let tmp_len = tokio::fs::metadata(&tmp_path)
            .await
            .map_err(|source| StoreError::Io { source })?
            .len();
        let mut dst = SegmentFile::open_writable(rdq_path, file_no)
            .await
            .map_err(|source| segment_err_to_store(file_no, source))?;
        dst.copy(&tmp_path, tmp_len)
            .await
            .map_err(|source| segment_err_to_store(file_no, source))?;
        dst.sync().await.map_err(|source| segment_err_to_store(file_no, source))?;
        tokio::fs::remove_file(&tmp_path)
            .await
            .map_err(|source| StoreError::Io { source })?;
    }

    Ok(())
}

async fn list_segment_files(data_dir: &Path) -> Result<Vec<FileId>, StoreError> {
    let mut entries = tokio::fs::read_dir(data_dir)
        .await
        .map_err(|source| StoreError::Io { source })?;

    let mut file_numbers = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|source| StoreError::Io { source })? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("rdq") {
            if let Some(file_no) = file_no_from_stem(&path) {
                file_numbers.push(file_no);
            }
        }
    }
    Ok(file_numbers)
}

fn file_no_from_stem(path: &Path) -> Option<FileId> {
    path.file_stem()?.to_str()?.parse().ok()
}

fn segment_err_to_store(file: FileId, err: crate::segment::SegmentError) -> StoreError {
    crate::store::actor::segment_err_to_store(file, err)
}
