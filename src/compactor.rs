//! The compactor (component D): an asynchronous worker that combines two
//! neighboring segment files or deletes an empty one, honoring reader locks
//! and crash-safe tmp files.
//!
//! Crash safety invariant (spec.md §4.D): live data is present in at least
//! one of `dst`, `dst.tmp`, or `src` at all times. On restart, the
//! recovery pass ([`crate::recovery`]) reunites any `.rdt` tmp file into
//! its `.rdq` main file, and the index is rebuilt from a scan.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use snafu::{ResultExt, Snafu};
use tokio::sync::mpsc;

use crate::ids::FileId;
use crate::index::MessageIndex;
use crate::segment::{SegmentError, SegmentFile};
use crate::store::messages::PriorityMsg;
use crate::store::FileSummaryTable;

/// Polling interval while waiting for a locked file's in-flight direct
/// readers (those that started just before the lock was set, per spec.md
/// §5's locking discipline) to drain before the compactor's own I/O begins.
const READER_DRAIN_POLL: Duration = Duration::from_millis(1);

/// Blocks until `file`'s reader count reaches zero. `file` is already locked
/// by the time this runs (the store sets `locked = true` before dispatching
/// to the compactor), so no *new* direct reader can start on it; this only
/// waits out readers that raced the lock and are already in flight.
async fn wait_for_readers_drained(summaries: &FileSummaryTable, file: FileId) {
    let Some(readers) = summaries.readers_handle(file) else {
        return;
    };
    while readers.load(Ordering::Acquire) != 0 {
        tokio::time::sleep(READER_DRAIN_POLL).await;
    }
}

/// Errors from a compaction step. All are treated as fatal by the owning
/// process per spec.md §7 ("any I/O failure during the compactor's
/// critical region is fatal").
#[derive(Debug, Snafu)]
pub enum CompactError {
    #[snafu(display("segment I/O error during compaction: {source}"))]
    Segment { source: SegmentError },
    #[snafu(display("failed to remove {path:?}: {source}"))]
    Remove { path: PathBuf, source: std::io::Error },
}

impl From<SegmentError> for CompactError {
    fn from(source: SegmentError) -> Self {
        CompactError::Segment { source }
    }
}

/// A request dispatched from the store to the compactor task.
pub enum CompactorCommand {
    /// Combine `src` onto `dst` (`dst.right == src`, per spec.md §4.C).
    Combine { src: FileId, dst: FileId },
    /// Delete an empty, locked file outright.
    Delete { file: FileId },
}

/// Outcome reported back to the store.
pub enum CompactorEvent {
    Combined {
        src: FileId,
        dst: FileId,
        new_dst_size: u64,
    },
    Deleted {
        file: FileId,
    },
}

fn rdq_path(dir: &Path, file: FileId) -> PathBuf {
    dir.join(format!("{file}.rdq"))
}

fn rdt_path(dir: &Path, file: FileId) -> PathBuf {
    dir.join(format!("{file}.rdt"))
}

/// Combines `src` onto `dst`, returning `dst`'s new on-disk size.
///
/// Steps (spec.md §4.D):
/// 1. If `dst` has a non-contiguous prefix (gaps left by prior removes),
///    pack it: write the non-contiguous tail to a `.rdt` tmp sibling,
///    truncate `dst` to its contiguous prefix, copy the tail back, fsync,
///    delete the tmp file.
/// 2. Append `src`'s live entries onto `dst`, updating each moved entry's
///    `(file, offset)` in the index as it is written.
pub async fn combine(
    index: &(dyn MessageIndex + Send + Sync),
    summaries: &FileSummaryTable,
    data_dir: &Path,
    src_file: FileId,
    dst_file: FileId,
    max_record_size: usize,
) -> Result<CompactorEvent, CompactError> {
    // Both files are already locked (the store set `locked = true` on each
    // before dispatching this command), so no *new* direct read can start on
    // either; wait out any that raced the lock before mutating `dst` in
    // place, since a direct read holds a separate file handle onto the same
    // inode and would otherwise observe a torn truncate/copy-back.
    wait_for_readers_drained(summaries, dst_file).await;
    wait_for_readers_drained(summaries, src_file).await;

    let dst_path = rdq_path(data_dir, dst_file);
    let tmp_path = rdt_path(data_dir, dst_file);

    let mut dst_live = index.entries_for_file(dst_file);
    dst_live.sort_by_key(|(_, e)| e.offset);

    let mut prefix_len = 0u64;
    let mut split_at = dst_live.len();
    for (i, (_, e)) in dst_live.iter().enumerate() {
        if e.offset == prefix_len {
            prefix_len += e.total_size;
        } else {
            split_at = i;
            break;
        }
    }
    let tail: Vec<_> = dst_live[split_at..].to_vec();

    let mut dst = SegmentFile::open_writable(dst_path.clone(), dst_file).await?;

    if !tail.is_empty() {
        debug!(dst_file, tail_len = tail.len(), "packing non-contiguous tail before combine");
        let mut tmp = SegmentFile::open_writable(tmp_path.clone(), dst_file).await?;
        let mut relocated = Vec::with_capacity(tail.len());
        for (id, entry) in &tail {
            let (_, payload) = dst.read(entry.offset, entry.total_size).await?;
            let (tmp_off, size) = tmp.append(*id, &payload, max_record_size).await?;
            relocated.push((*id, tmp_off, size));
        }
        tmp.sync().await?;
        let tmp_len = tmp.offset();
        tmp.close().await?;

        dst.truncate(prefix_len).await?;
        dst.copy(&tmp_path, tmp_len).await?;
        dst.sync().await?;

        for (id, tmp_off, size) in relocated {
            index.update_fields(&id, &|e| {
                e.file = Some(dst_file);
                e.offset = prefix_len + tmp_off;
                e.total_size = size;
            });
        }

        tokio::fs::remove_file(&tmp_path)
            .await
            .context(RemoveSnafu { path: tmp_path.clone() })?;
    }

    let src_path = rdq_path(data_dir, src_file);
    let mut src_live = index.entries_for_file(src_file);
    src_live.sort_by_key(|(_, e)| e.offset);
    let mut src = SegmentFile::open_readable(src_path.clone(), src_file).await?;

    for (id, entry) in &src_live {
        let (_, payload) = src.read(entry.offset, entry.total_size).await?;
        let (off, size) = dst.append(*id, &payload, max_record_size).await?;
        index.update_fields(id, &|e| {
            e.file = Some(dst_file);
            e.offset = off;
            e.total_size = size;
        });
    }
    dst.sync().await?;
    src.close().await?;

    // `src`'s live data now lives entirely in `dst`; reclaim the file. Safe to
    // unlink immediately rather than waiting on the reader count: on a POSIX
    // filesystem a concurrent direct read still holds the inode open through
    // its own handle-cache descriptor and completes unaffected (the same
    // property `delete()` below already relies on for empty-file reclaim).
    tokio::fs::remove_file(&src_path)
        .await
        .context(RemoveSnafu { path: src_path })?;

    Ok(CompactorEvent::Combined {
        src: src_file,
        dst: dst_file,
        new_dst_size: dst.offset(),
    })
}

/// Deletes an empty, locked file from disk.
pub async fn delete(summaries: &FileSummaryTable, data_dir: &Path, file: FileId) -> Result<CompactorEvent, CompactError> {
    wait_for_readers_drained(summaries, file).await;
    let path = rdq_path(data_dir, file);
    if path.exists() {
        tokio::fs::remove_file(&path)
            .await
            .context(RemoveSnafu { path: path.clone() })?;
    }
    Ok(CompactorEvent::Deleted { file })
}

/// Runs the compactor task: receives [`CompactorCommand`]s and reports
/// completion onto the store's priority mailbox lane as a [`PriorityMsg`],
/// per spec.md §9's two-lane design (completions carry no per-client
/// ordering requirement, so they never wait behind normal-lane traffic).
/// Fatal I/O errors are logged; per spec.md §7 they are expected to bring
/// down the owning process so it can recover by rescanning on restart, so
/// this loop does not attempt to retry.
pub async fn run(
    data_dir: PathBuf,
    max_record_size: usize,
    index: std::sync::Arc<dyn MessageIndex + Send + Sync>,
    summaries: FileSummaryTable,
    mut commands: mpsc::UnboundedReceiver<CompactorCommand>,
    priority_tx: mpsc::UnboundedSender<PriorityMsg>,
) {
    while let Some(cmd) = commands.recv().await {
        let result = match cmd {
            CompactorCommand::Combine { src, dst } => {
                combine(index.as_ref(), &summaries, &data_dir, src, dst, max_record_size).await
            }
            CompactorCommand::Delete { file } => delete(&summaries, &data_dir, file).await,
        };

        let sent = match result {
            Ok(CompactorEvent::Combined { src, dst, new_dst_size }) => {
                priority_tx.send(PriorityMsg::CombineDone { src, dst, new_dst_size })
            }
            Ok(CompactorEvent::Deleted { file }) => priority_tx.send(PriorityMsg::DeleteDone { file }),
            Err(error) => {
                error!(%error, "fatal I/O error in compactor critical region");
                break;
            }
        };
        if sent.is_err() {
            break;
        }
    }
}
