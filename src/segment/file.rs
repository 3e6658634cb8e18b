//! Single segment file primitives: append, read, scan, sync, truncate, copy.

use std::path::{Path, PathBuf};

use snafu::ResultExt;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

use super::{
    record::{encode_record, try_decode_record, RecordStatus},
    IoSnafu, SegmentError,
};
use crate::ids::{FileId, MessageId};

/// One record found during a recovery [`SegmentFile::scan`].
#[derive(Debug, Clone, Copy)]
pub struct ScannedRecord {
    pub id: MessageId,
    pub offset: u64,
    pub total_size: u64,
}

/// A segment file open for either writing (the current file) or random-access
/// reading (any other live, unlocked file, via the handle cache).
pub struct SegmentFile {
    pub file_no: FileId,
    path: PathBuf,
    file: File,
    /// Current end of valid, written data; the next `append` lands here.
    offset: u64,
}

impl SegmentFile {
    /// Opens (creating if necessary) the segment file `file_no` at `path`
    /// for appending, seeking to its current end.
    pub async fn open_writable(path: PathBuf, file_no: FileId) -> Result<Self, SegmentError> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .await
            .context(IoSnafu { file: file_no })?;
        let offset = file
            .seek(std::io::SeekFrom::End(0))
            .await
            .context(IoSnafu { file: file_no })?;
        Ok(Self {
            file_no,
            path,
            file,
            offset,
        })
    }

    /// Opens an existing segment file read-only, for the handle cache.
    pub async fn open_readable(path: PathBuf, file_no: FileId) -> Result<Self, SegmentError> {
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .await
            .context(IoSnafu { file: file_no })?;
        Ok(Self {
            file_no,
            path,
            file,
            offset: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current write offset; also the file's valid length.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Appends `(id, payload)`, returning `(offset_written_at, total_size)`.
    pub async fn append(
        &mut self,
        id: MessageId,
        payload: &[u8],
        max_record_size: usize,
    ) -> Result<(u64, u64), SegmentError> {
        if payload.len() > max_record_size {
            return super::RecordTooLargeSnafu {
                size: payload.len(),
                limit: max_record_size,
            }
            .fail();
        }
        let frame = encode_record(id, payload);
        let at = self.offset;
        self.file
            .write_all(&frame)
            .await
            .context(IoSnafu { file: self.file_no })?;
        self.offset += frame.len() as u64;
        Ok((at, frame.len() as u64))
    }

    /// Reads the record at `offset` with framed size `total_size`.
    pub async fn read(
        &mut self,
        offset: u64,
        total_size: u64,
    ) -> Result<(MessageId, Vec<u8>), SegmentError> {
        self.file
            .seek(std::io::SeekFrom::Start(offset))
            .await
            .context(IoSnafu { file: self.file_no })?;
        let mut buf = vec![0u8; total_size as usize];
        self.file
            .read_exact(&mut buf)
            .await
            .context(IoSnafu { file: self.file_no })?;
        match try_decode_record(&buf) {
            RecordStatus::Valid { id, payload, .. } => Ok((id, payload)),
            RecordStatus::Corrupted { calculated, actual } => {
                warn!(calculated, actual, file = self.file_no, offset, "checksum mismatch on read");
                super::CorruptSnafu {
                    path: self.path.clone(),
                    offset,
                }
                .fail()
            }
            RecordStatus::Incomplete => super::CorruptSnafu {
                path: self.path.clone(),
                offset,
            }
            .fail(),
        }
    }

    /// Scans the file at `path` from the start, returning every
    /// well-framed record found. Trailing garbage (a torn write from a
    /// crash) is truncated from the file, and the scan stops there.
    pub async fn scan(path: &Path, file_no: FileId) -> Result<Vec<ScannedRecord>, SegmentError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .context(IoSnafu { file: file_no })?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .await
            .context(IoSnafu { file: file_no })?;

        let mut records = Vec::new();
        let mut cursor = 0usize;
        loop {
            match try_decode_record(&buf[cursor..]) {
                RecordStatus::Valid { id, total_size, .. } => {
                    records.push(ScannedRecord {
                        id,
                        offset: cursor as u64,
                        total_size,
                    });
                    cursor += total_size as usize;
                }
                RecordStatus::Corrupted { .. } | RecordStatus::Incomplete => break,
            }
        }

        if cursor < buf.len() {
            debug!(
                file_no,
                valid_prefix = cursor,
                total_len = buf.len(),
                "truncating trailing garbage found during scan"
            );
            file.set_len(cursor as u64)
                .await
                .context(IoSnafu { file: file_no })?;
        }

        Ok(records)
    }

    /// Fsyncs the file to disk.
    pub async fn sync(&mut self) -> Result<(), SegmentError> {
        self.file.sync_all().await.context(IoSnafu { file: self.file_no })
    }

    /// Seeks the underlying handle to `offset`.
    pub async fn position(&mut self, offset: u64) -> Result<(), SegmentError> {
        self.file
            .seek(std::io::SeekFrom::Start(offset))
            .await
            .context(IoSnafu { file: self.file_no })?;
        Ok(())
    }

    /// Truncates the file to `len` bytes and updates the tracked write
    /// offset to match.
    pub async fn truncate(&mut self, len: u64) -> Result<(), SegmentError> {
        self.file
            .set_len(len)
            .await
            .context(IoSnafu { file: self.file_no })?;
        self.offset = len;
        self.position(len).await
    }

    /// Copies the first `n` bytes of `src` onto the end of `self`.
    pub async fn copy(&mut self, src: &Path, n: u64) -> Result<u64, SegmentError> {
        let mut src_file = OpenOptions::new()
            .read(true)
            .open(src)
            .await
            .context(IoSnafu { file: self.file_no })?;
        let mut remaining = n;
        let mut buf = vec![0u8; 64 * 1024];
        let mut written = 0u64;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let read = src_file
                .read(&mut buf[..want])
                .await
                .context(IoSnafu { file: self.file_no })?;
            if read == 0 {
                break;
            }
            self.file
                .write_all(&buf[..read])
                .await
                .context(IoSnafu { file: self.file_no })?;
            written += read as u64;
            remaining -= read as u64;
        }
        self.offset += written;
        Ok(written)
    }

    /// Closes the handle, flushing any buffered writes first.
    pub async fn close(mut self) -> Result<(), SegmentError> {
        self.file.flush().await.context(IoSnafu { file: self.file_no })
    }
}
