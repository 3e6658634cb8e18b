//! A persisted, append-only queue position index: the on-disk backing for
//! the δ tier of spec.md §4.E's paging pipeline, and the durability fence
//! [`crate::queue::actor::QueueActor::publish`] waits on for spec.md §8
//! property 10 ("confirm completeness").
//!
//! Record format mirrors [`crate::segment::record`]'s framing choices, but
//! fixed-width rather than length-prefixed since every field here has a
//! known size: `[seq: u64 BE][id: 16 bytes][persistent: u8][crc32 trailer:
//! u32 BE]`.
//!
//! [`QueueIndexFile::read_from`] rescans the file from the start on every
//! call rather than maintaining a seq→offset skip list. A production index
//! would keep one to avoid the full rescan; here, simplicity wins, and a
//! queue's index file only ever holds the positions that made it past q2
//! before being acked, which stays small relative to total throughput.

use std::path::PathBuf;

use crc32fast::Hasher;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::ids::{MessageId, SeqId};
use crate::queue::entry::QueueEntryMeta;

const SEQ_LEN: usize = 8;
const PERSISTENT_LEN: usize = 1;
const TRAILER_LEN: usize = 4;
const RECORD_LEN: usize = SEQ_LEN + MessageId::LEN + PERSISTENT_LEN + TRAILER_LEN;

fn encode(meta: &QueueEntryMeta) -> [u8; RECORD_LEN] {
    let mut buf = [0u8; RECORD_LEN];
    buf[0..SEQ_LEN].copy_from_slice(&meta.seq.to_be_bytes());
    buf[SEQ_LEN..SEQ_LEN + MessageId::LEN].copy_from_slice(meta.id.as_bytes());
    buf[SEQ_LEN + MessageId::LEN] = meta.persistent as u8;

    let mut hasher = Hasher::new();
    hasher.update(&buf[..RECORD_LEN - TRAILER_LEN]);
    let checksum = hasher.finalize();
    buf[RECORD_LEN - TRAILER_LEN..].copy_from_slice(&checksum.to_be_bytes());
    buf
}

/// Decodes one record, returning `None` on a checksum mismatch — a torn
/// write from a crash mid-append, left behind at the tail of the file.
fn decode(buf: &[u8]) -> Option<QueueEntryMeta> {
    if buf.len() < RECORD_LEN {
        return None;
    }
    let mut hasher = Hasher::new();
    hasher.update(&buf[..RECORD_LEN - TRAILER_LEN]);
    let calculated = hasher.finalize();
    let actual = u32::from_be_bytes(buf[RECORD_LEN - TRAILER_LEN..RECORD_LEN].try_into().unwrap());
    if calculated != actual {
        return None;
    }

    let seq = u64::from_be_bytes(buf[0..SEQ_LEN].try_into().unwrap());
    let id_bytes: [u8; MessageId::LEN] = buf[SEQ_LEN..SEQ_LEN + MessageId::LEN].try_into().unwrap();
    let persistent = buf[SEQ_LEN + MessageId::LEN] != 0;
    Some(QueueEntryMeta {
        seq,
        id: MessageId::from_bytes(id_bytes),
        persistent,
    })
}

/// One queue's durable position log, one file per queue.
pub struct QueueIndexFile {
    file: File,
}

impl QueueIndexFile {
    /// Opens (creating if necessary) the index file at `path`.
    pub async fn open(path: PathBuf) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).read(true).write(true).open(&path).await?;
        Ok(Self { file })
    }

    /// Appends `metas`, in order, fsyncing before returning. Both the
    /// memory-reduction round's γ→δ push and a publish's confirm fence
    /// depend on this actually hitting disk, not just a buffered write.
    pub async fn append_batch(&mut self, metas: &[QueueEntryMeta]) -> std::io::Result<()> {
        if metas.is_empty() {
            return Ok(());
        }
        self.file.seek(std::io::SeekFrom::End(0)).await?;
        let mut buf = Vec::with_capacity(metas.len() * RECORD_LEN);
        for meta in metas {
            buf.extend_from_slice(&encode(meta));
        }
        self.file.write_all(&buf).await?;
        self.file.sync_data().await?;
        Ok(())
    }

    /// Returns up to `max_count` records with `seq >= start_seq`, in
    /// ascending order.
    pub async fn read_from(&mut self, start_seq: SeqId, max_count: usize) -> std::io::Result<Vec<QueueEntryMeta>> {
        self.file.seek(std::io::SeekFrom::Start(0)).await?;
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf).await?;

        let mut out = Vec::with_capacity(max_count.min(buf.len() / RECORD_LEN + 1));
        let mut cursor = 0usize;
        while cursor + RECORD_LEN <= buf.len() && out.len() < max_count {
            if let Some(meta) = decode(&buf[cursor..cursor + RECORD_LEN]) {
                if meta.seq >= start_seq {
                    out.push(meta);
                }
            }
            cursor += RECORD_LEN;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn meta(seq: u64) -> QueueEntryMeta {
        QueueEntryMeta {
            seq,
            id: MessageId::from_bytes([seq as u8; 16]),
            persistent: seq % 2 == 0,
        }
    }

    #[tokio::test]
    async fn appended_records_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = QueueIndexFile::open(dir.path().join("q.qidx")).await.unwrap();

        let batch: Vec<_> = (0..10).map(meta).collect();
        index.append_batch(&batch).await.unwrap();

        let read_back = index.read_from(0, 100).await.unwrap();
        assert_eq!(read_back.len(), 10);
        assert_eq!(read_back, batch);
    }

    #[tokio::test]
    async fn read_from_filters_by_start_seq_and_caps_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = QueueIndexFile::open(dir.path().join("q.qidx")).await.unwrap();
        index.append_batch(&(0..10).map(meta).collect::<Vec<_>>()).await.unwrap();

        let read_back = index.read_from(5, 3).await.unwrap();
        assert_eq!(read_back.len(), 3);
        assert_eq!(read_back[0].seq, 5);
        assert_eq!(read_back[2].seq, 7);
    }

    #[tokio::test]
    async fn reopening_the_same_path_preserves_prior_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.qidx");
        let mut index = QueueIndexFile::open(path.clone()).await.unwrap();
        index.append_batch(&[meta(1), meta(2)]).await.unwrap();
        drop(index);

        let mut reopened = QueueIndexFile::open(path).await.unwrap();
        reopened.append_batch(&[meta(3)]).await.unwrap();
        let all = reopened.read_from(0, 100).await.unwrap();
        assert_eq!(all.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
