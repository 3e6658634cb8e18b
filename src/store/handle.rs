//! The public client surface onto the message store.
//!
//! Implements the direct-client-read fast path of spec.md §5: a read for a
//! message on a file that is neither the current file nor locked for
//! compaction never has to round-trip through the store task. It opens
//! (or reuses) a handle from the shared [`HandleCache`] and reads directly,
//! bumping that file's reader count for the duration so the compactor
//! knows to wait for it before reclaiming the file underneath.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::StoreError;
use crate::ids::{ClientRef, MessageId};
use crate::index::MessageIndex;
use crate::segment::HandleCache;
use crate::store::actor::segment_err_to_store;
use crate::store::client::ClientRecord;
use crate::store::messages::{NormalMsg, PriorityMsg};
use crate::store::summary::FileSummaryTable;

/// A cloneable handle onto a running message store.
///
/// Dropping every clone does not shut the store down; call
/// [`MessageStoreHandle::shutdown`] explicitly to flush and stop its task.
#[derive(Clone)]
pub struct MessageStoreHandle {
    normal_tx: mpsc::UnboundedSender<NormalMsg>,
    priority_tx: mpsc::UnboundedSender<PriorityMsg>,
    summaries: FileSummaryTable,
    handle_cache: Arc<HandleCache>,
    index: Arc<dyn MessageIndex + Send + Sync>,
    current_file_no: Arc<AtomicU32>,
}

impl MessageStoreHandle {
    pub(crate) fn new(
        normal_tx: mpsc::UnboundedSender<NormalMsg>,
        priority_tx: mpsc::UnboundedSender<PriorityMsg>,
        summaries: FileSummaryTable,
        handle_cache: Arc<HandleCache>,
        index: Arc<dyn MessageIndex + Send + Sync>,
        current_file_no: Arc<AtomicU32>,
    ) -> Self {
        Self {
            normal_tx,
            priority_tx,
            summaries,
            handle_cache,
            index,
            current_file_no,
        }
    }

    pub(crate) fn summaries(&self) -> FileSummaryTable {
        self.summaries.clone()
    }

    /// Returns a handle onto the live per-file summary table, for
    /// monitoring/ops tooling (and for tests asserting against spec.md §8's
    /// valid-size and file-count invariants directly rather than through
    /// indirect observation).
    pub fn file_summaries(&self) -> FileSummaryTable {
        self.summaries.clone()
    }

    /// Flushes the index to disk. Called as part of [`crate::store::close`]
    /// once the store task itself has already flushed and stopped.
    pub(crate) async fn terminate_index(&self) -> Result<(), StoreError> {
        self.index
            .terminate()
            .await
            .map_err(|source| StoreError::Io {
                source: std::io::Error::new(std::io::ErrorKind::Other, source.to_string()),
            })
    }

    fn send_normal(&self, msg: NormalMsg) -> Result<(), StoreError> {
        self.normal_tx.send(msg).map_err(|_| StoreError::StoreGone)
    }

    /// Registers `client`, writing `payload` under `id`.
    ///
    /// If `id` already has a live entry (message ids are content-addressed:
    /// the same id always means the same payload), this degenerates into a
    /// reference-count bump with no I/O.
    pub async fn write(&self, client: ClientRef, id: MessageId, payload: Bytes) -> Result<(), StoreError> {
        self.send_normal(NormalMsg::Write { client, id, payload })
    }

    /// Reads `id`'s payload, or `None` if it has no live entry.
    pub async fn read(&self, id: MessageId) -> Result<Option<Bytes>, StoreError> {
        let Some(entry) = self.index.lookup(&id) else {
            return Ok(None);
        };
        if entry.ref_count <= 0 {
            return Ok(None);
        }
        let Some(file) = entry.file else {
            return self.read_via_actor(id).await;
        };

        let current = self.current_file_no.load(Ordering::Acquire);
        if file == current {
            return self.read_via_actor(id).await;
        }

        let Some(readers) = self.summaries.readers_handle(file) else {
            return self.read_via_actor(id).await;
        };
        readers.fetch_add(1, Ordering::AcqRel);
        if self.summaries.is_locked(file) {
            readers.fetch_sub(1, Ordering::AcqRel);
            return self.read_via_actor(id).await;
        }

        let result = async {
            let handle = self
                .handle_cache
                .get(file)
                .await
                .map_err(|source| segment_err_to_store(file, source))?;
            let mut guard = handle.lock().await;
            guard
                .read(entry.offset, entry.total_size)
                .await
                .map(|(_, payload)| Bytes::from(payload))
                .map_err(|source| segment_err_to_store(file, source))
        }
        .await;
        readers.fetch_sub(1, Ordering::AcqRel);

        result.map(Some)
    }

    async fn read_via_actor(&self, id: MessageId) -> Result<Option<Bytes>, StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_normal(NormalMsg::Read {
            client: ClientRef::new(),
            id,
            reply: reply_tx,
        })?;
        reply_rx.await.map_err(|_| StoreError::StoreGone)?
    }

    /// Returns whether `id` has a live entry, without fetching its payload.
    pub async fn contains(&self, id: MessageId) -> Result<bool, StoreError> {
        if let Some(entry) = self.index.lookup(&id) {
            if entry.ref_count > 0 {
                return Ok(true);
            }
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_normal(NormalMsg::Contains { id, reply: reply_tx })?;
        reply_rx.await.map_err(|_| StoreError::StoreGone)
    }

    /// Drops one reference to each of `ids`.
    pub async fn remove(&self, client: ClientRef, ids: Vec<MessageId>) -> Result<(), StoreError> {
        self.send_normal(NormalMsg::Remove { client, ids })
    }

    /// Releases a dedup-cache hold taken implicitly by a prior [`Self::read`]
    /// of a multiply-referenced message.
    pub async fn release(&self, ids: Vec<MessageId>) -> Result<(), StoreError> {
        self.send_normal(NormalMsg::Release { ids })
    }

    /// Blocks until every id in `ids` has been made durable.
    pub async fn sync(&self, ids: Vec<MessageId>) -> Result<(), StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_normal(NormalMsg::Sync { ids, reply: reply_tx })?;
        reply_rx.await.map_err(|_| StoreError::StoreGone)
    }

    /// Registers a new client, returning the token it must use for
    /// subsequent calls.
    pub async fn client_init(&self, record: ClientRecord) -> Result<ClientRef, StoreError> {
        let client = ClientRef::new();
        self.send_normal(NormalMsg::ClientInit { client, record })?;
        Ok(client)
    }

    /// Deregisters `client` without deleting its messages.
    pub async fn client_terminate(&self, client: ClientRef) -> Result<(), StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_normal(NormalMsg::ClientTerminate { client, reply: reply_tx })?;
        reply_rx.await.map_err(|_| StoreError::StoreGone)
    }

    /// Marks `client` dying: deregisters it and closes its file descriptors
    /// immediately. Any write racing in from `client` after this point is
    /// dropped (spec.md §4.C write decision table, case 3).
    pub async fn client_delete_and_terminate(&self, client: ClientRef) -> Result<(), StoreError> {
        self.send_normal(NormalMsg::ClientDeleteAndTerminate { client })
    }

    /// Sets the maximum age a cached read-only segment handle may reach
    /// before [`HandleCache::evict_stale`](crate::segment::HandleCache::evict_stale)
    /// considers it for eviction.
    pub async fn set_maximum_since_use(&self, age: std::time::Duration) -> Result<(), StoreError> {
        self.priority_tx
            .send(PriorityMsg::SetMaximumSinceUse(age))
            .map_err(|_| StoreError::StoreGone)
    }

    /// Flushes and stops the store task.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.priority_tx
            .send(PriorityMsg::Shutdown { reply: reply_tx })
            .map_err(|_| StoreError::StoreGone)?;
        reply_rx.await.map_err(|_| StoreError::StoreGone)
    }
}
