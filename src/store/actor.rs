//! The store task (component C): the single-writer actor owning the
//! current segment file, the file summary table, and client bookkeeping.
//!
//! Drives two mailbox lanes (priority drained first, per spec.md §9's
//! "gen_server2 priority lanes" note — see [`crate::store::messages`]) and
//! implements the write/remove decision tables and compaction-trigger
//! recomputation of spec.md §4.C.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::acknowledgements::{Confirmer, DurableAction};
use crate::compactor::CompactorCommand;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::ids::{ClientRef, FileId, MessageId};
use crate::index::{IndexEntry, MessageIndex};
use crate::segment::{HandleCache, SegmentError, SegmentFile};
use crate::store::cache::{CurrentFileCache, DedupCache};
use crate::store::client::ClientRecord;
use crate::store::messages::{NormalMsg, PriorityMsg};
use crate::store::summary::{FileSummary, FileSummaryTable};

/// A read, contains-check, or remove deferred because it targeted a file
/// currently locked for compaction (spec.md §4.C "Deferred operations"),
/// replayed once that file's lock lifts.
enum DeferredOp {
    Read {
        id: MessageId,
        reply: oneshot::Sender<Result<Option<Bytes>, StoreError>>,
    },
    Contains {
        id: MessageId,
        reply: oneshot::Sender<bool>,
    },
    Remove {
        id: MessageId,
    },
}

/// Everything the recovery pass hands the store task to resume from.
pub struct RecoveredState {
    pub summaries: FileSummaryTable,
    pub index: Arc<dyn MessageIndex + Send + Sync>,
    pub current_file_no: FileId,
    pub next_file_no: FileId,
    /// Exclusive hold on `data_dir`, acquired by [`crate::recovery::recover`]
    /// before any scan runs, so two processes can never open the same store
    /// directory at once. Held for the store task's lifetime and released
    /// (via `fslock`'s own `Drop` impl) when it exits.
    pub lock: fslock::LockFile,
}

pub(crate) fn segment_err_to_store(file: FileId, err: SegmentError) -> StoreError {
    match err {
        SegmentError::Corrupt { .. } => StoreError::Misread {
            file,
            calculated: 0,
            actual: 0,
        },
        SegmentError::Io { source, .. } => StoreError::Io { source },
        SegmentError::RecordTooLarge { size, limit } => StoreError::Io {
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("record of {size} bytes exceeds {limit} byte limit"),
            ),
        },
    }
}

pub struct StoreActor {
    config: StoreConfig,
    index: Arc<dyn MessageIndex + Send + Sync>,
    summaries: FileSummaryTable,
    handle_cache: Arc<HandleCache>,
    current: SegmentFile,
    current_file_no: Arc<AtomicU32>,
    current_file_cache: CurrentFileCache,
    dedup_cache: DedupCache,
    clients: HashMap<ClientRef, ClientRecord>,
    dying_clients: HashSet<ClientRef>,
    next_file_no: FileId,
    confirmer: Confirmer,
    compactor_tx: mpsc::UnboundedSender<CompactorCommand>,
    pending_confirms: Vec<(ClientRef, MessageId)>,
    deferred: HashMap<FileId, Vec<DeferredOp>>,
    /// Held only for its `Drop` impl, which releases the directory lock
    /// when the store task exits.
    _lock: fslock::LockFile,
}

impl StoreActor {
    /// `handle_cache` and `current_file_no` are shared with
    /// [`crate::store::handle::MessageStoreHandle`] so that a direct client
    /// read of a non-current, unlocked file never has to round-trip through
    /// this task (spec.md §5's direct-read fast path).
    pub async fn new(
        config: StoreConfig,
        recovered: RecoveredState,
        confirmer: Confirmer,
        compactor_tx: mpsc::UnboundedSender<CompactorCommand>,
        handle_cache: Arc<HandleCache>,
        current_file_no: Arc<AtomicU32>,
    ) -> Result<Self, StoreError> {
        let data_dir = config.data_dir().clone();
        let current_path = data_dir.join(format!("{}.rdq", recovered.current_file_no));
        let current = SegmentFile::open_writable(current_path, recovered.current_file_no)
            .await
            .map_err(|source| segment_err_to_store(recovered.current_file_no, source))?;

        if !recovered.summaries.contains(recovered.current_file_no) {
            recovered.summaries.insert(FileSummary::new(recovered.current_file_no));
        }
        recovered.summaries.with_mut(recovered.current_file_no, |s| {
            s.file_size = current.offset();
        });
        current_file_no.store(recovered.current_file_no, Ordering::Release);

        Ok(Self {
            config,
            index: recovered.index,
            summaries: recovered.summaries,
            handle_cache,
            current,
            current_file_no,
            current_file_cache: CurrentFileCache::default(),
            dedup_cache: DedupCache::default(),
            clients: HashMap::new(),
            dying_clients: HashSet::new(),
            next_file_no: recovered.next_file_no,
            confirmer,
            compactor_tx,
            pending_confirms: Vec::new(),
            deferred: HashMap::new(),
            _lock: recovered.lock,
        })
    }

    /// Runs the actor until a [`PriorityMsg::Shutdown`] is received or both
    /// mailboxes close. Every `sync_interval` tick also evicts handle-cache
    /// entries older than [`PriorityMsg::SetMaximumSinceUse`]'s configured
    /// age, so that control actually has an effect (spec.md §5
    /// "File-descriptor pressure signals close the oldest handles in the
    /// cache").
    pub async fn run(
        mut self,
        mut normal_rx: mpsc::UnboundedReceiver<NormalMsg>,
        mut priority_rx: mpsc::UnboundedReceiver<PriorityMsg>,
    ) {
        let mut sync_tick = tokio::time::interval(self.config.sync_interval());
        loop {
            tokio::select! {
                biased;

                Some(msg) = priority_rx.recv() => {
                    if self.handle_priority(msg).await {
                        break;
                    }
                }
                Some(msg) = normal_rx.recv() => {
                    self.handle_normal(msg).await;
                }
                _ = sync_tick.tick() => {
                    self.flush().await;
                    self.handle_cache.evict_stale();
                }
                else => break,
            }
        }
        self.flush().await;
    }

    /// Fences pending writes and fires their durability confirms. Per-client
    /// confirms go through that client's own [`ClientRecord::on_msg_durable`]
    /// callback (spec.md §3); ids whose client never registered one — or
    /// already terminated — fall back to the global [`Confirmer`], the same
    /// path every id took before per-client registration was wired up.
    async fn flush(&mut self) {
        if let Err(error) = self.current.sync().await {
            error!(%error, "failed to fsync current segment file");
            return;
        }
        if self.pending_confirms.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_confirms);
        let mut by_client: HashMap<ClientRef, Vec<MessageId>> = HashMap::new();
        for (client, id) in pending {
            self.current_file_cache.mark_persisted(&id);
            by_client.entry(client).or_default().push(id);
        }
        for (client, ids) in by_client {
            match self.clients.get(&client) {
                Some(record) => (record.on_msg_durable)(ids, DurableAction::Written),
                None => self.confirmer.confirm(ids, DurableAction::Written),
            }
        }
    }

    async fn handle_priority(&mut self, msg: PriorityMsg) -> bool {
        match msg {
            PriorityMsg::SetMaximumSinceUse(age) => {
                self.handle_cache.set_maximum_since_use(age);
                false
            }
            PriorityMsg::CombineDone { src, dst, new_dst_size } => {
                self.on_combine_done(src, dst, new_dst_size).await;
                false
            }
            PriorityMsg::DeleteDone { file } => {
                self.on_delete_done(file).await;
                false
            }
            PriorityMsg::Shutdown { reply } => {
                self.flush().await;
                let _ = reply.send(());
                true
            }
        }
    }

    async fn handle_normal(&mut self, msg: NormalMsg) {
        match msg {
            NormalMsg::Write { client, id, payload } => self.handle_write(client, id, payload).await,
            NormalMsg::Read { client: _, id, reply } => self.dispatch_read(id, reply).await,
            NormalMsg::Contains { id, reply } => self.dispatch_contains(id, reply),
            NormalMsg::Remove { client: _, ids } => {
                for id in ids {
                    self.dispatch_remove(id);
                }
            }
            NormalMsg::Release { ids } => {
                for id in ids {
                    self.dedup_cache.release(&id);
                }
            }
            NormalMsg::Sync { ids: _, reply } => {
                self.flush().await;
                let _ = reply.send(());
            }
            NormalMsg::ClientInit { client, record } => {
                self.clients.insert(client, record);
            }
            NormalMsg::ClientTerminate { client, reply } => {
                self.clients.remove(&client);
                self.dying_clients.remove(&client);
                let _ = reply.send(());
            }
            NormalMsg::ClientDeleteAndTerminate { client } => {
                self.dying_clients.insert(client);
                if let Some(record) = self.clients.remove(&client) {
                    (record.on_close_fds)();
                }
            }
        }
    }

    /// Write decision table (spec.md §4.C):
    ///
    /// 1. The writing client is already marked dying: drop the write
    ///    unconditionally, whether `id` is absent, live, or unlocated —
    ///    its owner is gone before any of those outcomes could matter
    ///    (spec.md §8 scenario S3).
    /// 2. Entry already live (`ref_count > 0`) and located: pure
    ///    reference-count dedup, no I/O — message ids are content-addressed,
    ///    so an id that already has a location already has this payload.
    /// 3. Entry already live but unlocated (a reference-count delta seen
    ///    during recovery before its payload was found): append now and
    ///    attach the location, preserving the accumulated `ref_count`.
    /// 4. No entry, and the current file has room: append in place.
    /// 5. No entry, and the current file would overflow: roll to a fresh
    ///    current file first (`ensure_room`), then append.
    /// 6. Append fails for any reason: fatal per spec.md §7, logged and
    ///    dropped — the caller never sees its id confirmed durable and the
    ///    owning process is expected to crash-and-recover.
    async fn handle_write(&mut self, client: ClientRef, id: MessageId, payload: Bytes) {
        // A dying client's writes are dropped outright, whatever state `id`
        // is in: row 5 ("ignore-by-increment") and row 6 ("ignore") of
        // spec.md §4.C both suppress the write, and a dying client bumping
        // the ref_count of an entry it (or another client) may be about to
        // remove would let the write resurrect data past its last reference
        // drop. Checked before the index lookup so it also covers the
        // present-and-referenced case the table's rows don't spell out
        // separately (spec.md §8 scenario S3).
        if self.dying_clients.contains(&client) {
            return;
        }

        if let Some(mut entry) = self.index.lookup(&id) {
            if entry.ref_count > 0 {
                if entry.file.is_some() {
                    entry.ref_count += 1;
                    self.index.update(&id, entry);
                    return;
                }

                if self.ensure_room(payload.len()).await.is_err() {
                    return;
                }
                let max_record_size = self.max_record_size();
                match self.current.append(id, &payload, max_record_size).await {
                    Ok((offset, total_size)) => {
                        entry.file = Some(self.current.file_no);
                        entry.offset = offset;
                        entry.total_size = total_size;
                        self.index.update(&id, entry);
                        self.account_append(total_size);
                        self.current_file_cache.record_write(id, payload);
                        self.pending_confirms.push((client, id));
                    }
                    Err(error) => error!(%error, ?id, "fatal error appending located-on-recovery message"),
                }
                return;
            }
        }

        if self.ensure_room(payload.len()).await.is_err() {
            return;
        }
        let max_record_size = self.max_record_size();
        match self.current.append(id, &payload, max_record_size).await {
            Ok((offset, total_size)) => {
                self.index
                    .insert(id, IndexEntry::new(self.current.file_no, offset, total_size));
                self.account_append(total_size);
                self.current_file_cache.record_write(id, payload);
                self.pending_confirms.push((client, id));
            }
            Err(error) => error!(%error, ?id, "fatal error appending new message"),
        }
    }

    /// The file `id` currently resolves to, if that file is locked for
    /// compaction (the current file is never locked and is excluded, matching
    /// the file-summary invariant of spec.md §3).
    fn locked_file_for(&self, id: &MessageId) -> Option<FileId> {
        let file = self.index.lookup(id)?.file?;
        if file == self.current.file_no {
            return None;
        }
        self.summaries.with(file, |s| s.locked).unwrap_or(false).then_some(file)
    }

    /// Reads `id`, deferring onto its file's completion list if that file is
    /// currently locked for compaction (spec.md §4.C "Deferred operations").
    async fn dispatch_read(&mut self, id: MessageId, reply: oneshot::Sender<Result<Option<Bytes>, StoreError>>) {
        if let Some(file) = self.locked_file_for(&id) {
            self.deferred.entry(file).or_default().push(DeferredOp::Read { id, reply });
            return;
        }
        let result = self.handle_read(&id).await;
        let _ = reply.send(result);
    }

    fn dispatch_contains(&mut self, id: MessageId, reply: oneshot::Sender<bool>) {
        if let Some(file) = self.locked_file_for(&id) {
            self.deferred.entry(file).or_default().push(DeferredOp::Contains { id, reply });
            return;
        }
        let present = self.index.lookup(&id).map_or(false, |e| e.ref_count > 0);
        let _ = reply.send(present);
    }

    fn dispatch_remove(&mut self, id: MessageId) {
        if let Some(file) = self.locked_file_for(&id) {
            self.deferred.entry(file).or_default().push(DeferredOp::Remove { id });
            return;
        }
        self.handle_remove(&id);
    }

    /// Replays every operation deferred against `file`, in arrival order
    /// (spec.md §4.C). Each replayed op re-checks lock state through the same
    /// `dispatch_*` path, so an op whose id moved onto another,
    /// still-locked file during this same unlock is re-deferred rather than
    /// raced against it.
    async fn drain_deferred(&mut self, file: FileId) {
        let Some(ops) = self.deferred.remove(&file) else {
            return;
        };
        for op in ops {
            match op {
                DeferredOp::Read { id, reply } => self.dispatch_read(id, reply).await,
                DeferredOp::Contains { id, reply } => self.dispatch_contains(id, reply),
                DeferredOp::Remove { id } => self.dispatch_remove(id),
            }
        }
    }

    fn max_record_size(&self) -> usize {
        crate::segment::DEFAULT_MAX_RECORD_SIZE
    }

    fn account_append(&self, total_size: u64) {
        self.summaries.with_mut(self.current.file_no, |s| {
            s.file_size += total_size;
            s.valid_total_size += total_size;
        });
    }

    /// Rolls to a new current file if the next write would exceed the
    /// configured size limit (spec.md §4.C "Rolling the current file").
    async fn ensure_room(&mut self, payload_len: usize) -> Result<(), ()> {
        let projected = self.current.offset() + crate::segment::framed_len(payload_len);
        if projected <= self.config.file_size_limit() {
            return Ok(());
        }
        self.roll_current().await
    }

    async fn roll_current(&mut self) -> Result<(), ()> {
        if let Err(error) = self.current.sync().await {
            error!(%error, "fatal error syncing current segment file before roll");
            return Err(());
        }
        let old_file_no = self.current.file_no;
        let new_file_no = self.next_file_no;
        self.next_file_no += 1;

        let new_path = self.config.data_dir().join(format!("{new_file_no}.rdq"));
        let new_file = match SegmentFile::open_writable(new_path, new_file_no).await {
            Ok(f) => f,
            Err(error) => {
                error!(%error, "fatal error opening successor segment file");
                return Err(());
            }
        };

        self.summaries.with_mut(old_file_no, |s| s.right = Some(new_file_no));
        self.summaries.insert(FileSummary::new(new_file_no));
        self.summaries.with_mut(new_file_no, |s| s.left = Some(old_file_no));

        self.current = new_file;
        self.current_file_no.store(new_file_no, Ordering::Release);
        self.current_file_cache.prune_flushed();
        self.maybe_delete_empty(old_file_no);
        self.maybe_trigger_compaction();
        Ok(())
    }

    /// Remove decision table (spec.md §4.C):
    ///
    /// 1. No entry at all: no-op, a duplicate or already-reclaimed remove.
    /// 2. `ref_count` stays above zero after decrementing: update only.
    /// 3. `ref_count` reaches zero on an unlocated entry: delete outright,
    ///    nothing was ever written to reclaim.
    /// 4. `ref_count` reaches zero on the current file: delete the entry
    ///    and drop it from the current-file cache if its write is still
    ///    in flight.
    /// 5. `ref_count` reaches zero on any other live file: delete the
    ///    entry, debit the file's `valid_total_size`, and recheck both the
    ///    empty-file-deletion and compaction triggers.
    /// 6. `ref_count` already at or below zero: warn and leave it — a
    ///    double-remove elsewhere should not be allowed to go negative.
    fn handle_remove(&mut self, id: &MessageId) {
        let Some(mut entry) = self.index.lookup(id) else {
            return;
        };
        if entry.ref_count <= 0 {
            warn!(?id, ref_count = entry.ref_count, "remove on a non-positive ref_count entry");
            return;
        }
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            self.index.update(id, entry);
            return;
        }

        self.index.delete(id);
        if let Some(file) = entry.file {
            self.summaries.with_mut(file, |s| {
                s.valid_total_size = s.valid_total_size.saturating_sub(entry.total_size);
            });
            if file == self.current.file_no {
                self.current_file_cache.mark_persisted(id);
            } else {
                self.maybe_delete_empty(file);
            }
            self.maybe_trigger_compaction();
        }
    }

    fn maybe_delete_empty(&mut self, file: FileId) {
        if file == self.current.file_no {
            return;
        }
        let empty_unlocked = self
            .summaries
            .with(file, |s| s.valid_total_size == 0 && !s.locked)
            .unwrap_or(false);
        if empty_unlocked {
            self.lock_file(file);
            let _ = self.compactor_tx.send(CompactorCommand::Delete { file });
        }
    }

    fn lock_file(&self, file: FileId) {
        self.summaries.with_mut(file, |s| s.locked = true);
    }

    /// Recomputes whether two neighboring files should be combined
    /// (spec.md §4.C "Compaction trigger"): total on-disk size more than
    /// double the limit, and more than half of it garbage.
    fn maybe_trigger_compaction(&mut self) {
        let total_size = self.summaries.total_size();
        let total_valid = self.summaries.total_valid();
        if total_size <= 2 * self.config.file_size_limit() {
            return;
        }
        let garbage_fraction = if total_size == 0 {
            0.0
        } else {
            (total_size - total_valid) as f64 / total_size as f64
        };
        if garbage_fraction <= self.config.garbage_fraction() {
            return;
        }

        if let Some((dst, src)) = self.find_combinable_pair() {
            self.lock_file(dst);
            self.lock_file(src);
            let _ = self.compactor_tx.send(CompactorCommand::Combine { src, dst });
        }
    }

    /// Finds an adjacent, unlocked, non-current pair `(dst, src)` with
    /// `dst.right == Some(src)`, preferring the pair with the most
    /// combined garbage.
    fn find_combinable_pair(&self) -> Option<(FileId, FileId)> {
        let snapshot = self.summaries.snapshot();
        let current = self.current.file_no;
        let mut best: Option<(FileId, FileId, u64)> = None;
        for &(file_no, valid, size, locked) in &snapshot {
            if locked || file_no == current {
                continue;
            }
            let Some(right) = self.summaries.with(file_no, |s| s.right).flatten() else {
                continue;
            };
            if right == current {
                continue;
            }
            let right_locked = self.summaries.with(right, |s| s.locked).unwrap_or(true);
            if right_locked {
                continue;
            }
            if valid == 0 {
                // Already a candidate for straight deletion instead; maybe_delete_empty
                // locks it before this scan runs in every path that can zero it out.
                continue;
            }
            let right_size = self.summaries.with(right, |s| s.file_size).unwrap_or(0);
            let right_valid = self.summaries.with(right, |s| s.valid_total_size).unwrap_or(0);
            if right_valid == 0 {
                continue;
            }
            if valid + right_valid > self.config.file_size_limit() {
                continue;
            }
            let garbage = (size - valid) + (right_size - right_valid);
            if best.map_or(true, |(_, _, best_garbage)| garbage > best_garbage) {
                best = Some((file_no, right, garbage));
            }
        }
        best.map(|(dst, src, _)| (dst, src))
    }

    async fn on_combine_done(&mut self, src: FileId, dst: FileId, new_dst_size: u64) {
        self.index.delete_by_file(src);
        let src_right = self.summaries.remove(src).and_then(|s| s.right);
        self.summaries.with_mut(dst, |s| {
            s.file_size = new_dst_size;
            s.valid_total_size = new_dst_size;
            s.locked = false;
            s.right = src_right;
        });
        if let Some(right) = src_right {
            self.summaries.with_mut(right, |s| s.left = Some(dst));
        }
        self.handle_cache.invalidate(src);
        self.handle_cache.invalidate(dst);
        // Spec.md §4.D step (e): drain both files' deferred op lists before
        // recomputing further compaction triggers, so a freshly-queued
        // compaction can't relock `dst` out from under a still-pending op.
        self.drain_deferred(src).await;
        self.drain_deferred(dst).await;
        self.maybe_delete_empty(dst);
        self.maybe_trigger_compaction();
    }

    async fn on_delete_done(&mut self, file: FileId) {
        self.index.delete_by_file(file);
        let removed = self.summaries.remove(file);
        if let Some(summary) = removed {
            if let Some(left) = summary.left {
                self.summaries.with_mut(left, |s| s.right = summary.right);
            }
            if let Some(right) = summary.right {
                self.summaries.with_mut(right, |s| s.left = summary.left);
            }
        }
        self.handle_cache.invalidate(file);
        self.drain_deferred(file).await;
    }

    async fn handle_read(&mut self, id: &MessageId) -> Result<Option<Bytes>, StoreError> {
        if let Some(payload) = self.current_file_cache.get(id) {
            return Ok(Some(payload));
        }
        if let Some(payload) = self.dedup_cache.get(id) {
            return Ok(Some(payload));
        }
        let Some(entry) = self.index.lookup(id) else {
            return Ok(None);
        };
        if entry.ref_count <= 0 {
            return Ok(None);
        }
        let Some(file) = entry.file else {
            return Ok(None);
        };

        let raw = if file == self.current.file_no {
            self.current
                .read(entry.offset, entry.total_size)
                .await
                .map(|(_, payload)| payload)
                .map_err(|source| segment_err_to_store(file, source))?
        } else {
            let handle = self
                .handle_cache
                .get(file)
                .await
                .map_err(|source| segment_err_to_store(file, source))?;
            let mut guard = handle.lock().await;
            let result = guard
                .read(entry.offset, entry.total_size)
                .await
                .map(|(_, payload)| payload)
                .map_err(|source| segment_err_to_store(file, source));
            if let Err(StoreError::Misread { file, .. }) = &result {
                // spec.md §7: a misread on a non-current file is escalated —
                // the caller aborts here, and the file is moved to a backup
                // location the next time the store starts up.
                crate::recovery::mark_file_for_backup(self.config.data_dir(), *file).await;
            }
            result?
        };

        let payload = Bytes::from(raw);
        if entry.ref_count > 1 {
            self.dedup_cache.populate(*id, payload.clone());
        }
        Ok(Some(payload))
    }
}
