//! The queue task (component E): a single-writer actor maintaining one
//! queue's backlog atop the message store.
//!
//! # Paging model
//!
//! spec.md §4.E describes a five-zone pipeline (q1→q2→Δ→q3→q4) in which a
//! message's *position* can itself be paged out of RAM into a persisted
//! queue index ([`QueueIndexFile`]), distinct from its *payload* (already
//! durable in the message store).
//!
//! The zones are modeled as annotations over a single ordered
//! [`VecDeque<QueueEntry>`] (`backlog`, front = next to fetch, back = most
//! recently published), plus the real paged-out span:
//! - the first [`QueueActor::PREFIX_WINDOW`] resident entries are the q3/q4
//!   "ready" zone: their payload is always kept cached for fast fetch;
//! - everything behind that window is q1/q2 territory; its payload cache is
//!   the first thing a memory-reduction round evicts (α→β);
//! - once an entry behind the window has had its position fsynced to
//!   [`QueueIndexFile`], it is eligible to leave RAM entirely (β→γ→δ): its
//!   `QueueEntry` is dropped from `backlog` and [`Delta`] extends to cover
//!   it — the entry's only remaining trace in this process's memory is
//!   Δ's `(start_seq, count, end_seq)` span;
//! - [`Self::refill_from_delta`] is the reverse (δ→q3): read a batch of
//!   positions back from the index file into `backlog` once the resident
//!   window runs dry.
//!
//! Evicting a cached payload never touches durability: the bytes are
//! already fsynced in the message store under `entry.meta.id`; eviction
//! just means the next fetch has to ask the store for them again. Pushing
//! a position to Δ does: it must be fsynced to the index file first, since
//! nothing else remembers it once it leaves `backlog`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;

use crate::acknowledgements::{Confirmer, DurableAction};
use crate::error::StoreError;
use crate::ids::{ClientRef, MessageId, SeqId};
use crate::queue::delta::Delta;
use crate::queue::entry::{QueueEntry, QueueEntryMeta};
use crate::queue::messages::{Delivery, NormalMsg, PriorityMsg, QueueStats, TxnId, HIBERNATE_CHECK};
use crate::queue::pending_ack::{DeliveryTag, PendingAckTable};
use crate::queue::qindex::QueueIndexFile;
use crate::queue::rates::QueueRates;
use crate::queue::QueueConfig;
use crate::store::MessageStoreHandle;

#[derive(Default)]
struct PendingTxn {
    publishes: Vec<(MessageId, bytes::Bytes, bool)>,
    acks: Vec<DeliveryTag>,
}

pub struct QueueActor {
    config: QueueConfig,
    store: MessageStoreHandle,
    confirmer: Confirmer,
    backlog: VecDeque<QueueEntry>,
    next_seq: SeqId,
    pending_ack: PendingAckTable,
    /// Ids with a publish-time confirm still outstanding. Shared with the
    /// detached sync-await tasks spawned by [`Self::publish`] so each one
    /// can remove its own id exactly once durability is observed,
    /// satisfying spec.md §8 property 10 without routing the completion
    /// back through the actor's mailbox.
    unconfirmed: Arc<Mutex<HashSet<MessageId>>>,
    rates: QueueRates,
    target_ram_count: u64,
    transient_threshold: SeqId,
    txns: HashMap<(ClientRef, TxnId), PendingTxn>,
    last_activity: Instant,
    /// `ram_msg_count`/`ram_ack_count` as of the previous rate tick, kept
    /// for the RAM-duration formula of spec.md §4.E "Rate sampling".
    prev_ram_msg_count: u64,
    prev_ram_ack_count: u64,
    ram_duration_secs: f64,
    /// The real δ tier: every position pushed here has already been
    /// fsynced to `qindex`, so `backlog` can drop it entirely.
    delta: Delta,
    /// Persistent entries currently represented only by `delta`, folded
    /// into `stats().persistent_count` alongside the resident ones.
    delta_persistent_count: u64,
    qindex: QueueIndexFile,
}

impl QueueActor {
    /// Entries at the front of the backlog within this many positions are
    /// always kept payload-cached, standing in for the "keep up to one
    /// segment of q3 resident" rule of spec.md §4.E step 6.
    const PREFIX_WINDOW: usize = 64;

    pub fn new(
        config: QueueConfig,
        store: MessageStoreHandle,
        confirmer: Confirmer,
        transient_threshold: SeqId,
        qindex: QueueIndexFile,
    ) -> Self {
        let now = Instant::now();
        Self {
            config,
            store,
            confirmer,
            backlog: VecDeque::new(),
            next_seq: transient_threshold,
            pending_ack: PendingAckTable::new(),
            unconfirmed: Arc::new(Mutex::new(HashSet::new())),
            rates: QueueRates::new(now),
            target_ram_count: u64::MAX,
            transient_threshold,
            txns: HashMap::new(),
            last_activity: now,
            prev_ram_msg_count: 0,
            prev_ram_ack_count: 0,
            ram_duration_secs: f64::INFINITY,
            delta: Delta::empty_at(transient_threshold),
            delta_persistent_count: 0,
            qindex,
        }
    }

    pub async fn run(
        mut self,
        mut normal_rx: mpsc::UnboundedReceiver<NormalMsg>,
        mut priority_rx: mpsc::UnboundedReceiver<PriorityMsg>,
    ) {
        let mut rate_tick = interval(self.config.ram_duration_update_interval);
        let mut hibernate_tick = interval(HIBERNATE_CHECK);

        loop {
            tokio::select! {
                biased;

                msg = priority_rx.recv() => {
                    match msg {
                        Some(msg) => {
                            if self.handle_priority(msg).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                msg = normal_rx.recv() => {
                    match msg {
                        Some(msg) => self.handle_normal(msg).await,
                        None => break,
                    }
                }

                _ = rate_tick.tick() => {
                    self.on_rate_tick(Instant::now());
                }

                _ = hibernate_tick.tick() => {
                    // Every mutating op already runs a reduction check
                    // inline; this periodic pass only needs to catch
                    // pressure that built up while the queue sat idle
                    // (spec.md §9 "hibernation/idle_timeout" design note).
                    if self.last_activity.elapsed() >= self.config.hibernate_after {
                        self.maybe_reduce().await;
                    }
                }
            }
        }
    }

    async fn handle_priority(&mut self, msg: PriorityMsg) -> bool {
        match msg {
            PriorityMsg::SetTargetRamCount(target) => {
                let lowered = target < self.target_ram_count;
                self.target_ram_count = target;
                if lowered {
                    if let Err(error) = self.run_reduction_round().await {
                        warn!(%error, "queue memory-reduction round failed to sync its index");
                    }
                }
                false
            }
            PriorityMsg::Tick => {
                self.maybe_reduce().await;
                false
            }
            PriorityMsg::Shutdown { reply } => {
                let _ = reply.send(());
                true
            }
        }
    }

    async fn handle_normal(&mut self, msg: NormalMsg) {
        self.last_activity = Instant::now();
        match msg {
            NormalMsg::Publish {
                client,
                id,
                payload,
                persistent,
                needs_confirming,
                reply,
            } => {
                let result = self
                    .publish(client, id, payload, persistent, needs_confirming)
                    .await;
                let _ = reply.send(result);
            }
            NormalMsg::Fetch { count, reply } => {
                let result = self.fetch(count).await;
                let _ = reply.send(result);
            }
            NormalMsg::Ack { tags, reply } => {
                let result = self.ack(tags).await;
                let _ = reply.send(result);
            }
            NormalMsg::Requeue { tags, reply } => {
                let result = self.requeue(tags);
                let _ = reply.send(result);
            }
            NormalMsg::DropWhile { predicate, reply } => {
                let dropped = self.dropwhile(predicate);
                let _ = reply.send(dropped);
            }
            NormalMsg::TxnPublish {
                client,
                txn,
                id,
                payload,
                persistent,
            } => {
                self.txns
                    .entry((client, txn))
                    .or_default()
                    .publishes
                    .push((id, payload, persistent));
            }
            NormalMsg::TxnAck { client, txn, tags } => {
                self.txns.entry((client, txn)).or_default().acks.extend(tags);
            }
            NormalMsg::TxnCommit { client, txn, reply } => {
                let result = self.commit(client, txn).await;
                let _ = reply.send(result);
            }
            NormalMsg::TxnRollback { client, txn, reply } => {
                self.rollback(client, txn).await;
                let _ = reply.send(());
            }
            NormalMsg::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn ram_msg_count(&self) -> u64 {
        self.backlog.iter().filter(|e| e.is_cached()).count() as u64
    }

    fn stats(&self) -> QueueStats {
        let persistent_count = self.backlog.iter().filter(|e| e.meta.persistent).count() as u64
            + self.pending_ack.persistent_count()
            + self.delta_persistent_count;
        QueueStats {
            len: self.backlog.len() as u64 + self.delta.count,
            ram_msg_count: self.ram_msg_count(),
            ram_ack_count: self.pending_ack.ram_resident_count(),
            persistent_count,
            delta_count: self.delta.count,
            ram_duration_secs: self.ram_duration_secs,
        }
    }

    /// Rolls the rate trackers and recomputes `ram_duration_secs` (spec.md
    /// §4.E "Rate sampling"): `(ram_msg_count_prev + ram_msg_count +
    /// ram_ack_count + ram_ack_count_prev) / (4 × Σ rates)`. An external
    /// memory monitor (out of scope per spec.md §1) is expected to read
    /// this off [`QueueStats`] and respond with a new target via
    /// [`crate::queue::QueueHandle::set_target_ram_count`].
    fn on_rate_tick(&mut self, now: Instant) {
        self.rates.sample_all(now);

        let ram_msg_count = self.backlog.iter().filter(|e| e.is_cached()).count() as u64;
        let ram_ack_count = self.pending_ack.len() as u64;
        let total_rate = self.rates.publish.rate_per_sec()
            + self.rates.deliver.rate_per_sec()
            + self.rates.ack.rate_per_sec()
            + self.rates.requeue.rate_per_sec();

        self.ram_duration_secs = if total_rate > 0.0 {
            (self.prev_ram_msg_count + ram_msg_count + ram_ack_count + self.prev_ram_ack_count) as f64
                / (4.0 * total_rate)
        } else {
            f64::INFINITY
        };

        self.prev_ram_msg_count = ram_msg_count;
        self.prev_ram_ack_count = ram_ack_count;
    }

    async fn publish(
        &mut self,
        client: ClientRef,
        id: MessageId,
        payload: bytes::Bytes,
        persistent: bool,
        needs_confirming: bool,
    ) -> Result<(), StoreError> {
        self.store.write(client, id, payload.clone()).await?;
        self.rates.publish.record(1);

        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = QueueEntry {
            meta: QueueEntryMeta { seq, id, persistent },
            cached_payload: Some(payload),
            index_durable: false,
        };

        // spec.md §4.E distinguishes writing to q1 (tail-staging) from q4
        // (head, for an idle queue) so a fresh message on an empty queue is
        // immediately fetchable; here that is just "append", since zone
        // membership is a derived annotation over one backlog rather than a
        // choice between containers.
        self.backlog.push_back(entry);

        if needs_confirming {
            // Property 10 (spec.md §8) needs both the store's payload fence
            // and this queue's position fence observed before confirming.
            // The position fence only this actor can drive (it alone
            // mutates `backlog`/`qindex`), so it runs inline, synchronously,
            // before the detached task below waits on the payload fence.
            self.sync_index_through(seq).await?;

            self.unconfirmed.lock().insert(id);
            let store = self.store.clone();
            let confirmer = self.confirmer.clone();
            let unconfirmed = Arc::clone(&self.unconfirmed);
            tokio::spawn(async move {
                if store.sync(vec![id]).await.is_ok() {
                    unconfirmed.lock().remove(&id);
                    confirmer.confirm(vec![id], DurableAction::Written);
                }
            });
        }

        self.maybe_reduce().await;
        Ok(())
    }

    async fn fetch(&mut self, count: usize) -> Result<Vec<Delivery>, StoreError> {
        let mut deliveries = Vec::with_capacity(count);
        for _ in 0..count {
            if self.backlog.is_empty() && !self.delta.is_empty() {
                self.refill_from_delta().await?;
            }
            let Some(entry) = self.backlog.pop_front() else {
                break;
            };
            if !entry.meta.persistent && entry.meta.seq < self.transient_threshold {
                // Stale transient leftover from before the startup threshold
                // (spec.md §4.E "transient threshold" lazy drop).
                continue;
            }
            let payload = match entry.cached_payload.clone() {
                Some(payload) => payload,
                None => match self.store.read(entry.meta.id).await? {
                    Some(payload) => payload,
                    None => continue,
                },
            };
            self.rates.deliver.record(1);
            let meta = entry.meta;
            let tag = self.pending_ack.insert(entry);
            deliveries.push(Delivery { tag, meta, payload });
        }
        Ok(deliveries)
    }

    async fn ack(&mut self, tags: Vec<DeliveryTag>) -> Result<(), StoreError> {
        let mut ids = Vec::with_capacity(tags.len());
        for tag in tags {
            if let Some(entry) = self.pending_ack.take(tag) {
                ids.push(entry.meta.id);
                self.rates.ack.record(1);
            }
        }
        if !ids.is_empty() {
            // Acking always drops the reference this queue's publish took
            // out on the store; a message referenced by other queues stays
            // alive via its own ref count (spec.md §4.C).
            self.store.remove(ClientRef::new(), ids).await?;
        }
        Ok(())
    }

    fn requeue(&mut self, tags: Vec<DeliveryTag>) -> Result<(), StoreError> {
        for tag in tags {
            if let Some(mut entry) = self.pending_ack.take(tag) {
                self.rates.requeue.record(1);
                entry.cached_payload = None;
                self.backlog.push_front(entry);
            }
        }
        Ok(())
    }

    /// Repeatedly fetches without acking while `predicate` holds on the
    /// front entry's metadata, stopping (and leaving the first
    /// non-matching entry at the head) the first time it doesn't.
    pub fn dropwhile<F>(&mut self, predicate: F) -> Vec<QueueEntryMeta>
    where
        F: FnMut(&QueueEntryMeta) -> bool,
    {
        dropwhile_backlog(&mut self.backlog, predicate)
    }

    async fn commit(&mut self, client: ClientRef, txn: TxnId) -> Result<(), StoreError> {
        let Some(pending) = self.txns.remove(&(client, txn)) else {
            return Ok(());
        };

        let persistent_ids: Vec<MessageId> = pending
            .publishes
            .iter()
            .filter(|(_, _, persistent)| *persistent)
            .map(|(id, _, _)| *id)
            .collect();

        for (id, payload, _) in &pending.publishes {
            self.store.write(client, *id, payload.clone()).await?;
        }
        if !persistent_ids.is_empty() {
            self.store.sync(persistent_ids).await?;
        }

        for (id, payload, persistent) in pending.publishes {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.backlog.push_back(QueueEntry {
                meta: QueueEntryMeta { seq, id, persistent },
                cached_payload: Some(payload),
                index_durable: false,
            });
            self.rates.publish.record(1);
        }

        self.ack(pending.acks).await?;
        self.maybe_reduce().await;
        Ok(())
    }

    async fn rollback(&mut self, client: ClientRef, txn: TxnId) {
        if let Some(pending) = self.txns.remove(&(client, txn)) {
            let ids: Vec<MessageId> = pending.publishes.into_iter().map(|(id, _, _)| id).collect();
            if !ids.is_empty() {
                let _ = self.store.remove(client, ids).await;
            }
        }
    }

    async fn maybe_reduce(&mut self) {
        let ram_count = self.ram_msg_count() + self.pending_ack.ram_resident_count();
        if ram_count > self.target_ram_count {
            if let Err(error) = self.run_reduction_round().await {
                warn!(%error, "queue memory-reduction round failed to sync its index");
            }
        }
    }

    /// One memory-reduction round (spec.md §4.E, steps 1-6): evicts cached
    /// payloads (α→β) from whichever pool — acks or backlog entries — is
    /// under more delivery pressure first, then pages resident positions
    /// out to [`QueueIndexFile`] (β→γ→δ) if `target_ram_count` is zero and
    /// quota remains. `quota` is shared across every step so the round as a
    /// whole obeys spec.md §8 property 9's single bound, rather than each
    /// pool getting its own `io_batch_size` budget.
    async fn run_reduction_round(&mut self) -> Result<(), StoreError> {
        let current = self.ram_msg_count() + self.pending_ack.ram_resident_count();
        if current <= self.target_ram_count {
            return Ok(());
        }
        let mut quota = current
            .saturating_sub(self.target_ram_count)
            .min(self.config.io_batch_size as u64);

        let msg_pressure = self.rates.publish.rate_per_sec() - self.rates.deliver.rate_per_sec();
        let ack_pressure = self.rates.deliver.rate_per_sec() - self.rates.ack.rate_per_sec();
        let ack_first = ack_pressure > msg_pressure;

        if ack_first {
            quota -= self.pending_ack.evict(quota as usize) as u64;
            quota -= self.evict_message_payloads(quota);
        } else {
            quota -= self.evict_message_payloads(quota);
            quota -= self.pending_ack.evict(quota as usize) as u64;
        }

        let mut pushed = 0u64;
        if self.target_ram_count == 0 && quota > 0 {
            pushed = self.push_behind_window_into_delta(quota).await?;
        }
        debug!(evicted = current - quota + pushed, pushed, "queue memory-reduction round");
        Ok(())
    }

    /// Drops cached payload from entries outside [`Self::PREFIX_WINDOW`],
    /// oldest-published first, up to `quota`. The window itself never loses
    /// its cache: it is the "ready" zone a fetch serves from directly.
    fn evict_message_payloads(&mut self, quota: u64) -> u64 {
        let mut evicted = 0u64;
        for entry in self.backlog.iter_mut().skip(Self::PREFIX_WINDOW) {
            if evicted >= quota {
                break;
            }
            if entry.cached_payload.take().is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    /// Pages up to `quota` positions behind the window out of `backlog`
    /// entirely (β→γ→δ), fsyncing any not-yet-durable ones to `qindex`
    /// first. Returns the number actually pushed.
    async fn push_behind_window_into_delta(&mut self, quota: u64) -> Result<u64, StoreError> {
        let mut batch = Vec::new();
        while (batch.len() as u64) < quota && self.backlog.len() > Self::PREFIX_WINDOW {
            let entry = self.backlog.remove(Self::PREFIX_WINDOW).expect("checked len above");
            batch.push(entry);
        }
        if batch.is_empty() {
            return Ok(0);
        }

        let unsynced: Vec<_> = batch.iter().filter(|e| !e.index_durable).map(|e| e.meta).collect();
        if !unsynced.is_empty() {
            self.qindex.append_batch(&unsynced).await?;
        }

        let pushed = batch.len() as u64;
        for entry in &batch {
            self.delta.extend(entry.meta.seq);
            if entry.meta.persistent {
                self.delta_persistent_count += 1;
            }
        }
        Ok(pushed)
    }

    /// Fsyncs the metadata of every not-yet-durable backlog entry with
    /// `seq <= target_seq` to `qindex`, marking each `index_durable`. Used
    /// by [`Self::publish`] to fence a confirmable publish's position
    /// before the confirm can fire (spec.md §8 property 10), and
    /// implicitly by [`Self::push_behind_window_into_delta`] for entries
    /// this sweep hasn't already covered.
    async fn sync_index_through(&mut self, target_seq: SeqId) -> Result<(), StoreError> {
        let mut batch = Vec::new();
        for entry in self.backlog.iter() {
            if entry.meta.seq > target_seq {
                break;
            }
            if !entry.index_durable {
                batch.push(entry.meta);
            }
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.qindex.append_batch(&batch).await?;
        for entry in self.backlog.iter_mut() {
            if entry.meta.seq > target_seq {
                break;
            }
            entry.index_durable = true;
        }
        Ok(())
    }

    /// Reads the next batch of paged-out positions back from `qindex` into
    /// `backlog` (δ→q3), shrinking `Delta` by the same amount. A no-op if
    /// `Delta` is empty.
    async fn refill_from_delta(&mut self) -> Result<(), StoreError> {
        if self.delta.is_empty() {
            return Ok(());
        }
        let batch = (self.config.io_batch_size as u64).min(self.delta.count) as usize;
        let metas = self.qindex.read_from(self.delta.start_seq, batch).await?;
        for _ in 0..metas.len() {
            self.delta.shrink_front();
        }
        for meta in metas {
            if meta.persistent {
                self.delta_persistent_count = self.delta_persistent_count.saturating_sub(1);
            }
            self.backlog.push_back(QueueEntry {
                meta,
                cached_payload: None,
                index_durable: true,
            });
        }
        Ok(())
    }
}

fn dropwhile_backlog<F>(backlog: &mut VecDeque<QueueEntry>, mut predicate: F) -> Vec<QueueEntryMeta>
where
    F: FnMut(&QueueEntryMeta) -> bool,
{
    let mut dropped = Vec::new();
    while let Some(entry) = backlog.front() {
        if !predicate(&entry.meta) {
            break;
        }
        let entry = backlog.pop_front().expect("front just peeked");
        dropped.push(entry.meta);
    }
    dropped
}

pub(crate) fn spawn(
    config: QueueConfig,
    store: MessageStoreHandle,
    confirmer: Confirmer,
    transient_threshold: SeqId,
    index_path: std::path::PathBuf,
) -> (
    mpsc::UnboundedSender<NormalMsg>,
    mpsc::UnboundedSender<PriorityMsg>,
) {
    let (normal_tx, normal_rx) = mpsc::unbounded_channel();
    let (priority_tx, priority_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let qindex = match QueueIndexFile::open(index_path.clone()).await {
            Ok(qindex) => qindex,
            Err(error) => {
                error!(path = %index_path.display(), %error, "failed to open queue index file");
                return;
            }
        };
        let actor = QueueActor::new(config, store, confirmer, transient_threshold, qindex);
        actor.run(normal_rx, priority_rx).await;
    });
    (normal_tx, priority_tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(seq: u64) -> QueueEntryMeta {
        QueueEntryMeta {
            seq,
            id: MessageId::from_bytes([seq as u8; 16]),
            persistent: false,
        }
    }

    #[test]
    fn dropwhile_stops_at_first_non_match() {
        let mut backlog = VecDeque::new();
        for seq in 0..5 {
            backlog.push_back(QueueEntry {
                meta: meta(seq),
                cached_payload: None,
                index_durable: false,
            });
        }
        let dropped = dropwhile_backlog(&mut backlog, |m| m.seq < 3);
        assert_eq!(dropped.len(), 3);
        assert_eq!(backlog.front().unwrap().meta.seq, 3);
    }

    async fn test_actor() -> (QueueActor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::StoreConfig::from_path(dir.path().join("store")).build();
        let store = crate::store::open(config, Confirmer::noop()).await.unwrap();
        let qindex = QueueIndexFile::open(dir.path().join("q.qidx")).await.unwrap();
        let actor = QueueActor::new(QueueConfig::default(), store, Confirmer::noop(), 0, qindex);
        (actor, dir)
    }

    #[tokio::test]
    async fn reduction_round_evicts_oldest_outside_the_window_first() {
        let (mut actor, _dir) = test_actor().await;
        for seq in 0..(QueueActor::PREFIX_WINDOW as u64 + 10) {
            actor.backlog.push_back(QueueEntry {
                meta: meta(seq),
                cached_payload: Some(bytes::Bytes::from_static(b"x")),
                index_durable: false,
            });
        }
        let evicted = actor.evict_message_payloads(4);
        assert_eq!(evicted, 4);
        assert!(!actor.backlog[QueueActor::PREFIX_WINDOW].is_cached());
        assert!(actor.backlog[0].is_cached());
        assert!(actor.backlog.back().unwrap().is_cached());
    }

    #[tokio::test]
    async fn push_behind_window_into_delta_pages_out_and_syncs_index() {
        let (mut actor, _dir) = test_actor().await;
        for seq in 0..(QueueActor::PREFIX_WINDOW as u64 + 10) {
            actor.backlog.push_back(QueueEntry {
                meta: meta(seq),
                cached_payload: Some(bytes::Bytes::from_static(b"x")),
                index_durable: false,
            });
        }
        let pushed = actor.push_behind_window_into_delta(10).await.unwrap();
        assert_eq!(pushed, 10);
        assert_eq!(actor.backlog.len(), QueueActor::PREFIX_WINDOW);
        assert_eq!(actor.delta.count, 10);
        assert_eq!(actor.delta.start_seq, QueueActor::PREFIX_WINDOW as u64);

        let read_back = actor.qindex.read_from(0, 100).await.unwrap();
        assert_eq!(read_back.len(), 10);
    }

    #[tokio::test]
    async fn refill_from_delta_restores_paged_out_positions() {
        let (mut actor, _dir) = test_actor().await;
        for seq in 0..(QueueActor::PREFIX_WINDOW as u64 + 10) {
            actor.backlog.push_back(QueueEntry {
                meta: meta(seq),
                cached_payload: Some(bytes::Bytes::from_static(b"x")),
                index_durable: false,
            });
        }
        actor.push_behind_window_into_delta(10).await.unwrap();
        actor.backlog.clear();

        actor.refill_from_delta().await.unwrap();
        assert!(actor.delta.is_empty());
        assert_eq!(actor.backlog.len(), 10);
        assert_eq!(actor.backlog.front().unwrap().meta.seq, QueueActor::PREFIX_WINDOW as u64);
    }

    #[tokio::test]
    async fn reduction_round_obeys_the_shared_quota_bound() {
        // Property 9 (spec.md §8): after a round, ram_msg_count + ram_ack_count
        // <= max(prev - IO_BATCH_SIZE, target_ram_count).
        let (mut actor, _dir) = test_actor().await;
        actor.config.io_batch_size = 10;
        actor.target_ram_count = 0;
        for seq in 0..(QueueActor::PREFIX_WINDOW as u64 + 50) {
            actor.backlog.push_back(QueueEntry {
                meta: meta(seq),
                cached_payload: Some(bytes::Bytes::from_static(b"x")),
                index_durable: false,
            });
        }
        let prev = actor.ram_msg_count() + actor.pending_ack.ram_resident_count();

        actor.run_reduction_round().await.unwrap();

        let after = actor.ram_msg_count() + actor.pending_ack.ram_resident_count();
        assert!(
            after <= prev.saturating_sub(actor.config.io_batch_size as u64).max(actor.target_ram_count),
            "after={after} prev={prev} batch={}",
            actor.config.io_batch_size
        );
    }

    #[tokio::test]
    async fn publish_confirms_only_after_index_durability_is_synced() {
        // Property 10 (spec.md §8): the confirm fence composes the store's
        // payload durability with the queue's own position durability.
        // `sync_index_through` runs inline inside `publish`, so by the time
        // a confirmable publish returns, its entry is already index_durable
        // even though nothing has paged it out yet.
        let (mut actor, _dir) = test_actor().await;
        let client = ClientRef::new();
        let id = MessageId::from_bytes([7u8; 16]);
        actor
            .publish(client, id, bytes::Bytes::from_static(b"x"), true, true)
            .await
            .unwrap();

        assert!(actor.backlog.back().unwrap().index_durable);
        let read_back = actor.qindex.read_from(0, 10).await.unwrap();
        assert_eq!(read_back.len(), 1);
        assert_eq!(read_back[0].id, id);
    }
}
