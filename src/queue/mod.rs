//! The queue backing (component E): a per-queue paged log sitting on top
//! of the message store, staging messages between RAM-resident and
//! disk-resident positions per spec.md §4.E.
//!
//! [`QueueConfig`] carries the same tunables as [`crate::config::StoreConfig`]
//! that drive the paging pipeline (`io_batch_size`,
//! `ram_duration_update_interval`, `hibernate_after`, `desired_hibernate`);
//! [`QueueHandle`] is the cloneable client surface onto a running
//! [`actor::QueueActor`], mirroring [`crate::store::MessageStoreHandle`]'s
//! shape.

mod actor;
mod delta;
mod entry;
mod messages;
mod pending_ack;
pub mod qindex;
mod rates;

pub use entry::QueueEntryMeta;
pub use messages::{Delivery, QueueStats, TxnId};
pub use pending_ack::DeliveryTag;

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::acknowledgements::Confirmer;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::ids::{ClientRef, MessageId, SeqId};
use crate::queue::messages::{NormalMsg, PriorityMsg};
use crate::store::MessageStoreHandle;

/// Tunables for a [`QueueActor`](actor::QueueActor) instance.
///
/// Mirrors [`StoreConfig`]'s builder style; [`QueueConfig::from`] pulls the
/// shared tunables straight off a [`StoreConfig`] so a caller wiring up a
/// store and its queues does not have to restate them.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub(crate) io_batch_size: usize,
    pub(crate) ram_duration_update_interval: Duration,
    pub(crate) hibernate_after: Duration,
    pub(crate) desired_hibernate: Duration,
}

impl QueueConfig {
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }

    pub fn io_batch_size(&self) -> usize {
        self.io_batch_size
    }

    pub fn ram_duration_update_interval(&self) -> Duration {
        self.ram_duration_update_interval
    }

    pub fn hibernate_after(&self) -> Duration {
        self.hibernate_after
    }

    pub fn desired_hibernate(&self) -> Duration {
        self.desired_hibernate
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig::builder().build()
    }
}

impl From<&StoreConfig> for QueueConfig {
    fn from(store: &StoreConfig) -> Self {
        Self {
            io_batch_size: store.io_batch_size(),
            ram_duration_update_interval: store.ram_duration_update_interval(),
            hibernate_after: store.hibernate_after(),
            desired_hibernate: store.desired_hibernate(),
        }
    }
}

/// Builder for [`QueueConfig`].
#[derive(Default)]
pub struct QueueConfigBuilder {
    io_batch_size: Option<usize>,
    ram_duration_update_interval: Option<Duration>,
    hibernate_after: Option<Duration>,
    desired_hibernate: Option<Duration>,
}

impl QueueConfigBuilder {
    /// Positions converted per memory-reduction batch. Default 64.
    pub fn io_batch_size(mut self, amount: usize) -> Self {
        self.io_batch_size = Some(amount);
        self
    }

    /// How often the rate trackers roll and `target_ram_count` is
    /// reconsidered. Default 5000ms.
    pub fn ram_duration_update_interval(mut self, interval: Duration) -> Self {
        self.ram_duration_update_interval = Some(interval);
        self
    }

    /// Idle duration after which the queue task is eligible to hibernate.
    /// Default 1000ms.
    pub fn hibernate_after(mut self, interval: Duration) -> Self {
        self.hibernate_after = Some(interval);
        self
    }

    /// Desired duration of a hibernation sleep. Default 10000ms.
    pub fn desired_hibernate(mut self, interval: Duration) -> Self {
        self.desired_hibernate = Some(interval);
        self
    }

    pub fn build(self) -> QueueConfig {
        QueueConfig {
            io_batch_size: self.io_batch_size.unwrap_or(crate::config::DEFAULT_IO_BATCH_SIZE),
            ram_duration_update_interval: self
                .ram_duration_update_interval
                .unwrap_or(Duration::from_millis(5000)),
            hibernate_after: self.hibernate_after.unwrap_or(Duration::from_millis(1000)),
            desired_hibernate: self.desired_hibernate.unwrap_or(Duration::from_millis(10_000)),
        }
    }
}

/// Opens a fresh queue backing atop `store`, spawning its task onto the
/// current tokio runtime.
///
/// `transient_threshold` is the `next_seq_id` this queue observed at its
/// last startup (spec.md §3); a fresh queue with no prior state passes `0`.
/// Recovering a queue's own startup threshold from its persisted queue
/// index is the responsibility of that collaborator (spec.md §6), out of
/// scope for this crate.
///
/// `index_path` is the file this queue's durable position index
/// ([`qindex::QueueIndexFile`]) lives at — one per queue, named by the
/// caller the same way each store instance names its own `data_dir`
/// (e.g. `data_dir.join(format!("{queue_name}.qidx"))`).
pub fn open(
    config: QueueConfig,
    store: MessageStoreHandle,
    confirmer: Confirmer,
    transient_threshold: SeqId,
    index_path: PathBuf,
) -> QueueHandle {
    let (normal_tx, priority_tx) = actor::spawn(config, store, confirmer, transient_threshold, index_path);
    QueueHandle { normal_tx, priority_tx }
}

/// A cloneable handle onto a running queue backing.
#[derive(Clone)]
pub struct QueueHandle {
    normal_tx: mpsc::UnboundedSender<NormalMsg>,
    priority_tx: mpsc::UnboundedSender<PriorityMsg>,
}

impl QueueHandle {
    fn send_normal(&self, msg: NormalMsg) -> Result<(), StoreError> {
        self.normal_tx.send(msg).map_err(|_| StoreError::StoreGone)
    }

    fn send_priority(&self, msg: PriorityMsg) -> Result<(), StoreError> {
        self.priority_tx.send(msg).map_err(|_| StoreError::StoreGone)
    }

    /// Publishes `payload` under `id`. Writes through to the message store
    /// before the position becomes fetchable (spec.md §4.E "Publish").
    pub async fn publish(
        &self,
        client: ClientRef,
        id: MessageId,
        payload: Bytes,
        persistent: bool,
        needs_confirming: bool,
    ) -> Result<(), StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_normal(NormalMsg::Publish {
            client,
            id,
            payload,
            persistent,
            needs_confirming,
            reply: reply_tx,
        })?;
        reply_rx.await.map_err(|_| StoreError::StoreGone)?
    }

    /// Fetches up to `count` deliveries from the head of the backlog.
    pub async fn fetch(&self, count: usize) -> Result<Vec<Delivery>, StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_normal(NormalMsg::Fetch { count, reply: reply_tx })?;
        reply_rx.await.map_err(|_| StoreError::StoreGone)?
    }

    /// Acknowledges the listed delivery tags, dropping this queue's
    /// reference on each underlying message in the store.
    pub async fn ack(&self, tags: Vec<DeliveryTag>) -> Result<(), StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_normal(NormalMsg::Ack { tags, reply: reply_tx })?;
        reply_rx.await.map_err(|_| StoreError::StoreGone)?
    }

    /// Requeues the listed delivery tags at the head of the backlog
    /// (spec.md §4.E "Requeue").
    pub async fn requeue(&self, tags: Vec<DeliveryTag>) -> Result<(), StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_normal(NormalMsg::Requeue { tags, reply: reply_tx })?;
        reply_rx.await.map_err(|_| StoreError::StoreGone)?
    }

    /// Repeatedly fetches-without-acking while `predicate` holds on each
    /// entry's metadata (spec.md §4.E "Drop-while", used for TTL expiry),
    /// returning the metadata of every entry it dropped.
    pub async fn dropwhile<F>(&self, predicate: F) -> Result<Vec<QueueEntryMeta>, StoreError>
    where
        F: FnMut(&QueueEntryMeta) -> bool + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_normal(NormalMsg::DropWhile {
            predicate: Box::new(predicate),
            reply: reply_tx,
        })?;
        reply_rx.await.map_err(|_| StoreError::StoreGone)
    }

    /// Stages a publish under transaction `txn`, applied on
    /// [`Self::txn_commit`].
    pub fn txn_publish(
        &self,
        client: ClientRef,
        txn: TxnId,
        id: MessageId,
        payload: Bytes,
        persistent: bool,
    ) -> Result<(), StoreError> {
        self.send_normal(NormalMsg::TxnPublish {
            client,
            txn,
            id,
            payload,
            persistent,
        })
    }

    /// Stages acks under transaction `txn`, applied on [`Self::txn_commit`].
    pub fn txn_ack(&self, client: ClientRef, txn: TxnId, tags: Vec<DeliveryTag>) -> Result<(), StoreError> {
        self.send_normal(NormalMsg::TxnAck { client, txn, tags })
    }

    /// Commits transaction `txn`: fences all persistent publishes through
    /// the store's durability guarantee, then applies the staged publishes
    /// and acks in arrival order (spec.md §4.E "Transactions").
    pub async fn txn_commit(&self, client: ClientRef, txn: TxnId) -> Result<(), StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_normal(NormalMsg::TxnCommit { client, txn, reply: reply_tx })?;
        reply_rx.await.map_err(|_| StoreError::StoreGone)?
    }

    /// Rolls back transaction `txn`, removing its staged persistent
    /// publishes from the store without ever making them visible.
    pub async fn txn_rollback(&self, client: ClientRef, txn: TxnId) -> Result<(), StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_normal(NormalMsg::TxnRollback { client, txn, reply: reply_tx })?;
        reply_rx.await.map_err(|_| StoreError::StoreGone)
    }

    /// Snapshots the queue's current statistics, including the last
    /// measured RAM-duration sample (spec.md §4.E "Rate sampling").
    pub async fn stats(&self) -> Result<QueueStats, StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_normal(NormalMsg::Stats { reply: reply_tx })?;
        reply_rx.await.map_err(|_| StoreError::StoreGone)
    }

    /// Sets `target_ram_count`, the number of RAM-resident positions this
    /// queue should converge to. A lowered target triggers an immediate
    /// memory-reduction round (spec.md §4.E).
    ///
    /// The caller (an external memory monitor, out of scope for this
    /// crate per spec.md §1) is expected to derive `target` from
    /// [`QueueStats::ram_duration_secs`] and its own duration budget.
    pub fn set_target_ram_count(&self, target: u64) -> Result<(), StoreError> {
        self.send_priority(PriorityMsg::SetTargetRamCount(target))
    }

    /// Stops the queue task.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_priority(PriorityMsg::Shutdown { reply: reply_tx })?;
        reply_rx.await.map_err(|_| StoreError::StoreGone)
    }
}
