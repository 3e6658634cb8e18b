//! The queue task's mailbox.
//!
//! Mirrors [`crate::store::messages`]'s two-lane design: per-client
//! publish/fetch/ack traffic rides the normal lane so a single client's
//! operations stay in program order, while the external memory monitor's
//! `set_target_ram_count` and the idle/hibernate tick ride the priority
//! lane since neither has any per-client ordering requirement.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::StoreError;
use crate::ids::{ClientRef, MessageId};
use crate::queue::entry::QueueEntryMeta;
use crate::queue::pending_ack::DeliveryTag;

pub type TxnId = u64;

pub struct Delivery {
    pub tag: DeliveryTag,
    pub meta: QueueEntryMeta,
    pub payload: Bytes,
}

pub struct QueueStats {
    pub len: u64,
    pub ram_msg_count: u64,
    pub ram_ack_count: u64,
    pub persistent_count: u64,
    pub delta_count: u64,
    /// Last value computed by the rate-tick (spec.md §4.E "Rate sampling"):
    /// `(ram_msg_count_prev + ram_msg_count + ram_ack_count + ram_ack_count_prev)
    /// / (4 × Σ rates)`. `f64::INFINITY` if no traffic has been observed yet.
    pub ram_duration_secs: f64,
}

pub enum NormalMsg {
    Publish {
        client: ClientRef,
        id: MessageId,
        payload: Bytes,
        persistent: bool,
        needs_confirming: bool,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Fetch {
        count: usize,
        reply: oneshot::Sender<Result<Vec<Delivery>, StoreError>>,
    },
    Ack {
        tags: Vec<DeliveryTag>,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Requeue {
        tags: Vec<DeliveryTag>,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    DropWhile {
        predicate: Box<dyn FnMut(&QueueEntryMeta) -> bool + Send>,
        reply: oneshot::Sender<Vec<QueueEntryMeta>>,
    },
    TxnPublish {
        client: ClientRef,
        txn: TxnId,
        id: MessageId,
        payload: Bytes,
        persistent: bool,
    },
    TxnAck {
        client: ClientRef,
        txn: TxnId,
        tags: Vec<DeliveryTag>,
    },
    TxnCommit {
        client: ClientRef,
        txn: TxnId,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    TxnRollback {
        client: ClientRef,
        txn: TxnId,
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<QueueStats>,
    },
}

pub enum PriorityMsg {
    SetTargetRamCount(u64),
    Tick,
    Shutdown { reply: oneshot::Sender<()> },
}

pub const HIBERNATE_CHECK: Duration = Duration::from_millis(250);
