//! Per-message metadata a queue keeps resident while a position is still in
//! RAM at all (α/β/γ tiers). A position paged all the way to δ drops this
//! too, its metadata recoverable from [`crate::queue::qindex::QueueIndexFile`]
//! on refill (see [`crate::queue::actor`]).

use bytes::Bytes;

use crate::ids::{MessageId, SeqId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueEntryMeta {
    pub seq: SeqId,
    pub id: MessageId,
    pub persistent: bool,
}

/// One position in the backlog.
///
/// `cached_payload` is the first thing a memory-reduction round pages out,
/// modeling the α→β transition (spec.md §4.E): the payload is already
/// durable in the message store and can always be re-fetched by id.
/// `index_durable` tracks the β→γ transition: once true, this entry's
/// position has been fsynced to the queue's [`QueueIndexFile`](crate::queue::qindex::QueueIndexFile)
/// and the entry can be dropped from RAM entirely (γ→δ) without losing it.
#[derive(Clone, Debug)]
pub struct QueueEntry {
    pub meta: QueueEntryMeta,
    pub cached_payload: Option<Bytes>,
    pub index_durable: bool,
}

impl QueueEntry {
    pub fn is_cached(&self) -> bool {
        self.cached_payload.is_some()
    }
}
