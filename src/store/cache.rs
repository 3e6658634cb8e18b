//! The current-file cache and dedup cache (spec.md §3 "Caches").

use std::collections::HashMap;

use bytes::Bytes;

use crate::ids::MessageId;

/// `{id -> (payload, pending_write_count)}`.
///
/// A record exists from the moment a client writes until the store has
/// persisted it; multiple queued writes increment the counter. Enables
/// zero-latency reads of in-flight writes.
#[derive(Default)]
pub struct CurrentFileCache {
    entries: HashMap<MessageId, (Bytes, u32)>,
}

impl CurrentFileCache {
    pub fn record_write(&mut self, id: MessageId, payload: Bytes) {
        let slot = self.entries.entry(id).or_insert((payload, 0));
        slot.1 += 1;
    }

    pub fn get(&self, id: &MessageId) -> Option<Bytes> {
        self.entries.get(id).map(|(payload, _)| payload.clone())
    }

    /// Marks one queued write for `id` as persisted; drops the entry once
    /// its pending count reaches zero.
    pub fn mark_persisted(&mut self, id: &MessageId) {
        if let Some(slot) = self.entries.get_mut(id) {
            if slot.1 > 0 {
                slot.1 -= 1;
            }
            if slot.1 == 0 {
                self.entries.remove(id);
            }
        }
    }

    /// Drops every entry with no pending writes. Called when the current
    /// file rolls, per spec.md §4.C "Rolling the current file".
    pub fn prune_flushed(&mut self) {
        self.entries.retain(|_, (_, pending)| *pending > 0);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `{id -> (payload, read_refcount)}`.
///
/// Only populated when a read observes `ref_count > 1`, to share one
/// payload among many concurrent readers.
#[derive(Default)]
pub struct DedupCache {
    entries: HashMap<MessageId, (Bytes, u32)>,
}

impl DedupCache {
    pub fn populate(&mut self, id: MessageId, payload: Bytes) {
        self.entries
            .entry(id)
            .and_modify(|(_, count)| *count += 1)
            .or_insert((payload, 1));
    }

    pub fn get(&self, id: &MessageId) -> Option<Bytes> {
        self.entries.get(id).map(|(payload, _)| payload.clone())
    }

    /// Decrements `id`'s read refcount, dropping the cached payload once it
    /// reaches zero. Driven by [`crate::store::MessageStoreHandle::release`].
    pub fn release(&mut self, id: &MessageId) {
        if let Some(slot) = self.entries.get_mut(id) {
            if slot.1 > 0 {
                slot.1 -= 1;
            }
            if slot.1 == 0 {
                self.entries.remove(id);
            }
        }
    }
}
