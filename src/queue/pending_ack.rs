//! Delivery-tag to pending-ack entry table.
//!
//! Grounded on the "pending_ack" stage of spec.md §4.E's state-machine
//! summary: a delivered-but-not-yet-acked entry is moved out of the
//! fetchable backlog and keyed by an opaque, per-queue delivery tag handed
//! to the consumer. Memory pressure can still evict a pending entry's
//! cached payload (spec.md §4.E step 4) the same way it does for backlog
//! entries; the entry's minimal `(tag, meta)` shell stays resident until it
//! is acked or requeued, since requeue needs the tag→meta mapping to put the
//! position back at the head of the backlog.

use std::collections::HashMap;

use crate::queue::entry::QueueEntry;

pub type DeliveryTag = u64;

#[derive(Default)]
pub struct PendingAckTable {
    next_tag: DeliveryTag,
    entries: HashMap<DeliveryTag, QueueEntry>,
}

impl PendingAckTable {
    pub fn new() -> Self {
        Self {
            next_tag: 1,
            entries: HashMap::new(),
        }
    }

    /// Records `entry` as delivered, returning the tag the consumer must
    /// present to ack or requeue it.
    pub fn insert(&mut self, entry: QueueEntry) -> DeliveryTag {
        let tag = self.next_tag;
        self.next_tag += 1;
        self.entries.insert(tag, entry);
        tag
    }

    /// Removes and returns the entry for `tag`, if it is still outstanding.
    pub fn take(&mut self, tag: DeliveryTag) -> Option<QueueEntry> {
        self.entries.remove(&tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn persistent_count(&self) -> u64 {
        self.entries.values().filter(|e| e.meta.persistent).count() as u64
    }

    /// Entries still holding their full in-RAM status: `ram_ack_count` in
    /// spec.md §3/§8. An evicted entry stays in `entries` (its tag must
    /// still resolve for ack/requeue) but no longer counts toward RAM
    /// pressure.
    pub fn ram_resident_count(&self) -> u64 {
        self.entries.values().filter(|e| e.is_cached()).count() as u64
    }

    /// Evicts cached payload from up to `quota` outstanding deliveries,
    /// lowest tag (oldest delivery) first, modeling spec.md §4.E step 4's
    /// ack-side memory reduction. Safe at any time: every delivery's
    /// payload is already durable in the message store under its id, so
    /// dropping the cache loses nothing a later ack or requeue needs.
    pub fn evict(&mut self, quota: usize) -> usize {
        if quota == 0 {
            return 0;
        }
        let mut tags: Vec<DeliveryTag> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_cached())
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        let mut evicted = 0;
        for tag in tags.into_iter().take(quota) {
            if let Some(entry) = self.entries.get_mut(&tag) {
                entry.cached_payload = None;
                evicted += 1;
            }
        }
        evicted
    }

    /// Drains every outstanding delivery, oldest tag first. Used when a
    /// queue is deleted and its unacked messages must be requeued or
    /// discarded in full.
    pub fn drain_all(&mut self) -> Vec<(DeliveryTag, QueueEntry)> {
        let mut tags: Vec<DeliveryTag> = self.entries.keys().copied().collect();
        tags.sort_unstable();
        tags.into_iter()
            .map(|tag| (tag, self.entries.remove(&tag).expect("tag came from entries")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ids::MessageId;
    use crate::queue::entry::QueueEntryMeta;

    fn entry(seq: u64) -> QueueEntry {
        QueueEntry {
            meta: QueueEntryMeta {
                seq,
                id: MessageId::from_bytes([seq as u8; 16]),
                persistent: false,
            },
            cached_payload: None,
            index_durable: false,
        }
    }

    #[test]
    fn evict_drops_cache_oldest_tag_first_but_keeps_the_entry() {
        let mut table = PendingAckTable::new();
        let mut cached = |seq: u64| {
            let mut e = entry(seq);
            e.cached_payload = Some(bytes::Bytes::from_static(b"x"));
            e
        };
        let t1 = table.insert(cached(1));
        let t2 = table.insert(cached(2));
        assert_eq!(table.ram_resident_count(), 2);

        let evicted = table.evict(1);
        assert_eq!(evicted, 1);
        assert_eq!(table.ram_resident_count(), 1);
        assert_eq!(table.len(), 2);
        assert!(!table.entries.get(&t1).unwrap().is_cached());
        assert!(table.entries.get(&t2).unwrap().is_cached());
    }

    #[test]
    fn tags_are_unique_and_monotone() {
        let mut table = PendingAckTable::new();
        let t1 = table.insert(entry(1));
        let t2 = table.insert(entry(2));
        assert!(t2 > t1);
        assert_eq!(table.len(), 2);

        let taken = table.take(t1).unwrap();
        assert_eq!(taken.meta.seq, 1);
        assert_eq!(table.len(), 1);
        assert!(table.take(t1).is_none());
    }

    #[test]
    fn drain_all_is_tag_ordered() {
        let mut table = PendingAckTable::new();
        let tags: Vec<_> = (1..=3).map(|s| table.insert(entry(s))).collect();
        let drained = table.drain_all();
        assert_eq!(drained.iter().map(|(t, _)| *t).collect::<Vec<_>>(), tags);
        assert!(table.is_empty());
    }
}
