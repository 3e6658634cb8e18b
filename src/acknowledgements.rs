//! Durability confirmation handles.
//!
//! Adapted from `vector_buffers::acknowledgements::Acker`: a type-erased
//! callback handle that downstream code can invoke without needing to know
//! whether durability confirmation is wired up to anything at all.

use std::{fmt, sync::Arc};

use crate::ids::MessageId;

/// Which durability event a confirmation callback describes.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DurableAction {
    /// The listed ids have been durably written (fsynced to their segment).
    Written,
    /// The listed ids have been durably removed (their remove is fsynced,
    /// or they never reached disk before being removed).
    Removed,
}

/// A handle for confirming the durability of a batch of message ids.
///
/// Every id inserted into a publisher's `unconfirmed` set must leave it
/// exactly once, fired only after the relevant durability fence (store
/// fsync, queue-index fsync, or both) has passed. `Confirmer` is the
/// callback surface that fence fires into.
#[derive(Clone)]
pub struct Confirmer {
    inner: Option<Arc<dyn Fn(Vec<MessageId>, DurableAction) + Send + Sync>>,
}

impl Confirmer {
    /// A confirmer that drops every confirmation on the floor.
    pub fn noop() -> Self {
        Self { inner: None }
    }

    /// A confirmer that invokes `f` for every confirmation batch.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vec<MessageId>, DurableAction) + Send + Sync + 'static,
    {
        Self {
            inner: Some(Arc::new(f)),
        }
    }

    /// Fires the confirmation callback, if one is wired up.
    pub fn confirm(&self, ids: Vec<MessageId>, action: DurableAction) {
        if ids.is_empty() {
            return;
        }
        if let Some(inner) = self.inner.as_ref() {
            (inner)(ids, action);
        }
    }
}

impl fmt::Debug for Confirmer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Confirmer")
            .field("wired", &self.inner.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn fires_only_when_wired() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let confirmer = Confirmer::new(move |ids, action| {
            seen2.lock().unwrap().push((ids, action));
        });

        confirmer.confirm(vec![MessageId([1; 16])], DurableAction::Written);
        assert_eq!(seen.lock().unwrap().len(), 1);

        // Empty batches never fire, even on a wired confirmer.
        confirmer.confirm(vec![], DurableAction::Written);
        assert_eq!(seen.lock().unwrap().len(), 1);

        let noop = Confirmer::noop();
        noop.confirm(vec![MessageId([2; 16])], DurableAction::Removed);
    }
}
