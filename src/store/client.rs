//! Client registration bookkeeping (spec.md §3 "Client registration").

use crate::acknowledgements::DurableAction;
use crate::ids::MessageId;

/// Callbacks the store invokes for a registered client.
///
/// The process-dictionary client records of the original design map here to
/// an owned `HashMap<ClientRef, ClientRecord>` inside the store task (see
/// spec.md §9); clients themselves hold only a [`crate::ids::ClientRef`]
/// token.
pub struct ClientRecord {
    pub on_msg_durable: Box<dyn Fn(Vec<MessageId>, DurableAction) + Send + Sync>,
    pub on_close_fds: Box<dyn Fn() + Send + Sync>,
}

impl ClientRecord {
    pub fn new<D, C>(on_msg_durable: D, on_close_fds: C) -> Self
    where
        D: Fn(Vec<MessageId>, DurableAction) + Send + Sync + 'static,
        C: Fn() + Send + Sync + 'static,
    {
        Self {
            on_msg_durable: Box::new(on_msg_durable),
            on_close_fds: Box::new(on_close_fds),
        }
    }
}
