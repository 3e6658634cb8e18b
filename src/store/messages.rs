//! The store task's mailbox.
//!
//! Grounded on spec.md §9's "gen_server2 priority lanes" design note: a
//! two-queue mailbox, high-priority drained ahead of normal. Per-client
//! operations (write/read/remove/etc., including `client_dying`) all ride
//! the *normal* lane so that a single client's messages are necessarily
//! processed in the order that client sent them — the "does not overtake
//! earlier ops it depends on" guarantee of spec.md §5 falls out for free
//! rather than needing an explicit per-client sequence number. The
//! *priority* lane is reserved for signals with no per-client ordering
//! requirement: handle-cache aging, compactor completions, and shutdown.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::StoreError;
use crate::ids::{ClientRef, FileId, MessageId};
use crate::store::client::ClientRecord;

pub enum NormalMsg {
    Write {
        client: ClientRef,
        id: MessageId,
        payload: Bytes,
    },
    Read {
        client: ClientRef,
        id: MessageId,
        reply: oneshot::Sender<Result<Option<Bytes>, StoreError>>,
    },
    Contains {
        id: MessageId,
        reply: oneshot::Sender<bool>,
    },
    Remove {
        client: ClientRef,
        ids: Vec<MessageId>,
    },
    Release {
        ids: Vec<MessageId>,
    },
    Sync {
        ids: Vec<MessageId>,
        reply: oneshot::Sender<()>,
    },
    ClientInit {
        client: ClientRef,
        record: ClientRecord,
    },
    ClientTerminate {
        client: ClientRef,
        reply: oneshot::Sender<()>,
    },
    ClientDeleteAndTerminate {
        client: ClientRef,
    },
}

pub enum PriorityMsg {
    SetMaximumSinceUse(Duration),
    CombineDone {
        src: FileId,
        dst: FileId,
        new_dst_size: u64,
    },
    DeleteDone {
        file: FileId,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}
