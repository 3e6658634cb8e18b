//! Opaque identifiers used throughout the store.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

/// An opaque, fixed-width message identifier supplied by the producer.
///
/// The store never interprets the bytes of a message id; it only hashes,
/// compares, and persists it.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    pub const LEN: usize = 16;

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Numbered segment file, monotonically increasing.
pub type FileId = u32;

/// Per-queue monotonic sequence id assigned at publish time.
pub type SeqId = u64;

/// A reference token handed out to a registered client of the store.
///
/// Clients never see the internal state the store keeps about them; they
/// only hold this token and use it in subsequent calls.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct ClientRef(u64);

static NEXT_CLIENT_REF: AtomicU64 = AtomicU64::new(1);

impl ClientRef {
    /// Allocates a fresh, process-unique client reference.
    pub fn new() -> Self {
        Self(NEXT_CLIENT_REF.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl Default for ClientRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}
