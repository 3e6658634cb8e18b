//! The message store (component C): a single-writer actor fronted by a
//! cloneable [`MessageStoreHandle`], backed by the segment file manager
//! ([`crate::segment`]) and a pluggable message index ([`crate::index`]).

pub(crate) mod actor;
mod cache;
pub mod client;
mod handle;
pub(crate) mod messages;
mod summary;

pub use client::ClientRecord;
pub use handle::MessageStoreHandle;
pub use summary::FileSummaryTable;

use std::sync::{atomic::AtomicU32, Arc};

use tokio::sync::mpsc;

use crate::acknowledgements::Confirmer;
use crate::compactor;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::ids::ClientRef;
use crate::recovery;
use crate::segment::HandleCache;

/// Opens (recovering if necessary) a message store rooted at
/// `config.data_dir()`, spawning its store and compactor tasks onto the
/// current tokio runtime.
///
/// `confirmer` is invoked whenever a batch of writes becomes durable; pass
/// [`Confirmer::noop`] if the caller does not need durability callbacks.
pub async fn open(config: StoreConfig, confirmer: Confirmer) -> Result<MessageStoreHandle, StoreError> {
    let recovered = recovery::recover(&config).await?;

    let (normal_tx, normal_rx) = mpsc::unbounded_channel();
    let (priority_tx, priority_rx) = mpsc::unbounded_channel();
    let (compactor_tx, compactor_rx) = mpsc::unbounded_channel();

    let handle_cache = Arc::new(HandleCache::new(config.data_dir().clone()));
    let current_file_no = Arc::new(AtomicU32::new(recovered.current_file_no));
    let summaries = recovered.summaries.clone();
    let index = Arc::clone(&recovered.index);

    let compactor_priority_tx = priority_tx.clone();
    tokio::spawn(compactor::run(
        config.data_dir().clone(),
        crate::segment::DEFAULT_MAX_RECORD_SIZE,
        Arc::clone(&index),
        summaries.clone(),
        compactor_rx,
        compactor_priority_tx,
    ));

    let store_actor = actor::StoreActor::new(
        config,
        recovered,
        confirmer,
        compactor_tx,
        Arc::clone(&handle_cache),
        Arc::clone(&current_file_no),
    )
    .await?;

    tokio::spawn(store_actor.run(normal_rx, priority_rx));

    Ok(MessageStoreHandle::new(
        normal_tx,
        priority_tx,
        summaries,
        handle_cache,
        index,
        current_file_no,
    ))
}

/// Flushes `handle` and persists the clean-shutdown fast-start markers.
///
/// Callers that track their own registered [`ClientRef`]s should pass them
/// so the next startup can validate its client set against
/// [`crate::recovery::CleanShutdownTerms`]; an empty list is fine if the
/// caller does not track clients itself.
pub async fn close(
    handle: &MessageStoreHandle,
    config: &StoreConfig,
    client_refs: Vec<ClientRef>,
) -> Result<(), StoreError> {
    handle.shutdown().await?;
    handle.terminate_index().await?;
    recovery::persist_clean_shutdown(config, &handle.summaries(), client_refs).await
}
