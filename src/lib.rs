//! A persistent, segmented, reference-counted message store and its paged
//! queue backing.
//!
//! The store (see [`store`]) owns a sequence of append-only segment files
//! (see [`segment`]) and a pluggable index (see [`index`]) mapping message
//! ids to their on-disk location and reference count. An asynchronous
//! [`compactor`] combines or deletes segment files as garbage accumulates.
//! [`queue`] implements the per-queue paged log that sits on top of the
//! store, staging messages between RAM-resident and disk-resident
//! positions according to a measured memory budget.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::type_complexity)]
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate tracing;

pub mod acknowledgements;
pub mod compactor;
pub mod config;
pub mod error;
pub mod ids;
pub mod index;
pub mod queue;
pub mod recovery;
pub mod segment;
pub mod store;

pub use error::StoreError;
pub use ids::{ClientRef, FileId, MessageId, SeqId};
