//! Configuration for the message store and queue backing.
//!
//! Mirrors the builder style of `vector_buffers::disk_v2::common::DiskBufferConfig`:
//! a `from_path` entry point returning a builder, with documented defaults
//! for every tunable enumerated in the store's external-interfaces design.

use std::{path::PathBuf, time::Duration};

/// Selects the [`crate::index::MessageIndex`] backend a store instance uses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexModule {
    /// The reference in-memory hash table backend, snapshotted to disk.
    InMemory,
}

impl Default for IndexModule {
    fn default() -> Self {
        IndexModule::InMemory
    }
}

/// Tunables for a [`crate::store::MessageStore`] instance.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Directory this store instance is rooted at
    /// (`<base>/<instance_name>/` in the external layout).
    pub(crate) data_dir: PathBuf,
    /// Maximum bytes per `.rdq` segment file. Default 16 MiB.
    pub(crate) file_size_limit: u64,
    /// Compaction trigger threshold. Fixed at 0.5 by design, but exposed so
    /// tests can exercise the trigger at smaller scales.
    pub(crate) garbage_fraction: f64,
    /// Positions converted per memory-reduction batch. Default 64.
    pub(crate) io_batch_size: usize,
    /// Flush interval for segment files. Default 5ms.
    pub(crate) sync_interval: Duration,
    /// How often the external memory monitor recomputes `target_ram_count`.
    /// Default 5000ms.
    pub(crate) ram_duration_update_interval: Duration,
    /// Idle time before a queue task is eligible to hibernate. Default 1000ms.
    pub(crate) hibernate_after: Duration,
    /// Desired duration of a hibernation sleep. Default 10000ms.
    pub(crate) desired_hibernate: Duration,
    /// Write buffer size for the segment handle cache. Default 1 MiB.
    pub(crate) handle_cache_buffer_size: usize,
    /// Which index backend to use.
    pub(crate) index_module: IndexModule,
}

pub const DEFAULT_FILE_SIZE_LIMIT: u64 = 16 * 1024 * 1024;
pub const DEFAULT_GARBAGE_FRACTION: f64 = 0.5;
pub const DEFAULT_IO_BATCH_SIZE: usize = 64;
pub const DEFAULT_HANDLE_CACHE_BUFFER_SIZE: usize = 1024 * 1024;

impl StoreConfig {
    /// Starts building a [`StoreConfig`] rooted at `data_dir`.
    pub fn from_path<P: Into<PathBuf>>(data_dir: P) -> StoreConfigBuilder {
        StoreConfigBuilder {
            data_dir: data_dir.into(),
            file_size_limit: None,
            garbage_fraction: None,
            io_batch_size: None,
            sync_interval: None,
            ram_duration_update_interval: None,
            hibernate_after: None,
            desired_hibernate: None,
            handle_cache_buffer_size: None,
            index_module: None,
        }
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    pub fn file_size_limit(&self) -> u64 {
        self.file_size_limit
    }

    pub fn garbage_fraction(&self) -> f64 {
        self.garbage_fraction
    }

    pub fn io_batch_size(&self) -> usize {
        self.io_batch_size
    }

    pub fn sync_interval(&self) -> Duration {
        self.sync_interval
    }

    pub fn ram_duration_update_interval(&self) -> Duration {
        self.ram_duration_update_interval
    }

    pub fn hibernate_after(&self) -> Duration {
        self.hibernate_after
    }

    pub fn desired_hibernate(&self) -> Duration {
        self.desired_hibernate
    }

    pub fn handle_cache_buffer_size(&self) -> usize {
        self.handle_cache_buffer_size
    }

    pub fn index_module(&self) -> &IndexModule {
        &self.index_module
    }
}

/// Builder for [`StoreConfig`].
pub struct StoreConfigBuilder {
    data_dir: PathBuf,
    file_size_limit: Option<u64>,
    garbage_fraction: Option<f64>,
    io_batch_size: Option<usize>,
    sync_interval: Option<Duration>,
    ram_duration_update_interval: Option<Duration>,
    hibernate_after: Option<Duration>,
    desired_hibernate: Option<Duration>,
    handle_cache_buffer_size: Option<usize>,
    index_module: Option<IndexModule>,
}

impl StoreConfigBuilder {
    /// Sets the maximum size, in bytes, of each segment file. Default 16 MiB.
    pub fn file_size_limit(mut self, amount: u64) -> Self {
        self.file_size_limit = Some(amount);
        self
    }

    /// Overrides the garbage-fraction compaction trigger. Fixed at `0.5` in
    /// production; only meant to be overridden by tests exercising the
    /// compaction trigger at small scale.
    pub fn garbage_fraction(mut self, fraction: f64) -> Self {
        self.garbage_fraction = Some(fraction);
        self
    }

    /// Sets the number of positions converted per memory-reduction batch.
    /// Default 64.
    pub fn io_batch_size(mut self, amount: usize) -> Self {
        self.io_batch_size = Some(amount);
        self
    }

    /// Sets the flush interval for segment files. Default 5ms.
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Sets how often `update_rate` is invoked. Default 5000ms.
    pub fn ram_duration_update_interval(mut self, interval: Duration) -> Self {
        self.ram_duration_update_interval = Some(interval);
        self
    }

    /// Sets the idle duration after which a queue task may hibernate.
    pub fn hibernate_after(mut self, interval: Duration) -> Self {
        self.hibernate_after = Some(interval);
        self
    }

    /// Sets the desired sleep duration of a hibernation cycle.
    pub fn desired_hibernate(mut self, interval: Duration) -> Self {
        self.desired_hibernate = Some(interval);
        self
    }

    /// Sets the write buffer size used by the segment handle cache.
    pub fn handle_cache_buffer_size(mut self, amount: usize) -> Self {
        self.handle_cache_buffer_size = Some(amount);
        self
    }

    /// Selects the index backend.
    pub fn index_module(mut self, module: IndexModule) -> Self {
        self.index_module = Some(module);
        self
    }

    pub fn build(self) -> StoreConfig {
        StoreConfig {
            data_dir: self.data_dir,
            file_size_limit: self.file_size_limit.unwrap_or(DEFAULT_FILE_SIZE_LIMIT),
            garbage_fraction: self.garbage_fraction.unwrap_or(DEFAULT_GARBAGE_FRACTION),
            io_batch_size: self.io_batch_size.unwrap_or(DEFAULT_IO_BATCH_SIZE),
            sync_interval: self.sync_interval.unwrap_or(Duration::from_millis(5)),
            ram_duration_update_interval: self
                .ram_duration_update_interval
                .unwrap_or(Duration::from_millis(5000)),
            hibernate_after: self.hibernate_after.unwrap_or(Duration::from_millis(1000)),
            desired_hibernate: self
                .desired_hibernate
                .unwrap_or(Duration::from_millis(10_000)),
            handle_cache_buffer_size: self
                .handle_cache_buffer_size
                .unwrap_or(DEFAULT_HANDLE_CACHE_BUFFER_SIZE),
            index_module: self.index_module.unwrap_or_default(),
        }
    }
}
