/// Any record which, when encoded, exceeds this size is rejected outright.
/// Grounded on `vector_buffers::disk_v2::common::DEFAULT_MAX_RECORD_SIZE`.
pub const DEFAULT_MAX_RECORD_SIZE: usize = 8 * 1024 * 1024;
