//! Queue entries: typed params, dedup keys and the enqueue service.

pub mod keys;
pub mod params;
pub mod service;

pub use keys::{RETRY_SUFFIX, entry_key, retry_key};
pub use params::{ImportParams, JobParams, SceneImageParams, TextParams, TranscribeParams};
pub use service::{
    BatchEnqueueOutcome, BatchRequest, EnqueueOutcome, NewEntry, QueueService, prepare_entries,
};
