//! Image normalization, dedup, transcode, and upload pipeline.
//!
//! Image references collected during a crawl flow through
//! [`ImagePipeline::process`]: normalize the URL to a stable dedup key,
//! filter unsupported formats, skip already-uploaded assets, download and
//! validate, resize/re-encode, and upload to object storage. Successful
//! units append a [`PendingImage`] record for the bulk-commit stage.
//! This crate never writes database rows itself.

pub mod normalize;
pub mod pipeline;
pub mod store;

pub use normalize::{HostRules, extension_of, normalize_image_url};
pub use pipeline::{ImageOutcome, ImagePipeline, ImageStats, storage_key};
pub use store::{HttpBucketStore, MemoryStore, ObjectStore, StoreLogin};
