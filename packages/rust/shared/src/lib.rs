//! Shared foundation for docsink: errors, configuration, domain types,
//! progress tracking, and the cooperative cancellation flag.

pub mod cancel;
pub mod config;
pub mod error;
pub mod progress;
pub mod types;

pub use cancel::CancelFlag;
pub use config::{
    AppConfig, CrawlConfig, ImagesConfig, JobsConfig, ObjectStoreConfig, SiteConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from, validate_object_store,
};
pub use error::{DocsinkError, Result};
pub use progress::ProgressTracker;
pub use types::{
    CancelAction, CancelOutcome, CrawlSummary, JobRow, JobStatus, PageRecord, PendingImage,
};
