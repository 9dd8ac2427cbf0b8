//! Run orchestration: the crawl pipeline, the chunked bulk-commit stage,
//! and the job runner that executes queued work cooperatively.

pub mod commit;
pub mod pipeline;
pub mod runner;

pub use commit::CommitOutcome;
pub use pipeline::{RunRequest, run_crawl};
pub use runner::{CRAWL_JOB, CrawlJobArgs, Runner, queue_crawl, session_from_env};
